//! The controller a host UI talks to
//!
//! Owns at most one session at a time. `activate` and `deactivate` are the
//! only operations that change which session is live, and they are
//! serialized by the lifecycle lock: the outgoing session is torn down
//! before the incoming one is installed, so two sessions are never
//! considered active at once. The `active` slot itself is only locked for
//! reads and swaps, never while a session emits, so handlers may call the
//! read accessors.

use super::events::{Listeners, PhaseChange, TerminalSignal, TickOutcome, TickTrigger};
use super::feed::run_feed_listener;
use super::session::Session;
use crate::backend::Collaborators;
use crate::clock::{ClockSource, TokioClock};
use crate::config::ReconcilerConfig;
use crate::project::{Observation, Phase, ProjectId, SessionId};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no tokio runtime available to run the reconciler")]
    NoRuntime,
}

/// Snapshot of the live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session: SessionId,
    pub project: ProjectId,
    pub phase: Phase,
    pub last_observation: Option<Observation>,
}

/// Reconciles the readiness of the selected project.
///
/// Handlers registered with `on_phase_change` and `on_terminal` run
/// synchronously on the reconciler's tasks, one at a time per session. They
/// may call `current` and `snapshot`. They must not call `activate` or
/// `deactivate` directly; spawn a task or send on a channel instead.
pub struct ReconciliationController {
    collaborators: Collaborators,
    config: Arc<ReconcilerConfig>,
    clock: Arc<dyn ClockSource>,
    listeners: Arc<Listeners>,
    lifecycle: Mutex<()>,
    active: Mutex<Option<Arc<Session>>>,
}

impl ReconciliationController {
    pub fn new(collaborators: Collaborators, config: ReconcilerConfig) -> Self {
        Self {
            collaborators,
            config: Arc::new(config),
            clock: Arc::new(TokioClock),
            listeners: Arc::new(Listeners::default()),
            lifecycle: Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    /// Replace the clock used for every delay the reconciler takes.
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn on_phase_change(&self, handler: impl Fn(&PhaseChange) + Send + Sync + 'static) {
        self.listeners.add_phase(Arc::new(handler));
    }

    pub fn on_terminal(&self, handler: impl Fn(&TerminalSignal) + Send + Sync + 'static) {
        self.listeners.add_terminal(Arc::new(handler));
    }

    /// Start reconciling `project`.
    ///
    /// A live session for a different project is torn down first. Activating
    /// the project that is already live keeps the existing session.
    pub fn activate(&self, project: impl Into<ProjectId>) -> Result<SessionId, ReconcileError> {
        let project = project.into();
        let runtime = Handle::try_current().map_err(|_| ReconcileError::NoRuntime)?;

        let _lifecycle = self.lifecycle.lock().unwrap();
        let previous = {
            let mut active = self.active.lock().unwrap();
            if let Some(current) = active.as_ref() {
                if current.project == project && !current.is_torn_down() {
                    return Ok(current.id);
                }
            }
            active.take()
        };
        if let Some(previous) = previous {
            previous.tear_down();
        }

        let session = Arc::new(Session::new(
            project,
            self.collaborators.clone(),
            self.config.clone(),
            self.clock.clone(),
            self.listeners.clone(),
        ));
        *self.active.lock().unwrap() = Some(session.clone());

        session.announce();
        runtime.spawn(session.clone().run_schedule());
        runtime.spawn(run_feed_listener(session.clone()));
        Ok(session.id)
    }

    /// Tear down the live session, if any.
    ///
    /// Returns true if a session was live. After this returns, no handler
    /// fires for that session again.
    pub fn deactivate(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap();
        let previous = self.active.lock().unwrap().take();
        match previous {
            Some(session) => {
                session.tear_down();
                info!(project = %session.project, session = %session.id, "Deactivated");
                true
            }
            None => false,
        }
    }

    /// Project and phase of the live session.
    pub fn current(&self) -> Option<(ProjectId, Phase)> {
        let session = self.active.lock().unwrap().clone()?;
        Some((session.project.clone(), session.phase()))
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let session = self.active.lock().unwrap().clone()?;
        Some(SessionSnapshot {
            session: session.id,
            project: session.project.clone(),
            phase: session.phase(),
            last_observation: session.last_observation(),
        })
    }

    /// Run one extra tick on the live session now.
    pub async fn recheck(&self) -> Option<TickOutcome> {
        let session = self.active.lock().unwrap().clone()?;
        Some(session.tick(TickTrigger::Manual).await)
    }
}

impl Drop for ReconciliationController {
    fn drop(&mut self) {
        self.deactivate();
    }
}
