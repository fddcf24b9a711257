//! One live reconciliation for one project
//!
//! Every trigger source (activation, the re-check schedule, change feed
//! events, manual rechecks) funnels into `Session::tick`. The tick queries
//! both signals concurrently, then decides under the session lock, so
//! concurrent ticks can never publish `Ready` twice and a torn-down session
//! can never publish at all.
//!
//! Handlers run after the state lock is released but while `publish` is
//! held. Lock order is `publish` then `state`; teardown takes both, so it
//! waits for an in-progress emit and nothing is emitted after it returns.

use super::events::{Listeners, PhaseChange, TerminalSignal, TickOutcome, TickTrigger};
use crate::backend::{Collaborators, QueryError, QueryResult};
use crate::clock::ClockSource;
use crate::config::ReconcilerConfig;
use crate::project::{Observation, Phase, ProjectId, SessionId};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    last_observation: Option<Observation>,
    /// Sequence number of the newest tick whose result was applied
    applied_tick: u64,
    torn_down: bool,
    terminal_armed: bool,
    terminal_fired: bool,
}

pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) project: ProjectId,
    pub(crate) collaborators: Collaborators,
    pub(crate) config: Arc<ReconcilerConfig>,
    pub(crate) clock: Arc<dyn ClockSource>,
    listeners: Arc<Listeners>,
    /// Serializes deciding and emitting against teardown
    publish: Mutex<()>,
    /// Cancelled on teardown only
    teardown: CancellationToken,
    /// Cancelled on teardown or once `Ready` is published
    settled: CancellationToken,
    next_tick: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(
        project: ProjectId,
        collaborators: Collaborators,
        config: Arc<ReconcilerConfig>,
        clock: Arc<dyn ClockSource>,
        listeners: Arc<Listeners>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            project,
            collaborators,
            config,
            clock,
            listeners,
            publish: Mutex::new(()),
            teardown: CancellationToken::new(),
            settled: CancellationToken::new(),
            next_tick: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                phase: Phase::Verifying,
                last_observation: None,
                applied_tick: 0,
                torn_down: false,
                terminal_armed: false,
                terminal_fired: false,
            }),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    pub(crate) fn last_observation(&self) -> Option<Observation> {
        self.state.lock().unwrap().last_observation
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.state.lock().unwrap().torn_down
    }

    /// Resolves once the session is `Ready` or torn down.
    pub(crate) async fn settled(&self) {
        self.settled.cancelled().await
    }

    /// Resolves once the session is torn down.
    pub(crate) async fn torn_down(&self) {
        self.teardown.cancelled().await
    }

    /// Publish the initial `Verifying` phase.
    pub(crate) fn announce(&self) {
        let _publish = self.publish.lock().unwrap();
        let change = {
            let state = self.state.lock().unwrap();
            if state.torn_down {
                return;
            }
            PhaseChange {
                session: self.id,
                project: self.project.clone(),
                previous: None,
                phase: state.phase,
                observation: None,
                at: Utc::now(),
            }
        };
        info!(project = %self.project, session = %self.id, "Reconciliation session started");
        self.listeners.emit_phase(&change);
    }

    /// Mark the session torn down. Idempotent.
    ///
    /// Waits for any handler currently running for this session, so once
    /// this returns no tick or terminal timer of this session can publish
    /// anything.
    pub(crate) fn tear_down(&self) {
        let _publish = self.publish.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        self.teardown.cancel();
        self.settled.cancel();
        info!(
            project = %self.project,
            session = %self.id,
            phase = %state.phase,
            terminal_fired = state.terminal_fired,
            "Reconciliation session torn down"
        );
    }

    /// Run one evaluation cycle.
    pub(crate) async fn tick(self: &Arc<Self>, trigger: TickTrigger) -> TickOutcome {
        {
            let state = self.state.lock().unwrap();
            if state.torn_down {
                return TickOutcome::Discarded;
            }
            if state.phase == Phase::Ready {
                return TickOutcome::AlreadyReady;
            }
        }

        let seq = self.next_tick.fetch_add(1, Ordering::SeqCst);
        debug!(project = %self.project, session = %self.id, %trigger, tick = seq, "Tick started");

        let (stage, has_records) = tokio::join!(
            self.bounded("status", self.collaborators.status.stage(&self.project)),
            self.bounded(
                "existence",
                self.collaborators.existence.has_derived_records(&self.project)
            ),
        );
        let observation = Observation::new(stage, has_records);

        let _publish = self.publish.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        if state.torn_down {
            debug!(project = %self.project, session = %self.id, tick = seq, "Tick result discarded after teardown");
            return TickOutcome::Discarded;
        }
        if state.phase == Phase::Ready {
            return TickOutcome::AlreadyReady;
        }
        if seq < state.applied_tick {
            debug!(
                project = %self.project,
                session = %self.id,
                tick = seq,
                applied = state.applied_tick,
                "Tick result superseded by a newer observation"
            );
            return TickOutcome::Superseded;
        }
        state.applied_tick = seq;
        state.last_observation = Some(observation);

        debug!(
            project = %self.project,
            session = %self.id,
            %trigger,
            tick = seq,
            stage = ?observation.stage.map(|s| s.value()),
            has_records = ?observation.has_records,
            "Tick observed"
        );

        let (outcome, change) = if observation.is_ready_at(self.config.terminal_stage) {
            let change = self.transition(&mut state, Phase::Ready, observation);
            self.settled.cancel();
            self.arm_terminal(&mut state);
            (TickOutcome::Ready, Some(change))
        } else if state.phase != Phase::Processing {
            let change = self.transition(&mut state, Phase::Processing, observation);
            (TickOutcome::Processing, Some(change))
        } else {
            (TickOutcome::Processing, None)
        };
        drop(state);

        if let Some(change) = change {
            self.listeners.emit_phase(&change);
        }
        outcome
    }

    /// Await a query with the configured timeout, absorbing any error.
    async fn bounded<T>(&self, query: &'static str, fut: impl Future<Output = QueryResult<T>>) -> Option<T> {
        let timeout = self.config.query_timeout();
        let result = tokio::select! {
            result = fut => result,
            _ = self.clock.sleep(timeout) => Err(QueryError::Timeout(timeout)),
        };
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    project = %self.project,
                    session = %self.id,
                    query,
                    error = %err,
                    "Query failed; treating tick as not ready"
                );
                None
            }
        }
    }

    /// Apply a phase change and return the event to emit once the state lock
    /// is released.
    fn transition(&self, state: &mut SessionState, phase: Phase, observation: Observation) -> PhaseChange {
        let previous = state.phase;
        state.phase = phase;
        info!(
            project = %self.project,
            session = %self.id,
            from = %previous,
            to = %phase,
            "Phase changed"
        );
        PhaseChange {
            session: self.id,
            project: self.project.clone(),
            previous: Some(previous),
            phase,
            observation: Some(observation),
            at: Utc::now(),
        }
    }

    /// Start the terminal delay. Only the first call per session has an effect.
    fn arm_terminal(self: &Arc<Self>, state: &mut SessionState) {
        if state.terminal_armed {
            return;
        }
        state.terminal_armed = true;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let delay = session.config.terminal_delay();
            tokio::select! {
                _ = session.torn_down() => {
                    debug!(project = %session.project, session = %session.id, "Terminal action cancelled by teardown");
                    return;
                }
                _ = session.clock.sleep(delay) => {}
            }
            session.fire_terminal();
        });
    }

    fn fire_terminal(&self) {
        let _publish = self.publish.lock().unwrap();
        {
            let mut state = self.state.lock().unwrap();
            if state.torn_down || state.terminal_fired {
                return;
            }
            state.terminal_fired = true;
        }
        info!(project = %self.project, session = %self.id, "Terminal signal");
        self.listeners.emit_terminal(&TerminalSignal {
            session: self.id,
            project: self.project.clone(),
            at: Utc::now(),
        });
    }

    /// The fixed-cadence loop: tick, then wait a full re-check interval from
    /// the end of that tick. Ticks of this loop never overlap each other.
    pub(crate) async fn run_schedule(self: Arc<Self>) {
        let mut trigger = TickTrigger::Activation;
        loop {
            if self.tick(trigger).await.is_final() {
                break;
            }
            // A `Ready` published meanwhile by a feed tick is picked up by the
            // next tick, which returns without querying.
            tokio::select! {
                _ = self.torn_down() => break,
                _ = self.clock.sleep(self.config.recheck_interval()) => {}
            }
            trigger = TickTrigger::Scheduled;
        }
        debug!(project = %self.project, session = %self.id, "Re-check schedule stopped");
    }
}
