//! Events published by the reconciler and the handlers that receive them

use crate::project::{Observation, Phase, ProjectId, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Fired whenever the active session's phase changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseChange {
    pub session: SessionId,
    pub project: ProjectId,
    /// `None` for the `Verifying` announcement of a new session
    pub previous: Option<Phase>,
    pub phase: Phase,
    /// The tick observation that caused the change, if any
    pub observation: Option<Observation>,
    pub at: DateTime<Utc>,
}

/// Fired once per session, a terminal delay after `Ready`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalSignal {
    pub session: SessionId,
    pub project: ProjectId,
    pub at: DateTime<Utc>,
}

/// What caused a tick to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTrigger {
    Activation,
    Scheduled,
    ChangeFeed,
    Manual,
}

impl TickTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activation => "activation",
            Self::Scheduled => "scheduled",
            Self::ChangeFeed => "change_feed",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TickTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Observed not ready; the session is (still) `Processing`
    Processing,
    /// This tick published `Ready`
    Ready,
    /// The session was already `Ready`; nothing was queried or published
    AlreadyReady,
    /// A tick that started later had already applied its result
    Superseded,
    /// The session was torn down; the result was dropped
    Discarded,
}

impl TickOutcome {
    /// True if the session will never tick again.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Ready | Self::AlreadyReady | Self::Discarded)
    }
}

type PhaseHandler = Arc<dyn Fn(&PhaseChange) + Send + Sync>;
type TerminalHandler = Arc<dyn Fn(&TerminalSignal) + Send + Sync>;

/// Registered handlers, shared between the controller and its sessions.
#[derive(Default)]
pub(crate) struct Listeners {
    phase: RwLock<Vec<PhaseHandler>>,
    terminal: RwLock<Vec<TerminalHandler>>,
}

impl Listeners {
    pub(crate) fn add_phase(&self, handler: PhaseHandler) {
        self.phase.write().unwrap().push(handler);
    }

    pub(crate) fn add_terminal(&self, handler: TerminalHandler) {
        self.terminal.write().unwrap().push(handler);
    }

    pub(crate) fn emit_phase(&self, change: &PhaseChange) {
        let handlers = self.phase.read().unwrap().clone();
        for handler in handlers {
            handler(change);
        }
    }

    pub(crate) fn emit_terminal(&self, signal: &TerminalSignal) {
        let handlers = self.terminal.read().unwrap().clone();
        for handler in handlers {
            handler(signal);
        }
    }
}
