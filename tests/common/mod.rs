//! Common helpers for the reconciler integration tests
//!
//! Records every phase change and terminal signal a controller emits,
//! stamped with the (possibly paused) tokio clock.

#![allow(dead_code)]

use stagegate::{Phase, PhaseChange, ProjectId, ReconciliationController, TerminalSignal};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

pub fn pid(id: &str) -> ProjectId {
    ProjectId::from(id)
}

#[derive(Clone, Default)]
pub struct EventLog {
    changes: Arc<Mutex<Vec<(Instant, PhaseChange)>>>,
    terminals: Arc<Mutex<Vec<(Instant, TerminalSignal)>>>,
}

impl EventLog {
    pub fn attach(controller: &ReconciliationController) -> Self {
        let log = Self::default();
        let changes = log.changes.clone();
        controller.on_phase_change(move |change| {
            changes.lock().unwrap().push((Instant::now(), change.clone()));
        });
        let terminals = log.terminals.clone();
        controller.on_terminal(move |signal| {
            terminals.lock().unwrap().push((Instant::now(), signal.clone()));
        });
        log
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.changes.lock().unwrap().iter().map(|(_, c)| c.phase).collect()
    }

    pub fn changes(&self) -> Vec<PhaseChange> {
        self.changes.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    /// When `phase` was first published, relative to `start`.
    pub fn published_at(&self, phase: Phase, start: Instant) -> Option<Duration> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| c.phase == phase)
            .map(|(t, _)| t.saturating_duration_since(start))
    }

    pub fn terminal_offsets(&self, start: Instant) -> Vec<Duration> {
        self.terminals
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.saturating_duration_since(start))
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.lock().unwrap().len()
    }
}
