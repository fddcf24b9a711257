//! Stage ordinal, per-tick observations, and the readiness phase
//!
//! The readiness predicate lives here so that every trigger source
//! (scheduled re-check, change feed event, explicit recheck) evaluates
//! exactly the same rule.

use serde::{Deserialize, Serialize};

/// Stage at or above which the backend pipeline has produced its final state.
pub const TERMINAL_STAGE: u32 = 6;

/// Delay between the end of one scheduled tick and the start of the next.
pub const RECHECK_INTERVAL_MS: u64 = 3000;

/// Delay between the first `Ready` publication and the terminal signal.
pub const TERMINAL_DELAY_MS: u64 = 2000;

/// Ordinal progress of the backend pipeline for a project.
///
/// Not monotonic from the reconciler's point of view: a stale read can
/// appear to regress, so observations are never compared with each other.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stage(u32);

impl Stage {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Convert a raw backend integer, rejecting values that are not ordinals.
    pub fn from_raw(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    /// True if this stage is at or beyond `terminal_stage`.
    pub fn is_terminal(&self, terminal_stage: u32) -> bool {
        self.0 >= terminal_stage
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Stage {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Readiness of a fully known observation at the default terminal stage.
pub fn is_ready(stage: Stage, has_records: bool) -> bool {
    Observation::new(Some(stage), Some(has_records)).is_ready_at(TERMINAL_STAGE)
}

/// Both signals as observed by one tick.
///
/// `None` means the corresponding query failed this tick and the value is
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub stage: Option<Stage>,
    pub has_records: Option<bool>,
}

impl Observation {
    pub fn new(stage: Option<Stage>, has_records: Option<bool>) -> Self {
        Self { stage, has_records }
    }

    /// The readiness predicate.
    ///
    /// Ready only once the pipeline has reached `terminal_stage` *and* at
    /// least one derived record is present. Records may lag the stage write,
    /// and records seen before the terminal stage may be stale leftovers.
    /// An unknown value on either side is not ready.
    pub fn is_ready_at(&self, terminal_stage: u32) -> bool {
        match (self.stage, self.has_records) {
            (Some(stage), Some(has_records)) => stage.is_terminal(terminal_stage) && has_records,
            _ => false,
        }
    }

    /// True if both queries succeeded.
    pub fn is_complete(&self) -> bool {
        self.stage.is_some() && self.has_records.is_some()
    }
}

/// Reconciliation phase for the active project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No observation has completed since activation
    Verifying,
    /// The latest observation is not ready
    Processing,
    /// Terminal for the session
    Ready,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verifying => "verifying",
            Self::Processing => "processing",
            Self::Ready => "ready",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
