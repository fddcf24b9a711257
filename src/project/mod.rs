//! Project identity, pipeline stage, and readiness phase

mod id;
mod phase;

pub use id::{ProjectId, SessionId};
pub use phase::{
    is_ready, Observation, Phase, Stage, RECHECK_INTERVAL_MS, TERMINAL_DELAY_MS, TERMINAL_STAGE,
};
