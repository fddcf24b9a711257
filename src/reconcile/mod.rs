//! Readiness reconciliation
//!
//! Converts two asynchronous and occasionally stale signals (the pipeline
//! stage and whether derived records exist) into a single `Phase` for the
//! selected project. A fixed-cadence re-check schedule and the change feed
//! are two trigger sources for the same idempotent tick; there is no second
//! decision path.

mod controller;
mod events;
mod feed;
mod session;

pub use controller::{ReconcileError, ReconciliationController, SessionSnapshot};
pub use events::{PhaseChange, TerminalSignal, TickOutcome, TickTrigger};
