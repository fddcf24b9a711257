//! Stagegate: readiness reconciliation for asynchronously processed projects
//!
//! A backend pipeline processes a project asynchronously and records its
//! progress as an ordinal stage plus a set of derived records. Stagegate
//! decides, at any moment, whether the project is still processing or ready,
//! despite an eventually consistent backend observed through two unsynchronized
//! channels (point queries and a push feed).
//!
//! # Core Concepts
//!
//! - **Stage**: ordinal pipeline progress; terminal at 6
//! - **Derived records**: pipeline output whose presence confirms completion
//! - **Session**: one live reconciliation for the selected project
//! - **Tick**: query both signals concurrently, decide, publish
//!
//! # Example
//!
//! ```no_run
//! use stagegate::{Collaborators, InMemoryBackend, ReconcilerConfig, ReconciliationController};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), stagegate::ReconcileError> {
//! let backend = Arc::new(InMemoryBackend::new());
//! let controller = ReconciliationController::new(
//!     Collaborators::from_backend(backend),
//!     ReconcilerConfig::default(),
//! );
//! controller.on_phase_change(|change| println!("{} -> {}", change.project, change.phase));
//! controller.on_terminal(|signal| println!("{} is ready, refresh the view", signal.project));
//! controller.activate("channel-42")?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
mod project;
pub mod reconcile;

pub use backend::{
    BackendError, ChangeFeed, Collaborators, ExistenceQuery, InMemoryBackend, QueryError,
    SqliteBackend, StageUpdate, StatusQuery, Subscription, SubscriptionError,
};
pub use clock::{ClockSource, TokioClock};
pub use config::{ConfigError, FeedConfig, ReconcilerConfig};
pub use project::{
    is_ready, Observation, Phase, ProjectId, SessionId, Stage, RECHECK_INTERVAL_MS,
    TERMINAL_DELAY_MS, TERMINAL_STAGE,
};
pub use reconcile::{
    PhaseChange, ReconcileError, ReconciliationController, SessionSnapshot, TerminalSignal,
    TickOutcome, TickTrigger,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
