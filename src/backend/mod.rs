//! Backend collaborators
//!
//! The reconciler consumes a backend through three traits (`StatusQuery`,
//! `ExistenceQuery`, `ChangeFeed`). Two implementations ship with the crate:
//! `InMemoryBackend` for tests and demos, and `SqliteBackend` for a local
//! database that a pipeline process writes into.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryBackend;
pub use sqlite::{BackendError, BackendResult, ProjectSummary, SqliteBackend, DEFAULT_FEED_POLL_INTERVAL};
pub use traits::{
    ChangeFeed, Collaborators, ExistenceQuery, QueryError, QueryResult, StageUpdate, StatusQuery,
    Subscription, SubscriptionError,
};
