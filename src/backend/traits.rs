//! Collaborator traits: the contract a backend implements
//!
//! The reconciler consumes three independent capabilities of the backend:
//! a point query for the stage, an existence query for derived records, and
//! a push feed of stage updates. A backend may implement all three on one
//! type; the reconciler only ever sees them through `Collaborators`.

use crate::project::{ProjectId, Stage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from a point-in-time query.
///
/// Every variant means "unknown this tick" to the reconciler.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("invalid stage value: {0}")]
    InvalidStage(i64),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the change feed.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("subscription closed by backend")]
    Closed,
}

/// Result type for point queries
pub type QueryResult<T> = Result<T, QueryError>;

/// A stage update pushed by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageUpdate {
    pub stage: Stage,
}

/// Point-in-time fetch of a project's current stage.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    async fn stage(&self, project: &ProjectId) -> QueryResult<Stage>;
}

/// Point-in-time fetch of whether any derived record exists for a project.
#[async_trait]
pub trait ExistenceQuery: Send + Sync {
    async fn has_derived_records(&self, project: &ProjectId) -> QueryResult<bool>;
}

/// Push subscription to stage updates for one project.
///
/// Delivery is best effort and at most once per change, with no replay.
/// Consumers must treat each update as a hint to re-query.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, project: &ProjectId) -> Result<Subscription, SubscriptionError>;
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live change feed subscription.
///
/// Owns the unsubscribe action, which runs exactly once: on
/// `unsubscribe()` or when the subscription is dropped.
pub struct Subscription {
    project: ProjectId,
    updates: mpsc::UnboundedReceiver<StageUpdate>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn new(
        project: ProjectId,
        updates: mpsc::UnboundedReceiver<StageUpdate>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            project,
            updates,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Wait for the next update.
    ///
    /// Returns `None` once the backend has closed the feed.
    pub async fn next(&mut self) -> Option<StageUpdate> {
        self.updates.recv().await
    }

    /// Unsubscribe now instead of on drop.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("project", &self.project)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// The three collaborators the reconciler queries.
#[derive(Clone)]
pub struct Collaborators {
    pub status: Arc<dyn StatusQuery>,
    pub existence: Arc<dyn ExistenceQuery>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Collaborators {
    pub fn new(
        status: Arc<dyn StatusQuery>,
        existence: Arc<dyn ExistenceQuery>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            status,
            existence,
            feed,
        }
    }

    /// Use one backend for all three capabilities.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: StatusQuery + ExistenceQuery + ChangeFeed + 'static,
    {
        Self {
            status: backend.clone(),
            existence: backend.clone(),
            feed: backend,
        }
    }
}
