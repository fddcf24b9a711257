//! In-memory backend
//!
//! Holds per-project stage and derived record counts in a concurrent map and
//! pushes stage writes to subscribers. Latency, query failures and feed
//! disconnects can be injected, which makes it the backend of choice for
//! exercising the reconciler.

use super::traits::{
    ChangeFeed, ExistenceQuery, QueryError, QueryResult, StageUpdate, StatusQuery, Subscription,
    SubscriptionError,
};
use crate::project::{ProjectId, Stage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
struct ProjectRow {
    stage: u32,
    records: usize,
}

type Subscribers = DashMap<ProjectId, Vec<(u64, mpsc::UnboundedSender<StageUpdate>)>>;

/// Backend that keeps all state in process memory.
#[derive(Default)]
pub struct InMemoryBackend {
    projects: DashMap<ProjectId, ProjectRow>,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
    latency: Mutex<Duration>,
    failing: AtomicBool,
    reject_subscriptions: AtomicBool,
    status_calls: Mutex<Vec<Instant>>,
    existence_calls: Mutex<Vec<Instant>>,
    subscribe_calls: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a stage and push it to every subscriber of the project.
    ///
    /// Creates the project if it does not exist yet.
    pub fn set_stage(&self, project: &ProjectId, stage: u32) {
        self.projects.entry(project.clone()).or_default().stage = stage;
        self.publish_stage(project, stage);
    }

    /// Write a stage without notifying subscribers (a change the feed missed).
    pub fn set_stage_silently(&self, project: &ProjectId, stage: u32) {
        self.projects.entry(project.clone()).or_default().stage = stage;
    }

    /// Push a stage update to subscribers without touching stored state.
    ///
    /// Models duplicate or out-of-order delivery.
    pub fn publish_stage(&self, project: &ProjectId, stage: u32) {
        if let Some(mut subs) = self.subscribers.get_mut(project) {
            let update = StageUpdate {
                stage: Stage::new(stage),
            };
            subs.retain(|(_, tx)| tx.send(update).is_ok());
        }
    }

    pub fn add_derived_record(&self, project: &ProjectId) {
        self.projects.entry(project.clone()).or_default().records += 1;
    }

    pub fn clear_derived_records(&self, project: &ProjectId) {
        if let Some(mut row) = self.projects.get_mut(project) {
            row.records = 0;
        }
    }

    /// Delay applied to every query before it resolves.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Make every query fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every new subscription attempt fail.
    pub fn set_reject_subscriptions(&self, reject: bool) {
        self.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Close every open subscription for the project, as a dropped connection would.
    pub fn disconnect_subscribers(&self, project: &ProjectId) {
        self.subscribers.remove(project);
    }

    pub fn subscriber_count(&self, project: &ProjectId) -> usize {
        self.subscribers.get(project).map(|s| s.len()).unwrap_or(0)
    }

    /// Instants at which status queries started, in call order.
    pub fn status_query_times(&self) -> Vec<Instant> {
        self.status_calls.lock().unwrap().clone()
    }

    pub fn status_query_count(&self) -> usize {
        self.status_calls.lock().unwrap().len()
    }

    pub fn existence_query_count(&self) -> usize {
        self.existence_calls.lock().unwrap().len()
    }

    pub fn subscribe_count(&self) -> u64 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    async fn simulate_roundtrip(&self) -> QueryResult<()> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueryError::Backend("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusQuery for InMemoryBackend {
    async fn stage(&self, project: &ProjectId) -> QueryResult<Stage> {
        self.status_calls.lock().unwrap().push(Instant::now());
        self.simulate_roundtrip().await?;
        self.projects
            .get(project)
            .map(|row| Stage::new(row.stage))
            .ok_or_else(|| QueryError::ProjectNotFound(project.clone()))
    }
}

#[async_trait]
impl ExistenceQuery for InMemoryBackend {
    async fn has_derived_records(&self, project: &ProjectId) -> QueryResult<bool> {
        self.existence_calls.lock().unwrap().push(Instant::now());
        self.simulate_roundtrip().await?;
        Ok(self.projects.get(project).map(|row| row.records > 0).unwrap_or(false))
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, project: &ProjectId) -> Result<Subscription, SubscriptionError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Rejected("injected rejection".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(project.clone())
            .or_default()
            .push((id, tx));

        let subscribers = self.subscribers.clone();
        let key = project.clone();
        Ok(Subscription::new(project.clone(), rx, move || {
            if let Some(mut subs) = subscribers.get_mut(&key) {
                subs.retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }
}
