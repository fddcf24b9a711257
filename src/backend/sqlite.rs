//! SQLite-backed backend
//!
//! Keeps projects and their derived records in a single SQLite database and
//! implements all three collaborator traits on top of it. Thread-safe via an
//! internal mutex on the connection.
//!
//! The change feed has two sources: stage writes made through this handle are
//! pushed immediately, and writes committed by any other connection are
//! detected by polling `PRAGMA data_version`.

use super::traits::{
    ChangeFeed, ExistenceQuery, QueryError, QueryResult, StageUpdate, StatusQuery, Subscription,
    SubscriptionError,
};
use crate::project::{ProjectId, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default interval at which subscriptions look for foreign writes.
pub const DEFAULT_FEED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from write and admin operations on the SQLite backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("Project already exists: {0}")]
    ProjectExists(ProjectId),

    #[error("Date parsing error: {0}")]
    DateParse(String),
}

/// Result type for backend write operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A project row together with its derived record count
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: Option<String>,
    /// `None` if the stored value is not a valid stage
    pub stage: Option<Stage>,
    pub record_count: usize,
    pub updated_at: DateTime<Utc>,
}

type Subscribers = DashMap<ProjectId, Vec<(u64, mpsc::UnboundedSender<StageUpdate>)>>;

/// SQLite-backed project store
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    subscribers: Arc<Subscribers>,
    next_subscriber: AtomicU64,
    feed_poll_interval: Duration,
}

impl SqliteBackend {
    fn init_schema(conn: &Connection) -> BackendResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT,
                stage INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS derived_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_derived_records_project
                ON derived_records(project_id);

            PRAGMA foreign_keys = ON;

            -- Readers in other processes keep working while the pipeline writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> BackendResult<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(0),
            feed_poll_interval: DEFAULT_FEED_POLL_INTERVAL,
        })
    }

    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory database (useful for testing)
    pub fn open_in_memory() -> BackendResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Set how often subscriptions poll for writes from other connections.
    pub fn with_feed_poll_interval(mut self, interval: Duration) -> Self {
        self.feed_poll_interval = interval;
        self
    }

    // === Writes ===

    pub fn create_project(&self, id: &ProjectId, name: Option<&str>) -> BackendResult<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO projects (id, name, stage, updated_at) VALUES (?1, ?2, 0, ?3)",
            params![id.as_str(), name, Utc::now().to_rfc3339()],
        )?;
        if inserted == 0 {
            return Err(BackendError::ProjectExists(id.clone()));
        }
        Ok(())
    }

    /// Write a new stage and push it to local subscribers.
    pub fn set_stage(&self, id: &ProjectId, stage: Stage) -> BackendResult<()> {
        let updated = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE projects SET stage = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), i64::from(stage.value()), Utc::now().to_rfc3339()],
            )?
        };
        if updated == 0 {
            return Err(BackendError::ProjectNotFound(id.clone()));
        }

        if let Some(mut subs) = self.subscribers.get_mut(id) {
            subs.retain(|(_, tx)| tx.send(StageUpdate { stage }).is_ok());
        }
        Ok(())
    }

    /// Insert a derived record, returning its row id.
    pub fn add_derived_record(
        &self,
        id: &ProjectId,
        kind: &str,
        body: Option<&str>,
    ) -> BackendResult<i64> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(BackendError::ProjectNotFound(id.clone()));
        }
        conn.execute(
            "INSERT INTO derived_records (project_id, kind, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), kind, body, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_projects(&self) -> BackendResult<Vec<ProjectSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, p.stage, p.updated_at,
                    (SELECT COUNT(*) FROM derived_records r WHERE r.project_id = p.id)
             FROM projects p ORDER BY p.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut projects = Vec::new();
        for row in rows {
            let (id, name, stage, updated_at, count) = row?;
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| BackendError::DateParse(e.to_string()))?
                .with_timezone(&Utc);
            projects.push(ProjectSummary {
                id: ProjectId::new(id),
                name,
                stage: Stage::from_raw(stage),
                record_count: usize::try_from(count).unwrap_or(0),
                updated_at,
            });
        }
        Ok(projects)
    }

    // === Reads shared by the queries and the feed watcher ===

    fn read_stage(conn: &Connection, id: &ProjectId) -> rusqlite::Result<Option<i64>> {
        conn.query_row(
            "SELECT stage FROM projects WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()
    }

    fn data_version(conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row("PRAGMA data_version", [], |row| row.get(0))
    }
}

fn query_failed(err: rusqlite::Error) -> QueryError {
    QueryError::Backend(err.to_string())
}

#[async_trait]
impl StatusQuery for SqliteBackend {
    async fn stage(&self, project: &ProjectId) -> QueryResult<Stage> {
        let conn = self.conn.lock().unwrap();
        match Self::read_stage(&conn, project).map_err(query_failed)? {
            Some(raw) => Stage::from_raw(raw).ok_or(QueryError::InvalidStage(raw)),
            None => Err(QueryError::ProjectNotFound(project.clone())),
        }
    }
}

#[async_trait]
impl ExistenceQuery for SqliteBackend {
    async fn has_derived_records(&self, project: &ProjectId) -> QueryResult<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM derived_records WHERE project_id = ?1 LIMIT 1)",
            params![project.as_str()],
            |row| row.get(0),
        )
        .map_err(query_failed)?;
        Ok(exists)
    }
}

#[async_trait]
impl ChangeFeed for SqliteBackend {
    async fn subscribe(&self, project: &ProjectId) -> Result<Subscription, SubscriptionError> {
        let (baseline_version, baseline_stage) = {
            let conn = self.conn.lock().unwrap();
            let version = Self::data_version(&conn)
                .map_err(|e| SubscriptionError::Rejected(e.to_string()))?;
            let stage = Self::read_stage(&conn, project).unwrap_or(None);
            (version, stage)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(project.clone())
            .or_default()
            .push((id, tx.clone()));

        let stop = CancellationToken::new();
        tokio::spawn(watch_foreign_writes(
            self.conn.clone(),
            project.clone(),
            tx,
            stop.clone(),
            self.feed_poll_interval,
            baseline_version,
            baseline_stage,
        ));

        let subscribers = self.subscribers.clone();
        let key = project.clone();
        Ok(Subscription::new(project.clone(), rx, move || {
            stop.cancel();
            if let Some(mut subs) = subscribers.get_mut(&key) {
                subs.retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }
}

/// Poll `PRAGMA data_version` and push stage changes committed elsewhere.
async fn watch_foreign_writes(
    conn: Arc<Mutex<Connection>>,
    project: ProjectId,
    tx: mpsc::UnboundedSender<StageUpdate>,
    stop: CancellationToken,
    interval: Duration,
    mut last_version: i64,
    mut last_stage: Option<i64>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if tx.is_closed() {
            break;
        }

        let polled = {
            let conn = conn.lock().unwrap();
            SqliteBackend::data_version(&conn).and_then(|version| {
                if version == last_version {
                    return Ok((version, None));
                }
                let stage = SqliteBackend::read_stage(&conn, &project).unwrap_or(None);
                Ok((version, Some(stage)))
            })
        };

        match polled {
            Ok((version, Some(stage))) => {
                last_version = version;
                if stage == last_stage {
                    continue;
                }
                last_stage = stage;
                if let Some(stage) = stage.and_then(Stage::from_raw) {
                    debug!(project = %project, stage = %stage, "Foreign stage write detected");
                    if tx.send(StageUpdate { stage }).is_err() {
                        break;
                    }
                }
            }
            Ok((_, None)) => {}
            Err(err) => {
                warn!(project = %project, error = %err, "Feed watcher failed to poll database");
                break;
            }
        }
    }
}
