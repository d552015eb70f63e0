//! Append-only eval run history.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::EvalRun;
use crate::error::StoreError;

/// Where finished runs are recorded. Runs are never updated or deleted.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Record a finished run. A second run with the same id is rejected.
    async fn append(&self, run: &EvalRun) -> Result<(), StoreError>;

    /// Most recently appended run of `dataset`.
    async fn latest(&self, dataset: &str) -> Result<Option<EvalRun>, StoreError>;

    /// Up to `limit` runs of `dataset`, newest first.
    async fn list(&self, dataset: &str, limit: usize) -> Result<Vec<EvalRun>, StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS eval_runs (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL UNIQUE,
    dataset     TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    pass_rate   REAL NOT NULL,
    hit_at_k    REAL NOT NULL,
    mrr         REAL NOT NULL,
    body        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS eval_runs_dataset ON eval_runs (dataset, seq);
";

/// SQLite-backed store. Each call opens its own connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    path: PathBuf,
}

impl SqliteRunStore {
    /// Open (or create) the database and its schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Task {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let store = Self { path };
        store
            .with_connection(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task {
            message: e.to_string(),
        })?
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn append(&self, run: &EvalRun) -> Result<(), StoreError> {
        let body = serde_json::to_string(run)?;
        let run_id = run.run_id.to_string();
        let dataset = run.dataset.clone();
        let started_at = run.started_at.to_rfc3339();
        let finished_at = run.finished_at.to_rfc3339();
        let metrics = run.metrics.clone();

        self.with_connection(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO eval_runs
                    (run_id, dataset, started_at, finished_at, pass_rate, hit_at_k, mrr, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id,
                    dataset,
                    started_at,
                    finished_at,
                    metrics.pass_rate,
                    metrics.hit_at_k,
                    metrics.mrr,
                    body
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists { run_id }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn latest(&self, dataset: &str) -> Result<Option<EvalRun>, StoreError> {
        let dataset = dataset.to_string();
        self.with_connection(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM eval_runs WHERE dataset = ?1 ORDER BY seq DESC LIMIT 1",
                    params![dataset],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn list(&self, dataset: &str, limit: usize) -> Result<Vec<EvalRun>, StoreError> {
        let dataset = dataset.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM eval_runs WHERE dataset = ?1 ORDER BY seq DESC LIMIT ?2",
            )?;
            let bodies = stmt
                .query_map(params![dataset, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store for tests and one-off runs.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<Vec<EvalRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn append(&self, run: &EvalRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(StoreError::AlreadyExists {
                run_id: run.run_id.to_string(),
            });
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn latest(&self, dataset: &str) -> Result<Option<EvalRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.dataset == dataset)
            .cloned())
    }

    async fn list(&self, dataset: &str, limit: usize) -> Result<Vec<EvalRun>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.dataset == dataset)
            .take(limit)
            .cloned()
            .collect())
    }
}
