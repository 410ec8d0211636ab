//! Persistence for run snapshots, dismissal records, metrics, and templates.
//!
//! Snapshots are whole-value overwrites keyed by run id. `SqliteStore` keeps
//! them as JSON columns; `MemoryStore` keeps them in maps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use guide_core::templates::parse_templates_yaml;
use guide_core::{DismissedRunRecord, Id, RunSnapshot, WorkflowTemplate};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::metrics::RunMetrics;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("template catalog error: {0}")]
    Templates(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Run snapshots and dismissal context.
#[async_trait]
pub trait RunSnapshotStore: Send + Sync {
    async fn list_workflow_runs(&self) -> Result<Vec<RunSnapshot>>;
    async fn upsert_workflow_run(&self, snapshot: &RunSnapshot) -> Result<()>;
    async fn list_dismissed_runs(&self) -> Result<Vec<DismissedRunRecord>>;
    async fn upsert_dismissed_run(&self, record: &DismissedRunRecord) -> Result<()>;
}

/// The single aggregate metrics snapshot.
#[async_trait]
pub trait RunMetricsStore: Send + Sync {
    async fn load_metrics(&self) -> Result<Option<RunMetrics>>;
    async fn save_metrics(&self, metrics: &RunMetrics) -> Result<()>;
}

/// External template catalog.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    async fn list_workflow_templates(&self) -> Result<Vec<WorkflowTemplate>>;

    /// Whether the catalog was explicitly configured. An explicitly empty
    /// catalog hides the built-ins; an unconfigured one falls back to them.
    async fn is_configured(&self) -> bool {
        false
    }
}

/// SQLite-backed store.
#[derive(Debug)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the compiled-in schema. Safe to run on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove a run snapshot, leaving any dismissal record in place.
    pub async fn delete_workflow_run(&self, run_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM workflow_runs WHERE id = ?1")
            .bind(run_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RunSnapshotStore for SqliteStore {
    async fn list_workflow_runs(&self) -> Result<Vec<RunSnapshot>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT snapshot_json FROM workflow_runs ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(StorageError::from))
            .collect()
    }

    async fn upsert_workflow_run(&self, snapshot: &RunSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        sqlx::query(
            "INSERT INTO workflow_runs (id, snapshot_json, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET snapshot_json = excluded.snapshot_json, \
             updated_at = excluded.updated_at",
        )
        .bind(snapshot.run.id.as_ref())
        .bind(json)
        .bind(snapshot.run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dismissed_runs(&self) -> Result<Vec<DismissedRunRecord>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT record_json FROM dismissed_runs ORDER BY run_id ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(StorageError::from))
            .collect()
    }

    async fn upsert_dismissed_run(&self, record: &DismissedRunRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO dismissed_runs (run_id, record_json) VALUES (?1, ?2) \
             ON CONFLICT(run_id) DO UPDATE SET record_json = excluded.record_json",
        )
        .bind(record.run_id.as_ref())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunMetricsStore for SqliteStore {
    async fn load_metrics(&self) -> Result<Option<RunMetrics>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT snapshot_json FROM run_metrics WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    async fn save_metrics(&self, metrics: &RunMetrics) -> Result<()> {
        let json = serde_json::to_string(metrics)?;
        sqlx::query(
            "INSERT INTO run_metrics (id, snapshot_json) VALUES (1, ?1) \
             ON CONFLICT(id) DO UPDATE SET snapshot_json = excluded.snapshot_json",
        )
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-process store for tests and ephemeral daemons.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<Id, RunSnapshot>>,
    dismissed: Mutex<HashMap<Id, DismissedRunRecord>>,
    metrics: Mutex<Option<RunMetrics>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a run snapshot, as external pruning would.
    pub async fn remove_workflow_run(&self, run_id: &Id) {
        self.runs.lock().await.remove(run_id);
    }
}

#[async_trait]
impl RunSnapshotStore for MemoryStore {
    async fn list_workflow_runs(&self) -> Result<Vec<RunSnapshot>> {
        let mut runs: Vec<_> = self.runs.lock().await.values().cloned().collect();
        runs.sort_by(|a, b| a.run.id.cmp(&b.run.id));
        Ok(runs)
    }

    async fn upsert_workflow_run(&self, snapshot: &RunSnapshot) -> Result<()> {
        self.runs
            .lock()
            .await
            .insert(snapshot.run.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn list_dismissed_runs(&self) -> Result<Vec<DismissedRunRecord>> {
        let mut records: Vec<_> = self.dismissed.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(records)
    }

    async fn upsert_dismissed_run(&self, record: &DismissedRunRecord) -> Result<()> {
        self.dismissed
            .lock()
            .await
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl RunMetricsStore for MemoryStore {
    async fn load_metrics(&self) -> Result<Option<RunMetrics>> {
        Ok(self.metrics.lock().await.clone())
    }

    async fn save_metrics(&self, metrics: &RunMetrics) -> Result<()> {
        *self.metrics.lock().await = Some(metrics.clone());
        Ok(())
    }
}

/// Template catalog read from a YAML file. The file existing is what
/// makes the catalog explicitly configured.
#[derive(Debug, Clone)]
pub struct FileTemplateProvider {
    path: PathBuf,
}

impl FileTemplateProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TemplateProvider for FileTemplateProvider {
    async fn list_workflow_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        if !self.is_configured().await {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_templates_yaml(&content)?)
    }

    async fn is_configured(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }
}
