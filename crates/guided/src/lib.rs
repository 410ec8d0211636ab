//! guided - guided workflow daemon
//!
//! Library components for the daemon process: the run engine, checkpoint
//! gating, step dispatch with deferred retries, turn matching, built-in step
//! execution, persistence, and the HTTP control plane.

pub mod checkpoint;
pub mod dispatch;
pub mod engine;
pub mod execution;
pub mod metrics;
pub mod server;
pub mod service;
pub mod storage;
pub mod turns;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use execution::ShellRunner;
use guide_core::Config;
use service::RunService;
use storage::{FileTemplateProvider, SqliteStore};
use tracing::info;

/// Timeout for commands run by the built-in steps.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7700).
    pub port: u16,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// key=value workflow config file (optional).
    pub config_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 7700,
            auth_token: std::env::var("GUIDED_AUTH_TOKEN").ok(),
            config_path: None,
        }
    }
}

/// Get the default database path (~/.local/share/guided/guided.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("guided").join("guided.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    service: RunService,
}

impl Daemon {
    /// Open storage, build the run service, and recover persisted runs.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let mut workflow_config = match &config.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(base) = config.config_path.as_ref().and_then(|p| p.parent()) {
            workflow_config.resolve_paths(base);
        }

        let store = SqliteStore::new(&config.db_path).await?;
        store.migrate_embedded().await?;
        let store = Arc::new(store);

        let mut builder = RunService::builder(workflow_config.clone())
            .store(store)
            .runner(Arc::new(ShellRunner {
                timeout: Some(COMMAND_TIMEOUT),
            }));
        if let Some(path) = &workflow_config.templates_file {
            builder = builder.template_provider(Arc::new(FileTemplateProvider::new(path)));
        }
        let service = builder.build()?;

        let interrupted = service.recover().await?;
        if interrupted > 0 {
            info!("failed {} run(s) interrupted by restart", interrupted);
        }

        Ok(Self { config, service })
    }

    pub fn service(&self) -> &RunService {
        &self.service
    }

    /// Serve the HTTP API until it stops.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("guided starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }
        if !self.service.is_enabled() {
            info!("guided workflows are disabled; mutations will be rejected");
        }

        server::start_server(
            self.service.clone(),
            self.config.port,
            self.config.auth_token.clone(),
        )
        .await
    }

    /// Stop retry tasks and flush pending writes.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.service.close().await;
    }
}
