//! aitaskd - Orchestrator daemon for AI coding-agent sessions.
//!
//! A single process owns scheduling and execution: tasks are admitted FIFO
//! under per-workspace and per-runner concurrency limits, run in isolated
//! git worktrees (locally or on remote hosts over SSH), and driven through
//! a review -> merge -> done lifecycle. Logs stream incrementally to the
//! store and out over SSE.

pub mod adapters;
pub mod config;
pub mod executor;
pub mod git;
pub mod merge;
pub mod reconciler;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod ssh;
pub mod storage;
pub mod worktree;

use std::sync::Arc;
use std::time::Duration;

use aitask_core::BackendKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::executor::Executor;
use crate::scheduler::{Heartbeat, Scheduler};
use crate::server::AppState;
use crate::storage::Storage;

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Grace period for background activities to notice shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    settings: Settings,
    storage: Arc<Storage>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Initialize storage, run migrations, repair orphaned state, and
    /// register the local runner.
    pub async fn new(settings: Settings) -> AppResult<Self> {
        let storage = Arc::new(Storage::new(&settings.database_url).await?);
        storage.migrate().await?;

        let orphaned = scheduler::fail_orphaned_running_tasks(&storage).await?;
        if orphaned > 0 {
            info!(orphaned, "failed orphaned RUNNING task(s) from previous process");
        }

        let runner = storage
            .upsert_runner(
                &settings.runner_env,
                &BackendKind::ALL,
                settings.max_parallel.max(1),
            )
            .await?;
        info!(
            runner_id = runner.runner_id,
            env = %runner.env,
            "registered local runner"
        );

        let executor = Arc::new(Executor::new(Arc::clone(&storage)));
        Ok(Self {
            settings,
            storage,
            executor,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Run the daemon: scheduler, heartbeat, and HTTP server, until
    /// shutdown is requested.
    pub async fn run(&self) -> AppResult<()> {
        info!(
            database = %self.settings.database_url,
            scheduler_interval = self.settings.scheduler_interval,
            heartbeat_interval = self.settings.heartbeat_interval,
            "aitaskd starting"
        );

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.executor),
            Duration::from_secs(self.settings.scheduler_interval.max(1)),
        ));
        let scheduler_handle = tokio::spawn(scheduler.run(self.shutdown.clone()));

        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&self.storage),
            Duration::from_secs(self.settings.heartbeat_interval.max(1)),
            self.settings.runner_env.clone(),
        ));
        let heartbeat_handle = tokio::spawn(heartbeat.run(self.shutdown.clone()));

        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            executor: Arc::clone(&self.executor),
            settings: self.settings.clone(),
        });
        let host = self.settings.api_host.clone();
        let port = self.settings.api_port;
        let cors = self.settings.cors_origins.clone();
        let http_handle = tokio::spawn(async move {
            if let Err(err) = server::start_server(state, &host, port, &cors).await {
                error!("HTTP server error: {err}");
            }
        });

        self.shutdown.cancelled().await;
        info!("shutdown requested; stopping background loops");

        // Let the scheduler and heartbeat exit their select arms.
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        http_handle.abort();
        let _ = scheduler_handle.await;
        let _ = heartbeat_handle.await;
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
