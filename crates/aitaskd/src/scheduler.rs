//! Scheduler and runner heartbeat loops.
//!
//! The scheduler ticks on a fixed interval: it runs one reconciliation
//! pass, then walks TODO tasks in FIFO order and dispatches each through
//! the admission gates (workspace concurrency, runner liveness, backend
//! capability, runner parallelism). Strict FIFO, no priorities, no
//! preemption; a tick never blocks on a running task.

use aitask_core::{BackendKind, RunnerStatus, Task, TaskStatus};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::Executor;
use crate::reconciler::Reconciler;
use crate::storage::Storage;

#[derive(Debug)]
pub struct Scheduler {
    storage: Arc<Storage>,
    executor: Arc<Executor>,
    reconciler: Reconciler,
    interval: Duration,
    /// (runner, backend) pairs already warned about, so a misconfigured
    /// runner does not spam the log every tick.
    unsupported_logged: Mutex<HashSet<(i64, BackendKind)>>,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, executor: Arc<Executor>, interval: Duration) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&storage)),
            storage,
            executor,
            interval,
            unsupported_logged: Mutex::new(HashSet::new()),
        }
    }

    /// Scheduler loop; returns when `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        loop {
            if let Err(err) = self.tick().await {
                error!(error = %err, "scheduler tick failed");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("scheduler stopped");
    }

    /// One scheduler tick: reconcile, then try to dispatch TODO tasks.
    pub async fn tick(&self) -> crate::storage::Result<()> {
        match self.reconciler.reconcile_once().await {
            Ok(repaired) if repaired > 0 => {
                info!(repaired, "reconciled dangling task(s)");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reconciliation failed"),
        }

        let todo_tasks = self.storage.list_todo_tasks().await?;
        if todo_tasks.is_empty() {
            return Ok(());
        }
        debug!(count = todo_tasks.len(), "found TODO tasks");

        for task in todo_tasks {
            if self.try_dispatch(&task).await {
                info!(task_id = task.id, "dispatched task");
            } else {
                debug!(task_id = task.id, "task not ready to dispatch");
            }
        }
        Ok(())
    }

    /// Evaluate the admission gates for one task; dispatch when all pass.
    pub(crate) async fn try_dispatch(&self, task: &Task) -> bool {
        let workspace = match self.storage.get_workspace(task.workspace_id).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(task_id = task.id, error = %err, "workspace not found for task");
                return false;
            }
        };

        let workspace_limit = i64::from(workspace.concurrency_limit.max(1));
        let running = match self
            .storage
            .count_running_in_workspace(workspace.workspace_id)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "failed to count running tasks");
                return false;
            }
        };
        if running >= workspace_limit {
            debug!(
                workspace_id = workspace.workspace_id,
                limit = workspace_limit,
                running,
                "workspace reached concurrency limit, skipping"
            );
            return false;
        }

        let runner = match self.storage.get_runner(workspace.runner_id).await {
            Ok(runner) => runner,
            Err(err) => {
                warn!(runner_id = workspace.runner_id, error = %err, "runner not found");
                return false;
            }
        };
        if runner.status != RunnerStatus::Online {
            debug!(runner_id = runner.runner_id, "runner is offline, skipping");
            return false;
        }

        if !runner.capabilities.contains(&task.backend) {
            let key = (runner.runner_id, task.backend);
            let mut logged = self
                .unsupported_logged
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if logged.insert(key) {
                warn!(
                    runner_id = runner.runner_id,
                    backend = %task.backend,
                    "runner does not support backend"
                );
            }
            return false;
        }
        // Capability present again: re-arm the warning for this pair.
        self.unsupported_logged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(runner.runner_id, task.backend));

        let runner_limit = i64::from(runner.max_parallel.max(1));
        let runner_running = match self
            .storage
            .count_running_on_runner(runner.runner_id)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "failed to count runner tasks");
                return false;
            }
        };
        if runner_running >= runner_limit {
            debug!(
                runner_id = runner.runner_id,
                limit = runner_limit,
                running = runner_running,
                "runner reached max_parallel, skipping"
            );
            return false;
        }

        self.executor.dispatch(task.id).await
    }

    #[cfg(test)]
    fn unsupported_warning_count(&self) -> usize {
        self.unsupported_logged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Periodic liveness refresh for the local runner, flipping stale runners
/// Offline once their heartbeat is older than twice the interval.
#[derive(Debug)]
pub struct Heartbeat {
    storage: Arc<Storage>,
    interval: Duration,
    runner_env: String,
}

impl Heartbeat {
    pub fn new(storage: Arc<Storage>, interval: Duration, runner_env: String) -> Self {
        Self {
            storage,
            interval,
            runner_env,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "runner heartbeat started");
        loop {
            if let Err(err) = self.tick().await {
                error!(error = %err, "heartbeat tick failed");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Evaluate staleness before refreshing, so only the local runner row
    /// ever has its heartbeat bumped (remote runners update themselves).
    pub async fn tick(&self) -> crate::storage::Result<()> {
        let threshold =
            Utc::now() - ChronoDuration::seconds(2 * self.interval.as_secs().max(1) as i64);
        for runner in self.storage.list_runners().await? {
            let next_status = if runner.heartbeat_at < threshold {
                RunnerStatus::Offline
            } else {
                RunnerStatus::Online
            };
            if next_status != runner.status {
                info!(
                    runner_id = runner.runner_id,
                    status = next_status.as_str(),
                    "runner status changed"
                );
                self.storage
                    .set_runner_status(runner.runner_id, next_status)
                    .await?;
            }
            if runner.env == self.runner_env {
                self.storage.touch_runner_heartbeat(runner.runner_id).await?;
            }
        }
        Ok(())
    }
}

/// Tasks stuck RUNNING from a previous process are unrecoverable (their
/// drives died with it); fold them into FAILED at startup.
pub async fn fail_orphaned_running_tasks(storage: &Storage) -> crate::storage::Result<usize> {
    let running = storage.list_tasks(Some(TaskStatus::Running), None).await?;
    let count = running.len();
    for task in running {
        warn!(task_id = task.id, "failing orphaned RUNNING task from previous process");
        if let Some(run_id) = task.run_id {
            storage.end_run_cancelled(run_id).await?;
        }
        storage.update_task_status(task.id, TaskStatus::Failed).await?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_store::{create, new_task, seed_workspace};
    use crate::storage::{NewTask, NewWorkspace};
    use aitask_core::WorkspaceKind;

    struct Fixture {
        storage: Arc<Storage>,
        scheduler: Scheduler,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let executor = Arc::new(Executor::new(Arc::clone(&storage)));
        let scheduler = Scheduler::new(Arc::clone(&storage), executor, Duration::from_secs(5));
        Fixture {
            storage,
            scheduler,
            _dir: ts._dir,
        }
    }

    #[tokio::test]
    async fn workspace_limit_blocks_dispatch() {
        let f = fixture().await;
        let (runner, ws) = seed_workspace(&f.storage, "/tmp/sched-ws1").await;
        // Limit of 3 seeded; saturate it.
        for i in 0..3 {
            let t = f
                .storage
                .insert_task(new_task(ws, &format!("r{i}")))
                .await
                .unwrap();
            f.storage
                .start_task_run(t.id, runner, BackendKind::ClaudeCode, None)
                .await
                .unwrap();
        }
        let blocked = f.storage.insert_task(new_task(ws, "blocked")).await.unwrap();

        assert!(!f.scheduler.try_dispatch(&blocked).await);
        assert_eq!(
            f.storage.get_task(blocked.id).await.unwrap().status,
            TaskStatus::Todo
        );
    }

    #[tokio::test]
    async fn offline_runner_blocks_dispatch() {
        let f = fixture().await;
        let (runner, ws) = seed_workspace(&f.storage, "/tmp/sched-ws2").await;
        f.storage
            .set_runner_status(runner, RunnerStatus::Offline)
            .await
            .unwrap();
        let task = f.storage.insert_task(new_task(ws, "t")).await.unwrap();

        assert!(!f.scheduler.try_dispatch(&task).await);
    }

    #[tokio::test]
    async fn missing_capability_blocks_and_warns_once() {
        let f = fixture().await;
        let runner = f
            .storage
            .upsert_runner("codex-only", &[BackendKind::CodexCli], 3)
            .await
            .unwrap();
        let ws = f
            .storage
            .insert_workspace(NewWorkspace {
                path: "/tmp/sched-ws3".to_string(),
                display_name: "ws3".to_string(),
                kind: WorkspaceKind::Local,
                host: None,
                port: None,
                ssh_user: None,
                container_name: None,
                login_shell: None,
                runner_id: runner.runner_id,
                concurrency_limit: 3,
            })
            .await
            .unwrap();
        let task = f
            .storage
            .insert_task(NewTask {
                title: "t".to_string(),
                prompt: "p".to_string(),
                workspace_id: ws.workspace_id,
                backend: BackendKind::ClaudeCode,
                branch_name: None,
                model: None,
                permission_mode: None,
            })
            .await
            .unwrap();

        assert!(!f.scheduler.try_dispatch(&task).await);
        assert_eq!(f.scheduler.unsupported_warning_count(), 1);
        // Second attempt suppresses the duplicate warning.
        assert!(!f.scheduler.try_dispatch(&task).await);
        assert_eq!(f.scheduler.unsupported_warning_count(), 1);

        // Capability restored: suppression entry is re-armed.
        f.storage
            .upsert_runner("codex-only", &BackendKind::ALL, 3)
            .await
            .unwrap();
        // Dispatch proceeds past the capability gate now (and fails later
        // because the workspace path is not a git repository).
        assert!(!f.scheduler.try_dispatch(&task).await);
        assert_eq!(f.scheduler.unsupported_warning_count(), 0);
    }

    #[tokio::test]
    async fn runner_parallel_limit_spans_workspaces() {
        let f = fixture().await;
        let runner = f
            .storage
            .upsert_runner("shared", &BackendKind::ALL, 1)
            .await
            .unwrap();
        let mut workspaces = Vec::new();
        for i in 0..2 {
            let ws = f
                .storage
                .insert_workspace(NewWorkspace {
                    path: format!("/tmp/sched-shared-{i}"),
                    display_name: format!("shared-{i}"),
                    kind: WorkspaceKind::Local,
                    host: None,
                    port: None,
                    ssh_user: None,
                    container_name: None,
                    login_shell: None,
                    runner_id: runner.runner_id,
                    concurrency_limit: 3,
                })
                .await
                .unwrap();
            workspaces.push(ws.workspace_id);
        }

        // Saturate the runner from the first workspace.
        let t1 = f
            .storage
            .insert_task(new_task(workspaces[0], "a"))
            .await
            .unwrap();
        f.storage
            .start_task_run(t1.id, runner.runner_id, BackendKind::ClaudeCode, None)
            .await
            .unwrap();

        // Task in the second workspace is blocked by the runner limit.
        let t2 = f
            .storage
            .insert_task(new_task(workspaces[1], "b"))
            .await
            .unwrap();
        assert!(!f.scheduler.try_dispatch(&t2).await);
    }

    #[tokio::test]
    async fn gates_pass_but_non_git_workspace_fails_dispatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let f = fixture().await;
        let (_, ws) = seed_workspace(&f.storage, &dir.path().to_string_lossy()).await;
        let task = f.storage.insert_task(new_task(ws, "t")).await.unwrap();

        // All admission gates pass; worktree provisioning then fails in the
        // plain directory and the executor marks the task FAILED.
        assert!(!f.scheduler.try_dispatch(&task).await);
        assert_eq!(
            f.storage.get_task(task.id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn heartbeat_flips_stale_runner_offline_and_refreshes_local() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let local = storage
            .upsert_runner("local", &BackendKind::ALL, 1)
            .await
            .unwrap();
        let remote = storage
            .upsert_runner("remote-box", &BackendKind::ALL, 1)
            .await
            .unwrap();

        // Age both heartbeats far past the threshold.
        sqlx::query("UPDATE runners SET heartbeat_at = 0")
            .execute(storage.pool())
            .await
            .unwrap();

        let heartbeat = Heartbeat::new(
            Arc::clone(&storage),
            Duration::from_secs(30),
            "local".to_string(),
        );
        heartbeat.tick().await.unwrap();

        let remote = storage.get_runner(remote.runner_id).await.unwrap();
        assert_eq!(remote.status, RunnerStatus::Offline);

        // The local runner was also stale, but its heartbeat got refreshed,
        // so the next tick brings it back Online.
        heartbeat.tick().await.unwrap();
        let local = storage.get_runner(local.runner_id).await.unwrap();
        assert_eq!(local.status, RunnerStatus::Online);
    }

    #[tokio::test]
    async fn orphaned_running_tasks_fail_at_startup() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/sched-orphan").await;
        let task = storage.insert_task(new_task(ws, "t")).await.unwrap();
        let run_id = storage
            .start_task_run(task.id, runner, BackendKind::ClaudeCode, None)
            .await
            .unwrap()
            .unwrap();

        let failed = fail_orphaned_running_tasks(&storage).await.unwrap();
        assert_eq!(failed, 1);
        assert_eq!(
            storage.get_task(task.id).await.unwrap().status,
            TaskStatus::Failed
        );
        assert!(storage.get_run(run_id).await.unwrap().ended_at.is_some());
    }
}
