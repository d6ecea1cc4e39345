//! Task executor: owns a running task's lifetime.
//!
//! Dispatch prepares the branch and worktree, creates the Run row, and
//! flips the task to RUNNING through the storage latch. A detached
//! background activity then drives the backend adapter (local subprocess)
//! or a remote tmux session (SSH), flushing accumulated log text to the
//! Run row every two seconds and persisting the terminal outcome in a
//! single transaction. Cancellation is signalled through a process-wide
//! set of task ids, observed by the drives within 0.5 s.

use aitask_core::{
    tmux_session_name, BackendKind, ErrorClass, QuotaStateValue, TaskStatus, Workspace,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::adapters::{parse_exit_sentinel, Adapter, CancelProbe};
use crate::git;
use crate::ssh;
use crate::storage::Storage;
use crate::worktree;

/// Cadence for flushing accumulated log text to the Run row.
const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Poll cadence for the cancellation flag in the SSH tail loop.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for short one-shot SSH calls (launch, kill, cleanup).
const SSH_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Process-wide set of task ids whose cancellation has been requested.
///
/// Added to synchronously by `cancel` so the DB transition and the
/// in-memory flag stay consistent; discarded by the drive's final step.
#[derive(Debug, Clone, Default)]
pub struct CancelSet {
    inner: Arc<Mutex<HashSet<i64>>>,
}

impl CancelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, task_id: i64) {
        if let Ok(mut set) = self.inner.lock() {
            set.insert(task_id);
        }
    }

    pub fn clear(&self, task_id: i64) {
        if let Ok(mut set) = self.inner.lock() {
            set.remove(&task_id);
        }
    }

    pub fn contains(&self, task_id: i64) -> bool {
        self.inner
            .lock()
            .map(|set| set.contains(&task_id))
            .unwrap_or(false)
    }

    /// Cancellation predicate for one task, polled by the drivers.
    pub fn probe_for(&self, task_id: i64) -> CancelProbe {
        let set = self.clone();
        Arc::new(move || set.contains(task_id))
    }
}

/// Decision computed from an adapter outcome before persisting.
#[derive(Debug, Clone, Copy)]
struct TerminalState {
    task_status: TaskStatus,
    exit_code: i32,
    error_class: Option<ErrorClass>,
}

/// Map `(cancelled, quota, success, error_class)` to terminal state.
///
/// Cancellation wins, then quota, then success; anything else is a failure
/// with the adapter's class (defaulting to Unknown).
fn terminal_state(
    exit_code: i32,
    success: bool,
    error_class: Option<ErrorClass>,
    cancelled: bool,
    is_quota_error: bool,
) -> TerminalState {
    if cancelled {
        return TerminalState {
            task_status: TaskStatus::Failed,
            exit_code: 130,
            error_class: Some(ErrorClass::Unknown),
        };
    }
    if is_quota_error && !success {
        return TerminalState {
            task_status: TaskStatus::Failed,
            exit_code,
            error_class: Some(ErrorClass::Quota),
        };
    }
    if success {
        return TerminalState {
            task_status: TaskStatus::ToBeReview,
            exit_code,
            error_class: None,
        };
    }
    TerminalState {
        task_status: TaskStatus::Failed,
        exit_code,
        error_class: Some(error_class.unwrap_or(ErrorClass::Unknown)),
    }
}

#[derive(Debug)]
pub struct Executor {
    storage: Arc<Storage>,
    cancel_set: CancelSet,
}

impl Executor {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cancel_set: CancelSet::new(),
        }
    }

    pub fn cancel_set(&self) -> &CancelSet {
        &self.cancel_set
    }

    /// Dispatch a TODO task: provision its worktree, create the Run, flip
    /// it to RUNNING, and spawn the background drive.
    ///
    /// Returns true iff a background execution was started.
    pub async fn dispatch(self: &Arc<Self>, task_id: i64) -> bool {
        let task = match self.storage.get_task(task_id).await {
            Ok(task) => task,
            Err(err) => {
                error!(task_id, error = %err, "task not found for dispatch");
                return false;
            }
        };
        if task.status != TaskStatus::Todo {
            warn!(task_id, status = %task.status, "task is not in TODO status");
            return false;
        }

        let workspace = match self.storage.get_workspace(task.workspace_id).await {
            Ok(ws) => ws,
            Err(err) => {
                error!(task_id, error = %err, "workspace not found for dispatch");
                return false;
            }
        };
        let runner_id = workspace.runner_id;

        if workspace.kind.is_remote() {
            return self.dispatch_ssh(task, workspace, runner_id).await;
        }
        self.dispatch_local(task, workspace, runner_id).await
    }

    async fn dispatch_local(
        self: &Arc<Self>,
        task: aitask_core::Task,
        workspace: Workspace,
        runner_id: i64,
    ) -> bool {
        let task_id = task.id;
        let workspace_path = PathBuf::from(&workspace.path);

        // Base branch: recorded value, else detect from HEAD, else "main".
        let base_branch = match task.branch_name.clone().filter(|b| !b.is_empty()) {
            Some(branch) => branch,
            None => {
                let branch = match git::current_branch(&workspace_path).await {
                    Ok(branch) => {
                        info!(task_id, branch = %branch, "auto-detected base branch");
                        branch
                    }
                    Err(err) => {
                        warn!(
                            task_id,
                            error = %err,
                            "failed to auto-detect base branch, falling back to 'main'"
                        );
                        "main".to_string()
                    }
                };
                if self.storage.set_task_branch(task_id, &branch).await.is_err() {
                    return false;
                }
                branch
            }
        };

        let worktree_path = match worktree::provision_local(
            task_id,
            &workspace_path,
            &base_branch,
            task.worktree_path.as_deref(),
        )
        .await
        {
            Ok(path) => path,
            Err(err) => {
                error!(task_id, error = %err, "task failed before execution due to worktree error");
                let _ = self
                    .storage
                    .update_task_status(task_id, TaskStatus::Failed)
                    .await;
                return false;
            }
        };
        if task.worktree_path.as_deref() != Some(worktree_path.as_str()) {
            if let Err(err) = self
                .storage
                .set_task_worktree(task_id, Some(&worktree_path))
                .await
            {
                error!(task_id, error = %err, "failed to persist worktree path");
                return false;
            }
        }

        let run_id = match self
            .storage
            .start_task_run(task_id, runner_id, task.backend, None)
            .await
        {
            Ok(Some(run_id)) => run_id,
            Ok(None) => {
                warn!(task_id, "task left TODO before run start; skipping");
                return false;
            }
            Err(err) => {
                error!(task_id, error = %err, "failed to start run");
                return false;
            }
        };

        info!(
            task_id,
            run_id,
            backend = %task.backend,
            worktree = %worktree_path,
            "starting task"
        );

        let executor = Arc::clone(self);
        let backend = task.backend;
        let prompt = task.prompt.clone();
        let model = task.model.clone();
        let permission_mode = task.permission_mode.clone();
        tokio::spawn(async move {
            executor
                .drive_local(
                    task_id,
                    run_id,
                    PathBuf::from(worktree_path),
                    backend,
                    prompt,
                    model,
                    permission_mode,
                )
                .await;
        });
        true
    }

    async fn dispatch_ssh(
        self: &Arc<Self>,
        task: aitask_core::Task,
        workspace: Workspace,
        runner_id: i64,
    ) -> bool {
        let task_id = task.id;
        let Some(host) = workspace.host.clone().filter(|h| !h.is_empty()) else {
            error!(
                task_id,
                workspace_id = workspace.workspace_id,
                "SSH workspace has no host configured"
            );
            let _ = self
                .storage
                .update_task_status(task_id, TaskStatus::Failed)
                .await;
            return false;
        };

        let ssh_args = ssh::connection_args(&host, workspace.port, workspace.ssh_user.as_deref());
        let remote_repo = ssh::extract_remote_path(&workspace.path, workspace.kind);
        let container = workspace.container_name.clone();

        // Base branch detection mirrors the local path, over SSH.
        let base_branch = match task.branch_name.clone().filter(|b| !b.is_empty()) {
            Some(branch) => branch,
            None => {
                let probe = format!(
                    "git -C {} rev-parse --abbrev-ref HEAD",
                    ssh::shell_quote(&remote_repo)
                );
                let probe = match container.as_deref() {
                    Some(c) => ssh::wrap_container(&probe, c, None),
                    None => probe,
                };
                let branch = ssh::probe(&ssh_args, &probe, Duration::from_secs(30))
                    .await
                    .filter(|b| !b.is_empty())
                    .unwrap_or_else(|| {
                        warn!(task_id, "failed to detect remote base branch, falling back to 'main'");
                        "main".to_string()
                    });
                if self.storage.set_task_branch(task_id, &branch).await.is_err() {
                    return false;
                }
                branch
            }
        };

        let worktree_path = match worktree::provision_remote(
            task_id,
            &ssh_args,
            &remote_repo,
            &base_branch,
            container.as_deref(),
            task.worktree_path.as_deref(),
        )
        .await
        {
            Ok(path) => path,
            Err(err) => {
                error!(task_id, error = %err, "remote worktree provisioning failed");
                let _ = self
                    .storage
                    .update_task_status(task_id, TaskStatus::Failed)
                    .await;
                return false;
            }
        };
        if task.worktree_path.as_deref() != Some(worktree_path.as_str()) {
            if let Err(err) = self
                .storage
                .set_task_worktree(task_id, Some(&worktree_path))
                .await
            {
                error!(task_id, error = %err, "failed to persist worktree path");
                return false;
            }
        }

        let session = tmux_session_name(task_id);
        let run_id = match self
            .storage
            .start_task_run(task_id, runner_id, task.backend, Some(&session))
            .await
        {
            Ok(Some(run_id)) => run_id,
            Ok(None) => {
                warn!(task_id, "task left TODO before run start; skipping");
                return false;
            }
            Err(err) => {
                error!(task_id, error = %err, "failed to start run");
                return false;
            }
        };

        info!(task_id, run_id, host = %host, session = %session, "starting SSH task");

        let executor = Arc::clone(self);
        let backend = task.backend;
        let prompt = task.prompt.clone();
        let model = task.model.clone();
        let permission_mode = task.permission_mode.clone();
        let login_shell = workspace.login_shell.clone();
        tokio::spawn(async move {
            executor
                .drive_ssh(
                    task_id,
                    run_id,
                    ssh_args,
                    worktree_path,
                    backend,
                    prompt,
                    model,
                    permission_mode,
                    container,
                    login_shell,
                    session,
                )
                .await;
        });
        true
    }

    /// Background drive for a local run: stream adapter output, flush logs
    /// on cadence, persist the terminal outcome.
    async fn drive_local(
        &self,
        task_id: i64,
        run_id: i64,
        worktree: PathBuf,
        backend: BackendKind,
        prompt: String,
        model: Option<String>,
        permission_mode: Option<String>,
    ) {
        let adapter = Adapter::for_task(backend, worktree, model, permission_mode);
        let probe = self.cancel_set.probe_for(task_id);
        let (tx, mut rx) = mpsc::channel::<String>(1024);
        let execution = tokio::spawn(adapter.execute(prompt, probe, tx));

        let mut log = String::new();
        let mut flushed_len = 0usize;
        let mut sentinel_code: Option<i32> = None;
        let mut flush = tokio::time::interval(LOG_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => {
                        if let Some(code) = parse_exit_sentinel(&line) {
                            sentinel_code = Some(code);
                        }
                        log.push_str(&line);
                    }
                    None => break,
                },
                _ = flush.tick() => {
                    if log.len() > flushed_len {
                        if let Err(err) = self.storage.flush_run_log(run_id, &log).await {
                            warn!(run_id, error = %err, "failed to flush logs");
                        }
                        flushed_len = log.len();
                    }
                }
            }
        }

        let outcome = match execution.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(task_id, error = %err, "adapter execution panicked");
                self.persist_internal_error(task_id, run_id, &err.to_string())
                    .await;
                self.cancel_set.clear(task_id);
                return;
            }
        };

        let exit_code = sentinel_code.unwrap_or(1);
        let cancelled = exit_code == 130 || self.cancel_set.contains(task_id);
        self.persist_execution_result(
            task_id,
            run_id,
            backend,
            exit_code,
            outcome.success,
            outcome.error_class,
            &log,
            cancelled,
            outcome.usage.as_ref(),
            outcome.is_quota_error,
        )
        .await;
        self.cancel_set.clear(task_id);
    }

    /// Background drive for an SSH run: stage the script, launch the tmux
    /// session, tail the remote log, and persist the outcome. Remote
    /// ephemeral files are removed on every exit path.
    async fn drive_ssh(
        &self,
        task_id: i64,
        run_id: i64,
        ssh_args: Vec<String>,
        remote_worktree: String,
        backend: BackendKind,
        prompt: String,
        model: Option<String>,
        permission_mode: Option<String>,
        container: Option<String>,
        login_shell: Option<String>,
        session: String,
    ) {
        let remote = ssh::RemoteTask {
            backend,
            prompt: &prompt,
            remote_worktree: &remote_worktree,
            container: container.as_deref(),
            login_shell: login_shell.as_deref(),
            permission_mode: permission_mode.as_deref(),
            model: model.as_deref(),
            tmux_session: &session,
        };
        let script = ssh::build_task_script(&remote);
        let launch = ssh::stage_and_launch_command(&remote, &script);

        match ssh::exec(&ssh_args, &launch, Some(SSH_CALL_TIMEOUT)).await {
            Ok(out) if out.success() => {
                info!(task_id, session = %session, "SSH tmux session started");
            }
            Ok(out) => {
                self.persist_internal_error(
                    task_id,
                    run_id,
                    &format!("failed to start SSH tmux session: {}", out.combined()),
                )
                .await;
                self.cleanup_ssh_artifacts(&ssh_args, &remote).await;
                self.cancel_set.clear(task_id);
                return;
            }
            Err(err) => {
                self.persist_internal_error(
                    task_id,
                    run_id,
                    &format!("failed to start SSH tmux session: {err}"),
                )
                .await;
                self.cleanup_ssh_artifacts(&ssh_args, &remote).await;
                self.cancel_set.clear(task_id);
                return;
            }
        }

        let result = self
            .tail_remote_log(task_id, run_id, &ssh_args, &remote)
            .await;

        match result {
            Ok((log, exit_code, cancelled)) => {
                let exit_code = exit_code.unwrap_or(1);
                let success = exit_code == 0 && !cancelled;
                self.persist_execution_result(
                    task_id,
                    run_id,
                    backend,
                    exit_code,
                    success,
                    if success { None } else { Some(ErrorClass::Unknown) },
                    &log,
                    cancelled,
                    None,
                    false,
                )
                .await;
            }
            Err(err) => {
                self.persist_internal_error(task_id, run_id, &err.to_string())
                    .await;
            }
        }

        self.cleanup_ssh_artifacts(&ssh_args, &remote).await;
        self.cancel_set.clear(task_id);
    }

    /// Tail the remote log file until the EXIT_CODE sentinel or cancel.
    async fn tail_remote_log(
        &self,
        task_id: i64,
        run_id: i64,
        ssh_args: &[String],
        remote: &ssh::RemoteTask<'_>,
    ) -> std::io::Result<(String, Option<i32>, bool)> {
        let mut tail = Command::new("ssh")
            .args(ssh_args)
            .arg(format!("tail -F {}", remote.log_file()))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = tail.stdout.take().expect("tail stdout is piped");
        let mut lines = BufReader::new(stdout).lines();

        let mut log = String::new();
        let mut flushed_len = 0usize;
        let mut exit_code: Option<i32> = None;
        let mut cancelled = false;

        let mut flush = tokio::time::interval(LOG_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancel_poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
        cancel_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        log.push_str(&line);
                        log.push('\n');
                        if let Some(code) = line.trim().strip_prefix("EXIT_CODE:") {
                            exit_code = Some(code.trim().parse().unwrap_or(1));
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel_poll.tick() => {
                    if self.cancel_set.contains(task_id) {
                        cancelled = true;
                        let kill = ssh::kill_session_command(remote.tmux_session);
                        if let Err(err) = ssh::exec(ssh_args, &kill, Some(SSH_CALL_TIMEOUT)).await {
                            warn!(task_id, error = %err, "failed to kill remote tmux session");
                        }
                        break;
                    }
                }
                _ = flush.tick() => {
                    if log.len() > flushed_len {
                        if let Err(err) = self.storage.flush_run_log(run_id, &log).await {
                            warn!(run_id, error = %err, "failed to flush SSH logs");
                        }
                        flushed_len = log.len();
                    }
                }
            }
        }

        let _ = tail.start_kill();
        let _ = tail.wait().await;
        Ok((log, exit_code, cancelled))
    }

    async fn cleanup_ssh_artifacts(&self, ssh_args: &[String], remote: &ssh::RemoteTask<'_>) {
        let cleanup = ssh::cleanup_command(remote);
        if let Err(err) = ssh::exec(ssh_args, &cleanup, Some(SSH_CALL_TIMEOUT)).await {
            warn!(error = %err, "failed to remove remote task files");
        }
    }

    /// Persist the terminal state of a run and its task (one transaction),
    /// then record the provider quota standing.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn persist_execution_result(
        &self,
        task_id: i64,
        run_id: i64,
        backend: BackendKind,
        exit_code: i32,
        success: bool,
        error_class: Option<ErrorClass>,
        log_blob: &str,
        cancelled: bool,
        usage: Option<&serde_json::Value>,
        is_quota_error: bool,
    ) {
        let state = terminal_state(exit_code, success, error_class, cancelled, is_quota_error);
        let usage_json = usage.map(serde_json::Value::to_string);
        let log = (!log_blob.is_empty()).then_some(log_blob);

        if let Err(err) = self
            .storage
            .persist_run_outcome(
                task_id,
                run_id,
                state.task_status,
                state.exit_code,
                state.error_class,
                usage_json.as_deref(),
                log,
            )
            .await
        {
            error!(task_id, run_id, error = %err, "failed to persist run outcome");
            return;
        }
        info!(task_id, status = %state.task_status, "task completed");

        // Quota bookkeeping is best-effort and outside the main transaction.
        let provider = backend.provider();
        let quota_update = if state.error_class == Some(ErrorClass::Quota) {
            Some((QuotaStateValue::QuotaExhausted, Some("quota signal observed")))
        } else if success {
            Some((QuotaStateValue::Ok, None))
        } else {
            None
        };
        if let Some((value, note)) = quota_update {
            if let Err(err) = self.storage.upsert_quota_state(provider, value, note).await {
                warn!(provider, error = %err, "failed to update quota state");
            }
        }
    }

    /// Fold an internal error into the run's terminal state.
    pub(crate) async fn persist_internal_error(&self, task_id: i64, run_id: i64, message: &str) {
        let cancelled = self.cancel_set.contains(task_id);
        let exit_code = if cancelled { 130 } else { -1 };
        error!(task_id, run_id, message, "error executing task");
        if let Err(err) = self
            .storage
            .persist_run_outcome(
                task_id,
                run_id,
                TaskStatus::Failed,
                exit_code,
                Some(ErrorClass::Unknown),
                None,
                Some(&format!("Internal error: {message}")),
            )
            .await
        {
            error!(task_id, run_id, error = %err, "failed to persist internal error");
        }
    }

    /// Cancel a task. Idempotent; returns false when the task does not
    /// exist or is not in a cancellable state.
    pub async fn cancel(&self, task_id: i64) -> bool {
        let task = match self.storage.get_task(task_id).await {
            Ok(task) => task,
            Err(_) => return false,
        };
        if !matches!(task.status, TaskStatus::Todo | TaskStatus::Running) {
            return false;
        }

        let was_running = task.status == TaskStatus::Running;
        if self
            .storage
            .update_task_status(task_id, TaskStatus::Failed)
            .await
            .is_err()
        {
            return false;
        }
        if was_running {
            // Mark before anything else so the drive sees it within 0.5 s.
            self.cancel_set.mark(task_id);
        }
        if let Some(run_id) = task.run_id {
            if let Err(err) = self.storage.end_run_cancelled(run_id).await {
                warn!(task_id, run_id, error = %err, "failed to stamp cancelled run");
            }
        }
        info!(task_id, "task cancelled (mapped to FAILED)");
        true
    }
}

/// Background cleanup used by delete and merge endpoints: remove the task
/// worktree and branch, local or remote depending on the workspace.
pub async fn cleanup_task_worktree(task_id: i64, worktree_path: &str, workspace: &Workspace) {
    if workspace.kind.is_remote() {
        let Some(host) = workspace.host.as_deref().filter(|h| !h.is_empty()) else {
            warn!(
                task_id,
                workspace_id = workspace.workspace_id,
                "SSH workspace has no host; skipping worktree removal"
            );
            return;
        };
        let ssh_args = ssh::connection_args(host, workspace.port, workspace.ssh_user.as_deref());
        let remote_repo = ssh::extract_remote_path(&workspace.path, workspace.kind);
        worktree::cleanup_remote(
            task_id,
            &ssh_args,
            &remote_repo,
            worktree_path,
            workspace.container_name.as_deref(),
        )
        .await;
    } else {
        worktree::cleanup_local(task_id, Path::new(&workspace.path), worktree_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_repo;
    use crate::storage::test_store::{create, new_task, seed_workspace};
    use crate::storage::{NewTask, NewWorkspace};
    use aitask_core::WorkspaceKind;

    async fn running_task(
        storage: &Arc<Storage>,
        workspace_id: i64,
        runner_id: i64,
    ) -> (i64, i64) {
        let task = storage
            .insert_task(new_task(workspace_id, "t"))
            .await
            .unwrap();
        let run_id = storage
            .start_task_run(task.id, runner_id, BackendKind::ClaudeCode, None)
            .await
            .unwrap()
            .unwrap();
        (task.id, run_id)
    }

    #[tokio::test]
    async fn success_with_stale_quota_flag_still_reviews() {
        // A quota keyword seen mid-run must not fail a run that exited 0.
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/exec-ws1").await;
        let executor = Executor::new(Arc::clone(&storage));
        let (task_id, run_id) = running_task(&storage, ws, runner).await;

        executor
            .persist_execution_result(
                task_id,
                run_id,
                BackendKind::CopilotCli,
                0,
                true,
                None,
                "ok\n",
                false,
                None,
                true,
            )
            .await;

        let task = storage.get_task(task_id).await.unwrap();
        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::ToBeReview);
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.error_class, None);
    }

    #[tokio::test]
    async fn quota_failure_marks_quota_and_provider_state() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/exec-ws2").await;
        let executor = Executor::new(Arc::clone(&storage));
        let (task_id, run_id) = running_task(&storage, ws, runner).await;

        executor
            .persist_execution_result(
                task_id,
                run_id,
                BackendKind::ClaudeCode,
                1,
                false,
                Some(ErrorClass::Tool),
                "rate limit\n",
                false,
                None,
                true,
            )
            .await;

        let task = storage.get_task(task_id).await.unwrap();
        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(run.error_class, Some(ErrorClass::Quota));

        let states = storage.list_quota_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].provider, "claude");
        assert_eq!(states[0].state, QuotaStateValue::QuotaExhausted);
    }

    #[tokio::test]
    async fn cancelled_outcome_overrides_exit_code() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/exec-ws3").await;
        let executor = Executor::new(Arc::clone(&storage));
        let (task_id, run_id) = running_task(&storage, ws, runner).await;

        executor
            .persist_execution_result(
                task_id,
                run_id,
                BackendKind::ClaudeCode,
                0,
                true,
                None,
                "partial\n",
                true,
                None,
                false,
            )
            .await;

        let task = storage.get_task(task_id).await.unwrap();
        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(run.exit_code, Some(130));
        assert_eq!(run.error_class, Some(ErrorClass::Unknown));
    }

    #[tokio::test]
    async fn failure_defaults_to_unknown_class() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/exec-ws4").await;
        let executor = Executor::new(Arc::clone(&storage));
        let (task_id, run_id) = running_task(&storage, ws, runner).await;

        executor
            .persist_execution_result(
                task_id,
                run_id,
                BackendKind::CodexCli,
                1,
                false,
                None,
                "boom\n",
                false,
                None,
                false,
            )
            .await;

        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(run.error_class, Some(ErrorClass::Unknown));
    }

    #[tokio::test]
    async fn cancel_semantics() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/exec-ws5").await;
        let executor = Executor::new(Arc::clone(&storage));

        // Non-existent task.
        assert!(!executor.cancel(9999).await);

        // TODO task cancels without touching the cancel set.
        let todo = storage.insert_task(new_task(ws, "todo")).await.unwrap();
        assert!(executor.cancel(todo.id).await);
        assert!(!executor.cancel_set().contains(todo.id));
        assert_eq!(
            storage.get_task(todo.id).await.unwrap().status,
            TaskStatus::Failed
        );

        // Cancel is not re-applicable once failed.
        assert!(!executor.cancel(todo.id).await);

        // RUNNING task: status flips, run stamped, cancel set marked.
        let (task_id, run_id) = running_task(&storage, ws, runner).await;
        assert!(executor.cancel(task_id).await);
        assert!(executor.cancel_set().contains(task_id));
        let run = storage.get_run(run_id).await.unwrap();
        assert_eq!(run.exit_code, Some(130));
        assert_eq!(run.error_class, Some(ErrorClass::Unknown));
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn dispatch_rejects_non_todo_tasks() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (runner, ws) = seed_workspace(&storage, "/tmp/exec-ws6").await;
        let executor = Arc::new(Executor::new(Arc::clone(&storage)));
        let (task_id, _run_id) = running_task(&storage, ws, runner).await;

        assert!(!executor.dispatch(task_id).await);
    }

    #[tokio::test]
    async fn dispatch_fails_ssh_workspace_without_host() {
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let runner = storage
            .upsert_runner("test-env", &BackendKind::ALL, 3)
            .await
            .unwrap();
        let workspace = storage
            .insert_workspace(NewWorkspace {
                path: "ssh://nohost:22/srv/repo".to_string(),
                display_name: "broken".to_string(),
                kind: WorkspaceKind::Ssh,
                host: None,
                port: None,
                ssh_user: None,
                container_name: None,
                login_shell: None,
                runner_id: runner.runner_id,
                concurrency_limit: 1,
            })
            .await
            .unwrap();
        let task = storage
            .insert_task(NewTask {
                title: "t".to_string(),
                prompt: "p".to_string(),
                workspace_id: workspace.workspace_id,
                backend: BackendKind::ClaudeCode,
                branch_name: None,
                model: None,
                permission_mode: None,
            })
            .await
            .unwrap();

        let executor = Arc::new(Executor::new(Arc::clone(&storage)));
        assert!(!executor.dispatch(task.id).await);
        assert_eq!(
            storage.get_task(task.id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn dispatch_provisions_worktree_and_cancel_terminates() {
        // Full dispatch against a real git repo. The task is cancelled right
        // after dispatch, so it reaches FAILED whether or not the backend
        // CLI exists on this machine.
        let repo = test_repo::init();
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (_runner, ws) =
            seed_workspace(&storage, &repo.path().to_string_lossy()).await;
        let executor = Arc::new(Executor::new(Arc::clone(&storage)));

        let task = storage
            .insert_task(NewTask {
                title: "happy".to_string(),
                prompt: "add README section on licensing".to_string(),
                workspace_id: ws,
                backend: BackendKind::CopilotCli,
                branch_name: None,
                model: None,
                permission_mode: None,
            })
            .await
            .unwrap();
        assert!(executor.dispatch(task.id).await);

        let after = storage.get_task(task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Running);
        assert_eq!(after.branch_name.as_deref(), Some("main"));
        let worktree_path = after.worktree_path.clone().unwrap();
        assert!(worktree_path.ends_with(&format!("-task-{}", task.id)));
        assert!(Path::new(&worktree_path).exists());
        assert!(git::branch_exists(repo.path(), &format!("task-{}", task.id))
            .await
            .unwrap());
        assert!(after.run_id.is_some());

        executor.cancel(task.id).await;

        // The drive observes the flag within 0.5 s and persists FAILED.
        let mut status = TaskStatus::Running;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            status = storage.get_task(task.id).await.unwrap().status;
            if status != TaskStatus::Running {
                break;
            }
        }
        assert_eq!(status, TaskStatus::Failed);

        let run = storage.get_run(after.run_id.unwrap()).await.unwrap();
        assert!(run.ended_at.is_some());
        // The cancel set is drained by the drive's final step.
        for _ in 0..50 {
            if !executor.cancel_set().contains(task.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!executor.cancel_set().contains(task.id));
    }
}
