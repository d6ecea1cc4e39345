//! Merge engine: integrate a reviewed task branch back into its base.
//!
//! Pipeline: auto-commit pending changes (worktree, then base), resolve
//! the source branch (canonical `task-<id>`, falling back to the
//! worktree's current branch), then fast-forward, three-way merge, and
//! finally AI-assisted conflict resolution. Only local workspaces escalate
//! to the AI step; SSH merges surface the conflict and abort.

use aitask_core::{task_branch, Task};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapters::{Adapter, CancelProbe};
use crate::git;
use crate::ssh;

/// Lines of AI output included in a resolution failure message.
const RESOLUTION_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh::SshError),
    #[error("target branch '{0}' does not exist in the workspace")]
    TargetMissing(String),
    #[error("no mergeable branch found for task {0}")]
    NoSource(i64),
    #[error("checkout of '{branch}' failed: {detail}")]
    Checkout { branch: String, detail: String },
    #[error("merge failed: {0}")]
    Failed(String),
    #[error("AI conflict resolution failed: {0}")]
    Resolution(String),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Auto-commit message used in both the worktree and the base workspace.
fn sentinel_message(task_id: i64) -> String {
    format!("chore(task-{task_id}): auto-commit pending changes before merge")
}

/// Merge target: the task's configured base branch, defaulting to `main`.
pub fn target_branch(task: &Task) -> String {
    task.branch_name
        .clone()
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "main".to_string())
}

/// Resolve the source branch: the canonical `task-<id>` when it exists in
/// the base workspace, otherwise the current branch of a valid, attached
/// worktree, validated to exist in the base workspace.
async fn resolve_source_branch(task: &Task, base: &Path) -> Result<String> {
    let canonical = task_branch(task.id);
    if git::branch_exists(base, &canonical).await? {
        return Ok(canonical);
    }

    if let Some(worktree_path) = task.worktree_path.as_deref() {
        let worktree = Path::new(worktree_path);
        if git::is_valid_worktree(worktree).await {
            let branch = git::current_branch(worktree).await?;
            if branch != "HEAD" && git::branch_exists(base, &branch).await? {
                info!(
                    task_id = task.id,
                    branch = %branch,
                    "using worktree branch as merge source"
                );
                return Ok(branch);
            }
        }
    }

    Err(MergeError::NoSource(task.id))
}

/// Merge a task's branch into its base branch in a local workspace.
///
/// `allow_ai` gates the escalation to AI-assisted conflict resolution;
/// callers handling SSH workspaces pass false through the remote variant.
pub async fn merge_local(task: &Task, workspace_path: &Path, allow_ai: bool) -> Result<()> {
    let base = workspace_path;
    let sentinel = sentinel_message(task.id);

    // A leftover merge from an earlier attempt would wedge everything.
    if git::merge_in_progress(base).await {
        warn!(task_id = task.id, "aborting stale in-progress merge");
        git::abort_merge(base).await;
    }

    // Auto-commit pending changes in the task worktree.
    if let Some(worktree_path) = task.worktree_path.as_deref() {
        let worktree = Path::new(worktree_path);
        if git::is_valid_worktree(worktree).await
            && git::auto_commit_pending(worktree, &sentinel).await?
        {
            info!(task_id = task.id, "auto-committed pending worktree changes");
        }
    }

    let target = target_branch(task);
    if !git::branch_exists(base, &target).await? {
        return Err(MergeError::TargetMissing(target));
    }
    let source = resolve_source_branch(task, base).await?;

    let checkout = git::checkout(base, &target).await?;
    if !checkout.success() {
        // A dirty base workspace is the usual culprit; commit and retry once.
        if !git::is_clean(base).await? {
            git::auto_commit_pending(base, &sentinel).await?;
            let retry = git::checkout(base, &target).await?;
            if !retry.success() {
                return Err(MergeError::Checkout {
                    branch: target,
                    detail: retry.combined(),
                });
            }
        } else {
            return Err(MergeError::Checkout {
                branch: target,
                detail: checkout.combined(),
            });
        }
    }

    // Anything still pending on the base branch gets the same sentinel.
    if git::auto_commit_pending(base, &sentinel).await? {
        info!(task_id = task.id, "auto-committed pending base workspace changes");
    }

    let ff = git::merge_ff_only(base, &source).await?;
    if ff.success() {
        info!(task_id = task.id, source = %source, target = %target, "fast-forward merge complete");
        return Ok(());
    }

    let three_way = git::merge_no_ff(base, &source).await?;
    if three_way.success() {
        info!(task_id = task.id, source = %source, target = %target, "three-way merge complete");
        return Ok(());
    }

    let unmerged = git::unmerged_files(base).await?;
    if !unmerged.is_empty() && allow_ai {
        match resolve_conflicts_with_ai(task, base, &target, &source, &three_way.combined()).await
        {
            Ok(()) => {
                info!(task_id = task.id, "AI conflict resolution complete");
                return Ok(());
            }
            Err(err) => {
                git::abort_merge(base).await;
                return Err(err);
            }
        }
    }

    git::abort_merge(base).await;
    Err(MergeError::Failed(format!(
        "{} | {}",
        ff.combined(),
        three_way.combined()
    )))
}

/// Deterministic prompt handed to the resolver CLI.
fn resolution_prompt(
    task: &Task,
    repo: &Path,
    target: &str,
    source: &str,
    merge_error: &str,
) -> String {
    format!(
        "You are resolving a git merge conflict.\n\
         Repository: {repo}\n\
         Current branch: {target}\n\
         Merging branch: {source}\n\
         Task #{id}: {title}\n\
         Task instructions: {prompt}\n\
         \n\
         Resolve every conflicted file in favor of a correct combined result.\n\
         Constraints:\n\
         - Do not run reset, rebase, or checkout commands that discard changes.\n\
         - Stage each resolved file with `git add`.\n\
         - Complete the merge commit.\n\
         \n\
         Original merge error:\n{merge_error}\n",
        repo = repo.display(),
        target = target,
        source = source,
        id = task.id,
        title = task.title,
        prompt = task.prompt,
        merge_error = merge_error,
    )
}

/// Run the task's backend against the base workspace to resolve conflicts,
/// then verify the repository actually ended up merge-clean.
async fn resolve_conflicts_with_ai(
    task: &Task,
    base: &Path,
    target: &str,
    source: &str,
    merge_error: &str,
) -> Result<()> {
    let prompt = resolution_prompt(task, base, target, source, merge_error);
    let adapter = Adapter::for_task(
        task.backend,
        base.to_path_buf(),
        task.model.clone(),
        task.permission_mode.clone(),
    );

    let (tx, mut rx) = mpsc::channel::<String>(1024);
    let cancel: CancelProbe = Arc::new(|| false);
    let execution = tokio::spawn(adapter.execute(prompt, cancel, tx));

    let mut lines: Vec<String> = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    let outcome = execution
        .await
        .map_err(|err| MergeError::Resolution(format!("resolver panicked: {err}")))?;

    let tail: Vec<String> = lines
        .iter()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(RESOLUTION_TAIL_LINES)
        .cloned()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    finalize_resolution(base, outcome.exit_code, &tail.join("")).await
}

/// Post-resolver verification: no unmerged files, merge concluded, and a
/// non-zero resolver exit is tolerated only when the repository is clean.
pub(crate) async fn finalize_resolution(base: &Path, exit_code: i32, tail: &str) -> Result<()> {
    let unmerged = git::unmerged_files(base).await?;
    if !unmerged.is_empty() {
        return Err(MergeError::Resolution(format!(
            "unmerged files remain: {}; recent output:\n{tail}",
            unmerged.join(", ")
        )));
    }

    if git::merge_in_progress(base).await {
        let commit = git::commit_no_edit(base).await?;
        if !commit.success() {
            return Err(MergeError::Resolution(format!(
                "failed to conclude merge commit: {}",
                commit.combined()
            )));
        }
    }

    let unmerged = git::unmerged_files(base).await?;
    if !unmerged.is_empty() {
        return Err(MergeError::Resolution(format!(
            "unmerged files remain after commit: {}",
            unmerged.join(", ")
        )));
    }
    if git::merge_in_progress(base).await {
        return Err(MergeError::Resolution(
            "merge still in progress after resolution".to_string(),
        ));
    }

    if exit_code != 0 {
        warn!(exit_code, "resolver exited non-zero but repository is merge-clean; accepting");
    }
    Ok(())
}

// --- SSH variant ---

/// Wall-clock ceiling for each remote git step.
const REMOTE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote git runner bound to one repository over SSH.
struct RemoteGit<'a> {
    ssh_args: &'a [String],
    repo: &'a str,
    container: Option<&'a str>,
}

impl RemoteGit<'_> {
    async fn run(&self, git_args: &str) -> Result<ssh::SshOutput> {
        let cmd = format!("git -C {} {git_args}", ssh::shell_quote(self.repo));
        let cmd = match self.container {
            Some(container) => ssh::wrap_container(&cmd, container, None),
            None => cmd,
        };
        Ok(ssh::exec(self.ssh_args, &cmd, Some(REMOTE_STEP_TIMEOUT)).await?)
    }

    async fn run_ok(&self, git_args: &str) -> Result<ssh::SshOutput> {
        let out = self.run(git_args).await?;
        if !out.success() {
            return Err(MergeError::Failed(format!("git {git_args}: {}", out.combined())));
        }
        Ok(out)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self
            .run(&format!("rev-parse --verify refs/heads/{branch}"))
            .await?
            .success())
    }

    async fn is_clean(&self) -> Result<bool> {
        let out = self.run_ok("status --porcelain").await?;
        Ok(out.stdout.trim().is_empty())
    }

    async fn auto_commit_pending(&self, message: &str) -> Result<bool> {
        if self.is_clean().await? {
            return Ok(false);
        }
        self.run_ok("add -A").await?;
        let commit = self
            .run(&format!("commit -m {}", ssh::shell_quote(message)))
            .await?;
        if commit.success() {
            return Ok(true);
        }
        if self.is_clean().await? {
            return Ok(false);
        }
        Err(MergeError::Failed(format!("git commit: {}", commit.combined())))
    }

    async fn abort_merge(&self) {
        let _ = self.run("merge --abort").await;
    }
}

/// Merge a task's branch on a remote workspace. Conflicts are surfaced and
/// aborted; SSH merges never attempt AI resolution.
pub async fn merge_remote(
    task: &Task,
    ssh_args: &[String],
    remote_repo: &str,
    container: Option<&str>,
) -> Result<()> {
    let sentinel = sentinel_message(task.id);
    let repo = RemoteGit {
        ssh_args,
        repo: remote_repo,
        container,
    };

    // Auto-commit pending worktree changes.
    if let Some(worktree_path) = task.worktree_path.as_deref() {
        let worktree = RemoteGit {
            ssh_args,
            repo: worktree_path,
            container,
        };
        let valid = worktree
            .run("rev-parse --is-inside-work-tree")
            .await
            .map(|o| o.success())
            .unwrap_or(false);
        if valid {
            worktree.auto_commit_pending(&sentinel).await?;
        }
    }

    let target = target_branch(task);
    if !repo.branch_exists(&target).await? {
        return Err(MergeError::TargetMissing(target));
    }

    let source = task_branch(task.id);
    if !repo.branch_exists(&source).await? {
        return Err(MergeError::NoSource(task.id));
    }

    let checkout = repo.run(&format!("checkout {target}")).await?;
    if !checkout.success() {
        if !repo.is_clean().await? {
            repo.auto_commit_pending(&sentinel).await?;
            let retry = repo.run(&format!("checkout {target}")).await?;
            if !retry.success() {
                return Err(MergeError::Checkout {
                    branch: target,
                    detail: retry.combined(),
                });
            }
        } else {
            return Err(MergeError::Checkout {
                branch: target,
                detail: checkout.combined(),
            });
        }
    }
    repo.auto_commit_pending(&sentinel).await?;

    let ff = repo.run(&format!("merge --ff-only {source}")).await?;
    if ff.success() {
        return Ok(());
    }
    let three_way = repo.run(&format!("merge --no-ff --no-edit {source}")).await?;
    if three_way.success() {
        return Ok(());
    }

    repo.abort_merge().await;
    Err(MergeError::Failed(format!(
        "{} | {}",
        ff.combined(),
        three_way.combined()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_repo;
    use crate::worktree;
    use aitask_core::{BackendKind, TaskStatus};
    use chrono::Utc;

    fn test_task(id: i64, branch: Option<&str>, worktree_path: Option<String>) -> Task {
        Task {
            id,
            title: format!("task-{id}"),
            prompt: "do the thing".to_string(),
            prompt_history: vec!["do the thing".to_string()],
            workspace_id: 1,
            backend: BackendKind::ClaudeCode,
            status: TaskStatus::ToBeReview,
            branch_name: branch.map(String::from),
            worktree_path,
            model: None,
            permission_mode: None,
            run_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fast_forward_merge_from_worktree() {
        let repo = test_repo::init();
        let wt = worktree::provision_local(21, repo.path(), "main", None)
            .await
            .unwrap();
        test_repo::commit_file(Path::new(&wt), "feature.txt", "done", "task work");

        let task = test_task(21, Some("main"), Some(wt.clone()));
        merge_local(&task, repo.path(), true).await.unwrap();

        assert!(repo.path().join("feature.txt").exists());
        worktree::cleanup_local(21, repo.path(), &wt).await;
    }

    #[tokio::test]
    async fn pending_worktree_changes_are_auto_committed() {
        let repo = test_repo::init();
        let wt = worktree::provision_local(22, repo.path(), "main", None)
            .await
            .unwrap();
        // Dirty, uncommitted work in the worktree.
        std::fs::write(Path::new(&wt).join("pending.txt"), "wip").unwrap();

        let task = test_task(22, Some("main"), Some(wt.clone()));
        merge_local(&task, repo.path(), true).await.unwrap();

        assert!(repo.path().join("pending.txt").exists());
        let log = std::process::Command::new("git")
            .args(["-C", &repo.path().to_string_lossy(), "log", "--oneline"])
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout).into_owned();
        assert!(log.contains("chore(task-22): auto-commit pending changes before merge"));

        worktree::cleanup_local(22, repo.path(), &wt).await;
    }

    #[tokio::test]
    async fn diverged_branches_get_a_merge_commit() {
        let repo = test_repo::init();
        let wt = worktree::provision_local(23, repo.path(), "main", None)
            .await
            .unwrap();
        test_repo::commit_file(Path::new(&wt), "task.txt", "task", "task side");
        // Non-conflicting divergence on main.
        test_repo::commit_file(repo.path(), "base.txt", "base", "base side");

        let task = test_task(23, Some("main"), Some(wt.clone()));
        merge_local(&task, repo.path(), true).await.unwrap();

        assert!(repo.path().join("task.txt").exists());
        assert!(repo.path().join("base.txt").exists());
        worktree::cleanup_local(23, repo.path(), &wt).await;
    }

    #[tokio::test]
    async fn dirty_base_workspace_is_auto_committed() {
        let repo = test_repo::init();
        let wt = worktree::provision_local(24, repo.path(), "main", None)
            .await
            .unwrap();
        test_repo::commit_file(Path::new(&wt), "task.txt", "task", "task side");
        std::fs::write(repo.path().join("scratch.txt"), "uncommitted").unwrap();

        let task = test_task(24, Some("main"), Some(wt.clone()));
        merge_local(&task, repo.path(), true).await.unwrap();

        assert!(git::is_clean(repo.path()).await.unwrap());
        assert!(repo.path().join("scratch.txt").exists());
        assert!(repo.path().join("task.txt").exists());
        worktree::cleanup_local(24, repo.path(), &wt).await;
    }

    #[tokio::test]
    async fn conflict_without_ai_surfaces_and_aborts() {
        let repo = test_repo::init();
        test_repo::commit_file(repo.path(), "conflict.txt", "base\n", "seed");
        let wt = worktree::provision_local(25, repo.path(), "main", None)
            .await
            .unwrap();
        test_repo::commit_file(Path::new(&wt), "conflict.txt", "task side\n", "task");
        test_repo::commit_file(repo.path(), "conflict.txt", "base side\n", "base");

        let task = test_task(25, Some("main"), Some(wt.clone()));
        let err = merge_local(&task, repo.path(), false).await.unwrap_err();
        assert!(matches!(err, MergeError::Failed(_)));

        // The base workspace is left without an in-progress merge.
        assert!(!git::merge_in_progress(repo.path()).await);
        assert!(git::unmerged_files(repo.path()).await.unwrap().is_empty());
        worktree::cleanup_local(25, repo.path(), &wt).await;
    }

    #[tokio::test]
    async fn merge_without_worktree_uses_live_branch() {
        let repo = test_repo::init();
        let wt = worktree::provision_local(26, repo.path(), "main", None)
            .await
            .unwrap();
        test_repo::commit_file(Path::new(&wt), "branch-only.txt", "x", "work");
        // Drop the worktree but keep the task branch.
        let out = git::worktree_remove_force(repo.path(), Path::new(&wt))
            .await
            .unwrap();
        assert!(out.success());

        let task = test_task(26, Some("main"), None);
        merge_local(&task, repo.path(), true).await.unwrap();
        assert!(repo.path().join("branch-only.txt").exists());

        let _ = git::branch_delete(repo.path(), "task-26").await;
    }

    #[tokio::test]
    async fn missing_target_branch_is_reported() {
        let repo = test_repo::init();
        let wt = worktree::provision_local(27, repo.path(), "main", None)
            .await
            .unwrap();
        let task = test_task(27, Some("release"), Some(wt.clone()));

        let err = merge_local(&task, repo.path(), true).await.unwrap_err();
        assert!(matches!(err, MergeError::TargetMissing(b) if b == "release"));
        worktree::cleanup_local(27, repo.path(), &wt).await;
    }

    #[tokio::test]
    async fn missing_source_branch_is_reported() {
        let repo = test_repo::init();
        let task = test_task(28, Some("main"), None);
        let err = merge_local(&task, repo.path(), true).await.unwrap_err();
        assert!(matches!(err, MergeError::NoSource(28)));
    }

    #[tokio::test]
    async fn finalize_accepts_manually_resolved_merge() {
        let repo = test_repo::init();
        test_repo::commit_file(repo.path(), "conflict.txt", "base\n", "seed");
        test_repo::run(repo.path(), &["checkout", "-b", "feature"]);
        test_repo::commit_file(repo.path(), "conflict.txt", "feature\n", "feature side");
        test_repo::run(repo.path(), &["checkout", "main"]);
        test_repo::commit_file(repo.path(), "conflict.txt", "main\n", "main side");

        let merge = git::merge_no_ff(repo.path(), "feature").await.unwrap();
        assert!(!merge.success());

        // Simulate a resolver: fix the file and stage it, leave the merge
        // in progress with a non-zero exit.
        std::fs::write(repo.path().join("conflict.txt"), "resolved\n").unwrap();
        test_repo::run(repo.path(), &["add", "conflict.txt"]);

        finalize_resolution(repo.path(), 1, "").await.unwrap();
        assert!(!git::merge_in_progress(repo.path()).await);
        assert!(git::is_clean(repo.path()).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_rejects_remaining_conflicts() {
        let repo = test_repo::init();
        test_repo::commit_file(repo.path(), "conflict.txt", "base\n", "seed");
        test_repo::run(repo.path(), &["checkout", "-b", "feature"]);
        test_repo::commit_file(repo.path(), "conflict.txt", "feature\n", "feature side");
        test_repo::run(repo.path(), &["checkout", "main"]);
        test_repo::commit_file(repo.path(), "conflict.txt", "main\n", "main side");

        let merge = git::merge_no_ff(repo.path(), "feature").await.unwrap();
        assert!(!merge.success());

        let err = finalize_resolution(repo.path(), 0, "tail text")
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Resolution(_)));
        assert!(err.to_string().contains("conflict.txt"));

        git::abort_merge(repo.path()).await;
    }

    #[test]
    fn resolution_prompt_carries_context_and_constraints() {
        let task = test_task(30, Some("main"), None);
        let prompt = resolution_prompt(
            &task,
            Path::new("/repo"),
            "main",
            "task-30",
            "CONFLICT (content): conflict.txt",
        );
        assert!(prompt.contains("/repo"));
        assert!(prompt.contains("task-30"));
        assert!(prompt.contains("Task #30"));
        assert!(prompt.contains("do the thing"));
        assert!(prompt.contains("Do not run reset"));
        assert!(prompt.contains("CONFLICT (content): conflict.txt"));
    }
}
