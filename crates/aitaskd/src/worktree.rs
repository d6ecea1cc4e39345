//! Per-task git worktree provisioning and cleanup.
//!
//! Each task gets a worktree at `<workspace>-task-<id>` on branch
//! `task-<id>`. Provisioning is idempotent: a valid existing worktree is
//! reused, an empty stale directory is removed, and a non-empty invalid
//! path is sidestepped with a `-recovered` fallback. Cleanup steps are
//! independent and best-effort.

use aitask_core::{task_branch, task_worktree_path};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::git;
use crate::ssh;

/// Wall-clock ceiling for short git probes on a remote host.
const REMOTE_GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh::SshError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create worktree: {0}")]
    Provision(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// First `-recovered[-N]` suffix of `path` that does not exist yet.
fn pick_recovery_path(path: &str) -> String {
    let mut candidate = format!("{path}-recovered");
    let mut idx = 1;
    while Path::new(&candidate).exists() {
        candidate = format!("{path}-recovered-{idx}");
        idx += 1;
    }
    candidate
}

/// Provision (or reuse) the worktree for a task in a local workspace.
///
/// Returns the worktree path actually used, which may differ from the
/// desired path when a recovery fallback was needed.
pub async fn provision_local(
    task_id: i64,
    workspace_path: &Path,
    base_branch: &str,
    desired_path: Option<&str>,
) -> Result<String> {
    let workspace = workspace_path.to_string_lossy();
    let mut worktree_path = desired_path
        .map(String::from)
        .unwrap_or_else(|| task_worktree_path(&workspace, task_id));
    let branch = task_branch(task_id);

    let path = Path::new(&worktree_path);
    if path.is_dir() {
        if git::is_valid_worktree(path).await {
            info!(task_id, path = %worktree_path, "reusing existing worktree");
            return Ok(worktree_path);
        }
        let is_empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            std::fs::remove_dir(path)?;
            warn!(task_id, path = %worktree_path, "removed empty invalid worktree directory");
        } else {
            let fallback = pick_recovery_path(&worktree_path);
            warn!(
                task_id,
                path = %worktree_path,
                fallback = %fallback,
                "path is not a valid worktree; using fallback path"
            );
            worktree_path = fallback;
        }
    } else if path.exists() {
        let fallback = pick_recovery_path(&worktree_path);
        warn!(
            task_id,
            path = %worktree_path,
            fallback = %fallback,
            "path is not a directory; using fallback path"
        );
        worktree_path = fallback;
    }

    let output = if git::branch_exists(workspace_path, &branch).await? {
        info!(task_id, branch = %branch, path = %worktree_path, "checking out existing task branch");
        git::worktree_add(workspace_path, Path::new(&worktree_path), &branch).await?
    } else {
        git::worktree_add_new_branch(
            workspace_path,
            Path::new(&worktree_path),
            &branch,
            base_branch,
        )
        .await?
    };
    if !output.success() {
        return Err(WorktreeError::Provision(output.combined()));
    }

    info!(task_id, path = %worktree_path, "created worktree");
    Ok(worktree_path)
}

/// Best-effort cleanup of a local task worktree and its branch.
///
/// Every step runs regardless of earlier failures; errors are logged as
/// warnings.
pub async fn cleanup_local(task_id: i64, workspace_path: &Path, worktree_path: &str) {
    let branch = task_branch(task_id);
    let path = Path::new(worktree_path);

    match git::worktree_remove_force(workspace_path, path).await {
        Ok(out) if !out.success() => {
            warn!(task_id, "git worktree remove failed: {}", out.combined());
        }
        Err(err) => warn!(task_id, error = %err, "git worktree remove failed"),
        Ok(_) => {}
    }

    if let Err(err) = git::worktree_prune(workspace_path).await {
        warn!(task_id, error = %err, "git worktree prune failed");
    }

    if path.is_dir() {
        let is_empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            if let Err(err) = std::fs::remove_dir(path) {
                warn!(task_id, error = %err, "failed to remove stale worktree directory");
            }
        }
    }

    match git::branch_delete(workspace_path, &branch).await {
        Ok(out) if !out.success() => {
            warn!(task_id, branch = %branch, "git branch -D failed: {}", out.combined());
        }
        Err(err) => warn!(task_id, branch = %branch, error = %err, "git branch -D failed"),
        Ok(_) => {}
    }
}

fn wrap_for_workspace(cmd: &str, container: Option<&str>) -> String {
    match container {
        Some(container) => ssh::wrap_container(cmd, container, None),
        None => cmd.to_string(),
    }
}

async fn remote_is_valid_worktree(
    ssh_args: &[String],
    path: &str,
    container: Option<&str>,
) -> bool {
    let cmd = wrap_for_workspace(
        &format!(
            "test -e {p}/.git && git -C {p} rev-parse --is-inside-work-tree",
            p = ssh::shell_quote(path)
        ),
        container,
    );
    ssh::probe(ssh_args, &cmd, REMOTE_GIT_TIMEOUT).await.is_some()
}

async fn remote_path_exists(ssh_args: &[String], path: &str, container: Option<&str>) -> bool {
    let cmd = wrap_for_workspace(&format!("test -e {}", ssh::shell_quote(path)), container);
    ssh::probe(ssh_args, &cmd, REMOTE_GIT_TIMEOUT).await.is_some()
}

/// Provision (or reuse) the worktree for a task on a remote workspace.
pub async fn provision_remote(
    task_id: i64,
    ssh_args: &[String],
    remote_repo_path: &str,
    base_branch: &str,
    container: Option<&str>,
    desired_path: Option<&str>,
) -> Result<String> {
    let mut worktree_path = desired_path
        .map(String::from)
        .unwrap_or_else(|| task_worktree_path(remote_repo_path, task_id));
    let branch = task_branch(task_id);

    if remote_is_valid_worktree(ssh_args, &worktree_path, container).await {
        info!(task_id, path = %worktree_path, "reusing existing remote worktree");
        return Ok(worktree_path);
    }
    if remote_path_exists(ssh_args, &worktree_path, container).await {
        // Remove it when empty, otherwise sidestep to a recovery path.
        let rmdir = wrap_for_workspace(
            &format!("rmdir {}", ssh::shell_quote(&worktree_path)),
            container,
        );
        if ssh::probe(ssh_args, &rmdir, REMOTE_GIT_TIMEOUT).await.is_none() {
            let mut candidate = format!("{worktree_path}-recovered");
            let mut idx = 1;
            while remote_path_exists(ssh_args, &candidate, container).await {
                candidate = format!("{worktree_path}-recovered-{idx}");
                idx += 1;
            }
            warn!(
                task_id,
                path = %worktree_path,
                fallback = %candidate,
                "remote path is not a valid worktree; using fallback path"
            );
            worktree_path = candidate;
        }
    }

    let branch_probe = wrap_for_workspace(
        &format!(
            "git -C {} rev-parse --verify refs/heads/{branch}",
            ssh::shell_quote(remote_repo_path)
        ),
        container,
    );
    let branch_present = ssh::probe(ssh_args, &branch_probe, REMOTE_GIT_TIMEOUT)
        .await
        .is_some();

    let add_cmd = if branch_present {
        format!(
            "git -C {} worktree add {} {branch}",
            ssh::shell_quote(remote_repo_path),
            ssh::shell_quote(&worktree_path)
        )
    } else {
        format!(
            "git -C {} worktree add -b {branch} {} {}",
            ssh::shell_quote(remote_repo_path),
            ssh::shell_quote(&worktree_path),
            ssh::shell_quote(base_branch)
        )
    };
    let output = ssh::exec(
        ssh_args,
        &wrap_for_workspace(&add_cmd, container),
        Some(REMOTE_GIT_TIMEOUT),
    )
    .await?;
    if !output.success() {
        return Err(WorktreeError::Provision(output.combined()));
    }

    info!(task_id, path = %worktree_path, "created remote worktree");
    Ok(worktree_path)
}

/// Best-effort cleanup of a remote task worktree and branch.
pub async fn cleanup_remote(
    task_id: i64,
    ssh_args: &[String],
    remote_repo_path: &str,
    worktree_path: &str,
    container: Option<&str>,
) {
    let branch = task_branch(task_id);
    let steps = [
        format!(
            "git -C {} worktree remove --force {}",
            ssh::shell_quote(remote_repo_path),
            ssh::shell_quote(worktree_path)
        ),
        format!("git -C {} worktree prune", ssh::shell_quote(remote_repo_path)),
        format!(
            "git -C {} branch -D {branch}",
            ssh::shell_quote(remote_repo_path)
        ),
    ];
    for step in steps {
        let cmd = wrap_for_workspace(&step, container);
        match ssh::exec(ssh_args, &cmd, Some(REMOTE_GIT_TIMEOUT)).await {
            Ok(out) if !out.success() => {
                warn!(task_id, step = %step, "remote cleanup step failed: {}", out.combined());
            }
            Err(err) => warn!(task_id, step = %step, error = %err, "remote cleanup step failed"),
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_repo;

    #[tokio::test]
    async fn provisions_worktree_and_branch_from_base() {
        let repo = test_repo::init();
        let path = provision_local(11, repo.path(), "main", None).await.unwrap();

        assert!(path.ends_with("-task-11"));
        assert!(git::is_valid_worktree(Path::new(&path)).await);
        assert!(git::branch_exists(repo.path(), "task-11").await.unwrap());
        assert!(Path::new(&path).join("README.md").exists());

        cleanup_local(11, repo.path(), &path).await;
        assert!(!Path::new(&path).exists());
        assert!(!git::branch_exists(repo.path(), "task-11").await.unwrap());
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let repo = test_repo::init();
        let first = provision_local(12, repo.path(), "main", None).await.unwrap();
        let marker = Path::new(&first).join("marker.txt");
        std::fs::write(&marker, "keep me").unwrap();

        let second = provision_local(12, repo.path(), "main", Some(&first))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(marker.exists());

        cleanup_local(12, repo.path(), &first).await;
    }

    #[tokio::test]
    async fn empty_stale_directory_is_replaced() {
        let repo = test_repo::init();
        let desired = task_worktree_path(&repo.path().to_string_lossy(), 13);
        std::fs::create_dir_all(&desired).unwrap();

        let path = provision_local(13, repo.path(), "main", None).await.unwrap();
        assert_eq!(path, desired);
        assert!(git::is_valid_worktree(Path::new(&path)).await);

        cleanup_local(13, repo.path(), &path).await;
    }

    #[tokio::test]
    async fn non_empty_invalid_path_falls_back_to_recovered() {
        let repo = test_repo::init();
        let desired = task_worktree_path(&repo.path().to_string_lossy(), 14);
        std::fs::create_dir_all(&desired).unwrap();
        std::fs::write(Path::new(&desired).join("junk.txt"), "junk").unwrap();

        let path = provision_local(14, repo.path(), "main", None).await.unwrap();
        assert_eq!(path, format!("{desired}-recovered"));
        assert!(git::is_valid_worktree(Path::new(&path)).await);
        // The junk directory is left alone.
        assert!(Path::new(&desired).join("junk.txt").exists());

        cleanup_local(14, repo.path(), &path).await;
    }

    #[tokio::test]
    async fn existing_task_branch_is_checked_out_not_recreated() {
        let repo = test_repo::init();
        let first = provision_local(15, repo.path(), "main", None).await.unwrap();

        // Commit on the task branch, then drop only the directory.
        test_repo::commit_file(Path::new(&first), "work.txt", "wip", "task work");
        let out = git::worktree_remove_force(repo.path(), Path::new(&first))
            .await
            .unwrap();
        assert!(out.success(), "{}", out.combined());

        // Re-provisioning must reuse the surviving branch with its commit.
        let second = provision_local(15, repo.path(), "main", None).await.unwrap();
        assert!(Path::new(&second).join("work.txt").exists());

        cleanup_local(15, repo.path(), &second).await;
    }

    #[test]
    fn recovery_path_skips_existing_candidates() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("wt").to_string_lossy().into_owned();
        std::fs::create_dir_all(format!("{base}-recovered")).unwrap();
        std::fs::create_dir_all(format!("{base}-recovered-1")).unwrap();
        assert_eq!(pick_recovery_path(&base), format!("{base}-recovered-2"));
    }
}
