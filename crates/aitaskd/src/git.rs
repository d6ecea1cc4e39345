//! Git operations for the orchestrator daemon.
//!
//! Everything shells out to the standard `git` binary; no embedded VCS.
//! Helpers here are shared by the executor, worktree manager, reconciler,
//! and merge engine.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("empty output from git")]
    EmptyOutput,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Captured output of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout and stderr joined for user-facing failure messages.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out} | {err}"),
        }
    }
}

/// Run `git -C <repo> <args>` and capture output.
pub async fn run_git(repo: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(GitOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run git and fail with the combined output unless it exits 0.
pub async fn run_git_ok(repo: &Path, args: &[&str]) -> Result<GitOutput> {
    let output = run_git(repo, args).await?;
    if !output.success() {
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            output.combined()
        )));
    }
    Ok(output)
}

/// Current branch via `rev-parse --abbrev-ref HEAD`.
pub async fn current_branch(repo: &Path) -> Result<String> {
    let output = run_git_ok(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let branch = output.stdout.trim().to_string();
    if branch.is_empty() {
        return Err(GitError::EmptyOutput);
    }
    Ok(branch)
}

/// Check if a local branch exists.
pub async fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = run_git(
        repo,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )
    .await?;
    Ok(output.success())
}

/// Directory-level check that `path` looks like a git checkout.
pub fn has_git_marker(path: &Path) -> bool {
    path.join(".git").exists()
}

/// A path is a valid worktree when the `.git` marker is present and
/// `rev-parse --is-inside-work-tree` agrees.
pub async fn is_valid_worktree(path: &Path) -> bool {
    if !path.is_dir() || !has_git_marker(path) {
        return false;
    }
    run_git(path, &["rev-parse", "--is-inside-work-tree"])
        .await
        .map(|o| o.success())
        .unwrap_or(false)
}

/// `git status --porcelain` text.
pub async fn status_porcelain(repo: &Path) -> Result<String> {
    let output = run_git_ok(repo, &["status", "--porcelain"]).await?;
    Ok(output.stdout)
}

/// True when the working tree has no pending changes.
pub async fn is_clean(repo: &Path) -> Result<bool> {
    Ok(status_porcelain(repo).await?.trim().is_empty())
}

/// Checkout a branch, returning the raw output for failure analysis.
pub async fn checkout(repo: &Path, branch: &str) -> Result<GitOutput> {
    run_git(repo, &["checkout", branch]).await
}

/// Fast-forward-only merge attempt.
pub async fn merge_ff_only(repo: &Path, source: &str) -> Result<GitOutput> {
    run_git(repo, &["merge", "--ff-only", source]).await
}

/// Three-way merge without an editor.
pub async fn merge_no_ff(repo: &Path, source: &str) -> Result<GitOutput> {
    run_git(repo, &["merge", "--no-ff", "--no-edit", source]).await
}

/// Paths with unresolved conflicts.
pub async fn unmerged_files(repo: &Path) -> Result<Vec<String>> {
    let output = run_git_ok(repo, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// True when a merge is in progress (MERGE_HEAD resolvable).
pub async fn merge_in_progress(repo: &Path) -> bool {
    run_git(repo, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])
        .await
        .map(|o| o.success())
        .unwrap_or(false)
}

/// Abort an in-progress merge; failures are ignored.
pub async fn abort_merge(repo: &Path) {
    let _ = run_git(repo, &["merge", "--abort"]).await;
}

/// Conclude an in-progress merge with the prepared message.
pub async fn commit_no_edit(repo: &Path) -> Result<GitOutput> {
    run_git(repo, &["commit", "--no-edit"]).await
}

/// Stage and commit all pending changes with `message`.
///
/// Returns true when a commit was created. A commit failure with a clean
/// status afterwards is a no-op, not an error.
pub async fn auto_commit_pending(repo: &Path, message: &str) -> Result<bool> {
    if is_clean(repo).await? {
        return Ok(false);
    }
    run_git_ok(repo, &["add", "-A"]).await?;
    let commit = run_git(repo, &["commit", "-m", message]).await?;
    if commit.success() {
        return Ok(true);
    }
    if is_clean(repo).await? {
        return Ok(false);
    }
    Err(GitError::CommandFailed(format!(
        "git commit: {}",
        commit.combined()
    )))
}

/// Delete a local branch with `-D`.
pub async fn branch_delete(repo: &Path, branch: &str) -> Result<GitOutput> {
    run_git(repo, &["branch", "-D", branch]).await
}

/// `git worktree add <path> <branch>` for an existing branch.
pub async fn worktree_add(repo: &Path, path: &Path, branch: &str) -> Result<GitOutput> {
    run_git(
        repo,
        &["worktree", "add", &path.to_string_lossy(), branch],
    )
    .await
}

/// `git worktree add -b <branch> <path> <base>` creating the branch.
pub async fn worktree_add_new_branch(
    repo: &Path,
    path: &Path,
    branch: &str,
    base: &str,
) -> Result<GitOutput> {
    run_git(
        repo,
        &[
            "worktree",
            "add",
            "-b",
            branch,
            &path.to_string_lossy(),
            base,
        ],
    )
    .await
}

/// Force-remove a worktree registration and directory.
pub async fn worktree_remove_force(repo: &Path, path: &Path) -> Result<GitOutput> {
    run_git(
        repo,
        &["worktree", "remove", "--force", &path.to_string_lossy()],
    )
    .await
}

/// Prune stale worktree metadata.
pub async fn worktree_prune(repo: &Path) -> Result<GitOutput> {
    run_git(repo, &["worktree", "prune"]).await
}

#[cfg(test)]
pub(crate) mod test_repo {
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    /// Create a throwaway git repo with one commit on a `main` branch.
    pub fn init() -> TempDir {
        let dir = TempDir::new().unwrap();
        run(dir.path(), &["init", "-b", "main"]);
        run(dir.path(), &["config", "user.email", "test@test.com"]);
        run(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }

    pub fn run(repo: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    pub fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(repo.join(name), content).unwrap();
        run(repo, &["add", name]);
        run(repo, &["commit", "-m", message]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn detects_current_branch() {
        let repo = test_repo::init();
        let branch = current_branch(repo.path()).await.unwrap();
        assert_eq!(branch, "main");
    }

    #[tokio::test]
    async fn branch_exists_after_creation() {
        let repo = test_repo::init();
        assert!(!branch_exists(repo.path(), "task-1").await.unwrap());
        test_repo::run(repo.path(), &["branch", "task-1"]);
        assert!(branch_exists(repo.path(), "task-1").await.unwrap());
    }

    #[tokio::test]
    async fn clean_and_dirty_status() {
        let repo = test_repo::init();
        assert!(is_clean(repo.path()).await.unwrap());
        std::fs::write(repo.path().join("dirty.txt"), "x").unwrap();
        assert!(!is_clean(repo.path()).await.unwrap());
    }

    #[tokio::test]
    async fn auto_commit_pending_commits_dirty_tree() {
        let repo = test_repo::init();
        std::fs::write(repo.path().join("pending.txt"), "work").unwrap();
        let committed = auto_commit_pending(repo.path(), "chore: test auto-commit")
            .await
            .unwrap();
        assert!(committed);
        assert!(is_clean(repo.path()).await.unwrap());

        // Second call is a no-op.
        let committed = auto_commit_pending(repo.path(), "chore: test auto-commit")
            .await
            .unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn ff_merge_succeeds_when_descendant() {
        let repo = test_repo::init();
        test_repo::run(repo.path(), &["checkout", "-b", "feature"]);
        test_repo::commit_file(repo.path(), "f.txt", "f", "feature work");
        test_repo::run(repo.path(), &["checkout", "main"]);

        let out = merge_ff_only(repo.path(), "feature").await.unwrap();
        assert!(out.success(), "{}", out.combined());
        assert!(repo.path().join("f.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_merge_reports_unmerged_files() {
        let repo = test_repo::init();
        test_repo::commit_file(repo.path(), "conflict.txt", "base\n", "base");
        test_repo::run(repo.path(), &["checkout", "-b", "feature"]);
        test_repo::commit_file(repo.path(), "conflict.txt", "feature\n", "feature side");
        test_repo::run(repo.path(), &["checkout", "main"]);
        test_repo::commit_file(repo.path(), "conflict.txt", "main\n", "main side");

        let ff = merge_ff_only(repo.path(), "feature").await.unwrap();
        assert!(!ff.success());
        let merge = merge_no_ff(repo.path(), "feature").await.unwrap();
        assert!(!merge.success());

        let unmerged = unmerged_files(repo.path()).await.unwrap();
        assert_eq!(unmerged, vec!["conflict.txt".to_string()]);
        assert!(merge_in_progress(repo.path()).await);

        abort_merge(repo.path()).await;
        assert!(!merge_in_progress(repo.path()).await);
        assert!(unmerged_files(repo.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn worktree_validity_checks() {
        let repo = test_repo::init();
        assert!(is_valid_worktree(repo.path()).await);

        let plain = TempDir::new().unwrap();
        assert!(!is_valid_worktree(plain.path()).await);
    }
}
