//! Drift reconciliation between DB state and on-disk git state.
//!
//! For every non-running task in a local workspace, a recorded worktree
//! path that no longer exists (or stopped being a valid worktree) is
//! cleaned up and the reference cleared. Review states are never advanced
//! here: a ToBeReview task whose branch merged externally stays put until
//! the user acts.

use aitask_core::{TaskStatus, WorkspaceKind};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::git;
use crate::storage::{Result, Storage};

#[derive(Debug)]
pub struct Reconciler {
    storage: Arc<Storage>,
}

impl Reconciler {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// One reconciliation pass. Returns the number of repaired tasks; all
    /// reference clears commit together.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let tasks = self.storage.list_tasks(None, None).await?;
        let mut workspaces: HashMap<i64, aitask_core::Workspace> = HashMap::new();
        let mut to_clear: Vec<i64> = Vec::new();

        for task in tasks {
            if task.status == TaskStatus::Running {
                continue;
            }
            let Some(worktree_path) = task.worktree_path.as_deref() else {
                continue;
            };

            let workspace = match workspaces.get(&task.workspace_id) {
                Some(ws) => ws.clone(),
                None => match self.storage.get_workspace(task.workspace_id).await {
                    Ok(ws) => {
                        workspaces.insert(task.workspace_id, ws.clone());
                        ws
                    }
                    Err(err) => {
                        warn!(task_id = task.id, error = %err, "workspace missing during reconcile");
                        continue;
                    }
                },
            };
            if workspace.kind != WorkspaceKind::Local {
                continue;
            }

            if self
                .should_clear(Path::new(&workspace.path), Path::new(worktree_path))
                .await
            {
                info!(
                    task_id = task.id,
                    worktree = %worktree_path,
                    "clearing invalid or stale worktree reference"
                );
                to_clear.push(task.id);
            }
        }

        let repaired = to_clear.len();
        self.storage.clear_task_worktrees(&to_clear).await?;
        Ok(repaired)
    }

    async fn should_clear(&self, workspace_path: &Path, worktree_path: &Path) -> bool {
        if !worktree_path.exists() {
            if let Err(err) = git::worktree_prune(workspace_path).await {
                warn!(error = %err, "git worktree prune failed");
            }
            return true;
        }
        if !worktree_path.is_dir() {
            return true;
        }
        if git::is_valid_worktree(worktree_path).await {
            return false;
        }

        // Invalid checkout: drop the registration, then the directory if
        // nothing is left in it.
        if let Err(err) = git::worktree_remove_force(workspace_path, worktree_path).await {
            warn!(error = %err, "git worktree remove failed");
        }
        if let Err(err) = git::worktree_prune(workspace_path).await {
            warn!(error = %err, "git worktree prune failed");
        }
        if worktree_path.is_dir() {
            let is_empty = std::fs::read_dir(worktree_path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if is_empty {
                if let Err(err) = std::fs::remove_dir(worktree_path) {
                    warn!(error = %err, "failed to remove stale directory");
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_repo;
    use crate::storage::test_store::{create, new_task, seed_workspace};
    use crate::worktree;

    #[tokio::test]
    async fn clears_reference_to_missing_directory() {
        let repo = test_repo::init();
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (_, ws) = seed_workspace(&storage, &repo.path().to_string_lossy()).await;
        let task = storage.insert_task(new_task(ws, "t")).await.unwrap();
        storage
            .set_task_worktree(task.id, Some("/nonexistent/worktree-task-1"))
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&storage));
        let repaired = reconciler.reconcile_once().await.unwrap();
        assert_eq!(repaired, 1);

        let task = storage.get_task(task.id).await.unwrap();
        assert!(task.worktree_path.is_none());
    }

    #[tokio::test]
    async fn leaves_valid_worktree_alone() {
        let repo = test_repo::init();
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (_, ws) = seed_workspace(&storage, &repo.path().to_string_lossy()).await;
        let task = storage.insert_task(new_task(ws, "t")).await.unwrap();
        let path = worktree::provision_local(task.id, repo.path(), "main", None)
            .await
            .unwrap();
        storage
            .set_task_worktree(task.id, Some(&path))
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&storage));
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
        let task = storage.get_task(task.id).await.unwrap();
        assert_eq!(task.worktree_path.as_deref(), Some(path.as_str()));

        worktree::cleanup_local(task.id, repo.path(), &path).await;
    }

    #[tokio::test]
    async fn cleans_invalid_directory_and_is_idempotent() {
        let repo = test_repo::init();
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (_, ws) = seed_workspace(&storage, &repo.path().to_string_lossy()).await;
        let task = storage.insert_task(new_task(ws, "t")).await.unwrap();

        // A directory that is not a worktree at all.
        let bogus = repo.path().parent().unwrap().join("bogus-worktree");
        std::fs::create_dir_all(&bogus).unwrap();
        storage
            .set_task_worktree(task.id, Some(&bogus.to_string_lossy()))
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&storage));
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);
        assert!(storage.get_task(task.id).await.unwrap().worktree_path.is_none());
        // Empty invalid directory was removed.
        assert!(!bogus.exists());

        // A second pass finds nothing to repair.
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn never_advances_review_state() {
        let repo = test_repo::init();
        let ts = create().await;
        let storage = Arc::new(ts.storage);
        let (_, ws) = seed_workspace(&storage, &repo.path().to_string_lossy()).await;
        let task = storage.insert_task(new_task(ws, "t")).await.unwrap();
        storage
            .update_task_status(task.id, TaskStatus::ToBeReview)
            .await
            .unwrap();
        storage
            .set_task_worktree(task.id, Some("/nonexistent/worktree"))
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&storage));
        reconciler.reconcile_once().await.unwrap();

        // The stale reference is repaired but the status stays ToBeReview.
        let task = storage.get_task(task.id).await.unwrap();
        assert!(task.worktree_path.is_none());
        assert_eq!(task.status, TaskStatus::ToBeReview);
    }
}
