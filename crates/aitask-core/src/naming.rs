//! Naming conventions for per-task git and tmux resources.

/// Branch a task commits to: `task-<id>`.
pub fn task_branch(task_id: i64) -> String {
    format!("task-{task_id}")
}

/// Default worktree location: sibling of the workspace directory.
pub fn task_worktree_path(workspace_path: &str, task_id: i64) -> String {
    format!("{workspace_path}-task-{task_id}")
}

/// tmux session used for SSH executions: `aitask-<id>`.
pub fn tmux_session_name(task_id: i64) -> String {
    format!("aitask-{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_conventions() {
        assert_eq!(task_branch(7), "task-7");
        assert_eq!(task_worktree_path("/srv/repo", 7), "/srv/repo-task-7");
        assert_eq!(tmux_session_name(7), "aitask-7");
    }
}
