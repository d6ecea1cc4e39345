//! Plain-text rendering for CLI output.

use aitask_core::{QuotaState, Runner, Task, Workspace};

/// Shorten a string to `max` characters with an ellipsis.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

pub fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("no tasks");
        return;
    }
    println!(
        "{:>5}  {:<13}  {:<12}  {:<30}  {}",
        "ID", "STATUS", "BACKEND", "TITLE", "CREATED"
    );
    for task in tasks {
        println!(
            "{:>5}  {:<13}  {:<12}  {:<30}  {}",
            task.id,
            task.status.as_str(),
            task.backend.as_str(),
            truncate(&task.title, 30),
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

pub fn print_task_detail(task: &Task) {
    println!("Task #{}: {}", task.id, task.title);
    println!("  status:     {}", task.status.as_str());
    println!("  backend:    {}", task.backend.as_str());
    println!("  workspace:  {}", task.workspace_id);
    if let Some(branch) = &task.branch_name {
        println!("  branch:     {branch}");
    }
    if let Some(worktree) = &task.worktree_path {
        println!("  worktree:   {worktree}");
    }
    if let Some(model) = &task.model {
        println!("  model:      {model}");
    }
    if let Some(run_id) = task.run_id {
        println!("  run:        {run_id}");
    }
    println!("  created:    {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  prompt:     {}", truncate(&task.prompt, 100));
    if task.prompt_history.len() > 1 {
        println!("  prompts:    {} total", task.prompt_history.len());
    }
}

pub fn print_workspaces(workspaces: &[Workspace]) {
    if workspaces.is_empty() {
        println!("no workspaces");
        return;
    }
    println!(
        "{:>5}  {:<20}  {:<14}  {:>6}  {}",
        "ID", "NAME", "KIND", "LIMIT", "PATH"
    );
    for ws in workspaces {
        println!(
            "{:>5}  {:<20}  {:<14}  {:>6}  {}",
            ws.workspace_id,
            truncate(&ws.display_name, 20),
            ws.kind.as_str(),
            ws.concurrency_limit,
            ws.path,
        );
    }
}

pub fn print_runners(runners: &[Runner]) {
    if runners.is_empty() {
        println!("no runners");
        return;
    }
    println!(
        "{:>5}  {:<16}  {:<8}  {:>9}  {}",
        "ID", "ENV", "STATUS", "PARALLEL", "CAPABILITIES"
    );
    for runner in runners {
        let caps: Vec<&str> = runner.capabilities.iter().map(|c| c.as_str()).collect();
        println!(
            "{:>5}  {:<16}  {:<8}  {:>9}  {}",
            runner.runner_id,
            truncate(&runner.env, 16),
            runner.status.as_str(),
            runner.max_parallel,
            caps.join(","),
        );
    }
}

pub fn print_quota_states(states: &[QuotaState]) {
    if states.is_empty() {
        println!("no quota records");
        return;
    }
    println!("{:<10}  {:<16}  {}", "PROVIDER", "STATE", "LAST EVENT");
    for state in states {
        let last = state
            .last_event_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10}  {:<16}  {}",
            state.provider,
            state.state.as_str(),
            last
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_limit() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly-ten", 11), "exactly-ten");
        let cut = truncate("a much longer title than allowed", 10);
        assert!(cut.chars().count() <= 10);
        assert!(cut.ends_with('…'));
    }
}
