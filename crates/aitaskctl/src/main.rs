//! aitaskctl - CLI client for the aitaskd orchestrator daemon.

mod client;
mod render;

use aitask_core::{BackendKind, TaskStatus};
use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateTaskRequest, CreateWorkspaceRequest};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// CLI client for the aitaskd orchestrator daemon.
#[derive(Parser)]
#[command(name = "aitaskctl")]
#[command(about = "Control plane for the aitask orchestrator")]
#[command(version)]
struct Cli {
    /// Daemon address.
    #[arg(long, global = true, env = "AITASKD_ADDR", default_value = "http://127.0.0.1:8000")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(s).ok_or_else(|| {
        format!("unknown status '{s}' (expected TODO, RUNNING, TO_BE_REVIEW, DONE, or FAILED)")
    })
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    BackendKind::parse(s).ok_or_else(|| {
        format!("unknown backend '{s}' (expected claude_code, codex_cli, or copilot_cli)")
    })
}

#[derive(Subcommand)]
enum Command {
    /// List tasks (optionally filtered)
    List {
        /// Filter by status (TODO, RUNNING, TO_BE_REVIEW, DONE, FAILED)
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,

        /// Filter by workspace id
        #[arg(long)]
        workspace: Option<i64>,
    },

    /// Create a new task
    Create {
        /// Workspace id the task runs in
        #[arg(long)]
        workspace: i64,

        /// Task title
        #[arg(long)]
        title: String,

        /// Natural-language instruction for the agent
        #[arg(long)]
        prompt: String,

        /// Backend CLI: claude_code, codex_cli, or copilot_cli
        #[arg(long, default_value = "claude_code", value_parser = parse_backend)]
        backend: BackendKind,

        /// Base branch (auto-detected when omitted)
        #[arg(long)]
        branch: Option<String>,

        /// Backend-specific model
        #[arg(long)]
        model: Option<String>,

        /// Backend-specific permission mode
        #[arg(long)]
        permission_mode: Option<String>,
    },

    /// Show one task in detail
    Show {
        task_id: i64,
    },

    /// Cancel a task
    Cancel {
        task_id: i64,
    },

    /// Retry a failed task in place
    Retry {
        task_id: i64,
    },

    /// Re-queue a task with new instructions
    Continue {
        task_id: i64,

        /// New instruction (appended to the prompt history)
        #[arg(long)]
        prompt: String,

        /// Override the model
        #[arg(long)]
        model: Option<String>,
    },

    /// Merge a reviewed task back into its base branch
    Merge {
        task_id: i64,
    },

    /// Mark a reviewed task done without merging
    #[command(name = "mark-done")]
    MarkDone {
        task_id: i64,
    },

    /// Delete a task and its runs
    Delete {
        task_id: i64,
    },

    /// Print (or follow) the log of a run
    Logs {
        run_id: i64,

        /// Stream incrementally until the run completes
        #[arg(short, long)]
        follow: bool,
    },

    /// List workspaces
    Workspaces,

    /// Register a workspace
    #[command(name = "workspace-add")]
    WorkspaceAdd {
        /// Path: local directory, or remote path for SSH kinds
        path: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// Workspace kind: local, ssh, or ssh_container
        #[arg(long, default_value = "local")]
        kind: String,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        container: Option<String>,
    },

    /// List runners and their capabilities
    Runners,

    /// Show per-provider quota standing
    Quota,

    /// Show or update app settings
    Settings {
        /// New workspace_max_parallel value (clamped to [1, 20])
        #[arg(long)]
        max_parallel: Option<u32>,
    },
}

async fn run(cli: Cli) -> Result<(), ClientError> {
    let client = Client::new(&cli.addr);

    match cli.command {
        Command::List { status, workspace } => {
            let tasks = client.list_tasks(status, workspace).await?;
            render::print_tasks(&tasks);
        }
        Command::Create {
            workspace,
            title,
            prompt,
            backend,
            branch,
            model,
            permission_mode,
        } => {
            let task = client
                .create_task(&CreateTaskRequest {
                    title,
                    prompt,
                    workspace_id: workspace,
                    backend,
                    branch_name: branch,
                    model,
                    permission_mode,
                })
                .await?;
            println!("created task {}", task.id);
            render::print_task_detail(&task);
        }
        Command::Show { task_id } => {
            let task = client.get_task(task_id).await?;
            render::print_task_detail(&task);
        }
        Command::Cancel { task_id } => {
            client.cancel_task(task_id).await?;
            println!("task {task_id} cancelled");
        }
        Command::Retry { task_id } => {
            let task = client.retry_task(task_id).await?;
            println!("task {} re-queued", task.id);
        }
        Command::Continue {
            task_id,
            prompt,
            model,
        } => {
            let task = client
                .continue_task(task_id, &prompt, model.as_deref())
                .await?;
            println!(
                "task {} re-queued with new instructions ({} prompts total)",
                task.id,
                task.prompt_history.len()
            );
        }
        Command::Merge { task_id } => {
            let task = client.merge_task(task_id).await?;
            println!("task {} merged, status {}", task.id, task.status.as_str());
        }
        Command::MarkDone { task_id } => {
            let task = client.mark_task_done(task_id).await?;
            println!("task {} marked done", task.id);
        }
        Command::Delete { task_id } => {
            client.delete_task(task_id).await?;
            println!("task {task_id} deleted");
        }
        Command::Logs { run_id, follow } => {
            if follow {
                client
                    .follow_logs(run_id, |frame| match frame.event.as_str() {
                        "log" => {
                            if let Ok(value) =
                                serde_json::from_str::<serde_json::Value>(&frame.data)
                            {
                                if let Some(content) = value["content"].as_str() {
                                    print!("{content}");
                                }
                            }
                        }
                        "complete" => {
                            if let Ok(value) =
                                serde_json::from_str::<serde_json::Value>(&frame.data)
                            {
                                eprintln!(
                                    "\n[run {} complete, exit code {}]",
                                    run_id, value["exit_code"]
                                );
                            }
                        }
                        _ => {}
                    })
                    .await?;
            } else {
                let snapshot = client.get_logs(run_id).await?;
                print!("{}", snapshot.log_blob);
                if let Some(code) = snapshot.exit_code {
                    eprintln!("[run {} exited with code {code}]", snapshot.run_id);
                }
            }
        }
        Command::Workspaces => {
            let workspaces = client.list_workspaces().await?;
            render::print_workspaces(&workspaces);
        }
        Command::WorkspaceAdd {
            path,
            name,
            kind,
            host,
            port,
            user,
            container,
        } => {
            let workspace = client
                .create_workspace(&CreateWorkspaceRequest {
                    path,
                    display_name: name,
                    kind,
                    host,
                    port,
                    ssh_user: user,
                    container_name: container,
                })
                .await?;
            println!(
                "created workspace {} ({})",
                workspace.workspace_id, workspace.path
            );
        }
        Command::Runners => {
            let runners = client.list_runners().await?;
            render::print_runners(&runners);
        }
        Command::Quota => {
            let states = client.list_quota_states().await?;
            render::print_quota_states(&states);
        }
        Command::Settings { max_parallel } => {
            let settings = match max_parallel {
                Some(value) => client.put_settings(value).await?,
                None => client.get_settings().await?,
            };
            println!("workspace_max_parallel = {}", settings.workspace_max_parallel);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
