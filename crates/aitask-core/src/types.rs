//! Core entity types for the task orchestrator.
//!
//! Rows are stored in SQLite with integer primary keys; timestamps are UTC
//! and persisted as epoch milliseconds by the daemon's storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    Running,
    ToBeReview,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::Running => "RUNNING",
            Self::ToBeReview => "TO_BE_REVIEW",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TODO" => Some(Self::Todo),
            "RUNNING" => Some(Self::Running),
            "TO_BE_REVIEW" => Some(Self::ToBeReview),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported AI CLI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    ClaudeCode,
    CodexCli,
    CopilotCli,
}

impl BackendKind {
    /// Every backend this build knows how to drive.
    pub const ALL: [Self; 3] = [Self::ClaudeCode, Self::CodexCli, Self::CopilotCli];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude_code",
            Self::CodexCli => "codex_cli",
            Self::CopilotCli => "copilot_cli",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude_code" => Some(Self::ClaudeCode),
            "codex_cli" => Some(Self::CodexCli),
            "copilot_cli" => Some(Self::CopilotCli),
            _ => None,
        }
    }

    /// Name of the CLI executable this backend shells out to.
    pub fn cli_name(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude",
            Self::CodexCli => "codex",
            Self::CopilotCli => "copilot",
        }
    }

    /// Provider label used for quota-state bookkeeping.
    pub fn provider(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude",
            Self::CodexCli => "openai",
            Self::CopilotCli => "github",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runner liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    Online,
    Offline,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(Self::Online),
            "OFFLINE" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Where a workspace lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    Local,
    Ssh,
    SshContainer,
}

impl WorkspaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::SshContainer => "ssh_container",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "ssh" => Some(Self::Ssh),
            "ssh_container" => Some(Self::SshContainer),
            _ => None,
        }
    }

    /// True for both plain SSH and container-over-SSH workspaces.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Ssh | Self::SshContainer)
    }
}

/// Failure classification recorded on a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Code,
    Tool,
    Network,
    Quota,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "CODE",
            Self::Tool => "TOOL",
            Self::Network => "NETWORK",
            Self::Quota => "QUOTA",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CODE" => Some(Self::Code),
            "TOOL" => Some(Self::Tool),
            "NETWORK" => Some(Self::Network),
            "QUOTA" => Some(Self::Quota),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Per-provider quota standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaStateValue {
    Ok,
    QuotaExhausted,
    Unknown,
}

impl QuotaStateValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::QuotaExhausted => "QUOTA_EXHAUSTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "QUOTA_EXHAUSTED" => Some(Self::QuotaExhausted),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// A user request: prompt + workspace + backend, moving through
/// Todo -> Running -> ToBeReview -> Done | Failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    /// Current instruction; always equals the last prompt_history entry.
    pub prompt: String,
    /// Ordered sequence of every prompt this task has run with.
    pub prompt_history: Vec<String>,
    pub workspace_id: i64,
    pub backend: BackendKind,
    pub status: TaskStatus,
    /// Base branch the task branches from and merges back into.
    pub branch_name: Option<String>,
    /// Per-task worktree location once provisioned.
    pub worktree_path: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Current/last run, if any.
    pub run_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A git repository location tasks operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: i64,
    /// Canonical path; unique. Absolute filesystem path for Local,
    /// `ssh://user@host:port/path` shaped identifier for SSH kinds.
    pub path: String,
    pub display_name: String,
    pub kind: WorkspaceKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssh_user: Option<String>,
    pub container_name: Option<String>,
    pub login_shell: Option<String>,
    pub runner_id: i64,
    pub concurrency_limit: u32,
}

/// A labeled execution endpoint advertising backend capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub runner_id: i64,
    pub env: String,
    pub capabilities: Vec<BackendKind>,
    pub status: RunnerStatus,
    pub heartbeat_at: DateTime<Utc>,
    pub max_parallel: u32,
}

/// A single execution attempt of a task; owns the durable log and exit data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: i64,
    pub task_id: i64,
    pub runner_id: i64,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_class: Option<ErrorClass>,
    /// Append-only log text, flushed incrementally while the run lives.
    pub log_blob: Option<String>,
    /// Opaque JSON with metrics the adapter extracted.
    pub usage_json: Option<String>,
    /// tmux session label, set only for SSH executions.
    pub tmux_session: Option<String>,
}

/// Per-provider quota record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaState {
    pub id: i64,
    pub provider: String,
    pub account_label: String,
    pub state: QuotaStateValue,
    pub last_event_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// Keyed string setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSetting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::Running,
            TaskStatus::ToBeReview,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("CANCELLED"), None);
    }

    #[test]
    fn backend_kind_labels() {
        assert_eq!(BackendKind::ClaudeCode.as_str(), "claude_code");
        assert_eq!(BackendKind::ClaudeCode.cli_name(), "claude");
        assert_eq!(BackendKind::parse("codex_cli"), Some(BackendKind::CodexCli));
        assert_eq!(BackendKind::parse("gemini_cli"), None);
    }

    #[test]
    fn workspace_kind_remote() {
        assert!(!WorkspaceKind::Local.is_remote());
        assert!(WorkspaceKind::Ssh.is_remote());
        assert!(WorkspaceKind::SshContainer.is_remote());
    }

    #[test]
    fn status_serde_uses_wire_literals() {
        let json = serde_json::to_string(&TaskStatus::ToBeReview).unwrap();
        assert_eq!(json, "\"TO_BE_REVIEW\"");
        let back: TaskStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(back, TaskStatus::Failed);
    }
}
