//! Backend adapters: one per supported AI CLI.
//!
//! Each adapter assembles an argv list plus stdin payload, watches the
//! output stream for usage metrics and quota signals, and classifies the
//! exit code. The stream always terminates with a
//! `[Process exited with code N]` sentinel line so downstream consumers can
//! recover the code from the log text alone.

pub mod claude_code;
pub mod codex;
pub mod copilot;
pub mod driver;
pub mod resolver;

use aitask_core::{BackendKind, ErrorClass};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub use driver::CancelProbe;

use claude_code::ClaudeCodeAdapter;
use codex::CodexAdapter;
use copilot::CopilotAdapter;

const EXIT_SENTINEL_PREFIX: &str = "[Process exited with code ";

/// The terminating log line carrying the exit code.
pub fn exit_sentinel(code: i32) -> String {
    format!("\n{EXIT_SENTINEL_PREFIX}{code}]\n")
}

/// Recover an exit code from a sentinel line, if present.
pub fn parse_exit_sentinel(line: &str) -> Option<i32> {
    let start = line.find(EXIT_SENTINEL_PREFIX)? + EXIT_SENTINEL_PREFIX.len();
    let rest = &line[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

/// Final result of consuming an adapter's stream.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub exit_code: i32,
    pub success: bool,
    pub error_class: Option<ErrorClass>,
    pub usage: Option<serde_json::Value>,
    pub is_quota_error: bool,
}

/// Dispatching wrapper over the per-CLI adapters.
#[derive(Debug)]
pub enum Adapter {
    ClaudeCode(ClaudeCodeAdapter),
    Codex(CodexAdapter),
    Copilot(CopilotAdapter),
}

impl Adapter {
    pub fn for_task(
        backend: BackendKind,
        workspace_path: PathBuf,
        model: Option<String>,
        permission_mode: Option<String>,
    ) -> Self {
        match backend {
            BackendKind::ClaudeCode => {
                Self::ClaudeCode(ClaudeCodeAdapter::new(workspace_path, model, permission_mode))
            }
            BackendKind::CodexCli => Self::Codex(CodexAdapter::new(workspace_path, model)),
            BackendKind::CopilotCli => Self::Copilot(CopilotAdapter::new(workspace_path, model)),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Self::ClaudeCode(_) => BackendKind::ClaudeCode,
            Self::Codex(_) => BackendKind::CodexCli,
            Self::Copilot(_) => BackendKind::CopilotCli,
        }
    }

    fn workspace_path(&self) -> &Path {
        match self {
            Self::ClaudeCode(a) => a.workspace_path(),
            Self::Codex(a) => a.workspace_path(),
            Self::Copilot(a) => a.workspace_path(),
        }
    }

    /// Assemble the argv list for `prompt`.
    pub fn build_command(&self, prompt: &str) -> resolver::Result<Vec<String>> {
        match self {
            Self::ClaudeCode(a) => a.build_command(),
            Self::Codex(a) => a.build_command(),
            Self::Copilot(a) => a.build_command(prompt),
        }
    }

    /// Whether the prompt travels on stdin (vs the command line).
    fn wants_stdin(&self) -> bool {
        !matches!(self, Self::Copilot(_))
    }

    fn env_remove(&self) -> &'static [&'static str] {
        match self {
            // The CLI refuses to nest inside an existing session otherwise.
            Self::ClaudeCode(_) => &["CLAUDECODE"],
            _ => &[],
        }
    }

    fn observe_line(&mut self, line: &str) {
        match self {
            Self::ClaudeCode(a) => a.observe_line(line),
            Self::Codex(a) => a.observe_line(line),
            Self::Copilot(a) => a.observe_line(line),
        }
    }

    /// Classify an exit code into `(success, error_class)`.
    pub fn parse_exit_code(&self, code: i32) -> (bool, Option<ErrorClass>) {
        match self {
            Self::ClaudeCode(a) => a.parse_exit_code(code),
            Self::Codex(a) => a.parse_exit_code(code),
            Self::Copilot(a) => a.parse_exit_code(code),
        }
    }

    pub fn usage_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::ClaudeCode(a) => a.usage_data(),
            Self::Codex(a) => a.usage_data(),
            Self::Copilot(_) => None,
        }
    }

    pub fn is_quota_error(&self) -> bool {
        match self {
            Self::ClaudeCode(a) => a.is_quota_error(),
            Self::Codex(a) => a.is_quota_error(),
            Self::Copilot(a) => a.is_quota_error(),
        }
    }

    fn outcome(&self, exit_code: i32) -> AdapterOutcome {
        let (success, error_class) = self.parse_exit_code(exit_code);
        AdapterOutcome {
            exit_code,
            success,
            error_class,
            usage: self.usage_data().cloned(),
            is_quota_error: self.is_quota_error(),
        }
    }

    /// Drive the CLI to completion, forwarding output lines to `tx`.
    ///
    /// The stream always ends with the exit sentinel. A CLI that cannot be
    /// resolved behaves like exit 127 without spawning anything.
    pub async fn execute(
        mut self,
        prompt: String,
        cancel: CancelProbe,
        tx: mpsc::Sender<String>,
    ) -> AdapterOutcome {
        let argv = match self.build_command(&prompt) {
            Ok(argv) => argv,
            Err(err) => {
                let _ = tx.send(format!("[ERROR] {err}\n")).await;
                let _ = tx.send(exit_sentinel(127)).await;
                return self.outcome(127);
            }
        };

        let cli_name = self.backend().cli_name();
        let cwd = self.workspace_path().to_path_buf();
        let env_remove = self.env_remove();
        let stdin_data = self.wants_stdin().then_some(prompt.as_str());

        let mut observe = |line: &str| self.observe_line(line);
        let result = driver::run_with_fallback(
            cli_name,
            &argv,
            &cwd,
            env_remove,
            stdin_data,
            &cancel,
            &mut observe,
            &tx,
        )
        .await;

        let exit_code = match result {
            Ok(code) => code,
            Err(err) => {
                let _ = tx.send(format!("[ERROR] failed to run {cli_name}: {err}\n")).await;
                if err.kind() == std::io::ErrorKind::NotFound {
                    127
                } else {
                    1
                }
            }
        };

        let _ = tx.send(exit_sentinel(exit_code)).await;
        self.outcome(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_round_trips() {
        let line = exit_sentinel(42);
        assert_eq!(parse_exit_sentinel(&line), Some(42));
        assert_eq!(parse_exit_sentinel("[Process exited with code 0]"), Some(0));
        assert_eq!(parse_exit_sentinel("plain output"), None);
    }

    #[test]
    fn for_task_dispatches_by_backend() {
        for backend in BackendKind::ALL {
            let adapter = Adapter::for_task(backend, PathBuf::from("/tmp"), None, None);
            assert_eq!(adapter.backend(), backend);
        }
    }

    #[tokio::test]
    async fn unresolvable_cli_yields_127_without_spawning() {
        // None of the backend CLIs should be resolvable under an empty PATH;
        // pick copilot, whose prompt rides the argv.
        let adapter = Adapter::for_task(
            BackendKind::CopilotCli,
            PathBuf::from("/nonexistent-workspace"),
            None,
            None,
        );
        // Force resolution failure regardless of the host machine.
        if adapter.build_command("hi").is_ok() {
            // CLI actually installed here; nothing to assert.
            return;
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let cancel: CancelProbe = std::sync::Arc::new(|| false);
        let outcome = adapter.execute("hi".to_string(), cancel, tx).await;

        assert_eq!(outcome.exit_code, 127);
        assert!(!outcome.success);
        assert_eq!(outcome.error_class, Some(ErrorClass::Tool));

        let mut all = String::new();
        while let Ok(line) = rx.try_recv() {
            all.push_str(&line);
        }
        assert!(all.contains("[ERROR]"));
        assert!(all.contains("[Process exited with code 127]"));
    }
}
