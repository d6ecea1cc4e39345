//! Adapter for the Claude Code CLI.
//!
//! Drives `claude -p` in stream-json mode with the prompt on stdin, and
//! mines the event stream for cost/duration usage metrics and quota
//! signals. Structured `error` events are preferred; lines that fail to
//! parse as JSON fall back to a keyword scan.

use aitask_core::quota;
use aitask_core::ErrorClass;
use std::path::{Path, PathBuf};

use super::resolver::{self, resolve_cli};

#[derive(Debug)]
pub struct ClaudeCodeAdapter {
    workspace_path: PathBuf,
    model: Option<String>,
    permission_mode: Option<String>,
    usage: Option<serde_json::Value>,
    quota: bool,
}

impl ClaudeCodeAdapter {
    pub fn new(
        workspace_path: PathBuf,
        model: Option<String>,
        permission_mode: Option<String>,
    ) -> Self {
        Self {
            workspace_path,
            model,
            permission_mode,
            usage: None,
            quota: false,
        }
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// `claude -p --output-format stream-json --input-format text
    /// [--dangerously-skip-permissions | --permission-mode <mode>]
    /// [--model <model>]` with the prompt on stdin.
    pub fn build_command(&self) -> resolver::Result<Vec<String>> {
        let mut cmd = vec![
            resolve_cli("claude")?,
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "text".to_string(),
        ];
        match self.permission_mode.as_deref() {
            None | Some("") | Some("bypassPermissions") => {
                cmd.push("--dangerously-skip-permissions".to_string());
            }
            Some(mode) => {
                cmd.push("--permission-mode".to_string());
                cmd.push(mode.to_string());
            }
        }
        if let Some(model) = &self.model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        Ok(cmd)
    }

    pub fn observe_line(&mut self, line: &str) {
        let stripped = line.trim();
        if stripped.is_empty() {
            return;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(stripped) else {
            if quota::contains_quota_keyword(stripped) {
                self.quota = true;
            }
            return;
        };

        match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "result" => {
                self.usage = Some(serde_json::json!({
                    "cost_usd": event.get("cost_usd"),
                    "total_cost_usd": event.get("total_cost_usd"),
                    "duration_ms": event.get("duration_ms"),
                    "duration_api_ms": event.get("duration_api_ms"),
                    "num_turns": event.get("num_turns"),
                }));
            }
            "error" => {
                let error = event.get("error");
                let error_type = error
                    .and_then(|e| e.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                let message = match error {
                    Some(serde_json::Value::Object(obj)) => obj
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("")
                        .to_string(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                if quota::is_quota_error_type(error_type)
                    || quota::message_has_quota_signal(&message)
                {
                    self.quota = true;
                }
            }
            _ => {}
        }
    }

    /// 0 success; 130 cancel (no class); 127 Tool; 1 Quota-or-Tool;
    /// everything else Network.
    pub fn parse_exit_code(&self, code: i32) -> (bool, Option<ErrorClass>) {
        match code {
            0 => (true, None),
            130 => (false, None),
            127 => (false, Some(ErrorClass::Tool)),
            1 if self.quota => (false, Some(ErrorClass::Quota)),
            1 => (false, Some(ErrorClass::Tool)),
            _ => (false, Some(ErrorClass::Network)),
        }
    }

    pub fn usage_data(&self) -> Option<&serde_json::Value> {
        self.usage.as_ref()
    }

    pub fn is_quota_error(&self) -> bool {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ClaudeCodeAdapter {
        ClaudeCodeAdapter::new(PathBuf::from("/tmp/ws"), None, None)
    }

    #[test]
    fn result_event_captures_usage() {
        let mut a = adapter();
        a.observe_line(
            r#"{"type":"result","cost_usd":0.12,"total_cost_usd":0.34,"duration_ms":9000,"duration_api_ms":7500,"num_turns":4}"#,
        );
        let usage = a.usage_data().unwrap();
        assert_eq!(usage["cost_usd"], 0.12);
        assert_eq!(usage["num_turns"], 4);
    }

    #[test]
    fn structured_rate_limit_error_sets_quota() {
        let mut a = adapter();
        a.observe_line(r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#);
        assert!(a.is_quota_error());
    }

    #[test]
    fn structured_message_quota_signal() {
        let mut a = adapter();
        a.observe_line(
            r#"{"type":"error","error":{"type":"api_error","message":"Insufficient credit balance"}}"#,
        );
        assert!(a.is_quota_error());
    }

    #[test]
    fn plain_text_fallback_scan() {
        let mut a = adapter();
        a.observe_line("Error: usage limit reached until 5pm");
        assert!(a.is_quota_error());
    }

    #[test]
    fn benign_lines_do_not_set_quota() {
        let mut a = adapter();
        a.observe_line(r#"{"type":"text","text":"editing src/main.rs"}"#);
        a.observe_line("wrote 42 lines");
        assert!(!a.is_quota_error());
    }

    #[test]
    fn exit_code_classification() {
        let mut a = adapter();
        assert_eq!(a.parse_exit_code(0), (true, None));
        assert_eq!(a.parse_exit_code(130), (false, None));
        assert_eq!(a.parse_exit_code(127), (false, Some(ErrorClass::Tool)));
        assert_eq!(a.parse_exit_code(1), (false, Some(ErrorClass::Tool)));
        assert_eq!(a.parse_exit_code(2), (false, Some(ErrorClass::Network)));

        a.observe_line("rate limit exceeded");
        assert_eq!(a.parse_exit_code(1), (false, Some(ErrorClass::Quota)));
    }
}
