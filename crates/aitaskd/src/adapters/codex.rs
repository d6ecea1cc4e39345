//! Adapter for the Codex CLI.
//!
//! Runs `codex exec --json` with the prompt on stdin and parses the JSONL
//! event stream: `turn.completed` carries token usage, `error` events are
//! checked for quota signals.

use aitask_core::quota;
use aitask_core::ErrorClass;
use std::path::{Path, PathBuf};

use super::resolver::{self, resolve_cli};

#[derive(Debug)]
pub struct CodexAdapter {
    workspace_path: PathBuf,
    model: Option<String>,
    reasoning_effort: Option<String>,
    usage: Option<serde_json::Value>,
    quota: bool,
}

impl CodexAdapter {
    pub fn new(workspace_path: PathBuf, model: Option<String>) -> Self {
        Self {
            workspace_path,
            model,
            reasoning_effort: None,
            usage: None,
            quota: false,
        }
    }

    pub fn with_reasoning_effort(mut self, effort: Option<String>) -> Self {
        self.reasoning_effort = effort;
        self
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// `codex exec --json --ask-for-approval never --sandbox
    /// danger-full-access --cd <workspace> --skip-git-repo-check
    /// [--model <model>] [--reasoning-effort <effort>] -` with the prompt
    /// on stdin.
    pub fn build_command(&self) -> resolver::Result<Vec<String>> {
        let mut cmd = vec![
            resolve_cli("codex")?,
            "exec".to_string(),
            "--json".to_string(),
            "--ask-for-approval".to_string(),
            "never".to_string(),
            "--sandbox".to_string(),
            "danger-full-access".to_string(),
            "--cd".to_string(),
            self.workspace_path.to_string_lossy().into_owned(),
            "--skip-git-repo-check".to_string(),
        ];
        if let Some(model) = &self.model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        if let Some(effort) = &self.reasoning_effort {
            cmd.push("--reasoning-effort".to_string());
            cmd.push(effort.clone());
        }
        cmd.push("-".to_string());
        Ok(cmd)
    }

    pub fn observe_line(&mut self, line: &str) {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            return;
        };

        match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "turn.completed" => {
                if let Some(usage) = event.get("usage") {
                    self.usage = Some(serde_json::json!({
                        "input_tokens": usage.get("input_tokens"),
                        "output_tokens": usage.get("output_tokens"),
                        "total_tokens": usage.get("total_tokens"),
                    }));
                }
            }
            "error" => {
                let message = event.get("message").and_then(|m| m.as_str()).unwrap_or("");
                let code = event
                    .get("code")
                    .map(|c| c.to_string().to_lowercase())
                    .unwrap_or_default();
                if quota::message_has_quota_signal(message)
                    || quota::is_http_429(message)
                    || quota::is_quota_error_type(&code)
                    || code.contains("429")
                {
                    self.quota = true;
                }
            }
            _ => {}
        }
    }

    /// 0 success; 130 cancel; 127 Tool; 1 Quota-or-Code; else Network.
    pub fn parse_exit_code(&self, code: i32) -> (bool, Option<ErrorClass>) {
        match code {
            0 => (true, None),
            130 => (false, None),
            127 => (false, Some(ErrorClass::Tool)),
            1 if self.quota => (false, Some(ErrorClass::Quota)),
            1 => (false, Some(ErrorClass::Code)),
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

    fn adapter() -> CodexAdapter {
        CodexAdapter::new(PathBuf::from("/tmp/ws"), Some("gpt-5".to_string()))
    }

    #[test]
    fn turn_completed_captures_token_usage() {
        let mut a = adapter();
        a.observe_line(
            r#"{"type":"turn.completed","usage":{"input_tokens":1200,"output_tokens":340,"total_tokens":1540}}"#,
        );
        let usage = a.usage_data().unwrap();
        assert_eq!(usage["input_tokens"], 1200);
        assert_eq!(usage["total_tokens"], 1540);
    }

    #[test]
    fn error_event_with_quota_message() {
        let mut a = adapter();
        a.observe_line(r#"{"type":"error","message":"Too Many Requests, please retry"}"#);
        assert!(a.is_quota_error());
    }

    #[test]
    fn error_event_with_429_code() {
        let mut a = adapter();
        a.observe_line(r#"{"type":"error","message":"request rejected","code":429}"#);
        assert!(a.is_quota_error());
    }

    #[test]
    fn unrelated_error_event_ignored() {
        let mut a = adapter();
        a.observe_line(r#"{"type":"error","message":"file not found","code":"enoent"}"#);
        assert!(!a.is_quota_error());
    }

    #[test]
    fn exit_code_classification_is_code_not_tool() {
        let mut a = adapter();
        assert_eq!(a.parse_exit_code(1), (false, Some(ErrorClass::Code)));
        assert_eq!(a.parse_exit_code(127), (false, Some(ErrorClass::Tool)));
        assert_eq!(a.parse_exit_code(5), (false, Some(ErrorClass::Network)));

        a.observe_line(r#"{"type":"error","message":"rate limit hit"}"#);
        assert_eq!(a.parse_exit_code(1), (false, Some(ErrorClass::Quota)));
    }
}
