//! Adapter for the GitHub Copilot CLI.
//!
//! Plain-text output only: the prompt rides the command line and quota
//! detection is a keyword scan plus the strict 429 pattern, so a bare
//! "429" in unrelated output (line ranges, ids) never trips the flag.

use aitask_core::quota;
use aitask_core::ErrorClass;
use std::path::{Path, PathBuf};

use super::resolver::{self, resolve_cli};

#[derive(Debug)]
pub struct CopilotAdapter {
    workspace_path: PathBuf,
    model: Option<String>,
    quota: bool,
}

impl CopilotAdapter {
    pub fn new(workspace_path: PathBuf, model: Option<String>) -> Self {
        Self {
            workspace_path,
            model,
            quota: false,
        }
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// `copilot -p <prompt> --allow-all --no-color --no-alt-screen
    /// [--model <model>]`; no stdin.
    pub fn build_command(&self, prompt: &str) -> resolver::Result<Vec<String>> {
        let mut cmd = vec![
            resolve_cli("copilot")?,
            "-p".to_string(),
            prompt.to_string(),
            "--allow-all".to_string(),
            "--no-color".to_string(),
            "--no-alt-screen".to_string(),
        ];
        if let Some(model) = &self.model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        Ok(cmd)
    }

    pub fn observe_line(&mut self, line: &str) {
        if quota::scan_plain_text(line) {
            self.quota = true;
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

    pub fn is_quota_error(&self) -> bool {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CopilotAdapter {
        CopilotAdapter::new(PathBuf::from("/tmp/ws"), None)
    }

    #[test]
    fn line_number_429_is_not_a_quota_signal() {
        let mut a = adapter();
        a.observe_line("Read docs/FRONTEND.md lines 429-431");
        assert!(!a.is_quota_error());
    }

    #[test]
    fn http_429_is_a_quota_signal() {
        let mut a = adapter();
        a.observe_line("HTTP 429 Too Many Requests");
        assert!(a.is_quota_error());
    }

    #[test]
    fn keyword_scan_applies() {
        let mut a = adapter();
        a.observe_line("the model is currently overloaded");
        assert!(a.is_quota_error());
    }

    #[test]
    fn exit_one_maps_to_code_without_quota() {
        let a = adapter();
        assert_eq!(a.parse_exit_code(1), (false, Some(ErrorClass::Code)));
    }

    #[test]
    fn exit_one_maps_to_quota_after_signal() {
        let mut a = adapter();
        a.observe_line("status: 429");
        assert_eq!(a.parse_exit_code(1), (false, Some(ErrorClass::Quota)));
    }
}
