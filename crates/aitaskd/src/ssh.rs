//! SSH helpers shared by the executor, worktree manager, and health checks.
//!
//! Remote commands always run with BatchMode, a 10 s connect timeout and
//! host-key checking disabled. Task scripts are staged with two layers of
//! base64: the outer layer carries the whole script through a single SSH
//! call, the inner layer carries the prompt so no shell quoting can mangle
//! it and no login startup file can clobber it.

use aitask_core::{BackendKind, WorkspaceKind};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Connect timeout baked into every SSH invocation.
pub const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to execute ssh: {0}")]
    Execution(#[from] std::io::Error),
    #[error("ssh command timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, SshError>;

/// Captured output of a remote command.
#[derive(Debug, Clone)]
pub struct SshOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SshOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out} | {err}"),
        }
    }
}

/// SSH argument list (excluding the remote command).
///
/// Example: `["-o", "BatchMode=yes", ..., "-p", "6020", "alice@host"]`
pub fn connection_args(host: &str, port: Option<u16>, user: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
    ];
    if let Some(port) = port {
        if port != 22 {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
    }
    let target = match user {
        Some(user) if !user.is_empty() => format!("{user}@{host}"),
        _ => host.to_string(),
    };
    args.push(target);
    args
}

/// Extract the remote filesystem path from a canonical SSH workspace path.
///
/// - Ssh:          `ssh://user@host:port/remote/path` -> `/remote/path`
/// - SshContainer: `ssh://user@host:port/container/name:/remote/path` -> `/remote/path`
pub fn extract_remote_path(canonical: &str, kind: WorkspaceKind) -> String {
    let rest = canonical.strip_prefix("ssh://").unwrap_or(canonical);
    let path = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => return canonical.to_string(),
    };
    match kind {
        WorkspaceKind::SshContainer => match path.split_once(':') {
            Some((_, container_path)) => container_path.to_string(),
            None => path.to_string(),
        },
        _ => path.to_string(),
    }
}

/// POSIX single-quote a string for embedding in a shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Run one remote command, returning captured output.
pub async fn exec(args: &[String], cmd: &str, timeout: Option<Duration>) -> Result<SshOutput> {
    let child = Command::new("ssh")
        .args(args)
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child)
            .await
            .map_err(|_| SshError::Timeout(limit))??,
        None => child.await?,
    };

    Ok(SshOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Short probe: stdout text on success, None on any failure or timeout.
pub async fn probe(args: &[String], cmd: &str, timeout: Duration) -> Option<String> {
    match exec(args, cmd, Some(timeout)).await {
        Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(error = %err, "ssh probe failed");
            None
        }
    }
}

/// Wrap a remote command so it runs inside a docker container.
pub fn wrap_container(cmd: &str, container: &str, workdir: Option<&str>) -> String {
    match workdir {
        Some(dir) => format!(
            "docker exec -w {} {} sh -c {}",
            shell_quote(dir),
            shell_quote(container),
            shell_quote(cmd)
        ),
        None => format!(
            "docker exec {} sh -c {}",
            shell_quote(container),
            shell_quote(cmd)
        ),
    }
}

/// Inner CLI command for one backend, consuming `$_AITASK_PROMPT`.
fn backend_command(
    backend: BackendKind,
    remote_worktree: &str,
    permission_mode: Option<&str>,
    model: Option<&str>,
) -> String {
    match backend {
        BackendKind::ClaudeCode => {
            let mode = permission_mode.filter(|m| !m.is_empty()).unwrap_or("dontAsk");
            format!(
                "claude -p --output-format stream-json --permission-mode {} \"$_AITASK_PROMPT\"",
                shell_quote(mode)
            )
        }
        BackendKind::CodexCli => {
            let model_flag = model
                .filter(|m| !m.is_empty())
                .map(|m| format!("-m {} ", shell_quote(m)))
                .unwrap_or_default();
            format!(
                "printf '%s' \"$_AITASK_PROMPT\" | codex exec --json \
                 --dangerously-bypass-approvals-and-sandbox {model_flag}-C {} -",
                shell_quote(remote_worktree)
            )
        }
        BackendKind::CopilotCli => {
            "copilot --allow-all --no-color --no-alt-screen -p \"$_AITASK_PROMPT\"".to_string()
        }
    }
}

/// Parameters for a staged remote task script.
#[derive(Debug, Clone)]
pub struct RemoteTask<'a> {
    pub backend: BackendKind,
    pub prompt: &'a str,
    /// Worktree directory on the remote (or inside the container).
    pub remote_worktree: &'a str,
    pub container: Option<&'a str>,
    pub login_shell: Option<&'a str>,
    pub permission_mode: Option<&'a str>,
    pub model: Option<&'a str>,
    pub tmux_session: &'a str,
}

impl RemoteTask<'_> {
    pub fn script_file(&self) -> String {
        format!("/tmp/{}.sh", self.tmux_session)
    }

    pub fn log_file(&self) -> String {
        format!("/tmp/{}.log", self.tmux_session)
    }
}

/// Build the task script staged to `/tmp/<session>.sh`.
///
/// The script runs the backend CLI under a login shell, with the prompt
/// decoded from base64 inside the `-c` body so startup files sourced before
/// it cannot clobber the variable.
pub fn build_task_script(task: &RemoteTask<'_>) -> String {
    let shell = task.login_shell.filter(|s| !s.is_empty()).unwrap_or("bash");
    let prompt_b64 = BASE64.encode(task.prompt.as_bytes());
    let cli = backend_command(
        task.backend,
        task.remote_worktree,
        task.permission_mode,
        task.model,
    );

    let mut body = String::new();
    if shell.ends_with("zsh") {
        // zsh --login -c is non-interactive and skips .zshrc; source it
        // explicitly, and only then decode the prompt so a PROMPT-style
        // variable reset in the rc file cannot touch it.
        body.push_str("[ -f \"$HOME/.zshrc\" ] && source \"$HOME/.zshrc\"\n");
    }
    body.push_str("export NVM_DIR=\"$HOME/.nvm\"\n");
    body.push_str("[ -s \"$NVM_DIR/nvm.sh\" ] && . \"$NVM_DIR/nvm.sh\"\n");
    body.push_str("[ -f \"$HOME/proxy.sh\" ] && . \"$HOME/proxy.sh\"\n");
    body.push_str(&format!(
        "_AITASK_PROMPT=$(echo {prompt_b64} | base64 -d)\n"
    ));
    if task.container.is_none() {
        body.push_str(&format!("cd {}\n", shell_quote(task.remote_worktree)));
    }
    body.push_str(&cli);
    body.push('\n');

    let inner = format!("{shell} --login -c {}", shell_quote(&body));
    let command = match task.container {
        Some(container) => format!(
            "docker exec -w {} {} {}",
            shell_quote(task.remote_worktree),
            shell_quote(container),
            inner
        ),
        None => inner,
    };

    let log_file = task.log_file();
    format!("{command} > {log_file} 2>&1\necho EXIT_CODE:$? >> {log_file}\n")
}

/// One-call remote command that stages the script (outer base64 layer) and
/// starts the detached tmux session running it.
pub fn stage_and_launch_command(task: &RemoteTask<'_>, script: &str) -> String {
    let script_b64 = BASE64.encode(script.as_bytes());
    let script_file = task.script_file();
    format!(
        "echo {script_b64} | base64 -d > {script_file} && \
         tmux new-session -d -s {} \"bash {script_file}\"",
        shell_quote(task.tmux_session)
    )
}

/// Kill the remote tmux session; missing sessions are not an error.
pub fn kill_session_command(tmux_session: &str) -> String {
    format!(
        "tmux kill-session -t {} 2>/dev/null || true",
        shell_quote(tmux_session)
    )
}

/// Remove the staged script and log file.
pub fn cleanup_command(task: &RemoteTask<'_>) -> String {
    format!("rm -f {} {}", task.script_file(), task.log_file())
}
