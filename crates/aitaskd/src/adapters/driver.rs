//! Shared streaming subprocess driver.
//!
//! Spawns a backend CLI with stdout and stderr merged into one line stream,
//! polls the cancellation probe every 0.5 s, and terminates gracefully
//! before hard-killing. Lines are forwarded to the caller's channel as they
//! arrive so log persistence and SSE streaming stay incremental.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::debug;

use super::resolver;

/// Predicate polled by the driver; true requests termination.
pub type CancelProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// How often the cancellation probe is polled while waiting for output.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period between the polite terminate and the hard kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Lines retained for command-not-found symptom probing during fallback.
const PROBE_BUFFER_LINES: usize = 400;

fn spawn_reader<R>(reader: R, line_tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(format!("{line}\n")).await.is_err() {
                break;
            }
        }
    });
}

async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and still own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn merge_streams(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> mpsc::Receiver<String> {
    let (line_tx, line_rx) = mpsc::channel::<String>(1024);
    if let Some(stdout) = stdout {
        spawn_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = stderr {
        spawn_reader(stderr, line_tx);
    }
    line_rx
}

/// Run one command to completion, streaming merged output lines.
///
/// Returns the exit code; 130 when the cancel probe requested termination.
pub async fn run_once(
    argv: &[String],
    cwd: &Path,
    env_remove: &[&str],
    stdin_data: Option<&str>,
    cancel: &CancelProbe,
    observe: &mut (dyn FnMut(&str) + Send),
    tx: &mpsc::Sender<String>,
) -> std::io::Result<i32> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(cwd)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in env_remove {
        cmd.env_remove(key);
    }

    let mut child = cmd.spawn()?;

    if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
        let data = data.to_string();
        tokio::spawn(async move {
            let _ = stdin.write_all(data.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let mut line_rx = merge_streams(child.stdout.take(), child.stderr.take());

    loop {
        if cancel() {
            debug!("cancellation requested; terminating child");
            terminate_then_kill(&mut child).await;
            return Ok(130);
        }
        match tokio::time::timeout(CANCEL_POLL_INTERVAL, line_rx.recv()).await {
            Ok(Some(line)) => {
                observe(&line);
                let _ = tx.send(line).await;
            }
            // Both streams reached EOF; the process is finishing.
            Ok(None) => break,
            // Idle; loop back to poll the cancel probe.
            Err(_) => {}
        }
    }

    if cancel() {
        terminate_then_kill(&mut child).await;
        return Ok(130);
    }

    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

/// Shell login-profile noise that would pollute fallback probing output.
fn is_shell_init_noise(line: &str) -> bool {
    let lower = line.to_lowercase();
    [
        "did not find path entry",
        "conda initialize",
        ">>> conda init",
        "<<< conda init",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Run a CLI, cascading through Windows shell wrappers when a variant fails
/// with command-not-found symptoms. On other platforms this is `run_once`.
pub async fn run_with_fallback(
    cli_name: &str,
    argv: &[String],
    cwd: &Path,
    env_remove: &[&str],
    stdin_data: Option<&str>,
    cancel: &CancelProbe,
    observe: &mut (dyn FnMut(&str) + Send),
    tx: &mpsc::Sender<String>,
) -> std::io::Result<i32> {
    if !cfg!(windows) {
        return run_once(argv, cwd, env_remove, stdin_data, cancel, observe, tx).await;
    }

    let variants = resolver::command_variants(cli_name, argv);
    let mut last_code = 0;
    for variant in &variants {
        let mut buffered: Vec<String> = Vec::new();
        let mut observe_and_buffer = |line: &str| {
            if is_shell_init_noise(line) {
                return;
            }
            if buffered.len() < PROBE_BUFFER_LINES {
                buffered.push(line.to_string());
            }
            observe(line);
        };
        let code = run_once(
            &variant.argv,
            cwd,
            env_remove,
            stdin_data,
            cancel,
            &mut observe_and_buffer,
            tx,
        )
        .await?;
        last_code = code;
        if code == 0 || code == 130 {
            return Ok(code);
        }
        if resolver::is_command_not_found(code, &buffered) {
            let note = format!(
                "[INFO] Shell '{}' could not run '{}', falling back...\n",
                variant.shell, cli_name
            );
            let _ = tx.send(note).await;
            continue;
        }
        return Ok(code);
    }
    Ok(last_code)
}
