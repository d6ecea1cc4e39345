//! CLI executable resolution across platforms.
//!
//! Several backend CLIs install as npm `.cmd` shims on Windows that cannot
//! be exec'd directly, so resolution probes a candidate list and the npm
//! global directory, and execution falls back through shells in priority
//! order: git-bash, cmd, powershell, then direct exec.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("{cli} CLI not found (tried: {tried}); ensure it is installed and on PATH")]
    NotFound { cli: String, tried: String },
}

pub type Result<T> = std::result::Result<T, ResolverError>;

fn candidate_names(cli_name: &str) -> Vec<String> {
    if cfg!(windows) {
        vec![
            format!("{cli_name}.cmd"),
            format!("{cli_name}.exe"),
            format!("{cli_name}.bat"),
            cli_name.to_string(),
        ]
    } else {
        vec![cli_name.to_string()]
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Resolve a backend CLI to an executable path.
pub fn resolve_cli(cli_name: &str) -> Result<String> {
    let candidates = candidate_names(cli_name);

    for candidate in &candidates {
        if let Some(resolved) = find_in_path(candidate) {
            return Ok(resolved.to_string_lossy().into_owned());
        }
    }

    // npm installs global shims under %APPDATA%\npm on Windows.
    if let Some(appdata) = std::env::var_os("APPDATA") {
        let npm_bin = Path::new(&appdata).join("npm");
        for candidate in &candidates {
            let path = npm_bin.join(candidate);
            if path.is_file() {
                return Ok(path.to_string_lossy().into_owned());
            }
        }
    }

    Err(ResolverError::NotFound {
        cli: cli_name.to_string(),
        tried: candidates.join(", "),
    })
}

/// A named shell wrapper variant for Windows execution fallback.
#[derive(Debug, Clone)]
pub struct CommandVariant {
    pub shell: &'static str,
    pub argv: Vec<String>,
}

fn bash_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| crate::ssh::shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn cmdline_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() || a.contains(' ') || a.contains('"') {
                format!("\"{}\"", a.replace('"', "\\\""))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn powershell_command(argv: &[String]) -> String {
    let quoted: Vec<String> = argv
        .iter()
        .map(|a| format!("'{}'", a.replace('\'', "''")))
        .collect();
    format!("& {} {}", quoted[0], quoted[1..].join(" "))
        .trim_end()
        .to_string()
}

fn available_shells() -> Vec<(&'static str, PathBuf)> {
    if !cfg!(windows) {
        return Vec::new();
    }

    let mut shells = Vec::new();
    let git_bash_candidates = [
        r"C:\Program Files\Git\bin\bash.exe",
        r"C:\Program Files\Git\usr\bin\bash.exe",
    ];
    if let Some(found) = git_bash_candidates
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
    {
        shells.push(("git-bash", found.to_path_buf()));
    } else if let Some(bash) = find_in_path("bash") {
        shells.push(("git-bash", bash));
    }
    if let Some(cmd) = find_in_path("cmd.exe").or_else(|| find_in_path("cmd")) {
        shells.push(("cmd", cmd));
    }
    if let Some(ps) = find_in_path("powershell.exe").or_else(|| find_in_path("powershell")) {
        shells.push(("powershell", ps));
    }
    shells
}

/// Build execution variants for a CLI: each discovered shell wrapper, with
/// direct exec as the last resort.
pub fn command_variants(cli_name: &str, direct_argv: &[String]) -> Vec<CommandVariant> {
    let mut raw_argv = vec![cli_name.to_string()];
    raw_argv.extend(direct_argv.iter().skip(1).cloned());

    let mut variants = Vec::new();
    for (shell, shell_path) in available_shells() {
        let shell_path = shell_path.to_string_lossy().into_owned();
        let argv = match shell {
            "git-bash" => vec![shell_path, "-lc".to_string(), bash_join(&raw_argv)],
            "cmd" => vec![
                shell_path,
                "/d".to_string(),
                "/s".to_string(),
                "/c".to_string(),
                cmdline_join(&raw_argv),
            ],
            _ => vec![
                shell_path,
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
                powershell_command(&raw_argv),
            ],
        };
        variants.push(CommandVariant { shell, argv });
    }

    variants.push(CommandVariant {
        shell: "direct",
        argv: direct_argv.to_vec(),
    });
    variants
}

/// Exit codes and output text that indicate "command not found" symptoms.
pub fn is_command_not_found(code: i32, buffered: &[String]) -> bool {
    if code == 127 || code == 9009 {
        return true;
    }
    if code == 1 {
        let merged = buffered.join("\n").to_lowercase();
        return [
            "command not found",
            "is not recognized as an internal or external command",
            "the term",
            "cannot find the file",
        ]
        .iter()
        .any(|probe| merged.contains(probe));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_missing_cli_errors() {
        let err = resolve_cli("definitely-not-a-real-cli-9x7").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn resolve_finds_common_binary() {
        // `ls` (unix) or `cmd` (windows) should exist on PATH.
        let name = if cfg!(windows) { "cmd" } else { "ls" };
        assert!(resolve_cli(name).is_ok());
    }

    #[test]
    fn direct_variant_is_always_last() {
        let argv = vec!["copilot".to_string(), "-p".to_string(), "hi".to_string()];
        let variants = command_variants("copilot", &argv);
        let last = variants.last().unwrap();
        assert_eq!(last.shell, "direct");
        assert_eq!(last.argv, argv);
    }

    #[test]
    fn not_found_detection() {
        assert!(is_command_not_found(127, &[]));
        assert!(is_command_not_found(9009, &[]));
        assert!(is_command_not_found(
            1,
            &["bash: claude: command not found".to_string()]
        ));
        assert!(!is_command_not_found(1, &["assertion failed".to_string()]));
        assert!(!is_command_not_found(2, &[]));
    }
}
