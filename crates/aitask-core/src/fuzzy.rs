//! Fuzzy file suggestion for @-mention autocomplete.
//!
//! Deterministic scoring over paths relative to a search root, with a fixed
//! directory blacklist pruned during the walk.

use std::path::{Component, Path};

/// Directories never descended into, plus any name starting with `.`.
pub const IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".next",
    "dist",
    "build",
    ".venv",
    "venv",
    "env",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "target",
    ".cargo",
    "vendor",
    "coverage",
    ".nyc_output",
    "tasks",
    ".idea",
    ".vscode",
    "out",
    "tmp",
    ".turbo",
];

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = needle.chars().peekable();
    for ch in haystack.chars() {
        if let Some(&next) = chars.peek() {
            if ch == next {
                chars.next();
            }
        } else {
            break;
        }
    }
    chars.peek().is_none()
}

/// Match score for `rel_path` against `query` (0 = excluded, higher = better).
///
/// ```
/// assert_eq!(aitask_core::fuzzy::score("src/main.rs", ""), 1);
/// assert_eq!(aitask_core::fuzzy::score("src/main.rs", "main.rs"), 1000);
/// ```
pub fn score(rel_path: &str, query: &str) -> u32 {
    if query.is_empty() {
        return 1;
    }

    let q = query.to_lowercase();
    let path = Path::new(rel_path);
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let path_lc = rel_path.to_lowercase();

    if basename == q || stem == q {
        return 1000;
    }
    if basename.starts_with(&q) || stem.starts_with(&q) {
        return 900;
    }
    if basename.contains(&q) {
        return 700;
    }
    if path_lc.contains(&q) {
        return 500;
    }
    if is_subsequence(&q, &basename) {
        return 300;
    }
    if is_subsequence(&q, &path_lc) {
        return 100;
    }
    0
}

fn rel_posix(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}

fn walk(base: &Path, dir: &Path, query: &str, scored: &mut Vec<(u32, String)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if name.starts_with('.') || IGNORE_DIRS.contains(&name.as_str()) {
                continue;
            }
            walk(base, &path, query, scored);
        } else if file_type.is_file() {
            if name.starts_with('.') {
                continue;
            }
            let Some(rel) = rel_posix(base, &path) else {
                continue;
            };
            let sc = score(&rel, query);
            if sc > 0 {
                scored.push((sc, rel));
            }
        }
    }
}

/// Walk `root`, score every file against `query`, return the best `limit`
/// relative paths sorted by `(-score, path)`.
pub fn list_files(root: &Path, query: &str, limit: usize) -> Vec<String> {
    let mut scored: Vec<(u32, String)> = Vec::new();
    walk(root, root, query, &mut scored);
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(limit).map(|(_, p)| p).collect()
}

/// Score already-collected relative paths (remote listings).
pub fn rank_paths(paths: impl IntoIterator<Item = String>, query: &str, limit: usize) -> Vec<String> {
    let mut scored: Vec<(u32, String)> = paths
        .into_iter()
        .filter_map(|p| {
            let sc = score(&p, query);
            (sc > 0).then_some((sc, p))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(limit).map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_query_includes_everything() {
        assert_eq!(score("src/lib.rs", ""), 1);
        assert_eq!(score("deep/nested/path.txt", ""), 1);
    }

    #[test]
    fn score_tiers() {
        assert_eq!(score("src/main.rs", "main.rs"), 1000);
        assert_eq!(score("src/main.rs", "main"), 1000); // stem match
        assert_eq!(score("src/mainframe.rs", "main"), 900);
        assert_eq!(score("src/the_main.rs", "main"), 700);
        assert_eq!(score("main/util.rs", "main"), 500);
        // m..a..x as subsequence of "makefile.txt" basename
        assert_eq!(score("Makefile.txt", "mkf"), 300);
        assert_eq!(score("src/a/b/xyz.rs", "sbx"), 100);
        assert_eq!(score("other.rs", "zzz"), 0);
    }

    #[test]
    fn case_folds_both_sides() {
        assert_eq!(score("README.md", "readme.md"), 1000);
        assert_eq!(score("readme.md", "README"), 1000);
    }

    #[test]
    fn walk_prunes_blacklist_and_dotfiles() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join("src/app.rs"), "").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "").unwrap();
        std::fs::write(dir.path().join(".hidden/secret.txt"), "").unwrap();
        std::fs::write(dir.path().join(".env"), "").unwrap();

        let files = list_files(dir.path(), "", 100);
        assert_eq!(files, vec!["src/app.rs".to_string()]);
    }

    #[test]
    fn results_sorted_by_score_then_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/config.rs"), "").unwrap();
        std::fs::write(dir.path().join("config.rs"), "").unwrap();
        std::fs::write(dir.path().join("reconfigure.rs"), "").unwrap();

        let files = list_files(dir.path(), "config", 10);
        // Exact stem matches first (path tie-break), then substring.
        assert_eq!(
            files,
            vec![
                "a/config.rs".to_string(),
                "config.rs".to_string(),
                "reconfigure.rs".to_string(),
            ]
        );
    }

    #[test]
    fn limit_is_respected() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            std::fs::write(dir.path().join(format!("file{i}.txt")), "").unwrap();
        }
        assert_eq!(list_files(dir.path(), "", 3).len(), 3);
    }
}
