//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep or blocking I/O in async production code
//! - Logging goes through `tracing`, never stdout
//! - The show engine reads the component registry but never mutates it
//!
//! The helpers here scan production source. Everything from the first
//! `#[cfg(test)]` line of a file onwards is treated as test code and skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A forbidden pattern found in production code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the pattern was found in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Root of the workspace, independent of the test's working directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Production source directory of a workspace crate, e.g. `showrunner/core/src`
#[must_use]
pub fn source_dir(relative: &str) -> PathBuf {
    workspace_root().join(relative)
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Code lines of a file up to its test module, comments stripped
///
/// Returns `(line_number, code)` pairs.
#[must_use]
pub fn production_lines(source: &str) -> Vec<(usize, String)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| (idx + 1, strip_comment(line).to_string()))
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Find production lines under `dir` matching `forbidden`
#[must_use]
pub fn scan(dir: &Path, forbidden: impl Fn(&str) -> bool) -> Vec<Violation> {
    scan_with_context(dir, |lines, idx| forbidden(&lines[idx].1))
}

/// Like [`scan`], but the predicate sees every production line of the file
/// and the index of the line being checked
#[must_use]
pub fn scan_with_context(
    dir: &Path,
    forbidden: impl Fn(&[(usize, String)], usize) -> bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in rust_files(dir) {
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        let lines = production_lines(&source);
        for idx in 0..lines.len() {
            if forbidden(&lines, idx) {
                violations.push(Violation {
                    path: path.clone(),
                    line: lines[idx].0,
                    text: lines[idx].1.trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Whether the nearest function declared above `idx` is `async`
#[must_use]
pub fn in_async_fn(lines: &[(usize, String)], idx: usize) -> bool {
    lines[..=idx]
        .iter()
        .rev()
        .map(|(_, code)| code.trim())
        .find(|code| declares_fn(code))
        .is_some_and(|code| code.contains("async fn "))
}

fn declares_fn(code: &str) -> bool {
    code.starts_with("fn ") || code.contains(" fn ")
}

/// Panic with a readable report if any violations were found
///
/// # Panics
///
/// When `violations` is not empty.
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    let report: Vec<String> = violations.iter().map(|v| format!("  ❌ {v}")).collect();
    panic!(
        "\n{rule}\nFound {} violation(s):\n{}\n",
        violations.len(),
        report.join("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(code: &[&str]) -> Vec<(usize, String)> {
        production_lines(&code.join("\n"))
    }

    #[test]
    fn test_test_module_is_skipped() {
        let parsed = lines(&[
            "fn real() {}",
            "#[cfg(test)]",
            "mod tests {",
            "    fn helper() { std::thread::sleep(d); }",
            "}",
        ]);
        assert_eq!(parsed, vec![(1, "fn real() {}".to_string())]);
    }

    #[test]
    fn test_comments_are_stripped() {
        let parsed = lines(&["let x = 1; // println!(\"no\")", "// std::thread::sleep"]);
        assert_eq!(parsed, vec![(1, "let x = 1; ".to_string())]);
    }

    #[test]
    fn test_async_fn_detection() {
        let parsed = lines(&[
            "pub async fn serve() {",
            "    let text = std::fs::read_to_string(path);",
            "}",
            "pub fn load() {",
            "    let text = std::fs::read_to_string(path);",
            "}",
        ]);
        assert!(in_async_fn(&parsed, 1));
        assert!(!in_async_fn(&parsed, 4));
    }
}
