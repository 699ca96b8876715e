//! Codebase tool server used by the plan, generate and review stages.
//!
//! Tool output is opaque context for prompts. A failing tool never fails a
//! stage; the engine logs it and builds the prompt without that section.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Regex for file paths mentioned in a plan, e.g. `src/parser/lexer.rs`.
static FILE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s`'(\[])((?:[\w.-]+/)*[\w-]+\.(?:rs|toml|py|ts|tsx|js|go|java|c|h|cpp|md|json|ya?ml))\b")
        .expect("FILE_PATH_RE regex should compile")
});

/// Regex for type/trait names in backticks, e.g. `TokenStream`.
static SYMBOL_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([A-Z][A-Za-z0-9_]+)`").expect("SYMBOL_REF_RE regex should compile"));

/// Files above this size are skipped by `find_references`.
const MAX_SCAN_BYTES: u64 = 1024 * 1024;

/// Error type for tool operations
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not supported: {0}")]
    Unsupported(&'static str),

    #[error("path escapes the workspace: {0}")]
    PathOutsideRoot(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// Outcome of `run_tests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl TestReport {
    /// Status line plus the tail of the output, where failures usually are.
    pub fn summary(&self, max_chars: usize) -> String {
        let status = if self.passed { "PASSED" } else { "FAILED" };
        let count = self.output.chars().count();
        let tail: String = self.output.chars().skip(count.saturating_sub(max_chars)).collect();
        format!("Tests {status} (exit code {:?})\n{tail}", self.exit_code)
    }
}

/// Codebase access for stage handlers.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String, ToolError>;

    /// Short description of the codebase layout.
    async fn analyze_codebase(&self) -> Result<String, ToolError>;

    /// `path:line: text` for each line mentioning `symbol`.
    async fn find_references(&self, symbol: &str) -> Result<Vec<String>, ToolError>;

    async fn run_tests(&self) -> Result<TestReport, ToolError>;

    fn name(&self) -> &str;
}

/// Tool server for runs without a workspace. Every tool is unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopToolServer;

#[async_trait]
impl ToolServer for NoopToolServer {
    async fn read_file(&self, _path: &str) -> Result<String, ToolError> {
        Err(ToolError::Unsupported("read_file"))
    }

    async fn analyze_codebase(&self) -> Result<String, ToolError> {
        Err(ToolError::Unsupported("analyze_codebase"))
    }

    async fn find_references(&self, _symbol: &str) -> Result<Vec<String>, ToolError> {
        Err(ToolError::Unsupported("find_references"))
    }

    async fn run_tests(&self) -> Result<TestReport, ToolError> {
        Err(ToolError::Unsupported("run_tests"))
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Tool server over a local checkout, respecting .gitignore.
#[derive(Debug, Clone)]
pub struct LocalToolServer {
    root: PathBuf,
    test_command: Option<Vec<String>>,
    test_timeout: Duration,
    max_file_chars: usize,
    max_references: usize,
}

impl LocalToolServer {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            test_command: None,
            test_timeout: Duration::from_secs(600),
            max_file_chars: 16_000,
            max_references: 40,
        }
    }

    /// Command (program plus args) run from the root by `run_tests`.
    pub fn with_test_command(mut self, command: Vec<String>) -> Self {
        self.test_command = (!command.is_empty()).then_some(command);
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path, refusing anything outside the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let relative = Path::new(path);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if escapes {
            return Err(ToolError::PathOutsideRoot(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn walk(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .build()
            .flatten()
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
    }
}

fn join_error(e: tokio::task::JoinError) -> ToolError {
    ToolError::CommandFailed(format!("worker task failed: {e}"))
}

#[async_trait]
impl ToolServer for LocalToolServer {
    async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let full = self.resolve(path)?;
        let text = tokio::fs::read_to_string(&full).await.map_err(|source| ToolError::Io {
            path: path.to_string(),
            source,
        })?;
        if text.chars().count() > self.max_file_chars {
            let head: String = text.chars().take(self.max_file_chars).collect();
            return Ok(format!("{head}\n... [file truncated]"));
        }
        Ok(text)
    }

    async fn analyze_codebase(&self) -> Result<String, ToolError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || Self::walk(&root))
            .await
            .map_err(join_error)?;

        let mut by_extension: BTreeMap<String, usize> = BTreeMap::new();
        for file in &files {
            let ext = file
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("(none)")
                .to_string();
            *by_extension.entry(ext).or_insert(0) += 1;
        }

        let mut summary = format!("{} files under {}\n", files.len(), self.root.display());
        for (ext, count) in &by_extension {
            summary.push_str(&format!("  .{ext}: {count}\n"));
        }
        summary.push_str("Files:\n");
        for file in files.iter().take(200) {
            let rel = file.strip_prefix(&self.root).unwrap_or(file);
            summary.push_str(&format!("  {}\n", rel.display()));
        }
        if files.len() > 200 {
            summary.push_str(&format!("  ... and {} more\n", files.len() - 200));
        }
        Ok(summary)
    }

    async fn find_references(&self, symbol: &str) -> Result<Vec<String>, ToolError> {
        let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(symbol)))
            .map_err(|e| ToolError::CommandFailed(e.to_string()))?;
        let root = self.root.clone();
        let limit = self.max_references;

        tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            for file in Self::walk(&root) {
                let too_big = std::fs::metadata(&file).map(|m| m.len() > MAX_SCAN_BYTES).unwrap_or(true);
                if too_big {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(&file) else {
                    continue;
                };
                let rel = file.strip_prefix(&root).unwrap_or(&file).display().to_string();
                for (i, line) in text.lines().enumerate() {
                    if pattern.is_match(line) {
                        hits.push(format!("{rel}:{}: {}", i + 1, line.trim()));
                        if hits.len() >= limit {
                            return hits;
                        }
                    }
                }
            }
            hits
        })
        .await
        .map_err(join_error)
    }

    async fn run_tests(&self) -> Result<TestReport, ToolError> {
        let Some((program, args)) = self.test_command.as_ref().and_then(|c| c.split_first()) else {
            return Err(ToolError::Unsupported("run_tests"));
        };

        debug!(program, ?args, "running tests");
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.test_timeout, child)
            .await
            .map_err(|_| ToolError::Timeout(self.test_timeout.as_secs()))?
            .map_err(|e| ToolError::CommandFailed(format!("{program}: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(TestReport {
            passed: output.status.success(),
            exit_code: output.status.code(),
            output: text,
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// File paths mentioned in `text`, first occurrence order, at most `limit`.
pub fn referenced_paths(text: &str, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in FILE_PATH_RE.captures_iter(text) {
        let path = cap[1].to_string();
        if !out.contains(&path) {
            out.push(path);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

/// Backticked type/trait names in `text`, first occurrence order, at most `limit`.
pub fn referenced_symbols(text: &str, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in SYMBOL_REF_RE.captures_iter(text) {
        let symbol = cap[1].to_string();
        if !out.contains(&symbol) {
            out.push(symbol);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub struct Lexer;\nimpl Lexer {}\n").unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "use demo::Lexer;\nfn main() {}\n").unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_read_file_inside_root() {
        let dir = workspace();
        let tools = LocalToolServer::new(dir.path());
        let text = tools.read_file("src/lib.rs").await.unwrap();
        assert!(text.contains("pub struct Lexer"));
    }

    #[tokio::test]
    async fn test_read_file_refuses_escape() {
        let dir = workspace();
        let tools = LocalToolServer::new(dir.path());
        assert!(matches!(tools.read_file("../etc/passwd").await, Err(ToolError::PathOutsideRoot(_))));
        assert!(matches!(tools.read_file("/etc/passwd").await, Err(ToolError::PathOutsideRoot(_))));
    }

    #[tokio::test]
    async fn test_analyze_codebase_lists_files() {
        let dir = workspace();
        let summary = LocalToolServer::new(dir.path()).analyze_codebase().await.unwrap();
        assert!(summary.starts_with("3 files"));
        assert!(summary.contains(".rs: 2"));
        assert!(summary.contains("src/lib.rs"));
    }

    #[tokio::test]
    async fn test_find_references() {
        let dir = workspace();
        let hits = LocalToolServer::new(dir.path()).find_references("Lexer").await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().any(|h| h.starts_with("src/main.rs:1:")));
    }

    #[tokio::test]
    async fn test_run_tests_unconfigured_and_configured() {
        let dir = workspace();
        let tools = LocalToolServer::new(dir.path());
        assert!(matches!(tools.run_tests().await, Err(ToolError::Unsupported(_))));

        let tools = tools.with_test_command(vec!["sh".into(), "-c".into(), "echo ok; exit 1".into()]);
        let report = tools.run_tests().await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.exit_code, Some(1));
        assert!(report.summary(100).contains("Tests FAILED"));
    }

    #[test]
    fn test_referenced_paths_and_symbols() {
        let plan = "1. Edit `src/parser/lexer.rs` to add `TokenKind`.\n2. Update Cargo.toml and (tests/lexer.rs).\n\
                    3. Touch src/parser/lexer.rs again; extend `TokenKind` and `Span`.";
        assert_eq!(
            referenced_paths(plan, 10),
            vec!["src/parser/lexer.rs", "Cargo.toml", "tests/lexer.rs"]
        );
        assert_eq!(referenced_symbols(plan, 10), vec!["TokenKind", "Span"]);
        assert_eq!(referenced_paths(plan, 1).len(), 1);
    }

    #[tokio::test]
    async fn test_noop_server_is_unsupported() {
        assert!(NoopToolServer.analyze_codebase().await.is_err());
    }
}
