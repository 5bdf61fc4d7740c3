//! Deterministic repository snapshot taken before an agent starts.
//!
//! The snapshot lists every file (outside `.git`) and pulls a few cheap
//! signals out of likely routing/schema/CLI files. Output is sorted so two
//! scans of the same tree are byte-identical.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

/// Bytes read from any single file.
const MAX_READ_BYTES: usize = 200_000;

/// Path fragments that mark a file as worth reading for signals.
const SIGNAL_PATH_TOKENS: [&str; 9] = [
    "api.py", "router", "routes", "sql", "schema", "cli.py", "app.tsx", "routes.ts", "pages",
];

const TEST_PATH_TOKENS: [&str; 4] = ["/tests/", "test_", "_test.", "spec."];

static ENDPOINT_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r#"(?i)@app\.(get|post|put|patch|delete)\(\s*['"]([^'"]+)['"]"#)
            .expect("endpoint pattern should be valid"),
        Regex::new(r#"(?i)router\.(get|post|put|patch|delete)\(\s*['"]([^'"]+)['"]"#)
            .expect("router pattern should be valid"),
    ]
});

static TABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([a-zA-Z0-9_]+)")
        .expect("table pattern should be valid")
});

static CLI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"add_parser\(\s*['"]([^'"]+)['"]"#).expect("cli pattern should be valid")
});

static ROUTE_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r#"(?i)<Route\s+path=['"]([^'"]+)['"]"#).expect("route pattern should be valid"),
        Regex::new(r#"(?i)path\s*:\s*['"]([^'"]+)['"]"#).expect("path pattern should be valid"),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSnapshot {
    pub repo_path: PathBuf,
    /// Hex SHA-256 over the sorted file list and file sizes.
    pub fingerprint: String,
    pub files: Vec<String>,
    pub api_endpoints: Vec<String>,
    pub db_tables: Vec<String>,
    pub cli_commands: Vec<String>,
    pub frontend_routes: Vec<String>,
    pub test_files: Vec<String>,
}

fn is_git_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == ".git"
}

/// Relative `/`-separated path.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

pub(crate) fn read_prefix(path: &Path, max_bytes: usize) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let end = bytes.len().min(max_bytes);
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Walk `repo_path` and build the snapshot.
#[instrument(skip_all, fields(repo = %repo_path.display()))]
pub fn build_snapshot(repo_path: &Path) -> Result<RepoSnapshot> {
    let mut files = Vec::new();
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(repo_path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_git_dir(e))
    {
        let entry = entry.with_context(|| format!("walk {}", repo_path.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(repo_path, entry.path()) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        hasher.update(rel.as_bytes());
        hasher.update(size.to_le_bytes());
        files.push(rel);
    }
    files.sort();

    let mut api_endpoints = BTreeSet::new();
    let mut db_tables = BTreeSet::new();
    let mut cli_commands = BTreeSet::new();
    let mut frontend_routes = BTreeSet::new();

    for rel in &files {
        let lower = rel.to_lowercase();
        if !SIGNAL_PATH_TOKENS.iter().any(|token| lower.contains(token)) {
            continue;
        }
        let Some(content) = read_prefix(&repo_path.join(rel), MAX_READ_BYTES) else {
            continue;
        };
        for pattern in ENDPOINT_PATTERNS.iter() {
            for caps in pattern.captures_iter(&content) {
                api_endpoints.insert(format!("{} {}", caps[1].to_uppercase(), &caps[2]));
            }
        }
        for caps in TABLE_PATTERN.captures_iter(&content) {
            db_tables.insert(caps[1].to_string());
        }
        for caps in CLI_PATTERN.captures_iter(&content) {
            cli_commands.insert(caps[1].to_string());
        }
        for pattern in ROUTE_PATTERNS.iter() {
            for caps in pattern.captures_iter(&content) {
                frontend_routes.insert(caps[1].to_string());
            }
        }
    }

    let test_files: Vec<String> = files
        .iter()
        .filter(|f| {
            let lower = f.to_lowercase();
            TEST_PATH_TOKENS.iter().any(|token| lower.contains(token))
        })
        .cloned()
        .collect();

    debug!(files = files.len(), endpoints = api_endpoints.len(), "snapshot built");
    Ok(RepoSnapshot {
        repo_path: repo_path.to_path_buf(),
        fingerprint: hex::encode(hasher.finalize()),
        files,
        api_endpoints: api_endpoints.into_iter().collect(),
        db_tables: db_tables.into_iter().collect(),
        cli_commands: cli_commands.into_iter().collect(),
        frontend_routes: frontend_routes.into_iter().collect(),
        test_files,
    })
}
