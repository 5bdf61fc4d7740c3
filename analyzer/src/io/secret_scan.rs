//! Regex pre-scan for hardcoded secrets in a fresh clone.
//!
//! Runs before the review agent so there is a deterministic baseline next to
//! the model's findings. Snippets are redacted before they are stored.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

/// Directories never scanned (dependency trees, build output, VCS data).
const SKIP_DIRS: [&str; 9] = [
    ".git",
    "node_modules",
    "dist",
    "build",
    "vendor",
    ".next",
    "coverage",
    ".venv",
    "venv",
];

const TEXT_SUFFIXES: [&str; 27] = [
    "py", "js", "ts", "tsx", "jsx", "php", "rb", "java", "kt", "go", "rs", "cs", "swift", "scala",
    "sql", "ini", "cfg", "conf", "toml", "yaml", "yml", "json", "env", "txt", "md", "properties",
    "xml",
];

const MAX_SNIPPET_CHARS: usize = 180;

struct Rule {
    id: &'static str,
    pattern: Regex,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    [
        ("openai_api_key", r"\bsk-[A-Za-z0-9_-]{20,}\b"),
        ("github_pat", r"\bghp_[A-Za-z0-9]{30,}\b"),
        ("aws_access_key_id", r"\bAKIA[0-9A-Z]{16}\b"),
        ("google_api_key", r"\bAIza[0-9A-Za-z_\-]{20,}\b"),
        (
            "hardcoded_secret_assignment",
            r#"(?i)\b(api[_-]?key|secret|token|password|passwd|pwd)\b\s*[:=]\s*['"][^'"]{6,}['"]"#,
        ),
        (
            "db_uri_with_password",
            r"(?i)\b[a-z][a-z0-9+.-]*://[^/\s:@]+:[^@\s]+@",
        ),
    ]
    .into_iter()
    .map(|(id, pattern)| Rule {
        id,
        pattern: Regex::new(pattern).expect("secret rule should be valid"),
    })
    .collect()
});

static FALSE_POSITIVES: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)(example|dummy|sample|test|placeholder|changeme|your_)[a-z0-9_ -]*")
            .expect("placeholder pattern should be valid"),
        Regex::new(r"\$\{?[A-Z][A-Z0-9_]+\}?").expect("env reference pattern should be valid"),
    ]
});

static LONG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]{16,}").expect("redaction pattern should be valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretFinding {
    pub rule_id: &'static str,
    pub path: String,
    pub line: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretScan {
    pub repo_path: PathBuf,
    pub finding_count: usize,
    pub findings: Vec<SecretFinding>,
    /// Skipped directories, relative to the repo root.
    pub excluded_paths: Vec<String>,
    pub stack_hints: Vec<String>,
}

/// Replace long alphanumeric runs with `***` and cap the length.
pub fn redact_snippet(line: &str) -> String {
    let redacted = LONG_TOKEN.replace_all(line.trim(), "***");
    if redacted.chars().count() <= MAX_SNIPPET_CHARS {
        return redacted.into_owned();
    }
    let kept: String = redacted.chars().take(MAX_SNIPPET_CHARS - 3).collect();
    format!("{kept}...")
}

fn is_candidate_text_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if name.starts_with(".env") {
        return true;
    }
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| TEXT_SUFFIXES.contains(&ext.as_str()))
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && SKIP_DIRS.iter().any(|dir| entry.file_name() == *dir)
}

/// Marker files at the repo root and the stack they imply.
pub fn detect_stack_hints(repo_path: &Path) -> Vec<String> {
    let markers: [(&str, &str); 9] = [
        ("package.json", "node"),
        ("composer.json", "php"),
        ("requirements.txt", "python"),
        ("pyproject.toml", "python"),
        ("Gemfile", "ruby"),
        ("pom.xml", "jvm"),
        ("build.gradle", "jvm"),
        ("go.mod", "go"),
        ("Cargo.toml", "rust"),
    ];
    let hints: BTreeSet<String> = markers
        .iter()
        .filter(|(file, _)| repo_path.join(file).exists())
        .map(|(_, hint)| hint.to_string())
        .collect();
    hints.into_iter().collect()
}

/// Flag lines matching a secret rule unless they look like a placeholder.
pub fn scan_lines(rel_path: &str, content: &str) -> Vec<SecretFinding> {
    let mut findings = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for rule in RULES.iter() {
            if !rule.pattern.is_match(line) {
                continue;
            }
            if FALSE_POSITIVES.iter().any(|fp| fp.is_match(line)) {
                continue;
            }
            findings.push(SecretFinding {
                rule_id: rule.id,
                path: rel_path.to_string(),
                line: idx + 1,
                snippet: redact_snippet(line),
            });
        }
    }
    findings
}

#[instrument(skip_all, fields(repo = %repo_path.display()))]
pub fn build_secret_scan(repo_path: &Path) -> Result<SecretScan> {
    let mut findings = Vec::new();
    let mut excluded = BTreeSet::new();

    let walker = WalkDir::new(repo_path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    for entry in walker.filter_entry(|e| {
        if is_skipped_dir(e) {
            if let Ok(rel) = e.path().strip_prefix(repo_path) {
                excluded.insert(rel.to_string_lossy().replace('\\', "/"));
            }
            return false;
        }
        true
    }) {
        let entry = entry.with_context(|| format!("walk {}", repo_path.display()))?;
        if !entry.file_type().is_file() || !is_candidate_text_file(entry.path()) {
            continue;
        }
        let raw = fs::read(entry.path())
            .with_context(|| format!("read {}", entry.path().display()))?;
        if raw.contains(&0) {
            continue;
        }
        let content = String::from_utf8_lossy(&raw);
        let rel = entry
            .path()
            .strip_prefix(repo_path)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        findings.extend(scan_lines(&rel, &content));
    }

    debug!(findings = findings.len(), "secret scan finished");
    Ok(SecretScan {
        repo_path: repo_path.to_path_buf(),
        finding_count: findings.len(),
        findings,
        excluded_paths: excluded.into_iter().collect(),
        stack_hints: detect_stack_hints(repo_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_real_looking_credentials() {
        let findings = scan_lines(
            "config.php",
            "$pass = \"hunter2hunter2\";\npassword = 'S3cr3tValue!'\nurl = postgres://app:pw123@db:5432/app\n",
        );
        let rules: Vec<&str> = findings.iter().map(|f| f.rule_id).collect();
        assert_eq!(rules, vec!["hardcoded_secret_assignment", "db_uri_with_password"]);
        assert_eq!(findings[0].line, 2);
    }

    #[test]
    fn skips_placeholders_and_env_references() {
        let content = "password = 'changeme123'\ntoken = \"${API_TOKEN}\"\n";
        assert!(scan_lines(".env.example", content).is_empty());
    }

    #[test]
    fn snippets_are_redacted() {
        let snippet = redact_snippet("  key = sk-ABCDEFGHIJKLMNOPQRSTUVWX  ");
        assert_eq!(snippet, "key = sk-***");
    }

    #[test]
    fn scan_skips_dependency_dirs_and_binaries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("node_modules/pkg")).expect("mkdir");
        fs::write(
            root.join("node_modules/pkg/index.js"),
            "const password = 'realpassword1';",
        )
        .expect("write");
        fs::write(root.join("app.js"), "const password = 'realpassword1';").expect("write");
        fs::write(root.join("blob.json"), b"password='realpassword1'\0").expect("write");
        fs::write(root.join("package.json"), "{}").expect("write");

        let scan = build_secret_scan(root).expect("scan");
        assert_eq!(scan.finding_count, 1);
        assert_eq!(scan.findings[0].path, "app.js");
        assert_eq!(scan.excluded_paths, vec!["node_modules"]);
        assert_eq!(scan.stack_hints, vec!["node"]);
    }
}
