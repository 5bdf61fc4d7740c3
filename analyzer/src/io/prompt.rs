//! Built-in agent prompts rendered with minijinja.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::validation::ValidationThresholds;

const ANALYSIS_TEMPLATE: &str = include_str!("prompts/analysis.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const CODEX_CLI_TEMPLATE: &str = include_str!("prompts/codex_cli.md");
const SECRET_REVIEW_TEMPLATE: &str = include_str!("prompts/secret_review.md");

/// First user message for tool-calling agents.
pub const KICKOFF_MESSAGE: &str = "Begin. Use the shell tool as needed and reply with the final result when done.";

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("analysis", ANALYSIS_TEMPLATE)
        .expect("analysis template should be valid");
    env.add_template("code", CODE_TEMPLATE)
        .expect("code template should be valid");
    env.add_template("codex_cli", CODEX_CLI_TEMPLATE)
        .expect("codex_cli template should be valid");
    env.add_template("secret_review", SECRET_REVIEW_TEMPLATE)
        .expect("secret_review template should be valid");
    env
});

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn render(name: &str, ctx: minijinja::Value) -> Result<String> {
    let template = ENGINE
        .get_template(name)
        .with_context(|| format!("load prompt template {name}"))?;
    let rendered = template
        .render(ctx)
        .with_context(|| format!("render prompt template {name}"))?;
    debug!(template = name, chars = rendered.len(), "prompt rendered");
    Ok(rendered)
}

/// Instructions for the analysis agent.
pub fn analysis_prompt(
    repo_path: &Path,
    scan_path: &Path,
    focus: Option<&str>,
    thresholds: ValidationThresholds,
) -> Result<String> {
    render(
        "analysis",
        context! {
            repo_path => repo_path.display().to_string(),
            scan_path => scan_path.display().to_string(),
            focus => non_empty(focus),
            min_stories => thresholds.min_stories,
            min_evidence => thresholds.min_evidence,
        },
    )
}

/// Instructions for the in-process coding agent.
pub fn code_prompt(repo_path: &Path, task: &str, analysis_context: Option<&str>) -> Result<String> {
    render(
        "code",
        context! {
            repo_path => repo_path.display().to_string(),
            task => task.trim(),
            analysis_context => non_empty(analysis_context),
        },
    )
}

/// Prompt piped to `codex exec` on stdin.
pub fn codex_cli_prompt(
    repo_path: &Path,
    task: &str,
    analysis_context: Option<&str>,
) -> Result<String> {
    render(
        "codex_cli",
        context! {
            repo_path => repo_path.display().to_string(),
            task => task.trim(),
            analysis_context => non_empty(analysis_context),
        },
    )
}

/// Instructions for the secret review agent.
pub fn secret_review_prompt(
    repo_path: &Path,
    secret_scan_path: &Path,
    prescan_count: usize,
) -> Result<String> {
    render(
        "secret_review",
        context! {
            repo_path => repo_path.display().to_string(),
            secret_scan_path => secret_scan_path.display().to_string(),
            prescan_count => prescan_count,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validation::REQUIRED_SECTIONS;

    /// Verifies the analysis prompt names every heading the validator checks for.
    #[test]
    fn analysis_prompt_lists_required_sections() {
        let prompt = analysis_prompt(
            Path::new("/work/repo"),
            Path::new("/work/run/scan.json"),
            Some("  billing flows "),
            ValidationThresholds {
                min_stories: 15,
                min_evidence: 25,
            },
        )
        .expect("render");
        for heading in REQUIRED_SECTIONS {
            assert!(prompt.contains(heading), "missing {heading}");
        }
        assert!(prompt.contains("Additional focus: billing flows"));
        assert!(prompt.contains("At least 15 user stories"));
        assert!(prompt.contains("/work/run/scan.json"));
    }

    /// Verifies optional blocks disappear when their input is blank.
    #[test]
    fn optional_blocks_are_omitted() {
        let prompt = code_prompt(Path::new("/r"), "fix the bug", Some("   ")).expect("render");
        assert!(!prompt.contains("<analysis_context>"));
        let prompt = codex_cli_prompt(Path::new("/r"), "fix", Some("report body")).expect("render");
        assert!(prompt.contains("<analysis_context>\nreport body\n</analysis_context>"));
        let prompt = analysis_prompt(
            Path::new("/r"),
            Path::new("/s"),
            None,
            ValidationThresholds::default(),
        )
        .expect("render");
        assert!(!prompt.contains("Additional focus"));
    }

    #[test]
    fn review_prompt_demands_json() {
        let prompt = secret_review_prompt(Path::new("/r"), Path::new("/s.json"), 3).expect("render");
        assert!(prompt.contains("strict JSON"));
        assert!(prompt.contains("(3 candidate findings)"));
    }
}
