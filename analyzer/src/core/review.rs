//! Parsing of secret review output and the remediation task built from it.

use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde_json::{Map, Value, json};

const REVIEW_SCHEMA: &str = include_str!("../../../schemas/secret_review/v1.schema.json");

/// Findings beyond this many are left out of the remediation task.
pub const MAX_TASK_FINDINGS: usize = 80;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```json\s*(\{.*?\})\s*```").expect("fenced json pattern should be valid")
});

fn summary_only(summary: &str) -> Value {
    json!({
        "stack_assessment": [],
        "findings": [],
        "summary": summary,
        "priority_files": [],
    })
}

fn parse_object(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Recover the review JSON object from free-form model output.
///
/// Tries the whole text, then a ```` ```json ```` fenced block, then the span
/// between the first `{` and the last `}`. When nothing parses, the text is
/// kept as the summary of an otherwise empty review.
pub fn extract_review_json(text: &str) -> Value {
    let content = text.trim();
    if content.is_empty() {
        return summary_only("");
    }
    if let Some(value) = parse_object(content) {
        return value;
    }
    if let Some(caps) = FENCED_JSON.captures(content)
        && let Some(value) = parse_object(&caps[1])
    {
        return value;
    }
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}'))
        && end > start
        && let Some(value) = parse_object(&content[start..=end])
    {
        return value;
    }
    summary_only(content)
}

fn findings(review: &Value) -> &[Value] {
    review
        .get("findings")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn findings_count(review: &Value) -> usize {
    findings(review).len()
}

/// Schema violations in a parsed review. Empty means it conforms.
pub fn review_schema_issues(review: &Value) -> Vec<String> {
    let schema: Value = match serde_json::from_str(REVIEW_SCHEMA) {
        Ok(schema) => schema,
        Err(err) => return vec![format!("review schema unreadable: {err}")],
    };
    let compiled = match jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
    {
        Ok(compiled) => compiled,
        Err(err) => return vec![format!("review schema invalid: {err}")],
    };
    compiled
        .iter_errors(review)
        .map(|err| err.to_string())
        .collect()
}

fn text_field<'a>(item: &'a Map<String, Value>, key: &str) -> &'a str {
    item.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("")
}

fn line_field(item: &Map<String, Value>) -> String {
    match item.get("line") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}

/// Build the remediation instructions for the code stage.
pub fn build_secret_refactor_task(review: &Value, extra_task: &str) -> String {
    let stack: Vec<&str> = review
        .get("stack_assessment")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let stack_text = if stack.is_empty() {
        "unknown stack".to_string()
    } else {
        stack.join(", ")
    };

    let lines: Vec<String> = findings(review)
        .iter()
        .take(MAX_TASK_FINDINGS)
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let path = text_field(item, "path");
            if path.is_empty() {
                return None;
            }
            Some(format!(
                "- `{path}:{}` -> env `{}` ({})",
                line_field(item),
                text_field(item, "recommended_env_var"),
                text_field(item, "recommended_fix"),
            ))
        })
        .collect();
    let findings_block = if lines.is_empty() {
        "- No structured findings provided by review stage.".to_string()
    } else {
        lines.join("\n")
    };

    let extra = match extra_task.trim() {
        "" => "Perform full secret sanitization from scan findings.",
        other => other,
    };

    format!(
        "Sanitize this repository by removing hardcoded secrets and refactoring to runtime environment variables.

Execution style:
- Investigate the codebase and implement the remediation, not just recommendations.
- Follow the conventions of the detected stack: {stack_text}.
- You may edit, patch, and create files needed to complete the remediation.
- Ensure no real secrets remain in committed source files.

Required outcomes:
1. Replace hardcoded credentials, tokens and passwords with environment-variable based runtime configuration.
2. Update all relevant references so the refactor is functionally complete.
3. Add supporting config or docs artifacts when needed (for example `.env.example` with placeholders).
4. Validate through available tests, lints or focused sanity checks.
5. Summarize each changed file and why.

Prioritized review findings:
{findings_block}

Additional user goal:
{extra}
"
    )
}
