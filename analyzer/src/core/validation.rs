//! Advisory quality checks for generated analysis reports.
//!
//! Validation never blocks a run. A failing report is still written, with a
//! `## Quality Warning` block appended at the end.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Headings every report must contain, in order.
pub const REQUIRED_SECTIONS: [&str; 8] = [
    "## 1.", "## 2.", "## 3.", "## 4.", "## 5.", "## 6.", "## 7.", "## 8.",
];

pub const WARNING_HEADING: &str = "## Quality Warning";

static STORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)as a ").expect("story pattern should be valid"));

/// Backticked span with a path separator somewhere inside it.
static EVIDENCE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`[^`]+[/\\][^`]+`").expect("evidence path pattern should be valid")
});

static TABLE_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\|").expect("table row pattern should be valid"));

/// Minimum counts a report must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationThresholds {
    pub min_stories: usize,
    pub min_evidence: usize,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_stories: 15,
            min_evidence: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub issues: Vec<String>,
    pub story_count: usize,
    pub evidence_count: usize,
    pub min_stories: usize,
    pub min_evidence: usize,
}

/// Check `report` against the structural and density thresholds.
pub fn validate(report: &str, thresholds: ValidationThresholds) -> ValidationResult {
    let mut issues = Vec::new();

    let missing: Vec<&str> = REQUIRED_SECTIONS
        .iter()
        .copied()
        .filter(|heading| !report.contains(heading))
        .collect();
    if !missing.is_empty() {
        issues.push(format!("Missing required sections: {}", missing.join(", ")));
    }

    let story_count = count_stories(report);
    if story_count < thresholds.min_stories {
        issues.push(format!(
            "User stories below minimum: found {story_count}, need {}",
            thresholds.min_stories
        ));
    }

    let evidence_count = count_evidence(report);
    if evidence_count < thresholds.min_evidence {
        issues.push(format!(
            "Evidence references below minimum: found {evidence_count}, need {}",
            thresholds.min_evidence
        ));
    }

    ValidationResult {
        passed: issues.is_empty(),
        issues,
        story_count,
        evidence_count,
        min_stories: thresholds.min_stories,
        min_evidence: thresholds.min_evidence,
    }
}

/// Case-insensitive occurrences of `As a `.
pub fn count_stories(report: &str) -> usize {
    STORY_RE.find_iter(report).count()
}

/// Larger of distinct backticked paths and table rows.
pub fn count_evidence(report: &str) -> usize {
    let paths: BTreeSet<&str> = EVIDENCE_PATH_RE
        .find_iter(report)
        .map(|m| m.as_str())
        .collect();
    let table_rows = TABLE_ROW_RE.find_iter(report).count();
    paths.len().max(table_rows)
}

/// Render the warning block for a failed result.
pub fn render_quality_warning(result: &ValidationResult) -> String {
    let mut block = String::new();
    block.push_str("---\n");
    block.push_str(WARNING_HEADING);
    block.push_str("\n\n");
    block.push_str(&format!(
        "- Story count: {} (minimum {})\n",
        result.story_count, result.min_stories
    ));
    block.push_str(&format!(
        "- Evidence count: {} (minimum {})\n",
        result.evidence_count, result.min_evidence
    ));
    block.push_str("\nValidation issues:\n");
    for issue in &result.issues {
        block.push_str(&format!("- {issue}\n"));
    }
    block
}

/// Append the warning block to `report` when validation failed.
///
/// Content before the block is left untouched. A report that already ends
/// with a warning block is returned unchanged.
pub fn append_quality_warning(report: &str, result: &ValidationResult) -> String {
    if result.passed {
        return report.to_string();
    }
    let block = render_quality_warning(result);
    let trimmed = report.trim_end();
    if trimmed.ends_with(block.trim_end()) {
        return report.to_string();
    }
    let mut out = report.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&block);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_report(stories: usize, evidence: usize) -> String {
        let mut report = String::from("# Analysis\n\n");
        for n in 1..=8 {
            report.push_str(&format!("## {n}. Section {n}\n\nBody.\n\n"));
        }
        for i in 0..stories {
            report.push_str(&format!("- As a user I want feature {i}\n"));
        }
        for i in 0..evidence {
            report.push_str(&format!("- see `src/module_{i}.rs`\n"));
        }
        report
    }

    #[test]
    fn passing_report_has_no_issues() {
        let report = complete_report(15, 25);
        let result = validate(&report, ValidationThresholds::default());
        assert!(result.passed, "{:?}", result.issues);
        assert_eq!(result.story_count, 15);
        assert_eq!(result.evidence_count, 25);
    }

    #[test]
    fn missing_sections_are_listed_in_one_issue() {
        let report = "## 1. Intro\n## 3. Data\n## 8. End\n";
        let result = validate(
            report,
            ValidationThresholds {
                min_stories: 0,
                min_evidence: 0,
            },
        );
        assert!(!result.passed);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(
            result.issues[0],
            "Missing required sections: ## 2., ## 4., ## 5., ## 6., ## 7."
        );
    }

    #[test]
    fn stories_are_counted_case_insensitively() {
        assert_eq!(count_stories("As a dev\nas a user\nAS A admin\nbase a"), 3);
    }

    #[test]
    fn evidence_uses_larger_of_paths_and_table_rows() {
        let paths = "`src/a.rs` `src/a.rs` `lib\\b.rs` `plain`";
        assert_eq!(count_evidence(paths), 2);
        let table = "| a | b |\n|---|---|\n| 1 | 2 |\n";
        assert_eq!(count_evidence(table), 3);
    }

    #[test]
    fn evidence_rows_and_paths_are_anchored() {
        // Indented pipes are not table rows.
        assert_eq!(count_evidence("  | a |\n\t| b |\n| c |\n"), 1);
        // A separator needs text on both sides.
        assert_eq!(count_evidence("`/x` `x/` `/` `a/b`"), 1);
    }

    #[test]
    fn below_minimum_stories_fails_but_keeps_counts() {
        let report = complete_report(10, 25);
        let result = validate(&report, ValidationThresholds::default());
        assert!(!result.passed);
        assert_eq!(result.story_count, 10);
        assert!(result.issues[0].contains("found 10, need 15"));
    }

    #[test]
    fn warning_block_is_appended_once() {
        let report = "## 1. Only\n";
        let result = validate(report, ValidationThresholds::default());
        let once = append_quality_warning(report, &result);
        assert!(once.starts_with(report));
        assert!(once.contains(WARNING_HEADING));
        assert!(once.contains("## 2., ## 3."));
        let twice = append_quality_warning(&once, &result);
        assert_eq!(once, twice);
    }

    #[test]
    fn passing_result_leaves_report_untouched() {
        let report = complete_report(15, 25);
        let result = validate(&report, ValidationThresholds::default());
        assert_eq!(append_quality_warning(&report, &result), report);
    }
}
