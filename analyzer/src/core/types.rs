//! Shared closed enums for run orchestration.
//!
//! Every value here serializes to a stable lowercase string because it ends up
//! in persisted artifacts (`run-summary.json`, `commands.jsonl`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which workflow a run directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Analysis,
    Code,
    SecretReview,
}

impl RunKind {
    /// Directory name prefix for runs of this kind.
    pub fn dir_prefix(self) -> &'static str {
        match self {
            RunKind::Analysis => "run",
            RunKind::Code => "code-run",
            RunKind::SecretReview => "secret-run",
        }
    }
}

/// Lifecycle status of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Model provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Azure,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::OpenAi => write!(f, "openai"),
            Provider::Azure => write!(f, "azure"),
        }
    }
}

/// Request/response API shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    Responses,
    ChatCompletions,
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiMode::Responses => write!(f, "responses"),
            ApiMode::ChatCompletions => write!(f, "chat_completions"),
        }
    }
}

impl FromStr for ApiMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "responses" => Ok(ApiMode::Responses),
            "chat_completions" => Ok(ApiMode::ChatCompletions),
            other => Err(format!(
                "OPENAI_API_MODE must be 'responses' or 'chat_completions', got '{other}'"
            )),
        }
    }
}

/// Wire shape used to expose the shell capability to the model.
///
/// `Hosted` uses the provider's built-in shell tool items; `Function` declares
/// a plain function tool named `shell`. Execution semantics are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolShape {
    Hosted,
    Function,
}

/// Execution backend for coding runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CodeBackend {
    /// In-process tool-calling loop against the resolved provider.
    #[value(name = "agents_sdk")]
    AgentsSdk,
    /// External `codex exec` process under a wall-clock timeout.
    #[value(name = "codex_cli")]
    CodexCli,
}

impl fmt::Display for CodeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeBackend::AgentsSdk => write!(f, "agents_sdk"),
            CodeBackend::CodexCli => write!(f, "codex_cli"),
        }
    }
}

impl FromStr for CodeBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "agents_sdk" => Ok(CodeBackend::AgentsSdk),
            "codex_cli" => Ok(CodeBackend::CodexCli),
            other => Err(format!(
                "code backend must be 'agents_sdk' or 'codex_cli', got '{other}'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_lowercase() {
        let json = serde_json::to_string(&RunStatus::Completed).expect("serialize");
        assert_eq!(json, "\"completed\"");
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn api_mode_parses_known_values_only() {
        assert_eq!(
            " Chat_Completions ".parse::<ApiMode>(),
            Ok(ApiMode::ChatCompletions)
        );
        assert!("assistants".parse::<ApiMode>().is_err());
    }

    #[test]
    fn code_backend_round_trips_through_display() {
        for backend in [CodeBackend::AgentsSdk, CodeBackend::CodexCli] {
            assert_eq!(backend.to_string().parse::<CodeBackend>(), Ok(backend));
        }
    }
}
