//! Provider-neutral conversation model for the agent loop.

use serde::{Deserialize, Serialize};

use crate::core::diagnostics::BlockReason;

/// Default per-command timeout when a tool call does not set one.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;

/// Which tool surface a call arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    /// Hosted `shell` tool (OpenAI Responses API).
    HostedShell,
    /// Function tool named `shell`.
    FunctionShell,
}

/// A shell request from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolCallKind,
    pub commands: Vec<String>,
    pub timeout_ms: Option<u64>,
    /// Raw argument payload, echoed back to providers that need it.
    pub arguments: String,
}

impl ToolCall {
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_TOOL_TIMEOUT_MS)
    }
}

/// Result of one command as reported back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub blocked: Option<BlockReason>,
}

impl CommandOutcome {
    pub fn blocked(command: &str, reason: BlockReason) -> Self {
        Self {
            command: command.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
            blocked: Some(reason),
        }
    }
}

/// Gateway answer to one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub kind: ToolCallKind,
    pub outcomes: Vec<CommandOutcome>,
}

impl ToolResult {
    /// Text rendering used for function-shaped tool output.
    pub fn render_text(&self) -> String {
        if self.outcomes.is_empty() {
            return "No command provided.".to_string();
        }
        let mut parts = Vec::new();
        for outcome in &self.outcomes {
            match outcome.blocked {
                Some(BlockReason::UnsafeCommandPattern) => {
                    parts.push(format!("Blocked unsafe command: {}", outcome.command));
                    continue;
                }
                Some(BlockReason::ApprovalDenied) => {
                    parts.push(format!(
                        "Shell command execution rejected by user: {}",
                        outcome.command
                    ));
                    continue;
                }
                None => {}
            }
            parts.push(format!("$ {}", outcome.command));
            if outcome.timed_out {
                parts.push("Command timed out".to_string());
                parts.push("[exit_code=124]".to_string());
                continue;
            }
            let combined = format!("{}{}", outcome.stdout, outcome.stderr);
            let combined = combined.trim();
            parts.push(if combined.is_empty() {
                "(no output)".to_string()
            } else {
                combined.to_string()
            });
            match outcome.exit_code {
                Some(code) => parts.push(format!("[exit_code={code}]")),
                None => parts.push("[exit_code=signal]".to_string()),
            }
        }
        parts.join("\n")
    }
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    System(String),
    User(String),
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool(ToolResult),
}

/// What the provider returned for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResponse {
    Final(String),
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
}
