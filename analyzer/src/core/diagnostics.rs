//! Command audit records and the diagnostics derived from them.

use serde::{Deserialize, Serialize};

/// Where a command originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    /// Hosted shell tool call.
    ShellTool,
    /// Function-shaped `shell` tool call.
    ShellFunction,
    /// Engine-issued external coding agent process.
    CodexCli,
}

/// Why a command was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ApprovalDenied,
    UnsafeCommandPattern,
}

/// One executed or blocked command, as persisted in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp_utc: String,
    pub source: CommandSource,
    pub cwd: String,
    pub command: String,
    pub timeout_ms: u64,
    pub timed_out: bool,
    /// `None` when the command was blocked, timed out, or killed by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated_chars: usize,
    pub stderr_truncated_chars: usize,
}

impl CommandRecord {
    /// Executed to completion with a non-zero exit code.
    pub fn failed(&self) -> bool {
        !self.blocked && !self.timed_out && matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// Aggregate counters over a finished record sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDiagnostics {
    pub total_commands: usize,
    pub failed_commands: usize,
    pub timed_out_commands: usize,
    pub blocked_commands: usize,
}

impl CommandDiagnostics {
    pub fn from_records(records: &[CommandRecord]) -> Self {
        Self {
            total_commands: records.len(),
            failed_commands: records.iter().filter(|r| r.failed()).count(),
            timed_out_commands: records.iter().filter(|r| r.timed_out).count(),
            blocked_commands: records.iter().filter(|r| r.blocked).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::command_record;

    #[test]
    fn counts_each_category_from_records() {
        let mut ok = command_record("ls");
        ok.exit_code = Some(0);
        let mut failed = command_record("false");
        failed.exit_code = Some(1);
        let mut timed_out = command_record("sleep 9");
        timed_out.timed_out = true;
        timed_out.exit_code = None;
        let mut blocked = command_record("rm -rf /");
        blocked.blocked = true;
        blocked.block_reason = Some(BlockReason::UnsafeCommandPattern);
        blocked.exit_code = None;

        let diagnostics = CommandDiagnostics::from_records(&[ok, failed, timed_out, blocked]);
        assert_eq!(
            diagnostics,
            CommandDiagnostics {
                total_commands: 4,
                failed_commands: 1,
                timed_out_commands: 1,
                blocked_commands: 1,
            }
        );
    }

    #[test]
    fn empty_sequence_is_all_zero() {
        assert_eq!(
            CommandDiagnostics::from_records(&[]),
            CommandDiagnostics::default()
        );
    }

    #[test]
    fn record_serializes_snake_case_enums() {
        let mut record = command_record("echo hi");
        record.blocked = true;
        record.block_reason = Some(BlockReason::ApprovalDenied);
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["source"], "shell_function");
        assert_eq!(json["block_reason"], "approval_denied");
    }
}
