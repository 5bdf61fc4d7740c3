//! Tool execution gateway: every shell command an agent asks for, and every
//! engine-issued subprocess, passes through here and leaves one audit record.
//!
//! Gating order per tool call:
//! 1. if any command matches the run's [`CommandPolicy`] pattern, that command
//!    is recorded as blocked and nothing in the call runs;
//! 2. otherwise the whole batch goes to the [`ApprovalGate`];
//! 3. approved commands run sequentially until the first timeout.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::diagnostics::{BlockReason, CommandDiagnostics, CommandRecord, CommandSource};
use crate::core::messages::{CommandOutcome, ToolCall, ToolCallKind, ToolResult};
use crate::core::truncate::{truncate_chars, truncate_with_notice};
use crate::core::types::RunKind;
use crate::io::artifacts::write_json;
use crate::io::command_log::CommandLog;
use crate::io::process::{ProcessOutput, ProcessRequest, run_bounded, shell_command};

pub const DIAGNOSTICS_FILE_NAME: &str = "command-diagnostics.json";

/// Shortest timeout a tool call may request.
const MIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Read-only runs may not delete, move, or reset anything.
static ANALYSIS_UNSAFE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(rm|mv|dd|mkfs|shutdown|reboot|git\s+reset|git\s+clean)\b")
        .expect("analysis unsafe pattern should be valid")
});

/// Code runs edit the checkout; only destructive commands are refused.
static CODE_UNSAFE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(^|\s)(rm\s+-rf\s+/|mkfs\b|shutdown\b|reboot\b|dd\s+if=|git\s+reset\s+--hard\b|git\s+clean\s+-fdx\b)",
    )
    .expect("code unsafe pattern should be valid")
});

/// Which commands a gateway refuses outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPolicy {
    /// Analysis and secret review: the checkout is inspected, never changed.
    ReadOnly,
    /// Code runs.
    Edit,
}

impl CommandPolicy {
    pub fn for_run(kind: RunKind) -> Self {
        match kind {
            RunKind::Analysis | RunKind::SecretReview => CommandPolicy::ReadOnly,
            RunKind::Code => CommandPolicy::Edit,
        }
    }

    pub fn is_unsafe(self, command: &str) -> bool {
        match self {
            CommandPolicy::ReadOnly => ANALYSIS_UNSAFE.is_match(command),
            CommandPolicy::Edit => CODE_UNSAFE.is_match(command),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    Approved,
    Denied,
}

/// Decides whether a batch of commands may run.
pub trait ApprovalGate {
    fn decide(&mut self, commands: &[String]) -> Approval;
}

impl<F: FnMut(&[String]) -> Approval> ApprovalGate for F {
    fn decide(&mut self, commands: &[String]) -> Approval {
        self(commands)
    }
}

/// Approves everything (`--auto-approve` / `SHELL_AUTO_APPROVE=1`).
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl ApprovalGate for AutoApprove {
    fn decide(&mut self, _commands: &[String]) -> Approval {
        Approval::Approved
    }
}

/// Prompts on `output`, reads `y`/`yes` from `input`.
pub struct InteractiveApproval<R, W> {
    input: R,
    output: W,
}

impl InteractiveApproval<io::StdinLock<'static>, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> InteractiveApproval<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, commands: &[String]) -> io::Result<bool> {
        writeln!(self.output, "Shell command approval required:")?;
        for command in commands {
            writeln!(self.output, "  {command}")?;
        }
        write!(self.output, "Proceed? [y/N] ")?;
        self.output.flush()?;
        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

impl<R: BufRead, W: Write> ApprovalGate for InteractiveApproval<R, W> {
    fn decide(&mut self, commands: &[String]) -> Approval {
        match self.prompt(commands) {
            Ok(true) => Approval::Approved,
            Ok(false) => Approval::Denied,
            Err(err) => {
                warn!(err = %err, "approval prompt failed, denying");
                Approval::Denied
            }
        }
    }
}

/// Persisted form of the diagnostics artifact.
#[derive(Debug, Clone, Serialize)]
struct DiagnosticsArtifact<'a> {
    generated_at: String,
    command_log_path: &'a Path,
    #[serde(flatten)]
    counts: CommandDiagnostics,
}

/// Frozen result of a gateway once the run is over.
#[derive(Debug, Clone)]
pub struct GatewayReport {
    pub records: Vec<CommandRecord>,
    pub diagnostics: CommandDiagnostics,
    pub command_log_path: PathBuf,
    pub diagnostics_path: PathBuf,
}

pub struct ToolGateway<'a> {
    cwd: PathBuf,
    max_output_chars: usize,
    policy: CommandPolicy,
    approval: Box<dyn ApprovalGate + 'a>,
    log: CommandLog,
    records: Vec<CommandRecord>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl<'a> ToolGateway<'a> {
    pub fn new(
        cwd: &Path,
        command_log_path: &Path,
        max_output_chars: usize,
        policy: CommandPolicy,
        approval: Box<dyn ApprovalGate + 'a>,
    ) -> Result<Self> {
        let log = CommandLog::open(command_log_path)?;
        Ok(Self {
            cwd: cwd.to_path_buf(),
            max_output_chars,
            policy,
            approval,
            log,
            records: Vec::new(),
        })
    }

    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }

    pub fn command_log_path(&self) -> &Path {
        self.log.path()
    }

    fn record(&mut self, record: CommandRecord) -> Result<()> {
        self.log.append(&record)?;
        self.records.push(record);
        Ok(())
    }

    fn blocked_record(
        &self,
        source: CommandSource,
        command: &str,
        timeout_ms: u64,
        reason: BlockReason,
    ) -> CommandRecord {
        CommandRecord {
            timestamp_utc: now_rfc3339(),
            source,
            cwd: self.cwd.display().to_string(),
            command: command.to_string(),
            timeout_ms,
            timed_out: false,
            exit_code: None,
            duration_ms: 0,
            blocked: true,
            block_reason: Some(reason),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated_chars: 0,
            stderr_truncated_chars: 0,
        }
    }

    fn executed_record(
        &self,
        source: CommandSource,
        command: &str,
        cwd: &Path,
        timeout_ms: u64,
        output: &ProcessOutput,
        stderr: &str,
    ) -> CommandRecord {
        let stdout = truncate_chars(&output.stdout_lossy(), self.max_output_chars);
        let stderr = truncate_chars(stderr, self.max_output_chars);
        CommandRecord {
            timestamp_utc: now_rfc3339(),
            source,
            cwd: cwd.display().to_string(),
            command: command.to_string(),
            timeout_ms,
            timed_out: output.timed_out,
            exit_code: output.exit_code(),
            duration_ms: output.duration.as_millis() as u64,
            blocked: false,
            block_reason: None,
            stdout: stdout.text,
            stderr: stderr.text,
            // Bytes dropped at the pipe are counted as characters.
            stdout_truncated_chars: stdout.dropped_chars + output.stdout_dropped_bytes,
            stderr_truncated_chars: stderr.dropped_chars + output.stderr_dropped_bytes,
        }
    }

    /// In-memory bound handed to the process layer; every kept char fits.
    fn output_limit_bytes(&self) -> usize {
        self.max_output_chars.saturating_mul(4).max(4096)
    }

    /// Run one model tool call through the gates.
    #[instrument(skip_all, fields(call_id = %call.id, commands = call.commands.len()))]
    pub fn execute(&mut self, call: &ToolCall) -> Result<ToolResult> {
        let source = match call.kind {
            ToolCallKind::HostedShell => CommandSource::ShellTool,
            ToolCallKind::FunctionShell => CommandSource::ShellFunction,
        };
        let timeout_ms = call.effective_timeout_ms();
        let timeout = Duration::from_millis(timeout_ms).max(MIN_COMMAND_TIMEOUT);

        if let Some(command) = call
            .commands
            .iter()
            .find(|command| self.policy.is_unsafe(command))
        {
            let reason = BlockReason::UnsafeCommandPattern;
            warn!(command = %command, policy = ?self.policy, "unsafe command, rejecting call");
            let record = self.blocked_record(source, command, timeout_ms, reason);
            self.record(record)?;
            return Ok(ToolResult {
                call_id: call.id.clone(),
                kind: call.kind,
                outcomes: vec![CommandOutcome::blocked(command, reason)],
            });
        }

        if call.commands.is_empty() {
            return Ok(ToolResult {
                call_id: call.id.clone(),
                kind: call.kind,
                outcomes: Vec::new(),
            });
        }

        let approval = self.approval.decide(&call.commands);
        debug!(?approval, commands = call.commands.len(), "approval decided");

        let mut outcomes = Vec::new();
        for command in &call.commands {
            if approval == Approval::Denied {
                let reason = BlockReason::ApprovalDenied;
                warn!(command = %command, "command denied");
                let record = self.blocked_record(source, command, timeout_ms, reason);
                self.record(record)?;
                outcomes.push(CommandOutcome::blocked(command, reason));
                continue;
            }

            let mut cmd = shell_command(command);
            cmd.current_dir(&self.cwd);
            let request = ProcessRequest {
                timeout,
                output_limit_bytes: self.output_limit_bytes(),
                ..ProcessRequest::default()
            };
            let output = run_bounded(cmd, &request)
                .with_context(|| format!("run shell command `{command}`"))?;
            let mut stderr = output.stderr_lossy();
            if output.timed_out && stderr.trim().is_empty() {
                stderr = format!("Command timed out after {}s", timeout.as_secs());
            }
            let record =
                self.executed_record(source, command, &self.cwd, timeout_ms, &output, &stderr);
            self.record(record)?;
            outcomes.push(CommandOutcome {
                command: command.clone(),
                stdout: truncate_with_notice(&output.stdout_lossy(), self.max_output_chars),
                stderr: truncate_with_notice(&stderr, self.max_output_chars),
                exit_code: output.exit_code(),
                timed_out: output.timed_out,
                blocked: None,
            });
            if output.timed_out {
                info!(command = %command, "command timed out, skipping rest of batch");
                break;
            }
        }

        Ok(ToolResult {
            call_id: call.id.clone(),
            kind: call.kind,
            outcomes,
        })
    }

    /// Run an engine-issued process without approval and record it.
    #[instrument(skip_all, fields(source = ?source, command = %command_line))]
    pub fn run_supervised(
        &mut self,
        source: CommandSource,
        command_line: &str,
        cwd: &Path,
        cmd: Command,
        request: &ProcessRequest<'_>,
    ) -> Result<ProcessOutput> {
        let output = run_bounded(cmd, request).with_context(|| format!("run `{command_line}`"))?;
        let timeout_ms = request.timeout.as_millis() as u64;
        let mut stderr = output.stderr_lossy();
        if output.timed_out && stderr.trim().is_empty() {
            stderr = format!("Command timed out after {}s", request.timeout.as_secs());
        }
        let record = self.executed_record(source, command_line, cwd, timeout_ms, &output, &stderr);
        self.record(record)?;
        Ok(output)
    }

    /// Freeze the record sequence and write the diagnostics artifact.
    pub fn finish(self, diagnostics_path: &Path) -> Result<GatewayReport> {
        let diagnostics = CommandDiagnostics::from_records(&self.records);
        let artifact = DiagnosticsArtifact {
            generated_at: now_rfc3339(),
            command_log_path: self.log.path(),
            counts: diagnostics,
        };
        write_json(diagnostics_path, &artifact)
            .with_context(|| format!("write {}", diagnostics_path.display()))?;
        info!(
            total = diagnostics.total_commands,
            failed = diagnostics.failed_commands,
            timed_out = diagnostics.timed_out_commands,
            blocked = diagnostics.blocked_commands,
            "command diagnostics written"
        );
        Ok(GatewayReport {
            command_log_path: self.log.path().to_path_buf(),
            records: self.records,
            diagnostics,
            diagnostics_path: diagnostics_path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn call(commands: &[&str], timeout_ms: Option<u64>) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            kind: ToolCallKind::FunctionShell,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout_ms,
            arguments: String::new(),
        }
    }

    fn gateway(
        dir: &Path,
        policy: CommandPolicy,
        approval: Box<dyn ApprovalGate>,
    ) -> ToolGateway<'static> {
        ToolGateway::new(dir, &dir.join("commands.jsonl"), 100, policy, approval)
            .expect("gateway")
    }

    #[test]
    fn edit_policy_matches_destructive_commands_only() {
        let policy = CommandPolicy::Edit;
        assert!(policy.is_unsafe("rm -rf /"));
        assert!(policy.is_unsafe("cd x && git reset --hard"));
        assert!(policy.is_unsafe("sudo shutdown now"));
        assert!(!policy.is_unsafe("rm -rf ./target"));
        assert!(!policy.is_unsafe("mv a b"));
        assert!(!policy.is_unsafe("rg shutdownHook"));
        assert!(!policy.is_unsafe("ls -la"));
    }

    #[test]
    fn read_only_policy_refuses_any_leading_mutation() {
        let policy = CommandPolicy::ReadOnly;
        assert!(policy.is_unsafe("rm foo"));
        assert!(policy.is_unsafe("  mv a b"));
        assert!(policy.is_unsafe("git clean -n"));
        assert!(policy.is_unsafe("git reset HEAD~1"));
        assert!(!policy.is_unsafe("ls rm"));
        assert!(!policy.is_unsafe("rmdir_list.sh"));
        assert!(!policy.is_unsafe("git status"));
    }

    #[test]
    fn policy_follows_run_kind() {
        assert_eq!(
            CommandPolicy::for_run(RunKind::Analysis),
            CommandPolicy::ReadOnly
        );
        assert_eq!(
            CommandPolicy::for_run(RunKind::SecretReview),
            CommandPolicy::ReadOnly
        );
        assert_eq!(CommandPolicy::for_run(RunKind::Code), CommandPolicy::Edit);
    }

    /// Verifies a plain `rm` in an analysis run is refused and never runs.
    #[test]
    fn read_only_gateway_blocks_rm() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("foo"), "keep").expect("write");
        let mut gateway = gateway(temp.path(), CommandPolicy::ReadOnly, Box::new(AutoApprove));
        let result = gateway.execute(&call(&["rm foo"], None)).expect("execute");
        assert!(temp.path().join("foo").exists());
        assert_eq!(
            result.outcomes[0].blocked,
            Some(BlockReason::UnsafeCommandPattern)
        );
        assert!(result.render_text().contains("Blocked unsafe command: rm foo"));
    }

    /// Verifies one unsafe command rejects the whole call: no approval is
    /// asked, the safe commands never run, and only the offender is recorded.
    #[test]
    fn unsafe_command_rejects_whole_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("marker");
        let mut asked = 0;
        let approval = Box::new(|_: &[String]| {
            asked += 1;
            Approval::Approved
        });
        let mut gateway = ToolGateway::new(
            temp.path(),
            &temp.path().join("commands.jsonl"),
            100,
            CommandPolicy::Edit,
            approval,
        )
        .expect("gateway");
        let result = gateway
            .execute(&call(&["touch marker", "rm -rf /", "echo after"], None))
            .expect("execute");
        assert!(!marker.exists());
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].command, "rm -rf /");
        let report = gateway
            .finish(&temp.path().join(DIAGNOSTICS_FILE_NAME))
            .expect("finish");
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].command, "rm -rf /");
        assert_eq!(report.diagnostics.blocked_commands, 1);
        assert_eq!(asked, 0);
    }

    #[test]
    fn interactive_approval_accepts_only_yes() {
        let mut out = Vec::new();
        let mut gate = InteractiveApproval::new(&b"yes\n"[..], &mut out);
        assert_eq!(gate.decide(&["ls".to_string()]), Approval::Approved);
        let mut gate = InteractiveApproval::new(&b"\n"[..], Vec::new());
        assert_eq!(gate.decide(&["ls".to_string()]), Approval::Denied);
        assert!(String::from_utf8_lossy(&out).contains("Proceed? [y/N]"));
    }

    #[test]
    fn denied_commands_are_recorded_and_not_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("marker");
        let mut gateway = gateway(
            temp.path(),
            CommandPolicy::Edit,
            Box::new(|_: &[String]| Approval::Denied),
        );
        let result = gateway
            .execute(&call(&["touch marker", "echo hi"], None))
            .expect("execute");
        assert!(!marker.exists());
        assert!(
            result
                .outcomes
                .iter()
                .all(|o| o.blocked == Some(BlockReason::ApprovalDenied))
        );
        let report = gateway
            .finish(&temp.path().join(DIAGNOSTICS_FILE_NAME))
            .expect("finish");
        assert_eq!(report.diagnostics.blocked_commands, 2);
        assert_eq!(report.diagnostics.total_commands, 2);
    }

    #[cfg(unix)]
    #[test]
    fn output_is_truncated_to_exact_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gateway = ToolGateway::new(
            temp.path(),
            &temp.path().join("commands.jsonl"),
            10,
            CommandPolicy::Edit,
            Box::new(AutoApprove),
        )
        .expect("gateway");
        gateway
            .execute(&call(&["printf 'abcdefghijklmnopqrstuvwxyz'"], None))
            .expect("execute");
        let record = &gateway.records()[0];
        assert_eq!(record.stdout, "abcdefghij");
        assert_eq!(record.stdout_truncated_chars, 16);
        assert_eq!(record.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn batch_stops_at_first_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gateway = gateway(temp.path(), CommandPolicy::Edit, Box::new(AutoApprove));
        let result = gateway
            .execute(&call(&["sleep 3", "echo never"], Some(10)))
            .expect("execute");
        assert_eq!(result.outcomes.len(), 1);
        assert!(result.outcomes[0].timed_out);
        let report = gateway
            .finish(&temp.path().join(DIAGNOSTICS_FILE_NAME))
            .expect("finish");
        assert_eq!(report.diagnostics.timed_out_commands, 1);
        assert_eq!(report.diagnostics.failed_commands, 0);
        let raw = fs::read_to_string(temp.path().join(DIAGNOSTICS_FILE_NAME)).expect("read");
        assert!(raw.contains("\"timed_out_commands\": 1"));
    }

    #[cfg(unix)]
    #[test]
    fn approved_commands_run_in_repo_checkout() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("hello.txt"), "hi").expect("write");
        let mut gateway = gateway(temp.path(), CommandPolicy::Edit, Box::new(AutoApprove));
        let result = gateway
            .execute(&call(&["cat hello.txt", "exit 2"], None))
            .expect("execute");
        assert_eq!(result.outcomes[0].stdout, "hi");
        assert_eq!(result.outcomes[1].exit_code, Some(2));
        let report = gateway
            .finish(&temp.path().join(DIAGNOSTICS_FILE_NAME))
            .expect("finish");
        assert_eq!(report.diagnostics.failed_commands, 1);
    }
}
