//! Collaborators shared by every run kind, and the common run epilogue.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, warn};

use crate::core::retry::{RetryPolicy, Sleeper, ThreadSleeper};
use crate::core::run::RunContext;
use crate::io::command_log::COMMAND_LOG_FILE_NAME;
use crate::io::config::Settings;
use crate::io::gateway::{
    ApprovalGate, AutoApprove, CommandPolicy, DIAGNOSTICS_FILE_NAME, InteractiveApproval,
    ToolGateway,
};
use crate::io::provider::{HttpProviderFactory, ProviderFactory};
use crate::io::repo::{GitCloneSource, RepoSource};
use crate::io::workspace::{RunDetails, RunSummary, finalize_run};

/// Factory for approval gates; each run gets a fresh one.
pub type ApprovalFactory<'a> = Box<dyn FnMut() -> Box<dyn ApprovalGate + 'a> + 'a>;

/// External seams of the engine.
pub struct Services<'a> {
    pub providers: Box<dyn ProviderFactory + 'a>,
    pub repos: Box<dyn RepoSource + 'a>,
    pub approvals: ApprovalFactory<'a>,
    pub sleeper: Box<dyn Sleeper + 'a>,
}

impl Services<'static> {
    /// HTTP providers, `git clone`, real sleeps, and either auto-approval or a
    /// stdin prompt.
    pub fn production(auto_approve: bool) -> Self {
        let approvals: ApprovalFactory<'static> = if auto_approve {
            Box::new(|| Box::new(AutoApprove) as Box<dyn ApprovalGate>)
        } else {
            Box::new(|| Box::new(InteractiveApproval::stdio()) as Box<dyn ApprovalGate>)
        };
        Self {
            providers: Box::new(HttpProviderFactory),
            repos: Box::new(GitCloneSource),
            approvals,
            sleeper: Box::new(ThreadSleeper),
        }
    }
}

impl<'a> Services<'a> {
    /// Gateway rooted at `repo_path`, logging to the override or `<run_dir>/commands.jsonl`.
    pub fn gateway(
        &mut self,
        ctx: &RunContext,
        settings: &Settings,
        repo_path: &Path,
        command_log_override: Option<&Path>,
    ) -> Result<ToolGateway<'a>> {
        let log_path = command_log_path(ctx, command_log_override);
        ToolGateway::new(
            repo_path,
            &log_path,
            settings.command_log_max_output_chars,
            CommandPolicy::for_run(ctx.kind),
            (self.approvals)(),
        )
    }
}

pub fn command_log_path(ctx: &RunContext, command_log_override: Option<&Path>) -> PathBuf {
    command_log_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.run_dir.join(COMMAND_LOG_FILE_NAME))
}

pub fn retry_policy(settings: &Settings) -> RetryPolicy {
    RetryPolicy::new(settings.retries, settings.retry_backoff_seconds)
}

/// How a run ended, as seen by its caller.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    /// Final report or agent output, when the run produced one.
    pub report: Option<String>,
    /// The failure that ended the run, already recorded in the summary.
    pub error: Option<anyhow::Error>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Write diagnostics (when a gateway was opened), then the report and summary.
pub fn close_run(
    ctx: &mut RunContext,
    gateway: Option<ToolGateway<'_>>,
    result: Result<Option<String>>,
    mut details: RunDetails,
) -> Result<RunOutcome> {
    if let Some(gateway) = gateway {
        match gateway.finish(&ctx.run_dir.join(DIAGNOSTICS_FILE_NAME)) {
            Ok(report) => details.gateway = Some(report),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to write command diagnostics"),
        }
    }
    let (report, error) = match result {
        Ok(report) => (report, None),
        Err(err) => {
            error!(run_id = %ctx.run_id, err = %format!("{err:#}"), "run failed");
            (None, Some(err))
        }
    };
    let summary = finalize_run(ctx, report.as_deref(), error.as_ref(), details)?;
    Ok(RunOutcome {
        summary,
        report,
        error,
    })
}
