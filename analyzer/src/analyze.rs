//! `analyzer analyze`: reverse engineer a repository into a requirements report.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agent::{AgentTask, run_agent};
use crate::core::backend::{EnvSnapshot, resolve_backend};
use crate::core::run::RunContext;
use crate::core::types::{RunKind, RunStatus};
use crate::core::validation::{ValidationThresholds, append_quality_warning, validate};
use crate::io::artifacts::write_text;
use crate::io::config::Settings;
use crate::io::gateway::ToolGateway;
use crate::io::prompt::{KICKOFF_MESSAGE, analysis_prompt};
use crate::io::scan::build_snapshot;
use crate::io::workspace::{RunDetails, create_run, persist_snapshot};
use crate::runtime::{RunOutcome, Services, close_run, retry_policy};

#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    /// Local path or clone URL.
    pub repo: String,
    pub model: Option<String>,
    pub focus: Option<String>,
    /// Extra copy of the final report.
    pub output: Option<PathBuf>,
    /// Accepted for compatibility; validation always runs.
    pub skip_validation: bool,
    pub command_log_path: Option<PathBuf>,
}

/// Run one analysis. Configuration errors surface before any run directory exists.
#[instrument(skip_all, fields(repo = %request.repo))]
pub fn analyze(
    env: &EnvSnapshot,
    settings: &Settings,
    services: &mut Services<'_>,
    request: &AnalyzeRequest,
) -> Result<RunOutcome> {
    let backend = resolve_backend(env, None)?;
    let requested = request.model.as_deref().unwrap_or(&settings.model);
    let effective = backend.effective_model(requested);
    let mut ctx = create_run(
        &settings.workspace,
        RunKind::Analysis,
        &backend,
        requested,
        &effective,
    )?;
    ctx.transition(RunStatus::Running, Utc::now())?;

    if request.skip_validation {
        warn!("--skip-validation is deprecated and ignored; validation is advisory and always runs");
    }

    let mut details = RunDetails {
        repo_input: Some(request.repo.clone()),
        ..RunDetails::default()
    };
    let mut gateway = None;
    let result = analyze_inner(&ctx, settings, services, request, &mut details, &mut gateway);
    close_run(&mut ctx, gateway, result.map(Some), details)
}

fn analyze_inner<'a>(
    ctx: &RunContext,
    settings: &Settings,
    services: &mut Services<'a>,
    request: &AnalyzeRequest,
    details: &mut RunDetails,
    gateway_slot: &mut Option<ToolGateway<'a>>,
) -> Result<String> {
    let repo_path = services
        .repos
        .acquire(&request.repo, &ctx.run_dir)
        .context("acquire repository")?;
    details.repo_path = Some(repo_path.clone());

    let snapshot = build_snapshot(&repo_path)?;
    let scan_path = persist_snapshot(ctx, &snapshot)?;
    details.scan_path = Some(scan_path.clone());

    let thresholds = ValidationThresholds {
        min_stories: settings.validation.min_stories,
        min_evidence: settings.validation.min_evidence,
    };
    let task = AgentTask {
        instructions: analysis_prompt(
            &repo_path,
            &scan_path,
            request.focus.as_deref(),
            thresholds,
        )?,
        kickoff: KICKOFF_MESSAGE.to_string(),
        max_turns: settings.analysis_max_turns,
        retry: retry_policy(settings),
    };

    let mut provider = services
        .providers
        .provider(&ctx.backend, &ctx.effective_model);
    let gateway = gateway_slot.insert(services.gateway(
        ctx,
        settings,
        &repo_path,
        request.command_log_path.as_deref(),
    )?);
    let outcome = run_agent(
        provider.as_mut(),
        gateway,
        services.sleeper.as_mut(),
        &task,
        &mut details.retry_waits_secs,
    )?;

    let validation = validate(&outcome.final_output, thresholds);
    if validation.passed {
        info!(
            stories = validation.story_count,
            evidence = validation.evidence_count,
            "report passed validation"
        );
    } else {
        warn!(issues = ?validation.issues, "report failed validation");
    }
    let report = append_quality_warning(&outcome.final_output, &validation);
    details.validation = Some(validation);

    if let Some(output) = &request.output {
        write_text(output, &report)
            .with_context(|| format!("write output copy {}", output.display()))?;
        details.output_path = Some(output.clone());
    }
    Ok(report)
}
