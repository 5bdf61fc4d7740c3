//! `analyzer secrets`: review a fresh clone for hardcoded secrets, then remediate.
//!
//! The review stage owns a `secret-run-*` directory holding the clone and all
//! review artifacts. The remediation stage is an ordinary code run against
//! that clone, with its own directory and its own backend. Progress is
//! tracked by [`WorkflowMachine`]; `workflow-summary.json` is written whatever
//! the outcome.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::agent::{AgentTask, run_agent};
use crate::code::{AnalysisContext, CodeRequest, run_code};
use crate::core::backend::{EnvSnapshot, describe_backend, resolve_backend};
use crate::core::errors::error_kind;
use crate::core::review::{
    build_secret_refactor_task, extract_review_json, findings_count, review_schema_issues,
};
use crate::core::run::RunContext;
use crate::core::secret_flow::{WorkflowMachine, WorkflowState};
use crate::core::types::{CodeBackend, RunKind, RunStatus};
use crate::io::artifacts::{write_json, write_text};
use crate::io::config::Settings;
use crate::io::gateway::ToolGateway;
use crate::io::prompt::{KICKOFF_MESSAGE, secret_review_prompt};
use crate::io::repo::CLONE_DIR_NAME;
use crate::io::scan::build_snapshot;
use crate::io::secret_scan::build_secret_scan;
use crate::io::workspace::{RunDetails, create_run, persist_snapshot};
use crate::runtime::{RunOutcome, Services, close_run, retry_policy};

pub const REVIEW_ENV_PREFIX: &str = "SECRET_REVIEW_";
pub const CODE_ENV_PREFIX: &str = "SECRET_CODE_";

pub const SECRET_SCAN_FILE_NAME: &str = "secret-scan.json";
pub const REVIEW_OUTPUT_FILE_NAME: &str = "secret-review-output.md";
pub const REVIEW_JSON_FILE_NAME: &str = "secret-review.json";
pub const REMEDIATION_OUTPUT_FILE_NAME: &str = "secret-sanitization-output.md";
pub const WORKFLOW_SUMMARY_FILE_NAME: &str = "workflow-summary.json";

#[derive(Debug, Clone, Default)]
pub struct SecretsRequest {
    /// Local path or clone URL; always cloned fresh.
    pub repo: String,
    /// Extra remediation goal appended to the generated task.
    pub task: Option<String>,
    pub review_model: Option<String>,
    pub review_deployment: Option<String>,
    pub code_model: Option<String>,
    pub code_deployment: Option<String>,
    pub code_backend: Option<CodeBackend>,
    pub codex_profile: Option<String>,
    pub codex_timeout: Option<Duration>,
    /// Applies to the review stage; the code stage logs into its own run directory.
    pub command_log_path: Option<PathBuf>,
}

/// `workflow-summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub workflow_status: WorkflowState,
    pub states: Vec<WorkflowState>,
    pub repo_input: String,
    pub repo_path: PathBuf,
    pub secret_scan_path: Option<PathBuf>,
    pub prescan_findings_count: usize,
    pub review_output_path: Option<PathBuf>,
    pub review_json_path: Option<PathBuf>,
    pub review_findings_count: usize,
    pub review_schema_issues: Vec<String>,
    pub review_model_used: String,
    pub code_backend: CodeBackend,
    pub code_agent_run_dir: Option<PathBuf>,
    pub code_agent_output_path: Option<PathBuf>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug)]
pub struct SecretWorkflowOutcome {
    pub summary: WorkflowSummary,
    pub summary_path: PathBuf,
    pub review: RunOutcome,
    pub code: Option<RunOutcome>,
}

impl SecretWorkflowOutcome {
    pub fn succeeded(&self) -> bool {
        self.summary.workflow_status == WorkflowState::Done
    }
}

#[derive(Debug, Default)]
struct ReviewArtifacts {
    secret_scan_path: Option<PathBuf>,
    prescan_count: usize,
    output_path: Option<PathBuf>,
    json_path: Option<PathBuf>,
    review: Value,
    raw: String,
    schema_issues: Vec<String>,
}

fn advance(machine: &mut WorkflowMachine, to: WorkflowState) -> Result<()> {
    machine
        .advance(to)
        .with_context(|| format!("advance secret workflow to {to:?}"))?;
    info!(state = ?to, "secret workflow advanced");
    Ok(())
}

/// Run both stages. Configuration for either stage is checked before any
/// directory is created.
#[instrument(skip_all, fields(repo = %request.repo))]
pub fn run_secret_workflow(
    env: &EnvSnapshot,
    settings: &Settings,
    services: &mut Services<'_>,
    request: &SecretsRequest,
) -> Result<SecretWorkflowOutcome> {
    let review_backend = resolve_backend(env, Some(REVIEW_ENV_PREFIX))?;
    let code_backend = request.code_backend.unwrap_or(settings.secrets.code_backend);
    match code_backend {
        CodeBackend::AgentsSdk => {
            resolve_backend(env, Some(CODE_ENV_PREFIX))?;
        }
        CodeBackend::CodexCli => {
            describe_backend(env, Some(CODE_ENV_PREFIX))?;
        }
    }

    let review_model = request
        .review_model
        .as_deref()
        .unwrap_or(&settings.secrets.review_model);
    let review_deployment = request
        .review_deployment
        .as_deref()
        .or(settings.secrets.review_deployment.as_deref());
    let effective = review_backend.stage_model(review_model, review_deployment);

    let mut ctx = create_run(
        &settings.workspace,
        RunKind::SecretReview,
        &review_backend,
        review_model,
        &effective,
    )?;
    ctx.transition(RunStatus::Running, Utc::now())?;
    let repo_path = ctx.run_dir.join(CLONE_DIR_NAME);
    let mut machine = WorkflowMachine::new();

    let mut details = RunDetails {
        repo_input: Some(request.repo.clone()),
        repo_path: Some(repo_path.clone()),
        ..RunDetails::default()
    };
    let mut artifacts = ReviewArtifacts::default();
    let mut gateway = None;
    let result = review_stage(
        &ctx,
        settings,
        services,
        request,
        &mut machine,
        &mut artifacts,
        &mut details,
        &mut gateway,
    );
    details.extra.insert(
        "review_findings_count".to_string(),
        Value::from(findings_count(&artifacts.review)),
    );
    let review = close_run(&mut ctx, gateway, result.map(|()| None), details)?;

    let mut code = None;
    let mut failure: Option<(String, String)> = review
        .error
        .as_ref()
        .map(|err| (error_kind(err).to_string(), format!("{err:#}")));
    let mut code_output_path = None;

    if failure.is_none() {
        let extra_task = request.task.as_deref().unwrap_or_default();
        let code_request = CodeRequest {
            repo: repo_path.display().to_string(),
            task: build_secret_refactor_task(&artifacts.review, extra_task),
            backend: code_backend,
            model: request
                .code_model
                .clone()
                .unwrap_or_else(|| settings.secrets.code_model.clone()),
            deployment: request
                .code_deployment
                .clone()
                .or_else(|| settings.secrets.code_deployment.clone()),
            env_prefix: Some(CODE_ENV_PREFIX.to_string()),
            analysis_context: AnalysisContext::Text(artifacts.raw.clone()),
            output: None,
            codex_profile: request
                .codex_profile
                .clone()
                .or_else(|| settings.secrets.codex_profile.clone()),
            codex_timeout: request
                .codex_timeout
                .unwrap_or(Duration::from_secs(settings.code.codex_timeout_seconds)),
            command_log_path: None,
        };
        let result = remediation_stage(
            env,
            settings,
            services,
            &code_request,
            &ctx,
            &mut machine,
            &mut code,
        );
        let stage_error = match &result {
            Ok(Some(path)) => {
                code_output_path = Some(path.clone());
                None
            }
            Ok(None) => code.as_ref().and_then(|c| c.error.as_ref()),
            Err(err) => Some(err),
        };
        if let Some(err) = stage_error {
            warn!(err = %format!("{err:#}"), "remediation stage failed");
            failure = Some((error_kind(err).to_string(), format!("{err:#}")));
        }
    }
    if failure.is_some() {
        advance(&mut machine, WorkflowState::Failed)?;
    }

    let (error_kind, error_message) = failure.unzip();
    let summary = WorkflowSummary {
        run_id: ctx.run_id.clone(),
        run_dir: ctx.run_dir.clone(),
        workflow_status: machine.state(),
        states: machine.history().to_vec(),
        repo_input: request.repo.clone(),
        repo_path,
        secret_scan_path: artifacts.secret_scan_path,
        prescan_findings_count: artifacts.prescan_count,
        review_output_path: artifacts.output_path,
        review_json_path: artifacts.json_path,
        review_findings_count: findings_count(&artifacts.review),
        review_schema_issues: artifacts.schema_issues,
        review_model_used: ctx.effective_model.clone(),
        code_backend,
        code_agent_run_dir: code.as_ref().map(|c| c.summary.run_dir.clone()),
        code_agent_output_path: code_output_path,
        error_kind,
        error_message,
    };
    let summary_path = ctx.run_dir.join(WORKFLOW_SUMMARY_FILE_NAME);
    write_json(&summary_path, &summary)?;
    info!(status = ?summary.workflow_status, path = %summary_path.display(), "secret workflow finished");

    Ok(SecretWorkflowOutcome {
        summary,
        summary_path,
        review,
        code,
    })
}

/// Run the code stage against the review clone. `Ok(Some(path))` once the
/// remediation output is written, `Ok(None)` when the code run itself failed
/// (its error stays on the outcome in `code_slot`).
fn remediation_stage(
    env: &EnvSnapshot,
    settings: &Settings,
    services: &mut Services<'_>,
    code_request: &CodeRequest,
    ctx: &RunContext,
    machine: &mut WorkflowMachine,
    code_slot: &mut Option<RunOutcome>,
) -> Result<Option<PathBuf>> {
    let outcome = code_slot.insert(
        run_code(env, settings, services, code_request).context("code stage")?,
    );
    if outcome.error.is_some() {
        return Ok(None);
    }
    advance(machine, WorkflowState::Remediated)?;
    let path = ctx.run_dir.join(REMEDIATION_OUTPUT_FILE_NAME);
    write_text(&path, outcome.report.as_deref().unwrap_or_default())
        .context("write remediation output")?;
    advance(machine, WorkflowState::Done)?;
    Ok(Some(path))
}

#[allow(clippy::too_many_arguments)]
fn review_stage<'a>(
    ctx: &RunContext,
    settings: &Settings,
    services: &mut Services<'a>,
    request: &SecretsRequest,
    machine: &mut WorkflowMachine,
    artifacts: &mut ReviewArtifacts,
    details: &mut RunDetails,
    gateway_slot: &mut Option<ToolGateway<'a>>,
) -> Result<()> {
    let repo_path = ctx.run_dir.join(CLONE_DIR_NAME);
    services
        .repos
        .clone_fresh(&request.repo, &repo_path)
        .context("fresh clone for secret review")?;
    advance(machine, WorkflowState::Cloned)?;

    let scan = build_secret_scan(&repo_path)?;
    let scan_path = ctx.run_dir.join(SECRET_SCAN_FILE_NAME);
    write_json(&scan_path, &scan)?;
    artifacts.secret_scan_path = Some(scan_path.clone());
    artifacts.prescan_count = scan.finding_count;
    details.scan_path = Some(persist_snapshot(ctx, &build_snapshot(&repo_path)?)?);

    let task = AgentTask {
        instructions: secret_review_prompt(&repo_path, &scan_path, scan.finding_count)?,
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

    let output_path = ctx.run_dir.join(REVIEW_OUTPUT_FILE_NAME);
    write_text(&output_path, &outcome.final_output)?;
    artifacts.output_path = Some(output_path);

    let review = extract_review_json(&outcome.final_output);
    let json_path = ctx.run_dir.join(REVIEW_JSON_FILE_NAME);
    write_json(&json_path, &review)?;
    artifacts.json_path = Some(json_path);
    artifacts.schema_issues = review_schema_issues(&review);
    if !artifacts.schema_issues.is_empty() {
        warn!(issues = ?artifacts.schema_issues, "review output does not match the findings schema");
    }
    details.extra.insert(
        "review_schema_issues".to_string(),
        json!(artifacts.schema_issues),
    );
    artifacts.review = review;
    artifacts.raw = outcome.final_output;

    advance(machine, WorkflowState::Reviewed)
}
