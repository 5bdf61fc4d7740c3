//! `analyzer code`: carry out a coding task in a repository.
//!
//! Two backends share one run lifecycle. `agents_sdk` drives the in-process
//! tool-calling loop; `codex_cli` hands the whole task to `codex exec` under a
//! hard wall-clock timeout, supervised by the gateway so the process shows up
//! in the command log like any other command.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentTask, run_agent};
use crate::core::backend::{BackendConfig, EnvSnapshot, describe_backend, resolve_backend};
use crate::core::diagnostics::CommandSource;
use crate::core::errors::EngineError;
use crate::core::run::RunContext;
use crate::core::truncate::truncate_with_notice;
use crate::core::types::{CodeBackend, RunKind, RunStatus};
use crate::io::artifacts::write_text;
use crate::io::config::Settings;
use crate::io::gateway::ToolGateway;
use crate::io::process::ProcessRequest;
use crate::io::prompt::{KICKOFF_MESSAGE, code_prompt, codex_cli_prompt};
use crate::io::workspace::{RunDetails, create_run};
use crate::runtime::{RunOutcome, Services, close_run, retry_policy};

pub const CODEX_LAST_MESSAGE_FILE_NAME: &str = "codex-last-message.txt";
pub const CODEX_STDOUT_LOG_FILE_NAME: &str = "codex-cli.stdout.log";
pub const CODEX_STDERR_LOG_FILE_NAME: &str = "codex-cli.stderr.log";

/// In-memory cap on captured `codex exec` output; the stream logs keep everything.
const CODEX_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Prior analysis to hand the coding agent.
#[derive(Debug, Clone, Default)]
pub enum AnalysisContext {
    #[default]
    None,
    /// Report file on disk; a missing file fails the run.
    File(PathBuf),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct CodeRequest {
    /// Local path or clone URL.
    pub repo: String,
    pub task: String,
    pub backend: CodeBackend,
    pub model: String,
    /// Azure deployment that overrides the model mapping.
    pub deployment: Option<String>,
    /// Credential prefix for this stage (for example `SECRET_CODE_`).
    pub env_prefix: Option<String>,
    pub analysis_context: AnalysisContext,
    pub output: Option<PathBuf>,
    pub codex_profile: Option<String>,
    pub codex_timeout: Duration,
    pub command_log_path: Option<PathBuf>,
}

impl CodeRequest {
    /// Request with the defaults from `settings`.
    pub fn from_settings(settings: &Settings, repo: &str, task: &str) -> Self {
        Self {
            repo: repo.to_string(),
            task: task.to_string(),
            backend: settings.code.backend,
            model: settings.code.model.clone(),
            deployment: None,
            env_prefix: None,
            analysis_context: AnalysisContext::None,
            output: None,
            codex_profile: settings.code.codex_profile.clone(),
            codex_timeout: Duration::from_secs(settings.code.codex_timeout_seconds),
            command_log_path: None,
        }
    }
}

/// Run one coding task.
#[instrument(skip_all, fields(repo = %request.repo, backend = %request.backend))]
pub fn run_code(
    env: &EnvSnapshot,
    settings: &Settings,
    services: &mut Services<'_>,
    request: &CodeRequest,
) -> Result<RunOutcome> {
    let backend = code_backend_config(env, request)?;
    let effective = backend.stage_model(&request.model, request.deployment.as_deref());
    let mut ctx = create_run(
        &settings.workspace,
        RunKind::Code,
        &backend,
        &request.model,
        &effective,
    )?;
    ctx.transition(RunStatus::Running, Utc::now())?;

    let mut details = RunDetails {
        repo_input: Some(request.repo.clone()),
        ..RunDetails::default()
    };
    details
        .extra
        .insert("code_backend".to_string(), Value::from(request.backend.to_string()));
    let mut gateway = None;
    let result = code_inner(&ctx, settings, services, request, &mut details, &mut gateway);
    close_run(&mut ctx, gateway, result.map(Some), details)
}

/// Credentials are only needed when this process talks to the model itself.
fn code_backend_config(env: &EnvSnapshot, request: &CodeRequest) -> Result<BackendConfig> {
    let prefix = request.env_prefix.as_deref();
    let config = match request.backend {
        CodeBackend::AgentsSdk => resolve_backend(env, prefix)?,
        CodeBackend::CodexCli => describe_backend(env, prefix)?,
    };
    Ok(config)
}

fn load_analysis_context(context: &AnalysisContext, max_chars: usize) -> Result<Option<String>> {
    let raw = match context {
        AnalysisContext::None => return Ok(None),
        AnalysisContext::Text(text) => text.clone(),
        AnalysisContext::File(path) => {
            if !path.exists() {
                bail!("analysis report not found: {}", path.display());
            }
            let bytes =
                fs::read(path).with_context(|| format!("read analysis report {}", path.display()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(truncate_with_notice(raw, max_chars)))
}

fn code_inner<'a>(
    ctx: &RunContext,
    settings: &Settings,
    services: &mut Services<'a>,
    request: &CodeRequest,
    details: &mut RunDetails,
    gateway_slot: &mut Option<ToolGateway<'a>>,
) -> Result<String> {
    let repo_path = services
        .repos
        .acquire(&request.repo, &ctx.run_dir)
        .context("acquire repository")?;
    details.repo_path = Some(repo_path.clone());

    let analysis = load_analysis_context(
        &request.analysis_context,
        settings.code.analysis_context_max_chars,
    )?;
    let gateway = gateway_slot.insert(services.gateway(
        ctx,
        settings,
        &repo_path,
        request.command_log_path.as_deref(),
    )?);

    let final_output = match request.backend {
        CodeBackend::AgentsSdk => {
            let task = AgentTask {
                instructions: code_prompt(&repo_path, &request.task, analysis.as_deref())?,
                kickoff: KICKOFF_MESSAGE.to_string(),
                max_turns: settings.code_max_turns,
                retry: retry_policy(settings),
            };
            let mut provider = services
                .providers
                .provider(&ctx.backend, &ctx.effective_model);
            run_agent(
                provider.as_mut(),
                gateway,
                services.sleeper.as_mut(),
                &task,
                &mut details.retry_waits_secs,
            )?
            .final_output
        }
        CodeBackend::CodexCli => {
            let prompt = codex_cli_prompt(&repo_path, &request.task, analysis.as_deref())?;
            run_codex_cli(ctx, settings, request, &repo_path, &prompt, gateway, details)?
        }
    };

    if let Some(output) = &request.output {
        write_text(output, &final_output)
            .with_context(|| format!("write output copy {}", output.display()))?;
        details.output_path = Some(output.clone());
    }
    Ok(final_output)
}

/// Single-line rendering of `cmd` for the command log.
fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

fn codex_command(
    settings: &Settings,
    request: &CodeRequest,
    repo_path: &Path,
    model: &str,
    last_message_path: &Path,
) -> Command {
    let mut cmd = Command::new(&settings.code.codex_bin);
    cmd.arg("exec").arg("--full-auto");
    if let Some(profile) = request
        .codex_profile
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        cmd.arg("--profile").arg(profile);
    }
    cmd.arg("--cd")
        .arg(repo_path)
        .arg("--output-last-message")
        .arg(last_message_path)
        .arg("--json")
        .arg("-m")
        .arg(model)
        .arg("-")
        .current_dir(repo_path);
    cmd
}

#[instrument(skip_all, fields(timeout_secs = request.codex_timeout.as_secs()))]
fn run_codex_cli(
    ctx: &RunContext,
    settings: &Settings,
    request: &CodeRequest,
    repo_path: &Path,
    prompt: &str,
    gateway: &mut ToolGateway<'_>,
    details: &mut RunDetails,
) -> Result<String> {
    let last_message_path = ctx.run_dir.join(CODEX_LAST_MESSAGE_FILE_NAME);
    let stdout_log = ctx.run_dir.join(CODEX_STDOUT_LOG_FILE_NAME);
    let stderr_log = ctx.run_dir.join(CODEX_STDERR_LOG_FILE_NAME);
    details.extra.insert(
        "codex_stdout_log".to_string(),
        Value::from(stdout_log.display().to_string()),
    );
    details.extra.insert(
        "codex_stderr_log".to_string(),
        Value::from(stderr_log.display().to_string()),
    );

    let cmd = codex_command(
        settings,
        request,
        repo_path,
        &ctx.effective_model,
        &last_message_path,
    );
    let line = command_line(&cmd);
    info!(command = %line, "starting codex exec");
    let process = ProcessRequest {
        stdin: Some(prompt.as_bytes()),
        timeout: request.codex_timeout,
        output_limit_bytes: CODEX_OUTPUT_LIMIT_BYTES,
        stdout_stream: Some(stdout_log.clone()),
        stderr_stream: Some(stderr_log.clone()),
    };
    let output = gateway.run_supervised(CommandSource::CodexCli, &line, repo_path, cmd, &process)?;

    if output.timed_out {
        warn!(
            timeout_secs = request.codex_timeout.as_secs(),
            "codex exec timed out; process killed, edits left in place"
        );
        return Err(EngineError::Timeout {
            stage: "codex exec".to_string(),
            timeout_secs: request.codex_timeout.as_secs(),
        })
        .with_context(|| {
            format!(
                "codex exec stopped, logs in {} and {}",
                stdout_log.display(),
                stderr_log.display()
            )
        });
    }
    if !output.status.success() {
        bail!(
            "codex exec failed with exit code {:?}. See {} and {}.",
            output.status.code(),
            stdout_log.display(),
            stderr_log.display()
        );
    }

    let last_message = fs::read_to_string(&last_message_path).ok();
    match last_message.filter(|m| !m.trim().is_empty()) {
        Some(message) => {
            debug!(path = %last_message_path.display(), "using codex last message");
            Ok(message)
        }
        None => Ok(output.stdout_lossy()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_command_line_includes_profile_and_model() {
        let settings = Settings::default();
        let mut request = CodeRequest::from_settings(&settings, "/repo", "task");
        request.codex_profile = Some("ci".to_string());
        let cmd = codex_command(
            &settings,
            &request,
            Path::new("/repo"),
            "gpt-5.1-codex-mini",
            Path::new("/run/codex-last-message.txt"),
        );
        assert_eq!(
            command_line(&cmd),
            "codex exec --full-auto --profile ci --cd /repo --output-last-message /run/codex-last-message.txt --json -m gpt-5.1-codex-mini -"
        );
    }

    #[test]
    fn analysis_context_is_truncated() {
        let context = AnalysisContext::Text("x".repeat(50));
        let loaded = load_analysis_context(&context, 10)
            .expect("load")
            .expect("some");
        assert!(loaded.starts_with("xxxxxxxxxx\n... [truncated 40 chars]"));
        assert_eq!(
            load_analysis_context(&AnalysisContext::Text("  ".to_string()), 10).expect("load"),
            None
        );
    }

    #[test]
    fn only_agents_sdk_requires_credentials() {
        let settings = Settings::default();
        let empty = EnvSnapshot::default();
        let mut request = CodeRequest::from_settings(&settings, "/repo", "task");

        request.backend = CodeBackend::AgentsSdk;
        let err = code_backend_config(&empty, &request).unwrap_err();
        assert!(crate::core::errors::is_configuration_error(&err));

        request.backend = CodeBackend::CodexCli;
        let config = code_backend_config(&empty, &request).expect("codex needs no key");
        assert_eq!(config.api_key.expose(), "");
    }

    #[test]
    fn missing_analysis_report_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = AnalysisContext::File(temp.path().join("nope.md"));
        assert!(load_analysis_context(&context, 10).is_err());
    }
}
