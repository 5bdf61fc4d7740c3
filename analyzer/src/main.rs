//! `analyzer` CLI: analysis reports, coding tasks, and secret sanitization runs
//! against a repository, each recorded in its own workspace run directory.

use std::path::PathBuf;
use std::time::Duration;

use analyzer::analyze::{AnalyzeRequest, analyze};
use analyzer::code::{AnalysisContext, CodeRequest, run_code};
use analyzer::core::backend::EnvSnapshot;
use analyzer::core::errors::{EngineError, is_configuration_error};
use analyzer::core::types::CodeBackend;
use analyzer::exit_codes;
use analyzer::io::config::{Settings, default_config_path, load_settings};
use analyzer::io::workspace::list_recent_runs;
use analyzer::logging;
use analyzer::runtime::{RunOutcome, Services};
use analyzer::secrets::{SecretsRequest, run_secret_workflow};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "analyzer",
    version,
    about = "Run LLM agents against a repository with gated shell access and audited runs"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand. CLI values win over the config file.
#[derive(Args, Debug, Default)]
struct CommonArgs {
    /// Root directory for run directories.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// TOML config file (default: `<workspace>/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Turn limit for the agent loop.
    #[arg(long, global = true)]
    max_turns: Option<u32>,
    /// Retries after the first provider attempt.
    #[arg(long, global = true)]
    retries: Option<u32>,
    /// Wait before the first retry; retry k waits k times this.
    #[arg(long, global = true)]
    retry_backoff_seconds: Option<f64>,
    /// Explicit JSONL command log (default: `<run_dir>/commands.jsonl`).
    #[arg(long, global = true)]
    command_log_path: Option<PathBuf>,
    /// Characters of stdout/stderr kept per logged command.
    #[arg(long, global = true)]
    command_log_max_output_chars: Option<usize>,
    /// Approve every shell command without prompting.
    #[arg(long, global = true, env = "SHELL_AUTO_APPROVE")]
    auto_approve: bool,
    /// Tracing filter when `RUST_LOG` is unset (default: `warn`).
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Reverse engineer a repository into a requirements report.
    Analyze {
        /// Local path or git URL.
        #[arg(long)]
        repo: String,
        #[arg(long, env = "MODEL")]
        model: Option<String>,
        /// Extra analysis focus appended to the instructions.
        #[arg(long)]
        focus: Option<String>,
        /// Also write the final report here.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, env = "MIN_STORIES")]
        min_stories: Option<usize>,
        #[arg(long, env = "MIN_EVIDENCE")]
        min_evidence: Option<usize>,
        /// Deprecated: validation is advisory and always runs.
        #[arg(long)]
        skip_validation: bool,
    },
    /// Carry out a coding task in a repository.
    Code {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        task: String,
        #[arg(long, value_enum, env = "CODE_AGENT_BACKEND")]
        backend: Option<CodeBackend>,
        #[arg(long)]
        model: Option<String>,
        /// Prior analysis report passed to the agent as context.
        #[arg(long)]
        analysis_report: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, env = "CODEX_PROFILE")]
        codex_profile: Option<String>,
        #[arg(long, env = "CODEX_TIMEOUT_SECONDS")]
        codex_timeout_seconds: Option<u64>,
    },
    /// Review a fresh clone for hardcoded secrets, then remediate them.
    Secrets {
        #[arg(long)]
        repo: String,
        /// Extra remediation goal.
        #[arg(long)]
        task: Option<String>,
        /// Model for the remediation stage.
        #[arg(long, env = "SECRET_CODE_MODEL")]
        model: Option<String>,
        #[arg(long, env = "SECRET_CODE_DEPLOYMENT")]
        code_deployment: Option<String>,
        #[arg(long, env = "SECRET_REVIEW_MODEL")]
        review_model: Option<String>,
        #[arg(long, env = "SECRET_REVIEW_DEPLOYMENT")]
        review_deployment: Option<String>,
        #[arg(long, value_enum, env = "SECRET_CODE_BACKEND")]
        code_backend: Option<CodeBackend>,
        #[arg(long, env = "SECRET_CODEX_PROFILE")]
        codex_profile: Option<String>,
        #[arg(long, env = "CODEX_TIMEOUT_SECONDS")]
        codex_timeout_seconds: Option<u64>,
    },
    /// List recent run directories, newest first.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = if is_configuration_error(&err) {
                exit_codes::CONFIG_ERROR
            } else {
                exit_codes::RUN_FAILED
            };
            std::process::exit(code);
        }
    }
}

/// Load the config file, then layer CLI flags on top.
fn resolve_settings(common: &CommonArgs) -> Result<Settings> {
    let workspace = common
        .workspace
        .clone()
        .unwrap_or_else(|| Settings::default().workspace);
    let config_path = common
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&workspace));
    let mut settings = load_settings(&config_path)
        .map_err(|err| EngineError::Configuration(format!("{err:#}")))?;
    if let Some(workspace) = &common.workspace {
        settings.workspace = workspace.clone();
    }
    if let Some(max_turns) = common.max_turns {
        settings.analysis_max_turns = max_turns;
        settings.code_max_turns = max_turns;
    }
    if let Some(retries) = common.retries {
        settings.retries = retries;
    }
    if let Some(backoff) = common.retry_backoff_seconds {
        settings.retry_backoff_seconds = backoff;
    }
    if let Some(chars) = common.command_log_max_output_chars {
        settings.command_log_max_output_chars = chars;
    }
    settings.auto_approve |= common.auto_approve;
    if let Some(level) = &common.log_level {
        settings.log_level = level.clone();
    }
    settings
        .validate()
        .map_err(|err| EngineError::Configuration(format!("{err:#}")))?;
    Ok(settings)
}

/// Fallback read for settings that accept a second, legacy variable.
fn env_backend(env: &EnvSnapshot, key: &str) -> Result<Option<CodeBackend>> {
    env.get(key)
        .map(|raw| raw.parse::<CodeBackend>())
        .transpose()
        .map_err(|err| EngineError::Configuration(format!("{key}: {err}")).into())
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut settings = resolve_settings(&cli.common)?;
    logging::init(&settings.log_level)
        .map_err(|err| EngineError::Configuration(format!("{err:#}")))?;
    let env = EnvSnapshot::from_process();

    match cli.command {
        Command::Analyze {
            repo,
            model,
            focus,
            output,
            min_stories,
            min_evidence,
            skip_validation,
        } => {
            if let Some(min) = min_stories {
                settings.validation.min_stories = min;
            }
            if let Some(min) = min_evidence {
                settings.validation.min_evidence = min;
            }
            let request = AnalyzeRequest {
                repo,
                model,
                focus,
                output,
                skip_validation,
                command_log_path: cli.common.command_log_path,
            };
            let mut services = Services::production(settings.auto_approve);
            let outcome = analyze(&env, &settings, &mut services, &request)?;
            Ok(report_outcome(&outcome))
        }
        Command::Code {
            repo,
            task,
            backend,
            model,
            analysis_report,
            output,
            codex_profile,
            codex_timeout_seconds,
        } => {
            let mut request = CodeRequest::from_settings(&settings, &repo, &task);
            if let Some(backend) = backend {
                request.backend = backend;
            }
            if let Some(model) = model {
                request.model = model;
            }
            if let Some(path) = analysis_report {
                request.analysis_context = AnalysisContext::File(path);
            }
            if codex_profile.is_some() {
                request.codex_profile = codex_profile;
            }
            if let Some(secs) = codex_timeout_seconds {
                request.codex_timeout = Duration::from_secs(secs);
            }
            request.output = output;
            request.command_log_path = cli.common.command_log_path;
            let mut services = Services::production(settings.auto_approve);
            let outcome = run_code(&env, &settings, &mut services, &request)?;
            Ok(report_outcome(&outcome))
        }
        Command::Secrets {
            repo,
            task,
            model,
            code_deployment,
            review_model,
            review_deployment,
            code_backend,
            codex_profile,
            codex_timeout_seconds,
        } => {
            let code_backend = match code_backend {
                Some(backend) => Some(backend),
                None => env_backend(&env, "CODE_AGENT_BACKEND")?,
            };
            let request = SecretsRequest {
                repo,
                task,
                review_model,
                review_deployment,
                code_model: model,
                code_deployment,
                code_backend,
                codex_profile: codex_profile
                    .or_else(|| env.get("CODEX_PROFILE").map(str::to_string)),
                codex_timeout: codex_timeout_seconds.map(Duration::from_secs),
                command_log_path: cli.common.command_log_path,
            };
            let mut services = Services::production(settings.auto_approve);
            let outcome = run_secret_workflow(&env, &settings, &mut services, &request)?;
            println!("Secret workflow: {}", outcome.summary.run_dir.display());
            println!("Review run: {}", outcome.review.summary.run_dir.display());
            if let Some(code) = &outcome.code {
                println!("Code run: {}", code.summary.run_dir.display());
            }
            if let Some(path) = &outcome.summary.code_agent_output_path {
                println!("Sanitization output: {}", path.display());
            }
            println!("Workflow summary: {}", outcome.summary_path.display());
            if let Some(message) = &outcome.summary.error_message {
                eprintln!("secret workflow failed: {message}");
            }
            Ok(if outcome.succeeded() {
                exit_codes::OK
            } else {
                exit_codes::RUN_FAILED
            })
        }
        Command::Runs { limit } => {
            let runs = list_recent_runs(&settings.workspace, limit)?;
            if runs.is_empty() {
                println!("No runs under {}", settings.workspace.display());
            }
            for run in runs {
                println!(
                    "{}\t{}\t{}\t{}",
                    run.run_id,
                    run.status,
                    run.started_at.as_deref().unwrap_or("-"),
                    run.model_used.as_deref().unwrap_or("-"),
                );
            }
            Ok(exit_codes::OK)
        }
    }
}

/// Print where the artifacts went and pick the exit code.
fn report_outcome(outcome: &RunOutcome) -> i32 {
    let summary = &outcome.summary;
    println!("Run directory: {}", summary.run_dir.display());
    if let Some(path) = &summary.report_path {
        println!("Report: {}", path.display());
    }
    if let Some(path) = &summary.output_path {
        println!("Saved output to {}", path.display());
    }
    if let Some(validation) = &summary.validation
        && !validation.passed
    {
        eprintln!("quality warning:");
        for issue in &validation.issues {
            eprintln!("- {issue}");
        }
    }
    match &outcome.error {
        None => exit_codes::OK,
        Some(err) => {
            eprintln!("{:#}", err);
            exit_codes::RUN_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_analyze_with_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "analyzer",
            "analyze",
            "--repo",
            "./repo",
            "--retries",
            "4",
            "--skip-validation",
        ]);
        assert_eq!(cli.common.retries, Some(4));
        match cli.command {
            Command::Analyze {
                repo,
                skip_validation,
                ..
            } => {
                assert_eq!(repo, "./repo");
                assert!(skip_validation);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn parse_code_backend_value() {
        let cli = Cli::parse_from([
            "analyzer",
            "code",
            "--repo",
            ".",
            "--task",
            "fix",
            "--backend",
            "codex_cli",
        ]);
        assert!(matches!(
            cli.command,
            Command::Code {
                backend: Some(CodeBackend::CodexCli),
                ..
            }
        ));
    }

    /// Verifies CLI values override the config file and a bad value is a configuration error.
    #[test]
    fn settings_layering() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("config.toml");
        std::fs::write(
            &config,
            "retries = 7\nanalysis_max_turns = 3\nlog_level = \"info\"\n",
        )
        .expect("write");
        let common = CommonArgs {
            config: Some(config.clone()),
            workspace: Some(temp.path().to_path_buf()),
            max_turns: Some(9),
            ..CommonArgs::default()
        };
        let settings = resolve_settings(&common).expect("settings");
        assert_eq!(settings.log_level, "info");
        let louder = CommonArgs {
            config: Some(config.clone()),
            log_level: Some("analyzer=debug".to_string()),
            ..CommonArgs::default()
        };
        assert_eq!(
            resolve_settings(&louder).expect("settings").log_level,
            "analyzer=debug"
        );
        assert_eq!(settings.retries, 7);
        assert_eq!(settings.analysis_max_turns, 9);
        assert_eq!(settings.workspace, temp.path());

        let bad = CommonArgs {
            config: Some(config),
            retry_backoff_seconds: Some(-1.0),
            ..CommonArgs::default()
        };
        let err = resolve_settings(&bad).expect_err("invalid");
        assert!(is_configuration_error(&err));
    }
}
