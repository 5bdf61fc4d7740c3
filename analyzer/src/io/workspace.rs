//! Run directory lifecycle under the workspace root.
//!
//! Each run gets a fresh directory named `<prefix>-<YYYYmmdd-HHMMSS-mmm>-<suffix>`.
//! Directories are created with `create_dir`, so an existing name is never
//! reused; a collision just draws a new suffix.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rand::{Rng, distributions::Alphanumeric};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::backend::BackendConfig;
use crate::core::diagnostics::CommandDiagnostics;
use crate::core::errors::error_kind;
use crate::core::run::RunContext;
use crate::core::types::{ApiMode, Provider, RunKind, RunStatus};
use crate::core::validation::ValidationResult;
use crate::io::artifacts::{write_json, write_text};
use crate::io::gateway::GatewayReport;

pub const SCAN_FILE_NAME: &str = "scan.json";
pub const REPORT_FILE_NAME: &str = "report.md";
pub const SUMMARY_FILE_NAME: &str = "run-summary.json";

const RUN_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%3f";
const MAX_CREATE_ATTEMPTS: u32 = 16;

static RUN_DIR_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:run|code-run|secret-run)-(\d{8}-\d{6}-\d{3})-[a-z0-9]{6}$")
        .expect("run dir pattern should be valid")
});

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Create a fresh run directory and its [`RunContext`] (status `pending`).
#[instrument(skip_all, fields(kind = ?kind, workspace = %workspace.display()))]
pub fn create_run(
    workspace: &Path,
    kind: RunKind,
    backend: &BackendConfig,
    requested_model: &str,
    effective_model: &str,
) -> Result<RunContext> {
    fs::create_dir_all(workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("resolve workspace {}", workspace.display()))?;

    for attempt in 1..=MAX_CREATE_ATTEMPTS {
        let started_at = Utc::now();
        let run_id = format!(
            "{}-{}-{}",
            kind.dir_prefix(),
            started_at.format(RUN_STAMP_FORMAT),
            generate_short_id()
        );
        let run_dir = workspace.join(&run_id);
        match fs::create_dir(&run_dir) {
            Ok(()) => {
                info!(run_id = %run_id, "created run directory");
                return Ok(RunContext::new(
                    run_id,
                    kind,
                    workspace.clone(),
                    run_dir,
                    backend.clone(),
                    requested_model.to_string(),
                    effective_model.to_string(),
                    started_at,
                ));
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(attempt, run_id = %run_id, "run directory exists, retrying");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create run dir {}", run_dir.display()));
            }
        }
    }
    bail!(
        "could not allocate a unique run directory under {} after {MAX_CREATE_ATTEMPTS} attempts",
        workspace.display()
    )
}

/// Write the pre-analysis snapshot. A run has at most one.
pub fn persist_snapshot<T: Serialize>(ctx: &RunContext, snapshot: &T) -> Result<PathBuf> {
    let path = ctx.run_dir.join(SCAN_FILE_NAME);
    if path.exists() {
        bail!("snapshot already persisted at {}", path.display());
    }
    write_json(&path, snapshot)?;
    debug!(path = %path.display(), "snapshot persisted");
    Ok(path)
}

/// Everything a run wants recorded in its summary besides the context itself.
#[derive(Debug, Default)]
pub struct RunDetails {
    pub repo_input: Option<String>,
    pub repo_path: Option<PathBuf>,
    pub scan_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub validation: Option<ValidationResult>,
    pub retry_waits_secs: Vec<f64>,
    pub gateway: Option<GatewayReport>,
    /// Stage-specific fields merged into the summary.
    pub extra: BTreeMap<String, Value>,
}

/// `run-summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub kind: RunKind,
    pub run_dir: PathBuf,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub repo_input: Option<String>,
    pub repo_path: Option<PathBuf>,
    pub provider: Provider,
    pub api_mode: ApiMode,
    pub endpoint_used: String,
    pub model_requested: String,
    pub model_used: String,
    pub azure_deployment: Option<String>,
    pub run_status: RunStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub validation: Option<ValidationResult>,
    pub retry_waits_secs: Vec<f64>,
    pub scan_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub command_log_path: Option<PathBuf>,
    pub diagnostics_path: Option<PathBuf>,
    pub command_diagnostics: Option<CommandDiagnostics>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Close the run: mark it `completed` (no error) or `failed`, then write the
/// report (when there is one) and the summary.
#[instrument(skip_all, fields(run_id = %ctx.run_id, failed = error.is_some()))]
pub fn finalize_run(
    ctx: &mut RunContext,
    report: Option<&str>,
    error: Option<&anyhow::Error>,
    details: RunDetails,
) -> Result<RunSummary> {
    let now = Utc::now();
    let target = if error.is_some() {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    ctx.transition(target, now)
        .with_context(|| format!("finalize run {}", ctx.run_id))?;

    let report_path = match report {
        Some(report) => {
            let path = ctx.run_dir.join(REPORT_FILE_NAME);
            write_text(&path, report)?;
            Some(path)
        }
        None => None,
    };

    let (command_log_path, diagnostics_path, command_diagnostics) = match &details.gateway {
        Some(gateway) => (
            Some(gateway.command_log_path.clone()),
            Some(gateway.diagnostics_path.clone()),
            Some(gateway.diagnostics),
        ),
        None => (None, None, None),
    };

    let summary = RunSummary {
        run_id: ctx.run_id.clone(),
        kind: ctx.kind,
        run_dir: ctx.run_dir.clone(),
        started_at: rfc3339(ctx.started_at),
        finished_at: ctx.finished_at().map(rfc3339),
        repo_input: details.repo_input,
        repo_path: details.repo_path,
        provider: ctx.backend.provider,
        api_mode: ctx.backend.api_mode,
        endpoint_used: ctx.backend.endpoint.clone(),
        model_requested: ctx.requested_model.clone(),
        model_used: ctx.effective_model.clone(),
        azure_deployment: ctx.backend.deployment.clone(),
        run_status: ctx.status(),
        error_kind: error.map(|err| error_kind(err).to_string()),
        error_message: error.map(|err| format!("{err:#}")),
        validation: details.validation,
        retry_waits_secs: details.retry_waits_secs,
        scan_path: details.scan_path,
        report_path,
        output_path: details.output_path,
        command_log_path,
        diagnostics_path,
        command_diagnostics,
        extra: details.extra,
    };
    write_json(&ctx.run_dir.join(SUMMARY_FILE_NAME), &summary)?;
    info!(status = ctx.status().as_str(), "run finalized");
    Ok(summary)
}

/// One entry of `runs` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunListing {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// Summary status, or `unknown` when the run left no readable summary.
    pub status: String,
    pub kind: Option<RunKind>,
    pub started_at: Option<String>,
    pub model_used: Option<String>,
    pub error_kind: Option<String>,
}

/// Sort key: timestamp from the directory name, else modification time.
fn run_timestamp(name: &str, path: &Path) -> Option<DateTime<Utc>> {
    if let Some(caps) = RUN_DIR_NAME.captures(name)
        && let Ok(naive) = NaiveDateTime::parse_from_str(&caps[1], RUN_STAMP_FORMAT)
    {
        return Some(naive.and_utc());
    }
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn is_run_dir_name(name: &str) -> bool {
    ["run-", "code-run-", "secret-run-"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn read_listing(run_id: String, run_dir: PathBuf) -> RunListing {
    let summary_path = run_dir.join(SUMMARY_FILE_NAME);
    let summary = fs::read_to_string(&summary_path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<RunSummary>(&raw) {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(path = %summary_path.display(), err = %err, "unreadable run summary");
                None
            }
        });
    match summary {
        Some(summary) => RunListing {
            run_id,
            run_dir,
            status: summary.run_status.as_str().to_string(),
            kind: Some(summary.kind),
            started_at: Some(summary.started_at),
            model_used: Some(summary.model_used),
            error_kind: summary.error_kind,
        },
        None => RunListing {
            run_id,
            run_dir,
            status: "unknown".to_string(),
            kind: None,
            started_at: None,
            model_used: None,
            error_kind: None,
        },
    }
}

/// The `limit` most recent run directories, newest first.
pub fn list_recent_runs(workspace: &Path, limit: usize) -> Result<Vec<RunListing>> {
    if !workspace.exists() {
        return Ok(Vec::new());
    }
    let mut candidates = Vec::new();
    for entry in
        fs::read_dir(workspace).with_context(|| format!("read workspace {}", workspace.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", workspace.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_run_dir_name(&name) {
            continue;
        }
        let stamp = run_timestamp(&name, &path);
        candidates.push((stamp.unwrap_or(DateTime::<Utc>::from(SystemTime::UNIX_EPOCH)), name, path));
    }
    candidates.sort_by_key(|(stamp, name, _)| Reverse((*stamp, name.clone())));
    Ok(candidates
        .into_iter()
        .take(limit)
        .map(|(_, name, path)| read_listing(name, path))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::openai_backend;

    #[test]
    fn runs_created_back_to_back_never_share_a_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = openai_backend();
        let mut dirs = std::collections::BTreeSet::new();
        for _ in 0..20 {
            let ctx = create_run(temp.path(), RunKind::Analysis, &backend, "m", "m").expect("create");
            assert!(ctx.run_dir.is_dir());
            assert!(RUN_DIR_NAME.is_match(&ctx.run_id), "{}", ctx.run_id);
            assert!(dirs.insert(ctx.run_dir));
        }
    }

    #[test]
    fn snapshot_is_written_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = create_run(temp.path(), RunKind::Code, &openai_backend(), "m", "m")
            .expect("create");
        persist_snapshot(&ctx, &serde_json::json!({"files": 1})).expect("first");
        assert!(persist_snapshot(&ctx, &serde_json::json!({"files": 2})).is_err());
    }

    #[test]
    fn finalize_writes_report_and_failed_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = create_run(temp.path(), RunKind::Analysis, &openai_backend(), "m", "m")
            .expect("create");
        ctx.transition(RunStatus::Running, Utc::now()).expect("run");
        let err = anyhow::Error::new(crate::core::errors::EngineError::MaxTurnsExceeded {
            max_turns: 3,
        });
        let summary = finalize_run(&mut ctx, Some("# partial\n"), Some(&err), RunDetails::default())
            .expect("finalize");
        assert_eq!(summary.run_status, RunStatus::Failed);
        assert_eq!(summary.error_kind.as_deref(), Some("MaxTurnsExceeded"));
        let raw = fs::read_to_string(ctx.run_dir.join(SUMMARY_FILE_NAME)).expect("summary");
        let parsed: RunSummary = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, summary);
        assert_eq!(
            fs::read_to_string(ctx.run_dir.join(REPORT_FILE_NAME)).expect("report"),
            "# partial\n"
        );
    }

    #[test]
    fn finalize_twice_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = create_run(temp.path(), RunKind::Analysis, &openai_backend(), "m", "m")
            .expect("create");
        ctx.transition(RunStatus::Running, Utc::now()).expect("run");
        finalize_run(&mut ctx, None, None, RunDetails::default()).expect("first");
        assert!(finalize_run(&mut ctx, None, None, RunDetails::default()).is_err());
    }

    #[test]
    fn recent_runs_are_sorted_newest_first_with_unknown_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("run-20250101-000000-000-aaaaaa")).expect("old");
        fs::create_dir(temp.path().join("code-run-20250301-000000-000-bbbbbb")).expect("new");
        fs::create_dir(temp.path().join("secret-run-20250201-000000-000-cccccc")).expect("mid");
        fs::create_dir(temp.path().join("notes")).expect("other");

        let runs = list_recent_runs(temp.path(), 2).expect("list");
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "code-run-20250301-000000-000-bbbbbb",
                "secret-run-20250201-000000-000-cccccc"
            ]
        );
        assert!(runs.iter().all(|r| r.status == "unknown"));
    }

    #[test]
    fn listing_reads_summary_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = create_run(temp.path(), RunKind::Analysis, &openai_backend(), "m", "m")
            .expect("create");
        ctx.transition(RunStatus::Running, Utc::now()).expect("run");
        finalize_run(&mut ctx, None, None, RunDetails::default()).expect("finalize");
        let runs = list_recent_runs(temp.path(), 10).expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].kind, Some(RunKind::Analysis));
    }
}
