//! Test-only helpers: fixture backends, scripted providers, and fixture repositories.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use walkdir::WalkDir;

use crate::core::backend::{ApiKey, BackendConfig, DEFAULT_OPENAI_BASE_URL, EnvSnapshot};
use crate::core::diagnostics::{CommandRecord, CommandSource};
use crate::core::errors::ProviderError;
use crate::core::messages::{Message, ProviderResponse, ToolCall, ToolCallKind};
use crate::core::types::{ApiMode, Provider};
use crate::io::config::Settings;
use crate::io::gateway::{ApprovalGate, AutoApprove};
use crate::io::provider::{CompletionProvider, ProviderFactory};
use crate::io::repo::RepoSource;
use crate::runtime::Services;

pub type ScriptStep = Result<ProviderResponse, ProviderError>;

/// Executed, successful record for `command`.
pub fn command_record(command: &str) -> CommandRecord {
    CommandRecord {
        timestamp_utc: "2026-01-01T00:00:00.000Z".to_string(),
        source: CommandSource::ShellFunction,
        cwd: "/repo".to_string(),
        command: command.to_string(),
        timeout_ms: 120_000,
        timed_out: false,
        exit_code: Some(0),
        duration_ms: 5,
        blocked: false,
        block_reason: None,
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated_chars: 0,
        stderr_truncated_chars: 0,
    }
}

pub fn openai_backend() -> BackendConfig {
    BackendConfig {
        provider: Provider::OpenAi,
        api_mode: ApiMode::Responses,
        endpoint: DEFAULT_OPENAI_BASE_URL.to_string(),
        api_version: None,
        deployment: None,
        api_key: ApiKey::new("sk-test"),
    }
}

pub fn azure_backend() -> BackendConfig {
    BackendConfig {
        provider: Provider::Azure,
        api_mode: ApiMode::Responses,
        endpoint: "https://res.openai.azure.com".to_string(),
        api_version: Some("2025-04-01-preview".to_string()),
        deployment: Some("codex-prod".to_string()),
        api_key: ApiKey::new("azure-test"),
    }
}

/// Environment with OpenAI credentials pointing at an unroutable endpoint.
pub fn openai_env() -> EnvSnapshot {
    EnvSnapshot::from_pairs([
        ("OPENAI_API_KEY", "sk-test"),
        ("OPENAI_BASE_URL", "http://127.0.0.1:9/v1"),
    ])
}

/// Function-shaped shell call running `commands`.
pub fn shell_call(id: &str, kind: ToolCallKind, commands: &[&str]) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        kind,
        commands: commands.iter().map(|c| c.to_string()).collect(),
        timeout_ms: None,
        arguments: json!({ "commands": commands }).to_string(),
    }
}

/// Provider that replays a fixed script and remembers every request.
pub struct ScriptedProvider {
    script: VecDeque<ScriptStep>,
    seen: Vec<Vec<Message>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: script.into(),
            seen: Vec::new(),
        }
    }

    pub fn seen(&self) -> &[Vec<Message>] {
        &self.seen
    }
}

impl CompletionProvider for ScriptedProvider {
    fn submit(&mut self, messages: &[Message]) -> Result<ProviderResponse, ProviderError> {
        self.seen.push(messages.to_vec());
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Malformed("script exhausted".to_string())))
    }
}

#[derive(Default)]
struct FactoryState {
    scripts: VecDeque<Vec<ScriptStep>>,
    requests: Vec<(Provider, String)>,
}

/// Hands out one scripted provider per stage, in order.
#[derive(Clone, Default)]
pub struct ScriptedProviders {
    state: Arc<Mutex<FactoryState>>,
}

impl ScriptedProviders {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState {
                scripts: scripts.into(),
                requests: Vec::new(),
            })),
        }
    }

    /// `(provider, model)` for every provider handed out.
    pub fn requests(&self) -> Vec<(Provider, String)> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }
}

impl ProviderFactory for ScriptedProviders {
    fn provider(&self, config: &BackendConfig, model: &str) -> Box<dyn CompletionProvider> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.requests.push((config.provider, model.to_string()));
        let script = state.scripts.pop_front().unwrap_or_default();
        Box::new(ScriptedProvider::new(script))
    }
}

/// "Clones" by copying a local directory tree (minus `.git`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyRepoSource;

impl RepoSource for CopyRepoSource {
    fn clone_fresh(&self, input: &str, target: &Path) -> Result<()> {
        let source = Path::new(input);
        for entry in WalkDir::new(source)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry.with_context(|| format!("walk {input}"))?;
            let rel = entry.path().strip_prefix(source)?;
            let dest = target.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("create {}", dest.display()))?;
            } else {
                fs::copy(entry.path(), &dest)
                    .with_context(|| format!("copy to {}", dest.display()))?;
            }
        }
        Ok(())
    }
}

/// Scripted providers, copying repo source, auto-approval and no real sleeps.
pub fn test_services(providers: ScriptedProviders) -> Services<'static> {
    Services {
        providers: Box::new(providers),
        repos: Box::new(CopyRepoSource),
        approvals: Box::new(|| Box::new(AutoApprove) as Box<dyn ApprovalGate>),
        sleeper: Box::new(|_: Duration| {}),
    }
}

/// Defaults with the workspace moved under `root`.
pub fn test_settings(root: &Path) -> Settings {
    Settings {
        workspace: root.join("workspace"),
        ..Settings::default()
    }
}

/// Small repository with an API, a schema, and one hardcoded credential.
pub fn fixture_repo(root: &Path) -> Result<()> {
    let files = [
        ("app/api.py", "@app.get('/users')\ndef users(): ...\n"),
        ("db/schema.sql", "CREATE TABLE accounts (id int);\n"),
        (
            "config/settings.py",
            "DB_URL = 'postgres://app:hunter2pass@db:5432/app'\n",
        ),
        ("tests/test_api.py", "def test_users(): pass\n"),
    ];
    for (rel, contents) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Report with all eight sections, `stories` user stories, and `evidence` table rows.
pub fn report_with(stories: usize, evidence: usize) -> String {
    let mut report = String::new();
    let headings = [
        "## 1. Repository Summary",
        "## 2. Inferred Personas/Actors",
        "## 3. Feature Inventory",
        "## 4. User Stories",
        "## 5. Acceptance Criteria",
        "## 6. Evidence Table",
        "## 7. Gaps, Risks, and Open Questions",
        "## 8. Suggested Next 10 Product Backlog Items",
    ];
    for heading in headings {
        let _ = writeln!(report, "{heading}\n");
        if heading.starts_with("## 4.") {
            for i in 0..stories {
                let _ = writeln!(
                    report,
                    "- As a user, I want feature {i}, so that I get value {i}."
                );
            }
        }
        if heading.starts_with("## 6.") {
            for i in 0..evidence {
                let _ = writeln!(report, "| feature {i} | src/module_{i}.rs |");
            }
        }
        report.push('\n');
    }
    report
}
