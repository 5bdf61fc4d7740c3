//! Engine settings stored at `<workspace>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::CodeBackend;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Engine settings (TOML).
///
/// Every field is optional in the file; missing fields take the defaults below.
/// CLI flags override whatever is loaded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Root under which run directories are created.
    pub workspace: PathBuf,

    /// Model requested for analysis runs.
    pub model: String,

    /// Agent turn limit for analysis runs.
    pub analysis_max_turns: u32,

    /// Agent turn limit for code runs.
    pub code_max_turns: u32,

    /// Retries after the first provider attempt.
    pub retries: u32,

    /// Wait before the first retry; later retries wait a multiple of this.
    pub retry_backoff_seconds: f64,

    /// Truncate persisted stdout/stderr beyond this many characters.
    pub command_log_max_output_chars: usize,

    /// Approve every gated command without prompting.
    pub auto_approve: bool,

    /// Tracing filter used when `RUST_LOG` is unset (for example `info` or `analyzer=debug`).
    pub log_level: String,

    pub validation: ValidationSettings,
    pub code: CodeSettings,
    pub secrets: SecretSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationSettings {
    pub min_stories: usize,
    pub min_evidence: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodeSettings {
    pub model: String,
    pub backend: CodeBackend,
    /// External coding agent binary, invoked as `<bin> exec ...`.
    pub codex_bin: String,
    pub codex_profile: Option<String>,
    /// Wall-clock limit for the external coding agent.
    pub codex_timeout_seconds: u64,
    /// Analysis context passed to the code agent is cut to this many characters.
    pub analysis_context_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretSettings {
    pub review_model: String,
    pub review_deployment: Option<String>,
    pub code_model: String,
    pub code_deployment: Option<String>,
    pub code_backend: CodeBackend,
    pub codex_profile: Option<String>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_stories: 15,
            min_evidence: 25,
        }
    }
}

impl Default for CodeSettings {
    fn default() -> Self {
        Self {
            model: "gpt-5.1-codex-mini".to_string(),
            backend: CodeBackend::AgentsSdk,
            codex_bin: "codex".to_string(),
            codex_profile: None,
            codex_timeout_seconds: 600,
            analysis_context_max_chars: 20_000,
        }
    }
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self {
            review_model: "gpt-5.2-chat".to_string(),
            review_deployment: None,
            code_model: "gpt-5.1-codex-mini".to_string(),
            code_deployment: None,
            code_backend: CodeBackend::AgentsSdk,
            codex_profile: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(".agent-workspace"),
            model: "gpt-5.2-chat".to_string(),
            analysis_max_turns: 30,
            code_max_turns: 40,
            retries: 2,
            retry_backoff_seconds: 2.0,
            command_log_max_output_chars: 4000,
            auto_approve: false,
            log_level: "warn".to_string(),
            validation: ValidationSettings::default(),
            code: CodeSettings::default(),
            secrets: SecretSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            return Err(anyhow!("workspace must be non-empty"));
        }
        if self.analysis_max_turns == 0 || self.code_max_turns == 0 {
            return Err(anyhow!("max turns must be > 0"));
        }
        if !self.retry_backoff_seconds.is_finite() || self.retry_backoff_seconds < 0.0 {
            return Err(anyhow!("retry_backoff_seconds must be a non-negative number"));
        }
        if self.command_log_max_output_chars == 0 {
            return Err(anyhow!("command_log_max_output_chars must be > 0"));
        }
        if self.code.codex_timeout_seconds == 0 {
            return Err(anyhow!("code.codex_timeout_seconds must be > 0"));
        }
        if self.log_level.trim().is_empty() {
            return Err(anyhow!("log_level must be non-empty"));
        }
        if self.code.codex_bin.trim().is_empty() {
            return Err(anyhow!("code.codex_bin must be non-empty"));
        }
        Ok(())
    }
}

/// Default config location inside a workspace.
pub fn default_config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_FILE_NAME)
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(settings)
}
