//! Backend resolution from an immutable environment snapshot.
//!
//! Credentials and endpoints are read exactly once per run (or per stage) into
//! a [`BackendConfig`]; nothing downstream consults process environment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::errors::EngineError;
use crate::core::types::{ApiMode, Provider, ToolShape};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Requested model names that map onto the configured Azure deployment.
const DEPLOYMENT_ALIASED_MODELS: [&str; 2] = ["gpt-5.1-codex", "gpt-5.1-codex-mini"];

const AZURE_ENDPOINT_SUFFIXES: [&str; 4] = [
    "/openai/responses",
    "/openai/chat/completions",
    "/openai/v1/responses",
    "/openai/v1/chat/completions",
];

static URL_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>[A-Za-z][A-Za-z0-9+.-]*://[^/?#]+)(?P<path>/[^?#]*)?")
        .expect("url regex should be valid")
});

/// Point-in-time copy of the environment variables relevant to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_process() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Trimmed, non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// `<prefix><key>` first, then `<key>`.
    pub fn get_prefixed(&self, prefix: Option<&str>, key: &str) -> Option<&str> {
        prefix
            .and_then(|prefix| self.get(&format!("{prefix}{key}")))
            .or_else(|| self.get(key))
    }
}

/// API key wrapper that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Resolved provider identity for one run or stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    pub provider: Provider,
    pub api_mode: ApiMode,
    /// Base endpoint (Azure resource root or OpenAI-compatible base URL).
    pub endpoint: String,
    pub api_version: Option<String>,
    pub deployment: Option<String>,
    #[serde(skip)]
    pub api_key: ApiKey,
}

impl BackendConfig {
    /// Hosted shell items are only sent to OpenAI's Responses API; every other
    /// combination gets the function-tool shape.
    pub fn tool_shape(&self) -> ToolShape {
        match (self.provider, self.api_mode) {
            (Provider::OpenAi, ApiMode::Responses) => ToolShape::Hosted,
            _ => ToolShape::Function,
        }
    }

    /// Model (or deployment) name actually sent to the provider.
    pub fn effective_model(&self, requested: &str) -> String {
        let requested = requested.trim();
        if self.provider == Provider::Azure
            && let Some(deployment) = self.deployment.as_deref()
            && (requested.is_empty() || DEPLOYMENT_ALIASED_MODELS.contains(&requested))
        {
            return deployment.to_string();
        }
        requested.to_string()
    }

    /// Like [`Self::effective_model`], but an explicit deployment always wins on Azure.
    pub fn stage_model(&self, requested: &str, deployment_override: Option<&str>) -> String {
        match deployment_override.map(str::trim).filter(|d| !d.is_empty()) {
            Some(deployment) if self.provider == Provider::Azure => deployment.to_string(),
            _ => self.effective_model(requested),
        }
    }
}

/// Resolve the backend for a run.
///
/// `prefix` lets a stage carry its own credentials (`SECRET_REVIEW_AZURE_OPENAI_ENDPOINT`
/// takes precedence over `AZURE_OPENAI_ENDPOINT` when the prefix is `SECRET_REVIEW_`).
pub fn resolve_backend(
    env: &EnvSnapshot,
    prefix: Option<&str>,
) -> Result<BackendConfig, EngineError> {
    let api_mode = match env.get_prefixed(prefix, "OPENAI_API_MODE") {
        Some(raw) => raw.parse::<ApiMode>().map_err(EngineError::Configuration)?,
        None => ApiMode::Responses,
    };

    let azure_endpoint = env
        .get_prefixed(prefix, "AZURE_OPENAI_ENDPOINT")
        .or_else(|| env.get_prefixed(prefix, "ENDPOINT"));

    if let Some(endpoint) = azure_endpoint {
        let api_key = env
            .get_prefixed(prefix, "AZURE_OPENAI_API_KEY")
            .or_else(|| env.get_prefixed(prefix, "OPENAI_API_KEY"))
            .ok_or_else(|| {
                EngineError::Configuration(
                    "Azure endpoint is set, but no key found. Set AZURE_OPENAI_API_KEY or OPENAI_API_KEY."
                        .to_string(),
                )
            })?;
        let api_version = env
            .get_prefixed(prefix, "AZURE_OPENAI_API_VERSION")
            .ok_or_else(|| {
                EngineError::Configuration(
                    "AZURE_OPENAI_API_VERSION is required when using Azure OpenAI.".to_string(),
                )
            })?;
        let config = BackendConfig {
            provider: Provider::Azure,
            api_mode,
            endpoint: normalize_azure_endpoint(endpoint),
            api_version: Some(api_version.to_string()),
            deployment: env
                .get_prefixed(prefix, "AZURE_OPENAI_DEPLOYMENT")
                .map(str::to_string),
            api_key: ApiKey::new(api_key),
        };
        debug!(provider = %config.provider, api_mode = %config.api_mode, endpoint = %config.endpoint, "resolved backend");
        return Ok(config);
    }

    let api_key = env.get_prefixed(prefix, "OPENAI_API_KEY").ok_or_else(|| {
        EngineError::Configuration(
            "no credentials found: set OPENAI_API_KEY or AZURE_OPENAI_ENDPOINT/AZURE_OPENAI_API_KEY/AZURE_OPENAI_API_VERSION"
                .to_string(),
        )
    })?;
    let endpoint = env
        .get_prefixed(prefix, "OPENAI_BASE_URL")
        .unwrap_or(DEFAULT_OPENAI_BASE_URL)
        .trim_end_matches('/')
        .to_string();
    let config = BackendConfig {
        provider: Provider::OpenAi,
        api_mode,
        endpoint,
        api_version: None,
        deployment: None,
        api_key: ApiKey::new(api_key),
    };
    debug!(provider = %config.provider, api_mode = %config.api_mode, endpoint = %config.endpoint, "resolved backend");
    Ok(config)
}

/// Provider identity for a run that never calls the API itself (the external
/// coding agent brings its own credentials). No key or API version is required.
pub fn describe_backend(
    env: &EnvSnapshot,
    prefix: Option<&str>,
) -> Result<BackendConfig, EngineError> {
    let api_mode = match env.get_prefixed(prefix, "OPENAI_API_MODE") {
        Some(raw) => raw.parse::<ApiMode>().map_err(EngineError::Configuration)?,
        None => ApiMode::Responses,
    };
    let azure_endpoint = env
        .get_prefixed(prefix, "AZURE_OPENAI_ENDPOINT")
        .or_else(|| env.get_prefixed(prefix, "ENDPOINT"));
    let config = match azure_endpoint {
        Some(endpoint) => BackendConfig {
            provider: Provider::Azure,
            api_mode,
            endpoint: normalize_azure_endpoint(endpoint),
            api_version: env
                .get_prefixed(prefix, "AZURE_OPENAI_API_VERSION")
                .map(str::to_string),
            deployment: env
                .get_prefixed(prefix, "AZURE_OPENAI_DEPLOYMENT")
                .map(str::to_string),
            api_key: ApiKey::new(""),
        },
        None => BackendConfig {
            provider: Provider::OpenAi,
            api_mode,
            endpoint: env
                .get_prefixed(prefix, "OPENAI_BASE_URL")
                .unwrap_or(DEFAULT_OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_version: None,
            deployment: None,
            api_key: ApiKey::new(""),
        },
    };
    debug!(provider = %config.provider, endpoint = %config.endpoint, "described backend without credentials");
    Ok(config)
}

/// Strip a full operation URL down to the Azure resource root.
pub fn normalize_azure_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(caps) = URL_PARTS.captures(trimmed) else {
        return trimmed.trim_end_matches('/').to_string();
    };
    let base = &caps["base"];
    let path = caps
        .name("path")
        .map(|m| m.as_str().trim_end_matches('/'))
        .unwrap_or("");
    if AZURE_ENDPOINT_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix))
    {
        return base.to_string();
    }
    trimmed.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvSnapshot {
        EnvSnapshot::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn openai_key_selects_openai_with_default_endpoint() {
        let cfg = resolve_backend(&env(&[("OPENAI_API_KEY", "sk-test")]), None).expect("resolve");
        assert_eq!(cfg.provider, Provider::OpenAi);
        assert_eq!(cfg.api_mode, ApiMode::Responses);
        assert_eq!(cfg.endpoint, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(cfg.tool_shape(), ToolShape::Hosted);
    }

    #[test]
    fn complete_azure_credentials_take_precedence() {
        let cfg = resolve_backend(
            &env(&[
                ("OPENAI_API_KEY", "sk-test"),
                ("AZURE_OPENAI_ENDPOINT", "https://res.openai.azure.com/"),
                ("AZURE_OPENAI_API_KEY", "az-key"),
                ("AZURE_OPENAI_API_VERSION", "2025-04-01-preview"),
                ("AZURE_OPENAI_DEPLOYMENT", "codex-prod"),
            ]),
            None,
        )
        .expect("resolve");
        assert_eq!(cfg.provider, Provider::Azure);
        assert_eq!(cfg.endpoint, "https://res.openai.azure.com");
        assert_eq!(cfg.api_key.expose(), "az-key");
        assert_eq!(cfg.tool_shape(), ToolShape::Function);
        assert_eq!(cfg.effective_model("gpt-5.1-codex"), "codex-prod");
        assert_eq!(cfg.effective_model("gpt-5.2-chat"), "gpt-5.2-chat");
    }

    #[test]
    fn legacy_endpoint_alias_is_accepted() {
        let cfg = resolve_backend(
            &env(&[
                ("ENDPOINT", "https://legacy.openai.azure.com/openai/v1/responses"),
                ("OPENAI_API_KEY", "shared-key"),
                ("AZURE_OPENAI_API_VERSION", "2025-04-01-preview"),
            ]),
            None,
        )
        .expect("resolve");
        assert_eq!(cfg.provider, Provider::Azure);
        assert_eq!(cfg.endpoint, "https://legacy.openai.azure.com");
        assert_eq!(cfg.api_key.expose(), "shared-key");
    }

    #[test]
    fn missing_credentials_is_configuration_error() {
        let err = resolve_backend(&env(&[]), None).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn azure_without_api_version_is_configuration_error() {
        let err = resolve_backend(
            &env(&[
                ("AZURE_OPENAI_ENDPOINT", "https://res.openai.azure.com"),
                ("AZURE_OPENAI_API_KEY", "az-key"),
            ]),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("AZURE_OPENAI_API_VERSION"));
    }

    #[test]
    fn invalid_api_mode_is_rejected() {
        let err = resolve_backend(
            &env(&[("OPENAI_API_KEY", "sk"), ("OPENAI_API_MODE", "assistants")]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn chat_completions_on_openai_uses_function_shape() {
        let cfg = resolve_backend(
            &env(&[
                ("OPENAI_API_KEY", "sk"),
                ("OPENAI_API_MODE", "chat_completions"),
                ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
            ]),
            None,
        )
        .expect("resolve");
        assert_eq!(cfg.tool_shape(), ToolShape::Function);
        assert_eq!(cfg.endpoint, "http://localhost:8080/v1");
    }

    #[test]
    fn stage_prefix_overrides_shared_settings() {
        let snapshot = env(&[
            ("OPENAI_API_KEY", "sk-shared"),
            ("SECRET_REVIEW_AZURE_OPENAI_ENDPOINT", "https://review.openai.azure.com"),
            ("SECRET_REVIEW_AZURE_OPENAI_API_KEY", "review-key"),
            ("SECRET_REVIEW_AZURE_OPENAI_API_VERSION", "2025-04-01-preview"),
        ]);
        let review = resolve_backend(&snapshot, Some("SECRET_REVIEW_")).expect("review");
        let code = resolve_backend(&snapshot, Some("SECRET_CODE_")).expect("code");
        assert_eq!(review.provider, Provider::Azure);
        assert_eq!(code.provider, Provider::OpenAi);
        assert_eq!(code.api_key.expose(), "sk-shared");
    }

    #[test]
    fn deployment_override_wins_on_azure_only() {
        let azure = resolve_backend(
            &env(&[
                ("AZURE_OPENAI_ENDPOINT", "https://res.openai.azure.com"),
                ("AZURE_OPENAI_API_KEY", "az-key"),
                ("AZURE_OPENAI_API_VERSION", "2025-04-01-preview"),
            ]),
            None,
        )
        .expect("azure");
        assert_eq!(
            azure.stage_model("gpt-5.2-chat", Some("review-dep")),
            "review-dep"
        );
        let openai = resolve_backend(&env(&[("OPENAI_API_KEY", "sk")]), None).expect("openai");
        assert_eq!(
            openai.stage_model("gpt-5.2-chat", Some("review-dep")),
            "gpt-5.2-chat"
        );
    }

    #[test]
    fn described_backend_needs_no_credentials() {
        let openai = describe_backend(&env(&[]), None).expect("describe");
        assert_eq!(openai.provider, Provider::OpenAi);
        assert_eq!(openai.endpoint, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(openai.api_key.expose(), "");

        let azure = describe_backend(
            &env(&[
                ("SECRET_CODE_AZURE_OPENAI_ENDPOINT", "https://res.openai.azure.com/openai/responses"),
                ("AZURE_OPENAI_DEPLOYMENT", "codex-prod"),
            ]),
            Some("SECRET_CODE_"),
        )
        .expect("describe azure");
        assert_eq!(azure.provider, Provider::Azure);
        assert_eq!(azure.endpoint, "https://res.openai.azure.com");
        assert_eq!(azure.api_version, None);
        assert_eq!(azure.effective_model("gpt-5.1-codex-mini"), "codex-prod");

        let err = describe_backend(&env(&[("OPENAI_API_MODE", "assistants")]), None).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::new("sk-secret");
        assert_eq!(format!("{key:?}"), "ApiKey(***)");
    }

    #[test]
    fn normalize_keeps_unrelated_paths() {
        assert_eq!(
            normalize_azure_endpoint("https://gw.example.com/proxy/"),
            "https://gw.example.com/proxy"
        );
        assert_eq!(
            normalize_azure_endpoint("https://res.openai.azure.com/openai/chat/completions"),
            "https://res.openai.azure.com"
        );
    }
}
