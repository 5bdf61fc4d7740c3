//! Error taxonomy for run orchestration.
//!
//! Orchestration code propagates `anyhow::Error`; these types are attached at
//! the point of failure so the CLI and the run summary can recover the class
//! with `downcast_ref`.

use thiserror::Error;

/// Failure reported by a completion provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Terminal failures of a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid credentials/backend settings. Raised before a run exists.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Retryable provider failure that outlived the retry budget.
    #[error("provider call still failing after {attempts} attempts: {source}")]
    TransientProvider {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    /// Non-retryable provider failure (auth, malformed request).
    #[error("fatal provider error: {0}")]
    FatalProvider(#[source] ProviderError),
    /// A bounded subprocess exceeded its wall-clock limit.
    #[error("{stage} timed out after {timeout_secs}s")]
    Timeout { stage: String, timeout_secs: u64 },
    #[error("agent did not produce a final answer within {max_turns} turns")]
    MaxTurnsExceeded { max_turns: u32 },
}

impl EngineError {
    /// Stable classification label persisted in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "ConfigurationError",
            EngineError::TransientProvider { .. } => "TransientProviderError",
            EngineError::FatalProvider(_) => "FatalProviderError",
            EngineError::Timeout { .. } => "TimeoutError",
            EngineError::MaxTurnsExceeded { .. } => "MaxTurnsExceeded",
        }
    }
}

/// Classification label for any orchestration error.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::kind)
        .unwrap_or("RunError")
}

/// Whether the error (or any cause) is a configuration error.
pub fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<EngineError>())
        .any(|engine| matches!(engine, EngineError::Configuration(_)))
}
