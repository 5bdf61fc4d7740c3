//! Stderr tracing for the CLI.
//!
//! The filter comes from `RUST_LOG` when it is set, otherwise from the
//! `log_level` setting (config file or `--log-level`). Tracing is never
//! persisted; the run directory artifacts (`commands.jsonl`,
//! `command-diagnostics.json`, `run-summary.json`) are written regardless.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV_VAR: &str = "RUST_LOG";

/// `env_directives` (the raw `RUST_LOG` value) wins over `log_level` when non-empty.
pub fn build_filter(env_directives: Option<&str>, log_level: &str) -> Result<EnvFilter> {
    match env_directives.map(str::trim).filter(|d| !d.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid {LOG_ENV_VAR} directives {directives:?}")),
        None => EnvFilter::try_new(log_level.trim())
            .with_context(|| format!("invalid log_level {log_level:?}")),
    }
}

/// Install the global subscriber: compact format on stderr.
///
/// ```bash
/// RUST_LOG=analyzer=debug analyzer analyze --repo .
/// analyzer --log-level info runs
/// ```
pub fn init(log_level: &str) -> Result<()> {
    let env_directives = std::env::var(LOG_ENV_VAR).ok();
    let filter = build_filter(env_directives.as_deref(), log_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_directives_override_setting() {
        let filter = build_filter(Some("analyzer=debug"), "warn").expect("filter");
        assert_eq!(filter.to_string(), "analyzer=debug");
    }

    #[test]
    fn blank_env_falls_back_to_setting() {
        let filter = build_filter(Some("  "), "info").expect("filter");
        assert_eq!(filter.to_string(), "info");
        let filter = build_filter(None, "analyzer=trace").expect("filter");
        assert_eq!(filter.to_string(), "analyzer=trace");
    }

    #[test]
    fn bad_level_is_rejected() {
        let err = build_filter(None, "analyzer=loud").unwrap_err();
        assert!(format!("{err:#}").contains("log_level"));
    }
}
