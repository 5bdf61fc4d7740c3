//! Bounded retry with linear backoff around provider calls.
//!
//! Classification is table-driven: each [`ProviderError`] signature maps to a
//! single [`ErrorClass`]. Only transient errors are retried.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::errors::{EngineError, ProviderError};

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// HTTP status ranges and their class, checked in order.
const STATUS_RULES: &[(u16, u16, ErrorClass)] = &[
    (408, 408, ErrorClass::Transient),
    (409, 409, ErrorClass::Transient),
    (429, 429, ErrorClass::Transient),
    (500, 599, ErrorClass::Transient),
    (400, 499, ErrorClass::Fatal),
];

/// Classify a provider failure.
pub fn classify(err: &ProviderError) -> ErrorClass {
    match err {
        ProviderError::Transport(_) | ProviderError::Timeout => ErrorClass::Transient,
        ProviderError::Malformed(_) => ErrorClass::Fatal,
        ProviderError::Http { status, .. } => STATUS_RULES
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(status))
            .map(|(_, _, class)| *class)
            .unwrap_or(ErrorClass::Fatal),
    }
}

/// Errors that can be sorted into transient or fatal.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for ProviderError {
    fn class(&self) -> ErrorClass {
        classify(self)
    }
}

/// Retry budget for one call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Wait before the first retry; retry `k` waits `k` times this.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_secs: f64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_secs_f64(initial_backoff_secs.max(0.0)),
        }
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff * attempt
    }
}

/// Source of waits between attempts.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<F: FnMut(Duration)> Sleeper for F {
    fn sleep(&mut self, duration: Duration) {
        self(duration);
    }
}

/// Terminal outcome of a retried call.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure: {0}")]
    Fatal(E),
}

impl From<RetryError<ProviderError>> for EngineError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => EngineError::TransientProvider {
                attempts,
                source: last,
            },
            RetryError::Fatal(source) => EngineError::FatalProvider(source),
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the retry budget is spent.
pub fn execute_with_retry<T, E, S, F>(
    policy: &RetryPolicy,
    sleeper: &mut S,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Classify + std::error::Error + 'static,
    S: Sleeper + ?Sized,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => {
                debug!(attempt, "call succeeded");
                return Ok(value);
            }
            Err(err) => match err.class() {
                ErrorClass::Fatal => {
                    warn!(attempt, err = %err, "fatal error, not retrying");
                    return Err(RetryError::Fatal(err));
                }
                ErrorClass::Transient => {
                    if attempt > policy.max_retries {
                        warn!(attempts = attempt, err = %err, "retry budget exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let wait = policy.backoff_for(attempt);
                    warn!(
                        attempt,
                        wait_secs = wait.as_secs_f64(),
                        err = %err,
                        "transient error, retrying"
                    );
                    sleeper.sleep(wait);
                }
            },
        }
    }
}
