//! Run identity and the status lifecycle of a single run directory.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::backend::BackendConfig;
use crate::core::types::{RunKind, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run status transition {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

/// One run: its directory, its backend, and where it is in its lifecycle.
///
/// Status moves `pending -> running -> completed|failed` (or `pending -> failed`).
/// Terminal statuses are final.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub kind: RunKind,
    pub workspace: PathBuf,
    pub run_dir: PathBuf,
    pub backend: BackendConfig,
    pub requested_model: String,
    pub effective_model: String,
    pub started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: RunStatus,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        kind: RunKind,
        workspace: PathBuf,
        run_dir: PathBuf,
        backend: BackendConfig,
        requested_model: String,
        effective_model: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            kind,
            workspace,
            run_dir,
            backend,
            requested_model,
            effective_model,
            started_at,
            finished_at: None,
            status: RunStatus::Pending,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Move to `to`, stamping `finished_at` when the new status is terminal.
    pub fn transition(
        &mut self,
        to: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StatusTransitionError> {
        let allowed = matches!(
            (self.status, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        );
        if !allowed {
            return Err(StatusTransitionError {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(at);
        }
        Ok(())
    }

    /// Convenience for the common failure path: any non-terminal run may fail.
    pub fn fail(&mut self, at: DateTime<Utc>) -> Result<(), StatusTransitionError> {
        self.transition(RunStatus::Failed, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::openai_backend;

    fn context() -> RunContext {
        RunContext::new(
            "run-20260101-000000-000-abcdef".to_string(),
            RunKind::Analysis,
            PathBuf::from("/ws"),
            PathBuf::from("/ws/run-20260101-000000-000-abcdef"),
            openai_backend(),
            "gpt-5.2-chat".to_string(),
            "gpt-5.2-chat".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut ctx = context();
        assert_eq!(ctx.status(), RunStatus::Pending);
        ctx.transition(RunStatus::Running, Utc::now()).expect("run");
        assert!(ctx.finished_at().is_none());
        ctx.transition(RunStatus::Completed, Utc::now())
            .expect("complete");
        assert!(ctx.finished_at().is_some());
    }

    #[test]
    fn pending_may_fail_directly() {
        let mut ctx = context();
        ctx.fail(Utc::now()).expect("fail");
        assert_eq!(ctx.status(), RunStatus::Failed);
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut ctx = context();
        ctx.transition(RunStatus::Running, Utc::now()).expect("run");
        ctx.transition(RunStatus::Completed, Utc::now())
            .expect("complete");
        let err = ctx.fail(Utc::now()).unwrap_err();
        assert_eq!(err.to_string(), "invalid run status transition completed -> failed");
        assert_eq!(ctx.status(), RunStatus::Completed);
    }

    #[test]
    fn pending_cannot_complete() {
        let mut ctx = context();
        assert!(ctx.transition(RunStatus::Completed, Utc::now()).is_err());
    }
}
