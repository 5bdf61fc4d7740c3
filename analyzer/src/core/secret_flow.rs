//! State machine for the two-stage secret sanitization workflow.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Init,
    Cloned,
    Reviewed,
    Remediated,
    Done,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }

    /// The single forward successor, if any.
    fn next(self) -> Option<WorkflowState> {
        match self {
            WorkflowState::Init => Some(WorkflowState::Cloned),
            WorkflowState::Cloned => Some(WorkflowState::Reviewed),
            WorkflowState::Reviewed => Some(WorkflowState::Remediated),
            WorkflowState::Remediated => Some(WorkflowState::Done),
            WorkflowState::Done | WorkflowState::Failed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid secret workflow transition {from:?} -> {to:?}")]
pub struct WorkflowTransitionError {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

/// Current state plus every state visited, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMachine {
    history: Vec<WorkflowState>,
}

impl Default for WorkflowMachine {
    fn default() -> Self {
        Self {
            history: vec![WorkflowState::Init],
        }
    }
}

impl WorkflowMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkflowState {
        self.history
            .last()
            .copied()
            .unwrap_or(WorkflowState::Init)
    }

    pub fn history(&self) -> &[WorkflowState] {
        &self.history
    }

    /// Advance to `to`: the forward successor, or `Failed` from any non-terminal state.
    pub fn advance(&mut self, to: WorkflowState) -> Result<(), WorkflowTransitionError> {
        let from = self.state();
        let allowed = if to == WorkflowState::Failed {
            !from.is_terminal()
        } else {
            from.next() == Some(to)
        };
        if !allowed {
            return Err(WorkflowTransitionError { from, to });
        }
        self.history.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_forward_path() {
        let mut machine = WorkflowMachine::new();
        for state in [
            WorkflowState::Cloned,
            WorkflowState::Reviewed,
            WorkflowState::Remediated,
            WorkflowState::Done,
        ] {
            machine.advance(state).expect("advance");
        }
        assert_eq!(machine.history().len(), 5);
        assert_eq!(machine.state(), WorkflowState::Done);
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut machine = WorkflowMachine::new();
        machine.advance(WorkflowState::Cloned).expect("clone");
        let err = machine.advance(WorkflowState::Remediated).unwrap_err();
        assert_eq!(err.from, WorkflowState::Cloned);
        assert_eq!(machine.state(), WorkflowState::Cloned);
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        let mut machine = WorkflowMachine::new();
        machine.advance(WorkflowState::Cloned).expect("clone");
        machine.advance(WorkflowState::Reviewed).expect("review");
        machine.advance(WorkflowState::Failed).expect("fail");
        assert!(machine.advance(WorkflowState::Failed).is_err());
        assert!(machine.advance(WorkflowState::Remediated).is_err());
    }

    #[test]
    fn done_is_final() {
        let mut machine = WorkflowMachine::new();
        for state in [
            WorkflowState::Cloned,
            WorkflowState::Reviewed,
            WorkflowState::Remediated,
            WorkflowState::Done,
        ] {
            machine.advance(state).expect("advance");
        }
        assert!(machine.advance(WorkflowState::Failed).is_err());
    }
}
