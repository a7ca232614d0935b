//! Execution kernel state machine.
//!
//! ```text
//! Init -> Validating -> Planning -> Refused ----------------------+
//!                                -> Planned -> Executing -> Executed --------+
//!                                                       -> ExecutionFailed --+
//!                                           -> HandoffEmitted ---------------+
//!                                                                            v
//!                                                            ArtifactsWritten -> Exit
//! ```
//!
//! `Validating` may also go straight to `Refused` (packet format), and
//! `Planned` may go to `Refused` when the selected runner cannot be launched.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    Init,
    Validating,
    Planning,
    Refused,
    Planned,
    Executing,
    Executed,
    ExecutionFailed,
    HandoffEmitted,
    ArtifactsWritten,
    Exit,
}

/// Attempted transition not present in the state graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: KernelState,
    pub to: KernelState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid kernel transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl KernelState {
    pub fn can_transition_to(self, to: KernelState) -> bool {
        use KernelState as S;
        matches!(
            (self, to),
            (S::Init, S::Validating)
                | (S::Validating, S::Planning | S::Refused)
                | (S::Planning, S::Refused | S::Planned)
                | (S::Planned, S::Executing | S::HandoffEmitted | S::Refused)
                | (S::Executing, S::Executed | S::ExecutionFailed)
                | (
                    S::Refused | S::Executed | S::ExecutionFailed | S::HandoffEmitted,
                    S::ArtifactsWritten
                )
                | (S::ArtifactsWritten, S::Exit)
        )
    }

    /// Outcome states that must be followed by `ArtifactsWritten`.
    pub fn is_terminal_outcome(self) -> bool {
        matches!(
            self,
            Self::Refused | Self::Executed | Self::ExecutionFailed | Self::HandoffEmitted
        )
    }
}

/// Records every state the kernel passes through and rejects illegal moves.
#[derive(Debug, Clone)]
pub struct StateTrace {
    current: KernelState,
    history: Vec<KernelState>,
}

impl Default for StateTrace {
    fn default() -> Self {
        Self {
            current: KernelState::Init,
            history: vec![KernelState::Init],
        }
    }
}

impl StateTrace {
    pub fn current(&self) -> KernelState {
        self.current
    }

    pub fn history(&self) -> &[KernelState] {
        &self.history
    }

    pub fn advance(&mut self, to: KernelState) -> Result<(), InvalidTransition> {
        if !self.current.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.current,
                to,
            });
        }
        self.current = to;
        self.history.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_path_is_accepted() {
        let mut trace = StateTrace::default();
        for state in [
            KernelState::Validating,
            KernelState::Planning,
            KernelState::Planned,
            KernelState::HandoffEmitted,
            KernelState::ArtifactsWritten,
            KernelState::Exit,
        ] {
            trace.advance(state).expect("transition");
        }
        assert_eq!(trace.history().len(), 7);
    }

    #[test]
    fn outcomes_cannot_skip_artifacts_written() {
        for state in [
            KernelState::Refused,
            KernelState::Executed,
            KernelState::ExecutionFailed,
            KernelState::HandoffEmitted,
        ] {
            assert!(state.is_terminal_outcome());
            assert!(!state.can_transition_to(KernelState::Exit));
            assert!(state.can_transition_to(KernelState::ArtifactsWritten));
        }
    }

    #[test]
    fn execution_requires_a_plan() {
        let mut trace = StateTrace::default();
        trace.advance(KernelState::Validating).expect("validating");
        let err = trace.advance(KernelState::Executing).expect_err("illegal");
        assert_eq!(err.from, KernelState::Validating);
        assert_eq!(trace.current(), KernelState::Validating);
    }

    #[test]
    fn executed_cannot_retry() {
        assert!(!KernelState::Executed.can_transition_to(KernelState::Executing));
        assert!(!KernelState::ExecutionFailed.can_transition_to(KernelState::Executing));
    }
}
