//! Optimizer lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use sf_types::{FitError, FitStatus};

/// Lifecycle state of one optimizer run.
///
/// `Initialized -> Iterating -> {Converged, MaxIterExceeded, DeadlineExceeded}`,
/// with `Failed` reachable from both live states. Terminal states accept no
/// further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerState {
    Initialized,
    Iterating,
    Converged,
    MaxIterExceeded,
    DeadlineExceeded,
    Failed,
}

impl Default for OptimizerState {
    fn default() -> Self {
        Self::Initialized
    }
}

impl OptimizerState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initialized | Self::Iterating)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        use OptimizerState::*;
        matches!(
            (self, next),
            (Initialized, Iterating)
                | (Initialized, Failed)
                | (Iterating, Converged)
                | (Iterating, MaxIterExceeded)
                | (Iterating, DeadlineExceeded)
                | (Iterating, Failed)
        )
    }

    pub fn advance(&mut self, next: Self) -> Result<(), FitError> {
        if !self.can_transition_to(next) {
            return Err(FitError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Status reported in a fit result; `None` unless the run ended normally.
    pub fn fit_status(&self) -> Option<FitStatus> {
        match self {
            Self::Converged => Some(FitStatus::Converged),
            Self::MaxIterExceeded => Some(FitStatus::MaxIterExceeded),
            Self::DeadlineExceeded => Some(FitStatus::DeadlineExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for OptimizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "INITIALIZED",
            Self::Iterating => "ITERATING",
            Self::Converged => "CONVERGED",
            Self::MaxIterExceeded => "MAX_ITER_EXCEEDED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let mut state = OptimizerState::default();
        state.advance(OptimizerState::Iterating).unwrap();
        assert!(!state.is_terminal());
        state.advance(OptimizerState::Converged).unwrap();
        assert!(state.is_terminal());
        assert_eq!(state.fit_status(), Some(FitStatus::Converged));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        for terminal in [
            OptimizerState::Converged,
            OptimizerState::MaxIterExceeded,
            OptimizerState::DeadlineExceeded,
            OptimizerState::Failed,
        ] {
            let mut state = terminal;
            let err = state.advance(OptimizerState::Iterating).unwrap_err();
            assert!(matches!(err, FitError::InvalidTransition { .. }));
            assert_eq!(state, terminal);
        }
    }

    #[test]
    fn cannot_finish_without_iterating() {
        let mut state = OptimizerState::Initialized;
        assert!(state.advance(OptimizerState::Converged).is_err());
        state.advance(OptimizerState::Failed).unwrap();
        assert_eq!(state.fit_status(), None);
    }
}
