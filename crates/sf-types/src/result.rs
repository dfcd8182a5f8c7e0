//! Fit results reported back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::FitError;
use crate::parameter::ParameterVector;
use crate::statistic::Statistic;

/// Unique fit session identifier.
pub type SessionId = Uuid;

/// How an optimization run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    MaxIterExceeded,
    /// The session deadline expired before convergence.
    DeadlineExceeded,
}

impl FitStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Converged => "converged",
            Self::MaxIterExceeded => "max iterations exceeded",
            Self::DeadlineExceeded => "deadline exceeded",
        };
        f.write_str(s)
    }
}

/// Outcome of a completed fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub session_id: SessionId,
    pub statistic_kind: Statistic,
    /// Best-fit free parameters.
    pub best: ParameterVector,
    /// Best-fit values of every model parameter, frozen ones included.
    pub parameter_values: Vec<f64>,
    pub statistic: f64,
    /// Per-bin statistic contributions at the best fit.
    pub per_bin: Vec<f64>,
    pub status: FitStatus,
    pub iterations: usize,
    pub evaluations: usize,
    /// Number of bins minus number of free parameters.
    pub dof: i64,
    /// 1-sigma uncertainty per free parameter, when it could be estimated.
    pub errors: Vec<Option<f64>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FitResult {
    /// Statistic divided by degrees of freedom.
    pub fn reduced_statistic(&self) -> Option<f64> {
        if self.dof > 0 {
            Some(self.statistic / self.dof as f64)
        } else {
            None
        }
    }

    /// Ok only when the search converged.
    pub fn ensure_converged(&self) -> Result<&Self, FitError> {
        if self.status.is_converged() {
            Ok(self)
        } else {
            Err(FitError::FailedConvergence {
                status: self.status.to_string(),
                iterations: self.iterations,
            })
        }
    }

    pub fn value_of(&self, name: &str) -> Option<f64> {
        let idx = self.best.names.iter().position(|n| n == name)?;
        self.best.values.get(idx).copied()
    }

    pub fn error_of(&self, name: &str) -> Option<f64> {
        let idx = self.best.names.iter().position(|n| n == name)?;
        self.errors.get(idx).copied().flatten()
    }
}
