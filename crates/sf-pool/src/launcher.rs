//! Worker startup capability.
//!
//! The pool only sees [`WorkerLauncher`] and [`WorkerHandle`]; whether a
//! worker inherits the parent's state or starts from scratch is decided once,
//! when the session picks a launcher.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use sf_stats::FitProblem;
use sf_types::{PoolError, StartMethod};

use crate::fork::ForkLauncher;
use crate::protocol::EvalOutcome;
use crate::spawn::SpawnLauncher;

/// A worker died (or stopped answering) while evaluating a vector.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("worker {worker_id} crashed: {message}")]
pub struct WorkerCrash {
    pub worker_id: usize,
    pub message: String,
}

/// A running worker owned by exactly one pool slot.
pub trait WorkerHandle: Send {
    fn id(&self) -> usize;

    /// OS process id, for workers that run in a process of their own.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Evaluate one candidate vector.
    ///
    /// Evaluation errors come back as `Ok(EvalOutcome::Failed)`. `Err` means
    /// the worker itself is gone and must be replaced.
    fn evaluate(&mut self, index: usize, params: &[f64]) -> Result<EvalOutcome, WorkerCrash>;

    /// Stop the worker and release its resources.
    fn shutdown(self: Box<Self>);
}

/// Creates workers loaded with a fit problem.
pub trait WorkerLauncher: Send + Sync {
    /// Human-readable start method name.
    fn name(&self) -> &str;

    fn launch(
        &self,
        worker_id: usize,
        payload: &Arc<FitProblem>,
    ) -> Result<Box<dyn WorkerHandle>, PoolError>;
}

/// Build the launcher for a start method.
///
/// `worker_program` is only consulted for [`StartMethod::Spawn`]; when it is
/// `None` the `sf-worker` executable is looked up next to the current one.
pub fn launcher_for(
    method: StartMethod,
    worker_program: Option<PathBuf>,
) -> Result<Box<dyn WorkerLauncher>, PoolError> {
    match method.resolve() {
        StartMethod::Fork => Ok(Box::new(ForkLauncher::new())),
        StartMethod::Spawn | StartMethod::Default => {
            let launcher = match worker_program {
                Some(program) => SpawnLauncher::new(program),
                None => SpawnLauncher::from_current_exe()?,
            };
            Ok(Box::new(launcher))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_method_needs_no_program() {
        let launcher = launcher_for(StartMethod::Fork, None).unwrap();
        assert_eq!(launcher.name(), "fork");
    }

    #[test]
    fn spawn_method_uses_explicit_program() {
        let launcher = launcher_for(StartMethod::Spawn, Some(PathBuf::from("/bin/true"))).unwrap();
        assert_eq!(launcher.name(), "spawn");
    }

    #[test]
    fn crash_display_names_worker() {
        let crash = WorkerCrash {
            worker_id: 2,
            message: "stdout closed".into(),
        };
        assert_eq!(crash.to_string(), "worker 2 crashed: stdout closed");
    }
}
