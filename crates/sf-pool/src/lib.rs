//! # sf-pool
//!
//! Parallel statistic evaluation for specfit.
//!
//! A [`WorkerPool`] holds a fixed set of workers, each loaded with the same
//! [`sf_stats::FitProblem`], and maps batches of candidate parameter vectors
//! to per-vector outcomes. Workers are started either by inheriting the
//! parent's loaded problem ([`ForkLauncher`]) or as fresh `sf-worker`
//! processes fed over a JSON line protocol ([`SpawnLauncher`]).

mod fork;
mod launcher;
mod pool;
mod protocol;
mod spawn;
mod worker;

pub use fork::ForkLauncher;
pub use launcher::{launcher_for, WorkerCrash, WorkerHandle, WorkerLauncher};
pub use pool::{EvalRecord, PoolStats, WorkerPool};
pub use protocol::{evaluate_outcome, EvalOutcome, Reply, Request, Setup};
pub use spawn::SpawnLauncher;
pub use worker::serve;
