//! Batch evaluation seam between the optimizer and the worker pool.

use tracing::{debug, warn};

use sf_pool::{EvalOutcome, EvalRecord, WorkerPool};

/// Maps a batch of candidate vectors to statistics, in input order.
///
/// `None` marks a candidate that produced no usable statistic: a non-finite
/// value, an evaluation error or a crashed worker. The optimizer ranks those
/// as `+inf`.
pub trait Evaluator {
    fn evaluate_batch(&mut self, candidates: &[Vec<f64>]) -> Vec<Option<f64>>;
}

/// Evaluates through a [`WorkerPool`].
///
/// Single candidates and sequential pools are evaluated in-process.
pub struct PoolEvaluator<'a> {
    pool: &'a mut WorkerPool,
}

impl<'a> PoolEvaluator<'a> {
    pub fn new(pool: &'a mut WorkerPool) -> Self {
        Self { pool }
    }
}

impl Evaluator for PoolEvaluator<'_> {
    fn evaluate_batch(&mut self, candidates: &[Vec<f64>]) -> Vec<Option<f64>> {
        let records = if self.pool.parallelism() > 1 && candidates.len() > 1 {
            self.pool.map_evaluate(candidates)
        } else {
            self.pool.evaluate_in_process(candidates)
        };

        records
            .into_iter()
            .map(|EvalRecord { index, outcome }| match outcome {
                EvalOutcome::Ok { statistic, .. } if statistic.is_finite() => Some(statistic),
                EvalOutcome::Ok { statistic, .. } => {
                    debug!(index, statistic, "non-finite candidate");
                    None
                }
                EvalOutcome::Failed { message } => {
                    warn!(index, "candidate evaluation failed: {message}");
                    None
                }
                EvalOutcome::Crashed { message } => {
                    warn!(index, "candidate lost to worker crash: {message}");
                    None
                }
            })
            .collect()
    }
}

/// Wraps a plain objective function, one candidate at a time.
pub struct FnEvaluator<F>(pub F);

impl<F> Evaluator for FnEvaluator<F>
where
    F: FnMut(&[f64]) -> f64,
{
    fn evaluate_batch(&mut self, candidates: &[Vec<f64>]) -> Vec<Option<f64>> {
        candidates
            .iter()
            .map(|c| Some((self.0)(c)).filter(|v| v.is_finite()))
            .collect()
    }
}
