use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use sf_stats::FitProblem;
use sf_types::{FitConfig, PoolError};

use crate::launcher::{launcher_for, WorkerHandle, WorkerLauncher};
use crate::protocol::{evaluate_outcome, EvalOutcome};

/// Outcome for one candidate vector, keyed by its position in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRecord {
    pub index: usize,
    pub outcome: EvalOutcome,
}

/// Running totals for a pool, in-process evaluations included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub evaluations: u64,
    pub failures: u64,
    /// Worker deaths, plus vectors left over after every driver stopped.
    pub crashes: u64,
    pub relaunches: u64,
}

type Job<'a> = (usize, &'a [f64]);

/// Fixed-size pool of workers loaded with one fit problem.
///
/// Worker count and start method are chosen at construction and never change.
/// Workers are shut down when the pool is dropped.
pub struct WorkerPool {
    problem: Arc<FitProblem>,
    launcher: Option<Box<dyn WorkerLauncher>>,
    workers: Vec<Option<Box<dyn WorkerHandle>>>,
    next_worker_id: AtomicUsize,
    stats: Mutex<PoolStats>,
}

impl WorkerPool {
    /// In-process, one vector at a time.
    pub fn sequential(problem: Arc<FitProblem>) -> Self {
        Self {
            problem,
            launcher: None,
            workers: Vec::new(),
            next_worker_id: AtomicUsize::new(0),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Start `numcores` workers with `launcher`.
    ///
    /// `None` uses every available core. Fewer than two cores, or any worker
    /// failing to start, leaves the pool sequential.
    pub fn new(
        problem: Arc<FitProblem>,
        numcores: Option<usize>,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Self {
        let n = resolve_numcores(numcores);
        if n < 2 {
            debug!(numcores = n, "parallel evaluation disabled");
            return Self::sequential(problem);
        }

        let mut workers = Vec::with_capacity(n);
        for worker_id in 0..n {
            match launcher.launch(worker_id, &problem) {
                Ok(handle) => workers.push(Some(handle)),
                Err(e) => {
                    warn!(
                        method = launcher.name(),
                        "could not start worker {worker_id}, evaluating in-process: {e}"
                    );
                    for handle in workers.into_iter().flatten() {
                        handle.shutdown();
                    }
                    return Self::sequential(problem);
                }
            }
        }

        info!(workers = n, method = launcher.name(), "worker pool started");
        Self {
            problem,
            launcher: Some(launcher),
            workers,
            next_worker_id: AtomicUsize::new(n),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Build a pool from session configuration.
    pub fn from_config(problem: Arc<FitProblem>, config: &FitConfig) -> Self {
        if resolve_numcores(config.numcores) < 2 {
            return Self::sequential(problem);
        }
        match launcher_for(
            config.multiprocessing_start_method,
            config.worker_program.clone(),
        ) {
            Ok(launcher) => Self::new(problem, config.numcores, launcher),
            Err(e) => {
                warn!("no worker launcher available, evaluating in-process: {e}");
                Self::sequential(problem)
            }
        }
    }

    pub fn problem(&self) -> &Arc<FitProblem> {
        &self.problem
    }

    /// Number of vectors that can be evaluated concurrently.
    pub fn parallelism(&self) -> usize {
        self.workers.len().max(1)
    }

    pub fn start_method(&self) -> Option<&str> {
        self.launcher.as_deref().map(|l| l.name())
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    /// Evaluate every vector, returning one record per vector in index order.
    ///
    /// Evaluation errors become `Failed`. A worker crash retries the vector
    /// once on a fresh worker; a second crash yields `Crashed`.
    pub fn map_evaluate(&mut self, vectors: &[Vec<f64>]) -> Vec<EvalRecord> {
        if vectors.is_empty() {
            return Vec::new();
        }
        let Some(launcher) = self.launcher.as_deref() else {
            return self.evaluate_in_process(vectors);
        };

        let (job_tx, job_rx) = unbounded::<Job<'_>>();
        for (index, v) in vectors.iter().enumerate() {
            let _ = job_tx.send((index, v.as_slice()));
        }
        drop(job_tx);

        let (done_tx, done_rx) = unbounded::<EvalRecord>();
        let dispatch = Dispatch {
            problem: &self.problem,
            launcher,
            next_worker_id: &self.next_worker_id,
            stats: &self.stats,
        };

        std::thread::scope(|s| {
            for slot in self.workers.iter_mut() {
                let jobs = job_rx.clone();
                let done = done_tx.clone();
                let dispatch = &dispatch;
                s.spawn(move || dispatch.drive(slot, &jobs, &done));
            }
        });
        drop(done_tx);

        let mut outcomes: Vec<Option<EvalOutcome>> = vec![None; vectors.len()];
        for record in done_rx.try_iter() {
            outcomes[record.index] = Some(record.outcome);
        }

        outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    let mut stats = self.stats.lock();
                    stats.evaluations += 1;
                    stats.crashes += 1;
                    EvalOutcome::Crashed {
                        message: "no worker left to evaluate this vector".into(),
                    }
                });
                EvalRecord { index, outcome }
            })
            .collect()
    }

    /// Evaluate every vector in this process, bypassing the workers.
    pub fn evaluate_in_process(&self, vectors: &[Vec<f64>]) -> Vec<EvalRecord> {
        vectors
            .iter()
            .enumerate()
            .map(|(index, v)| {
                let outcome = evaluate_outcome(&self.problem, v);
                record_outcome(&self.stats, &outcome);
                EvalRecord { index, outcome }
            })
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let n = self.workers.len();
        for handle in self.workers.drain(..).flatten() {
            handle.shutdown();
        }
        if n > 0 {
            debug!(workers = n, "worker pool shut down");
        }
    }
}

fn resolve_numcores(numcores: Option<usize>) -> usize {
    numcores.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

fn record_outcome(stats: &Mutex<PoolStats>, outcome: &EvalOutcome) {
    let mut stats = stats.lock();
    stats.evaluations += 1;
    if matches!(outcome, EvalOutcome::Failed { .. }) {
        stats.failures += 1;
    }
}

/// Shared state for the per-worker driver threads of one batch.
struct Dispatch<'a> {
    problem: &'a Arc<FitProblem>,
    launcher: &'a dyn WorkerLauncher,
    next_worker_id: &'a AtomicUsize,
    stats: &'a Mutex<PoolStats>,
}

impl Dispatch<'_> {
    fn drive(
        &self,
        slot: &mut Option<Box<dyn WorkerHandle>>,
        jobs: &Receiver<Job<'_>>,
        done: &Sender<EvalRecord>,
    ) {
        for (index, params) in jobs.iter() {
            let (outcome, alive) = self.run(slot, index, params);
            record_outcome(self.stats, &outcome);
            let _ = done.send(EvalRecord { index, outcome });
            if !alive {
                break;
            }
        }
    }

    /// Evaluate one vector with a single retry. The flag is false when no
    /// worker could be relaunched for this slot.
    fn run(
        &self,
        slot: &mut Option<Box<dyn WorkerHandle>>,
        index: usize,
        params: &[f64],
    ) -> (EvalOutcome, bool) {
        let mut last_crash = String::new();
        for attempt in 1..=2 {
            let mut worker = match slot.take() {
                Some(worker) => worker,
                None => match self.relaunch() {
                    Ok(worker) => worker,
                    Err(e) => {
                        warn!(index, "worker relaunch failed: {e}");
                        let outcome = EvalOutcome::Crashed {
                            message: format!("worker relaunch failed: {e}"),
                        };
                        return (outcome, false);
                    }
                },
            };

            match worker.evaluate(index, params) {
                Ok(outcome) => {
                    *slot = Some(worker);
                    return (outcome, true);
                }
                Err(crash) => {
                    warn!(index, attempt, "{crash}");
                    self.stats.lock().crashes += 1;
                    last_crash = crash.to_string();
                }
            }
        }
        (EvalOutcome::Crashed { message: last_crash }, true)
    }

    fn relaunch(&self) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.launcher.launch(worker_id, self.problem)?;
        self.stats.lock().relaunches += 1;
        debug!(
            worker_id,
            pid = ?handle.pid(),
            method = self.launcher.name(),
            "worker relaunched"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::ForkLauncher;
    use crate::launcher::WorkerCrash;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use sf_stats::{Component, ModelSpec};
    use sf_types::{SpectrumBins, Statistic, StatisticConfig};
    use std::sync::atomic::AtomicBool;

    fn problem() -> Arc<FitProblem> {
        let lo: Vec<f64> = (1..=20).map(|i| i as f64 * 0.5).collect();
        let hi: Vec<f64> = lo.iter().map(|l| l + 0.5).collect();
        let counts: Vec<f64> = (0..20).map(|i| ((i * 7) % 11) as f64).collect();
        let spectrum = SpectrumBins::new(lo, hi, counts).unwrap();
        let model = ModelSpec::single(Component::PowerLaw);
        let params = model.default_parameters().unwrap();
        Arc::new(
            FitProblem::new(
                model,
                spectrum,
                None,
                Statistic::CStat,
                StatisticConfig::default(),
                params,
            )
            .unwrap(),
        )
    }

    fn random_vectors(seed: u64, n: usize) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| vec![rng.gen_range(-1.0..4.0), rng.gen_range(0.0..20.0)])
            .collect()
    }

    #[test]
    fn fork_pool_matches_sequential_evaluation() {
        let problem = problem();
        let vectors = random_vectors(42, 37);

        let mut sequential = WorkerPool::sequential(Arc::clone(&problem));
        let mut parallel = WorkerPool::new(Arc::clone(&problem), Some(4), Box::new(ForkLauncher::new()));
        assert_eq!(parallel.parallelism(), 4);
        assert_eq!(parallel.start_method(), Some("fork"));

        let expected = sequential.map_evaluate(&vectors);
        let actual = parallel.map_evaluate(&vectors);
        assert_eq!(actual, expected);
        assert!(actual.iter().enumerate().all(|(i, r)| r.index == i));

        let stats = parallel.stats();
        assert_eq!(stats.evaluations, 37);
        assert_eq!(stats.crashes, 0);
    }

    #[test]
    fn single_core_is_sequential() {
        let pool = WorkerPool::new(problem(), Some(1), Box::new(ForkLauncher::new()));
        assert_eq!(pool.parallelism(), 1);
        assert_eq!(pool.start_method(), None);

        let config = FitConfig::default().with_numcores(Some(0));
        assert_eq!(WorkerPool::from_config(problem(), &config).parallelism(), 1);
    }

    #[test]
    fn evaluation_errors_are_captured_per_vector() {
        let mut pool = WorkerPool::new(problem(), Some(2), Box::new(ForkLauncher::new()));
        let vectors = vec![vec![2.0, 1.0], vec![2.0], vec![1.5, 3.0]];
        let records = pool.map_evaluate(&vectors);

        assert!(records[0].outcome.is_ok());
        assert!(matches!(records[1].outcome, EvalOutcome::Failed { .. }));
        assert!(records[2].outcome.is_ok());
        assert_eq!(pool.stats().failures, 1);
    }

    #[test]
    fn empty_batch_is_empty() {
        let mut pool = WorkerPool::new(problem(), Some(2), Box::new(ForkLauncher::new()));
        assert!(pool.map_evaluate(&[]).is_empty());
    }

    /// Crashes on any vector with a negative first element, and once on the
    /// first vector whose first element is 13.
    struct FlakyLauncher {
        tripped: Arc<AtomicBool>,
        launches: AtomicUsize,
        max_launches: usize,
    }

    impl FlakyLauncher {
        fn new(max_launches: usize) -> Self {
            Self {
                tripped: Arc::new(AtomicBool::new(false)),
                launches: AtomicUsize::new(0),
                max_launches,
            }
        }
    }

    struct FlakyWorker {
        inner: Box<dyn WorkerHandle>,
        tripped: Arc<AtomicBool>,
    }

    impl WorkerLauncher for FlakyLauncher {
        fn name(&self) -> &str {
            "flaky"
        }

        fn launch(
            &self,
            worker_id: usize,
            payload: &Arc<FitProblem>,
        ) -> Result<Box<dyn WorkerHandle>, PoolError> {
            if self.launches.fetch_add(1, Ordering::SeqCst) >= self.max_launches {
                return Err(PoolError::Launch {
                    worker_id,
                    message: "launch budget spent".into(),
                });
            }
            Ok(Box::new(FlakyWorker {
                inner: ForkLauncher::new().launch(worker_id, payload)?,
                tripped: Arc::clone(&self.tripped),
            }))
        }
    }

    impl WorkerHandle for FlakyWorker {
        fn id(&self) -> usize {
            self.inner.id()
        }

        fn evaluate(&mut self, index: usize, params: &[f64]) -> Result<EvalOutcome, WorkerCrash> {
            let crash = params[0] < 0.0 || (params[0] == 13.0 && !self.tripped.swap(true, Ordering::SeqCst));
            if crash {
                return Err(WorkerCrash {
                    worker_id: self.id(),
                    message: "segfault".into(),
                });
            }
            self.inner.evaluate(index, params)
        }

        fn shutdown(self: Box<Self>) {
            self.inner.shutdown();
        }
    }

    #[test]
    fn crash_is_retried_once_then_reported() {
        let problem = problem();
        let mut pool = WorkerPool::new(Arc::clone(&problem), Some(2), Box::new(FlakyLauncher::new(100)));
        let vectors = vec![vec![1.0, 2.0], vec![13.0, 1.0], vec![-1.0, 1.0], vec![2.0, 3.0]];
        let records = pool.map_evaluate(&vectors);

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].outcome, evaluate_outcome(&problem, &vectors[0]));
        // Crashed once, succeeded on the fresh worker.
        assert_eq!(records[1].outcome, evaluate_outcome(&problem, &vectors[1]));
        // Crashed twice.
        assert!(matches!(&records[2].outcome, EvalOutcome::Crashed { message } if message.contains("segfault")));
        assert_eq!(records[3].outcome, evaluate_outcome(&problem, &vectors[3]));

        let stats = pool.stats();
        assert_eq!(stats.crashes, 3);
        assert!(stats.relaunches >= 2);
        assert_eq!(stats.evaluations, 4);

        // The pool keeps working after crashes.
        let again = pool.map_evaluate(&vectors[..1]);
        assert!(again[0].outcome.is_ok());
    }

    #[test]
    fn failed_relaunch_marks_vectors_crashed() {
        let mut pool = WorkerPool::new(problem(), Some(2), Box::new(FlakyLauncher::new(2)));
        assert_eq!(pool.parallelism(), 2);

        let vectors: Vec<Vec<f64>> = (0..6).map(|i| vec![-1.0 - i as f64, 1.0]).collect();
        let records = pool.map_evaluate(&vectors);
        assert_eq!(records.len(), 6);
        assert!(records
            .iter()
            .all(|r| matches!(r.outcome, EvalOutcome::Crashed { .. })));

        // Two worker deaths plus four vectors no driver was left to take.
        let stats = pool.stats();
        assert_eq!(stats.crashes, 6);
        assert_eq!(stats.evaluations, 6);
        assert_eq!(stats.relaunches, 0);
    }

    #[test]
    fn in_process_evaluations_are_counted() {
        let problem = problem();
        let pool = WorkerPool::new(Arc::clone(&problem), Some(2), Box::new(ForkLauncher::new()));
        let records = pool.evaluate_in_process(&[vec![2.0, 1.0], vec![2.0]]);

        assert_eq!(records[0].outcome, evaluate_outcome(&problem, &[2.0, 1.0]));
        assert!(matches!(records[1].outcome, EvalOutcome::Failed { .. }));
        let stats = pool.stats();
        assert_eq!(stats.evaluations, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn launch_failure_at_startup_falls_back_to_sequential() {
        let mut pool = WorkerPool::new(problem(), Some(3), Box::new(FlakyLauncher::new(1)));
        assert_eq!(pool.parallelism(), 1);
        let records = pool.map_evaluate(&[vec![1.0, 1.0]]);
        assert!(records[0].outcome.is_ok());
    }
}
