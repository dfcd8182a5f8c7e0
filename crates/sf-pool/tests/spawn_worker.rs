use std::sync::Arc;

use sf_pool::{EvalOutcome, SpawnLauncher, WorkerLauncher, WorkerPool};
use sf_stats::{load_response, Component, FitProblem, ModelSpec};
use sf_types::{ResponseMatrix, SpectrumBins, Statistic, StatisticConfig};

const WORKER: &str = env!("CARGO_BIN_EXE_sf-worker");

fn problem() -> Arc<FitProblem> {
    let lo: Vec<f64> = (0..8).map(|i| i as f64 * 0.25).collect();
    let hi: Vec<f64> = lo.iter().map(|l| l + 0.25).collect();
    // First ENERG_LO is zero and gets replaced at load time.
    let rsp = load_response(ResponseMatrix::diagonal(lo.clone(), hi.clone()).unwrap(), Some(1e-10)).unwrap();
    let spectrum = SpectrumBins::new(lo, hi, vec![0.0, 3.0, 5.0, 2.0, 1.0, 0.0, 4.0, 2.0])
        .unwrap()
        .with_exposure(10.0)
        .unwrap();
    let model = ModelSpec::new(vec![Component::Constant, Component::Gaussian]);
    let params = model.default_parameters().unwrap();
    Arc::new(
        FitProblem::new(
            model,
            spectrum,
            Some(rsp),
            Statistic::Cash,
            StatisticConfig::default(),
            params,
        )
        .unwrap(),
    )
}

#[test]
fn spawned_workers_match_in_process_results() {
    let problem = problem();
    let vectors: Vec<Vec<f64>> = (0..12)
        .map(|i| {
            let x = i as f64;
            vec![0.1 * x, 0.05 + 0.01 * x, 0.5 + 0.1 * x, 2.0 - 0.1 * x]
        })
        .collect();

    let mut sequential = WorkerPool::sequential(Arc::clone(&problem));
    let mut spawned = WorkerPool::new(
        Arc::clone(&problem),
        Some(3),
        Box::new(SpawnLauncher::new(WORKER)),
    );
    assert_eq!(spawned.parallelism(), 3);
    assert_eq!(spawned.start_method(), Some("spawn"));

    assert_eq!(spawned.map_evaluate(&vectors), sequential.map_evaluate(&vectors));
}

#[test]
fn spawned_worker_reports_bad_vectors() {
    let problem = problem();
    let mut worker = SpawnLauncher::new(WORKER).launch(0, &problem).unwrap();

    let outcome = worker.evaluate(0, &[1.0]).unwrap();
    assert!(matches!(outcome, EvalOutcome::Failed { .. }));

    let outcome = worker.evaluate(1, &[0.2, 0.1, 1.0, 1.0]).unwrap();
    assert!(outcome.statistic().unwrap().is_finite());
    worker.shutdown();
}

/// Says ready, then exits before answering anything.
#[cfg(unix)]
fn dying_launcher() -> SpawnLauncher {
    SpawnLauncher::new("/bin/sh").with_args([
        "-c",
        r#"read setup; echo '{"kind":"ready","worker_id":0,"pid":0}'; exit 3"#,
    ])
}

#[cfg(unix)]
#[test]
fn dying_worker_process_is_retried_then_reported() {
    let problem = problem();
    let vectors: Vec<Vec<f64>> = (0..3).map(|i| vec![0.1 * i as f64, 0.1, 1.0, 1.0]).collect();

    let mut pool = WorkerPool::new(Arc::clone(&problem), Some(2), Box::new(dying_launcher()));
    assert_eq!(pool.parallelism(), 2);

    let records = pool.map_evaluate(&vectors);
    assert_eq!(records.len(), 3);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.index, i);
        match &record.outcome {
            EvalOutcome::Crashed { message } => {
                assert!(message.contains("exit status: 3"), "{message}")
            }
            other => panic!("vector {i} was not lost to a crash: {other:?}"),
        }
    }

    let stats = pool.stats();
    assert_eq!(stats.crashes, 6);
    assert!(stats.relaunches >= 3, "{stats:?}");
    assert_eq!(stats.evaluations, 3);
    assert_eq!(stats.failures, 0);
}
