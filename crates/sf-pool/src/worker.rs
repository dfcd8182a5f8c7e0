//! Worker side of the line protocol, shared by spawned and forked workers.

use std::io::{BufRead, Write};
use tracing::{debug, info};

use sf_stats::FitProblem;
use sf_types::PoolError;

use crate::protocol::{evaluate_outcome, Reply, Request, Setup};

fn protocol_error(message: impl Into<String>) -> PoolError {
    PoolError::Protocol {
        message: message.into(),
    }
}

fn write_reply<W: Write>(output: &mut W, reply: &Reply) -> Result<(), PoolError> {
    serde_json::to_writer(&mut *output, reply).map_err(|e| protocol_error(e.to_string()))?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

/// Serve evaluation requests until `Shutdown` or end of input.
///
/// The first line must be a [`Setup`]. Evaluation errors are answered as
/// `Failed` outcomes; only malformed input or a broken pipe ends the loop
/// with an error.
pub fn serve<R: BufRead, W: Write>(mut input: R, output: W) -> Result<(), PoolError> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(protocol_error("no setup received"));
    }
    let setup: Setup = serde_json::from_str(line.trim_end())
        .map_err(|e| protocol_error(format!("bad setup: {e}")))?;
    let problem = setup.problem;

    info!(
        worker_id = setup.worker_id,
        bins = problem.spectrum.len(),
        statistic = %problem.statistic,
        "worker loaded problem"
    );
    let served = serve_loaded(setup.worker_id, &problem, input, output)?;
    debug!(worker_id = setup.worker_id, served, "worker exiting");
    Ok(())
}

/// Announce readiness for an already-loaded problem, then answer requests.
///
/// Returns the number of vectors evaluated. Forked workers enter here
/// directly, so nothing on this path logs.
pub(crate) fn serve_loaded<R: BufRead, W: Write>(
    worker_id: usize,
    problem: &FitProblem,
    mut input: R,
    mut output: W,
) -> Result<usize, PoolError> {
    write_reply(
        &mut output,
        &Reply::Ready {
            worker_id,
            pid: std::process::id(),
        },
    )?;

    let mut line = String::new();
    let mut served = 0usize;
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(line.trim_end())
            .map_err(|e| protocol_error(format!("bad request: {e}")))?;

        match request {
            Request::Evaluate { index, params } => {
                let outcome = evaluate_outcome(problem, &params);
                write_reply(&mut output, &Reply::Result { index, outcome })?;
                served += 1;
            }
            Request::Shutdown => break,
        }
    }
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EvalOutcome;
    use sf_stats::{Component, ModelSpec};
    use sf_types::{SpectrumBins, Statistic, StatisticConfig};
    use std::io::Cursor;

    fn setup_line() -> (FitProblem, String) {
        let spectrum = SpectrumBins::new(vec![1.0, 2.0], vec![2.0, 3.0], vec![3.0, 5.0]).unwrap();
        let model = ModelSpec::single(Component::Constant);
        let params = model.default_parameters().unwrap();
        let problem = FitProblem::new(
            model,
            spectrum,
            None,
            Statistic::CStat,
            StatisticConfig::default(),
            params,
        )
        .unwrap();
        let setup = Setup {
            worker_id: 7,
            problem: problem.clone(),
        };
        (problem, serde_json::to_string(&setup).unwrap())
    }

    fn replies(output: Vec<u8>) -> Vec<Reply> {
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn answers_requests_in_order() {
        let (problem, setup) = setup_line();
        let mut input = setup;
        for (i, v) in [1.0, 4.0].iter().enumerate() {
            let req = Request::Evaluate {
                index: i,
                params: vec![*v],
            };
            input.push('\n');
            input.push_str(&serde_json::to_string(&req).unwrap());
        }
        input.push('\n');
        input.push_str(&serde_json::to_string(&Request::Shutdown).unwrap());
        input.push('\n');

        let mut output = Vec::new();
        serve(Cursor::new(input), &mut output).unwrap();

        let replies = replies(output);
        assert_eq!(replies.len(), 3);
        assert!(matches!(replies[0], Reply::Ready { worker_id: 7, .. }));
        match &replies[2] {
            Reply::Result { index, outcome } => {
                assert_eq!(*index, 1);
                assert_eq!(*outcome, evaluate_outcome(&problem, &[4.0]));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn end_of_input_is_a_clean_exit() {
        let (_, setup) = setup_line();
        let mut output = Vec::new();
        serve(Cursor::new(format!("{setup}\n")), &mut output).unwrap();
        assert_eq!(replies(output).len(), 1);
    }

    #[test]
    fn bad_vector_is_reported_not_fatal() {
        let (_, setup) = setup_line();
        let req = Request::Evaluate {
            index: 0,
            params: vec![1.0, 2.0, 3.0],
        };
        let input = format!("{setup}\n{}\n", serde_json::to_string(&req).unwrap());
        let mut output = Vec::new();
        serve(Cursor::new(input), &mut output).unwrap();

        let replies = replies(output);
        assert!(matches!(
            &replies[1],
            Reply::Result {
                outcome: EvalOutcome::Failed { .. },
                ..
            }
        ));
    }

    #[test]
    fn loaded_problem_skips_setup() {
        let (problem, _) = setup_line();
        let req = Request::Evaluate {
            index: 4,
            params: vec![2.5],
        };
        let input = format!("\n{}\n", serde_json::to_string(&req).unwrap());
        let mut output = Vec::new();
        let served = serve_loaded(3, &problem, Cursor::new(input), &mut output).unwrap();
        assert_eq!(served, 1);

        let replies = replies(output);
        assert_eq!(
            replies[0],
            Reply::Ready {
                worker_id: 3,
                pid: std::process::id()
            }
        );
        assert_eq!(
            replies[1],
            Reply::Result {
                index: 4,
                outcome: evaluate_outcome(&problem, &[2.5])
            }
        );
    }

    #[test]
    fn garbage_setup_is_a_protocol_error() {
        let err = serve(Cursor::new("not json\n"), Vec::new()).unwrap_err();
        assert!(matches!(err, PoolError::Protocol { .. }));

        let err = serve(Cursor::new(""), Vec::new()).unwrap_err();
        assert!(matches!(err, PoolError::Protocol { .. }));
    }
}
