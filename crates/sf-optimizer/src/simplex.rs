//! Bounded Nelder–Mead search with batched, speculative candidate evaluation.
//!
//! Each iteration proposes reflection, expansion and both contractions at
//! once so that a parallel evaluator can score them together. Shrink steps
//! are a second batch of `n` vertices. Candidates are clamped into the
//! parameter bounds before evaluation.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use sf_types::{FitError, FitStatus, OptimizerConfig, ParameterVector};

use crate::evaluator::Evaluator;
use crate::state::OptimizerState;

const REFLECTION: f64 = 1.0;
const EXPANSION: f64 = 2.0;
const CONTRACTION: f64 = 0.5;
const SHRINK: f64 = 0.5;

/// Result of a completed search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub best: Vec<f64>,
    pub statistic: f64,
    pub status: FitStatus,
    pub iterations: usize,
    pub evaluations: usize,
}

#[derive(Debug, Clone)]
struct Vertex {
    point: Vec<f64>,
    value: Option<f64>,
}

impl Vertex {
    fn rank(&self) -> f64 {
        self.value.unwrap_or(f64::INFINITY)
    }
}

pub struct NelderMead {
    config: OptimizerConfig,
    deadline: Option<Instant>,
}

impl NelderMead {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            deadline: None,
        }
    }

    /// No iteration starts once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn minimize<E: Evaluator + ?Sized>(
        &self,
        start: &ParameterVector,
        evaluator: &mut E,
    ) -> Result<SearchOutcome, FitError> {
        let mut state = OptimizerState::Initialized;
        if start.is_empty() {
            state.advance(OptimizerState::Failed)?;
            return Err(FitError::NoFreeParameters);
        }
        if let Err(e) = start.validate() {
            state.advance(OptimizerState::Failed)?;
            return Err(e);
        }

        let n = start.len();
        let mut evaluations = 0usize;

        let initial = self.initial_simplex(start);
        let values = evaluator.evaluate_batch(&initial);
        evaluations += initial.len();
        if values.iter().all(Option::is_none) {
            state.advance(OptimizerState::Failed)?;
            return Err(FitError::AllCandidatesNonFinite { iteration: 0 });
        }
        let mut simplex: Vec<Vertex> = initial
            .into_iter()
            .zip(values)
            .map(|(point, value)| Vertex { point, value })
            .collect();
        sort_simplex(&mut simplex);

        state.advance(OptimizerState::Iterating)?;
        let mut iterations = 0usize;
        let mut streak = 0usize;

        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                state.advance(OptimizerState::DeadlineExceeded)?;
                break;
            }
            if iterations >= self.config.max_iterations {
                state.advance(OptimizerState::MaxIterExceeded)?;
                break;
            }
            iterations += 1;
            let previous_best = simplex[0].rank();

            let centroid = centroid(&simplex[..n]);
            let worst = &simplex[n].point;
            let candidates: Vec<Vec<f64>> = [REFLECTION, EXPANSION, CONTRACTION, -CONTRACTION]
                .iter()
                .map(|&coef| {
                    let mut p: Vec<f64> = centroid
                        .iter()
                        .zip(worst)
                        .map(|(c, w)| c + coef * (c - w))
                        .collect();
                    start.clamp_into(&mut p);
                    p
                })
                .collect();

            let values = evaluator.evaluate_batch(&candidates);
            evaluations += candidates.len();
            if values.iter().all(Option::is_none) {
                warn!(iteration = iterations, "every candidate is non-finite");
                state.advance(OptimizerState::Failed)?;
                return Err(FitError::AllCandidatesNonFinite {
                    iteration: iterations,
                });
            }

            let mut proposals: Vec<Vertex> = candidates
                .into_iter()
                .zip(values)
                .map(|(point, value)| Vertex { point, value })
                .collect();
            let [fr, fe, foc, fic] = [0, 1, 2, 3].map(|i| proposals[i].rank());

            let best = simplex[0].rank();
            let second_worst = simplex[n - 1].rank();
            let worst_value = simplex[n].rank();

            let step = if fr < best {
                if fe < fr {
                    Step::Accept(EXPANDED, "expand")
                } else {
                    Step::Accept(REFLECTED, "reflect")
                }
            } else if fr < second_worst {
                Step::Accept(REFLECTED, "reflect")
            } else if fr < worst_value {
                if foc <= fr {
                    Step::Accept(OUTSIDE, "contract outside")
                } else {
                    Step::Shrink
                }
            } else if fic < worst_value {
                Step::Accept(INSIDE, "contract inside")
            } else {
                Step::Shrink
            };

            let action = match step {
                Step::Accept(which, action) => {
                    simplex[n] = proposals.swap_remove(which);
                    action
                }
                Step::Shrink => {
                    evaluations += self.shrink(&mut simplex, start, evaluator);
                    "shrink"
                }
            };
            sort_simplex(&mut simplex);

            let best = simplex[0].rank();
            let delta = (previous_best - best).abs();
            let spread = simplex
                .iter()
                .map(|v| (v.rank() - best).abs())
                .fold(0.0, f64::max);
            let measure = delta.max(spread);
            if measure < self.config.ftol {
                streak += 1;
            } else {
                streak = 0;
            }
            debug!(iteration = iterations, action, best, measure, "simplex step");

            if streak >= self.config.conv_iters {
                state.advance(OptimizerState::Converged)?;
                break;
            }
        }

        let best = simplex.swap_remove(0);
        let status = state.fit_status().ok_or_else(|| FitError::InvalidTransition {
            from: state.to_string(),
            to: "result".into(),
        })?;
        info!(%status, iterations, evaluations, statistic = best.rank(), "search finished");

        Ok(SearchOutcome {
            statistic: best.rank(),
            best: best.point,
            status,
            iterations,
            evaluations,
        })
    }

    /// `n + 1` vertices: the start plus one step along each axis.
    ///
    /// The step is `initial_step` times the value, or times the bound range
    /// capped at 1 for zero values. A step that would leave the upper bound is
    /// taken downwards instead.
    fn initial_simplex(&self, start: &ParameterVector) -> Vec<Vec<f64>> {
        let mut vertices = Vec::with_capacity(start.len() + 1);
        vertices.push(start.values.clone());
        for (i, (&x, &(min, max))) in start.values.iter().zip(&start.bounds).enumerate() {
            let step = if x != 0.0 {
                self.config.initial_step * x.abs()
            } else {
                self.config.initial_step * (max - min).min(1.0)
            };
            let mut v = start.values.clone();
            v[i] = if x + step <= max { x + step } else { x - step };
            start.clamp_into(&mut v);
            vertices.push(v);
        }
        vertices
    }

    /// Pull every vertex halfway towards the best one. Returns the number of
    /// evaluations spent.
    fn shrink<E: Evaluator + ?Sized>(
        &self,
        simplex: &mut [Vertex],
        bounds: &ParameterVector,
        evaluator: &mut E,
    ) -> usize {
        let best = simplex[0].point.clone();
        let points: Vec<Vec<f64>> = simplex[1..]
            .iter()
            .map(|v| {
                let mut p: Vec<f64> = best
                    .iter()
                    .zip(&v.point)
                    .map(|(b, x)| b + SHRINK * (x - b))
                    .collect();
                bounds.clamp_into(&mut p);
                p
            })
            .collect();
        let values = evaluator.evaluate_batch(&points);
        let spent = points.len();
        for (vertex, (point, value)) in simplex[1..].iter_mut().zip(points.into_iter().zip(values)) {
            *vertex = Vertex { point, value };
        }
        spent
    }
}

// Positions in the speculative batch.
const REFLECTED: usize = 0;
const EXPANDED: usize = 1;
const OUTSIDE: usize = 2;
const INSIDE: usize = 3;

enum Step {
    Accept(usize, &'static str),
    Shrink,
}

fn sort_simplex(simplex: &mut [Vertex]) {
    simplex.sort_by(|a, b| a.rank().total_cmp(&b.rank()));
}

fn centroid(vertices: &[Vertex]) -> Vec<f64> {
    let n = vertices.len() as f64;
    let dim = vertices[0].point.len();
    let mut c = vec![0.0; dim];
    for v in vertices {
        for (ci, xi) in c.iter_mut().zip(&v.point) {
            *ci += xi;
        }
    }
    c.iter_mut().for_each(|ci| *ci /= n);
    c
}
