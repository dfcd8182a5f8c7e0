//! 1-sigma parameter errors from the curvature of the statistic.
//!
//! For statistics where a change of 1 marks one sigma, a parabola through the
//! minimum gives `sigma = sqrt(2 / S'')`. Off-diagonal terms are ignored.

use tracing::debug;

use sf_types::ParameterVector;

use crate::evaluator::Evaluator;

const RELATIVE_STEP: f64 = 1.0e-4;
const MIN_SCALE: f64 = 1.0e-2;

/// Per-parameter errors plus the number of evaluations spent.
///
/// All `2n + 1` points are evaluated as a single batch. A parameter whose
/// curvature is not positive and finite, or that sits on a bound, gets `None`.
pub fn curvature_errors<E: Evaluator + ?Sized>(
    best: &ParameterVector,
    evaluator: &mut E,
) -> (Vec<Option<f64>>, usize) {
    let n = best.len();
    let mut points = Vec::with_capacity(2 * n + 1);
    let mut steps = Vec::with_capacity(n);
    points.push(best.values.clone());

    for (i, (&x, &(min, max))) in best.values.iter().zip(&best.bounds).enumerate() {
        let h = RELATIVE_STEP * x.abs().max(MIN_SCALE);
        let up = (x + h).min(max);
        let down = (x - h).max(min);

        let mut p = best.values.clone();
        p[i] = up;
        points.push(p);
        let mut p = best.values.clone();
        p[i] = down;
        points.push(p);
        steps.push((up - x, x - down));
    }

    let values = evaluator.evaluate_batch(&points);
    let spent = points.len();
    let Some(center) = values[0] else {
        return (vec![None; n], spent);
    };

    let errors = steps
        .iter()
        .enumerate()
        .map(|(i, &(h_up, h_down))| {
            let (Some(f_up), Some(f_down)) = (values[1 + 2 * i], values[2 + 2 * i]) else {
                return None;
            };
            if h_up <= 0.0 || h_down <= 0.0 {
                return None;
            }
            // Second derivative on an uneven three-point stencil.
            let curvature = 2.0 * (h_down * f_up + h_up * f_down - (h_up + h_down) * center)
                / (h_up * h_down * (h_up + h_down));
            let sigma = (2.0 / curvature).sqrt();
            debug!(parameter = %best.names[i], curvature, sigma, "curvature estimate");
            (curvature > 0.0 && sigma.is_finite()).then_some(sigma)
        })
        .collect();

    (errors, spent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::FnEvaluator;

    fn vector(values: Vec<f64>, bounds: Vec<(f64, f64)>) -> ParameterVector {
        ParameterVector {
            names: (0..values.len()).map(|i| format!("p{i}")).collect(),
            values,
            bounds,
        }
    }

    #[test]
    fn parabola_gives_exact_sigma() {
        // S = ((x - 2) / 0.5)^2 + ((y + 1) / 3)^2, so sigma_x = 0.5, sigma_y = 3.
        let best = vector(vec![2.0, -1.0], vec![(-10.0, 10.0), (-10.0, 10.0)]);
        let mut f = FnEvaluator(|p: &[f64]| ((p[0] - 2.0) / 0.5).powi(2) + ((p[1] + 1.0) / 3.0).powi(2));
        let (errors, spent) = curvature_errors(&best, &mut f);

        assert_eq!(spent, 5);
        assert!((errors[0].unwrap() - 0.5).abs() < 1e-6);
        assert!((errors[1].unwrap() - 3.0).abs() < 1e-4);
    }

    #[test]
    fn parameter_on_bound_has_no_error() {
        let best = vector(vec![0.0], vec![(0.0, 10.0)]);
        let mut f = FnEvaluator(|p: &[f64]| p[0] * p[0]);
        let (errors, _) = curvature_errors(&best, &mut f);
        assert_eq!(errors, vec![None]);
    }

    #[test]
    fn flat_or_non_finite_statistic_has_no_error() {
        let best = vector(vec![1.0], vec![(-10.0, 10.0)]);
        let (errors, _) = curvature_errors(&best, &mut FnEvaluator(|_: &[f64]| 3.0));
        assert_eq!(errors, vec![None]);

        let (errors, _) = curvature_errors(&best, &mut FnEvaluator(|_: &[f64]| f64::NAN));
        assert_eq!(errors, vec![None]);
    }
}
