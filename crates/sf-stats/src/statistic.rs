//! Statistic evaluation over whole spectra.

use serde::{Deserialize, Serialize};

use sf_types::{Statistic, StatisticConfig, StatError};

/// Aggregate statistic plus the per-bin terms it was summed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatOutput {
    pub statistic: f64,
    pub per_bin: Vec<f64>,
    /// Indices of bins whose term is NaN or infinite.
    pub degenerate_bins: Vec<usize>,
}

impl StatOutput {
    pub fn is_finite(&self) -> bool {
        self.statistic.is_finite()
    }
}

/// Compute `statistic` for `observed` against `predicted`.
///
/// Fails only on a length mismatch. Non-positive predictions are clamped
/// when `config.truncate` is set, otherwise they yield a non-finite
/// statistic and the offending bins are listed in `degenerate_bins`.
pub fn evaluate(
    statistic: Statistic,
    observed: &[f64],
    predicted: &[f64],
    config: &StatisticConfig,
) -> Result<StatOutput, StatError> {
    if observed.len() != predicted.len() {
        return Err(StatError::shape("predicted counts", observed.len(), predicted.len()));
    }

    let per_bin: Vec<f64> = observed
        .iter()
        .zip(predicted)
        .map(|(&d, &m)| statistic.bin_term(d, m, config))
        .collect();

    let degenerate_bins: Vec<usize> = per_bin
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.is_finite())
        .map(|(i, _)| i)
        .collect();

    let total: f64 = per_bin.iter().sum();

    Ok(StatOutput {
        statistic: total,
        per_bin,
        degenerate_bins,
    })
}
