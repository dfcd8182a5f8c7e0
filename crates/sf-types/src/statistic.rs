//! Fit statistic families and their truncation policy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default floor applied to model values inside logarithms.
pub const DEFAULT_TRUNC_VALUE: f64 = 1.0e-25;

/// The fit statistic used to compare observed and predicted counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Cash (1979) maximum-likelihood statistic for Poisson data.
    Cash,
    /// Castor's modification of Cash; asymptotically distributed as chi-square.
    #[serde(alias = "c-stat")]
    CStat,
    /// Chi-square with Gehrels variance, `sigma = 1 + sqrt(N + 0.75)`.
    Chi2Gehrels,
    /// Chi-square with the data as variance.
    Chi2DataVar,
    /// Unweighted sum of squared residuals.
    LeastSq,
}

impl Default for Statistic {
    fn default() -> Self {
        Self::CStat
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Statistic {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::CStat => "cstat",
            Self::Chi2Gehrels => "chi2gehrels",
            Self::Chi2DataVar => "chi2datavar",
            Self::LeastSq => "leastsq",
        }
    }

    /// Poisson likelihood statistics take the log of the model and honor
    /// truncation.
    pub fn is_likelihood(&self) -> bool {
        matches!(self, Self::Cash | Self::CStat)
    }

    /// Whether a change of 1.0 in the statistic corresponds to one sigma.
    pub fn has_unit_delta(&self) -> bool {
        !matches!(self, Self::LeastSq)
    }

    /// Contribution of a single bin with observed counts `observed` and model
    /// prediction `predicted`.
    ///
    /// Never panics. Degenerate input yields a non-finite term which the
    /// caller is expected to surface.
    pub fn bin_term(&self, observed: f64, predicted: f64, config: &StatisticConfig) -> f64 {
        match self {
            Self::Cash => {
                let Some(m) = config.floor(predicted) else {
                    return f64::NAN;
                };
                if observed == 0.0 {
                    2.0 * m
                } else {
                    2.0 * (m - observed * m.ln())
                }
            }
            Self::CStat => {
                let Some(m) = config.floor(predicted) else {
                    return f64::NAN;
                };
                if observed == 0.0 {
                    2.0 * m
                } else {
                    2.0 * (m - observed + observed * (observed / m).ln())
                }
            }
            Self::Chi2Gehrels => {
                let sigma = 1.0 + (observed.max(0.0) + 0.75).sqrt();
                let r = observed - predicted;
                r * r / (sigma * sigma)
            }
            Self::Chi2DataVar => {
                let variance = if observed > 0.0 { observed } else { 1.0 };
                let r = observed - predicted;
                r * r / variance
            }
            Self::LeastSq => {
                let r = observed - predicted;
                r * r
            }
        }
    }
}

/// Truncation policy for likelihood statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticConfig {
    /// Clamp non-positive model values to `trunc_value` before use.
    pub truncate: bool,
    /// Floor applied when truncating. Must be finite and > 0.
    pub trunc_value: f64,
}

impl Default for StatisticConfig {
    fn default() -> Self {
        Self {
            truncate: true,
            trunc_value: DEFAULT_TRUNC_VALUE,
        }
    }
}

impl StatisticConfig {
    pub fn new(truncate: bool, trunc_value: f64) -> Self {
        Self {
            truncate,
            trunc_value,
        }
    }

    pub fn untruncated() -> Self {
        Self {
            truncate: false,
            ..Self::default()
        }
    }

    /// Model value as used inside a logarithm, or `None` when the value is
    /// degenerate and truncation is disabled.
    fn floor(&self, predicted: f64) -> Option<f64> {
        if self.truncate {
            // NaN.max(x) is x, so a NaN prediction would silently become the
            // floor; keep it NaN.
            if predicted.is_nan() {
                return None;
            }
            Some(predicted.max(self.trunc_value))
        } else if predicted > 0.0 {
            Some(predicted)
        } else {
            None
        }
    }
}
