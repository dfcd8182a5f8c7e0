//! Session configuration, read once at session start.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::SfResult;
use crate::statistic::{Statistic, StatisticConfig, DEFAULT_TRUNC_VALUE};

/// How pool workers are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMethod {
    /// Worker inherits the parent's loaded state.
    Fork,
    /// Worker starts from a clean process and receives everything by message.
    Spawn,
    /// Platform default: `Fork` on Linux, `Spawn` elsewhere.
    Default,
}

impl Default for StartMethod {
    fn default() -> Self {
        Self::Default
    }
}

impl StartMethod {
    /// Resolve `Default` to a concrete method for the current platform.
    pub fn resolve(self) -> Self {
        match self {
            Self::Default => {
                if cfg!(target_os = "linux") {
                    Self::Fork
                } else {
                    Self::Spawn
                }
            }
            other => other,
        }
    }
}

/// Optimizer stopping rules and step sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    /// Tolerance on the per-iteration statistic change.
    pub ftol: f64,
    /// Number of consecutive iterations the change must stay below `ftol`.
    pub conv_iters: usize,
    /// Initial simplex step as a fraction of each starting value.
    pub initial_step: f64,
    /// Wall-clock budget; no new iteration starts after it expires.
    pub deadline_secs: Option<f64>,
    /// Estimate 1-sigma errors from the statistic curvature after the fit.
    pub estimate_errors: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            ftol: 1.0e-7,
            conv_iters: 3,
            initial_step: 0.1,
            deadline_secs: None,
            estimate_errors: true,
        }
    }
}

/// Top-level configuration for a fit session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub statistic: Statistic,
    pub truncate: bool,
    pub trunc_value: f64,
    /// Replacement for zero-valued `ENERG_LO` entries. `None` makes them fatal.
    pub minimum_energy: Option<f64>,
    /// Worker count. `None` uses every available core; `< 2` runs in-process.
    pub numcores: Option<usize>,
    pub multiprocessing_start_method: StartMethod,
    /// Worker executable for `Spawn`. Defaults to `sf-worker` next to the
    /// current executable.
    pub worker_program: Option<PathBuf>,
    pub optimizer: OptimizerConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            statistic: Statistic::default(),
            truncate: true,
            trunc_value: DEFAULT_TRUNC_VALUE,
            minimum_energy: None,
            numcores: None,
            multiprocessing_start_method: StartMethod::Default,
            worker_program: None,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl FitConfig {
    pub fn new(statistic: Statistic) -> Self {
        Self {
            statistic,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> SfResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_truncation(mut self, truncate: bool, trunc_value: f64) -> Self {
        self.truncate = truncate;
        self.trunc_value = trunc_value;
        self
    }

    pub fn with_minimum_energy(mut self, minimum_energy: Option<f64>) -> Self {
        self.minimum_energy = minimum_energy;
        self
    }

    pub fn with_numcores(mut self, numcores: Option<usize>) -> Self {
        self.numcores = numcores;
        self
    }

    pub fn with_start_method(mut self, method: StartMethod) -> Self {
        self.multiprocessing_start_method = method;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn stat_config(&self) -> StatisticConfig {
        StatisticConfig::new(self.truncate, self.trunc_value)
    }

    pub fn validate(&self) -> SfResult<()> {
        if !self.trunc_value.is_finite() || self.trunc_value <= 0.0 {
            return Err(crate::config_error!(
                "trunc_value must be a finite value > 0, got {}",
                self.trunc_value
            ));
        }
        if let Some(e) = self.minimum_energy {
            if !e.is_finite() || e <= 0.0 {
                return Err(crate::config_error!(
                    "minimum_energy must be a finite value > 0 keV or None, got {e}"
                ));
            }
        }
        let opt = &self.optimizer;
        if opt.max_iterations == 0 {
            return Err(crate::config_error!("optimizer.max_iterations must be > 0"));
        }
        if !opt.ftol.is_finite() || opt.ftol <= 0.0 {
            return Err(crate::config_error!("optimizer.ftol must be > 0, got {}", opt.ftol));
        }
        if opt.conv_iters == 0 {
            return Err(crate::config_error!("optimizer.conv_iters must be > 0"));
        }
        if !opt.initial_step.is_finite() || opt.initial_step <= 0.0 {
            return Err(crate::config_error!(
                "optimizer.initial_step must be > 0, got {}",
                opt.initial_step
            ));
        }
        if let Some(d) = opt.deadline_secs {
            if !d.is_finite() || d < 0.0 {
                return Err(crate::config_error!("optimizer.deadline_secs must be >= 0, got {d}"));
            }
        }
        Ok(())
    }
}
