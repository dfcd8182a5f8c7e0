use thiserror::Error;

/// Main error type for specfit
#[derive(Error, Debug)]
pub enum SfError {
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Statistic error: {0}")]
    Stat(#[from] StatError),

    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Instrument calibration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("ENERG_LO[{index}] is {value} keV and no minimum_energy replacement is configured")]
    InvalidCalibration { index: usize, value: f64 },

    #[error("Energy bin {index} is not increasing: lo {lo} keV, hi {hi} keV")]
    ReversedBin { index: usize, lo: f64, hi: f64 },

    #[error("Energy bin {index} has a non-finite edge")]
    NonFiniteEdge { index: usize },
}

/// Statistic evaluation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatError {
    #[error("Shape mismatch for {what}: expected {expected} elements, found {found}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
}

impl StatError {
    pub fn shape(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            found,
        }
    }
}

/// Optimizer and parameter errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Parameter {parameter} = {value} is outside its bounds [{min}, {max}]")]
    OutOfBounds {
        parameter: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Bounds collapsed for parameter {parameter}: min {min} >= max {max}")]
    BoundsCollapsed { parameter: String, min: f64, max: f64 },

    #[error("Every candidate in iteration {iteration} produced a non-finite statistic")]
    AllCandidatesNonFinite { iteration: usize },

    #[error("No free parameters to fit")]
    NoFreeParameters,

    #[error("Fit did not converge: status {status} after {iterations} iterations")]
    FailedConvergence { status: String, iterations: usize },

    #[error("Parameter {parameter} is always frozen")]
    AlwaysFrozen { parameter: String },

    #[error("Invalid link on parameter {parameter}: {reason}")]
    InvalidLink { parameter: String, reason: String },

    #[error("Optimizer cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Worker plumbing errors.
///
/// These never abort a fit on their own: the pool folds them into per-vector
/// crash outcomes.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to launch worker {worker_id}: {message}")]
    Launch { worker_id: usize, message: String },

    #[error("Worker protocol error: {message}")]
    Protocol { message: String },

    #[error("Worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for specfit operations
pub type SfResult<T> = Result<T, SfError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SfError::Config(format!($($arg)*))
    };
}

/// Macro for creating invalid-data errors
#[macro_export]
macro_rules! data_error {
    ($($arg:tt)*) => {
        $crate::SfError::InvalidData(format!($($arg)*))
    };
}
