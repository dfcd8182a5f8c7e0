//! # sf-stats
//!
//! The numerical core of specfit:
//! - validation and repair of instrument response energy grids
//! - Poisson likelihood and chi-square fit statistics with truncation
//! - built-in spectral model components folded through a response
//! - [`FitProblem`], the pure evaluation unit shared with pool workers

pub mod model;
pub mod problem;
pub mod response;
pub mod statistic;

pub use model::{Component, ModelSpec};
pub use problem::FitProblem;
pub use response::{correct_energy_bins, load_response, CorrectedResponse};
pub use statistic::{evaluate, StatOutput};
