//! # sf-optimizer
//!
//! Fitting sessions for specfit.
//!
//! A [`FitSession`] owns an immutable [`sf_types::FitConfig`], repairs
//! instrument responses, and runs a bounded Nelder–Mead search whose
//! candidate batches are scored through a [`sf_pool::WorkerPool`]. Parameter
//! errors are estimated from the curvature of the statistic at the minimum.

mod evaluator;
mod session;
mod simplex;
mod state;
mod uncertainty;

pub use evaluator::{Evaluator, FnEvaluator, PoolEvaluator};
pub use session::FitSession;
pub use simplex::{NelderMead, SearchOutcome};
pub use state::OptimizerState;
pub use uncertainty::curvature_errors;
