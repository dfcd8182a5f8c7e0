pub mod config;
pub mod errors;
pub mod parameter;
pub mod response;
pub mod result;
pub mod spectrum;
pub mod statistic;

pub use config::*;
pub use errors::*;
pub use parameter::*;
pub use response::*;
pub use result::*;
pub use spectrum::*;
pub use statistic::*;
