#[allow(clippy::module_inception)]
mod analyzer;
pub mod aggregator;

pub use analyzer::*;
