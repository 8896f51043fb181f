pub mod processor;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use processor::{Collector, IngestProcessor};
pub use types::*;
