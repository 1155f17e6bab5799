//! Pipeline building and execution.
//!
//! This module provides:
//! - Chain validation and stage construction
//! - The executor that drives records from the source through the chain
//! - Run outcomes mapped onto task statuses

mod builder;
mod executor;
mod result;

#[cfg(test)]
mod integration_tests;

pub use builder::{PipelineBuilder, DEFAULT_CHANNEL_CAPACITY};
pub use executor::Pipeline;
pub use result::{RunOutcome, RunResult};
