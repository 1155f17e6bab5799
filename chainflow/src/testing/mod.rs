//! Testing utilities for chainflow pipelines.
//!
//! This module provides:
//! - Mock source and probe stages with fault injection
//! - A stage factory with the mocks registered
//! - Assertions for step history and run outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_completed, assert_failed_with, assert_steps};
pub use fixtures::{pipeline_config, test_factory, StageLog};
pub use mocks::{FaultConfig, ProbeStage, VecSource};
