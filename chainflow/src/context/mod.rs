//! Context management for pipeline execution.
//!
//! A [`Context`] is one record travelling down a stage chain: its payload,
//! pipeline-scoped metadata and the history of stages it passed through.

#[cfg(test)]
mod context_tests;
mod execution;
mod path;

pub use execution::{event_key_of, event_name_of, Context, EventKey, StepRecord};
pub use path::{lookup_path, lookup_path_in};
