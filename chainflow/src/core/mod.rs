//! Core domain enums for chainflow.
//!
//! - Stage kinds, which decide where a stage may sit in a chain
//! - Built-in stage type tags

mod status;

pub use status::{StageKind, StageType};
