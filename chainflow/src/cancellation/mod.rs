//! Cooperative cancellation for pipeline runs and background loops.

mod token;

pub use token::CancellationToken;
