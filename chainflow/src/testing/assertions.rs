//! Test assertions for contexts and runs.

use crate::context::Context;
use crate::pipeline::{RunOutcome, RunResult};

/// Asserts the stages a context went through, in order.
pub fn assert_steps(ctx: &Context, expected: &[&str]) {
    let actual: Vec<_> = ctx.step_history().iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(actual, expected, "Unexpected step history");
}

/// Asserts that a run completed.
pub fn assert_completed(result: &RunResult) {
    assert!(
        result.outcome == RunOutcome::Completed,
        "Expected a completed run, got {:?}",
        result.outcome
    );
}

/// Asserts that a run failed with a reason containing `needle`.
pub fn assert_failed_with(result: &RunResult, needle: &str) {
    match &result.outcome {
        RunOutcome::Failed { reason } => assert!(
            reason.contains(needle),
            "Failure reason '{reason}' does not mention '{needle}'"
        ),
        other => panic!("Expected a failed run, got {other:?}"),
    }
}
