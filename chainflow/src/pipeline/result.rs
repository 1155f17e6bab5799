//! Run outcomes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::Context;
use crate::errors::StageError;
use crate::tasks::{TaskId, TaskStatus};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The source was exhausted and every context was processed.
    Completed,
    /// The run was cancelled between contexts.
    Cancelled {
        /// Why it was cancelled.
        reason: String,
    },
    /// Initialization or the source stage failed.
    Failed {
        /// What failed.
        reason: String,
    },
}

impl RunOutcome {
    /// Short status label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }

    /// The terminal task status and reason this outcome records.
    ///
    /// A cancelled run is a clean stop and records success.
    #[must_use]
    pub fn task_status(&self) -> (TaskStatus, Option<String>) {
        match self {
            Self::Completed => (TaskStatus::Success, None),
            Self::Cancelled { reason } => (TaskStatus::Success, Some(format!("cancelled: {reason}"))),
            Self::Failed { reason } => (TaskStatus::Failed, Some(reason.clone())),
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Pipeline instance id.
    pub pipeline_id: String,
    /// Task record of the run, when it has one.
    pub task_id: Option<TaskId>,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Contexts that went through the whole chain.
    pub contexts_processed: u64,
    /// Isolated non-source failures, in order.
    pub stage_failures: Vec<StageError>,
    /// The last fully processed context.
    pub last_context: Option<Context>,
    /// Wall time of the run.
    pub duration: Duration,
}

impl RunResult {
    /// Returns true unless the run failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outcome_maps_to_task_status() {
        assert_eq!(RunOutcome::Completed.task_status(), (TaskStatus::Success, None));
        assert_eq!(
            RunOutcome::Cancelled { reason: "user".into() }.task_status(),
            (TaskStatus::Success, Some("cancelled: user".to_string()))
        );
        assert_eq!(
            RunOutcome::Failed { reason: "boom".into() }.task_status(),
            (TaskStatus::Failed, Some("boom".to_string()))
        );
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(RunOutcome::Failed { reason: "x".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "x"}));
        assert_eq!(RunOutcome::Completed.label(), "completed");
    }
}
