//! Task record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifier of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task.
///
/// Only `Running -> Success` and `Running -> Failed` are valid transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The run is in progress.
    Running,
    /// The run finished (including cancelled runs).
    Success,
    /// The run failed or timed out.
    Failed,
}

impl TaskStatus {
    /// Returns true for final states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Persisted numeric code: 0 running, 1 success, 2 failed.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Success => 1,
            Self::Failed => 2,
        }
    }

    /// Parses a persisted numeric code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Running),
            1 => Some(Self::Success),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Bookkeeping state for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique id.
    pub task_id: TaskId,
    /// Pipeline definition the run belongs to.
    pub pipeline_id: String,
    /// Current status.
    pub status: TaskStatus,
    /// When the record was created.
    pub create_time: DateTime<Utc>,
    /// Latest heartbeat, never moves backwards once set.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the record reached a terminal status.
    pub finish_time: Option<DateTime<Utc>>,
    /// Where the run's log is written.
    pub log_path: PathBuf,
    /// Why the run failed or ended, if recorded.
    pub failure_reason: Option<String>,
}

impl TaskRecord {
    /// Creates a running record.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        pipeline_id: impl Into<String>,
        log_path: impl Into<PathBuf>,
        create_time: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            pipeline_id: pipeline_id.into(),
            status: TaskStatus::Running,
            create_time,
            last_heartbeat: None,
            finish_time: None,
            log_path: log_path.into(),
            failure_reason: None,
        }
    }

    /// Returns true while the run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// The time liveness is measured from: last heartbeat, else creation.
    #[must_use]
    pub fn liveness_reference(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.create_time)
    }
}

/// Counts of task records by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    /// All records.
    pub total: usize,
    /// Records still running.
    pub running: usize,
    /// Records that succeeded.
    pub success: usize,
    /// Records that failed.
    pub failed: usize,
}

impl TaskStatistics {
    /// Tallies a set of records.
    #[must_use]
    pub fn from_records(records: &[TaskRecord]) -> Self {
        records.iter().fold(Self::default(), |mut stats, record| {
            stats.total += 1;
            match record.status {
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [TaskStatus::Running, TaskStatus::Success, TaskStatus::Failed] {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::from_code(9), None);
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_liveness_reference_prefers_heartbeat() {
        let created = Utc::now();
        let mut record = TaskRecord::new(TaskId::new(1), "p", "/tmp/p.log", created);
        assert_eq!(record.liveness_reference(), created);

        let beat = created + Duration::seconds(30);
        record.last_heartbeat = Some(beat);
        assert_eq!(record.liveness_reference(), beat);
    }

    #[test]
    fn test_statistics_from_records() {
        let now = Utc::now();
        let mut records: Vec<_> = (1..=4)
            .map(|i| TaskRecord::new(TaskId::new(i), "p", "/tmp/p.log", now))
            .collect();
        records[1].status = TaskStatus::Success;
        records[2].status = TaskStatus::Failed;
        records[3].status = TaskStatus::Failed;

        let stats = TaskStatistics::from_records(&records);
        assert_eq!(
            stats,
            TaskStatistics {
                total: 4,
                running: 1,
                success: 1,
                failed: 2
            }
        );
    }
}
