//! Task store trait and in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::record::{TaskId, TaskRecord, TaskStatus};

/// Errors from a task store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskStoreError {
    /// No record exists for the id.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// The backing storage failed.
    #[error("task store backend error: {0}")]
    Backend(String),
}

/// Whether a conditional write took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was running and has been updated.
    Applied,
    /// The record was already terminal; nothing changed.
    Skipped,
}

impl WriteOutcome {
    /// Returns true if the write took effect.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Persistent storage for task records.
///
/// Every call is atomic for the row it touches. Status and heartbeat writes
/// are conditional on the stored status being [`TaskStatus::Running`],
/// evaluated inside the same atomic step as the write.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a running record and returns it.
    async fn create_task(
        &self,
        pipeline_id: &str,
        log_path: &Path,
        create_time: DateTime<Utc>,
    ) -> Result<TaskRecord, TaskStoreError>;

    /// Fetches a record.
    async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord, TaskStoreError>;

    /// Moves a running record to a terminal status.
    ///
    /// Returns [`WriteOutcome::Skipped`] if the record is already terminal or
    /// `status` is not terminal.
    async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, TaskStoreError>;

    /// Records a heartbeat on a running record.
    ///
    /// The stored heartbeat never moves backwards.
    async fn update_heartbeat(
        &self,
        task_id: TaskId,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, TaskStoreError>;

    /// All records currently running.
    async fn list_running(&self) -> Result<Vec<TaskRecord>, TaskStoreError>;

    /// All records, ordered by id.
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, TaskStoreError>;
}

/// A task store held in process memory.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    records: DashMap<TaskId, TaskRecord>,
    next_id: AtomicU64,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record as-is.
    pub fn insert(&self, record: TaskRecord) {
        self.next_id
            .fetch_max(record.task_id.get() + 1, Ordering::SeqCst);
        self.records.insert(record.task_id, record);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(
        &self,
        pipeline_id: &str,
        log_path: &Path,
        create_time: DateTime<Utc>,
    ) -> Result<TaskRecord, TaskStoreError> {
        let task_id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = TaskRecord::new(task_id, pipeline_id, log_path, create_time);
        self.records.insert(task_id, record.clone());
        Ok(record)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<TaskRecord, TaskStoreError> {
        self.records
            .get(&task_id)
            .map(|r| r.value().clone())
            .ok_or(TaskStoreError::TaskNotFound(task_id))
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, TaskStoreError> {
        let mut record = self
            .records
            .get_mut(&task_id)
            .ok_or(TaskStoreError::TaskNotFound(task_id))?;
        if !record.is_running() || !status.is_terminal() {
            return Ok(WriteOutcome::Skipped);
        }
        record.status = status;
        record.finish_time = Some(at);
        record.failure_reason = reason;
        Ok(WriteOutcome::Applied)
    }

    async fn update_heartbeat(
        &self,
        task_id: TaskId,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, TaskStoreError> {
        let mut record = self
            .records
            .get_mut(&task_id)
            .ok_or(TaskStoreError::TaskNotFound(task_id))?;
        if !record.is_running() {
            return Ok(WriteOutcome::Skipped);
        }
        record.last_heartbeat = Some(record.last_heartbeat.map_or(at, |prev| prev.max(at)));
        Ok(WriteOutcome::Applied)
    }

    async fn list_running(&self) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let mut running: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.value().clone())
            .collect();
        running.sort_by_key(|r| r.task_id);
        Ok(running)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let mut all: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.task_id);
        Ok(all)
    }
}
