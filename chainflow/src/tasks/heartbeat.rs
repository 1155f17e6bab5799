//! Heartbeat reporting for long-running source stages.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

use super::clock::Clock;
use super::record::TaskId;
use super::store::{TaskStore, TaskStoreError, WriteOutcome};

/// Default pause between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Result of one heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// `last_heartbeat` was moved to now.
    Updated,
    /// The record is terminal and was left untouched.
    Skipped,
}

/// Writes liveness into task records.
#[derive(Clone)]
pub struct HeartbeatReporter {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl HeartbeatReporter {
    /// Creates a reporter with the default interval.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Sets the pause between pulses.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The pause between pulses.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Sets `last_heartbeat = now` if the task is still running.
    pub async fn report_heartbeat(
        &self,
        task_id: TaskId,
    ) -> Result<HeartbeatOutcome, TaskStoreError> {
        let now = self.clock.now();
        match self.store.update_heartbeat(task_id, now).await? {
            WriteOutcome::Applied => {
                debug!(task_id = %task_id, at = %now, "Heartbeat recorded");
                Ok(HeartbeatOutcome::Updated)
            }
            WriteOutcome::Skipped => {
                debug!(task_id = %task_id, "Heartbeat skipped, task is terminal");
                Ok(HeartbeatOutcome::Skipped)
            }
        }
    }

    /// Starts a background pulse for `task_id` that lives as long as the guard.
    ///
    /// The first heartbeat is sent immediately. Failures are logged and never
    /// surface to the caller.
    #[must_use = "the pulse stops when the guard is dropped"]
    pub fn spawn_pulse(&self, task_id: TaskId) -> HeartbeatPulse {
        let reporter = self.clone();
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(reporter.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match reporter.report_heartbeat(task_id).await {
                        Ok(HeartbeatOutcome::Updated) => {}
                        Ok(HeartbeatOutcome::Skipped) => {
                            debug!(task_id = %task_id, "Task is terminal, stopping heartbeat pulse");
                            break;
                        }
                        Err(TaskStoreError::TaskNotFound(_)) => {
                            debug!(task_id = %task_id, "No task record for heartbeat");
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Failed to record heartbeat");
                        }
                    }
                }
            }
            .with_current_subscriber(),
        );
        HeartbeatPulse { handle }
    }
}

impl std::fmt::Debug for HeartbeatReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatReporter")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Guard for a running heartbeat pulse; aborts the pulse on drop.
#[derive(Debug)]
pub struct HeartbeatPulse {
    handle: JoinHandle<()>,
}

impl HeartbeatPulse {
    /// Returns true once the pulse task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HeartbeatPulse {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
