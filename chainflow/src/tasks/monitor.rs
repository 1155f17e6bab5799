//! Background detection of stalled tasks.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::record::{TaskId, TaskStatus};
use super::store::{TaskStore, TaskStoreError, WriteOutcome};
use crate::cancellation::CancellationToken;

/// Default pause between scans.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(300);
/// Default staleness threshold.
pub const DEFAULT_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(3600);
/// Default pause after a failed scan.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Reason recorded when marking leftover running tasks on startup.
pub const RESTART_REASON: &str = "process restarted";

/// What the monitor is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// Waiting for the next scan (or not started).
    Idle,
    /// A scan is in progress.
    Scanning,
}

/// Why a task was declared stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    /// The last heartbeat is older than the threshold.
    HeartbeatStale,
    /// No heartbeat was ever recorded and the creation time is older than the threshold.
    NoHeartbeat,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartbeatStale => write!(f, "heartbeat stale"),
            Self::NoHeartbeat => write!(f, "no heartbeat observed, create-time stale"),
        }
    }
}

/// A task failed by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedOutTask {
    /// The task.
    pub task_id: TaskId,
    /// Why it was failed.
    pub reason: TimeoutReason,
    /// The heartbeat or creation time liveness was measured from.
    pub reference: DateTime<Utc>,
    /// Seconds between the reference and the scan.
    pub stale_secs: i64,
}

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Running records examined.
    pub scanned: usize,
    /// Records moved to failed by this scan.
    pub timed_out: Vec<TimedOutTask>,
    /// Stale records that turned terminal before the write landed.
    pub raced: usize,
}

#[derive(Clone)]
struct Scanner {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    threshold: chrono::Duration,
    state: Arc<RwLock<MonitorState>>,
}

/// Periodically fails running tasks whose liveness is older than a threshold.
///
/// The monitor only touches bookkeeping. It never stops the process running
/// the task. Create it once at bootstrap, call [`start`](Self::start), and
/// [`stop`](Self::stop) on shutdown.
pub struct TimeoutMonitor {
    scanner: Scanner,
    check_interval: Duration,
    error_backoff: Duration,
    running: Mutex<Option<(Arc<CancellationToken>, JoinHandle<()>)>>,
}

impl TimeoutMonitor {
    /// Creates a monitor with the default interval, threshold and backoff.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            scanner: Scanner {
                store,
                clock,
                threshold: to_chrono(DEFAULT_TIMEOUT_THRESHOLD),
                state: Arc::new(RwLock::new(MonitorState::Idle)),
            },
            check_interval: DEFAULT_CHECK_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            running: Mutex::new(None),
        }
    }

    /// Sets the pause between scans.
    #[must_use]
    pub const fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the staleness threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.scanner.threshold = to_chrono(threshold);
        self
    }

    /// Sets the pause after a failed scan.
    #[must_use]
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        *self.scanner.state.read()
    }

    /// Returns true while the background loop is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Starts the background loop. Returns false if it is already running.
    ///
    /// The first scan happens immediately.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
        {
            return false;
        }

        let token = Arc::new(CancellationToken::new());
        let scanner = self.scanner.clone();
        let (check_interval, error_backoff) = (self.check_interval, self.error_backoff);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            info!(
                check_interval_secs = check_interval.as_secs(),
                threshold_secs = scanner.threshold.num_seconds(),
                "Timeout monitor started"
            );
            loop {
                let wait = match scanner.scan().await {
                    Ok(_) => check_interval,
                    Err(e) => {
                        error!(error = %e, backoff_secs = error_backoff.as_secs(), "Timeout scan failed");
                        error_backoff
                    }
                };
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
            }
            info!("Timeout monitor stopped");
        });
        *running = Some((token, handle));
        true
    }

    /// Stops the background loop and waits for it to exit.
    pub async fn stop(&self) {
        let taken = self.running.lock().take();
        if let Some((token, handle)) = taken {
            token.cancel("monitor stopped");
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Timeout monitor task ended abnormally");
                }
            }
        }
    }

    /// Runs one scan now.
    pub async fn scan_once(&self) -> Result<ScanReport, TaskStoreError> {
        self.scanner.scan().await
    }

    /// Marks every running record failed.
    ///
    /// Called at startup, before [`start`](Self::start), since no run from a
    /// previous process can still be alive.
    pub async fn reset_running_on_startup(&self) -> Result<usize, TaskStoreError> {
        let now = self.scanner.clock.now();
        let mut reset = 0;
        for record in self.scanner.store.list_running().await? {
            match self
                .scanner
                .store
                .update_status(
                    record.task_id,
                    TaskStatus::Failed,
                    Some(RESTART_REASON.to_string()),
                    now,
                )
                .await
            {
                Ok(WriteOutcome::Applied) => reset += 1,
                Ok(WriteOutcome::Skipped) => {}
                Err(e) => warn!(task_id = %record.task_id, error = %e, "Failed to reset task"),
            }
        }
        if reset > 0 {
            info!(count = reset, "Reset running tasks left by previous process");
        }
        Ok(reset)
    }
}

impl Scanner {
    async fn scan(&self) -> Result<ScanReport, TaskStoreError> {
        *self.state.write() = MonitorState::Scanning;
        let result = self.scan_running().await;
        *self.state.write() = MonitorState::Idle;
        result
    }

    async fn scan_running(&self) -> Result<ScanReport, TaskStoreError> {
        let now = self.clock.now();
        let running = self.store.list_running().await?;
        let mut report = ScanReport {
            scanned: running.len(),
            ..ScanReport::default()
        };

        for record in running {
            let reference = record.liveness_reference();
            let stale = now - reference;
            if stale <= self.threshold {
                continue;
            }
            let reason = if record.last_heartbeat.is_some() {
                TimeoutReason::HeartbeatStale
            } else {
                TimeoutReason::NoHeartbeat
            };
            let message = format!(
                "{reason}: {}s since {reference}, threshold {}s",
                stale.num_seconds(),
                self.threshold.num_seconds()
            );

            match self
                .store
                .update_status(record.task_id, TaskStatus::Failed, Some(message), now)
                .await
            {
                Ok(WriteOutcome::Applied) => {
                    warn!(
                        task_id = %record.task_id,
                        pipeline_id = %record.pipeline_id,
                        reason = %reason,
                        stale_secs = stale.num_seconds(),
                        "Task timed out"
                    );
                    report.timed_out.push(TimedOutTask {
                        task_id: record.task_id,
                        reason,
                        reference,
                        stale_secs: stale.num_seconds(),
                    });
                }
                Ok(WriteOutcome::Skipped) | Err(TaskStoreError::TaskNotFound(_)) => {
                    report.raced += 1;
                }
                Err(e) => {
                    warn!(task_id = %record.task_id, error = %e, "Failed to mark task timed out");
                }
            }
        }

        debug!(
            scanned = report.scanned,
            timed_out = report.timed_out.len(),
            "Timeout scan complete"
        );
        Ok(report)
    }
}

impl Drop for TimeoutMonitor {
    fn drop(&mut self) {
        if let Some((token, _)) = self.running.lock().as_ref() {
            token.cancel("monitor dropped");
        }
    }
}

impl fmt::Debug for TimeoutMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutMonitor")
            .field("check_interval", &self.check_interval)
            .field("threshold_secs", &self.scanner.threshold.num_seconds())
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
