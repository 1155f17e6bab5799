//! Task bookkeeping: records, storage, heartbeats and timeout detection.
//!
//! A task record tracks one pipeline run. Three writers touch it: the run
//! itself when it finishes, the [`HeartbeatReporter`] while a source stage is
//! active, and the [`TimeoutMonitor`] when a run stops heartbeating. Every
//! write is conditional on the record still being running, so the first
//! terminal transition wins.

mod clock;
mod heartbeat;
mod monitor;
mod record;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use heartbeat::{HeartbeatOutcome, HeartbeatPulse, HeartbeatReporter};
pub use monitor::{MonitorState, ScanReport, TimedOutTask, TimeoutMonitor, TimeoutReason};
pub use record::{TaskId, TaskRecord, TaskStatistics, TaskStatus};
pub use store::{InMemoryTaskStore, TaskStore, TaskStoreError, WriteOutcome};

#[cfg(test)]
pub use store::MockTaskStore;
