//! Control layer: runs pipelines as tracked tasks.
//!
//! A run is built before its task record is created, so a configuration
//! error never leaves a record behind. Once created, the record is finalized
//! from the run's outcome unless another writer (the timeout monitor) has
//! already moved it to a terminal status.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::cancellation::CancellationToken;
use crate::chain::ChainClient;
use crate::config::{PipelineConfig, ServiceSettings};
use crate::errors::ChainflowError;
use crate::observability::RunLog;
use crate::pipeline::{Pipeline, PipelineBuilder, RunResult};
use crate::stages::{StageDependencies, StageFactory};
use crate::tasks::{
    Clock, HeartbeatReporter, TaskId, TaskRecord, TaskStatistics, TaskStore, TaskStoreError,
    TimeoutMonitor, WriteOutcome,
};

type ActiveRuns = Arc<DashMap<TaskId, Arc<CancellationToken>>>;

/// A built pipeline with its task record, ready to run.
struct PreparedRun {
    pipeline: Pipeline,
    task_id: TaskId,
    cancel: Arc<CancellationToken>,
    log: RunLog,
}

/// A run started in the background.
#[derive(Debug)]
pub struct RunHandle {
    task_id: TaskId,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    /// The run's task record.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Waits for the run to finish.
    ///
    /// Cancel-safe: dropping the returned future leaves the run going. Do
    /// not poll it again once it has resolved.
    pub async fn wait(&mut self) -> Result<RunResult, ChainflowError> {
        (&mut self.join)
            .await
            .map_err(|e| ChainflowError::Internal(format!("run task ended abnormally: {e}")))
    }
}

/// Entry point for starting, tracking and cancelling pipeline runs.
pub struct PipelineService {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
    factory: StageFactory,
    dependencies: StageDependencies,
    active: ActiveRuns,
}

impl PipelineService {
    /// Creates a service with the built-in stages.
    ///
    /// Heartbeats are wired into source stages when enabled in `settings`.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, settings: ServiceSettings) -> Self {
        let mut dependencies =
            StageDependencies::new().with_chain_settings(settings.chains.clone());
        if settings.heartbeat.enabled {
            dependencies = dependencies.with_heartbeat(
                HeartbeatReporter::new(Arc::clone(&store), Arc::clone(&clock))
                    .with_interval(settings.heartbeat.interval()),
            );
        }
        Self {
            store,
            clock,
            settings,
            factory: StageFactory::builtin(),
            dependencies,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Replaces the stage factory.
    #[must_use]
    pub fn with_factory(mut self, factory: StageFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Supplies the message bus for queue stages.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.dependencies = self.dependencies.with_bus(bus);
        self
    }

    /// Supplies a ready chain client under a chain name.
    #[must_use]
    pub fn with_chain(mut self, name: impl Into<String>, client: Arc<dyn ChainClient>) -> Self {
        self.dependencies = self.dependencies.with_chain(name, client);
        self
    }

    /// The service settings.
    #[must_use]
    pub const fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// A timeout monitor over this service's store, configured from settings.
    #[must_use]
    pub fn timeout_monitor(&self) -> TimeoutMonitor {
        let monitor = &self.settings.monitor;
        TimeoutMonitor::new(Arc::clone(&self.store), Arc::clone(&self.clock))
            .with_check_interval(monitor.check_interval())
            .with_threshold(monitor.timeout_threshold())
            .with_error_backoff(monitor.error_backoff())
    }

    /// Starts the timeout monitor for this process.
    ///
    /// With `reset_on_startup`, running records left by a previous process
    /// are failed first. This only matters for a store that outlives the
    /// process.
    pub async fn start_monitor(&self) -> Result<TimeoutMonitor, TaskStoreError> {
        let monitor = self.timeout_monitor();
        if self.settings.monitor.reset_on_startup {
            monitor.reset_running_on_startup().await?;
        }
        monitor.start();
        Ok(monitor)
    }

    fn builder(&self) -> PipelineBuilder {
        PipelineBuilder::new(self.factory.clone())
            .with_dependencies(self.dependencies.clone())
            .with_channel_capacity(self.settings.channel_capacity)
    }

    /// Checks a configuration without creating a task or any stage.
    pub fn validate(&self, config: &PipelineConfig) -> Result<(), ChainflowError> {
        Ok(self.builder().validate(config)?)
    }

    async fn prepare(
        &self,
        config: &PipelineConfig,
        log_path: Option<PathBuf>,
    ) -> Result<PreparedRun, ChainflowError> {
        let pipeline = self.builder().build(config)?;
        let log_path = log_path.unwrap_or_else(|| self.settings.default_log_path(pipeline.id()));
        let log = RunLog::open(&log_path, &self.settings.logging)?;

        let record = self
            .store
            .create_task(pipeline.id(), &log_path, self.clock.now())
            .await?;
        let cancel = Arc::new(CancellationToken::new());
        self.active.insert(record.task_id, Arc::clone(&cancel));
        info!(
            pipeline_id = %pipeline.id(),
            task_id = %record.task_id,
            log_path = %log_path.display(),
            "Task created"
        );

        Ok(PreparedRun {
            pipeline,
            task_id: record.task_id,
            cancel,
            log,
        })
    }

    /// Builds the pipeline, creates its task record and starts it in the
    /// background.
    ///
    /// Returns as soon as the run is spawned. A configuration error returns
    /// before any record is created.
    pub async fn run_pipeline(
        &self,
        config: &PipelineConfig,
        log_path: Option<PathBuf>,
    ) -> Result<TaskId, ChainflowError> {
        Ok(self.start_pipeline(config, log_path).await?.task_id())
    }

    /// Like [`Self::run_pipeline`] but returns a handle that resolves when
    /// the run has finished and its record is finalized.
    pub async fn start_pipeline(
        &self,
        config: &PipelineConfig,
        log_path: Option<PathBuf>,
    ) -> Result<RunHandle, ChainflowError> {
        let prepared = self.prepare(config, log_path).await?;
        let task_id = prepared.task_id;
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let active = Arc::clone(&self.active);
        let join = tokio::spawn(async move {
            execute(prepared, store.as_ref(), clock.as_ref(), &active).await
        });
        Ok(RunHandle { task_id, join })
    }

    /// Like [`Self::run_pipeline`] but waits for the run to finish.
    pub async fn run_pipeline_sync(
        &self,
        config: &PipelineConfig,
        log_path: Option<PathBuf>,
    ) -> Result<RunResult, ChainflowError> {
        let prepared = self.prepare(config, log_path).await?;
        Ok(execute(
            prepared,
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.active,
        )
        .await)
    }

    /// Requests cancellation of an active run.
    ///
    /// Returns false if the task is not running in this process.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.active.get(&task_id) {
            Some(token) => {
                token.cancel("cancelled by request");
                info!(task_id = %task_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Tasks running in this process, by id.
    #[must_use]
    pub fn active_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.active.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Fetches a task record.
    pub async fn task(&self, task_id: TaskId) -> Result<TaskRecord, TaskStoreError> {
        self.store.get_task(task_id).await
    }

    /// Counts of task records by status.
    pub async fn statistics(&self) -> Result<TaskStatistics, TaskStoreError> {
        let records = self.store.list_tasks().await?;
        Ok(TaskStatistics::from_records(&records))
    }
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("factory", &self.factory)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Runs a prepared pipeline under its own log and finalizes its record.
async fn execute(
    prepared: PreparedRun,
    store: &dyn TaskStore,
    clock: &dyn Clock,
    active: &DashMap<TaskId, Arc<CancellationToken>>,
) -> RunResult {
    let PreparedRun {
        pipeline,
        task_id,
        cancel,
        log,
    } = prepared;
    let dispatch = log.dispatch();

    let result = async {
        let result = pipeline.run(Some(task_id), &cancel).await;
        finalize(store, clock, task_id, &result).await;
        result
    }
    .with_subscriber(dispatch)
    .await;

    active.remove(&task_id);
    drop(log);
    result
}

/// Writes the run outcome unless the record is already terminal.
async fn finalize(store: &dyn TaskStore, clock: &dyn Clock, task_id: TaskId, result: &RunResult) {
    let (status, reason) = result.outcome.task_status();
    match store
        .update_status(task_id, status, reason, clock.now())
        .await
    {
        Ok(WriteOutcome::Applied) => {
            info!(task_id = %task_id, status = %status, "Task finalized");
        }
        Ok(WriteOutcome::Skipped) => {
            warn!(
                task_id = %task_id,
                status = %status,
                "Task already terminal, keeping recorded status"
            );
        }
        Err(TaskStoreError::TaskNotFound(_)) => {
            warn!(task_id = %task_id, "Task record not found while finalizing");
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to finalize task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{InMemoryTaskStore, MockTaskStore, SystemClock, TaskStatus};
    use crate::testing::{pipeline_config, test_factory, StageLog};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn service(store: Arc<dyn TaskStore>, log: &StageLog) -> PipelineService {
        PipelineService::new(store, Arc::new(SystemClock), ServiceSettings::default())
            .with_factory(test_factory(log))
    }

    fn scenario_a() -> PipelineConfig {
        pipeline_config(
            "scenario-a",
            vec![
                ("src", "vec_source", json!({"records": [{"n": 1}]})),
                ("lookup", "probe_enrichment", json!({"fail_with": "rpc down"})),
                ("sink", "probe_sink", json!({})),
            ],
        )
    }

    #[tokio::test]
    async fn test_sync_run_records_success_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        let store = Arc::new(InMemoryTaskStore::new());
        let log = StageLog::new();
        let service = service(store.clone(), &log);

        let result = service
            .run_pipeline_sync(&scenario_a(), Some(log_path.clone()))
            .await
            .unwrap();

        let task_id = result.task_id.unwrap();
        let record = store.get_task(task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.failure_reason, None);
        assert_eq!(record.log_path, log_path);
        assert!(record.finish_time.is_some());
        assert!(service.active_tasks().is_empty());

        let written = std::fs::read_to_string(&log_path).unwrap();
        assert!(written.contains("Stage failed, continuing with previous context"));
    }

    #[tokio::test]
    async fn test_config_error_creates_no_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        let log = StageLog::new();
        let config = pipeline_config("bad", vec![("sink", "probe_sink", json!({}))]);

        let err = service(store.clone(), &log)
            .run_pipeline(&config, Some(dir.path().join("bad.log")))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainflowError::Config(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_source_failure_records_reason() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        let log = StageLog::new();
        let config = pipeline_config(
            "broken",
            vec![("src", "vec_source", json!({"fail_with": "node unreachable"}))],
        );

        let result = service(store.clone(), &log)
            .run_pipeline_sync(&config, Some(dir.path().join("broken.log")))
            .await
            .unwrap();

        let record = store.get_task(result.task_id.unwrap()).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record
            .failure_reason
            .unwrap()
            .contains("node unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_run_can_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        let log = StageLog::new();
        let service = service(store.clone(), &log);
        let config = pipeline_config(
            "slow",
            vec![(
                "src",
                "vec_source",
                json!({"records": [{"n": 1}, {"n": 2}, {"n": 3}], "delay_ms": 60_000}),
            )],
        );

        let task_id = service
            .run_pipeline(&config, Some(dir.path().join("slow.log")))
            .await
            .unwrap();
        assert_eq!(service.active_tasks(), vec![task_id]);
        assert!(service.cancel(task_id));

        let mut record = store.get_task(task_id).await.unwrap();
        for _ in 0..100 {
            if !record.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = store.get_task(task_id).await.unwrap();
        }

        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("cancelled: cancelled by request")
        );
        assert!(service.active_tasks().is_empty());
        assert!(!service.cancel(task_id));
    }

    #[tokio::test]
    async fn test_statistics_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        let log = StageLog::new();
        let service = service(store.clone(), &log);
        let failing = pipeline_config(
            "failing",
            vec![("src", "vec_source", json!({"fail_init": true}))],
        );

        service
            .run_pipeline_sync(&scenario_a(), Some(dir.path().join("1.log")))
            .await
            .unwrap();
        service
            .run_pipeline_sync(&failing, Some(dir.path().join("2.log")))
            .await
            .unwrap();

        let stats = service.statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn test_terminal_record_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("late.log");
        let mut store = MockTaskStore::new();
        store.expect_create_task().returning(|pipeline_id, path, at| {
            Ok(TaskRecord::new(TaskId::new(9), pipeline_id, path, at))
        });
        store
            .expect_update_status()
            .times(1)
            .returning(|_, _, _, _| Ok(WriteOutcome::Skipped));
        let log = StageLog::new();

        let result = service(Arc::new(store), &log)
            .run_pipeline_sync(&scenario_a(), Some(log_path))
            .await
            .unwrap();

        assert_eq!(result.task_id, Some(TaskId::new(9)));
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_missing_record_on_finalize_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockTaskStore::new();
        store
            .expect_create_task()
            .returning(|pipeline_id, path, _| {
                Ok(TaskRecord::new(TaskId::new(3), pipeline_id, path, Utc::now()))
            });
        store
            .expect_update_status()
            .returning(|id, _, _, _| Err(TaskStoreError::TaskNotFound(id)));
        let log = StageLog::new();

        let result = service(Arc::new(store), &log)
            .run_pipeline_sync(&scenario_a(), Some(dir.path().join("gone.log")))
            .await
            .unwrap();

        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_run_handle_resolves_after_record_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTaskStore::new());
        let log = StageLog::new();
        let service = service(store.clone(), &log);

        let mut handle = service
            .start_pipeline(&scenario_a(), Some(dir.path().join("handle.log")))
            .await
            .unwrap();
        let result = handle.wait().await.unwrap();

        assert_eq!(result.task_id, Some(handle.task_id()));
        let record = store.get_task(handle.task_id()).await.unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert!(service.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_start_monitor_resets_leftover_running_records() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert(TaskRecord::new(TaskId::new(1), "old", "old.log", Utc::now()));
        let log = StageLog::new();
        let service = service(store.clone(), &log);

        let monitor = service.start_monitor().await.unwrap();
        assert!(monitor.is_running());
        monitor.stop().await;

        let record = store.get_task(TaskId::new(1)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("process restarted"));
    }

    #[tokio::test]
    async fn test_start_monitor_keeps_records_when_reset_disabled() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert(TaskRecord::new(TaskId::new(1), "old", "old.log", Utc::now()));
        let mut settings = ServiceSettings::default();
        settings.monitor.reset_on_startup = false;
        let service = PipelineService::new(store.clone(), Arc::new(SystemClock), settings);

        let monitor = service.start_monitor().await.unwrap();
        monitor.stop().await;

        assert!(store.get_task(TaskId::new(1)).await.unwrap().is_running());
    }

    #[test]
    fn test_timeout_monitor_uses_settings() {
        let store = Arc::new(InMemoryTaskStore::new());
        let service = PipelineService::new(store, Arc::new(SystemClock), ServiceSettings::default());
        assert!(!service.timeout_monitor().is_running());
    }
}
