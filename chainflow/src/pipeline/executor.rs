//! Drives a built stage chain.

use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{RunOutcome, RunResult};
use crate::cancellation::CancellationToken;
use crate::context::Context;
use crate::errors::{SourceFault, StageError};
use crate::stages::Stage;
use crate::tasks::TaskId;

/// A validated stage chain ready to run once.
#[derive(Debug)]
pub struct Pipeline {
    id: String,
    stages: Vec<Box<dyn Stage>>,
    records: mpsc::Receiver<Value>,
}

/// Counters gathered while contexts flow through the chain.
#[derive(Debug, Default)]
struct Progress {
    processed: u64,
    failures: Vec<StageError>,
    last: Option<Context>,
}

impl Pipeline {
    pub(crate) fn new(
        id: String,
        stages: Vec<Box<dyn Stage>>,
        records: mpsc::Receiver<Value>,
    ) -> Self {
        Self {
            id,
            stages,
            records,
        }
    }

    /// The pipeline instance id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stage names in chain order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs the chain to completion, cancellation or failure.
    ///
    /// Stages initialize in order; the first failure ends the run before any
    /// stage executes. Every stage that initialized is cleaned up in reverse
    /// order on every path.
    pub async fn run(mut self, task_id: Option<TaskId>, cancel: &CancellationToken) -> RunResult {
        let started = Instant::now();
        info!(
            pipeline_id = %self.id,
            task_id = ?task_id,
            stages = self.stages.len(),
            "Pipeline starting"
        );

        let mut initialized = 0;
        let mut init_failure = None;
        for stage in &mut self.stages {
            match stage.initialize().await {
                Ok(()) => initialized += 1,
                Err(e) => {
                    error!(
                        pipeline_id = %self.id,
                        stage = %stage.name(),
                        error = %e,
                        "Stage initialization failed"
                    );
                    init_failure = Some(RunOutcome::Failed {
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        let mut progress = Progress::default();
        let outcome = match init_failure {
            Some(outcome) => outcome,
            None => self.drive(task_id, cancel, &mut progress).await,
        };

        for stage in self.stages[..initialized].iter_mut().rev() {
            let name = stage.name().to_string();
            if AssertUnwindSafe(stage.cleanup()).catch_unwind().await.is_err() {
                error!(pipeline_id = %self.id, stage = %name, "Stage cleanup panicked");
            }
        }

        let duration = started.elapsed();
        match &outcome {
            RunOutcome::Failed { reason } => {
                error!(
                    pipeline_id = %self.id,
                    reason = %reason,
                    duration_ms = millis(duration),
                    "Pipeline failed"
                );
            }
            other => info!(
                pipeline_id = %self.id,
                status = other.label(),
                contexts = progress.processed,
                stage_failures = progress.failures.len(),
                duration_ms = millis(duration),
                "Pipeline finished"
            ),
        }

        RunResult {
            pipeline_id: self.id,
            task_id,
            outcome,
            contexts_processed: progress.processed,
            stage_failures: progress.failures,
            last_context: progress.last,
            duration,
        }
    }

    async fn drive(
        &mut self,
        task_id: Option<TaskId>,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> RunOutcome {
        let Some((source, chain)) = self.stages.split_first() else {
            return RunOutcome::Completed;
        };
        let records = &mut self.records;
        let id = self.id.as_str();

        let mut seed = Context::new(id, Map::new());
        if let Some(task_id) = task_id {
            seed = seed.with_task_id(task_id);
        }
        let source_run = AssertUnwindSafe(source.execute(seed)).catch_unwind();
        tokio::pin!(source_run);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return cancelled(cancel),

                Some(record) = records.recv() => {
                    let ctx = process(id, task_id, source.name(), chain, record, progress).await;
                    progress.last = Some(ctx);
                }

                finished = &mut source_run => {
                    let fault = match finished {
                        Ok(Ok(_)) => None,
                        Ok(Err(e)) => Some(SourceFault::from(e)),
                        Err(panic) => Some(SourceFault::from(StageError::from_panic(
                            source.name(),
                            &*panic,
                        ))),
                    };
                    if let Some(fault) = fault {
                        error!(
                            pipeline_id = %id,
                            stage = %fault.stage,
                            error = %fault.message,
                            "Source stage failed"
                        );
                        return RunOutcome::Failed { reason: fault.to_string() };
                    }
                    debug!(pipeline_id = %id, "Source exhausted, draining buffered records");
                    while let Ok(record) = records.try_recv() {
                        if cancel.is_cancelled() {
                            return cancelled(cancel);
                        }
                        let ctx = process(id, task_id, source.name(), chain, record, progress).await;
                        progress.last = Some(ctx);
                    }
                    return RunOutcome::Completed;
                }
            }
        }
    }
}

fn cancelled(cancel: &CancellationToken) -> RunOutcome {
    RunOutcome::Cancelled {
        reason: cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
    }
}

/// Runs one record through the non-source stages.
///
/// A failing or panicking stage is logged and skipped; the next stage sees
/// the context as it was before the failure.
async fn process(
    pipeline_id: &str,
    task_id: Option<TaskId>,
    source: &str,
    chain: &[Box<dyn Stage>],
    record: Value,
    progress: &mut Progress,
) -> Context {
    let mut ctx = Context::from_value(pipeline_id, record);
    if let Some(task_id) = task_id {
        ctx = ctx.with_task_id(task_id);
    }
    ctx.record_step(source);

    for stage in chain {
        let prior = ctx.clone();
        let started = Instant::now();
        let result = match AssertUnwindSafe(stage.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(StageError::from_panic(stage.name(), &*panic)),
        };
        ctx = match result {
            Ok(mut next) => {
                next.adopt_lineage(prior);
                next.record_step(stage.name());
                debug!(
                    stage = %stage.name(),
                    duration_ms = millis(started.elapsed()),
                    "Stage completed"
                );
                next
            }
            Err(e) => {
                warn!(
                    pipeline_id = %pipeline_id,
                    stage = %stage.name(),
                    error = %e,
                    panicked = e.panicked,
                    context = %prior.snapshot(),
                    "Stage failed, continuing with previous context"
                );
                progress.failures.push(e);
                prior
            }
        };
    }
    progress.processed += 1;
    ctx
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
