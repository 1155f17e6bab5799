//! Command-line entry point for running chainflow pipelines.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

use chainflow::config::{PipelineConfig, ServiceSettings};
use chainflow::observability::init_tracing;
use chainflow::service::PipelineService;
use chainflow::stages::StageFactory;
use chainflow::tasks::{InMemoryTaskStore, SystemClock, TaskStatus};

#[derive(Debug, Parser)]
#[command(name = "chainflow", version, about = "Blockchain event pipelines")]
struct Cli {
    /// Service settings file (JSON).
    #[arg(long, short, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a pipeline until its source is exhausted or Ctrl-C.
    Run {
        /// Pipeline configuration file (JSON).
        pipeline: PathBuf,
        /// Where to write the run log.
        #[arg(long)]
        log_path: Option<PathBuf>,
    },
    /// Check a pipeline configuration without running it.
    Validate {
        /// Pipeline configuration file (JSON).
        pipeline: PathBuf,
    },
    /// List the registered stage types.
    Stages,
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<ServiceSettings> {
    match path {
        Some(path) => ServiceSettings::from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => Ok(ServiceSettings::default()),
    }
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(PipelineConfig::from_json_str(&raw)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;

    match cli.command {
        Command::Stages => {
            let factory = StageFactory::builtin();
            for tag in factory.tags() {
                if let Some(kind) = factory.kind_of(tag) {
                    println!("{tag:<20} {kind}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { pipeline } => {
            let config = load_pipeline(&pipeline)?;
            let service = PipelineService::new(
                Arc::new(InMemoryTaskStore::new()),
                Arc::new(SystemClock),
                settings,
            );
            service.validate(&config)?;
            println!("{}: ok ({} stages)", config.resolved_id(), config.components.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { pipeline, log_path } => {
            init_tracing(&settings.logging)?;
            let config = load_pipeline(&pipeline)?;
            run(settings, &config, log_path).await
        }
    }
}

async fn run(
    settings: ServiceSettings,
    config: &PipelineConfig,
    log_path: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    // The in-memory store starts empty with each process, so there is
    // nothing to reset; the monitor only starts scanning.
    let mut settings = settings;
    settings.monitor.reset_on_startup = false;
    let service = PipelineService::new(
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(SystemClock),
        settings,
    );
    let monitor = service.start_monitor().await?;

    let mut handle = service.start_pipeline(config, log_path).await?;
    let task_id = handle.task_id();
    info!(task_id = %task_id, "Pipeline started");

    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            biased;

            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                info!(task_id = %task_id, "Interrupted, cancelling pipeline");
                service.cancel(task_id);
            }

            result = handle.wait() => break result?,
        }
    };
    monitor.stop().await;
    info!(
        task_id = %task_id,
        status = result.outcome.label(),
        contexts = result.contexts_processed,
        "Pipeline ended"
    );

    let record = service.task(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    match record.status {
        TaskStatus::Success => Ok(ExitCode::SUCCESS),
        TaskStatus::Failed => Ok(ExitCode::FAILURE),
        TaskStatus::Running => bail!("task {task_id} is still running after its run ended"),
    }
}
