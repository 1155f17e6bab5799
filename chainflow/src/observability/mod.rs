//! Logging setup for the process and for individual runs.
//!
//! The process subscriber writes to stdout. Each run additionally gets a
//! [`RunLog`]: its own dispatcher that tees every event of the run to stdout
//! and to a plain-text file at the run's log path.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingSettings;
use crate::errors::ChainflowError;

fn env_filter(settings: &LoggingSettings) -> Result<EnvFilter, ChainflowError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.filter)
            .map_err(|e| ChainflowError::Internal(format!("invalid log filter: {e}"))),
    }
}

/// Installs the process-wide subscriber.
///
/// `RUST_LOG` overrides the configured filter.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), ChainflowError> {
    let builder = fmt().with_env_filter(env_filter(settings)?).with_target(false);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ChainflowError::Internal(format!("failed to install subscriber: {e}")))
}

/// Log sink for a single run.
///
/// Dropping it flushes the file writer.
pub struct RunLog {
    path: PathBuf,
    dispatch: Dispatch,
    _guard: WorkerGuard,
}

impl RunLog {
    /// Opens (appending) the log file, creating parent directories.
    pub fn open(path: &Path, settings: &LoggingSettings) -> Result<Self, ChainflowError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        let subscriber = Registry::default()
            .with(env_filter(settings)?)
            .with(fmt::layer().with_target(false))
            .with(fmt::layer().with_writer(writer).with_ansi(false));

        Ok(Self {
            path: path.to_path_buf(),
            dispatch: Dispatch::new(subscriber),
            _guard: guard,
        })
    }

    /// The file this run logs to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dispatcher to attach to the run's task.
    #[must_use]
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_log_writes_events_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("p1.log");
        let settings = LoggingSettings {
            filter: "info".to_string(),
            ..LoggingSettings::default()
        };

        let log = RunLog::open(&path, &settings).unwrap();
        tracing::dispatcher::with_default(&log.dispatch(), || {
            tracing::info!(pipeline_id = "p1", "run log smoke test");
        });
        assert_eq!(log.path(), path.as_path());
        drop(log);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("run log smoke test"));
        assert!(written.contains("pipeline_id=\"p1\""));
    }

    #[test]
    fn test_bad_filter_is_an_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let settings = LoggingSettings {
            filter: "chainflow=loud".to_string(),
            ..LoggingSettings::default()
        };
        assert!(env_filter(&settings).is_err());
    }
}
