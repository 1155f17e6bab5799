//! JSON-lines file sink.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Stage;
use crate::config::StageDescriptor;
use crate::context::Context;
use crate::core::StageKind;
use crate::errors::{ConfigError, InitError, StageError};

fn default_true() -> bool {
    true
}

/// Configuration of a `file_writer` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct FileWriterConfig {
    /// Output file.
    pub path: PathBuf,
    /// Append to an existing file instead of truncating it.
    #[serde(default = "default_true")]
    pub append: bool,
    /// Write the whole context (payload, metadata, steps) instead of the payload.
    #[serde(default)]
    pub include_context: bool,
}

/// Sink stage appending one JSON line per record.
#[derive(Debug)]
pub struct FileWriterStage {
    name: String,
    config: FileWriterConfig,
    writer: Option<Mutex<BufWriter<File>>>,
}

impl FileWriterStage {
    /// Builds the stage; the file is opened during initialization.
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, ConfigError> {
        let config: FileWriterConfig = descriptor.parse_config()?;
        if config.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid_stage(&descriptor.name, "path must not be empty"));
        }
        Ok(Self {
            name: descriptor.name.clone(),
            config,
            writer: None,
        })
    }
}

#[async_trait]
impl Stage for FileWriterStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    async fn initialize(&mut self) -> Result<(), InitError> {
        let path = &self.config.path;
        let fail = |e: std::io::Error| InitError::new(&self.name, format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.config.append)
            .truncate(!self.config.append)
            .open(path)
            .await
            .map_err(fail)?;
        debug!(stage = %self.name, path = %path.display(), "Output file opened");
        self.writer = Some(Mutex::new(BufWriter::new(file)));
        Ok(())
    }

    async fn execute(&self, ctx: Context) -> Result<Context, StageError> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| StageError::new(&self.name, "output file is not open"))?;
        let mut line = if self.config.include_context {
            serde_json::to_vec(&ctx)
        } else {
            serde_json::to_vec(&ctx.payload)
        }
        .map_err(|e| StageError::new(&self.name, e.to_string()))?;
        line.push(b'\n');

        writer
            .lock()
            .await
            .write_all(&line)
            .await
            .map_err(|e| StageError::new(&self.name, e.to_string()))?;
        Ok(ctx)
    }

    async fn cleanup(&mut self) {
        if let Some(writer) = self.writer.take() {
            let mut writer = writer.into_inner();
            if let Err(e) = writer.flush().await {
                warn!(stage = %self.name, error = %e, "Failed to flush output file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn stage(config: Value) -> FileWriterStage {
        FileWriterStage::from_descriptor(&StageDescriptor::new("out", "file_writer", config)).unwrap()
    }

    #[tokio::test]
    async fn test_writes_one_line_per_record_and_flushes_on_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let mut stage = stage(json!({"path": path}));

        stage.initialize().await.unwrap();
        stage.execute(Context::from_value("p", json!({"n": 1}))).await.unwrap();
        stage.execute(Context::from_value("p", json!({"n": 2}))).await.unwrap();
        stage.cleanup().await;

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_truncate_mode_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "old\n").unwrap();

        let mut stage = stage(json!({"path": path, "append": false, "include_context": true}));
        stage.initialize().await.unwrap();
        stage.execute(Context::from_value("p", json!({"n": 1}))).await.unwrap();
        stage.cleanup().await;

        let written = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(line["payload"], json!({"n": 1}));
        assert_eq!(line["pipeline_id"], json!("p"));
    }

    #[tokio::test]
    async fn test_execute_before_initialize_fails() {
        let stage = stage(json!({"path": "unused.jsonl"}));
        assert!(stage
            .execute(Context::from_value("p", json!({})))
            .await
            .is_err());
    }
}
