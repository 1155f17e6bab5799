//! The per-record execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::path::lookup_path;
use crate::tasks::TaskId;

/// One entry of a context's step history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Name of the stage that produced this snapshot.
    pub stage: String,
    /// Payload as it stood after the stage ran.
    pub snapshot: Map<String, Value>,
    /// When the step completed.
    pub recorded_at: DateTime<Utc>,
}

/// The unit of data flowing through a pipeline run.
///
/// Each record emitted by the source stage becomes one `Context`. It is owned
/// by the executor and handed to each stage by value; stages return the
/// (possibly modified) context. Only the executor appends step history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// The record being processed.
    pub payload: Map<String, Value>,
    /// Pipeline-scoped metadata accumulated across stages.
    pub metadata: Map<String, Value>,
    pipeline_id: String,
    task_id: Option<TaskId>,
    step_history: Vec<StepRecord>,
}

impl Context {
    /// Creates a context for a payload object.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            payload,
            metadata: Map::new(),
            pipeline_id: pipeline_id.into(),
            task_id: None,
            step_history: Vec::new(),
        }
    }

    /// Creates a context from any JSON value.
    ///
    /// Non-object values are wrapped as `{"value": ...}`.
    #[must_use]
    pub fn from_value(pipeline_id: impl Into<String>, value: Value) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(pipeline_id, payload)
    }

    /// Attaches the task record this context belongs to.
    #[must_use]
    pub const fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Identifier of the pipeline definition.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Task record id, if the run is tracked.
    #[must_use]
    pub const fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Stages this context passed through, in order.
    #[must_use]
    pub fn step_history(&self) -> &[StepRecord] {
        &self.step_history
    }

    /// Looks up a dotted path in the payload.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.payload, path)
    }

    /// The event name of the current record (`event_name`, then `event`).
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        event_name_of(&self.payload)
    }

    /// The payload as a JSON value.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    /// Appends a step for `stage` with the current payload.
    pub(crate) fn record_step(&mut self, stage: &str) {
        self.step_history.push(StepRecord {
            stage: stage.to_string(),
            snapshot: self.payload.clone(),
            recorded_at: Utc::now(),
        });
    }

    /// Moves identity and history from the context a stage was given.
    ///
    /// Stages may hand back a freshly built context; lineage always follows
    /// the executor's copy.
    pub(crate) fn adopt_lineage(&mut self, prior: Self) {
        self.pipeline_id = prior.pipeline_id;
        self.task_id = prior.task_id;
        self.step_history = prior.step_history;
    }
}

/// How a payload identifies its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKey<'a> {
    /// No usable event name: absent, null, empty, `false` or zero.
    Missing,
    /// A string event name.
    Named(&'a str),
    /// A non-string value that names no known event.
    Opaque,
}

impl<'a> EventKey<'a> {
    /// The event name, when it is a string.
    #[must_use]
    pub const fn name(self) -> Option<&'a str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Missing | Self::Opaque => None,
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Reads the event key from a payload.
///
/// `event_name` wins unless it is blank, then `event` is tried.
#[must_use]
pub fn event_key_of(payload: &Map<String, Value>) -> EventKey<'_> {
    let value = ["event_name", "event"]
        .iter()
        .filter_map(|key| payload.get(*key))
        .find(|value| !is_blank(value));
    match value {
        None => EventKey::Missing,
        Some(Value::String(name)) => EventKey::Named(name),
        Some(_) => EventKey::Opaque,
    }
}

/// Reads the event name from a payload (`event_name`, falling back to `event`).
#[must_use]
pub fn event_name_of(payload: &Map<String, Value>) -> Option<&str> {
    event_key_of(payload).name()
}
