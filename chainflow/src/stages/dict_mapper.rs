//! Field-mapping stage.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Stage;
use crate::config::StageDescriptor;
use crate::context::Context;
use crate::core::StageKind;
use crate::errors::{ConfigError, StageError};
use crate::mapping::{FieldMapper, FieldMapperConfig};

/// Reshapes each payload with event-scoped rule sets.
#[derive(Debug)]
pub struct DictMapperStage {
    name: String,
    mapper: FieldMapper,
}

impl DictMapperStage {
    /// Creates the stage from a compiled mapper.
    #[must_use]
    pub fn new(name: impl Into<String>, mapper: FieldMapper) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }

    /// Builds the stage from `dict_mappers` or legacy `mapping_rules`.
    pub fn from_descriptor(descriptor: &StageDescriptor) -> Result<Self, ConfigError> {
        let config: FieldMapperConfig = descriptor.parse_config()?;
        let mapper = FieldMapper::from_config(config)
            .map_err(|e| ConfigError::invalid_stage(&descriptor.name, e.to_string()))?;
        Ok(Self::new(&descriptor.name, mapper))
    }
}

#[async_trait]
impl Stage for DictMapperStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn execute(&self, mut ctx: Context) -> Result<Context, StageError> {
        let outcome = self.mapper.map(&ctx.payload);
        for failure in &outcome.failures {
            warn!(
                stage = %self.name,
                event_filter = failure.event_filter.as_deref().unwrap_or("*"),
                error = %failure.error,
                "Rule set failed, its fields were not written"
            );
        }
        debug!(
            stage = %self.name,
            applied_sets = outcome.applied_sets,
            fields = outcome.output.len(),
            "Mapped record"
        );
        ctx.payload = outcome.output;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn stage(config: Value) -> DictMapperStage {
        DictMapperStage::from_descriptor(&StageDescriptor::new("mapper", "dict_mapper", config))
            .unwrap()
    }

    fn ctx(payload: Value) -> Context {
        Context::from_value("p", payload)
    }

    #[tokio::test]
    async fn test_event_scoped_sets_apply_to_matching_event() {
        let stage = stage(json!({"dict_mappers": [
            {"event_name": "Transfer", "mapping_rules": [{"source_key": "from", "target_key": "sender"}]},
            {"event_name": null, "mapping_rules": [{"source_key": "blockNumber", "target_key": "block_number"}]}
        ]}));

        let out = stage
            .execute(ctx(json!({"event_name": "Transfer", "from": "0xA", "blockNumber": 5})))
            .await
            .unwrap();

        assert_eq!(
            Value::Object(out.payload),
            json!({"sender": "0xA", "block_number": 5})
        );
    }

    #[tokio::test]
    async fn test_record_without_event_name_gets_every_set() {
        let stage = stage(json!({"dict_mappers": [
            {"event_name": "Approval", "mapping_rules": [{"source_key": "from", "target_key": "sender"}]},
            {"mapping_rules": [{"source_key": "blockNumber", "target_key": "block_number"}]}
        ]}));

        let out = stage
            .execute(ctx(json!({"from": "0xA", "blockNumber": 5})))
            .await
            .unwrap();

        assert_eq!(out.payload.get("sender"), Some(&json!("0xA")));
        assert_eq!(out.payload.get("block_number"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_failed_set_is_skipped_and_stage_succeeds() {
        let stage = stage(json!({"keep_source_fields": true, "mapping_rules": [
            {"source_key": "amount", "target_key": "amount_fmt", "required": true}
        ]}));

        let out = stage.execute(ctx(json!({"other": 1}))).await.unwrap();
        assert_eq!(Value::Object(out.payload), json!({"other": 1}));
    }

    #[test]
    fn test_bad_regex_is_a_config_error() {
        let err = DictMapperStage::from_descriptor(&StageDescriptor::new(
            "mapper",
            "dict_mapper",
            json!({"mapping_rules": [{
                "source_key": "a", "target_key": "b",
                "condition": {"type": "regex", "field": "a", "value": "("}
            }]}),
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStageConfig { .. }));
    }
}
