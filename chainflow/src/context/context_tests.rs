//! Tests for the context module.

#[cfg(test)]
mod tests {
    use crate::context::{event_key_of, Context, EventKey};
    use crate::tasks::TaskId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Context {
        Context::from_value("pipe-1", value)
    }

    #[test]
    fn test_from_value_wraps_scalars() {
        let c = ctx(json!(42));
        assert_eq!(c.snapshot(), json!({"value": 42}));
        assert_eq!(c.pipeline_id(), "pipe-1");
        assert!(c.task_id().is_none());
    }

    #[test]
    fn test_event_name_falls_back_to_event() {
        assert_eq!(ctx(json!({"event_name": "Transfer"})).event_name(), Some("Transfer"));
        assert_eq!(ctx(json!({"event": "Swap"})).event_name(), Some("Swap"));
        assert_eq!(
            ctx(json!({"event_name": "Mint", "event": "Swap"})).event_name(),
            Some("Mint")
        );
        assert_eq!(ctx(json!({"event_name": null})).event_name(), None);
    }

    #[test]
    fn test_event_key_treats_blank_values_as_missing() {
        let missing = |value: serde_json::Value| event_key_of(&ctx(value).payload) == EventKey::Missing;
        assert!(missing(json!({"event_name": ""})));
        assert!(missing(json!({"event_name": false, "event": 0})));
        assert!(missing(json!({})));
        assert_eq!(
            event_key_of(&ctx(json!({"event_name": "", "event": "Swap"})).payload),
            EventKey::Named("Swap")
        );
        assert_eq!(
            event_key_of(&ctx(json!({"event_name": 7})).payload),
            EventKey::Opaque
        );
        assert_eq!(ctx(json!({"event_name": 7})).event_name(), None);
    }

    #[test]
    fn test_record_step_snapshots_payload() {
        let mut c = ctx(json!({"a": 1}));
        c.record_step("source");
        c.payload.insert("b".to_string(), json!(2));
        c.record_step("mapper");

        let history = c.step_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].stage, "source");
        assert_eq!(history[0].snapshot.len(), 1);
        assert_eq!(history[1].snapshot.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_adopt_lineage_keeps_history_and_identity() {
        let mut prior = ctx(json!({"a": 1})).with_task_id(TaskId::new(7));
        prior.record_step("source");

        let mut fresh = Context::from_value("other", json!({"b": 2}));
        fresh.adopt_lineage(prior);

        assert_eq!(fresh.pipeline_id(), "pipe-1");
        assert_eq!(fresh.task_id(), Some(TaskId::new(7)));
        assert_eq!(fresh.step_history().len(), 1);
        assert_eq!(fresh.snapshot(), json!({"b": 2}));
    }

    #[test]
    fn test_metadata_and_get() {
        let c = ctx(json!({"args": {"to": "0xB"}})).with_metadata("chain", json!("eth"));
        assert_eq!(c.metadata.get("chain"), Some(&json!("eth")));
        assert_eq!(c.get("args.to"), Some(&json!("0xB")));
    }
}
