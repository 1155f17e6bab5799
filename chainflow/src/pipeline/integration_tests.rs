//! End-to-end tests for pipeline building and execution.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::pipeline::{PipelineBuilder, RunOutcome};
    use crate::tasks::{TaskId, TaskStatus};
    use crate::testing::{
        assert_completed, assert_failed_with, assert_steps, pipeline_config, test_factory,
        StageLog,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn builder(log: &StageLog) -> PipelineBuilder {
        PipelineBuilder::new(test_factory(log))
    }

    fn lifecycle(log: &StageLog, prefix: &str) -> Vec<String> {
        log.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_enrichment_passes_previous_context_to_sink() {
        let log = StageLog::new();
        let config = pipeline_config(
            "enrich",
            vec![
                ("src", "vec_source", json!({"records": [{"n": 1}, {"n": 2}]})),
                ("lookup", "probe_enrichment", json!({"fail_with": "rpc down"})),
                ("sink", "probe_sink", json!({})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(Some(TaskId::new(7)), &CancellationToken::new())
            .await;

        assert_completed(&result);
        assert_eq!(result.task_id, Some(TaskId::new(7)));
        assert_eq!(result.contexts_processed, 2);
        assert_eq!(result.stage_failures.len(), 2);
        assert!(result.stage_failures.iter().all(|f| f.stage == "lookup"));
        assert_eq!(result.outcome.task_status().0, TaskStatus::Success);

        let seen: Vec<Value> = log
            .payloads("sink")
            .into_iter()
            .map(Value::Object)
            .collect();
        assert_eq!(seen, vec![json!({"n": 1}), json!({"n": 2})]);
        assert_steps(result.last_context.as_ref().unwrap(), &["src", "sink"]);
    }

    #[tokio::test]
    async fn test_lifecycle_order_and_reverse_cleanup() {
        let log = StageLog::new();
        let config = pipeline_config(
            "order",
            vec![
                ("src", "vec_source", json!({"records": [{"n": 1}]})),
                ("mid", "probe", json!({"set": {"seen": true}})),
                ("sink", "probe_sink", json!({})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(None, &CancellationToken::new())
            .await;

        assert_completed(&result);
        assert_eq!(lifecycle(&log, "init:"), vec!["init:src", "init:mid", "init:sink"]);
        assert_eq!(
            lifecycle(&log, "cleanup:"),
            vec!["cleanup:sink", "cleanup:mid", "cleanup:src"]
        );
        assert_eq!(log.payloads("sink")[0].get("seen"), Some(&json!(true)));
        assert_steps(result.last_context.as_ref().unwrap(), &["src", "mid", "sink"]);
    }

    #[tokio::test]
    async fn test_init_failure_cleans_up_initialized_stages_only() {
        let log = StageLog::new();
        let config = pipeline_config(
            "init-fail",
            vec![
                ("src", "vec_source", json!({"records": [{"n": 1}]})),
                ("mid", "probe", json!({"fail_init": true})),
                ("sink", "probe_sink", json!({})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(None, &CancellationToken::new())
            .await;

        assert_failed_with(&result, "mid");
        assert_eq!(lifecycle(&log, "exec:"), Vec::<String>::new());
        assert_eq!(lifecycle(&log, "init:"), vec!["init:src", "init:mid"]);
        assert_eq!(lifecycle(&log, "cleanup:"), vec!["cleanup:src"]);
        assert_eq!(result.outcome.task_status().0, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_source_panic_fails_run_and_cleans_up_once() {
        let log = StageLog::new();
        let config = pipeline_config(
            "panic",
            vec![
                ("src", "vec_source", json!({"panic": true})),
                ("sink", "probe_sink", json!({})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(None, &CancellationToken::new())
            .await;

        assert_failed_with(&result, "panicked");
        assert_eq!(log.count("cleanup:src"), 1);
        assert_eq!(log.count("cleanup:sink"), 1);
    }

    #[tokio::test]
    async fn test_source_error_is_fatal() {
        let log = StageLog::new();
        let config = pipeline_config(
            "source-error",
            vec![
                ("src", "vec_source", json!({"fail_with": "node unreachable"})),
                ("sink", "probe_sink", json!({})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(None, &CancellationToken::new())
            .await;

        assert_failed_with(&result, "node unreachable");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_panicking_stage_is_skipped_like_a_failure() {
        let log = StageLog::new();
        let config = pipeline_config(
            "stage-panic",
            vec![
                ("src", "vec_source", json!({"records": [{"n": 1}]})),
                ("boom", "probe", json!({"panic": true})),
                ("sink", "probe_sink", json!({})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(None, &CancellationToken::new())
            .await;

        assert_completed(&result);
        assert_eq!(result.stage_failures.len(), 1);
        assert!(result.stage_failures[0].panicked);
        assert_eq!(log.payloads("sink").len(), 1);
    }

    #[test]
    fn test_non_source_first_stage_is_rejected_before_anything_runs() {
        let log = StageLog::new();
        let config = pipeline_config(
            "bad",
            vec![
                ("sink", "probe_sink", json!({})),
                ("src", "vec_source", json!({})),
            ],
        );

        let err = builder(&log).build(&config).unwrap_err();

        assert_eq!(err.code(), "CONFIG-INVALID-PIPELINE");
        assert!(log.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_between_contexts() {
        let log = StageLog::new();
        let config = pipeline_config(
            "cancel",
            vec![
                (
                    "src",
                    "vec_source",
                    json!({"records": [{"n": 1}, {"n": 2}, {"n": 3}], "delay_ms": 1000}),
                ),
                ("sink", "probe_sink", json!({})),
            ],
        );
        let pipeline = builder(&log).build(&config).unwrap();
        let token = Arc::new(CancellationToken::new());

        let canceller = Arc::clone(&token);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel("operator stop");
        });
        let result = pipeline.run(None, &token).await;

        assert_eq!(
            result.outcome,
            RunOutcome::Cancelled {
                reason: "operator stop".to_string()
            }
        );
        assert_eq!(result.contexts_processed, 1);
        assert_eq!(log.count("cleanup:src"), 1);
        assert_eq!(log.count("cleanup:sink"), 1);
        let (status, reason) = result.outcome.task_status();
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(reason.as_deref(), Some("cancelled: operator stop"));
    }

    #[tokio::test]
    async fn test_mapper_to_file_writer_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("events.jsonl");
        let log = StageLog::new();
        let config = pipeline_config(
            "file",
            vec![
                (
                    "src",
                    "vec_source",
                    json!({"records": [
                        {"event_name": "Transfer", "from": "0xA", "value": "10"},
                        {"event_name": "Approval", "owner": "0xB"}
                    ]}),
                ),
                (
                    "mapper",
                    "dict_mapper",
                    json!({"dict_mappers": [{
                        "event_name": "Transfer",
                        "mapping_rules": [
                            {"source_key": "from", "target_key": "sender"},
                            {"source_key": "value", "target_key": "amount", "transformer": "to_int"}
                        ]
                    }]}),
                ),
                ("writer", "file_writer", json!({"path": path})),
            ],
        );

        let result = builder(&log)
            .build(&config)
            .unwrap()
            .run(None, &CancellationToken::new())
            .await;

        assert_completed(&result);
        let lines: Vec<Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], json!({"sender": "0xA", "amount": 10}));
        assert_steps(
            result.last_context.as_ref().unwrap(),
            &["src", "mapper", "writer"],
        );
    }
}
