use chronicle_core::timeql::exec::QueryPayload;
use chronicle_core::{
    CausalityEngine, EngineConfig, EngineError, EventBus, EventRecord, ManualClock,
    QueryHandle, QueryOptions, TemporalQueryEngine,
};
use chronicle_test::fixtures::{
    cascade_events, error_burst, event, http_pairs, multi_tenant_events, with_data, with_tenant,
};
use chronicle_test::init_tracing;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TENANT: &str = "default";

async fn query_engine_with(
    records: Vec<EventRecord>,
) -> (Arc<CausalityEngine>, TemporalQueryEngine, Arc<ManualClock>) {
    init_tracing();
    let clock = ManualClock::shared(1_000_000);
    let engine = Arc::new(CausalityEngine::with_parts(
        EngineConfig::default(),
        clock.clone(),
        Arc::new(EventBus::new()),
        None,
    ));
    for record in records {
        engine.ingest(record).await.expect("fixture ingest");
    }
    let queries = TemporalQueryEngine::new(engine.clone());
    (engine, queries, clock)
}

#[tokio::test]
async fn state_at_folds_services_errors_and_health() {
    let mut records = http_pairs();
    records.push(with_data(
        event("bad", 2_500, "db", "error"),
        &[("message", json!("disk full"))],
    ));
    let (_, queries, _) = query_engine_with(records).await;

    let result = queries.query(TENANT, "STATE AT '5000'").await.unwrap();
    assert_eq!(result.kind, "state_at");
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };

    assert_eq!(state.summary.error_count, 1);
    assert_eq!(state.summary.service_count, 2);
    assert_eq!(state.summary.health, "degraded");
    assert_eq!(state.errors[0].message, "disk full");

    let api = state.services.get("api").expect("api service");
    assert_eq!(api.event_count, 10);
    assert_eq!(api.event_ids.len(), 10);
    assert_eq!(api.last_event.event_id, "res-4");
    // Every request's response landed by 5000.
    assert_eq!(state.summary.active_request_count, 0);
    assert_eq!(api.status, "ok");
    let db = state.services.get("db").expect("db service");
    assert_eq!(db.status, "error");

    // At 4200 the last request is still waiting for its response.
    let result = queries.query(TENANT, "STATE AT '4200'").await.unwrap();
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };
    assert_eq!(state.summary.active_request_count, 1);
    assert_eq!(state.active_requests[0].event_id, "req-4");

    // Before any error: healthy, and the late request pairs are absent.
    let result = queries.query(TENANT, "STATE AT '900'").await.unwrap();
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };
    assert_eq!(state.summary.health, "healthy");
    assert_eq!(state.summary.service_count, 1);
}

#[tokio::test]
async fn state_at_where_filters_only_the_service_map() {
    let mut records = http_pairs();
    records.push(with_data(
        event("bad", 2_500, "db", "error"),
        &[("message", json!("disk full"))],
    ));
    let (_, queries, _) = query_engine_with(records).await;

    let result = queries
        .query(TENANT, "STATE AT '5000' WHERE service = 'db'")
        .await
        .unwrap();
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };

    assert_eq!(state.summary.service_count, 1);
    assert!(state.services.contains_key("db"));
    // Errors are not narrowed by WHERE.
    assert_eq!(state.summary.error_count, 1);
}

#[tokio::test]
async fn state_at_metrics_merge_last_write_wins() {
    let records = vec![
        with_data(
            event("m1", 1_000, "api", "system:metrics"),
            &[("cpu", json!(10)), ("memory", json!(512))],
        ),
        with_data(
            event("m2", 2_000, "api", "system:metrics"),
            &[("cpu", json!(80))],
        ),
    ];
    let (_, queries, _) = query_engine_with(records).await;

    let result = queries.query(TENANT, "STATE AT '3000'").await.unwrap();
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };
    assert_eq!(state.metrics.get("cpu"), Some(&json!(80)));
    assert_eq!(state.metrics.get("memory"), Some(&json!(512)));
}

#[tokio::test]
async fn traverse_delegates_and_until_truncates() {
    let (_, queries, _) = query_engine_with(cascade_events()).await;

    let result = queries
        .query(TENANT, "TRAVERSE FROM resp FOLLOWING backward")
        .await
        .unwrap();
    assert_eq!(result.kind, "traverse");
    let QueryPayload::Traverse(traverse) = &result.payload else {
        panic!("wrong payload");
    };
    let ids: Vec<&str> = traverse
        .chain
        .events
        .iter()
        .map(|e| e.event_id.as_str())
        .collect();
    assert_eq!(ids, vec!["db", "gw", "resp"]);
    assert!(!traverse.until_hit);

    let result = queries
        .query(
            TENANT,
            "TRAVERSE FROM resp FOLLOWING backward UNTIL serviceId = 'db'",
        )
        .await
        .unwrap();
    let QueryPayload::Traverse(traverse) = &result.payload else {
        panic!("wrong payload");
    };
    // The db event is first in timestamp order, so the cut is inclusive at
    // the very first event.
    assert!(traverse.until_hit);
    assert_eq!(traverse.chain.events.len(), 1);
    assert_eq!(traverse.chain.events[0].event_id, "db");
}

#[tokio::test]
async fn traverse_unknown_event_is_not_found() {
    let (_, queries, _) = query_engine_with(cascade_events()).await;
    let err = queries
        .query(TENANT, "TRAVERSE FROM ghost FOLLOWING backward")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn timeline_filters_sorts_and_derives() {
    let (_, queries, _) = query_engine_with(http_pairs()).await;

    let result = queries
        .query(
            TENANT,
            "TIMELINE FROM '0' TO '5000' WHERE eventType = 'http:request'",
        )
        .await
        .unwrap();
    assert_eq!(result.kind, "timeline");
    let QueryPayload::Timeline(timeline) = &result.payload else {
        panic!("wrong payload");
    };

    assert_eq!(timeline.count, 5);
    let mut previous = i64::MIN;
    for entry in &timeline.events {
        assert_eq!(entry.event.event_type, "http:request");
        assert!(entry.event.timestamp >= previous);
        previous = entry.event.timestamp;
        assert_eq!(entry.relative_time, entry.event.timestamp);
    }
    assert_eq!(timeline.events[4].time_percent, 80.0);
}

#[tokio::test]
async fn unknown_condition_field_is_surfaced() {
    let (_, queries, _) = query_engine_with(http_pairs()).await;
    let err = queries
        .query(TENANT, "TIMELINE FROM '0' TO '5000' WHERE bogus = 1")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownField(_)));
}

#[tokio::test]
async fn compare_diffs_services_metrics_and_errors() {
    let records = vec![
        with_data(
            event("m1", 1_000, "api", "system:metrics"),
            &[("cpu", json!(10.0))],
        ),
        with_data(
            event("m2", 5_000, "api", "system:metrics"),
            &[("cpu", json!(40.0))],
        ),
        event("w1", 5_500, "worker", "job:run"),
        with_data(
            event("e1", 6_000, "api", "error"),
            &[("message", json!("timeout talking to db"))],
        ),
    ];
    let (_, queries, _) = query_engine_with(records).await;

    let result = queries
        .query(TENANT, "COMPARE '2000' WITH '7000' FOR cpu")
        .await
        .unwrap();
    assert_eq!(result.kind, "compare");
    let QueryPayload::Compare(diff) = &result.payload else {
        panic!("wrong payload");
    };

    assert_eq!(diff.services_added, vec!["worker".to_string()]);
    assert!(diff.services_removed.is_empty());
    assert_eq!(diff.services_changed.len(), 1);
    assert_eq!(diff.services_changed[0].before, "ok");
    assert_eq!(diff.services_changed[0].after, "error");

    let cpu = &diff.metrics[0];
    assert_eq!(cpu.before, Some(10.0));
    assert_eq!(cpu.after, Some(40.0));
    assert_eq!(cpu.change, Some(30.0));
    assert_eq!(cpu.change_percent, Some(300.0));

    assert_eq!(diff.errors_added, vec!["timeout talking to db".to_string()]);
    assert!(diff.errors_resolved.is_empty());

    // Swapping the two times swaps adds/removes and negates changes.
    let swapped = queries
        .query(TENANT, "COMPARE '7000' WITH '2000' FOR cpu")
        .await
        .unwrap();
    let QueryPayload::Compare(swapped) = &swapped.payload else {
        panic!("wrong payload");
    };
    assert_eq!(swapped.services_removed, vec!["worker".to_string()]);
    assert!(swapped.services_added.is_empty());
    assert_eq!(swapped.metrics[0].change, Some(-30.0));
    assert_eq!(swapped.errors_resolved, vec!["timeout talking to db".to_string()]);
}

#[tokio::test]
async fn predict_is_deterministic_and_annotated() {
    let (_, queries, _) = query_engine_with(error_burst(10, 500)).await;

    let first = queries
        .query(TENANT, "PREDICT NEXT 1 seconds FROM '4500'")
        .await
        .unwrap();
    assert_eq!(first.kind, "predict");
    let QueryPayload::Predict(predict) = &first.payload else {
        panic!("wrong payload");
    };
    assert!(!predict.predictions.is_empty());
    assert!(predict.predictions.len() <= 10);
    for p in &predict.predictions {
        assert!(!p.predicted_time.is_empty());
        assert!(!p.likelihood.is_empty());
    }

    // Clear the cache effect by asking through a second engine over the
    // same events: output must be identical.
    let (_, queries2, _) = query_engine_with(error_burst(10, 500)).await;
    let second = queries2
        .query(TENANT, "PREDICT NEXT 1 seconds FROM '4500'")
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&first.payload).unwrap(),
        serde_json::to_value(&second.payload).unwrap()
    );
}

#[tokio::test]
async fn predict_with_no_anchor_is_empty() {
    let (_, queries, _) = query_engine_with(error_burst(3, 500)).await;
    let result = queries
        .query(TENANT, "PREDICT NEXT 1 seconds FROM '500 ms ago'")
        .await
        .unwrap();
    let QueryPayload::Predict(predict) = &result.payload else {
        panic!("wrong payload");
    };
    // FROM resolves against the manual clock, far after the burst, so the
    // anchor is the last burst event.
    assert!(predict.anchor.is_some());

    let (_, queries_empty, _) = query_engine_with(Vec::new()).await;
    let result = queries_empty
        .query(TENANT, "PREDICT NEXT 1 seconds")
        .await
        .unwrap();
    let QueryPayload::Predict(predict) = &result.payload else {
        panic!("wrong payload");
    };
    assert!(predict.anchor.is_none());
    assert!(predict.predictions.is_empty());
    assert_eq!(predict.confidence, 0.0);
}

#[tokio::test]
async fn tenant_isolation_across_statements() {
    let (_, queries, _) = query_engine_with(multi_tenant_events()).await;

    let result = queries
        .query("tenant-a", "TIMELINE FROM '0' TO '10000'")
        .await
        .unwrap();
    let QueryPayload::Timeline(timeline) = &result.payload else {
        panic!("wrong payload");
    };
    let ids: Vec<&str> = timeline
        .events
        .iter()
        .map(|e| e.event.event_id.as_str())
        .collect();
    assert_eq!(ids, vec!["a-1", "a-2"]);

    let result = queries
        .query("tenant-b", "STATE AT '10000'")
        .await
        .unwrap();
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };
    // tenant-a's error is invisible to tenant-b.
    assert_eq!(state.summary.error_count, 0);

    // Traversing another tenant's event id is indistinguishable from a
    // missing event.
    let err = queries
        .query("tenant-b", "TRAVERSE FROM a-1 FOLLOWING both")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn cache_hits_are_fast_and_identical_until_ttl() {
    let (_, queries, clock) = query_engine_with(http_pairs()).await;
    let text = "TIMELINE FROM '0' TO '5000' WHERE eventType = 'http:request'";

    let first = queries.query(TENANT, text).await.unwrap();
    let second = queries.query(TENANT, text).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first.payload).unwrap(),
        serde_json::to_string(&second.payload).unwrap()
    );
    assert!(second.elapsed_ms < first.elapsed_ms);

    // Structurally identical text with different spacing shares the entry.
    let third = queries
        .query(
            TENANT,
            "timeline from '0' to '5000' where eventType = 'http:request'",
        )
        .await
        .unwrap();
    assert!(third.elapsed_ms < first.elapsed_ms);

    // Past the TTL the entry is re-executed (observable via executed_at_ms
    // moving with the clock).
    clock.advance(61_000);
    let fourth = queries.query(TENANT, text).await.unwrap();
    assert_eq!(fourth.executed_at_ms, first.executed_at_ms + 61_000);
    assert_eq!(
        serde_json::to_string(&first.payload).unwrap(),
        serde_json::to_string(&fourth.payload).unwrap()
    );
}

#[tokio::test]
async fn cache_is_tenant_scoped() {
    let (_, queries, _) = query_engine_with(multi_tenant_events()).await;
    let text = "TIMELINE FROM '0' TO '10000'";

    let a = queries.query("tenant-a", text).await.unwrap();
    let b = queries.query("tenant-b", text).await.unwrap();

    let QueryPayload::Timeline(ta) = &a.payload else { panic!() };
    let QueryPayload::Timeline(tb) = &b.payload else { panic!() };
    assert_eq!(ta.count, 2);
    assert_eq!(tb.count, 2);
    assert_ne!(
        serde_json::to_string(&a.payload).unwrap(),
        serde_json::to_string(&b.payload).unwrap()
    );
}

#[tokio::test]
async fn cancelled_query_returns_cancelled() {
    let (_, queries, _) = query_engine_with(http_pairs()).await;

    let handle = QueryHandle::new();
    handle.cancel();
    let err = queries
        .query_with(
            TENANT,
            "STATE AT '5000'",
            QueryOptions {
                timeout: None,
                handle: Some(handle),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
}

#[tokio::test]
async fn exhausted_deadline_returns_timeout() {
    let (_, queries, _) = query_engine_with(http_pairs()).await;

    let err = queries
        .query_with(
            TENANT,
            "STATE AT '5000'",
            QueryOptions {
                timeout: Some(Duration::ZERO),
                handle: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
}

#[tokio::test]
async fn envelope_is_json_serializable() {
    let (_, queries, _) = query_engine_with(cascade_events()).await;
    let result = queries.query(TENANT, "STATE AT 'now'").await.unwrap();

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["type"], "state_at");
    assert_eq!(value["tenant_id"], TENANT);
    assert!(value["executed_at_ms"].is_i64());
    assert!(value["elapsed_ms"].is_number());
    assert!(value["summary"]["health"].is_string());
}

#[tokio::test]
async fn tenant_defaults_flow_through_ingest_and_query() {
    let (_, queries, _) = query_engine_with(vec![with_tenant(
        event("x", 1_000, "api", "http:request"),
        "default",
    )])
    .await;
    let result = queries.query(TENANT, "TIMELINE FROM '0' TO '2000'").await.unwrap();
    let QueryPayload::Timeline(timeline) = &result.payload else {
        panic!("wrong payload");
    };
    assert_eq!(timeline.count, 1);
}
