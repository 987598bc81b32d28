//! End-to-end flows over the public API, with literal values.

use anyhow::Result;
use chronicle_core::timeql::exec::QueryPayload;
use chronicle_core::{
    CausalityEngine, EngineConfig, EventBus, EventRecord, ManualClock, TemporalQueryEngine,
};
use chronicle_test::fixtures::{cascade_events, error_burst, event, http_pairs, with_data};
use chronicle_test::init_tracing;
use serde_json::json;
use std::sync::Arc;

const TENANT: &str = "default";

async fn setup(records: Vec<EventRecord>) -> (Arc<CausalityEngine>, TemporalQueryEngine) {
    init_tracing();
    let engine = Arc::new(CausalityEngine::with_parts(
        EngineConfig::default(),
        ManualClock::shared(1_000_000),
        Arc::new(EventBus::new()),
        None,
    ));
    for record in records {
        engine.ingest(record).await.expect("fixture ingest");
    }
    let queries = TemporalQueryEngine::new(engine.clone());
    (engine, queries)
}

/// A db pool error cascades through the gateway; the backward search lands
/// on the db event because the 80 ms gap sits well inside the correlation
/// window.
#[tokio::test]
async fn root_cause_of_cascade() -> Result<()> {
    let (engine, _) = setup(cascade_events()).await;

    let resp = engine.get_event("resp").await.expect("resp node");
    assert!(resp.caused_by.contains_key("db"));
    assert!(resp.caused_by.contains_key("gw"));

    let root = engine.find_root("resp").await?;
    assert_eq!(root.event_id, "db");
    Ok(())
}

#[tokio::test]
async fn state_at_health_degraded_with_three_errors() {
    let records = vec![
        with_data(event("e1", 1_000, "api", "error"), &[("error", json!("a"))]),
        with_data(event("e2", 4_000, "api", "error"), &[("error", json!("b"))]),
        with_data(event("e3", 8_000, "api", "error"), &[("error", json!("c"))]),
    ];
    let (_, queries) = setup(records).await;

    let result = queries.query(TENANT, "STATE AT '10000'").await.unwrap();
    let QueryPayload::State(state) = &result.payload else {
        panic!("wrong payload");
    };
    assert_eq!(state.summary.error_count, 3);
    assert_eq!(state.summary.health, "degraded");
}

#[tokio::test]
async fn timeline_filters_to_requests() {
    let (_, queries) = setup(http_pairs()).await;

    let result = queries
        .query(
            TENANT,
            "TIMELINE FROM '0' TO '5000' WHERE eventType = 'http:request'",
        )
        .await
        .unwrap();
    let QueryPayload::Timeline(timeline) = &result.payload else {
        panic!("wrong payload");
    };

    assert_eq!(timeline.count, 5);
    let timestamps: Vec<i64> = timeline.events.iter().map(|e| e.event.timestamp).collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);
}

/// Ten errors 500 ms apart: each consecutive pair matches, the last event
/// has no follower, so nine matches.
#[tokio::test]
async fn pattern_window_consecutive_pairs() -> Result<()> {
    let (_, queries) = setup(error_burst(10, 500)).await;

    let result = queries
        .query(
            TENANT,
            "MATCH PATTERN WHERE eventType='error' FOLLOWED BY eventType='error' \
             WITHIN 1 seconds IN LAST 1 minutes",
        )
        .await?;
    let QueryPayload::Matches(matches) = &result.payload else {
        panic!("wrong payload");
    };

    assert_eq!(matches.count, 9);
    for pair in &matches.matches {
        assert_eq!(pair.events.len(), 2);
        assert_eq!(pair.duration_ms, 500);
    }
    Ok(())
}

#[tokio::test]
async fn predict_after_pattern_burst() {
    let (_, queries) = setup(error_burst(10, 500)).await;

    let result = queries
        .query(TENANT, "PREDICT NEXT 1 seconds FROM '4500'")
        .await
        .unwrap();
    let QueryPayload::Predict(predict) = &result.payload else {
        panic!("wrong payload");
    };

    let errors: Vec<_> = predict
        .predictions
        .iter()
        .filter(|p| p.prediction.event_type == "error")
        .collect();
    assert!(!errors.is_empty());
    for p in errors {
        assert!(matches!(p.likelihood.as_str(), "likely" | "very likely"));
    }
}

#[tokio::test]
async fn identical_timeline_hits_the_cache() {
    let (_, queries) = setup(http_pairs()).await;
    let text = "TIMELINE FROM '0' TO '5000'";

    let first = queries.query(TENANT, text).await.unwrap();
    let second = queries.query(TENANT, text).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first.payload).unwrap(),
        serde_json::to_string(&second.payload).unwrap()
    );
    assert!(second.elapsed_ms < first.elapsed_ms);
}
