use chronicle_core::EventRecord;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Minimal valid event. Fixtures start here and fill in what they need.
pub fn event(id: &str, ts: i64, service: &str, event_type: &str) -> EventRecord {
    EventRecord {
        event_id: id.to_string(),
        timestamp: ts,
        service_id: service.to_string(),
        service_name: None,
        trace_id: None,
        span_id: None,
        parent_span_id: None,
        event_type: event_type.to_string(),
        data: HashMap::new(),
        metadata: HashMap::new(),
        tenant_id: "default".to_string(),
    }
}

pub fn with_data(mut record: EventRecord, entries: &[(&str, Value)]) -> EventRecord {
    for (key, value) in entries {
        record.data.insert(key.to_string(), value.clone());
    }
    record
}

pub fn with_tenant(mut record: EventRecord, tenant: &str) -> EventRecord {
    record.tenant_id = tenant.to_string();
    record
}

pub fn with_trace(
    mut record: EventRecord,
    trace_id: &str,
    span_id: Option<&str>,
    parent_span_id: Option<&str>,
) -> EventRecord {
    record.trace_id = Some(trace_id.to_string());
    record.span_id = span_id.map(str::to_string);
    record.parent_span_id = parent_span_id.map(str::to_string);
    record
}

/// The database-pool cascade: a db error, a gateway request on trace t1, and
/// a 503 error response whose span is a child of the request's.
pub fn cascade_events() -> Vec<EventRecord> {
    vec![
        with_data(
            event("db", 1_000, "db", "error"),
            &[("message", json!("pool exhausted"))],
        ),
        with_trace(
            event("gw", 1_050, "gateway", "http:request"),
            "t1",
            Some("s1"),
            None,
        ),
        with_data(
            with_trace(
                event("resp", 1_080, "gateway", "error"),
                "t1",
                Some("s2"),
                Some("s1"),
            ),
            &[("status", json!(503))],
        ),
    ]
}

/// `count` error events, `step_ms` apart, starting at ts = 0.
pub fn error_burst(count: usize, step_ms: i64) -> Vec<EventRecord> {
    (0..count)
        .map(|i| {
            with_data(
                event(&format!("err-{i}"), i as i64 * step_ms, "svc", "error"),
                &[("error", json!("boom"))],
            )
        })
        .collect()
}

/// Five request/response pairs spread over [0, 5000], each pair sharing a
/// span so the responses close the requests.
pub fn http_pairs() -> Vec<EventRecord> {
    let mut events = Vec::new();
    for i in 0..5i64 {
        let span = format!("span-{i}");
        events.push(with_trace(
            event(&format!("req-{i}"), i * 1_000, "api", "http:request"),
            "trace-http",
            Some(&span),
            None,
        ));
        events.push(with_trace(
            event(&format!("res-{i}"), i * 1_000 + 400, "api", "http:response"),
            "trace-http",
            Some(&span),
            None,
        ));
    }
    events
}

/// Events split across two tenants at interleaved timestamps.
pub fn multi_tenant_events() -> Vec<EventRecord> {
    vec![
        with_tenant(event("a-1", 1_000, "api", "http:request"), "tenant-a"),
        with_tenant(event("b-1", 1_100, "api", "http:request"), "tenant-b"),
        with_tenant(
            with_data(event("a-2", 1_200, "api", "error"), &[("error", json!("x"))]),
            "tenant-a",
        ),
        with_tenant(event("b-2", 1_300, "api", "http:response"), "tenant-b"),
    ]
}
