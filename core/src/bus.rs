use crate::anomaly::AnomalyClass;
use crate::event::{EdgeKind, EventNode};
use crate::pattern::Pattern;
use crossbeam::channel::{bounded, Receiver};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;

/// Capacity of channel-backed subscriptions; messages beyond it are dropped.
const CHANNEL_CAPACITY: usize = 1_024;

/// The four statically enumerated topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    EventProcessed,
    CausalityDetected,
    PatternMatched,
    AnomalyDetected,
}

/// Published payloads. Each carries a snapshot taken after the relevant
/// state mutation became visible.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusMessage {
    EventProcessed {
        node: EventNode,
    },
    CausalityDetected {
        cause_id: String,
        effect_id: String,
        confidence: f64,
        #[serde(rename = "type")]
        kind: EdgeKind,
    },
    PatternMatched {
        node: EventNode,
        pattern: Pattern,
    },
    AnomalyDetected {
        node: EventNode,
        score: f64,
        classification: AnomalyClass,
    },
}

impl BusMessage {
    pub fn topic(&self) -> Topic {
        match self {
            BusMessage::EventProcessed { .. } => Topic::EventProcessed,
            BusMessage::CausalityDetected { .. } => Topic::CausalityDetected,
            BusMessage::PatternMatched { .. } => Topic::PatternMatched,
            BusMessage::AnomalyDetected { .. } => Topic::AnomalyDetected,
        }
    }
}

type Subscriber = Box<dyn Fn(&BusMessage) + Send + Sync>;

/// In-process publish/subscribe hub.
///
/// Subscribers run synchronously on the publishing thread; back-pressure is
/// their problem. A panicking subscriber is logged and skipped so the bus
/// never takes the engine down.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(Topic, Subscriber)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one topic. Intended to be called once per
    /// subscriber at construction time, before ingest begins.
    pub fn subscribe<F>(&self, topic: Topic, callback: F)
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .expect("bus subscriber registry poisoned")
            .push((topic, Box::new(callback)));
    }

    /// Channel-backed subscription for hosts and tests that prefer to drain
    /// messages instead of registering callbacks. Messages are dropped when
    /// the channel is full or disconnected.
    pub fn channel_subscriber(&self, topic: Topic) -> Receiver<BusMessage> {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        self.subscribe(topic, move |message: &BusMessage| {
            if let Err(e) = sender.try_send(message.clone()) {
                tracing::warn!("bus channel subscriber lagging, dropping message: {}", e);
            }
        });
        receiver
    }

    pub fn publish(&self, message: BusMessage) {
        let topic = message.topic();
        let subscribers = self
            .subscribers
            .read()
            .expect("bus subscriber registry poisoned");

        for (subscribed_topic, callback) in subscribers.iter() {
            if *subscribed_topic != topic {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(&message))).is_err() {
                tracing::error!(?topic, "bus subscriber panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn node(id: &str) -> EventNode {
        EventNode::new(EventRecord {
            event_id: id.to_string(),
            timestamp: 1,
            service_id: "svc".to_string(),
            service_name: None,
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            event_type: "custom".to_string(),
            data: HashMap::new(),
            metadata: HashMap::new(),
            tenant_id: "default".to_string(),
        })
    }

    #[test]
    fn test_publish_reaches_matching_topic_only() {
        let bus = EventBus::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let anomalies = Arc::new(AtomicUsize::new(0));

        let counter = processed.clone();
        bus.subscribe(Topic::EventProcessed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = anomalies.clone();
        bus.subscribe(Topic::AnomalyDetected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(BusMessage::EventProcessed { node: node("a") });
        bus.publish(BusMessage::EventProcessed { node: node("b") });

        assert_eq!(processed.load(Ordering::SeqCst), 2);
        assert_eq!(anomalies.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_channel_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let receiver = bus.channel_subscriber(Topic::CausalityDetected);

        bus.publish(BusMessage::CausalityDetected {
            cause_id: "a".to_string(),
            effect_id: "b".to_string(),
            confidence: 0.9,
            kind: EdgeKind::Trace,
        });
        bus.publish(BusMessage::CausalityDetected {
            cause_id: "b".to_string(),
            effect_id: "c".to_string(),
            confidence: 0.8,
            kind: EdgeKind::Temporal,
        });

        let first = receiver.try_recv().unwrap();
        let second = receiver.try_recv().unwrap();
        match (first, second) {
            (
                BusMessage::CausalityDetected { cause_id: c1, .. },
                BusMessage::CausalityDetected { cause_id: c2, .. },
            ) => {
                assert_eq!(c1, "a");
                assert_eq!(c2, "b");
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[test]
    fn test_causality_payload_serializes_type_field() {
        let message = BusMessage::CausalityDetected {
            cause_id: "a".to_string(),
            effect_id: "b".to_string(),
            confidence: 0.9,
            kind: EdgeKind::Trace,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "trace");
        assert_eq!(value["cause_id"], "a");
        assert_eq!(value["effect_id"], "b");
    }

    #[test]
    fn test_panicking_subscriber_does_not_poison_the_bus() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Topic::EventProcessed, |_| panic!("bad subscriber"));
        let counter = delivered.clone();
        bus.subscribe(Topic::EventProcessed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(BusMessage::EventProcessed { node: node("a") });
        bus.publish(BusMessage::EventProcessed { node: node("b") });

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }
}
