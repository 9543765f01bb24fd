//! Telemetry feed: parameter values and container occurrences
//!
//! Subscribers hand over an unbounded sender; delivery never blocks the
//! publisher, and each lifecycle task drains its own receiver.

use cmdflow_core::{current_timestamp_ms, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A time-stamped parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    /// Qualified parameter name
    pub name: String,
    /// Engineering value
    pub value: Value,
    /// Generation time (Unix epoch milliseconds)
    pub generation_time_ms: u64,
}

/// An observed telemetry container (packet) with its decoded fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerOccurrence {
    /// Qualified container name
    pub name: String,
    /// Decoded entries
    pub fields: BTreeMap<String, Value>,
    /// Generation time (Unix epoch milliseconds)
    pub generation_time_ms: u64,
}

/// Something delivered by the telemetry feed
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Parameter update
    Parameter(ParameterValue),
    /// Container occurrence
    Container(ContainerOccurrence),
}

impl TelemetryEvent {
    /// Subscription key the event is routed by
    pub fn key(&self) -> TelemetryKey {
        match self {
            TelemetryEvent::Parameter(p) => TelemetryKey::Parameter(p.name.clone()),
            TelemetryEvent::Container(c) => TelemetryKey::Container(c.name.clone()),
        }
    }
}

/// Subscription key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TelemetryKey {
    /// Parameter by qualified name
    Parameter(String),
    /// Container by qualified name
    Container(String),
}

/// Subscription handle
pub type SubscriptionId = u64;

/// Subscribe/unsubscribe interface of the telemetry collaborator
pub trait TelemetryFeed: Send + Sync {
    /// Deliver every future event matching one of `keys` to `sink`
    fn subscribe(
        &self,
        keys: Vec<TelemetryKey>,
        sink: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> SubscriptionId;

    /// Stop a subscription; unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId);

    /// Most recent value of a parameter, if any was ever received
    fn last_value(&self, parameter: &str) -> Option<ParameterValue>;
}

/// Unsubscribes from the feed when dropped
pub struct SubscriptionGuard {
    feed: Arc<dyn TelemetryFeed>,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    /// Subscribe and tie the subscription to the returned guard
    pub fn subscribe(
        feed: Arc<dyn TelemetryFeed>,
        keys: Vec<TelemetryKey>,
        sink: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        let id = feed.subscribe(keys, sink);
        Self { feed, id }
    }

    /// Subscription id
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.feed.unsubscribe(self.id);
    }
}

struct BusSubscriber {
    keys: HashSet<TelemetryKey>,
    sink: mpsc::UnboundedSender<TelemetryEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<SubscriptionId, BusSubscriber>,
    last_values: HashMap<String, ParameterValue>,
    next_id: SubscriptionId,
}

/// In-process telemetry bus with a parameter last-value cache
#[derive(Default)]
pub struct TelemetryBus {
    inner: RwLock<BusInner>,
}

impl TelemetryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to every matching subscriber
    pub fn publish(&self, event: TelemetryEvent) {
        let key = event.key();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let TelemetryEvent::Parameter(p) = &event {
            inner.last_values.insert(p.name.clone(), p.clone());
        }

        let mut closed = Vec::new();
        for (id, sub) in &inner.subscribers {
            if sub.keys.contains(&key) && sub.sink.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            debug!(subscription = id, "Removing closed telemetry subscription");
            inner.subscribers.remove(&id);
        }
        trace!(key = ?key, "Telemetry event published");
    }

    /// Publish a parameter value stamped with the current time
    pub fn publish_parameter(&self, name: impl Into<String>, value: Value) {
        self.publish(TelemetryEvent::Parameter(ParameterValue {
            name: name.into(),
            value,
            generation_time_ms: current_timestamp_ms(),
        }));
    }

    /// Publish a container occurrence stamped with the current time
    pub fn publish_container(&self, name: impl Into<String>, fields: BTreeMap<String, Value>) {
        self.publish(TelemetryEvent::Container(ContainerOccurrence {
            name: name.into(),
            fields,
            generation_time_ms: current_timestamp_ms(),
        }));
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

impl TelemetryFeed for TelemetryBus {
    fn subscribe(
        &self,
        keys: Vec<TelemetryKey>,
        sink: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> SubscriptionId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(
            id,
            BusSubscriber {
                keys: keys.into_iter().collect(),
                sink,
            },
        );
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .remove(&id);
    }

    fn last_value(&self, parameter: &str) -> Option<ParameterValue> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_values
            .get(parameter)
            .cloned()
    }
}
