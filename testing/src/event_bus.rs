//! In-memory event bus.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use futures::stream::{self, StreamExt};
use seatline_core::event::EventEnvelope;
use seatline_core::event_bus::{EventBus, EventBusError, EventStream};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Broadcast-channel [`EventBus`]. Every subscriber sees every event published
/// after it subscribed, like a per-node consumer group starting at the tail.
#[derive(Clone)]
pub struct InMemoryEventBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>>,
    published: Arc<Mutex<Vec<(String, EventEnvelope)>>>,
    failing: Arc<AtomicBool>,
    poisoned: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryEventBus {
    /// An empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            published: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
            poisoned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Make `publish` fail until switched back.
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make `publish` fail for events of `aggregate_id` only.
    pub fn fail_aggregate(&self, aggregate_id: &str) {
        self.poisoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(aggregate_id.to_string());
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Published envelopes on `topic`.
    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<EventEnvelope> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        event: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            let poisoned = self
                .poisoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&event.aggregate_id);
            if poisoned || self.failing.load(Ordering::SeqCst) {
                return Err(EventBusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic.to_string(), event.clone()));
            let _ = self.sender(topic).send(event.clone());
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let receivers: Vec<_> = topics.iter().map(|t| self.sender(t).subscribe()).collect();
        Box::pin(async move {
            let streams = receivers.into_iter().map(|mut receiver| {
                Box::pin(async_stream::stream! {
                    loop {
                        match receiver.recv().await {
                            Ok(event) => yield Ok::<_, EventBusError>(event),
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                })
            });
            Ok(stream::select_all(streams).boxed())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe(&["t"]).await.unwrap();
        let mut b = bus.subscribe(&["t"]).await.unwrap();

        let event = EventEnvelope::new("x.happened", "agg-1", chrono::Utc::now(), json!({}));
        bus.publish("t", &event).await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap().id, event.id);
        assert_eq!(b.next().await.unwrap().unwrap().id, event.id);
    }

    #[tokio::test]
    async fn test_failing_publish_records_nothing() {
        let bus = InMemoryEventBus::new();
        bus.fail_publishes(true);
        let event = EventEnvelope::new("x.happened", "agg-1", chrono::Utc::now(), json!({}));
        assert!(bus.publish("t", &event).await.is_err());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_failing_aggregate_spares_others() {
        let bus = InMemoryEventBus::new();
        bus.fail_aggregate("agg-1");
        let stuck = EventEnvelope::new("x.happened", "agg-1", chrono::Utc::now(), json!({}));
        let fine = EventEnvelope::new("x.happened", "agg-2", chrono::Utc::now(), json!({}));

        assert!(bus.publish("t", &stuck).await.is_err());
        bus.publish("t", &fine).await.unwrap();
        assert_eq!(bus.published_on("t").len(), 1);
    }
}
