//! Live seat updates for connected clients.
//!
//! Every node consumes the inventory topic under its own consumer group, so
//! each node sees every event. [`FanoutManager`] keeps the node's client
//! streams per trip; the broadcaster hands each event to every stream of its
//! trip without waiting. A stream whose buffer is full loses the message;
//! clients resynchronise from the seat map when they reconnect.

mod broadcaster;

pub use broadcaster::{FanoutBroadcaster, REALTIME_GROUP_PREFIX};

use futures::Stream;
use seatline_runtime::metrics::FanoutMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Messages buffered per client stream.
pub const SUBSCRIBER_BUFFER: usize = 10;

/// One SSE frame: `{"type": EVENT_TYPE, "data": PAYLOAD}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: serde_json::Value,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<LiveUpdate>,
}

/// Client streams of this node, by trip.
#[derive(Default)]
pub struct FanoutManager {
    trips: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl FanoutManager {
    /// An empty manager.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a stream of updates for `trip_id`. Dropping it unsubscribes.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, trip_id: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.trips
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(trip_id.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        tracing::debug!(trip_id, subscriber = id, "Live subscriber joined");

        Subscription {
            manager: Arc::clone(self),
            trip_id: trip_id.to_string(),
            id,
            receiver,
        }
    }

    /// Hand `update` to every stream of `trip_id` without blocking. Returns
    /// the number of streams that accepted it.
    pub fn broadcast(&self, trip_id: &str, update: &LiveUpdate) -> usize {
        let trips = self.trips.read().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = trips.get(trip_id) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            match subscriber.sender.try_send(update.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    FanoutMetrics::record_dropped();
                    tracing::debug!(trip_id, subscriber = subscriber.id, "Slow subscriber, dropped update");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Streams open for `trip_id`.
    #[must_use]
    pub fn subscriber_count(&self, trip_id: &str) -> usize {
        self.trips
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trip_id)
            .map_or(0, Vec::len)
    }

    fn unsubscribe(&self, trip_id: &str, id: u64) {
        let mut trips = self.trips.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = trips.get_mut(trip_id) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                trips.remove(trip_id);
            }
        }
        tracing::debug!(trip_id, subscriber = id, "Live subscriber left");
    }
}

/// A client's update stream.
pub struct Subscription {
    manager: Arc<FanoutManager>,
    trip_id: String,
    id: u64,
    receiver: mpsc::Receiver<LiveUpdate>,
}

impl Subscription {
    /// Trip watched.
    #[must_use]
    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }
}

impl Stream for Subscription {
    type Item = LiveUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.trip_id, self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn update(n: u64) -> LiveUpdate {
        LiveUpdate {
            event_type: "inventory.seats_held".into(),
            data: json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_trip_subscribers_only() {
        let manager = FanoutManager::new();
        let mut t1 = manager.subscribe("T1");
        let mut t1_again = manager.subscribe("T1");
        let t2 = manager.subscribe("T2");

        assert_eq!(manager.broadcast("T1", &update(1)), 2);
        assert_eq!(t1.next().await.unwrap(), update(1));
        assert_eq!(t1_again.next().await.unwrap(), update(1));
        assert_eq!(manager.subscriber_count("T2"), 1);
        drop(t2);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let manager = FanoutManager::new();
        let mut slow = manager.subscribe("T1");

        for n in 0..(SUBSCRIBER_BUFFER as u64 + 5) {
            manager.broadcast("T1", &update(n));
        }
        for n in 0..SUBSCRIBER_BUFFER as u64 {
            assert_eq!(slow.next().await.unwrap(), update(n));
        }
        assert_eq!(manager.broadcast("T1", &update(99)), 1);
        assert_eq!(slow.next().await.unwrap(), update(99));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let manager = FanoutManager::new();
        let sub = manager.subscribe("T1");
        assert_eq!(manager.subscriber_count("T1"), 1);
        drop(sub);
        assert_eq!(manager.subscriber_count("T1"), 0);
        assert_eq!(manager.broadcast("T1", &update(1)), 0);
    }
}
