//! Outbox relay: moves committed outbox entries onto the event bus.
//!
//! Delivery is at-least-once. An entry is marked processed only after the bus
//! acknowledged it, so a crash between publish and mark republishes the same
//! event id and consumers deduplicate on it. Entries that keep failing are
//! parked in the dead-letter queue once their retry count exceeds the limit.

use crate::metrics::OutboxMetrics;
use chrono::Duration as ChronoDuration;
use seatline_core::dead_letter::{DeadLetterSink, DeadLetterSource, NewDeadLetter};
use seatline_core::environment::Clock;
use seatline_core::event_bus::EventBus;
use seatline_core::outbox::{OutboxEntry, OutboxError, OutboxStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Entries fetched per poll.
    pub batch_size: usize,
    /// Failed attempts tolerated before an entry is dead-lettered.
    pub max_retries: i32,
    /// How long delivered entries are kept.
    pub retention: Duration,
    /// Pause between purges of delivered entries.
    pub purge_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 100,
            max_retries: 10,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Entries delivered.
    pub published: usize,
    /// Entries whose publish failed this round.
    pub failed: usize,
    /// Entries moved to the dead-letter queue.
    pub dead_lettered: usize,
}

/// Polls the outbox and publishes pending entries in creation order.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    config: RelayConfig,
}

impl OutboxRelay {
    /// A relay over `store` publishing to `bus`.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            dead_letters: None,
            config,
        }
    }

    /// Also record dead-lettered entries in `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Publish one batch of pending entries.
    ///
    /// A failed publish holds back the rest of its aggregate for this batch so
    /// later entries cannot overtake it; other aggregates carry on.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the store cannot be read or updated.
    pub async fn run_once(&self) -> Result<RelayReport, OutboxError> {
        let mut report = RelayReport::default();
        let entries = self.store.pending(self.config.batch_size).await?;
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            if blocked.contains(&entry.aggregate_id) {
                continue;
            }
            if entry.retries > self.config.max_retries {
                self.park(&entry).await?;
                report.dead_lettered += 1;
                continue;
            }

            let envelope = entry.to_envelope();
            match self.bus.publish(&entry.topic, &envelope).await {
                Ok(()) => {
                    self.store.mark_processed(entry.id, self.clock.now()).await?;
                    OutboxMetrics::record_published(&entry.topic);
                    tracing::debug!(
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        topic = %entry.topic,
                        "Outbox entry published"
                    );
                    report.published += 1;
                }
                Err(e) => {
                    let retries = self.store.record_failure(entry.id, &e.to_string()).await?;
                    OutboxMetrics::record_failure(&entry.topic);
                    tracing::warn!(
                        event_id = %entry.id,
                        topic = %entry.topic,
                        retries,
                        error = %e,
                        "Outbox publish failed"
                    );
                    report.failed += 1;
                    blocked.insert(entry.aggregate_id.clone());
                }
            }
        }

        Ok(report)
    }

    /// Delete delivered entries older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on store failure.
    pub async fn purge(&self) -> Result<u64, OutboxError> {
        let retention = ChronoDuration::from_std(self.config.retention)
            .unwrap_or_else(|_| ChronoDuration::days(7));
        let deleted = self.store.purge_processed(self.clock.now() - retention).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Purged delivered outbox entries");
        }
        Ok(deleted)
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut purge = tokio::time::interval(self.config.purge_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Outbox relay poll failed");
                    }
                }
                _ = purge.tick() => {
                    if let Err(e) = self.purge().await {
                        tracing::error!(error = %e, "Outbox purge failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    async fn park(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let reason = format!("exceeded {} publish attempts", self.config.max_retries);

        if let Some(sink) = &self.dead_letters {
            let letter = NewDeadLetter {
                source: DeadLetterSource::Outbox,
                reference_id: entry.id.to_string(),
                subject: entry.event_type.clone(),
                payload: entry.payload.clone(),
                error: reason.clone(),
                retry_count: entry.retries,
            };
            sink.record(&letter)
                .await
                .map_err(|e| OutboxError::Database(e.to_string()))?;
        }

        self.store.dead_letter(entry.id, &reason).await?;
        OutboxMetrics::record_dead_lettered();
        tracing::error!(
            event_id = %entry.id,
            event_type = %entry.event_type,
            retries = entry.retries,
            "Outbox entry dead-lettered"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use seatline_core::event::topics;
    use seatline_testing::mocks::test_clock;
    use seatline_testing::{InMemoryDeadLetters, InMemoryEventBus, InMemoryOutbox};
    use serde_json::json;

    fn entry(aggregate: &str, n: i64) -> OutboxEntry {
        OutboxEntry::new(
            topics::ORDERS,
            "order.created",
            aggregate,
            json!({ "n": n }),
            chrono::Utc::now() + ChronoDuration::milliseconds(n),
        )
    }

    fn relay(
        store: Arc<InMemoryOutbox>,
        bus: Arc<InMemoryEventBus>,
        max_retries: i32,
    ) -> OutboxRelay {
        OutboxRelay::new(
            store,
            bus,
            Arc::new(test_clock()),
            RelayConfig {
                max_retries,
                ..RelayConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_publishes_in_creation_order_and_marks_processed() {
        let store = Arc::new(InMemoryOutbox::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let mut stream = bus.subscribe(&[topics::ORDERS]).await.unwrap();

        let first = entry("order-1", 1);
        let second = entry("order-1", 2);
        store.append(&second).await.unwrap();
        store.append(&first).await.unwrap();

        let report = relay(Arc::clone(&store), Arc::clone(&bus), 10)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.published, 2);
        assert_eq!(stream.next().await.unwrap().unwrap().id, first.id);
        assert_eq!(stream.next().await.unwrap().unwrap().id, second.id);
        assert!(store.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_counts_retry_and_stays_pending() {
        let store = Arc::new(InMemoryOutbox::new());
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_publishes(true);

        let e = entry("order-1", 1);
        store.append(&e).await.unwrap();

        let report = relay(Arc::clone(&store), Arc::clone(&bus), 10)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retries, 1);
    }

    #[tokio::test]
    async fn test_failing_aggregate_does_not_hold_back_others() {
        let store = Arc::new(InMemoryOutbox::new());
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_aggregate("order-A");

        let stuck = entry("order-A", 1);
        let behind_stuck = entry("order-A", 2);
        let healthy = entry("order-B", 3);
        store.append(&stuck).await.unwrap();
        store.append(&behind_stuck).await.unwrap();
        store.append(&healthy).await.unwrap();

        let report = relay(Arc::clone(&store), Arc::clone(&bus), 10)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.failed, 1);
        let delivered = bus.published_on(topics::ORDERS);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, healthy.id);

        // The entry queued behind the failure keeps its place and its retry count.
        let pending = store.pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, stuck.id);
        assert_eq!(pending[0].retries, 1);
        assert_eq!(pending[1].id, behind_stuck.id);
        assert_eq!(pending[1].retries, 0);
    }

    #[tokio::test]
    async fn test_entries_past_retry_limit_are_dead_lettered() {
        let store = Arc::new(InMemoryOutbox::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let dlq = Arc::new(InMemoryDeadLetters::new());

        let mut e = entry("order-1", 1);
        e.retries = 3;
        store.append(&e).await.unwrap();

        let report = relay(Arc::clone(&store), bus, 2)
            .with_dead_letter_sink(Arc::clone(&dlq) as Arc<dyn DeadLetterSink>)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert!(store.pending(10).await.unwrap().is_empty());
        let letters = dlq.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reference_id, e.id.to_string());
        assert_eq!(letters[0].source, DeadLetterSource::Outbox);
    }

    #[tokio::test]
    async fn test_purge_drops_only_old_delivered_entries() {
        let store = Arc::new(InMemoryOutbox::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let clock = test_clock();

        let old = entry("order-1", 1);
        let fresh = entry("order-2", 2);
        store.append(&old).await.unwrap();
        store.append(&fresh).await.unwrap();
        store
            .mark_processed(old.id, clock.now() - ChronoDuration::days(8))
            .await
            .unwrap();
        store.mark_processed(fresh.id, clock.now()).await.unwrap();

        let deleted = relay(Arc::clone(&store), bus, 10).purge().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.len(), 1);
    }
}
