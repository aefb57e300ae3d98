//! In-memory outbox, saga, order and dead-letter stores.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use seatline_core::dead_letter::{DeadLetterError, DeadLetterSink, NewDeadLetter};
use seatline_core::order::{InsertOutcome, Order, OrderFuture, OrderRepository, OrderStatus};
use seatline_core::outbox::{OutboxEntry, OutboxError, OutboxFuture, OutboxStore};
use seatline_core::saga::{SagaRecord, SagaStatus, SagaStore, SagaStoreFuture};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct OutboxRow {
    entry: OutboxEntry,
    dead_lettered: bool,
    last_error: Option<String>,
}

/// Vec-backed [`OutboxStore`].
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    rows: Arc<Mutex<Vec<OutboxRow>>>,
}

impl InMemoryOutbox {
    /// An empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows stored, delivered or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no rows are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Every entry, in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.entry.clone())
            .collect()
    }

    /// Entries for one aggregate, in insertion order.
    #[must_use]
    pub fn entries_for(&self, aggregate_id: &str) -> Vec<OutboxEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .collect()
    }

    fn push(&self, entry: &OutboxEntry) {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).push(OutboxRow {
            entry: entry.clone(),
            dead_lettered: false,
            last_error: None,
        });
    }
}

impl OutboxStore for InMemoryOutbox {
    fn append<'a>(&'a self, entry: &'a OutboxEntry) -> OutboxFuture<'a, ()> {
        Box::pin(async move {
            self.push(entry);
            Ok(())
        })
    }

    fn pending(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        Box::pin(async move {
            let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let mut pending: Vec<OutboxEntry> = rows
                .iter()
                .filter(|r| r.entry.processed_at.is_none() && !r.dead_lettered)
                .map(|r| r.entry.clone())
                .collect();
            pending.sort_by_key(|e| e.created_at);
            pending.truncate(limit);
            Ok(pending)
        })
    }

    fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let row = rows
                .iter_mut()
                .find(|r| r.entry.id == id)
                .ok_or(OutboxError::NotFound(id))?;
            row.entry.processed_at = Some(at);
            Ok(())
        })
    }

    fn record_failure<'a>(&'a self, id: Uuid, error: &'a str) -> OutboxFuture<'a, i32> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let row = rows
                .iter_mut()
                .find(|r| r.entry.id == id)
                .ok_or(OutboxError::NotFound(id))?;
            row.entry.retries += 1;
            row.last_error = Some(error.to_string());
            Ok(row.entry.retries)
        })
    }

    fn dead_letter<'a>(&'a self, id: Uuid, reason: &'a str) -> OutboxFuture<'a, ()> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let row = rows
                .iter_mut()
                .find(|r| r.entry.id == id)
                .ok_or(OutboxError::NotFound(id))?;
            row.dead_lettered = true;
            row.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    fn purge_processed(&self, before: DateTime<Utc>) -> OutboxFuture<'_, u64> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            let len = rows.len();
            rows.retain(|r| r.entry.processed_at.is_none_or(|at| at >= before));
            Ok((len - rows.len()) as u64)
        })
    }
}

/// HashMap-backed [`SagaStore`].
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    records: Arc<Mutex<HashMap<Uuid, SagaRecord>>>,
    saves: Arc<Mutex<Vec<SagaStatus>>>,
}

impl InMemorySagaStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status ever saved, in order. Useful for asserting persistence
    /// happened at each transition.
    #[must_use]
    pub fn saved_statuses(&self) -> Vec<SagaStatus> {
        self.saves.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SagaStore for InMemorySagaStore {
    fn save<'a>(&'a self, record: &'a SagaRecord) -> SagaStoreFuture<'a, ()> {
        Box::pin(async move {
            self.saves.lock().unwrap_or_else(PoisonError::into_inner).push(record.status);
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(record.saga_id, record.clone());
            Ok(())
        })
    }

    fn load(&self, saga_id: Uuid) -> SagaStoreFuture<'_, Option<SagaRecord>> {
        Box::pin(async move { Ok(self.records.lock().unwrap_or_else(PoisonError::into_inner).get(&saga_id).cloned()) })
    }

    fn list_by_status<'a>(
        &'a self,
        statuses: &'a [SagaStatus],
    ) -> SagaStoreFuture<'a, Vec<SagaRecord>> {
        Box::pin(async move {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let mut found: Vec<SagaRecord> = records
                .values()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect();
            found.sort_by_key(|r| r.created_at);
            Ok(found)
        })
    }
}

/// [`OrderRepository`] that appends events to a shared [`InMemoryOutbox`]
/// under the same lock as the order write.
#[derive(Clone)]
pub struct InMemoryOrders {
    orders: Arc<Mutex<HashMap<Uuid, Order>>>,
    outbox: Arc<InMemoryOutbox>,
}

impl InMemoryOrders {
    /// Orders whose events land in `outbox`.
    #[must_use]
    pub fn new(outbox: Arc<InMemoryOutbox>) -> Self {
        Self {
            orders: Arc::new(Mutex::new(HashMap::new())),
            outbox,
        }
    }

    /// Orders stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no orders are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl OrderRepository for InMemoryOrders {
    fn insert<'a>(
        &'a self,
        order: &'a Order,
        event: &'a OutboxEntry,
    ) -> OrderFuture<'a, InsertOutcome> {
        Box::pin(async move {
            let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = &order.idempotency_key {
                let existing = orders.values().find(|o| {
                    o.organization_id == order.organization_id
                        && o.idempotency_key.as_ref() == Some(key)
                });
                if let Some(existing) = existing {
                    return Ok(InsertOutcome::Duplicate(Box::new(existing.clone())));
                }
            }
            orders.insert(order.id, order.clone());
            self.outbox.push(event);
            Ok(InsertOutcome::Inserted)
        })
    }

    fn update<'a>(
        &'a self,
        order: &'a Order,
        event: Option<&'a OutboxEntry>,
    ) -> OrderFuture<'a, ()> {
        Box::pin(async move {
            let mut orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
            orders.insert(order.id, order.clone());
            if let Some(event) = event {
                self.outbox.push(event);
            }
            Ok(())
        })
    }

    fn get(&self, order_id: Uuid) -> OrderFuture<'_, Option<Order>> {
        Box::pin(async move { Ok(self.orders.lock().unwrap_or_else(PoisonError::into_inner).get(&order_id).cloned()) })
    }

    fn find_by_idempotency_key<'a>(
        &'a self,
        organization_id: &'a str,
        key: &'a str,
    ) -> OrderFuture<'a, Option<Order>> {
        Box::pin(async move {
            Ok(self
                .orders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .find(|o| {
                    o.organization_id == organization_id
                        && o.idempotency_key.as_deref() == Some(key)
                })
                .cloned())
        })
    }

    fn expired_pending(&self, now: DateTime<Utc>, limit: usize) -> OrderFuture<'_, Vec<Order>> {
        Box::pin(async move {
            let orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
            let mut expired: Vec<Order> = orders
                .values()
                .filter(|o| o.status == OrderStatus::Pending && o.expires_at <= now)
                .cloned()
                .collect();
            expired.sort_by_key(|o| o.expires_at);
            expired.truncate(limit);
            Ok(expired)
        })
    }

    fn list_for_user<'a>(
        &'a self,
        organization_id: &'a str,
        user_id: &'a str,
        limit: usize,
        offset: usize,
    ) -> OrderFuture<'a, Vec<Order>> {
        Box::pin(async move {
            let orders = self.orders.lock().unwrap_or_else(PoisonError::into_inner);
            let mut mine: Vec<Order> = orders
                .values()
                .filter(|o| o.organization_id == organization_id && o.user_id == user_id)
                .cloned()
                .collect();
            mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(mine.into_iter().skip(offset).take(limit).collect())
        })
    }
}

/// Vec-backed [`DeadLetterSink`].
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<NewDeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Letters recorded so far.
    #[must_use]
    pub fn letters(&self) -> Vec<NewDeadLetter> {
        self.letters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn record<'a>(
        &'a self,
        letter: &'a NewDeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + 'a>> {
        Box::pin(async move {
            let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
            letters.push(letter.clone());
            Ok(i64::try_from(letters.len()).unwrap_or(i64::MAX))
        })
    }
}
