//! In-memory shared cache.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use seatline_core::cache::{
    CacheError, CacheFuture, MessageStream, SharedCache, Tally, glob_match,
};
use seatline_core::environment::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// HashMap-backed [`SharedCache`] whose expiry follows an injected [`Clock`].
///
/// ```
/// use seatline_testing::InMemoryCache;
/// use seatline_core::cache::SharedCache;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = InMemoryCache::new();
/// assert!(cache.set_nx("lock", "me", Duration::from_secs(10)).await?);
/// assert!(!cache.set_nx("lock", "you", Duration::from_secs(10)).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    /// A cache on wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A cache whose TTLs are measured on `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every operation fail with [`CacheError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Live keys, unordered.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, e)| e.expires_at.is_none_or(|at| at > now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Live value under `key`, bypassing the failure switch.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .map(|e| e.value.clone())
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    fn live(&self, entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let now = self.clock.now();
        if entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now))
        {
            entries.remove(key);
        }
        entries.get(key).map(|e| e.value.clone())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedCache for InMemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(self.live(&mut entries, key))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: self.expiry(ttl),
                },
            );
            Ok(())
        })
    }

    fn set_nx<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if self.live(&mut entries, key).is_some() {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: self.expiry(ttl),
                },
            );
            Ok(true)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let existed = self.live(&mut entries, key).is_some();
            entries.remove(key);
            Ok(existed)
        })
    }

    fn delete_if_equals<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if self.live(&mut entries, key).as_deref() == Some(expected) {
                entries.remove(key);
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    fn scan_keys<'a>(&'a self, pattern: &'a str) -> CacheFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check()?;
            let mut keys: Vec<String> = self
                .keys()
                .into_iter()
                .filter(|k| glob_match(pattern, k))
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn check_and_increment<'a>(&'a self, tallies: &'a [Tally]) -> CacheFuture<'a, Option<usize>> {
        Box::pin(async move {
            self.check()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

            let mut current = Vec::with_capacity(tallies.len());
            for (index, tally) in tallies.iter().enumerate() {
                let count = self
                    .live(&mut entries, &tally.key)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                if count + tally.increment > tally.limit {
                    return Ok(Some(index));
                }
                current.push(count);
            }

            for (tally, count) in tallies.iter().zip(current) {
                let expires_at = entries
                    .get(&tally.key)
                    .and_then(|e| e.expires_at)
                    .or_else(|| self.expiry(tally.ttl));
                entries.insert(
                    tally.key.clone(),
                    Entry {
                        value: (count + tally.increment).to_string(),
                        expires_at,
                    },
                );
            }
            Ok(None)
        })
    }

    fn decrement<'a>(&'a self, key: &'a str, by: i64) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if self.live(&mut entries, key).is_none() {
                return Ok(());
            }
            if let Some(entry) = entries.get_mut(key) {
                let count = entry.value.parse::<i64>().unwrap_or(0);
                entry.value = (count - by).max(0).to_string();
            }
            Ok(())
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            if let Some(sender) = self.channels.lock().unwrap_or_else(PoisonError::into_inner).get(channel) {
                let _ = sender.send(message.to_string());
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> CacheFuture<'a, MessageStream> {
        Box::pin(async move {
            self.check()?;
            let mut receiver = self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe();

            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(message) => yield message,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::MockClock;
    use futures::StreamExt;

    fn tally(key: &str, limit: i64) -> Tally {
        Tally {
            key: key.to_string(),
            increment: 1,
            limit,
            ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_values_expire_on_the_injected_clock() {
        let clock = MockClock::at_test_epoch();
        let cache = InMemoryCache::with_clock(Arc::new(clock.clone()));

        cache.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_and_increment_is_all_or_nothing() {
        let cache = InMemoryCache::new();
        let batch = [tally("a", 2), tally("b", 1)];

        assert_eq!(cache.check_and_increment(&batch).await.unwrap(), None);
        assert_eq!(cache.check_and_increment(&batch).await.unwrap(), Some(1));
        assert_eq!(cache.peek("a").as_deref(), Some("1"));
        assert_eq!(cache.peek("b").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let cache = InMemoryCache::new();
        cache.check_and_increment(&[tally("a", 5)]).await.unwrap();
        cache.decrement("a", 3).await.unwrap();
        assert_eq!(cache.peek("a").as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_delete_if_equals_only_removes_own_value() {
        let cache = InMemoryCache::new();
        cache.set("lock", "mine", Duration::from_secs(10)).await.unwrap();
        assert!(!cache.delete_if_equals("lock", "theirs").await.unwrap());
        assert!(cache.delete_if_equals("lock", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_matches_glob() {
        let cache = InMemoryCache::new();
        for key in ["seatmap:o:t1", "seatmap:o:t2", "hold:o:1"] {
            cache.set(key, "x", Duration::from_secs(10)).await.unwrap();
        }
        assert_eq!(
            cache.scan_keys("seatmap:*").await.unwrap(),
            vec!["seatmap:o:t1", "seatmap:o:t2"]
        );
    }

    #[tokio::test]
    async fn test_pubsub_delivers_to_subscribers() {
        let cache = InMemoryCache::new();
        let mut stream = cache.subscribe("chan").await.unwrap();
        cache.publish("chan", "org-1").await.unwrap();
        assert_eq!(stream.next().await.as_deref(), Some("org-1"));
    }

    #[tokio::test]
    async fn test_failure_switch_fails_every_call() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::Unavailable(_))
        ));
    }
}
