//! Bounded LRU map with per-entry expiry.
//!
//! Entries live in a slab of nodes linked into a recency list, with a hash
//! index from key to slot, so `get` and `put` are O(1). Expiry is checked
//! lazily on access.

use chrono::{DateTime, Utc};
use seatline_core::cache::glob_match;
use std::collections::HashMap;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: String,
    value: String,
    expires_at: DateTime<Utc>,
    prev: usize,
    next: usize,
}

/// Least-recently-used string cache.
#[derive(Debug)]
pub struct LruCache {
    capacity: usize,
    index: HashMap<String, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruCache {
    /// An empty cache holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Number of stored entries, expired ones included until touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Value for `key` if present and unexpired at `now`; marks it most recent.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let slot = *self.index.get(key)?;
        if self.nodes[slot].expires_at <= now {
            self.remove_slot(slot);
            return None;
        }
        self.unlink(slot);
        self.push_front(slot);
        Some(self.nodes[slot].value.clone())
    }

    /// Insert or replace `key`, evicting the least recent entry when full.
    pub fn put(&mut self, key: &str, value: String, expires_at: DateTime<Utc>) {
        if let Some(&slot) = self.index.get(key) {
            let node = &mut self.nodes[slot];
            node.value = value;
            node.expires_at = expires_at;
            self.unlink(slot);
            self.push_front(slot);
            return;
        }

        if self.index.len() >= self.capacity && self.tail != NIL {
            self.remove_slot(self.tail);
        }

        let node = Node {
            key: key.to_string(),
            value,
            expires_at,
            prev: NIL,
            next: NIL,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };
        self.index.insert(key.to_string(), slot);
        self.push_front(slot);
    }

    /// Remove `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&slot) => {
                self.remove_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Remove every key matching a glob pattern. Walks the whole index.
    pub fn remove_matching(&mut self, pattern: &str) -> usize {
        let slots: Vec<usize> = self
            .index
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(_, &slot)| slot)
            .collect();
        for &slot in &slots {
            self.remove_slot(slot);
        }
        slots.len()
    }

    fn remove_slot(&mut self, slot: usize) {
        self.unlink(slot);
        let key = std::mem::take(&mut self.nodes[slot].key);
        self.nodes[slot].value.clear();
        self.index.remove(&key);
        self.free.push(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev == NIL {
            if self.head == slot {
                self.head = next;
            }
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            if self.tail == slot {
                self.tail = prev;
            }
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use seatline_core::environment::Clock;
    use seatline_testing::test_clock;

    fn later(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(60)
    }

    #[test]
    fn test_get_after_put() {
        let now = test_clock().now();
        let mut cache = LruCache::new(4);
        cache.put("a", "1".to_string(), later(now));
        assert_eq!(cache.get("a", now).as_deref(), Some("1"));
        assert_eq!(cache.get("b", now), None);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let now = test_clock().now();
        let mut cache = LruCache::new(2);
        cache.put("a", "1".to_string(), later(now));
        cache.put("b", "2".to_string(), later(now));
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a", now).is_some());
        cache.put("c", "3".to_string(), later(now));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("b", now).is_none());
        assert!(cache.get("a", now).is_some());
        assert!(cache.get("c", now).is_some());
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let now = test_clock().now();
        let mut cache = LruCache::new(2);
        cache.put("a", "1".to_string(), later(now));
        cache.put("a", "2".to_string(), later(now));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a", now).as_deref(), Some("2"));
    }

    #[test]
    fn test_expired_entry_is_dropped_on_read() {
        let now = test_clock().now();
        let mut cache = LruCache::new(2);
        cache.put("a", "1".to_string(), now + Duration::seconds(5));
        assert!(cache.get("a", now + Duration::seconds(5)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_matching_glob() {
        let now = test_clock().now();
        let mut cache = LruCache::new(8);
        cache.put("seatmap:org-1:t1", "x".to_string(), later(now));
        cache.put("seatmap:org-1:t2", "x".to_string(), later(now));
        cache.put("seatmap:org-2:t1", "x".to_string(), later(now));

        assert_eq!(cache.remove_matching("seatmap:org-1:*"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("seatmap:org-2:t1", now).is_some());
    }

    #[test]
    fn test_slots_are_reused_after_removal() {
        let now = test_clock().now();
        let mut cache = LruCache::new(2);
        for i in 0..100 {
            cache.put(&format!("k{i}"), i.to_string(), later(now));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.nodes.len() <= 3);
        assert_eq!(cache.get("k99", now).as_deref(), Some("99"));
        assert_eq!(cache.get("k98", now).as_deref(), Some("98"));
    }
}
