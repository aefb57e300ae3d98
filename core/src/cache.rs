//! Shared (cross-process) cache abstraction.
//!
//! The shared cache backs pre-locks, the seat-map cache, ticket tallies, hold
//! metadata, idempotency markers and the entitlement invalidation channel.
//! Nothing stored here is authoritative: callers treat [`CacheError`] as
//! "cache unavailable" and fall through to the authoritative store.

use crate::error::{Classify, ErrorKind};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors from the shared cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache could not be reached or the command failed.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// A cached value could not be encoded or decoded.
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl Classify for CacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Transient,
            Self::Serialization(_) => ErrorKind::Invariant,
        }
    }
}

/// Boxed future returned by [`SharedCache`] operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Stream of pub/sub payloads.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// One counter in an atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    /// Counter key.
    pub key: String,
    /// Amount to add when every tally in the batch is within its limit.
    pub increment: i64,
    /// Inclusive upper bound for `current + increment`.
    pub limit: i64,
    /// Expiry applied when the counter is written.
    pub ttl: Duration,
}

/// Operations the platform needs from a Redis-shaped cache.
///
/// # Dyn Compatibility
///
/// Returns boxed futures so components can hold `Arc<dyn SharedCache>`.
pub trait SharedCache: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Write a value with an expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()>;

    /// Write a value only if the key is absent (`SET NX PX`). Returns true if written.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn set_nx<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
    -> CacheFuture<'a, bool>;

    /// Delete a key. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;

    /// Delete a key only if it currently holds `expected`. Returns true if deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn delete_if_equals<'a>(&'a self, key: &'a str, expected: &'a str)
    -> CacheFuture<'a, bool>;

    /// Collect keys matching a glob pattern using cursor-based scanning.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn scan_keys<'a>(&'a self, pattern: &'a str) -> CacheFuture<'a, Vec<String>>;

    /// Atomically check every tally and, only if all stay within their limit,
    /// increment them all.
    ///
    /// Returns `None` on success or `Some(index)` of the first tally that would
    /// exceed its limit, in which case nothing was incremented.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn check_and_increment<'a>(&'a self, tallies: &'a [Tally]) -> CacheFuture<'a, Option<usize>>;

    /// Decrement a counter, flooring at zero.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn decrement<'a>(&'a self, key: &'a str, by: i64) -> CacheFuture<'a, ()>;

    /// Publish a message on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the cache cannot be reached.
    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> CacheFuture<'a, ()>;

    /// Subscribe to a channel.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the subscription cannot be opened.
    fn subscribe<'a>(&'a self, channel: &'a str) -> CacheFuture<'a, MessageStream>;
}

/// Glob match supporting `*` (any run) and `?` (any single character).
#[must_use]
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_star_matches_runs() {
        assert!(glob_match("catalog:trip:*", "catalog:trip:42"));
        assert!(glob_match("catalog:*:42", "catalog:trip:42"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("catalog:trip:*", "catalog:station:1"));
    }

    #[test]
    fn test_glob_question_mark_matches_one() {
        assert!(glob_match("seat-?", "seat-1"));
        assert!(!glob_match("seat-?", "seat-12"));
    }

    #[test]
    fn test_glob_literal_requires_exact() {
        assert!(glob_match("a:b", "a:b"));
        assert!(!glob_match("a:b", "a:bc"));
        assert!(!glob_match("a:bc", "a:b"));
    }

    #[test]
    fn test_transient_cache_errors_are_retryable() {
        assert!(CacheError::Unavailable("down".into()).is_retryable());
        assert_eq!(
            CacheError::Serialization("bad".into()).kind(),
            ErrorKind::Invariant
        );
    }
}
