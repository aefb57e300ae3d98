//! Redis implementation of the Seatline shared cache.
//!
//! [`RedisCache`] backs every cross-node concern of the booking service:
//!
//! - advisory pre-locks (`SET NX PX` plus a value-checked delete)
//! - TTL values (seat-map snapshots, hold metadata, idempotency records)
//! - anti-scalping tallies, checked and incremented in one Lua script
//! - cursor-based pattern invalidation (`SCAN ... COUNT 100`)
//! - the pub/sub channel used to drop entitlement copies on every node
//!
//! # Example
//!
//! ```no_run
//! use seatline_core::cache::SharedCache;
//! use seatline_redis::RedisCache;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCache::new("redis://127.0.0.1:6379").await?;
//! if cache.set_nx("inventory:lock:t1:0:A1", "hold-1", Duration::from_secs(10)).await? {
//!     // lease acquired
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use seatline_core::cache::{CacheError, CacheFuture, MessageStream, SharedCache, Tally};
use std::time::Duration;

/// Keys per `SCAN` round trip.
const SCAN_COUNT: usize = 100;

/// Checks every tally against its limit and only then increments all of them.
/// `ARGV` holds `(increment, limit, ttl_seconds)` per key. Returns the 0-based
/// index of the first violated tally, or -1 if all were incremented.
const CHECK_AND_INCREMENT: &str = r"
    for i = 1, #KEYS do
        local current = tonumber(redis.call('GET', KEYS[i]) or '0')
        local increment = tonumber(ARGV[(i - 1) * 3 + 1])
        local limit = tonumber(ARGV[(i - 1) * 3 + 2])
        if current + increment > limit then
            return i - 1
        end
    end
    for i = 1, #KEYS do
        local increment = tonumber(ARGV[(i - 1) * 3 + 1])
        local ttl = tonumber(ARGV[(i - 1) * 3 + 3])
        redis.call('INCRBY', KEYS[i], increment)
        if redis.call('TTL', KEYS[i]) < 0 then
            redis.call('EXPIRE', KEYS[i], ttl)
        end
    end
    return -1
";

/// Decrements an existing counter, flooring at zero and keeping its TTL.
const DECREMENT_FLOORED: &str = r"
    local value = redis.call('GET', KEYS[1])
    if not value then
        return 0
    end
    local next = tonumber(value) - tonumber(ARGV[1])
    if next < 0 then
        next = 0
    end
    redis.call('SET', KEYS[1], next, 'KEEPTTL')
    return next
";

/// Deletes the key only while it still holds the caller's value.
const DELETE_IF_EQUALS: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// `Redis`-backed [`SharedCache`].
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    conn_manager: ConnectionManager,
    check_and_increment: Script,
    decrement: Script,
    delete_if_equals: Script,
}

impl RedisCache {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the client cannot be created or the
    /// first connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Unavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            CacheError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!(url = %redis_url, "Connected to Redis");

        Ok(Self {
            client,
            conn_manager,
            check_and_increment: Script::new(CHECK_AND_INCREMENT),
            decrement: Script::new(DECREMENT_FLOORED),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    /// `PING` the server, for readiness probes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the server does not answer.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

/// TTL in whole milliseconds, never zero (Redis rejects `PX 0`).
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// TTL in whole seconds, never zero.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl SharedCache for RedisCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            conn.get(key).await.map_err(unavailable)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn
                .pset_ex(key, value, ttl_millis(ttl))
                .await
                .map_err(unavailable)?;
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
            let mut conn = self.conn_manager.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(reply.is_some())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: u64 = conn.del(key).await.map_err(unavailable)?;
            Ok(removed > 0)
        })
    }

    fn delete_if_equals<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: u64 = self
                .delete_if_equals
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(removed > 0)
        })
    }

    fn scan_keys<'a>(&'a self, pattern: &'a str) -> CacheFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let mut cursor = 0u64;
            let mut found: Vec<String> = Vec::new();

            loop {
                let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;

                found.extend(keys);
                cursor = next_cursor;

                if cursor == 0 {
                    break;
                }
            }

            // SCAN may return a key more than once across iterations.
            found.sort();
            found.dedup();
            Ok(found)
        })
    }

    fn check_and_increment<'a>(&'a self, tallies: &'a [Tally]) -> CacheFuture<'a, Option<usize>> {
        Box::pin(async move {
            if tallies.is_empty() {
                return Ok(None);
            }
            let mut conn = self.conn_manager.clone();
            let mut invocation = self.check_and_increment.prepare_invoke();
            for tally in tallies {
                invocation
                    .key(&tally.key)
                    .arg(tally.increment)
                    .arg(tally.limit)
                    .arg(ttl_seconds(tally.ttl));
            }
            let violated: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(usize::try_from(violated).ok())
        })
    }

    fn decrement<'a>(&'a self, key: &'a str, by: i64) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: i64 = self
                .decrement
                .key(key)
                .arg(by)
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(())
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, message: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let receivers: u64 = conn.publish(channel, message).await.map_err(unavailable)?;
            tracing::debug!(channel, receivers, "Published cache message");
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, channel: &'a str) -> CacheFuture<'a, MessageStream> {
        Box::pin(async move {
            let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
            pubsub.subscribe(channel).await.map_err(unavailable)?;

            let channel = channel.to_string();
            let stream = pubsub.into_on_message().filter_map(move |msg| {
                let payload = msg.get_payload::<String>();
                let channel = channel.clone();
                async move {
                    match payload {
                        Ok(payload) => Some(payload),
                        Err(e) => {
                            tracing::warn!(channel = %channel, error = %e, "Dropping undecodable pub/sub payload");
                            None
                        }
                    }
                }
            });
            Ok(Box::pin(stream) as MessageStream)
        })
    }
}
