//! Caching layers used by the booking service.
//!
//! - [`LruCache`]: bounded per-process map, O(1) get/put
//! - [`MultiLevelCache`]: LRU in front of the shared cache, with glob invalidation

mod lru;
mod multi_level;

pub use lru::LruCache;
pub use multi_level::{CacheConfig, MultiLevelCache};
