//! Key/value store trait and cache statistics.
//!
//! The store is treated as opaque: plain get/set/delete with a TTL. Tag
//! indexing is layered on top by [`super::TagIndexedCache`].

use std::time::Duration;

use async_trait::async_trait;
use pgcache_core::CacheError;
use serde_json::Value;

/// Opaque key/value store consumed by the tag-indexed cache.
///
/// Implementations may be remote (Redis, memcached) or in-process. They must
/// be safe to call concurrently; atomicity of a single operation is whatever
/// the store provides for one key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value. A missing or expired key is `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Store a value that expires after `ttl`. Last write wins.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a key. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of successful writes.
    pub writes: u64,
    /// Number of failed reads or writes.
    pub failures: u64,
    /// Number of invalidate calls that reached the store.
    pub invalidations: u64,
    /// Total keys removed by invalidation.
    pub keys_invalidated: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
