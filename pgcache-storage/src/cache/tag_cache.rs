//! Tag-indexed cache on top of an opaque key/value store.
//!
//! Every value is stored under `{prefix}:key:{key}`. For each tag the value
//! was stored with, the key is appended to a [`TagIndex`] record kept in the
//! same store under `{prefix}:tag:{tag}`. Invalidating a tag deletes every
//! key the index lists and then the index itself.
//!
//! Index updates for one tag are serialized in-process by a per-tag async
//! mutex; there is no lock shared by unrelated tags or keys.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pgcache_core::{CacheError, CacheKey, Tag};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::traits::{CacheStats, KeyValueStore};

/// Persistent tag → keys record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagIndex {
    /// Full store keys indexed under the tag.
    pub keys: BTreeSet<String>,
    /// TTL of the record, the largest TTL among indexed keys.
    pub ttl_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
    invalidations: AtomicU64,
    keys_invalidated: AtomicU64,
}

/// Cache with atomic multi-key invalidation by tag.
pub struct TagIndexedCache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    tag_locks: DashMap<String, Arc<Mutex<()>>>,
    counters: Counters,
}

impl TagIndexedCache {
    /// Wrap a store. All keys are namespaced under `prefix`.
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            tag_locks: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Store key of a cache entry.
    pub fn entry_key(&self, key: &CacheKey) -> String {
        format!("{}:key:{}", self.prefix, key)
    }

    /// Store key of a tag index record.
    pub fn index_key(&self, tag: &Tag) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }

    /// Look up a cached value. A miss is `Ok(None)`.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Value>, CacheError> {
        match self.store.get(&self.entry_key(key)).await {
            Ok(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Store a value and index its key under every tag.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        tags: &[Tag],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let entry_key = self.entry_key(key);
        let result = self.write_entry(&entry_key, value, tags, ttl).await;
        match &result {
            Ok(()) => self.counters.writes.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn write_entry(
        &self,
        entry_key: &str,
        value: Value,
        tags: &[Tag],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.store.set(entry_key, value, ttl).await?;

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        for tag in tags {
            let lock = self.tag_lock(tag);
            let _guard = lock.lock().await;

            let index_key = self.index_key(tag);
            let mut index = self.read_index(&index_key).await?;
            index.keys.insert(entry_key.to_string());
            index.ttl_ms = index.ttl_ms.max(ttl_ms);
            self.write_index(&index_key, &index).await?;
        }
        Ok(())
    }

    /// Remove every key indexed under `tag` and the index itself.
    ///
    /// Returns how many live keys were removed; a tag with no keys yields 0.
    pub async fn invalidate(&self, tag: &Tag) -> Result<u64, CacheError> {
        let lock = self.tag_lock(tag);
        let _guard = lock.lock().await;

        let index_key = self.index_key(tag);
        let index = match self.read_index(&index_key).await {
            Ok(index) => index,
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(invalidate_failed(tag, err));
            }
        };

        let mut removed = 0u64;
        for key in &index.keys {
            match self.store.delete(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(invalidate_failed(tag, err));
                }
            }
        }

        if let Err(err) = self.store.delete(&index_key).await {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(invalidate_failed(tag, err));
        }

        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .keys_invalidated
            .fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    /// Keys currently indexed under a tag.
    pub async fn tagged_keys(&self, tag: &Tag) -> Result<BTreeSet<String>, CacheError> {
        Ok(self.read_index(&self.index_key(tag)).await?.keys)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            keys_invalidated: self.counters.keys_invalidated.load(Ordering::Relaxed),
        }
    }

    fn tag_lock(&self, tag: &Tag) -> Arc<Mutex<()>> {
        self.tag_locks
            .entry(tag.as_str().to_string())
            .or_default()
            .clone()
    }

    async fn read_index(&self, index_key: &str) -> Result<TagIndex, CacheError> {
        match self.store.get(index_key).await? {
            Some(raw) => serde_json::from_value(raw).map_err(|e| CacheError::Serialization {
                reason: format!("tag index {}: {}", index_key, e),
            }),
            None => Ok(TagIndex::default()),
        }
    }

    async fn write_index(&self, index_key: &str, index: &TagIndex) -> Result<(), CacheError> {
        let raw = serde_json::to_value(index).map_err(|e| CacheError::Serialization {
            reason: format!("tag index {}: {}", index_key, e),
        })?;
        self.store
            .set(index_key, raw, Duration::from_millis(index.ttl_ms))
            .await
    }
}

impl std::fmt::Debug for TagIndexedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagIndexedCache")
            .field("prefix", &self.prefix)
            .field("stats", &self.stats())
            .finish()
    }
}

fn invalidate_failed(tag: &Tag, err: CacheError) -> CacheError {
    CacheError::InvalidateFailed {
        tag: tag.to_string(),
        reason: err.to_string(),
    }
}
