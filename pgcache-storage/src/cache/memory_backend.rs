//! In-process key/value store with per-key TTL.
//!
//! Backed by a `DashMap`, so reads and writes on different keys do not
//! contend. Expired entries are dropped lazily on access and by
//! [`InMemoryStore::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use pgcache_core::CacheError;
use serde_json::Value;
use tokio::time::Instant;

use super::traits::KeyValueStore;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live value exists for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.is_live(Instant::now()))
            .unwrap_or(false)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // shard guard must be released before removal
        self.entries.remove_if(key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, v)| v.is_live(now))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = InMemoryStore::new();
        store
            .set("k", json!({"id": 7}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"id": 7})));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert!(!store.delete("nope").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", json!(1), Duration::from_millis(1000))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.contains_key("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryStore::new();
        store.set("a", json!(1), Duration::from_millis(10)).await.unwrap();
        store.set("b", json!(2), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired(), 1);
        assert!(store.contains_key("b"));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = InMemoryStore::new();
        store.set("k", json!(1), Duration::from_secs(5)).await.unwrap();
        store.set("k", json!(2), Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
    }
}
