//! Per-method memoization over the tag-indexed cache.
//!
//! A [`CachedMethod`] is obtained from
//! [`CacheableService::register_cacheable`](crate::CacheableService::register_cacheable)
//! and wraps each call of the business method:
//!
//! 1. key = `signature(class, method, args)`
//! 2. hit → return the stored value, the method is not called
//! 3. miss → call the method, derive tags, store in the background
//!
//! Until the service has started the cache is not available and every call
//! goes straight to the method. Cache failures are logged and never reach the
//! caller; the method's own errors are returned unchanged and not cached.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use pgcache_core::{signature, tag_for, CacheKey, ChannelFilter, InitError, Tag};
use pgcache_storage::TagIndexedCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::model::DependentTables;

/// Shared slot the service fills with its cache on start.
pub(crate) type CacheSlot = Arc<OnceCell<Arc<TagIndexedCache>>>;

/// Where invalidation for a method comes from.
#[derive(Clone)]
pub enum ChannelSpec {
    /// Explicit tables, each with an optional filter.
    Tables(Vec<(String, Option<ChannelFilter>)>),
    /// Tables derived by walking a model's relations.
    Model {
        graph: Arc<dyn DependentTables>,
        root: String,
    },
}

impl ChannelSpec {
    /// Unfiltered tables.
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tables(tables.into_iter().map(|t| (t.into(), None)).collect())
    }

    /// Tables each paired with a filter.
    pub fn filtered<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = (S, ChannelFilter)>,
        S: Into<String>,
    {
        Self::Tables(
            channels
                .into_iter()
                .map(|(t, f)| (t.into(), Some(f)))
                .collect(),
        )
    }

    pub fn model(graph: Arc<dyn DependentTables>, root: impl Into<String>) -> Self {
        Self::Model {
            graph,
            root: root.into(),
        }
    }

    /// `(table, tag, filter)` triples to put in the channel registry.
    ///
    /// Model specs register one table-qualified tag per table reachable from
    /// the root, so a change anywhere in the full walk reaches entries stored
    /// under any narrower selection.
    pub(crate) fn registrations(
        &self,
        class: &str,
        method: &str,
    ) -> Vec<(String, Tag, Option<ChannelFilter>)> {
        match self {
            Self::Tables(tables) => tables
                .iter()
                .map(|(table, filter)| (table.clone(), tag_for(class, method, None), filter.clone()))
                .collect(),
            Self::Model { graph, root } => graph
                .dependent_tables(root, None)
                .into_iter()
                .map(|table| {
                    let tag = tag_for(class, method, Some(&table));
                    (table, tag, None)
                })
                .collect(),
        }
    }

    /// Tags a freshly computed entry is stored under.
    fn tags(&self, class: &str, method: &str, fields: Option<&Value>) -> Vec<Tag> {
        match self {
            Self::Tables(_) => vec![tag_for(class, method, None)],
            Self::Model { graph, root } => graph
                .dependent_tables(root, fields)
                .iter()
                .map(|table| tag_for(class, method, Some(table)))
                .collect(),
        }
    }
}

impl fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tables(tables) => f.debug_tuple("Tables").field(tables).finish(),
            Self::Model { root, .. } => f.debug_struct("Model").field("root", root).finish(),
        }
    }
}

/// Options for one cacheable method.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Entry TTL. `None` uses the service default.
    pub ttl: Option<Duration>,
    pub channels: ChannelSpec,
}

impl CacheOptions {
    pub fn new(channels: ChannelSpec) -> Self {
        Self { ttl: None, channels }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Memoizing wrapper for one method of a service.
#[derive(Clone)]
pub struct CachedMethod {
    class: Arc<str>,
    method: Arc<str>,
    ttl: Duration,
    channels: ChannelSpec,
    slot: CacheSlot,
    debug: bool,
}

impl CachedMethod {
    pub(crate) fn new(
        class: &str,
        method: &str,
        ttl: Duration,
        channels: ChannelSpec,
        slot: CacheSlot,
        debug: bool,
    ) -> Self {
        Self {
            class: Arc::from(class),
            method: Arc::from(method),
            ttl,
            channels,
            slot,
            debug,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cache key of a call: the signature of `[args, fields]`, with a
    /// missing selection hashed as `null`.
    pub fn key_for(&self, args: &Value, fields: Option<&Value>) -> CacheKey {
        let fields = fields.cloned().unwrap_or(Value::Null);
        signature(&self.class, &self.method, &Value::Array(vec![args.clone(), fields]))
    }

    /// Tags an entry for this call would be stored under.
    pub fn tags_for(&self, fields: Option<&Value>) -> Vec<Tag> {
        self.channels.tags(&self.class, &self.method, fields)
    }

    /// Memoized call. `compute` runs only on a miss or when the cache is
    /// unusable.
    pub async fn call<A, T, E, F, Fut>(&self, args: &A, compute: F) -> Result<T, E>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with_fields(args, None, compute).await
    }

    /// Memoized call with a selection map narrowing a model-derived tag set.
    ///
    /// The selection is part of the key: the same arguments with different
    /// selections are cached separately.
    pub async fn call_with_fields<A, T, E, F, Fut>(
        &self,
        args: &A,
        fields: Option<&Value>,
        compute: F,
    ) -> Result<T, E>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(cache) = self.slot.get() else {
            let err = InitError::NotStarted { service: self.class.to_string() };
            tracing::warn!(method = %self.method, error = %err, "cache is not initialized, calling method directly");
            return compute().await;
        };

        let args = match serde_json::to_value(args) {
            Ok(args) => args,
            Err(err) => {
                tracing::warn!(method = %self.method, error = %err, "arguments not serializable, bypassing cache");
                return compute().await;
            }
        };
        let key = self.key_for(&args, fields);

        match cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_value::<T>(raw) {
                Ok(value) => {
                    if self.debug {
                        tracing::debug!(key = %key, "cache hit");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "cached value has a different shape, recomputing");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "fetching cache key failed");
                return compute().await;
            }
        }

        let result = compute().await?;

        match serde_json::to_value(&result) {
            Ok(value) => self.store_detached(Arc::clone(cache), key, value, self.tags_for(fields)),
            Err(err) => tracing::warn!(key = %key, error = %err, "result not serializable, not cached"),
        }

        Ok(result)
    }

    fn store_detached(&self, cache: Arc<TagIndexedCache>, key: CacheKey, value: Value, tags: Vec<Tag>) {
        let ttl = self.ttl;
        let debug = self.debug;
        tokio::spawn(async move {
            match cache.set(&key, value, &tags, ttl).await {
                Ok(()) if debug => tracing::debug!(key = %key, "data saved to cache"),
                Ok(()) => {}
                Err(err) => tracing::warn!(key = %key, error = %err, "saving cache key failed"),
            }
        });
    }
}

impl fmt::Debug for CachedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedMethod")
            .field("class", &self.class)
            .field("method", &self.method)
            .field("ttl", &self.ttl)
            .field("channels", &self.channels)
            .field("initialized", &self.slot.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelGraph};
    use pgcache_core::ChangeOperation;
    use pgcache_storage::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph() -> Arc<dyn DependentTables> {
        Arc::new(
            ModelGraph::new()
                .with_model(Model::new("Order", "orders").relation("items", "OrderItem"))
                .with_model(Model::new("OrderItem", "order_items")),
        )
    }

    fn method(channels: ChannelSpec, slot: CacheSlot) -> CachedMethod {
        CachedMethod::new("OrderService", "getOrder", Duration::from_secs(1), channels, slot, false)
    }

    fn started_slot() -> (CacheSlot, Arc<TagIndexedCache>) {
        let cache = Arc::new(TagIndexedCache::new(Arc::new(InMemoryStore::new()), "OrderService"));
        let slot: CacheSlot = Arc::new(OnceCell::new());
        let _ = slot.set(Arc::clone(&cache));
        (slot, cache)
    }

    #[test]
    fn test_table_registrations_share_one_tag() {
        let spec = ChannelSpec::filtered([
            ("orders", ChannelFilter::operations([ChangeOperation::Insert])),
            ("items", ChannelFilter::operations([ChangeOperation::Delete])),
        ]);
        let regs = spec.registrations("OrderService", "getOrder");
        assert_eq!(regs.len(), 2);
        assert!(regs.iter().all(|(_, tag, f)| tag.as_str() == "OrderService:getOrder" && f.is_some()));
        assert_eq!(spec.tags("OrderService", "getOrder", None), vec![Tag::from("OrderService:getOrder")]);
    }

    #[test]
    fn test_model_registrations_and_tags_match() {
        let spec = ChannelSpec::model(graph(), "Order");
        let regs: Vec<String> = spec
            .registrations("OrderService", "getOrder")
            .into_iter()
            .map(|(_, tag, _)| tag.as_str().to_string())
            .collect();
        assert_eq!(
            regs,
            vec!["OrderService:getOrder:orders", "OrderService:getOrder:order_items"]
        );

        let narrow = spec.tags("OrderService", "getOrder", Some(&json!({"id": true})));
        assert_eq!(narrow, vec![Tag::from("OrderService:getOrder:orders")]);
    }

    #[tokio::test]
    async fn test_uninitialized_cache_calls_through() {
        let calls = AtomicUsize::new(0);
        let method = method(ChannelSpec::tables(["orders"]), Arc::new(OnceCell::new()));

        for _ in 0..2 {
            let value: Result<u32, ()> = method
                .call(&json!([7]), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(value, Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_returned_and_not_cached() {
        let (slot, cache) = started_slot();
        let method = method(ChannelSpec::tables(["orders"]), slot);

        let result: Result<u32, String> = method
            .call(&json!([7]), || async { Err("boom".to_string()) })
            .await;
        assert_eq!(result, Err("boom".to_string()));

        tokio::task::yield_now().await;
        assert_eq!(cache.stats().writes, 0);
        assert_eq!(cache.get(&method.key_for(&json!([7]), None)).await, Ok(None));
    }

    #[tokio::test]
    async fn test_selection_is_part_of_the_key() {
        let (slot, _) = started_slot();
        let method = method(ChannelSpec::model(graph(), "Order"), slot);
        let args = json!([7]);
        let narrow = json!({"id": true});
        assert_ne!(method.key_for(&args, None), method.key_for(&args, Some(&narrow)));
    }

    #[test]
    fn test_selection_cannot_be_smuggled_into_args() {
        let method = method(ChannelSpec::model(graph(), "Order"), Arc::new(OnceCell::new()));
        let narrow = json!({"id": true});
        let packed = json!([[7], {"id": true}]);
        assert_ne!(
            method.key_for(&packed, None),
            method.key_for(&json!([7]), Some(&narrow))
        );
        assert_ne!(
            method.key_for(&json!([7]), Some(&Value::Null)),
            method.key_for(&json!([[7], null]), None)
        );
    }
}
