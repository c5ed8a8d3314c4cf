//! Composition of cache, registry and dispatcher for one service.
//!
//! ```ignore
//! let mut service = CacheableService::new("OrderService")
//!     .with_store(store)
//!     .with_transport(transport);
//! let get_order = service.register_cacheable(
//!     "getOrder",
//!     CacheOptions::new(ChannelSpec::tables(["orders"])).with_ttl(Duration::from_secs(1)),
//! )?;
//! service.start()?;
//! let order = get_order.call(&(7,), || repo.get_order(7)).await?;
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;
use pgcache_core::{ConfigError, InitError, PgCacheConfig, PgCacheResult};
use pgcache_pg::{NotificationTransport, TriggerDefinition, TriggerInstaller};
use pgcache_storage::{KeyValueStore, TagIndexedCache};
use tokio::task::JoinHandle;

use crate::dispatcher::InvalidationDispatcher;
use crate::memoize::{CacheOptions, CacheSlot, CachedMethod};
use crate::publish::PublishSink;
use crate::registry::ChannelRegistry;

/// Phase-dependent state. Registration is only possible before start.
enum Phase {
    Building(ChannelRegistry),
    Started(Running),
}

struct Running {
    cache: Arc<TagIndexedCache>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Option<Arc<InvalidationDispatcher>>,
    task: Option<JoinHandle<()>>,
}

/// Cache state held alongside a business service.
pub struct CacheableService {
    class: String,
    config: PgCacheConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn NotificationTransport>>,
    publisher: Option<Arc<dyn PublishSink>>,
    slot: CacheSlot,
    phase: Phase,
}

impl CacheableService {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            config: PgCacheConfig::default(),
            store: None,
            transport: None,
            publisher: None,
            slot: Arc::new(OnceCell::new()),
            phase: Phase::Building(ChannelRegistry::new()),
        }
    }

    pub fn with_config(mut self, config: PgCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn NotificationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn PublishSink>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn config(&self) -> &PgCacheConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        matches!(self.phase, Phase::Started(_))
    }

    pub fn registry(&self) -> &ChannelRegistry {
        match &self.phase {
            Phase::Building(registry) => registry,
            Phase::Started(running) => &running.registry,
        }
    }

    pub fn cache(&self) -> Option<&Arc<TagIndexedCache>> {
        match &self.phase {
            Phase::Building(_) => None,
            Phase::Started(running) => Some(&running.cache),
        }
    }

    pub fn dispatcher(&self) -> Option<&Arc<InvalidationDispatcher>> {
        match &self.phase {
            Phase::Building(_) => None,
            Phase::Started(running) => running.dispatcher.as_ref(),
        }
    }

    /// Register a cacheable method and record its channels.
    ///
    /// Registering the same method again replaces its filters rather than
    /// adding duplicate entries.
    pub fn register_cacheable(
        &mut self,
        method: &str,
        options: CacheOptions,
    ) -> PgCacheResult<CachedMethod> {
        let registry = match &mut self.phase {
            Phase::Building(registry) => registry,
            Phase::Started(_) => {
                return Err(InitError::AlreadyStarted {
                    service: self.class.clone(),
                    method: method.to_string(),
                }
                .into())
            }
        };

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            return Err(ConfigError::InvalidTtl {
                method: method.to_string(),
                ttl,
            }
            .into());
        }

        for (table, tag, filter) in options.channels.registrations(&self.class, method) {
            registry.register(table, tag, filter);
        }

        Ok(CachedMethod::new(
            &self.class,
            method,
            ttl,
            options.channels,
            Arc::clone(&self.slot),
            self.config.debug,
        ))
    }

    /// Build the cache, freeze the registry and spawn the dispatcher.
    ///
    /// With a transport, memoized calls keep bypassing the cache until the
    /// dispatcher is listening; without one the cache is used right away.
    ///
    /// Fails only when configuration is invalid or no store is configured.
    /// Must run inside a tokio runtime when a transport is set. Calling it
    /// again after a successful start is a no-op.
    pub fn start(&mut self) -> PgCacheResult<()> {
        if self.is_started() {
            tracing::debug!(service = %self.class, "already started");
            return Ok(());
        }
        self.config.validate()?;
        let store = self.store.clone().ok_or_else(|| InitError::NoStore {
            service: self.class.clone(),
        })?;

        let cache = Arc::new(TagIndexedCache::new(store, self.config.prefix_for(&self.class)));

        let registry = match std::mem::replace(&mut self.phase, Phase::Building(ChannelRegistry::new())) {
            Phase::Building(registry) => Arc::new(registry),
            Phase::Started(running) => running.registry,
        };

        let mut dispatcher = None;
        let mut task = None;
        match &self.transport {
            Some(transport) => {
                let definition = TriggerDefinition::resolve(self.config.trigger_definition.as_deref());
                if self.config.trigger_definition.is_some() && !definition.is_custom() {
                    tracing::debug!(service = %self.class, "custom trigger definition rejected, using default");
                }
                let built = Arc::new(
                    InvalidationDispatcher::new(
                        self.class.clone(),
                        Arc::clone(&registry),
                        Arc::clone(&cache),
                        Arc::clone(transport),
                    )
                    .with_installer(TriggerInstaller::new(definition))
                    .with_publisher(self.publisher.clone())
                    .with_publish(self.config.publish)
                    .with_debug(self.config.debug)
                    .with_connect_retry(self.config.connect_retry)
                    .with_cache_slot(Arc::clone(&self.slot)),
                );
                let running = Arc::clone(&built);
                task = Some(tokio::spawn(async move { running.run().await }));
                dispatcher = Some(built);
            }
            None => {
                if self.slot.set(Arc::clone(&cache)).is_err() {
                    tracing::debug!(service = %self.class, "cache slot already filled");
                }
                tracing::info!(
                    service = %self.class,
                    "no notification transport, entries expire by TTL only"
                );
            }
        }

        tracing::info!(
            service = %self.class,
            prefix = cache.prefix(),
            channels = ?registry.tables(),
            "cache started"
        );

        self.phase = Phase::Started(Running {
            cache,
            registry,
            dispatcher,
            task,
        });
        Ok(())
    }

    /// Stop the dispatcher task and close the transport so it stops
    /// reconnecting. The cache stays readable.
    pub fn shutdown(&mut self) {
        if let Phase::Started(running) = &mut self.phase {
            if let Some(task) = running.task.take() {
                task.abort();
                if let Some(transport) = &self.transport {
                    transport.close();
                }
            }
        }
    }

    /// Whether memoized calls go through the cache. With a transport this
    /// becomes true once the dispatcher first reaches `Active`.
    pub fn is_caching(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl Drop for CacheableService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CacheableService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheableService")
            .field("class", &self.class)
            .field("started", &self.is_started())
            .field("channels", &self.registry().tables())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memoize::ChannelSpec;
    use pgcache_core::PgCacheError;
    use pgcache_storage::InMemoryStore;
    use std::time::Duration;

    fn options() -> CacheOptions {
        CacheOptions::new(ChannelSpec::tables(["orders"]))
    }

    #[test]
    fn test_start_without_store_fails() {
        let mut service = CacheableService::new("OrderService");
        let err = service.start().unwrap_err();
        assert_eq!(
            err,
            PgCacheError::Init(InitError::NoStore {
                service: "OrderService".to_string()
            })
        );
        assert!(!service.is_started());
    }

    #[test]
    fn test_registration_after_start_is_rejected() {
        let mut service =
            CacheableService::new("OrderService").with_store(Arc::new(InMemoryStore::new()));
        service.register_cacheable("getOrder", options()).unwrap();
        service.start().unwrap();

        let err = service.register_cacheable("listOrders", options()).unwrap_err();
        assert!(matches!(err, PgCacheError::Init(InitError::AlreadyStarted { .. })));
        assert!(service.registry().contains("orders", &"OrderService:getOrder".into()));
        assert!(service.start().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut service = CacheableService::new("OrderService");
        let err = service
            .register_cacheable("getOrder", options().with_ttl(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, PgCacheError::Config(ConfigError::InvalidTtl { .. })));
    }

    #[test]
    fn test_default_ttl_and_prefix() {
        let config = PgCacheConfig::default()
            .with_prefix("shared")
            .with_default_ttl(Duration::from_secs(60));
        let mut service = CacheableService::new("OrderService")
            .with_config(config)
            .with_store(Arc::new(InMemoryStore::new()));
        let method = service.register_cacheable("getOrder", options()).unwrap();
        assert_eq!(method.ttl(), Duration::from_secs(60));

        service.start().unwrap();
        assert_eq!(service.cache().map(|c| c.prefix()), Some("shared"));
        assert!(service.dispatcher().is_none());
    }
}
