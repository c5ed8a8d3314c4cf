//! pgcache Service - Memoization and Invalidation Engine
//!
//! Ties the pieces together for one service instance:
//!
//! - [`CacheableService`] owns the store, transport and publish sink
//! - [`CachedMethod`] memoizes calls by signature and stores them with tags
//! - [`ChannelRegistry`] maps tables to the tags registered on them
//! - [`InvalidationDispatcher`] turns change notifications into invalidations

pub mod dispatcher;
pub mod memoize;
pub mod model;
pub mod publish;
pub mod registry;
pub mod service;
pub mod telemetry;

pub use dispatcher::{DispatchReport, DispatcherState, InvalidationDispatcher};
pub use memoize::{CacheOptions, CachedMethod, ChannelSpec};
pub use model::{DependentTables, Model, ModelGraph, Relation};
pub use publish::{BroadcastPublishSink, PublishMessage, PublishSink};
pub use registry::{ChannelEntry, ChannelRegistry};
pub use service::CacheableService;
pub use telemetry::{init_tracing, TelemetryConfig};

pub use pgcache_core::{
    signature, tag_for, CacheKey, ChangeEvent, ChangeOperation, ChannelFilter, PgCacheConfig,
    PgCacheError, PgCacheResult, Tag,
};
pub use pgcache_storage::{KeyValueStore, TagIndexedCache};
