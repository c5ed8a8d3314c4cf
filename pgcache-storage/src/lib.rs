//! pgcache Storage - Store Trait and Tag-Indexed Cache
//!
//! Defines the storage abstraction the invalidation engine writes through.
//! Concrete remote stores implement [`KeyValueStore`]; an in-process
//! implementation is provided for tests and single-node deployments.

pub mod cache;

pub use cache::{CacheStats, InMemoryStore, KeyValueStore, TagIndex, TagIndexedCache};
