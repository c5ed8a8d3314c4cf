//! Cache layer: opaque key/value stores and the tag index on top of them.
//!
//! [`KeyValueStore`] is the only thing a backing store has to implement.
//! [`TagIndexedCache`] adds tag → keys bookkeeping so a whole group of
//! memoized results can be dropped in one call:
//!
//! ```ignore
//! let cache = TagIndexedCache::new(Arc::new(InMemoryStore::new()), "OrderService");
//! cache.set(&key, value, &[tag.clone()], Duration::from_secs(60)).await?;
//! let removed = cache.invalidate(&tag).await?;
//! ```

pub mod memory_backend;
pub mod tag_cache;
pub mod traits;

pub use memory_backend::InMemoryStore;
pub use tag_cache::{TagIndex, TagIndexedCache};
pub use traits::{CacheStats, KeyValueStore};
