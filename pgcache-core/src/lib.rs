//! pgcache Core - Shared Types
//!
//! Pure data structures shared by the storage, database and service crates:
//! change events, cache keys and tags, channel filters, configuration and
//! the error hierarchy. No I/O lives here.

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod identity;

pub use config::{PgCacheConfig, DEFAULT_CACHE_TTL, DEFAULT_CONNECT_RETRY};
pub use error::{
    CacheError, ConfigError, FilterError, InitError, InstallError, ParseError, PgCacheError,
    PgCacheResult, PublishError, TransportError,
};
pub use event::{ChangeEvent, ChangeOperation};
pub use filter::{filter_matches, ChannelFilter, PredicateFn};
pub use identity::{signature, tag_for, CacheKey, Tag};
