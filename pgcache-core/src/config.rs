//! Service-level cache configuration.
//!
//! Values are read from environment variables with defaults suited to local
//! development:
//!
//! - `PG_CACHE_DEBUG`: `1` enables verbose invalidation logging (default: `0`)
//! - `PG_CACHE_PREFIX`: key prefix in the shared store (default: service name)
//! - `PG_CACHE_PUBLISH`: `false` disables republishing (default: `true`)
//! - `PG_CACHE_TRIGGER_DEFINITION`: custom trigger function SQL (optional)
//! - `PG_CACHE_DEFAULT_TTL_MS`: default entry TTL in milliseconds (default: 24h)
//! - `PG_CACHE_CONNECT_RETRY_MS`: delay between failed initial connects (default: 1000)

use std::time::Duration;

use crate::error::ConfigError;

/// Default TTL for cached results: 24 hours.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(86_400_000);

/// Delay between attempts while the notification transport cannot connect.
pub const DEFAULT_CONNECT_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgCacheConfig {
    /// Verbose diagnostics for installs, invalidations and cache writes.
    pub debug: bool,
    /// Store key prefix. `None` means the service class name is used.
    pub prefix: Option<String>,
    /// Whether matching change events are republished to the publish sink.
    pub publish: bool,
    /// Custom trigger function definition, validated before use.
    pub trigger_definition: Option<String>,
    /// TTL used when a cacheable method does not set one.
    pub default_ttl: Duration,
    /// Wait before retrying a failed transport connect.
    pub connect_retry: Duration,
}

impl Default for PgCacheConfig {
    fn default() -> Self {
        Self {
            debug: false,
            prefix: None,
            publish: true,
            trigger_definition: None,
            default_ttl: DEFAULT_CACHE_TTL,
            connect_retry: DEFAULT_CONNECT_RETRY,
        }
    }
}

impl PgCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let debug = lookup("PG_CACHE_DEBUG")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|n| n != 0)
            .unwrap_or(false);

        let prefix = lookup("PG_CACHE_PREFIX")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let publish = lookup("PG_CACHE_PUBLISH")
            .map(|s| s.trim().to_lowercase() != "false")
            .unwrap_or(true);

        let trigger_definition = lookup("PG_CACHE_TRIGGER_DEFINITION").filter(|s| !s.trim().is_empty());

        let default_ttl = lookup("PG_CACHE_DEFAULT_TTL_MS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CACHE_TTL);

        let connect_retry = lookup("PG_CACHE_CONNECT_RETRY_MS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_RETRY);

        Self {
            debug,
            prefix,
            publish,
            trigger_definition,
            default_ttl,
            connect_retry,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_trigger_definition(mut self, definition: impl Into<String>) -> Self {
        self.trigger_definition = Some(definition.into());
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_connect_retry(mut self, delay: Duration) -> Self {
        self.connect_retry = delay;
        self
    }

    /// Prefix to use for a service, falling back to its class name.
    pub fn prefix_for<'a>(&'a self, class_name: &'a str) -> &'a str {
        self.prefix.as_deref().unwrap_or(class_name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "default_ttl".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.connect_retry.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "connect_retry".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if let Some(prefix) = &self.prefix {
            if prefix.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    field: "prefix".to_string(),
                    value: prefix.clone(),
                    reason: "must not contain whitespace".to_string(),
                });
            }
        }
        Ok(())
    }
}
