//! Tracing subscriber setup.

use pgcache_core::{ConfigError, PgCacheResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human readable output (`PG_CACHE_LOG_JSON`)
    pub json: bool,
    /// Verbose pgcache diagnostics (`PG_CACHE_DEBUG`)
    pub debug: bool,
    /// Explicit filter directive; `RUST_LOG` wins when set
    pub filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

impl TelemetryConfig {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            json: lookup("PG_CACHE_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
            debug: lookup("PG_CACHE_DEBUG")
                .map(|s| s.trim() != "0" && !s.trim().is_empty())
                .unwrap_or(false),
            filter: lookup("PG_CACHE_LOG_FILTER").filter(|s| !s.trim().is_empty()),
        }
    }

    /// Filter directive used when `RUST_LOG` is not set.
    pub fn default_directive(&self) -> String {
        match (&self.filter, self.debug) {
            (Some(filter), _) => filter.clone(),
            (None, true) => "pgcache=debug,info".to_string(),
            (None, false) => "info".to_string(),
        }
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_tracing(config: &TelemetryConfig) -> PgCacheResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ConfigError::InvalidValue {
        field: "tracing".to_string(),
        value: "global subscriber".to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(json = config.json, debug = config.debug, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        let config = TelemetryConfig::from_lookup(|_| None);
        assert_eq!(config.default_directive(), "info");
        assert!(!config.json);

        let config = TelemetryConfig::from_lookup(|name| match name {
            "PG_CACHE_DEBUG" => Some("1".to_string()),
            "PG_CACHE_LOG_JSON" => Some("true".to_string()),
            _ => None,
        });
        assert!(config.json);
        assert_eq!(config.default_directive(), "pgcache=debug,info");
    }

    #[test]
    fn test_explicit_filter_wins() {
        let config = TelemetryConfig::from_lookup(|name| match name {
            "PG_CACHE_DEBUG" => Some("1".to_string()),
            "PG_CACHE_LOG_FILTER" => Some("warn".to_string()),
            _ => None,
        });
        assert_eq!(config.default_directive(), "warn");
    }
}
