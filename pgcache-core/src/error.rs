//! Error types for pgcache operations

use std::time::Duration;
use thiserror::Error;

/// Service initialization errors.
///
/// `NoStore` is the only error in the crate family that is allowed to abort
/// a service start.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("No backing store configured for service {service}")]
    NoStore { service: String },

    #[error("Service {service} is already started, registration of {method} rejected")]
    AlreadyStarted { service: String, method: String },

    #[error("Service {service} has not been started")]
    NotStarted { service: String },
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache read failed for key {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Cache write failed for key {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Invalidation failed for tag {tag}: {reason}")]
    InvalidateFailed { tag: String, reason: String },

    #[error("Cache value serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Trigger installation errors. Always logged, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstallError {
    #[error("Creating trigger function failed: {reason}")]
    FunctionFailed { reason: String },

    #[error("Creating trigger on {table} failed: {reason}")]
    TriggerFailed { table: String, reason: String },
}

/// Notification payload parse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Payload is not valid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("Payload field missing: {field}")]
    MissingField { field: String },

    #[error("Unknown change operation: {value}")]
    InvalidOperation { value: String },

    #[error("Invalid timestamp: {value}")]
    InvalidTimestamp { value: String },

    #[error("Record must be a JSON object, got {kind}")]
    InvalidRecord { kind: String },
}

/// Predicate filter errors. A failing predicate counts as "no match".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Predicate filter failed: {reason}")]
    Predicate { reason: String },
}

/// Notification transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("LISTEN on channel {channel} failed: {reason}")]
    ListenFailed { channel: String, reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport closed after {attempts} reconnect attempts")]
    Closed { attempts: u32 },
}

/// Republish sink errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Publish to channel {channel} failed: {reason}")]
    SinkFailed { channel: String, reason: String },

    #[error("No subscribers for channel {channel}")]
    NoSubscribers { channel: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("TTL for {method} must be positive, got {ttl:?}")]
    InvalidTtl { method: String, ttl: Duration },
}

/// Master error type for all pgcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PgCacheError {
    #[error("Initialization error: {0}")]
    Init(#[from] InitError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for pgcache operations.
pub type PgCacheResult<T> = Result<T, PgCacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_error_display() {
        let err = InitError::NoStore {
            service: "OrderService".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No backing store configured for service OrderService"
        );
    }

    #[test]
    fn test_install_error_names_table() {
        let err = InstallError::TriggerFailed {
            table: "orders".to_string(),
            reason: "trigger \"post_change_notify\" already exists".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("already exists"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: PgCacheError = ParseError::MissingField {
            field: "table".to_string(),
        }
        .into();
        assert!(matches!(err, PgCacheError::Parse(_)));
        assert!(err.to_string().starts_with("Parse error:"));

        let err: PgCacheError = CacheError::Unavailable {
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(err, PgCacheError::Cache(_)));
    }
}
