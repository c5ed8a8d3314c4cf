//! Notification transport abstraction.
//!
//! A transport owns the database connection used for `LISTEN`, delivers
//! notifications in arrival order, and announces every successful
//! (re)connect so the dispatcher can re-install triggers and re-listen.

use async_trait::async_trait;
use pgcache_core::TransportError;

/// Executes schema statements. Used for trigger installation only.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<(), TransportError>;
}

/// What a transport hands to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection was (re)established and is ready for `LISTEN`.
    Connected,
    /// A raw notification payload arrived on a channel.
    Notification { channel: String, payload: String },
    /// The connection was lost.
    Disconnected { reason: String },
}

/// Database change-notification source.
#[async_trait]
pub trait NotificationTransport: SqlExecutor {
    /// Open the connection. A [`TransportEvent::Connected`] follows on success.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe to a channel (table name).
    async fn listen(&self, channel: &str) -> Result<(), TransportError>;

    /// Next event, in delivery order. `None` once the transport has shut down
    /// for good.
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Stop reconnecting and end the event stream. Safe to call from `Drop`.
    fn close(&self) {}
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
