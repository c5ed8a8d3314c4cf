//! pgcache PG - Database Side of Invalidation
//!
//! Everything that talks to PostgreSQL: the notify trigger and its
//! idempotent installer, the `LISTEN` transport, and the parser that turns
//! notification payloads into [`pgcache_core::ChangeEvent`]s.

pub mod config;
pub mod listener;
pub mod payload;
pub mod transport;
pub mod trigger;

pub use config::DbConfig;
pub use listener::PgNotificationTransport;
pub use payload::{parse_timestamp, ChangeEventParser};
pub use transport::{quote_ident, NotificationTransport, SqlExecutor, TransportEvent};
pub use trigger::{
    create_trigger_sql, is_valid_trigger_definition, InstallReport, TriggerDefinition,
    TriggerInstaller, DEFAULT_TRIGGER_DEFINITION, TRIGGER_FUNCTION_NAME, TRIGGER_NAME,
};
