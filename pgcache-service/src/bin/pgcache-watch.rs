//! pgcache-watch
//!
//! Connects to PostgreSQL, installs the change-notification trigger on the
//! tables listed in `PG_CACHE_TABLES` (comma separated) and logs every change
//! event that arrives. Useful to check that a database is instrumented.

use std::sync::Arc;

use pgcache_core::{ChannelFilter, ConfigError, PgCacheConfig, PgCacheResult};
use pgcache_pg::{DbConfig, PgNotificationTransport};
use pgcache_service::{
    init_tracing, CacheOptions, CacheableService, ChannelSpec, DispatcherState, TelemetryConfig,
};
use pgcache_storage::InMemoryStore;

#[tokio::main]
async fn main() -> PgCacheResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let tables = resolve_tables()?;
    let db_config = DbConfig::from_env();
    let config = PgCacheConfig::from_env();

    let transport = Arc::new(PgNotificationTransport::new(db_config));
    let mut service = CacheableService::new("pgcache-watch")
        .with_config(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .with_transport(transport.clone());

    // one predicate filter per table that only logs, so nothing is invalidated
    let channels = tables.iter().map(|table| {
        let filter = ChannelFilter::predicate(|event| {
            tracing::info!(
                table = %event.table,
                schema = %event.schema,
                operation = %event.operation,
                timestamp = %event.timestamp,
                record = %serde_json::Value::Object(event.record.clone()),
                "change event"
            );
            false
        });
        (table.clone(), filter)
    });
    service.register_cacheable("watch", CacheOptions::new(ChannelSpec::filtered(channels)))?;
    service.start()?;

    if let Some(dispatcher) = service.dispatcher() {
        let mut state = dispatcher.subscribe_state();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current: DispatcherState = *state.borrow();
                tracing::info!(state = ?current, "dispatcher state changed");
            }
        });
    }

    tracing::info!(tables = ?tables, "watching for changes");
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to wait for shutdown signal");
    }
    tracing::info!("Shutdown signal received");

    service.shutdown();
    transport.shutdown().await;
    Ok(())
}

fn resolve_tables() -> PgCacheResult<Vec<String>> {
    let raw = std::env::var("PG_CACHE_TABLES").map_err(|_| ConfigError::MissingRequired {
        field: "PG_CACHE_TABLES".to_string(),
    })?;
    let tables: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tables.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "PG_CACHE_TABLES".to_string(),
            value: raw,
            reason: "no table names given".to_string(),
        }
        .into());
    }
    Ok(tables)
}
