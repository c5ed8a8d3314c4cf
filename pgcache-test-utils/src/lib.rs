//! pgcache Test Utilities
//!
//! Shared test infrastructure for the pgcache workspace:
//! - Store, transport and publish-sink doubles with failure injection
//! - Proptest generators for change events and call arguments
//! - Fixtures for common scenarios

pub use pgcache_core::{
    signature, tag_for, CacheError, CacheKey, ChangeEvent, ChangeOperation, ChannelFilter,
    PublishError, Tag, TransportError,
};
pub use pgcache_storage::{InMemoryStore, KeyValueStore, TagIndexedCache};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pgcache_pg::{NotificationTransport, SqlExecutor, TransportEvent};
use pgcache_service::PublishSink;
use serde_json::Value;
use tokio::sync::mpsc;

/// Lock a mutex, ignoring poisoning from a panicked test thread.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// STORE
// ============================================================================

/// In-memory store with operation counters and switchable failures.
#[derive(Debug, Default)]
pub struct MockStore {
    inner: InMemoryStore,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store every operation of which fails, like an unreachable server.
    pub fn unreachable() -> Self {
        let store = Self::default();
        store.set_unavailable(true);
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MockStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::WriteFailed {
                key: key.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.inner.delete(key).await
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Scripted notification transport.
///
/// Events pushed with [`MockTransport::push`] are delivered in order. Every
/// executed statement and `LISTEN` is recorded. Like a real database, a
/// `CREATE` of an object that already exists fails.
#[derive(Debug)]
pub struct MockTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    connect_on_start: bool,
    fail_connect: AtomicBool,
    connects: AtomicU64,
    statements: Mutex<Vec<String>>,
    objects: Mutex<HashSet<String>>,
    listens: Mutex<Vec<String>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport that announces `Connected` when `connect` is called.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A transport whose events come only from [`MockTransport::push`].
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(connect_on_start: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            connect_on_start,
            fail_connect: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            statements: Mutex::new(Vec::new()),
            objects: Mutex::new(HashSet::new()),
            listens: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Queue an event for delivery.
    pub fn push(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.sender).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Queue a notification carrying `event` serialized as the trigger does.
    pub fn notify(&self, event: &ChangeEvent) {
        self.push(TransportEvent::Notification {
            channel: event.table.clone(),
            payload: fixtures::payload_for(event),
        });
    }

    /// End the event stream once queued events are drained.
    pub fn close(&self) {
        lock(&self.sender).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    pub fn listens(&self) -> Vec<String> {
        lock(&self.listens).clone()
    }

    /// Number of `CREATE TRIGGER` statements that succeeded.
    pub fn triggers_created(&self) -> usize {
        lock(&self.objects)
            .iter()
            .filter(|o| o.starts_with("trigger:"))
            .count()
    }
}

fn object_of(sql: &str) -> String {
    if sql.contains("CREATE TRIGGER") {
        let table = sql
            .split(" ON ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or_default();
        format!("trigger:{}", table)
    } else {
        "function".to_string()
    }
}

#[async_trait]
impl SqlExecutor for MockTransport {
    async fn execute(&self, sql: &str) -> Result<(), TransportError> {
        lock(&self.statements).push(sql.to_string());
        let object = object_of(sql);
        if !lock(&self.objects).insert(object.clone()) {
            return Err(TransportError::QueryFailed {
                reason: format!("{} already exists", object),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                reason: "connection refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_on_start {
            self.push(TransportEvent::Connected);
        }
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<(), TransportError> {
        lock(&self.listens).push(channel.to_string());
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.receiver.lock().await.recv().await
    }

    fn close(&self) {
        MockTransport::close(self);
    }
}

// ============================================================================
// PUBLISH SINK
// ============================================================================

/// Publish sink that records every call.
#[derive(Debug, Default)]
pub struct RecordingPublishSink {
    published: Mutex<Vec<(String, ChangeEvent, Tag)>>,
    fail: AtomicBool,
}

impl RecordingPublishSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn published(&self) -> Vec<(String, ChangeEvent, Tag)> {
        lock(&self.published).clone()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.published().into_iter().map(|(_, _, tag)| tag).collect()
    }
}

#[async_trait]
impl PublishSink for RecordingPublishSink {
    async fn publish(
        &self,
        channel: &str,
        payload: &ChangeEvent,
        tag: &Tag,
    ) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::SinkFailed {
                channel: channel.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }
        lock(&self.published)
            .push((channel.to_string(), payload.clone(), tag.clone()));
        Ok(())
    }
}

// ============================================================================
// ASYNC HELPERS
// ============================================================================

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for pgcache types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_operation() -> impl Strategy<Value = ChangeOperation> {
        prop_oneof![
            Just(ChangeOperation::Insert),
            Just(ChangeOperation::Update),
            Just(ChangeOperation::Delete),
        ]
    }

    /// Lowercase SQL-ish identifiers.
    pub fn arb_identifier() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,15}"
    }

    /// Scalar JSON values.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    /// Argument lists as passed to a memoized method.
    pub fn arb_args() -> impl Strategy<Value = Value> {
        let leaf = arb_scalar();
        let nested = leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        });
        prop::collection::vec(nested, 0..4).prop_map(Value::Array)
    }

    /// Change events on a public table with text columns.
    pub fn arb_change_event() -> impl Strategy<Value = ChangeEvent> {
        (
            arb_operation(),
            arb_identifier(),
            prop::collection::btree_map(arb_identifier(), "[a-z0-9]{0,8}", 0..5),
            1_577_836_800_000i64..1_893_456_000_000i64,
        )
            .prop_map(|(operation, table, columns, millis)| {
                let timestamp = chrono::DateTime::from_timestamp_millis(millis)
                    .unwrap_or_else(chrono::Utc::now);
                let record = columns
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect();
                ChangeEvent::new(operation, "public", table)
                    .with_timestamp(timestamp)
                    .with_record(record)
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;
    use serde_json::json;

    pub const ORDER_SERVICE: &str = "OrderService";

    /// A change event on `orders` for order `id`.
    pub fn order_event(operation: ChangeOperation, id: i64) -> ChangeEvent {
        ChangeEvent::new(operation, "public", "orders")
            .with_column("id", json!(id.to_string()))
            .with_column("status", json!("paid"))
    }

    /// Payload text in the shape the notify trigger produces.
    pub fn payload_for(event: &ChangeEvent) -> String {
        json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "operation": event.operation.as_str(),
            "schema": event.schema,
            "table": event.table,
            "record": Value::Object(event.record.clone()),
        })
        .to_string()
    }

    /// A business order as returned by a service method.
    pub fn order(id: i64) -> Value {
        json!({ "id": id, "status": "paid", "total": 4200 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_store_unreachable() {
        let store = MockStore::unreachable();
        assert!(matches!(
            store.get("k").await,
            Err(CacheError::Unavailable { .. })
        ));
        store.set_unavailable(false);
        store.set("k", Value::from(1), Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Value::from(1)));
        assert_eq!(store.gets(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_rejects_duplicate_objects() {
        let transport = MockTransport::new();
        let create = "CREATE TRIGGER \"post_change_notify\"\n    AFTER INSERT\n    ON \"orders\"\n    FOR EACH ROW";
        assert!(transport.execute(create).await.is_ok());
        assert!(transport.execute(create).await.is_err());
        assert_eq!(transport.triggers_created(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_delivers_in_order() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        transport.notify(&fixtures::order_event(ChangeOperation::Insert, 7));
        transport.close();

        assert_eq!(transport.next_event().await, Some(TransportEvent::Connected));
        assert!(matches!(
            transport.next_event().await,
            Some(TransportEvent::Notification { channel, .. }) if channel == "orders"
        ));
        assert_eq!(transport.next_event().await, None);
    }
}
