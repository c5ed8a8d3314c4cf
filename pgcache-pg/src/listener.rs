//! `LISTEN`/`NOTIFY` transport over a dedicated tokio-postgres connection.
//!
//! The connection future is driven by a supervisor task that forwards
//! notifications into an unbounded channel in arrival order. When the
//! connection drops the supervisor reports [`TransportEvent::Disconnected`],
//! reconnects after `reconnect_delay`, and reports
//! [`TransportEvent::Connected`] again. Channel subscriptions do not survive a
//! reconnect; the consumer re-issues `listen` on every `Connected`.
//!
//! A failed `connect` leaves the transport reusable, so callers may retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use pgcache_core::TransportError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket};

use crate::config::DbConfig;
use crate::transport::{quote_ident, NotificationTransport, SqlExecutor, TransportEvent};

type PgConnection = Connection<Socket, NoTlsStream>;
type EventSender = mpsc::UnboundedSender<TransportEvent>;

struct Shared {
    config: DbConfig,
    client: RwLock<Option<Client>>,
}

/// Notification transport backed by PostgreSQL.
pub struct PgNotificationTransport {
    shared: Arc<Shared>,
    sender: StdMutex<Option<EventSender>>,
    receiver: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    connecting: Mutex<()>,
    closed: AtomicBool,
}

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PgNotificationTransport {
    pub fn new(config: DbConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                client: RwLock::new(None),
            }),
            sender: StdMutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            supervisor: StdMutex::new(None),
            connecting: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.shared.config
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.client.read().await.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the supervisor and drop the connection. `next_event` returns
    /// `None` once buffered events are drained.
    pub async fn shutdown(&self) {
        self.stop();
        self.shared.client.write().await.take();
    }

    fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = guard(&self.supervisor).take() {
            handle.abort();
        }
        guard(&self.sender).take();
    }
}

impl Drop for PgNotificationTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl SqlExecutor for PgNotificationTransport {
    async fn execute(&self, sql: &str) -> Result<(), TransportError> {
        let guard = self.shared.client.read().await;
        let client = guard.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| TransportError::QueryFailed {
                reason: db_error_message(&e),
            })
    }
}

#[async_trait]
impl NotificationTransport for PgNotificationTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let _connecting = self.connecting.lock().await;
        if guard(&self.supervisor).is_some() {
            // the supervisor owns reconnection from here on
            return Ok(());
        }
        let sender = guard(&self.sender)
            .take()
            .ok_or(TransportError::Closed { attempts: 0 })?;
        let connection = match establish(&self.shared).await {
            Ok(connection) => connection,
            Err(err) => {
                if !self.is_closed() {
                    *guard(&self.sender) = Some(sender);
                }
                return Err(err);
            }
        };
        if self.is_closed() {
            self.shared.client.write().await.take();
            return Err(TransportError::Closed { attempts: 0 });
        }
        tracing::debug!("notification connection established");
        *guard(&self.supervisor) = Some(tokio::spawn(supervise(
            Arc::clone(&self.shared),
            sender,
            connection,
        )));
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<(), TransportError> {
        let guard = self.shared.client.read().await;
        let client = guard.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
            .map_err(|e| TransportError::ListenFailed {
                channel: channel.to_string(),
                reason: db_error_message(&e),
            })
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.receiver.lock().await.recv().await
    }

    fn close(&self) {
        self.stop();
    }
}

async fn establish(shared: &Shared) -> Result<PgConnection, TransportError> {
    let (client, connection) = tokio_postgres::connect(&shared.config.connection_string(), NoTls)
        .await
        .map_err(|e| TransportError::ConnectFailed {
            reason: db_error_message(&e),
        })?;
    *shared.client.write().await = Some(client);
    Ok(connection)
}

async fn supervise(shared: Arc<Shared>, events: EventSender, first: PgConnection) {
    let mut connection = first;
    loop {
        if events.send(TransportEvent::Connected).is_err() {
            return;
        }

        let reason = drive(&events, connection).await;
        shared.client.write().await.take();
        tracing::warn!(reason = %reason, "notification connection lost");
        if events
            .send(TransportEvent::Disconnected {
                reason: reason.clone(),
            })
            .is_err()
        {
            return;
        }

        let max = shared.config.max_reconnect_attempts;
        let mut attempts = 0u32;
        connection = loop {
            tokio::time::sleep(shared.config.reconnect_delay).await;
            attempts += 1;
            match establish(&shared).await {
                Ok(conn) => {
                    tracing::info!(attempts, "notification connection re-established");
                    break conn;
                }
                Err(err) => {
                    tracing::warn!(attempt = attempts, error = %err, "reconnect failed");
                    if max > 0 && attempts >= max {
                        tracing::error!(
                            error = %TransportError::Closed { attempts },
                            "giving up on notification connection"
                        );
                        return;
                    }
                }
            }
        };
    }
}

/// Pump the connection until it ends. Returns why it ended.
async fn drive(events: &EventSender, mut connection: PgConnection) -> String {
    let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
    while let Some(message) = messages.next().await {
        match message {
            Ok(AsyncMessage::Notification(n)) => {
                let event = TransportEvent::Notification {
                    channel: n.channel().to_string(),
                    payload: n.payload().to_string(),
                };
                if events.send(event).is_err() {
                    return "event receiver dropped".to_string();
                }
            }
            Ok(AsyncMessage::Notice(notice)) => {
                tracing::debug!(
                    severity = notice.severity(),
                    message = notice.message(),
                    "postgres notice"
                );
            }
            Ok(_) => {}
            Err(err) => return db_error_message(&err),
        }
    }
    "connection closed".to_string()
}

fn db_error_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_before_connect_fail() {
        let transport = PgNotificationTransport::new(DbConfig::default());
        assert!(!transport.is_connected().await);
        assert_eq!(
            transport.listen("orders").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            transport.execute("select 1").await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_next_event_ends_after_shutdown() {
        let transport = PgNotificationTransport::new(DbConfig::default());
        transport.shutdown().await;
        assert_eq!(transport.next_event().await, None);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error_and_can_retry() {
        // port 1 is never a postgres server
        let config = DbConfig::default().with_url("host=127.0.0.1 port=1 user=x connect_timeout=1");
        let transport = PgNotificationTransport::new(config);
        for _ in 0..2 {
            assert!(matches!(
                transport.connect().await,
                Err(TransportError::ConnectFailed { .. })
            ));
        }
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_refuses_connect() {
        let transport = PgNotificationTransport::new(DbConfig::default());
        NotificationTransport::close(&transport);
        assert!(transport.is_closed());
        assert_eq!(transport.next_event().await, None);
        assert_eq!(
            transport.connect().await,
            Err(TransportError::Closed { attempts: 0 })
        );
    }
}
