//! Republishing of matching change events to downstream consumers.

use async_trait::async_trait;
use pgcache_core::{ChangeEvent, PublishError, Tag};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Sink for `(channel, payload, tag)` republish calls.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, channel: &str, payload: &ChangeEvent, tag: &Tag)
        -> Result<(), PublishError>;
}

/// A republished change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub id: Uuid,
    pub channel: String,
    pub payload: ChangeEvent,
    pub tag: Tag,
}

/// In-process sink backed by a tokio broadcast channel.
///
/// Slow subscribers lag and miss messages; they never block the dispatcher.
#[derive(Debug, Clone)]
pub struct BroadcastPublishSink {
    tx: broadcast::Sender<PublishMessage>,
}

impl BroadcastPublishSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishMessage> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl PublishSink for BroadcastPublishSink {
    async fn publish(
        &self,
        channel: &str,
        payload: &ChangeEvent,
        tag: &Tag,
    ) -> Result<(), PublishError> {
        let message = PublishMessage {
            id: Uuid::now_v7(),
            channel: channel.to_string(),
            payload: payload.clone(),
            tag: tag.clone(),
        };
        match self.tx.send(message) {
            Ok(receivers) => {
                tracing::debug!(channel, tag = %tag, receivers, "change event republished");
                Ok(())
            }
            Err(_) => Err(PublishError::NoSubscribers {
                channel: channel.to_string(),
            }),
        }
    }
}
