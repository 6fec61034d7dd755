//! Event bus abstraction for Call Mirror.
//!
//! Every bus implementation provides the same best-effort, at-most-once
//! publish/subscribe contract. There is no acknowledgement and no replay.

use async_trait::async_trait;
use mirror_protocol::{BusEnvelope, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffered envelopes per subscription before the forwarder waits.
pub const SUBSCRIPTION_BUFFER: usize = 4096;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus backend cannot be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// Failed to publish an envelope.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to subscribe to a topic.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Envelope could not be serialized.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Envelopes received from one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<BusEnvelope>,
}

impl Subscription {
    /// Wrap a receiver fed by a bus backend.
    #[must_use]
    pub fn new(topic: impl Into<String>, receiver: mpsc::Receiver<BusEnvelope>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next envelope.
    ///
    /// Returns `None` once the backend has shut the subscription down.
    pub async fn recv(&mut self) -> Option<BusEnvelope> {
        self.receiver.recv().await
    }

    /// Receive an envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BusEnvelope> {
        self.receiver.try_recv().ok()
    }
}

/// A publish/subscribe channel shared by all relay instances.
///
/// Publishing and subscribing use independent connections, so a slow
/// subscriber never holds up outbound publishes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an envelope on a topic.
    async fn publish(&self, topic: &str, envelope: &BusEnvelope) -> Result<(), BusError>;

    /// Subscribe to a topic.
    ///
    /// The returned subscription keeps receiving across backend reconnects
    /// until it is dropped.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    /// Get the bus name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;

    /// Check if the bus is currently connected.
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_protocol::{ServerEvent, TargetScope};

    #[tokio::test]
    async fn test_subscription_recv() {
        let (tx, rx) = mpsc::channel(4);
        let mut subscription = Subscription::new("call-events", rx);
        assert_eq!(subscription.topic(), "call-events");
        assert!(subscription.try_recv().is_none());

        let event = ServerEvent::PresenceOffline { id: "bob".into() };
        let envelope = BusEnvelope::new("node-1", "bob", TargetScope::Identity, &event).unwrap();
        tx.send(envelope.clone()).await.unwrap();
        drop(tx);

        assert_eq!(subscription.recv().await, Some(envelope));
        assert_eq!(subscription.recv().await, None);
    }
}
