//! In-process event bus.
//!
//! Clones of a [`MemoryBus`] share their topics, so several relay instances
//! living in one process see each other's publishes exactly as they would
//! through Redis. Used for single-node deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use mirror_protocol::BusEnvelope;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::traits::{BusError, EventBus, Subscription, SUBSCRIPTION_BUFFER};

/// Default per-topic broadcast capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process pub/sub bus.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    topics: Arc<DashMap<String, broadcast::Sender<Arc<str>>>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose topics buffer up to `capacity` messages per lagging
    /// subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Arc<str>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: &BusEnvelope) -> Result<(), BusError> {
        // Envelopes travel as text so both backends exercise the same codec.
        let text: Arc<str> = Arc::from(envelope.to_text()?);
        let receivers = self.sender(topic).send(text).unwrap_or(0);
        trace!(topic, event = %envelope.event, receivers, "Published to memory bus");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut source = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = topic.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(text) => match BusEnvelope::from_text(&text) {
                        Ok(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(topic = %name, error = %e, "Dropping malformed envelope"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %name, skipped, "Memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(topic = %name, "Memory bus subscription closed");
        });

        debug!(topic, "Subscribed to memory bus");
        Ok(Subscription::new(topic, rx))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
