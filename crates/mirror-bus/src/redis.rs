//! Redis pub/sub event bus.
//!
//! Publishes go through a multiplexed [`ConnectionManager`], which reconnects
//! on its own. Each subscription owns a dedicated pub/sub connection driven by
//! a background task; when that connection drops, the task resubscribes with
//! exponential backoff until the subscription is dropped.

use async_trait::async_trait;
use futures_util::StreamExt;
use mirror_protocol::BusEnvelope;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::traits::{BusError, EventBus, Subscription, SUBSCRIPTION_BUFFER};

/// Redis bus configuration.
#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// First delay before resubscribing.
    pub reconnect_min: Duration,
    /// Upper bound for the resubscribe delay.
    pub reconnect_max: Duration,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Event bus backed by Redis pub/sub.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    config: RedisBusConfig,
    healthy: Arc<AtomicBool>,
}

impl RedisBus {
    /// Connect the publisher.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis cannot be reached.
    pub async fn connect(config: RedisBusConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str())?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        info!(
            host = %client.get_connection_info().addr,
            "Connected to Redis event bus"
        );

        Ok(Self {
            client,
            publisher,
            config,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }
}

async fn open_pubsub(client: &redis::Client, topic: &str) -> Result<PubSub, BusError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BusError::SubscribeFailed(e.to_string()))?;
    pubsub
        .subscribe(topic)
        .await
        .map_err(|e| BusError::SubscribeFailed(e.to_string()))?;
    Ok(pubsub)
}

async fn run_subscriber(
    client: redis::Client,
    topic: String,
    mut pubsub: PubSub,
    tx: mpsc::Sender<BusEnvelope>,
    mut backoff: Backoff,
    healthy: Arc<AtomicBool>,
) {
    loop {
        {
            let messages = pubsub.on_message();
            tokio::pin!(messages);

            while let Some(msg) = messages.next().await {
                let text: String = match msg.get_payload() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Dropping non-text bus payload");
                        continue;
                    }
                };
                match BusEnvelope::from_text(&text) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            debug!(topic = %topic, "Redis subscription dropped");
                            return;
                        }
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "Dropping malformed envelope"),
                }
            }
        }

        healthy.store(false, Ordering::Relaxed);
        warn!(topic = %topic, "Redis subscription lost, reconnecting");

        loop {
            if tx.is_closed() {
                return;
            }
            let delay = backoff.next_delay();
            tokio::time::sleep(delay).await;

            match open_pubsub(&client, &topic).await {
                Ok(fresh) => {
                    pubsub = fresh;
                    backoff.reset();
                    healthy.store(true, Ordering::Relaxed);
                    info!(topic = %topic, "Resubscribed to Redis event bus");
                    break;
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, retry_in = ?delay, "Redis resubscribe failed");
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, topic: &str, envelope: &BusEnvelope) -> Result<(), BusError> {
        let text = envelope.to_text()?;
        let mut conn = self.publisher.clone();

        match conn.publish::<_, _, i64>(topic, text).await {
            Ok(receivers) => {
                self.healthy.store(true, Ordering::Relaxed);
                trace!(topic, event = %envelope.event, receivers, "Published to Redis");
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(BusError::PublishFailed(e.to_string()))
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        // The first subscribe is awaited so a bad deployment fails at startup.
        let pubsub = open_pubsub(&self.client, topic).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);

        tokio::spawn(run_subscriber(
            self.client.clone(),
            topic.to_string(),
            pubsub,
            tx,
            backoff,
            Arc::clone(&self.healthy),
        ));

        info!(topic, "Subscribed to Redis event bus");
        Ok(Subscription::new(topic, rx))
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisBusConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert!(config.reconnect_min < config.reconnect_max);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_fast() {
        let config = RedisBusConfig {
            url: "not-a-redis-url".to_string(),
            ..Default::default()
        };
        assert!(RedisBus::connect(config).await.is_err());
    }
}
