//! # callmirror-bus
//!
//! Cross-instance event bus for the Call Mirror relay.
//!
//! Relay instances share no memory. The only way an event reaches a user
//! connected to another instance is through the bus: every instance
//! publishes addressed [`BusEnvelope`]s on one shared topic and subscribes
//! to that topic once at startup.
//!
//! - **Memory** - In-process bus for single-node deployments and tests
//! - **Redis** - Redis pub/sub, with reconnect and backoff on the subscriber
//!
//! ```rust,ignore
//! use callmirror_bus::{EventBus, MemoryBus};
//!
//! let bus = MemoryBus::new();
//! let mut subscription = bus.subscribe("call-events").await?;
//! bus.publish("call-events", &envelope).await?;
//! let received = subscription.recv().await;
//! ```
//!
//! [`BusEnvelope`]: mirror_protocol::BusEnvelope

pub mod backoff;
pub mod memory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

pub use backoff::Backoff;
pub use memory::MemoryBus;
pub use traits::{BusError, EventBus, Subscription};

#[cfg(feature = "redis")]
pub use self::redis::{RedisBus, RedisBusConfig};
