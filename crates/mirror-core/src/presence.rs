//! Presence tracking for Call Mirror.
//!
//! Presence is a local view broadcast locally: after every registry change,
//! each open connection on this process receives the full list of identities
//! this process holds. Nothing here travels over the event bus.

use mirror_protocol::{PresenceEntry, PresencePayload, ServerEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::PresenceStore;
use crate::identity::Identity;
use crate::registry::{ConnectionHandle, Registry};

/// Keeps local presence in step with the registry.
pub struct PresenceTracker {
    registry: Arc<Registry>,
    store: Arc<dyn PresenceStore>,
}

impl PresenceTracker {
    /// Create a tracker over `registry`, persisting changes to `store`.
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Arc<dyn PresenceStore>) -> Self {
        Self { registry, store }
    }

    /// The current local presence listing, sorted by identity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.registry
            .identities()
            .into_iter()
            .map(|identity| PresenceEntry::online(identity.into_string()))
            .collect()
    }

    /// Register a new connection and announce it.
    ///
    /// Returns the connection this one superseded, if any.
    pub async fn connect(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let identity = handle.identity().clone();
        let connection = handle.id().clone();
        let superseded = self.registry.put(handle);

        self.persist(&identity, true).await;
        let recipients = self.broadcast(&self.snapshot_event());

        info!(
            identity = %identity,
            connection = %connection,
            online = self.registry.len(),
            recipients,
            "User online"
        );
        superseded
    }

    /// Forget a closed connection and announce the departure.
    ///
    /// A connection that was already superseded changes nothing. Returns
    /// `true` if the identity went offline.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        if !self.registry.release(handle) {
            debug!(
                identity = %handle.identity(),
                connection = %handle.id(),
                "Superseded connection closed"
            );
            return false;
        }

        let identity = handle.identity();
        // A reconnect may land before or during the offline write; either
        // way the store must end up online.
        if !self.registry.contains(identity.as_str()) {
            self.persist(identity, false).await;
            if self.registry.contains(identity.as_str()) {
                debug!(identity = %identity, "Reconnected during offline write");
                self.persist(identity, true).await;
            }
        }

        self.broadcast(&ServerEvent::PresenceOffline {
            id: identity.to_string(),
        });
        self.broadcast(&self.snapshot_event());

        info!(
            identity = %identity,
            connection = %handle.id(),
            online = self.registry.len(),
            "User offline"
        );
        true
    }

    fn snapshot_event(&self) -> ServerEvent {
        ServerEvent::PresenceUpdate(PresencePayload::Snapshot(self.snapshot()))
    }

    fn broadcast(&self, event: &ServerEvent) -> usize {
        self.registry
            .handles()
            .iter()
            .filter(|handle| handle.send(event.clone()))
            .count()
    }

    async fn persist(&self, identity: &Identity, online: bool) {
        if let Err(e) = self.store.set_online(identity, online).await {
            warn!(identity = %identity, online, error = %e, "Failed to persist presence");
        }
    }
}
