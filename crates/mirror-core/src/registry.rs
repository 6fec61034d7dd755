//! Per-process connection registry.
//!
//! Maps each identity to its live connection (last connect wins) and keeps
//! every open socket addressable by connection id for device-targeted
//! signals. Both maps are sharded [`DashMap`]s, so connection lifecycles for
//! different identities never contend on one lock.

use dashmap::DashMap;
use mirror_protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::{ConnectionId, Identity};

/// Send side of a live connection.
///
/// Cloning is cheap; all clones feed the same socket writer.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// Wrap an existing outbound sender.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            id,
            identity,
            sender,
        }
    }

    /// Create a handle with a fresh connection id, plus the receiver its
    /// socket writer drains.
    #[must_use]
    pub fn channel(identity: Identity) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionId::generate(), identity, tx), rx)
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The authenticated identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue an event for the socket.
    ///
    /// Returns `false` if the socket writer has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        let name = event.name();
        let sent = self.sender.send(event).is_ok();
        if !sent {
            trace!(connection = %self.id, event = name, "Dropped event for closed connection");
        }
        sent
    }

    /// Whether the socket writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Live connections held by this process.
#[derive(Debug, Default)]
pub struct Registry {
    /// Identity -> most recent connection.
    identities: DashMap<Identity, ConnectionHandle>,
    /// Connection id -> every open connection, including superseded ones.
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection for its identity.
    ///
    /// Overwrites any prior entry for the same identity and returns it. The
    /// superseded socket stays open and addressable by connection id.
    pub fn put(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.connections.insert(handle.id.clone(), handle.clone());
        let identity = handle.identity.clone();
        let previous = self.identities.insert(identity.clone(), handle);

        if let Some(prev) = &previous {
            debug!(identity = %identity, superseded = %prev.id, "Connection superseded");
        }
        previous
    }

    /// Remove the entry for an identity. No-op if absent.
    pub fn remove(&self, identity: &str) -> Option<ConnectionHandle> {
        let (_, handle) = self.identities.remove(identity)?;
        self.connections.remove(&handle.id);
        Some(handle)
    }

    /// Forget a closed connection.
    ///
    /// The identity entry is only removed if it still points at this
    /// connection, so a late disconnect never evicts a newer reconnect.
    /// Returns `true` if the identity entry was removed.
    pub fn release(&self, handle: &ConnectionHandle) -> bool {
        self.connections.remove(&handle.id);
        let removed = self
            .identities
            .remove_if(handle.identity.as_str(), |_, current| current.id == handle.id)
            .is_some();

        trace!(
            identity = %handle.identity,
            connection = %handle.id,
            removed,
            "Released connection"
        );
        removed
    }

    /// The current connection for an identity.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<ConnectionHandle> {
        self.identities.get(identity).map(|entry| entry.clone())
    }

    /// An open connection by id.
    #[must_use]
    pub fn connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.clone())
    }

    /// Whether an identity is held.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    /// All held identities, sorted.
    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> =
            self.identities.iter().map(|e| e.key().clone()).collect();
        identities.sort_unstable();
        identities
    }

    /// Every open connection, superseded ones included.
    #[must_use]
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of held identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether no identity is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
