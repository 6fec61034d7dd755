//! Collaborator interfaces owned by the user-data layer.
//!
//! The relay never stores users. It asks a [`Directory`] to turn the opaque
//! contact reference in `call:initiate` into an identity, and tells a
//! [`PresenceStore`] when an identity comes online or goes offline.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::identity::Identity;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// A contact reference resolved to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContact {
    /// The user's identity.
    pub identity: Identity,
    /// Liveness as recorded by the user-data layer, if it tracks it.
    pub online: Option<bool>,
}

impl ResolvedContact {
    /// A contact with unknown liveness.
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            online: None,
        }
    }
}

/// Resolves contact references to identities.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a contact reference.
    ///
    /// Returns `Ok(None)` when the reference names no user.
    async fn resolve(&self, reference: &str) -> Result<Option<ResolvedContact>, CollaboratorError>;
}

/// Persists online/offline state.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record that `identity` came online or went offline.
    async fn set_online(&self, identity: &Identity, online: bool) -> Result<(), CollaboratorError>;
}

/// Treats every non-empty reference as an identity with unknown liveness.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDirectory;

#[async_trait]
impl Directory for PassthroughDirectory {
    async fn resolve(&self, reference: &str) -> Result<Option<ResolvedContact>, CollaboratorError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(None);
        }
        Ok(Some(ResolvedContact::new(Identity::new(reference))))
    }
}

/// Presence store that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPresenceStore;

#[async_trait]
impl PresenceStore for NoopPresenceStore {
    async fn set_online(&self, identity: &Identity, online: bool) -> Result<(), CollaboratorError> {
        trace!(identity = %identity, online, "Presence change not persisted");
        Ok(())
    }
}

/// In-memory user directory that also tracks liveness.
///
/// Clones share state, so several relay instances in one process see one
/// consistent user list.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    /// Contact reference -> identity.
    aliases: Arc<DashMap<String, Identity>>,
    /// Known users and whether they are online.
    users: Arc<DashMap<Identity, bool>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user, initially offline. Registering again keeps liveness.
    pub fn register(&self, identity: impl Into<Identity>) {
        self.users.entry(identity.into()).or_insert(false);
    }

    /// Make `reference` resolve to `identity`.
    pub fn alias(&self, reference: impl Into<String>, identity: impl Into<Identity>) {
        let identity = identity.into();
        self.register(identity.clone());
        self.aliases.insert(reference.into(), identity);
    }

    /// Whether a user is recorded as online.
    #[must_use]
    pub fn is_online(&self, identity: &str) -> bool {
        self.users.get(identity).map(|e| *e).unwrap_or(false)
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve(&self, reference: &str) -> Result<Option<ResolvedContact>, CollaboratorError> {
        let identity = match self.aliases.get(reference) {
            Some(alias) => alias.clone(),
            None => Identity::new(reference),
        };
        Ok(self.users.get(identity.as_str()).map(|online| ResolvedContact {
            identity: identity.clone(),
            online: Some(*online),
        }))
    }
}

#[async_trait]
impl PresenceStore for InMemoryDirectory {
    async fn set_online(&self, identity: &Identity, online: bool) -> Result<(), CollaboratorError> {
        self.users.insert(identity.clone(), online);
        Ok(())
    }
}
