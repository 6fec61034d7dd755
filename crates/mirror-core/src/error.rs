//! Routing errors.

use thiserror::Error;

/// A call event that cannot be routed.
///
/// Reported to the originating connection as `call:error`; never published.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The target resolved to the caller.
    #[error("Cannot call yourself")]
    SelfCall,

    /// The contact reference does not resolve to a user.
    #[error("Contact not found: {0}")]
    NotFound(String),

    /// The target is known to be offline.
    #[error("Contact is offline: {0}")]
    Offline(String),

    /// The call id could not be parsed.
    #[error("Invalid call id: {0}")]
    InvalidCallId(String),

    /// The call id does not name a peer for this caller.
    #[error("Cannot determine peer for call {0}")]
    UnknownPeer(String),

    /// The contact directory failed.
    #[error("Contact lookup failed: {0}")]
    Lookup(String),
}

impl RoutingError {
    /// Stable machine-readable code, sent as `code` in `call:error`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RoutingError::SelfCall => "self_call",
            RoutingError::NotFound(_) => "not_found",
            RoutingError::Offline(_) => "offline",
            RoutingError::InvalidCallId(_) => "invalid_call_id",
            RoutingError::UnknownPeer(_) => "unknown_peer",
            RoutingError::Lookup(_) => "lookup_failed",
        }
    }

    /// The call id the error refers to, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<&str> {
        match self {
            RoutingError::InvalidCallId(id) | RoutingError::UnknownPeer(id) => Some(id),
            _ => None,
        }
    }
}
