//! # callmirror-core
//!
//! Connection bookkeeping and call routing for the Call Mirror relay.
//!
//! This crate provides the building blocks the gateway wires together:
//!
//! - **Auth** - Stateless bearer token verification
//! - **Registry** - Identity to live connection map, last connect wins
//! - **Presence** - Local presence snapshots broadcast on every change
//! - **Router** - Stateless call-lifecycle and negotiation routing
//! - **Call** - Self-describing call ids
//! - **Directory** - Collaborator traits for contact lookup and presence persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Event Bus  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │                   │
//!        ▼                   ▼                   │
//! ┌─────────────┐     ┌─────────────┐            │
//! │  Presence   │────▶│  Registry   │◀───────────┘
//! └─────────────┘     └─────────────┘
//! ```

pub mod auth;
pub mod call;
pub mod directory;
pub mod error;
pub mod identity;
pub mod presence;
pub mod registry;
pub mod router;

pub use auth::{bearer_token, AuthError, TokenVerifier};
pub use call::CallId;
pub use directory::{
    CollaboratorError, Directory, InMemoryDirectory, NoopPresenceStore, PassthroughDirectory,
    PresenceStore, ResolvedContact,
};
pub use error::RoutingError;
pub use identity::{now_millis, ConnectionId, Identity};
pub use presence::PresenceTracker;
pub use registry::{ConnectionHandle, Registry};
pub use router::{CallRouter, DispatchOutcome, RemoteDelivery, Route, DEFAULT_TOPIC};
