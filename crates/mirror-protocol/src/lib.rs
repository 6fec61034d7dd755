//! # mirror-protocol
//!
//! Wire protocol definitions for the Call Mirror signaling relay.
//!
//! This crate defines the named events exchanged between clients and the
//! relay, the envelope used to fan events out between relay instances, and
//! the codecs for both.
//!
//! ## Event families
//!
//! - `call:*` - Call lifecycle and call-scoped negotiation
//! - `webrtc:*` / `signal` - Verbatim negotiation relays
//! - `presence:*` - Online listings
//!
//! ## Example
//!
//! ```rust
//! use mirror_protocol::{codec, ClientEvent};
//!
//! let text = r#"{"event":"call:end","data":{"callId":"alice-1700000000000-bob"}}"#;
//! let event = codec::decode_text(text).unwrap();
//! assert!(matches!(event, Some(ClientEvent::CallEnd { .. })));
//! ```

pub mod codec;
pub mod envelope;
pub mod events;
pub mod version;

pub use codec::{decode_text, encode, Encoding, ProtocolError, WireFrame};
pub use envelope::{BusEnvelope, TargetScope};
pub use events::{
    names, ClientEvent, MediaType, PresenceEntry, PresencePayload, RawEvent, RelayBody,
    ServerEvent, SignalPayload,
};
pub use version::{Version, PROTOCOL_VERSION};
