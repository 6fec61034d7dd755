//! Event types for the Call Mirror protocol.
//!
//! Every message on the wire is a named event with a body:
//!
//! ```json
//! { "event": "call:initiate", "data": { "contactId": "bob", "type": "video" } }
//! ```
//!
//! Client-originated and server-originated events are separate enums, so each
//! side only decodes what it may legally receive.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::ProtocolError;

/// Event names as they appear on the wire.
pub mod names {
    pub const CALL_INITIATE: &str = "call:initiate";
    pub const CALL_INITIATED: &str = "call:initiated";
    pub const CALL_INCOMING: &str = "call:incoming";
    pub const CALL_ACCEPT: &str = "call:accept";
    pub const CALL_ACCEPTED: &str = "call:accepted";
    pub const CALL_DECLINE: &str = "call:decline";
    pub const CALL_DECLINED: &str = "call:declined";
    pub const CALL_END: &str = "call:end";
    pub const CALL_ENDED: &str = "call:ended";
    pub const CALL_ERROR: &str = "call:error";
    pub const CALL_SIGNAL: &str = "call:signal";
    pub const WEBRTC_OFFER: &str = "webrtc:offer";
    pub const WEBRTC_ANSWER: &str = "webrtc:answer";
    pub const WEBRTC_ICE: &str = "webrtc:ice";
    pub const SIGNAL: &str = "signal";
    pub const PRESENCE_UPDATE: &str = "presence:update";
    pub const PRESENCE_OFFLINE: &str = "presence:offline";
}

/// Event names a client is allowed to send.
pub const CLIENT_EVENT_NAMES: [&str; 10] = [
    names::CALL_INITIATE,
    names::CALL_ACCEPT,
    names::CALL_DECLINE,
    names::CALL_END,
    names::CALL_SIGNAL,
    names::WEBRTC_OFFER,
    names::WEBRTC_ANSWER,
    names::WEBRTC_ICE,
    names::SIGNAL,
    names::PRESENCE_UPDATE,
];

/// Kind of media a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Voice only.
    #[default]
    Audio,
    /// Voice and video.
    Video,
}

/// Opaque peer-connection negotiation payload (offer, answer, ICE candidate).
///
/// The relay carries it verbatim and never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub Value);

impl SignalPayload {
    /// Wrap an arbitrary JSON value.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }
}

/// Body of a symmetric relay event (`webrtc:*` and client `presence:update`).
///
/// Only `to` is read by the relay. `from` is overwritten with the verified
/// sender before delivery; everything else passes through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayBody {
    /// Target identity.
    pub to: String,
    /// Sender identity, stamped by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Remaining fields, carried verbatim.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl RelayBody {
    /// Create a relay body addressed to `to`.
    #[must_use]
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: None,
            rest: Map::new(),
        }
    }

    /// Add a pass-through field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.rest.insert(key.into(), value);
        self
    }

    /// Stamp the verified sender identity.
    #[must_use]
    pub fn stamped(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// One entry of a presence listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// User identity.
    pub id: String,
    /// Whether the user is online.
    pub is_online: bool,
}

impl PresenceEntry {
    /// An online entry for `id`.
    #[must_use]
    pub fn online(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_online: true,
        }
    }
}

/// Body of an outbound `presence:update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PresencePayload {
    /// Full local presence listing.
    Snapshot(Vec<PresenceEntry>),
    /// A client-originated presence relay.
    Relay(RelayBody),
}

/// A raw, not yet interpreted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name.
    pub event: String,
    /// Event body.
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    /// Interpret this event as a client event.
    ///
    /// Returns `Ok(None)` for event names the server does not handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is known but the body is malformed.
    pub fn into_client_event(self) -> Result<Option<ClientEvent>, ProtocolError> {
        if !ClientEvent::is_known(&self.event) {
            return Ok(None);
        }
        let value = serde_json::to_value(self)?;
        Ok(Some(serde_json::from_value(value)?))
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Start a call to a contact.
    #[serde(rename = "call:initiate", rename_all = "camelCase")]
    CallInitiate {
        /// Opaque contact reference, resolved to an identity by the server.
        contact_id: String,
        /// Requested media.
        #[serde(rename = "type", default)]
        media: MediaType,
    },

    /// Accept an incoming call.
    #[serde(rename = "call:accept", rename_all = "camelCase")]
    CallAccept { call_id: String },

    /// Decline an incoming call.
    #[serde(rename = "call:decline", rename_all = "camelCase")]
    CallDecline { call_id: String },

    /// Hang up.
    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd { call_id: String },

    /// Negotiation payload for the peer of a call.
    #[serde(rename = "call:signal", rename_all = "camelCase")]
    CallSignal {
        call_id: String,
        signal: SignalPayload,
    },

    #[serde(rename = "webrtc:offer")]
    WebrtcOffer(RelayBody),

    #[serde(rename = "webrtc:answer")]
    WebrtcAnswer(RelayBody),

    #[serde(rename = "webrtc:ice")]
    WebrtcIce(RelayBody),

    /// Negotiation payload addressed to a specific connection.
    #[serde(rename = "signal")]
    Signal {
        /// Target connection id.
        to: String,
        signal: SignalPayload,
    },

    /// Presence relay addressed to one identity.
    #[serde(rename = "presence:update")]
    PresenceUpdate(RelayBody),
}

impl ClientEvent {
    /// Whether the server handles events with this name.
    #[must_use]
    pub fn is_known(name: &str) -> bool {
        CLIENT_EVENT_NAMES.contains(&name)
    }

    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CallInitiate { .. } => names::CALL_INITIATE,
            ClientEvent::CallAccept { .. } => names::CALL_ACCEPT,
            ClientEvent::CallDecline { .. } => names::CALL_DECLINE,
            ClientEvent::CallEnd { .. } => names::CALL_END,
            ClientEvent::CallSignal { .. } => names::CALL_SIGNAL,
            ClientEvent::WebrtcOffer(_) => names::WEBRTC_OFFER,
            ClientEvent::WebrtcAnswer(_) => names::WEBRTC_ANSWER,
            ClientEvent::WebrtcIce(_) => names::WEBRTC_ICE,
            ClientEvent::Signal { .. } => names::SIGNAL,
            ClientEvent::PresenceUpdate(_) => names::PRESENCE_UPDATE,
        }
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Confirms a call id to its initiator.
    #[serde(rename = "call:initiated", rename_all = "camelCase")]
    CallInitiated {
        call_id: String,
        to: String,
        #[serde(rename = "type")]
        media: MediaType,
    },

    /// Rings the callee.
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        call_id: String,
        from: PresenceEntry,
        #[serde(rename = "type")]
        media: MediaType,
    },

    #[serde(rename = "call:accepted", rename_all = "camelCase")]
    CallAccepted { call_id: String, by: String },

    #[serde(rename = "call:declined", rename_all = "camelCase")]
    CallDeclined { call_id: String, by: String },

    #[serde(rename = "call:ended", rename_all = "camelCase")]
    CallEnded { call_id: String, by: String },

    /// A call event could not be routed. Sent to the originator only.
    #[serde(rename = "call:error", rename_all = "camelCase")]
    CallError {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    #[serde(rename = "call:signal", rename_all = "camelCase")]
    CallSignal {
        call_id: String,
        from: String,
        signal: SignalPayload,
    },

    #[serde(rename = "webrtc:offer")]
    WebrtcOffer(RelayBody),

    #[serde(rename = "webrtc:answer")]
    WebrtcAnswer(RelayBody),

    #[serde(rename = "webrtc:ice")]
    WebrtcIce(RelayBody),

    /// Connection-addressed negotiation payload.
    #[serde(rename = "signal")]
    Signal {
        /// Sending connection id.
        from: String,
        signal: SignalPayload,
    },

    #[serde(rename = "presence:update")]
    PresenceUpdate(PresencePayload),

    #[serde(rename = "presence:offline")]
    PresenceOffline { id: String },
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::CallInitiated { .. } => names::CALL_INITIATED,
            ServerEvent::CallIncoming { .. } => names::CALL_INCOMING,
            ServerEvent::CallAccepted { .. } => names::CALL_ACCEPTED,
            ServerEvent::CallDeclined { .. } => names::CALL_DECLINED,
            ServerEvent::CallEnded { .. } => names::CALL_ENDED,
            ServerEvent::CallError { .. } => names::CALL_ERROR,
            ServerEvent::CallSignal { .. } => names::CALL_SIGNAL,
            ServerEvent::WebrtcOffer(_) => names::WEBRTC_OFFER,
            ServerEvent::WebrtcAnswer(_) => names::WEBRTC_ANSWER,
            ServerEvent::WebrtcIce(_) => names::WEBRTC_ICE,
            ServerEvent::Signal { .. } => names::SIGNAL,
            ServerEvent::PresenceUpdate(_) => names::PRESENCE_UPDATE,
            ServerEvent::PresenceOffline { .. } => names::PRESENCE_OFFLINE,
        }
    }

    /// Create a `call:error` event.
    #[must_use]
    pub fn call_error(
        code: impl Into<String>,
        message: impl Into<String>,
        call_id: Option<String>,
    ) -> Self {
        ServerEvent::CallError {
            code: code.into(),
            message: message.into(),
            call_id,
        }
    }

    /// Split into the raw `(event, data)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be represented as JSON.
    pub fn to_raw(&self) -> Result<RawEvent, ProtocolError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    /// Rebuild a server event from its raw parts.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unknown or the body does not match it.
    pub fn from_raw(raw: RawEvent) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(serde_json::to_value(raw)?)?)
    }
}
