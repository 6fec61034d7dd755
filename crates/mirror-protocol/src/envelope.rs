//! Envelope for events fanned out between server instances.
//!
//! Every instance publishes the same `{v, origin, to, scope, event, data}`
//! JSON text on one shared topic. `origin` lets an instance recognise (and
//! skip) its own publishes when the bus echoes them back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::events::{RawEvent, ServerEvent};
use crate::version::{Version, PROTOCOL_VERSION};

/// How the `to` field of an envelope is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetScope {
    /// `to` is a user identity.
    #[default]
    Identity,
    /// `to` is a connection id.
    Connection,
}

/// A server event addressed to one target, as carried by the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Protocol major version of the publisher.
    #[serde(default = "default_major")]
    pub v: u8,
    /// Instance id of the publisher.
    pub origin: String,
    /// Target identity or connection id.
    pub to: String,
    /// How to interpret `to`.
    #[serde(default)]
    pub scope: TargetScope,
    /// Event name.
    pub event: String,
    /// Event body.
    #[serde(default)]
    pub data: Value,
}

fn default_major() -> u8 {
    PROTOCOL_VERSION.major
}

impl BusEnvelope {
    /// Wrap a server event for a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be represented as JSON.
    pub fn new(
        origin: impl Into<String>,
        to: impl Into<String>,
        scope: TargetScope,
        event: &ServerEvent,
    ) -> Result<Self, ProtocolError> {
        let RawEvent { event, data } = event.to_raw()?;
        Ok(Self {
            v: PROTOCOL_VERSION.major,
            origin: origin.into(),
            to: to.into(),
            scope,
            event,
            data,
        })
    }

    /// The carried server event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event name or body is not understood.
    pub fn server_event(&self) -> Result<ServerEvent, ProtocolError> {
        ServerEvent::from_raw(RawEvent {
            event: self.event.clone(),
            data: self.data.clone(),
        })
    }

    /// Whether this envelope was published by a compatible protocol version.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        Version::from_major(self.v).is_compatible_with(&PROTOCOL_VERSION)
    }

    /// Serialize to the text carried on the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse bus text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid envelope.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_carries_event() {
        let event = ServerEvent::CallDeclined {
            call_id: "alice-1-bob".into(),
            by: "bob".into(),
        };
        let envelope = BusEnvelope::new("node-1", "alice", TargetScope::Identity, &event).unwrap();

        assert_eq!(envelope.event, "call:declined");
        assert_eq!(envelope.to, "alice");
        assert_eq!(envelope.server_event().unwrap(), event);
    }

    #[test]
    fn test_envelope_text_format() {
        let event = ServerEvent::PresenceOffline { id: "bob".into() };
        let envelope = BusEnvelope::new("node-1", "conn_1", TargetScope::Connection, &event).unwrap();

        let value: Value = serde_json::from_str(&envelope.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "v": 1,
                "origin": "node-1",
                "to": "conn_1",
                "scope": "connection",
                "event": "presence:offline",
                "data": { "id": "bob" }
            })
        );
    }

    #[test]
    fn test_minimal_envelope_defaults() {
        // `{event, to, data}` from an older publisher still parses.
        let text = r#"{"origin":"legacy","to":"bob","event":"call:ended","data":{"callId":"a-1-bob","by":"a"}}"#;
        let envelope = BusEnvelope::from_text(text).unwrap();

        assert_eq!(envelope.scope, TargetScope::Identity);
        assert!(envelope.is_compatible());
        assert!(envelope.server_event().is_ok());
    }

    #[test]
    fn test_incompatible_version() {
        let event = ServerEvent::PresenceOffline { id: "bob".into() };
        let mut envelope = BusEnvelope::new("node-1", "bob", TargetScope::Identity, &event).unwrap();
        envelope.v = PROTOCOL_VERSION.major + 1;
        assert!(!envelope.is_compatible());
    }
}
