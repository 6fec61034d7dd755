//! Codec for encoding and decoding Call Mirror events.
//!
//! Two framings are supported:
//! - Text: one JSON object per WebSocket text message.
//! - Binary: MessagePack with a 4-byte big-endian length prefix, several frames
//!   may share one WebSocket message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::events::{ClientEvent, RawEvent, ServerEvent};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported frame encoding name.
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    /// Handshake announced a protocol version this build cannot speak.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),
}

/// Frame encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// Length-prefixed MessagePack binary frames.
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl FromStr for Encoding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            other => Err(ProtocolError::UnknownEncoding(other.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Json => f.write_str("json"),
            Encoding::MessagePack => f.write_str("msgpack"),
        }
    }
}

/// An encoded frame, ready for the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// A text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl WireFrame {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a server event with the given encoding.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode(event: &ServerEvent, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
    match encoding {
        Encoding::Json => encode_text(event).map(WireFrame::Text),
        Encoding::MessagePack => encode_binary(event).map(WireFrame::Binary),
    }
}

/// Encode a value as a JSON text frame.
///
/// # Errors
///
/// Returns an error if the value is too large or serialization fails.
pub fn encode_text<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(value)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Encode a value as a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded value
///
/// # Errors
///
/// Returns an error if the value is too large or encoding fails.
pub fn encode_binary<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the value is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a client event from a JSON text frame.
///
/// Returns `Ok(None)` when the event name is not one the server handles.
///
/// # Errors
///
/// Returns an error if the text is not an event, or a known event has a
/// malformed body.
pub fn decode_text(text: &str) -> Result<Option<ClientEvent>, ProtocolError> {
    let raw: RawEvent = serde_json::from_str(text)?;
    raw.into_client_event()
}

/// Decode a single length-prefixed value from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a value from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let value = rmp_serde::from_slice(&payload)?;

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MediaType, PresenceEntry, PresencePayload, SignalPayload};
    use serde_json::json;

    #[test]
    fn test_decode_text_event() {
        let text = r#"{"event":"call:end","data":{"callId":"alice-1-bob"}}"#;
        let event = decode_text(text).unwrap().unwrap();
        assert_eq!(
            event,
            ClientEvent::CallEnd {
                call_id: "alice-1-bob".into()
            }
        );
    }

    #[test]
    fn test_decode_text_unknown_event() {
        let text = r#"{"event":"typing","data":{}}"#;
        assert!(decode_text(text).unwrap().is_none());
    }

    #[test]
    fn test_decode_text_garbage() {
        assert!(matches!(decode_text("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_encode_json_frame() {
        let event = ServerEvent::PresenceOffline { id: "bob".into() };
        match encode(&event, Encoding::Json).unwrap() {
            WireFrame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value, json!({"event": "presence:offline", "data": {"id": "bob"}}));
            }
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_msgpack_server_event() {
        let event = ServerEvent::CallIncoming {
            call_id: "alice-1-bob".into(),
            from: PresenceEntry::online("alice"),
            media: MediaType::Audio,
        };

        let WireFrame::Binary(data) = encode(&event, Encoding::MessagePack).unwrap() else {
            panic!("Expected binary frame");
        };
        let decoded: ServerEvent = decode_binary(&data).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_incomplete() {
        let event = ServerEvent::PresenceOffline { id: "bob".into() };
        let encoded = encode_binary(&event).unwrap();

        let partial = &encoded[..5];
        match decode_binary::<ServerEvent>(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let large = "x".repeat(MAX_FRAME_SIZE + 1);
        let event = ServerEvent::CallSignal {
            call_id: "a-1-b".into(),
            from: "a".into(),
            signal: SignalPayload::new(json!(large)),
        };

        match encode(&event, Encoding::MessagePack) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = RawEvent {
            event: "call:accept".into(),
            data: json!({"callId": "alice-1-bob"}),
        };
        let second = RawEvent {
            event: "call:end".into(),
            data: json!({"callId": "alice-1-bob"}),
        };

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        let decoded1: RawEvent = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: RawEvent = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(decoded1, first);
        assert_eq!(decoded2, second);
        assert!(buf.is_empty());
        assert!(decode_from::<RawEvent>(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("msgpack".parse::<Encoding>().unwrap(), Encoding::MessagePack);
        assert!("xml".parse::<Encoding>().is_err());
        assert_eq!(Encoding::MessagePack.to_string(), "msgpack");
    }

    #[test]
    fn test_presence_snapshot_msgpack() {
        let event = ServerEvent::PresenceUpdate(PresencePayload::Snapshot(vec![
            PresenceEntry::online("alice"),
        ]));
        let data = encode_binary(&event).unwrap();
        assert_eq!(decode_binary::<ServerEvent>(&data).unwrap(), event);
    }
}
