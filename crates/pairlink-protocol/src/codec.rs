//! Codec trait and implementations for serializing/deserializing frames.
//!
//! The relay and the client never call `serde_json` directly. They go
//! through a [`Codec`], so the wire format is one decision made in one
//! place.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because codecs live inside long-running Tokio
/// tasks (room actors, connection supervisors) that may move between
/// worker threads.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Every relay control frame is a JSON text message, so this is the codec
/// both the relay and its clients use.
///
/// This is behind the `json` feature flag (enabled by default).
///
/// ## Example
///
/// ```rust
/// use pairlink_protocol::{Codec, JsonCodec, PeerId, RelayFrame};
///
/// let codec = JsonCodec;
/// let frame = RelayFrame::PeerLeft { peer_id: PeerId::from("p-1") };
///
/// let bytes = codec.encode(&frame).unwrap();
/// assert_eq!(bytes, br#"{"type":"peer-left","peerId":"p-1"}"#);
///
/// let decoded: RelayFrame = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl JsonCodec {
    /// Encodes a value straight into a `String`.
    ///
    /// Chunk envelopes and relay payloads are text, so this saves a
    /// round trip through `Vec<u8>`.
    pub fn encode_str<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError> {
        serde_json::to_string(value).map_err(ProtocolError::Encode)
    }
}

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
