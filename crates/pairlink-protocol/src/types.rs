//! Relay control frames and the identifiers they carry.
//!
//! Everything in this module travels over the relay WebSocket as a JSON
//! text message tagged by a `type` field:
//!
//! ```text
//! {"type":"join","roomId":"…","peerId":"…","role":"client"}
//! {"type":"relay","data":"…"}
//! {"type":"peer-joined","peerId":"…","role":"sidecar"}
//! {"type":"peer-left","peerId":"…"}
//! {"type":"error","message":"…","code":"rate-limited","retryAfter":420}
//! ```

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier a peer picks for itself when joining a room.
///
/// Serialized as a bare string (`#[serde(transparent)]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generates a random peer id.
    pub fn random() -> Self {
        Self(random_hex(8))
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque, unguessable identifier of a relay room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Generates a fresh 128-bit random room id.
    pub fn random() -> Self {
        Self(random_hex(16))
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Returns `bytes` random bytes formatted as lowercase hex.
///
/// Used for room ids, tokens, chunk group ids and correlation ids.
pub fn random_hex(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes)
        .map(|_| format!("{:02x}", rng.random::<u8>()))
        .collect()
}

// ---------------------------------------------------------------------------
// Roles and error codes
// ---------------------------------------------------------------------------

/// Which side of the pairing a peer is.
///
/// A room holds at most one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// The browser side.
    Client,
    /// The agent process side.
    Sidecar,
}

impl PeerRole {
    /// The role a peer of this role waits for before it is connected.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Client => Self::Sidecar,
            Self::Sidecar => Self::Client,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Sidecar => f.write_str("sidecar"),
        }
    }
}

/// Machine-readable code carried by an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Too many frames in the current window; see `retryAfter`.
    RateLimited,
    /// A single frame exceeded the size limit.
    PayloadTooLarge,
    /// The client address is on the blocklist.
    Blocked,
    /// The device token was missing or unknown.
    AuthFailed,
    /// The requested role is already taken in this room.
    RoomFull,
    /// The frame was not valid JSON or not a known frame.
    InvalidMessage,
    /// A relay frame arrived before a successful join.
    NotJoined,
    /// A code this build does not know about.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Codes after which reconnecting cannot help.
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::Blocked | Self::AuthFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate-limited",
            Self::PayloadTooLarge => "payload-too-large",
            Self::Blocked => "blocked",
            Self::AuthFailed => "auth-failed",
            Self::RoomFull => "room-full",
            Self::InvalidMessage => "invalid-message",
            Self::NotJoined => "not-joined",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RelayFrame
// ---------------------------------------------------------------------------

/// A control frame on the relay connection.
///
/// `#[serde(tag = "type")]` produces internally tagged JSON, with the
/// variant name in kebab-case (`PeerJoined` → `"peer-joined"`) and every
/// field in camelCase (`peer_id` → `"peerId"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    /// Peer → relay: attach this connection to the room.
    Join {
        /// Room the connection was admitted to.
        room_id: RoomId,
        /// Self-chosen peer identity.
        peer_id: PeerId,
        /// Which side of the pairing this peer is.
        role: PeerRole,
    },

    /// Peer ↔ relay: opaque application data, forwarded verbatim.
    Relay {
        /// Usually a chunk envelope or a small whole message.
        data: String,
    },

    /// Relay → peer: another peer is (or already was) in the room.
    PeerJoined {
        /// The other peer.
        peer_id: PeerId,
        /// Its role.
        role: PeerRole,
    },

    /// Relay → peer: the other peer's connection closed.
    PeerLeft {
        /// The peer that left.
        peer_id: PeerId,
    },

    /// Relay → peer: a frame was refused.
    Error {
        /// Human-readable description.
        message: String,
        /// Machine-readable code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Milliseconds until the rate window resets (rate limiting only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
}

impl RelayFrame {
    /// Builds an `error` frame with a code and no retry hint.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code),
            retry_after: None,
        }
    }

    /// Builds a `rate-limited` error with a retry hint in milliseconds.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::Error {
            message: "Rate limit exceeded".into(),
            code: Some(ErrorCode::RateLimited),
            retry_after: Some(retry_after_ms),
        }
    }

    /// Short name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Relay { .. } => "relay",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Error { .. } => "error",
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
