//! Error types for the protocol layer.
//!
//! Each pairlink crate defines its own error enum, so a `ProtocolError`
//! always means "these bytes could not be turned into a frame" (or the
//! other way round), never a networking or room problem.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, a missing `type` tag, or a field of
    /// the wrong type.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame parsed but breaks a protocol rule, e.g. a join for a
    /// different room than the one the connection was admitted to.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
