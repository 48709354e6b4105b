//! Error types for the RPC layer.

use crate::RemoteError;

/// Why a call did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No response arrived within the call's timeout.
    #[error("request {method} timed out")]
    Timeout {
        /// The method that timed out.
        method: String,
    },

    /// The remote side answered with `ok: false`.
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(RemoteError),

    /// The client was torn down before the call settled.
    #[error("protocol destroyed")]
    Destroyed,

    /// The frame could not be handed to the sink.
    #[error("send failed: {0}")]
    Send(String),

    /// The request parameters could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The response payload did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}
