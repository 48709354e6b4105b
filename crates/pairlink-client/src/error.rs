//! Error types for the connection manager.

use std::time::Duration;

use pairlink_protocol::{ErrorCode, ProtocolError};
use pairlink_transport::TransportError;

use crate::ConnectionState;

/// Errors surfaced by [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `send` was called while not connected.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// The transport failed to connect or send.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The relay refused us with an error frame.
    #[error("relay refused connection ({code}): {message}")]
    Refused {
        /// Code from the error frame.
        code: ErrorCode,
        /// Message from the error frame.
        message: String,
    },

    /// The counterpart did not appear before the handshake timer fired.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The transport closed before the handshake finished.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The reconnection budget ran out.
    #[error("reconnection attempts exhausted after {attempts} attempts")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// `disconnect()` was called while this operation was in flight.
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether reconnecting could possibly help.
    ///
    /// `blocked` and `auth-failed` refusals, and HTTP 401/403 at upgrade,
    /// are permanent.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Refused { code, .. } => code.is_permanent(),
            Self::Transport(e) => matches!(e.rejection_status(), Some(401 | 403)),
            _ => false,
        }
    }
}
