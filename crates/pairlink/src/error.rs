//! Unified error type for pairlink.

use pairlink_backoff::RetryError;
use pairlink_client::ClientError;
use pairlink_pairing::PairingError;
use pairlink_protocol::ProtocolError;
use pairlink_room::RoomError;
use pairlink_rpc::RpcError;
use pairlink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Each `#[from]` variant lets `?` lift a sub-crate error without
/// ceremony, so code using the `pairlink` facade deals with one type.
#[derive(Debug, thiserror::Error)]
pub enum PairlinkError {
    /// Socket-level failure (bind, accept, send, receive, upgrade).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame encoding or chunking failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Room admission or room actor failure.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Pairing code, device token or store failure.
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// A retried operation gave up.
    #[error(transparent)]
    Retry(#[from] RetryError<String>),

    /// Client connection manager failure.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Request/response protocol failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}
