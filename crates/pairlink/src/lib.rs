//! # pairlink
//!
//! Relay plumbing that pairs a local sidecar with a remote client.
//!
//! The relay server admits at most one client and one sidecar per room and
//! forwards frames between them under size and rate limits. Pairing codes
//! and device tokens map people to rooms. On the client side a
//! [`ConnectionManager`](pairlink_client::ConnectionManager) keeps a room
//! session alive across drops, chunks large messages, and carries the
//! request/response protocol of [`RpcClient`](pairlink_rpc::RpcClient).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pairlink::prelude::*;
//!
//! # async fn serve() -> Result<(), PairlinkError> {
//! let server = RelayServer::builder()
//!     .bind("0.0.0.0:8787")
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod routes;
mod server;

pub use config::{ENV_ALLOWED_ORIGINS, ENV_BIND, ENV_REQUIRE_DEVICE_TOKEN, ServerConfig};
pub use error::PairlinkError;
pub use handler::WS_PATH;
pub use server::{RelayServer, RelayServerBuilder, ServerHandle};

pub use pairlink_backoff as backoff;
pub use pairlink_client as client;
pub use pairlink_pairing as pairing;
pub use pairlink_protocol as protocol;
pub use pairlink_room as room;
pub use pairlink_rpc as rpc;
pub use pairlink_transport as transport;

/// The types most programs need, in one import.
pub mod prelude {
    pub use crate::{PairlinkError, RelayServer, RelayServerBuilder, ServerConfig, ServerHandle};
    pub use pairlink_backoff::BackoffConfig;
    pub use pairlink_client::{
        ClientError, ConnectionConfig, ConnectionManager, ConnectionState, WebSocketConnector,
    };
    pub use pairlink_pairing::{KvStore, MemoryStore, PairingConfig, PairingService};
    pub use pairlink_protocol::{PeerId, PeerRole, RoomId};
    pub use pairlink_room::{RelayLimits, RoomInfo};
    pub use pairlink_rpc::{RpcClient, RpcError};
}
