//! Client side of a pairlink relay connection.
//!
//! [`ConnectionManager`] keeps one logical connection to a room alive:
//! it joins, waits for the counterpart peer, splits outgoing messages
//! into relay frames, reassembles incoming ones, and reconnects with
//! exponential backoff when the link drops.
//!
//! ```text
//! idle ──connect()──→ connecting ──peer-joined──→ connected
//!                         │                          │
//!                         └──timeout / drop──→ reconnecting ──exhausted──→ failed
//!                                                    │
//!                                     (any) ──disconnect()──→ idle
//! ```
//!
//! How the transport is opened is behind [`Connector`];
//! [`WebSocketConnector`] is the real one.

mod config;
mod connector;
mod error;
mod manager;

pub use config::ConnectionConfig;
#[cfg(feature = "websocket")]
pub use connector::WebSocketConnector;
pub use connector::Connector;
pub use error::ClientError;
pub use manager::{ConnectionManager, ConnectionState, HandlerId};
