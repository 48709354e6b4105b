//! Transport abstraction layer for pairlink.
//!
//! Provides the [`Transport`] and [`Connection`] traits that the relay
//! server and the client connection manager are written against, plus two
//! implementations:
//!
//! - [`WebSocketTransport`] / [`WebSocketConnection`]: the real thing,
//!   via `tokio-tungstenite`. The server side supports an admission hook
//!   that runs *before* the HTTP upgrade is answered.
//! - [`memory::pair`]: two connected in-memory endpoints, used by tests
//!   that need to drive the protocol without sockets.
//!
//! The [`http`] module reads and answers plain HTTP requests that arrive
//! on the WebSocket port.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
pub mod memory;
#[cfg(feature = "websocket")]
pub mod http;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::MemoryConnection;
#[cfg(feature = "websocket")]
pub use http::{HttpReply, HttpRequest, HttpResponder, RequestHead};
#[cfg(feature = "websocket")]
pub use websocket::{
    PendingUpgrade, Rejection, UpgradeRequest, WebSocketConnection,
    WebSocketTransport,
};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// WebSocket close code for a policy violation (RFC 6455 §7.4.1).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code for an internal server error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Counter for generating unique connection IDs across all transports.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Gracefully shuts down the transport, stopping new connections.
    fn shutdown(
        &self,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A single connection that can send and receive whole messages.
///
/// Every method returns a `Send` future so connections can be driven from
/// spawned Tokio tasks by generic code.
pub trait Connection: Send + Sync + 'static {
    /// Sends one message and flushes it to the remote peer.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Queues one message without forcing a flush.
    ///
    /// Defaults to [`send`](Self::send). Buffered transports override this
    /// together with [`flush`](Self::flush).
    fn feed(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.send(data)
    }

    /// Flushes anything queued by [`feed`](Self::feed).
    fn flush(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection normally.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Closes the connection with an explicit close code and reason.
    ///
    /// Defaults to a plain [`close`](Self::close) for transports without
    /// close codes.
    fn close_with(
        &self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let _ = (code, reason);
        self.close()
    }

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
