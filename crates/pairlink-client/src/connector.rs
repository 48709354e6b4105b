//! Opening transports to the relay.

use std::future::Future;

use pairlink_transport::{Connection, TransportError};

use crate::ConnectionConfig;

/// Opens a fresh transport to the relay for one connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The transport produced by a successful connect.
    type Connection: Connection;

    /// Opens a transport to the relay described by `config`.
    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// Connects to [`ConnectionConfig::endpoint`] over WebSocket.
#[cfg(feature = "websocket")]
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[cfg(feature = "websocket")]
impl Connector for WebSocketConnector {
    type Connection = pairlink_transport::WebSocketConnection;

    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send {
        let url = config.endpoint();
        async move { pairlink_transport::WebSocketConnection::connect(&url).await }
    }
}
