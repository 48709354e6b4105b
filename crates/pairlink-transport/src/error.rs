/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Opening an outbound connection failed before the upgrade completed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The remote side answered the upgrade request with an HTTP error.
    ///
    /// On the server this is produced after our own admission check
    /// refused the request; on the client it carries the status the relay
    /// sent back (403 blocked, 429 room full, ...).
    #[error("upgrade rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code of the rejection.
        status: u16,
        /// Response body, usually a small JSON error object.
        body: String,
    },

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Returns the HTTP status if this error is an upgrade rejection.
    pub fn rejection_status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
