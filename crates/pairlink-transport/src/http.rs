//! Plain HTTP requests arriving on the relay port.
//!
//! WebSocket upgrades and the JSON pairing endpoints share one listener.
//! [`PendingUpgrade::peek_head`](crate::PendingUpgrade::peek_head) parses
//! the request head without consuming it, so an upgrade still hands the
//! complete handshake to `tokio-tungstenite`. Anything else is read with
//! [`PendingUpgrade::into_http`](crate::PendingUpgrade::into_http) and
//! answered through an [`HttpResponder`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};

pub use tokio_tungstenite::tungstenite::http::Method;

use crate::{TransportError, UpgradeRequest};

/// Largest request head accepted.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Largest request body accepted. Larger bodies are answered with `413`.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// How long a client may take to send its request.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_HEADERS: usize = 64;

fn invalid(message: impl Into<String>) -> TransportError {
    TransportError::AcceptFailed(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.into(),
    ))
}

/// The parsed head of an incoming HTTP request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    request: UpgradeRequest,
    websocket: bool,
    origin: Option<String>,
    pub(crate) head_len: usize,
    pub(crate) content_length: usize,
}

impl RequestHead {
    /// Parses a request head from the start of `buf`.
    ///
    /// Returns `Ok(None)` while the head is incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, TransportError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(invalid(format!("malformed request: {e}"))),
        };

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| invalid("missing request method"))?;
        let uri: Uri = req
            .path
            .ok_or_else(|| invalid("missing request target"))?
            .parse()
            .map_err(|e| invalid(format!("bad request target: {e}")))?;

        let header = |name: &str| {
            req.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(str::trim)
        };
        let websocket = header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let content_length = match header("content-length") {
            Some(len) => len
                .parse()
                .map_err(|_| invalid(format!("bad content-length: {len}")))?,
            None => 0,
        };
        let origin = header("origin").map(str::to_string);

        Ok(Some(Self {
            method,
            request: UpgradeRequest::from_uri(&uri),
            websocket,
            origin,
            head_len,
            content_length,
        }))
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path and query of the request target.
    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// Whether the request asks for a WebSocket upgrade.
    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    /// The `Origin` header, if sent.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The declared body length.
    pub fn content_length(&self) -> usize {
        self.content_length
    }
}

/// A fully read plain HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    head: RequestHead,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Assembles a request from its parsed head and body.
    pub fn new(head: RequestHead, body: Vec<u8>) -> Self {
        Self { head, body }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        self.head.method()
    }

    /// The request path, e.g. `/resolve`.
    pub fn path(&self) -> &str {
        self.head.request().path()
    }

    /// Returns the first value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.head.request().param(name)
    }

    /// The request body, empty if none was sent.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// A response to a plain HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// JSON body; empty for no body.
    pub body: String,
    /// Value for `Access-Control-Allow-Origin`, if any.
    pub allow_origin: Option<String>,
}

impl HttpReply {
    /// A JSON response.
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            allow_origin: None,
        }
    }

    /// A response without a body.
    pub fn empty(status: u16) -> Self {
        Self::json(status, String::new())
    }

    /// Adds CORS headers allowing `origin`.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origin = Some(origin.into());
        self
    }

    /// Serializes the status line, headers and body.
    pub fn encode(&self) -> Vec<u8> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
        if !self.body.is_empty() {
            head.push_str("Content-Type: application/json\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        if let Some(origin) = &self.allow_origin {
            head.push_str(&format!("Access-Control-Allow-Origin: {origin}\r\n"));
            head.push_str("Access-Control-Allow-Methods: GET, POST, PUT, OPTIONS\r\n");
            head.push_str("Access-Control-Allow-Headers: Content-Type, Authorization, Upgrade\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(self.body.as_bytes());
        out
    }
}

/// Writes the single response of a plain HTTP exchange, then closes.
pub struct HttpResponder {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl HttpResponder {
    pub(crate) fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    /// The remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Sends `reply` and closes the connection.
    pub async fn respond(mut self, reply: &HttpReply) -> Result<(), TransportError> {
        self.stream
            .write_all(&reply.encode())
            .await
            .map_err(TransportError::SendFailed)?;
        self.stream
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)?;
        tracing::debug!(peer_addr = %self.peer_addr, status = reply.status, "http response sent");
        Ok(())
    }
}
