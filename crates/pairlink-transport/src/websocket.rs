//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, Uri, header};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::http::{
    HttpReply, HttpRequest, HttpResponder, MAX_BODY_BYTES, MAX_HEAD_BYTES, REQUEST_TIMEOUT,
    RequestHead,
};
use crate::{Connection, ConnectionId, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pause between peeks while a request head is still arriving.
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

fn io_error(kind: std::io::ErrorKind, e: tungstenite::Error) -> std::io::Error {
    std::io::Error::new(kind, e)
}

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener })
    }

    /// Returns the address the listener is bound to.
    ///
    /// Useful after binding to port `0`.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::AcceptFailed)
    }

    /// Accepts the next TCP connection without performing the upgrade.
    ///
    /// The caller decides whether to admit it via
    /// [`PendingUpgrade::upgrade`] or simply drop it.
    pub async fn accept_pending(&self) -> Result<PendingUpgrade, TransportError> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::trace!(%peer_addr, "accepted TCP connection");
        Ok(PendingUpgrade { stream, peer_addr })
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        let pending = self.accept_pending().await?;
        let (conn, ()) = pending.upgrade(|_| Ok(())).await?;
        Ok(conn)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// The request line of an incoming upgrade, as seen by admission checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    path: String,
    query: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parses the path and query string out of a request URI.
    pub fn from_uri(uri: &Uri) -> Self {
        let query = uri
            .query()
            .map(|q| {
                q.split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (query_decode(k), query_decode(v)),
                        None => (query_decode(pair), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            path: uri.path().to_string(),
            query,
        }
    }

    /// The request path, e.g. `/ws`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the first value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Decodes one query component. `+` is a space; malformed escapes are
/// kept as written.
fn query_decode(input: &str) -> String {
    let spaced = input.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

/// An HTTP answer refusing an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// HTTP status code.
    pub status: u16,
    /// JSON body sent with the response.
    pub body: String,
}

impl Rejection {
    /// Creates a rejection with a JSON body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_REQUEST);
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

/// A TCP connection that has not been upgraded yet.
pub struct PendingUpgrade {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl PendingUpgrade {
    /// The remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Parses the request head without consuming it.
    ///
    /// Waits until the whole head has arrived, up to a timeout.
    pub async fn peek_head(&self) -> Result<RequestHead, TransportError> {
        let mut buf = vec![0u8; MAX_HEAD_BYTES];
        let read = async {
            loop {
                let n = self
                    .stream
                    .peek(&mut buf)
                    .await
                    .map_err(TransportError::ReceiveFailed)?;
                if n == 0 {
                    return Err(TransportError::ConnectionClosed(
                        "closed before sending a request".into(),
                    ));
                }
                if let Some(head) = RequestHead::parse(&buf[..n])? {
                    return Ok(head);
                }
                if n == buf.len() {
                    return Err(TransportError::AcceptFailed(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "request head too large",
                    )));
                }
                // Peeking again returns the same bytes until more arrive.
                tokio::time::sleep(PEEK_INTERVAL).await;
            }
        };
        tokio::time::timeout(REQUEST_TIMEOUT, read)
            .await
            .map_err(|_| TransportError::ConnectionClosed("request head timed out".into()))?
    }

    /// Consumes a plain HTTP request whose head was peeked, body included.
    ///
    /// A body over [`MAX_BODY_BYTES`](crate::http::MAX_BODY_BYTES) is
    /// answered with `413` here and reported as
    /// [`TransportError::Rejected`].
    pub async fn into_http(
        self,
        head: RequestHead,
    ) -> Result<(HttpRequest, HttpResponder), TransportError> {
        let mut stream = self.stream;
        let mut consumed = vec![0u8; head.head_len];
        stream
            .read_exact(&mut consumed)
            .await
            .map_err(TransportError::ReceiveFailed)?;

        if head.content_length > MAX_BODY_BYTES {
            let body = format!("{{\"error\":\"Body exceeds {MAX_BODY_BYTES} bytes\"}}");
            let reply = HttpReply::json(413, body.clone());
            HttpResponder::new(stream, self.peer_addr).respond(&reply).await?;
            return Err(TransportError::Rejected { status: 413, body });
        }

        let mut body = vec![0u8; head.content_length];
        tokio::time::timeout(REQUEST_TIMEOUT, stream.read_exact(&mut body))
            .await
            .map_err(|_| TransportError::ConnectionClosed("request body timed out".into()))?
            .map_err(TransportError::ReceiveFailed)?;

        Ok((
            HttpRequest::new(head, body),
            HttpResponder::new(stream, self.peer_addr),
        ))
    }

    /// Performs the WebSocket handshake, consulting `admit` first.
    ///
    /// `admit` sees the request path and query before the `101` is sent.
    /// Returning `Err(rejection)` answers with that HTTP status instead and
    /// this method returns [`TransportError::Rejected`]. On success the
    /// value produced by `admit` is handed back with the connection, which
    /// lets the caller carry admission state (a room slot, a parsed room
    /// id) into the connection task.
    pub async fn upgrade<T, F>(
        self,
        admit: F,
    ) -> Result<(WebSocketConnection, T), TransportError>
    where
        F: FnOnce(&UpgradeRequest) -> Result<T, Rejection> + Send + Unpin,
        T: Send,
    {
        let peer_addr = self.peer_addr;
        let mut admitted: Option<T> = None;
        let mut rejected: Option<Rejection> = None;

        let callback = |req: &Request, resp: Response| {
            let request = UpgradeRequest::from_uri(req.uri());
            match admit(&request) {
                Ok(value) => {
                    admitted = Some(value);
                    Ok(resp)
                }
                Err(rejection) => {
                    rejected = Some(rejection.clone());
                    Err(rejection.into_response())
                }
            }
        };

        let result = tokio_tungstenite::accept_hdr_async(
            MaybeTlsStream::Plain(self.stream),
            callback,
        )
        .await;

        let ws = match result {
            Ok(ws) => ws,
            Err(e) => {
                if let Some(rejection) = rejected {
                    tracing::debug!(%peer_addr, status = rejection.status, "upgrade rejected");
                    return Err(TransportError::Rejected {
                        status: rejection.status,
                        body: rejection.body,
                    });
                }
                return Err(TransportError::AcceptFailed(io_error(
                    std::io::ErrorKind::ConnectionRefused,
                    e,
                )));
            }
        };

        let value = admitted.ok_or_else(|| {
            TransportError::AcceptFailed(std::io::Error::other(
                "handshake completed without admission",
            ))
        })?;

        let conn = WebSocketConnection::from_stream(ws);
        tracing::debug!(id = %conn.id, %peer_addr, "accepted WebSocket connection");
        Ok((conn, value))
    }
}

/// A single WebSocket connection.
///
/// The socket is split so that a task blocked in [`recv`](Connection::recv)
/// never holds up a concurrent [`send`](Connection::send).
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WebSocketConnection {
    fn from_stream(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id: ConnectionId::next(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    /// Opens a client connection to `url` (`ws://host:port/path?query`).
    ///
    /// An HTTP error answer from the server is reported as
    /// [`TransportError::Rejected`] with its status and body.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _response)) => {
                let conn = Self::from_stream(ws);
                tracing::debug!(id = %conn.id, url, "opened WebSocket connection");
                Ok(conn)
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Err(TransportError::Rejected { status, body })
            }
            Err(e) => Err(TransportError::ConnectFailed(io_error(
                std::io::ErrorKind::ConnectionRefused,
                e,
            ))),
        }
    }
}

fn to_message(data: &[u8]) -> Message {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}

fn send_error(e: tungstenite::Error) -> TransportError {
    TransportError::SendFailed(io_error(std::io::ErrorKind::BrokenPipe, e))
}

impl Connection for WebSocketConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(to_message(data))
            .await
            .map_err(send_error)
    }

    async fn feed(&self, data: &[u8]) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .feed(to_message(data))
            .await
            .map_err(send_error)
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.sink.lock().await.flush().await.map_err(send_error)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(data.to_vec()));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(io_error(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .send(Message::Close(None))
            .await
            .map_err(send_error)
    }

    async fn close_with(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(send_error)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> UpgradeRequest {
        let uri: Uri = uri.parse().expect("valid uri");
        UpgradeRequest::from_uri(&uri)
    }

    #[test]
    fn test_upgrade_request_parses_path_and_params() {
        let req = request("/ws?room=abc&token=t1");
        assert_eq!(req.path(), "/ws");
        assert_eq!(req.param("room"), Some("abc"));
        assert_eq!(req.param("token"), Some("t1"));
        assert_eq!(req.param("missing"), None);
    }

    #[test]
    fn test_upgrade_request_without_query() {
        let req = request("/ws");
        assert_eq!(req.path(), "/ws");
        assert_eq!(req.param("room"), None);
    }

    #[test]
    fn test_upgrade_request_percent_decodes_values() {
        let req = request("/ws?room=a%2Db+c&flag");
        assert_eq!(req.param("room"), Some("a-b c"));
        assert_eq!(req.param("flag"), Some(""));
    }

    #[test]
    fn test_query_decode_keeps_malformed_escape() {
        assert_eq!(query_decode("50%"), "50%");
        assert_eq!(query_decode("%zz"), "%zz");
        assert_eq!(query_decode("%E2%82%AC+%F0"), "€ \u{fffd}");
    }

    #[test]
    fn test_rejection_into_response_sets_status() {
        let response = Rejection::new(429, "{\"error\":\"room-full\"}").into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.body().as_deref(),
            Some("{\"error\":\"room-full\"}")
        );
    }
}
