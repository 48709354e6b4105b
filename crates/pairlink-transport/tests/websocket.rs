//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on a loopback port chosen by the OS and
//! talk to it either with raw `tokio-tungstenite` or with our own
//! [`WebSocketConnection::connect`].

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use pairlink_transport::{
        CLOSE_POLICY_VIOLATION, Connection, Rejection, Transport, TransportError,
        WebSocketConnection, WebSocketTransport,
    };
    use pairlink_transport::HttpReply;
    use pairlink_transport::http::MAX_BODY_BYTES;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;

    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr").to_string();
        (transport, addr)
    }

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let (mut transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let (mut client_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let server_conn = server_handle.await.expect("task should complete");
        assert!(server_conn.id().into_inner() > 0);

        // --- Server sends, client receives ---
        server_conn
            .send(b"{\"type\":\"relay\",\"data\":\"hi\"}")
            .await
            .expect("send should succeed");
        let msg = client_ws.next().await.expect("frame").expect("ok");
        assert!(msg.is_text(), "UTF-8 payloads go out as text frames");
        assert_eq!(msg.into_data().as_ref(), b"{\"type\":\"relay\",\"data\":\"hi\"}");

        // --- Client sends, server receives ---
        client_ws
            .send(Message::Binary(b"hello from client".to_vec().into()))
            .await
            .expect("client send");
        let received = server_conn
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(received, b"hello from client");

        server_conn.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let (mut transport, addr) = bind().await;
        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let client = WebSocketConnection::connect(&format!("ws://{addr}"))
            .await
            .expect("connect");
        let server_conn = server_handle.await.expect("join");

        client.close().await.expect("close");

        let result = server_conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_upgrade_admission_sees_query_parameters() {
        let (transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            let pending = transport.accept_pending().await.expect("tcp accept");
            pending
                .upgrade(|req| {
                    assert_eq!(req.path(), "/ws");
                    req.param("room")
                        .map(str::to_string)
                        .ok_or_else(|| Rejection::new(400, "{}"))
                })
                .await
                .expect("upgrade")
        });

        let client = WebSocketConnection::connect(&format!("ws://{addr}/ws?room=r-42"))
            .await
            .expect("connect");
        let (server_conn, room) = server_handle.await.expect("join");
        assert_eq!(room, "r-42");

        client.send(b"ping").await.expect("send");
        assert_eq!(
            server_conn.recv().await.expect("recv"),
            Some(b"ping".to_vec())
        );
    }

    #[tokio::test]
    async fn test_upgrade_rejection_reaches_client_as_status() {
        let (transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            let pending = transport.accept_pending().await.expect("tcp accept");
            pending
                .upgrade(|_| Err::<(), _>(Rejection::new(429, "{\"error\":\"room-full\"}")))
                .await
        });

        let err = WebSocketConnection::connect(&format!("ws://{addr}/ws?room=full"))
            .await
            .err()
            .expect("connect should be rejected");
        assert_eq!(err.rejection_status(), Some(429));

        let server_result = server_handle.await.expect("join");
        assert!(matches!(
            server_result,
            Err(TransportError::Rejected { status: 429, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_with_sends_close_code() {
        let (mut transport, addr) = bind().await;
        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });

        let (mut client_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let server_conn = server_handle.await.expect("join");

        server_conn
            .close_with(CLOSE_POLICY_VIOLATION, "policy violation")
            .await
            .expect("close");

        match client_ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), CLOSE_POLICY_VIOLATION);
                assert_eq!(&*frame.reason, "policy violation");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let (transport, addr) = bind().await;
        drop(transport);

        let err = WebSocketConnection::connect(&format!("ws://{addr}"))
            .await
            .err()
            .expect("nothing is listening");
        assert!(matches!(err, TransportError::ConnectFailed(_)));
    }

    // ---------------------------------------------------------------------
    // Plain HTTP on the same port
    // ---------------------------------------------------------------------

    #[tokio::test]
    async fn test_peeked_upgrade_still_completes_handshake() {
        let (transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            let pending = transport.accept_pending().await.expect("tcp accept");
            let head = pending.peek_head().await.expect("head");
            assert!(head.is_websocket());
            assert_eq!(head.request().param("room"), Some("r-7"));
            pending.upgrade(|_| Ok::<_, Rejection>(())).await.expect("upgrade")
        });

        let client = WebSocketConnection::connect(&format!("ws://{addr}/ws?room=r-7"))
            .await
            .expect("connect");
        let (server_conn, ()) = server_handle.await.expect("join");
        client.send(b"after peek").await.expect("send");
        assert_eq!(
            server_conn.recv().await.expect("recv"),
            Some(b"after peek".to_vec())
        );
    }

    #[tokio::test]
    async fn test_plain_http_request_read_and_answered() {
        let (transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            let pending = transport.accept_pending().await.expect("tcp accept");
            let head = pending.peek_head().await.expect("head");
            assert!(!head.is_websocket());
            let (request, responder) = pending.into_http(head).await.expect("read");
            assert_eq!(request.path(), "/register-device");
            assert_eq!(request.body(), b"{\"roomId\":\"r1\"}");
            responder
                .respond(&HttpReply::json(201, "{\"ok\":true}"))
                .await
                .expect("respond");
        });

        let mut stream = TcpStream::connect(&addr).await.expect("tcp connect");
        // Head and body in separate writes.
        stream
            .write_all(b"POST /register-device HTTP/1.1\r\nHost: relay\r\nContent-Length: 15\r\n\r\n")
            .await
            .expect("write head");
        stream.write_all(b"{\"roomId\":\"r1\"}").await.expect("write body");

        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        server_handle.await.expect("join");
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(response.ends_with("{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_oversized_http_body_gets_413() {
        let (transport, addr) = bind().await;

        let server_handle = tokio::spawn(async move {
            let pending = transport.accept_pending().await.expect("tcp accept");
            let head = pending.peek_head().await.expect("head");
            pending.into_http(head).await.err().expect("refused")
        });

        let mut stream = TcpStream::connect(&addr).await.expect("tcp connect");
        let head = format!(
            "POST /reconnect HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        stream.write_all(head.as_bytes()).await.expect("write head");

        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 413 "));
        let err = server_handle.await.expect("join");
        assert_eq!(err.rejection_status(), Some(413));
    }
}

