//! In-process connections backed by Tokio channels.
//!
//! [`pair`] returns two endpoints wired to each other. Whatever one side
//! sends the other receives, and closing either side ends both, just like
//! a WebSocket close handshake. Tests use this to put a relay room or a
//! connection manager under load without opening sockets.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};

use crate::{Connection, ConnectionId, TransportError};

type CloseInfo = Option<(u16, String)>;

/// One end of an in-memory connection pair.
pub struct MemoryConnection {
    id: ConnectionId,
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Arc<watch::Sender<CloseInfo>>,
}

/// Creates two connected endpoints.
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let (closed, _) = watch::channel(None);
    let closed = Arc::new(closed);

    let a = MemoryConnection {
        id: ConnectionId::next(),
        tx: std::sync::Mutex::new(Some(a_tx)),
        rx: Mutex::new(a_rx),
        closed: Arc::clone(&closed),
    };
    let b = MemoryConnection {
        id: ConnectionId::next(),
        tx: std::sync::Mutex::new(Some(b_tx)),
        rx: Mutex::new(b_rx),
        closed,
    };
    (a, b)
}

impl MemoryConnection {
    /// The close code and reason, once either side has closed.
    pub fn close_reason(&self) -> Option<(u16, String)> {
        self.closed.borrow().clone()
    }

    /// Returns `true` once either side has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn shut(&self, code: u16, reason: &str) {
        self.closed.send_if_modified(|info| {
            if info.is_some() {
                return false;
            }
            *info = Some((code, reason.to_string()));
            true
        });
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed("closed".into()));
        }
        let tx = self
            .tx
            .lock()
            .map_err(|_| TransportError::ConnectionClosed("poisoned".into()))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| TransportError::ConnectionClosed("peer dropped".into())),
            None => Err(TransportError::ConnectionClosed("closed".into())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => Ok(msg),
            _ = closed.wait_for(|info| info.is_some()) => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shut(1000, "");
        Ok(())
    }

    async fn close_with(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.shut(code, reason);
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_both_directions() {
        let (a, b) = pair();
        a.send(b"hello").await.expect("send a->b");
        b.send(b"world").await.expect("send b->a");

        assert_eq!(b.recv().await.expect("recv"), Some(b"hello".to_vec()));
        assert_eq!(a.recv().await.expect("recv"), Some(b"world".to_vec()));
    }

    #[tokio::test]
    async fn test_close_ends_both_sides_with_reason() {
        let (a, b) = pair();
        a.close_with(1008, "policy violation").await.expect("close");

        assert_eq!(b.recv().await.expect("recv"), None);
        assert_eq!(a.recv().await.expect("recv"), None);
        assert_eq!(b.close_reason(), Some((1008, "policy violation".into())));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, b) = pair();
        b.close().await.expect("close");
        assert!(a.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_messages_sent_before_close_are_delivered() {
        let (a, b) = pair();
        a.send(b"last words").await.expect("send");
        a.close().await.expect("close");

        assert_eq!(b.recv().await.expect("recv"), Some(b"last words".to_vec()));
        assert_eq!(b.recv().await.expect("recv"), None);
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (a, b) = pair();
        a.close_with(1008, "first").await.expect("close");
        b.close_with(1000, "second").await.expect("close");
        assert_eq!(a.close_reason(), Some((1008, "first".into())));
    }

    #[test]
    fn test_pair_ids_are_distinct() {
        let (a, b) = pair();
        assert_ne!(a.id(), b.id());
    }
}
