//! The connection manager and its background tasks.
//!
//! One manager owns at most one live session: a transport, a reader task
//! that turns inbound relay frames into messages, and a writer task that
//! drains the outbound queue. Sessions are numbered; anything a stale
//! session reports after it was replaced is ignored.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use pairlink_backoff::{
    AttemptError, CancelToken, ReconnectEvent, ReconnectScheduler, RetryError,
};
use pairlink_protocol::{Codec, ErrorCode, JsonCodec, MessageChunker, PeerId, RelayFrame, RoomId};
use pairlink_rpc::{FrameSink, RpcError};
use pairlink_transport::{Connection, TransportError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{ClientError, ConnectionConfig, Connector};

/// Lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Idle,
    /// A transport is being opened or is waiting for the counterpart.
    Connecting,
    /// Joined, and the counterpart peer is present.
    Connected,
    /// The link dropped; backoff is running.
    Reconnecting,
    /// Retrying was refused or exhausted. See [`ConnectionManager::last_error`].
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        })
    }
}

/// Identifies a handler registered with [`ConnectionManager::on_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session<T> {
    generation: u64,
    conn: Arc<T>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl<T: Connection> Session<T> {
    /// Stops the writer and closes the transport. The reader is aborted
    /// unless it is the caller.
    async fn shutdown(self, abort_reader: bool) {
        drop(self.outbound);
        self.writer.abort();
        if abort_reader {
            self.reader.abort();
        }
        if let Err(e) = self.conn.close().await {
            trace!(error = %e, "close after session end");
        }
    }
}

struct Control<T> {
    session: Option<Session<T>>,
    generation: u64,
    retry_floor: Option<Duration>,
    last_error: Option<String>,
    cancel: CancelToken,
}

struct Inner<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    codec: JsonCodec,
    state: watch::Sender<ConnectionState>,
    scheduler: ReconnectScheduler,
    chunker: Mutex<MessageChunker>,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    next_handler: AtomicU64,
    control: Mutex<Control<C::Connection>>,
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.control).session.take() {
            session.reader.abort();
            session.writer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Drives one logical connection to a relay room.
///
/// Clones share the same connection.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates an idle manager. Nothing connects until [`connect()`](Self::connect).
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let config = config.validated();
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector,
                codec: JsonCodec,
                state,
                scheduler: ReconnectScheduler::new(config.backoff.clone()),
                chunker: Mutex::new(MessageChunker::with_max_chunk_size(config.max_chunk_size)),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                control: Mutex::new(Control {
                    session: None,
                    generation: 0,
                    retry_floor: None,
                    last_error: None,
                    cancel: CancelToken::new(),
                }),
                config,
            }),
        }
    }

    /// The validated configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The room this manager joins.
    pub fn room_id(&self) -> &RoomId {
        &self.inner.config.room_id
    }

    /// The peer id sent in every join.
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.config.peer_id
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the manager is in `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Waiting, attempting and exhausted events from the backoff scheduler.
    pub fn reconnect_events(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.inner.scheduler.subscribe()
    }

    /// The error that caused the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.control).last_error.clone()
    }

    /// Opens a transport, joins the room and waits for the counterpart.
    ///
    /// Returns immediately if already connected or connecting. A refusal
    /// that retrying cannot fix moves to [`ConnectionState::Failed`];
    /// any other failure is returned and reconnection continues in the
    /// background, observable as [`ConnectionState::Reconnecting`].
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut prior = None;
        self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            other => {
                prior = Some(*other);
                *other = ConnectionState::Connecting;
                true
            }
        });
        let Some(prior) = prior else {
            return Ok(());
        };
        let cancel = {
            let mut control = lock(&self.inner.control);
            if prior == ConnectionState::Reconnecting {
                // Supersede the background loop and its in-flight attempt.
                self.inner.scheduler.cancel();
                std::mem::take(&mut control.cancel).cancel();
            }
            control.last_error = None;
            control.cancel.clone()
        };
        info!(
            room_id = %self.inner.config.room_id,
            role = %self.inner.config.role,
            "connecting"
        );

        match Arc::clone(&self.inner).establish(cancel).await {
            Ok(()) => Ok(()),
            Err(ClientError::Cancelled) => Err(ClientError::Cancelled),
            Err(e) => {
                let inner = &self.inner;
                let mut control = lock(&inner.control);
                if *inner.state.borrow() != ConnectionState::Connecting {
                    return Err(e);
                }
                if e.is_permanent() {
                    warn!(error = %e, "connection refused");
                    control.last_error = Some(e.to_string());
                    inner.state.send_replace(ConnectionState::Failed);
                    return Err(e);
                }
                debug!(error = %e, "initial connection failed, reconnecting");
                control.last_error = Some(e.to_string());
                let floor = control.retry_floor.take();
                let cancel = control.cancel.clone();
                inner.state.send_replace(ConnectionState::Reconnecting);
                drop(control);
                tokio::spawn(Inner::reconnect_loop(Arc::clone(inner), floor, cancel));
                Err(e)
            }
        }
    }

    /// Tears the connection down and returns to [`ConnectionState::Idle`].
    ///
    /// Pending backoff and any in-flight attempt are cancelled, and
    /// partially reassembled messages are discarded.
    pub async fn disconnect(&self) {
        self.inner.scheduler.cancel();
        let session = {
            let mut control = lock(&self.inner.control);
            std::mem::take(&mut control.cancel).cancel();
            control.retry_floor = None;
            self.inner.state.send_replace(ConnectionState::Idle);
            control.session.take()
        };
        lock(&self.inner.chunker).clear();
        if let Some(session) = session {
            session.shutdown(true).await;
        }
        info!(room_id = %self.inner.config.room_id, "disconnected");
    }

    /// Queues `message` for the counterpart. Never waits on the network.
    ///
    /// Messages larger than the chunk size go out as several relay frames.
    pub fn send(&self, message: &str) -> Result<(), ClientError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ClientError::NotConnected(state));
        }
        let chunks = lock(&self.inner.chunker).split(message)?;
        let frames = chunks
            .into_iter()
            .map(|data| self.inner.codec.encode(&RelayFrame::Relay { data }))
            .collect::<Result<Vec<_>, _>>()?;

        let control = lock(&self.inner.control);
        let Some(session) = &control.session else {
            return Err(ClientError::NotConnected(state));
        };
        for frame in frames {
            session
                .outbound
                .send(frame)
                .map_err(|_| ClientError::ConnectionLost("writer stopped".into()))?;
        }
        Ok(())
    }

    /// Registers a handler for complete inbound messages.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn off_message(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }
}

impl<C: Connector> FrameSink for ConnectionManager<C> {
    fn send_frame(&self, frame: String) -> Result<(), RpcError> {
        self.send(&frame).map_err(|e| RpcError::Send(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Connection attempts
// ---------------------------------------------------------------------------

impl<C: Connector> Inner<C> {
    /// One attempt: handshake, then install the session. `cancel` is the
    /// token that was current when the attempt was scheduled.
    async fn establish(self: Arc<Self>, cancel: CancelToken) -> Result<(), ClientError> {
        let (conn, counterpart) = tokio::select! {
            result = self.handshake() => result?,
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        };
        self.install(conn, counterpart, &cancel)
    }

    async fn handshake(&self) -> Result<(Arc<C::Connection>, PeerId), ClientError> {
        let conn = self.connector.connect(&self.config).await?;
        let join = RelayFrame::Join {
            room_id: self.config.room_id.clone(),
            peer_id: self.config.peer_id.clone(),
            role: self.config.role,
        };
        conn.send(&self.codec.encode(&join)?).await?;

        let wanted = self.config.role.counterpart();
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let received = match tokio::time::timeout_at(deadline, conn.recv()).await {
                Ok(received) => received?,
                Err(_) => {
                    let _ = conn.close().await;
                    return Err(ClientError::HandshakeTimeout(self.config.handshake_timeout));
                }
            };
            let Some(bytes) = received else {
                return Err(ClientError::ConnectionLost("closed during handshake".into()));
            };
            match self.codec.decode::<RelayFrame>(&bytes) {
                Ok(RelayFrame::PeerJoined { peer_id, role }) if role == wanted => {
                    debug!(%peer_id, %role, "counterpart present");
                    return Ok((Arc::new(conn), peer_id));
                }
                Ok(RelayFrame::Relay { data }) => self.deliver(&data),
                Ok(RelayFrame::Error {
                    code,
                    message,
                    retry_after,
                }) => match code {
                    Some(ErrorCode::RateLimited) => self.note_retry_after(retry_after),
                    Some(ErrorCode::PayloadTooLarge) => warn!(%message, "relay refused a frame"),
                    code => {
                        return Err(ClientError::Refused {
                            code: code.unwrap_or(ErrorCode::Unknown),
                            message,
                        });
                    }
                },
                Ok(other) => trace!(kind = other.kind(), "ignoring frame during handshake"),
                Err(e) => warn!(error = %e, "undecodable frame from relay"),
            }
        }
    }

    fn install(
        self: &Arc<Self>,
        conn: Arc<C::Connection>,
        counterpart: PeerId,
        cancel: &CancelToken,
    ) -> Result<(), ClientError> {
        let mut control = lock(&self.control);
        let state = *self.state.borrow();
        if cancel.is_cancelled()
            || !matches!(state, ConnectionState::Connecting | ConnectionState::Reconnecting)
        {
            drop(control);
            debug!(%state, "attempt superseded, dropping its transport");
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
            return Err(ClientError::Cancelled);
        }
        control.generation += 1;
        let generation = control.generation;
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(
            Arc::clone(&conn),
            rx,
            self.config.high_water_mark,
        ));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            Arc::clone(&conn),
            generation,
            counterpart,
        ));
        control.session = Some(Session {
            generation,
            conn,
            outbound,
            reader,
            writer,
        });
        control.last_error = None;
        self.state.send_replace(ConnectionState::Connected);
        info!(room_id = %self.config.room_id, generation, "connected");
        Ok(())
    }

    /// Retries until connected. The loop ends as soon as `cancel` is
    /// tripped, even if that happened before the task first ran.
    fn reconnect_loop(
        self: Arc<Self>,
        floor: Option<Duration>,
        cancel: CancelToken,
    ) -> BoxFuture {
        Box::pin(async move {
            let result = self
                .scheduler
                .run_with_cancel(&cancel, floor, |attempt| {
                    let inner = Arc::clone(&self);
                    let cancel = cancel.clone();
                    async move {
                        debug!(attempt, "reconnect attempt");
                        match inner.establish(cancel).await {
                            Ok(()) => Ok(()),
                            Err(ClientError::Cancelled) => {
                                Err(AttemptError::Permanent(ClientError::Cancelled))
                            }
                            Err(e) if e.is_permanent() => Err(AttemptError::Permanent(e)),
                            Err(e) => {
                                debug!(attempt, error = %e, "reconnect attempt failed");
                                Err(AttemptError::Transient(e))
                            }
                        }
                    }
                })
                .await;

            let reason = match result {
                Ok(())
                | Err(RetryError::Cancelled)
                | Err(RetryError::Permanent(ClientError::Cancelled)) => return,
                Err(RetryError::Permanent(e)) => e.to_string(),
                Err(RetryError::Exhausted {
                    attempts,
                    last_error,
                }) => last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| ClientError::Exhausted { attempts }.to_string()),
            };
            let mut control = lock(&self.control);
            if *self.state.borrow() == ConnectionState::Reconnecting {
                warn!(%reason, "giving up on reconnection");
                control.last_error = Some(reason);
                self.state.send_replace(ConnectionState::Failed);
            }
        })
    }

    /// Reacts to the end of session `generation`.
    async fn handle_disconnect(self: &Arc<Self>, generation: u64, cause: ClientError) {
        let (session, retry) = {
            let mut control = lock(&self.control);
            if control.session.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
            if *self.state.borrow() != ConnectionState::Connected {
                return;
            }
            let session = control.session.take();
            control.last_error = Some(cause.to_string());
            if cause.is_permanent() {
                warn!(error = %cause, "connection refused");
                self.state.send_replace(ConnectionState::Failed);
                (session, None)
            } else {
                info!(error = %cause, "connection lost, reconnecting");
                self.state.send_replace(ConnectionState::Reconnecting);
                let floor = control.retry_floor.take();
                (session, Some((floor, control.cancel.clone())))
            }
        };
        lock(&self.chunker).clear();
        if let Some(session) = session {
            session.shutdown(false).await;
        }
        if let Some((floor, cancel)) = retry {
            tokio::spawn(Self::reconnect_loop(Arc::clone(self), floor, cancel));
        }
    }

    fn note_retry_after(&self, retry_after: Option<u64>) {
        let floor = Duration::from_millis(retry_after.unwrap_or(0));
        debug!(retry_after_ms = floor.as_millis() as u64, "rate limited by relay");
        let mut control = lock(&self.control);
        control.retry_floor = Some(control.retry_floor.map_or(floor, |f| f.max(floor)));
    }

    /// Reassembles `data` and hands each complete message to every handler.
    fn deliver(&self, data: &str) {
        let Some(message) = lock(&self.chunker).receive(data) else {
            return;
        };
        let handlers: Vec<MessageHandler> = lock(&self.handlers)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(&message);
        }
    }
}

// ---------------------------------------------------------------------------
// Session tasks
// ---------------------------------------------------------------------------

async fn read_loop<C: Connector>(
    weak: Weak<Inner<C>>,
    conn: Arc<C::Connection>,
    generation: u64,
    mut counterpart: PeerId,
) {
    let cause = loop {
        let bytes = match conn.recv().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break ClientError::ConnectionLost("closed by relay".into()),
            Err(e) => break ClientError::Transport(e),
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match inner.codec.decode::<RelayFrame>(&bytes) {
            Ok(RelayFrame::Relay { data }) => inner.deliver(&data),
            Ok(RelayFrame::PeerJoined { peer_id, role })
                if role == inner.config.role.counterpart() =>
            {
                debug!(%peer_id, "counterpart rejoined");
                counterpart = peer_id;
            }
            Ok(RelayFrame::PeerLeft { peer_id }) if peer_id == counterpart => {
                break ClientError::ConnectionLost(format!("peer {peer_id} left"));
            }
            Ok(RelayFrame::Error {
                code,
                message,
                retry_after,
            }) => match code {
                Some(code) if code.is_permanent() => {
                    break ClientError::Refused { code, message };
                }
                Some(ErrorCode::RateLimited) => inner.note_retry_after(retry_after),
                code => warn!(?code, %message, "relay reported an error"),
            },
            Ok(other) => trace!(kind = other.kind(), "ignoring frame"),
            Err(e) => warn!(error = %e, "undecodable frame from relay"),
        }
    };
    if let Some(inner) = weak.upgrade() {
        inner.handle_disconnect(generation, cause).await;
    }
}

async fn write_loop<T: Connection>(
    conn: Arc<T>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    high_water_mark: usize,
) {
    if let Err(e) = drain_outbound(&*conn, &mut rx, high_water_mark).await {
        warn!(error = %e, "write failed, closing transport");
        let _ = conn.close().await;
    }
}

/// Feeds queued frames, flushing whenever the buffer passes the high-water
/// mark and whenever the queue runs dry.
async fn drain_outbound<T: Connection>(
    conn: &T,
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    high_water_mark: usize,
) -> Result<(), TransportError> {
    while let Some(frame) = rx.recv().await {
        let mut buffered = frame.len();
        conn.feed(&frame).await?;
        while let Ok(frame) = rx.try_recv() {
            if buffered >= high_water_mark {
                conn.flush().await?;
                buffered = 0;
            }
            buffered += frame.len();
            conn.feed(&frame).await?;
        }
        conn.flush().await?;
    }
    Ok(())
}
