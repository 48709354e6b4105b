//! The RPC client: pending-request table and event handlers.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{RemoteError, RpcError, RpcFrame};

/// Timeout applied by [`RpcClient::request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `chat.send` waits for a whole agent turn.
pub const CHAT_SEND_TIMEOUT: Duration = Duration::from_secs(120);

/// Where the client writes encoded frames.
///
/// Sending must not block; implementations queue the frame and return.
pub trait FrameSink: Send + Sync + 'static {
    /// Queues one encoded frame for sending.
    fn send_frame(&self, frame: String) -> Result<(), RpcError>;
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
type Completion = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Default)]
struct State {
    pending: HashMap<String, Completion>,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
    next_handler: u64,
    destroyed: bool,
}

struct Shared<S> {
    sink: S,
    state: Mutex<State>,
}

impl<S> Shared<S> {
    fn state(&self) -> MutexGuard<'_, State> {
        // Handlers run outside the lock, so a poisoned lock only means a
        // panic in our own bookkeeping; the state is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Multiplexes requests and events over a single [`FrameSink`].
///
/// Cloning is cheap and every clone shares the same pending table and
/// handlers.
pub struct RpcClient<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for RpcClient<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Removes the pending entry if the request future goes away early.
struct PendingGuard<'a, S> {
    shared: &'a Shared<S>,
    id: String,
}

impl<S> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        self.shared.state().pending.remove(&self.id);
    }
}

impl<S: FrameSink> RpcClient<S> {
    /// Creates a client that writes requests to `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Where requests are written.
    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    /// Sends `method` and waits up to [`DEFAULT_REQUEST_TIMEOUT`] for its
    /// response payload.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Sends `method` and waits up to `timeout` for its response payload.
    ///
    /// # Errors
    /// - [`RpcError::Remote`] when the response has `ok: false`
    /// - [`RpcError::Timeout`] when nothing matching arrives in time
    /// - [`RpcError::Destroyed`] when the client is torn down first
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = pairlink_protocol::random_hex(16);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state();
            if state.destroyed {
                return Err(RpcError::Destroyed);
            }
            state.pending.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        let frame = RpcFrame::Req {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let encoded = serde_json::to_string(&frame).map_err(RpcError::Encode)?;
        tracing::debug!(%method, id = &id[..8], "request");
        self.shared.sink.send_frame(encoded)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Destroyed),
            Err(_) => {
                tracing::debug!(%method, id = &id[..8], "request timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Like [`request_with_timeout`](Self::request_with_timeout), with
    /// typed params and result.
    pub async fn call<P, R>(&self, method: &str, params: &P, timeout: Duration) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(RpcError::Encode)?;
        let payload = self.request_with_timeout(method, params, timeout).await?;
        serde_json::from_value(payload).map_err(RpcError::Decode)
    }

    /// Registers `handler` for `event`. Several handlers may share an
    /// event; each runs once per event frame, in registration order.
    ///
    /// The handler stays registered until [`Subscription::unsubscribe`]
    /// or [`destroy`](Self::destroy); dropping the subscription does not
    /// remove it.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut state = self.shared.state();
        let id = state.next_handler;
        state.next_handler += 1;
        state
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        let weak: Weak<Shared<S>> = Arc::downgrade(&self.shared);
        Subscription {
            event: event.to_string(),
            id,
            remove: Box::new(move |event, id| {
                if let Some(shared) = weak.upgrade() {
                    let mut state = shared.state();
                    if let Some(list) = state.handlers.get_mut(event) {
                        list.retain(|(h, _)| *h != id);
                        if list.is_empty() {
                            state.handlers.remove(event);
                        }
                    }
                }
            }),
        }
    }

    /// Feeds one inbound message to the client.
    ///
    /// Anything that is not an RPC frame is ignored. A `res` settles the
    /// matching request; ids nobody is waiting for are dropped. An
    /// `event` runs every handler for it; a panicking handler is logged
    /// and the rest still run.
    pub fn handle_frame(&self, raw: &str) {
        let Ok(frame) = serde_json::from_str::<RpcFrame>(raw) else {
            tracing::trace!("ignoring non-rpc message");
            return;
        };
        match frame {
            RpcFrame::Res {
                id,
                ok,
                payload,
                error,
            } => {
                let Some(tx) = self.shared.state().pending.remove(&id) else {
                    tracing::debug!(%id, "response for unknown request");
                    return;
                };
                let result = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    Err(RpcError::Remote(error.unwrap_or_default()))
                };
                let _ = tx.send(result);
            }
            RpcFrame::Event { event, payload, .. } => {
                let handlers: Vec<Handler> = self
                    .shared
                    .state()
                    .handlers
                    .get(&event)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                        tracing::warn!(%event, "event handler panicked");
                    }
                }
            }
            RpcFrame::Req { method, .. } => {
                tracing::trace!(%method, "ignoring inbound request");
            }
        }
    }

    /// Fails every pending request with [`RpcError::Destroyed`] and drops
    /// all handlers. Later requests fail immediately.
    pub fn destroy(&self) {
        let pending = {
            let mut state = self.shared.state();
            state.destroyed = true;
            state.handlers.clear();
            std::mem::take(&mut state.pending)
        };
        let count = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::Destroyed));
        }
        tracing::debug!(pending = count, "rpc client destroyed");
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Whether [`destroy()`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.state().destroyed
    }
}

/// Handle returned by [`RpcClient::on`].
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    event: String,
    id: u64,
    remove: Box<dyn Fn(&str, u64) + Send + Sync>,
}

impl Subscription {
    /// The event name this subscription listens to.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Removes the handler.
    pub fn unsubscribe(self) {
        (self.remove)(&self.event, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}
