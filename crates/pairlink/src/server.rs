//! `RelayServer` builder and accept loop.
//!
//! This is the entry point for running a pairlink relay. It ties the
//! layers together: transport admission, pairing lookups (blocklist and
//! device tokens) and the per-room actors.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pairlink_pairing::{KvStore, MemoryStore, PairingConfig, PairingService};
use pairlink_protocol::RoomId;
use pairlink_room::{RelayLimits, RoomError, RoomInfo, RoomManager};
use pairlink_transport::WebSocketTransport;

use crate::handler::handle_connection;
use crate::{PairlinkError, ServerConfig};

/// Shared server state passed to each connection task.
///
/// The room table sits behind a std `Mutex`: it is only held to look up a
/// handle or claim a slot, never across an `.await`.
pub(crate) struct ServerState<S> {
    pub(crate) rooms: Mutex<RoomManager>,
    pub(crate) pairing: PairingService<S>,
    pub(crate) config: ServerConfig,
}

impl<S> ServerState<S> {
    pub(crate) fn rooms(&self) -> MutexGuard<'_, RoomManager> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for configuring and starting a relay server.
///
/// # Example
///
/// ```rust,ignore
/// use pairlink::prelude::*;
///
/// let server = RelayServer::builder()
///     .bind("0.0.0.0:8787")
///     .require_device_token(true)
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct RelayServerBuilder {
    config: ServerConfig,
}

impl RelayServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the per-room relay limits.
    pub fn limits(mut self, limits: RelayLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Sets pairing code lifetimes.
    pub fn pairing_config(mut self, pairing: PairingConfig) -> Self {
        self.config.pairing = pairing;
        self
    }

    /// Requires a registered device token on every `/ws` connection.
    pub fn require_device_token(mut self, required: bool) -> Self {
        self.config.require_device_token = required;
        self
    }

    /// Binds the listener with an in-process store.
    pub async fn build(self) -> Result<RelayServer<MemoryStore>, PairlinkError> {
        self.build_with_store(MemoryStore::new()).await
    }

    /// Binds the listener with the given store.
    pub async fn build_with_store<S: KvStore>(
        self,
        store: S,
    ) -> Result<RelayServer<S>, PairlinkError> {
        let transport = WebSocketTransport::bind(&self.config.bind_addr).await?;

        let state = Arc::new(ServerState {
            rooms: Mutex::new(RoomManager::new(self.config.limits.clone())),
            pairing: PairingService::new(store, self.config.pairing.clone()),
            config: self.config,
        });

        Ok(RelayServer {
            transport,
            handle: ServerHandle { state },
        })
    }
}

impl Default for RelayServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound relay server.
///
/// Call [`run()`](Self::run) to start accepting connections. Grab a
/// [`ServerHandle`] first if anything else needs the rooms or the pairing
/// service while the server runs.
pub struct RelayServer<S> {
    transport: WebSocketTransport,
    handle: ServerHandle<S>,
}

impl RelayServer<MemoryStore> {
    /// Creates a new builder.
    pub fn builder() -> RelayServerBuilder {
        RelayServerBuilder::new()
    }
}

impl<S: KvStore> RelayServer<S> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, PairlinkError> {
        Ok(self.transport.local_addr()?)
    }

    /// Returns a handle to the live server state.
    pub fn handle(&self) -> ServerHandle<S> {
        self.handle.clone()
    }

    /// Runs the accept loop until the process is terminated.
    ///
    /// Each accepted socket gets its own task that runs admission, the
    /// upgrade and the frame pump.
    pub async fn run(self) -> Result<(), PairlinkError> {
        tracing::info!(
            require_device_token = self.handle.state.config.require_device_token,
            "pairlink relay running"
        );

        loop {
            match self.transport.accept_pending().await {
                Ok(pending) => {
                    let state = Arc::clone(&self.handle.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(pending, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Cloneable access to a server's rooms and pairing service.
pub struct ServerHandle<S> {
    state: Arc<ServerState<S>>,
}

impl<S> Clone for ServerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: KvStore> ServerHandle<S> {
    /// The pairing service backing admission checks.
    pub fn pairing(&self) -> &PairingService<S> {
        &self.state.pairing
    }

    /// The configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Live status of a room: its attached peers and roles.
    ///
    /// # Errors
    /// [`RoomError::NotFound`] if no live room has this id.
    pub async fn room_status(&self, room_id: &RoomId) -> Result<RoomInfo, PairlinkError> {
        let handle = self
            .state
            .rooms()
            .get(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;
        Ok(handle.get_info().await?)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        let mut rooms = self.state.rooms();
        rooms.prune();
        rooms.room_count()
    }
}
