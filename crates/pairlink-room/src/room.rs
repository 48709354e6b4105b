//! Room actor: an isolated Tokio task that relays frames between the two
//! peers of one room.
//!
//! Each room runs in its own task and is reached only through its command
//! channel, so per-room state needs no locks. The actor keeps a side table
//! from [`ConnectionId`] to the connection's outbound channel, its peer
//! attachment (once it has joined) and its rate-limit counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pairlink_protocol::{
    Codec, ErrorCode, JsonCodec, PeerId, PeerRole, RelayFrame, RoomId,
};
use pairlink_transport::{CLOSE_POLICY_VIOLATION, ConnectionId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::slots::{AdmissionTicket, RoomSlots, SlotError};
use crate::{RelayLimits, RoomError};

/// Close code sent to peers when their room is shut down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Keepalive text answered directly by the actor.
const PING: &[u8] = b"ping";
const PONG: &[u8] = b"pong";

/// Something the room actor wants a connection task to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write this frame to the socket.
    Frame(Vec<u8>),
    /// Close the socket with this code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Channel sender for delivering outbound frames to one connection.
pub type PeerSender = mpsc::UnboundedSender<Outbound>;

/// Commands sent to a room actor through its channel.
pub(crate) enum RoomCommand {
    /// A connection was admitted and upgraded.
    Connect {
        conn_id: ConnectionId,
        outbound: PeerSender,
    },

    /// A raw frame arrived from a connection.
    Frame { conn_id: ConnectionId, data: Vec<u8> },

    /// A connection's socket closed.
    Disconnect { conn_id: ConnectionId },

    /// Request a status snapshot.
    GetInfo { reply: oneshot::Sender<RoomInfo> },

    /// Close every connection and stop.
    Shutdown,
}

/// A peer currently attached to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// The peer's self-chosen id.
    pub peer_id: PeerId,
    /// The peer's role.
    pub role: PeerRole,
}

/// A snapshot of a room, as served by the room-status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    /// The room's id.
    pub room_id: RoomId,
    /// Attached peers.
    pub peers: Vec<PeerInfo>,
    /// Whether a sidecar is attached.
    pub has_sidecar: bool,
    /// Whether a client is attached.
    pub has_client: bool,
    /// Open connections, joined or not.
    pub connections: usize,
    /// Time since the last accepted frame or admission.
    #[serde(skip)]
    pub idle_for: Duration,
}

/// Handle to a running room actor. Used to send commands to it.
///
/// Cheap to clone: an `mpsc::Sender` and an `Arc`. The
/// [`RoomManager`](crate::RoomManager) holds one per room.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    sender: mpsc::Sender<RoomCommand>,
    slots: Arc<RoomSlots>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("occupied", &self.slots.occupied())
            .finish()
    }
}

impl RoomHandle {
    /// Returns the room's id.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Claims a connection slot without waiting on the actor.
    ///
    /// Fails with [`RoomError::RoomFull`] when every slot is held, or
    /// [`RoomError::Evicted`] once the room has been torn down.
    pub fn try_admit(&self) -> Result<AdmissionTicket, RoomError> {
        self.slots.try_admit().map_err(|e| match e {
            SlotError::Full => RoomError::RoomFull(self.room_id.clone()),
            SlotError::Evicted => RoomError::Evicted(self.room_id.clone()),
        })
    }

    /// Whether the room has been evicted.
    pub fn is_evicted(&self) -> bool {
        self.slots.is_evicted()
    }

    /// Number of admitted connections.
    pub fn occupied(&self) -> usize {
        self.slots.occupied()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Registers an admitted connection with the actor.
    pub async fn connect(
        &self,
        conn_id: ConnectionId,
        outbound: PeerSender,
    ) -> Result<(), RoomError> {
        self.send(RoomCommand::Connect { conn_id, outbound }).await
    }

    /// Delivers one raw inbound frame.
    pub async fn frame(&self, conn_id: ConnectionId, data: Vec<u8>) -> Result<(), RoomError> {
        self.send(RoomCommand::Frame { conn_id, data }).await
    }

    /// Reports that a connection closed.
    pub async fn disconnect(&self, conn_id: ConnectionId) -> Result<(), RoomError> {
        self.send(RoomCommand::Disconnect { conn_id }).await
    }

    /// Requests a status snapshot.
    pub async fn get_info(&self) -> Result<RoomInfo, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RoomCommand::GetInfo { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| RoomError::Unavailable(self.room_id.clone()))
    }

    /// Tells the room to close every connection and stop.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.send(RoomCommand::Shutdown).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Attachment {
    peer_id: PeerId,
    role: PeerRole,
}

/// Per-connection side table entry.
struct PeerConnection {
    outbound: PeerSender,
    attachment: Option<Attachment>,
    // Counters live on the connection, so a repeated join cannot reset them.
    message_count: u32,
    window_start: Instant,
    violations: u32,
}

impl PeerConnection {
    fn send(&self, data: Vec<u8>) {
        // A closed receiver means the connection task is already gone.
        let _ = self.outbound.send(Outbound::Frame(data));
    }
}

/// The internal room actor state. Runs inside a Tokio task.
struct RoomActor {
    room_id: RoomId,
    limits: RelayLimits,
    codec: JsonCodec,
    slots: Arc<RoomSlots>,
    peers: HashMap<ConnectionId, PeerConnection>,
    last_activity: Instant,
    idle_deadline: Instant,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl RoomActor {
    /// Runs the actor loop until shutdown or idle eviction.
    async fn run(mut self) {
        info!(room_id = %self.room_id, "room actor started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        RoomCommand::Connect { conn_id, outbound } => {
                            self.handle_connect(conn_id, outbound);
                        }
                        RoomCommand::Frame { conn_id, data } => {
                            self.handle_frame(conn_id, data);
                        }
                        RoomCommand::Disconnect { conn_id } => {
                            self.handle_disconnect(conn_id);
                        }
                        RoomCommand::GetInfo { reply } => {
                            let _ = reply.send(self.info());
                        }
                        RoomCommand::Shutdown => {
                            info!(room_id = %self.room_id, "room shutting down");
                            self.close_all();
                            break;
                        }
                    }
                }
                _ = sleep_until(self.idle_deadline) => {
                    if self.slots.try_evict() {
                        info!(room_id = %self.room_id, "idle room evicted");
                        break;
                    }
                    trace!(
                        room_id = %self.room_id,
                        connections = self.slots.occupied(),
                        "idle check found live connections, rescheduling"
                    );
                    self.idle_deadline = Instant::now() + self.limits.idle_timeout;
                }
            }
        }

        info!(room_id = %self.room_id, "room actor stopped");
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.last_activity = now;
        self.idle_deadline = now + self.limits.idle_timeout;
    }

    fn handle_connect(&mut self, conn_id: ConnectionId, outbound: PeerSender) {
        self.peers.insert(
            conn_id,
            PeerConnection {
                outbound,
                attachment: None,
                message_count: 0,
                window_start: Instant::now(),
                violations: 0,
            },
        );
        self.touch();
        debug!(
            room_id = %self.room_id,
            %conn_id,
            connections = self.peers.len(),
            "connection admitted"
        );
    }

    fn handle_frame(&mut self, conn_id: ConnectionId, data: Vec<u8>) {
        if !self.peers.contains_key(&conn_id) {
            trace!(room_id = %self.room_id, %conn_id, "frame from unknown connection ignored");
            return;
        }

        if data == PING {
            self.send_raw(conn_id, PONG.to_vec());
            return;
        }

        if data.len() > self.limits.max_payload_bytes {
            warn!(
                room_id = %self.room_id,
                %conn_id,
                bytes = data.len(),
                max = self.limits.max_payload_bytes,
                "payload too large"
            );
            let message = format!(
                "Payload exceeds {} bytes",
                self.limits.max_payload_bytes
            );
            self.send_frame(conn_id, &RelayFrame::error(ErrorCode::PayloadTooLarge, message));
            self.record_violation(conn_id);
            return;
        }

        let frame: RelayFrame = match self.codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(room_id = %self.room_id, %conn_id, error = %e, "undecodable frame");
                self.send_frame(
                    conn_id,
                    &RelayFrame::error(ErrorCode::InvalidMessage, "Invalid message"),
                );
                return;
            }
        };

        match frame {
            RelayFrame::Join {
                room_id,
                peer_id,
                role,
            } => self.handle_join(conn_id, room_id, peer_id, role),
            RelayFrame::Relay { .. } => self.handle_relay(conn_id, data),
            other => {
                debug!(room_id = %self.room_id, %conn_id, kind = other.kind(), "unexpected frame type");
                self.send_frame(
                    conn_id,
                    &RelayFrame::error(
                        ErrorCode::InvalidMessage,
                        format!("Unexpected frame type: {}", other.kind()),
                    ),
                );
            }
        }
    }

    fn handle_join(&mut self, conn_id: ConnectionId, room_id: RoomId, peer_id: PeerId, role: PeerRole) {
        if room_id != self.room_id {
            self.send_frame(
                conn_id,
                &RelayFrame::error(ErrorCode::InvalidMessage, "Join names a different room"),
            );
            return;
        }

        let role_taken = self.peers.iter().any(|(id, p)| {
            *id != conn_id && p.attachment.as_ref().is_some_and(|a| a.role == role)
        });
        if role_taken {
            info!(room_id = %self.room_id, %peer_id, %role, "join refused, role already taken");
            self.send_frame(
                conn_id,
                &RelayFrame::error(ErrorCode::RoomFull, format!("A {role} is already in this room")),
            );
            return;
        }

        let announce = RelayFrame::PeerJoined {
            peer_id: peer_id.clone(),
            role,
        };
        self.broadcast_except(conn_id, &announce);

        let existing: Vec<RelayFrame> = self
            .peers
            .iter()
            .filter(|(id, _)| **id != conn_id)
            .filter_map(|(_, p)| p.attachment.as_ref())
            .map(|a| RelayFrame::PeerJoined {
                peer_id: a.peer_id.clone(),
                role: a.role,
            })
            .collect();
        for frame in &existing {
            self.send_frame(conn_id, frame);
        }

        if let Some(peer) = self.peers.get_mut(&conn_id) {
            peer.attachment = Some(Attachment {
                peer_id: peer_id.clone(),
                role,
            });
        }
        self.touch();
        info!(room_id = %self.room_id, %conn_id, %peer_id, %role, "peer joined");
    }

    fn handle_relay(&mut self, conn_id: ConnectionId, data: Vec<u8>) {
        let window = self.limits.rate_window;
        let max = self.limits.max_messages_per_window;

        let Some(peer) = self.peers.get_mut(&conn_id) else {
            return;
        };
        if peer.attachment.is_none() {
            self.send_frame(
                conn_id,
                &RelayFrame::error(ErrorCode::NotJoined, "Must join before relaying"),
            );
            return;
        }

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(peer.window_start);
        if elapsed >= window {
            peer.window_start = now;
            peer.message_count = 0;
        }
        peer.message_count += 1;

        if peer.message_count > max {
            let remaining = window.saturating_sub(now.saturating_duration_since(peer.window_start));
            let retry_after = (remaining.as_millis() as u64).max(1);
            warn!(
                room_id = %self.room_id,
                %conn_id,
                count = peer.message_count,
                retry_after_ms = retry_after,
                "rate limit exceeded"
            );
            self.send_frame(conn_id, &RelayFrame::rate_limited(retry_after));
            self.record_violation(conn_id);
            return;
        }

        for (id, other) in &self.peers {
            if *id != conn_id && other.attachment.is_some() {
                other.send(data.clone());
            }
        }
        self.touch();
    }

    fn record_violation(&mut self, conn_id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(&conn_id) else {
            return;
        };
        peer.violations += 1;
        if peer.violations < self.limits.max_violations {
            return;
        }

        warn!(
            room_id = %self.room_id,
            %conn_id,
            violations = peer.violations,
            "too many policy violations, closing connection"
        );
        let _ = peer.outbound.send(Outbound::Close {
            code: CLOSE_POLICY_VIOLATION,
            reason: "policy violation".into(),
        });
        self.handle_disconnect(conn_id);
    }

    fn handle_disconnect(&mut self, conn_id: ConnectionId) {
        let Some(peer) = self.peers.remove(&conn_id) else {
            return;
        };
        if let Some(attachment) = peer.attachment {
            info!(
                room_id = %self.room_id,
                %conn_id,
                peer_id = %attachment.peer_id,
                connections = self.peers.len(),
                "peer left"
            );
            self.broadcast_except(
                conn_id,
                &RelayFrame::PeerLeft {
                    peer_id: attachment.peer_id,
                },
            );
        } else {
            debug!(room_id = %self.room_id, %conn_id, "connection closed before joining");
        }
    }

    fn close_all(&mut self) {
        self.slots.force_evict();
        for (_, peer) in self.peers.drain() {
            let _ = peer.outbound.send(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "room shut down".into(),
            });
        }
    }

    fn encode(&self, frame: &RelayFrame) -> Option<Vec<u8>> {
        match self.codec.encode(frame) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "failed to encode frame");
                None
            }
        }
    }

    fn send_frame(&self, conn_id: ConnectionId, frame: &RelayFrame) {
        if let Some(bytes) = self.encode(frame) {
            self.send_raw(conn_id, bytes);
        }
    }

    fn send_raw(&self, conn_id: ConnectionId, data: Vec<u8>) {
        if let Some(peer) = self.peers.get(&conn_id) {
            peer.send(data);
        }
    }

    fn broadcast_except(&self, except: ConnectionId, frame: &RelayFrame) {
        let Some(bytes) = self.encode(frame) else {
            return;
        };
        for (id, peer) in &self.peers {
            if *id != except && peer.attachment.is_some() {
                peer.send(bytes.clone());
            }
        }
    }

    fn info(&self) -> RoomInfo {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .values()
            .filter_map(|p| p.attachment.as_ref())
            .map(|a| PeerInfo {
                peer_id: a.peer_id.clone(),
                role: a.role,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        RoomInfo {
            room_id: self.room_id.clone(),
            has_sidecar: peers.iter().any(|p| p.role == PeerRole::Sidecar),
            has_client: peers.iter().any(|p| p.role == PeerRole::Client),
            peers,
            connections: self.peers.len(),
            idle_for: self.last_activity.elapsed(),
        }
    }
}

/// Spawns a new room actor task and returns a handle to communicate with it.
pub(crate) fn spawn_room(room_id: RoomId, limits: RelayLimits) -> RoomHandle {
    let (tx, rx) = mpsc::channel(limits.channel_size);
    let slots = RoomSlots::new(limits.capacity);
    let now = Instant::now();

    let actor = RoomActor {
        room_id: room_id.clone(),
        idle_deadline: now + limits.idle_timeout,
        last_activity: now,
        limits,
        codec: JsonCodec,
        slots: Arc::clone(&slots),
        peers: HashMap::new(),
        receiver: rx,
    };

    tokio::spawn(actor.run());

    RoomHandle {
        room_id,
        sender: tx,
        slots,
    }
}
