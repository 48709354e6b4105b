//! Per-connection handler: admission, upgrade and the frame pump.
//!
//! Each accepted socket gets its own Tokio task running this handler.
//! The flow is:
//!   1. Blocklist lookup on the remote address
//!   2. Peek the request head; plain HTTP goes to the pairing endpoints
//!   3. Upgrade, with path, room and capacity checks answered as HTTP errors
//!   4. Device-token check, if the server requires one
//!   5. Register with the room actor, then pump frames both ways
//!   6. Report the disconnect and release the room slot

use std::sync::Arc;

use pairlink_pairing::{KvStore, PairingError};
use pairlink_protocol::{Codec, ErrorCode, JsonCodec, RelayFrame, RoomId};
use pairlink_room::{AdmissionTicket, Outbound, RoomError, RoomHandle};
use pairlink_transport::{
    CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION, Connection, PendingUpgrade, Rejection,
    TransportError, UpgradeRequest, WebSocketConnection,
};
use tokio::sync::mpsc;

use crate::server::ServerState;
use crate::{PairlinkError, routes};

/// The only path that upgrades.
pub const WS_PATH: &str = "/ws";

/// What a successful admission carries into the connection task.
struct Admission {
    room_id: RoomId,
    handle: RoomHandle,
    ticket: AdmissionTicket,
    token: Option<String>,
}

fn json_error(status: u16, message: &str) -> Rejection {
    Rejection::new(status, serde_json::json!({ "error": message }).to_string())
}

/// Decides whether an upgrade request may proceed. Runs before the `101`
/// is sent, so a rejection never touches room state.
fn admit<S>(
    state: &ServerState<S>,
    blocked: bool,
    req: &UpgradeRequest,
) -> Result<Admission, Rejection> {
    if blocked {
        return Err(json_error(403, "Forbidden"));
    }
    if req.path() != WS_PATH {
        return Err(json_error(404, "Not found"));
    }
    let room_id = req
        .param("room")
        .filter(|room| !room.is_empty())
        .map(RoomId::from)
        .ok_or_else(|| json_error(400, "Missing room param"))?;

    let capacity = state.config.limits.capacity;
    let (handle, ticket) = state.rooms().admit(&room_id).map_err(|e| match e {
        RoomError::RoomFull(_) => {
            json_error(429, &format!("Room is full (max {capacity} peers)"))
        }
        other => {
            tracing::warn!(%room_id, error = %other, "room admission failed");
            json_error(503, "Room unavailable")
        }
    })?;

    Ok(Admission {
        room_id,
        handle,
        ticket,
        token: req
            .param("token")
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    })
}

/// Handles a single socket from accept to close.
pub(crate) async fn handle_connection<S: KvStore>(
    pending: PendingUpgrade,
    state: Arc<ServerState<S>>,
) -> Result<(), PairlinkError> {
    let peer_addr = pending.peer_addr();
    let ip = peer_addr.ip().to_string();

    // --- Step 1: Blocklist ---
    let blocked = match state.pairing.is_blocked(&ip).await {
        Ok(blocked) => blocked,
        Err(e) => {
            tracing::error!(%ip, error = %e, "blocklist lookup failed, admitting");
            false
        }
    };

    // --- Step 2: Plain HTTP ---
    let head = match pending.peek_head().await {
        Ok(head) => head,
        Err(e) => {
            tracing::debug!(%peer_addr, error = %e, "no usable request");
            return Ok(());
        }
    };
    if !head.is_websocket() {
        return routes::serve(pending, head, &state, blocked).await;
    }

    // --- Step 3: Upgrade ---
    let upgraded = pending
        .upgrade(|req: &UpgradeRequest| admit(&state, blocked, req))
        .await;
    let (conn, admission) = match upgraded {
        Ok(upgraded) => upgraded,
        Err(TransportError::Rejected { status, .. }) => {
            tracing::debug!(%peer_addr, status, "connection refused before upgrade");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let Admission {
        room_id,
        handle,
        ticket,
        token,
    } = admission;
    let conn_id = conn.id();

    // --- Step 4: Device token ---
    if state.config.require_device_token && !device_allowed(&state, &conn, token.as_deref()).await? {
        tracing::info!(%room_id, %conn_id, %peer_addr, "device token rejected");
        return Ok(());
    }

    // --- Step 5: Relay ---
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.connect(conn_id, tx).await?;
    tracing::debug!(%room_id, %conn_id, %peer_addr, "connection attached");

    loop {
        tokio::select! {
            inbound = conn.recv() => match inbound {
                Ok(Some(data)) => {
                    if handle.frame(conn_id, data).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(%room_id, %conn_id, "connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%room_id, %conn_id, error = %e, "receive failed");
                    let _ = conn.close_with(CLOSE_INTERNAL_ERROR, "Internal error").await;
                    break;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(data)) => {
                    if let Err(e) = conn.send(&data).await {
                        tracing::debug!(%room_id, %conn_id, error = %e, "send failed");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = conn.close_with(code, &reason).await;
                    break;
                }
                // The room actor dropped our sender: it shut down.
                None => break,
            },
        }
    }

    // --- Step 6: Cleanup ---
    let _ = handle.disconnect(conn_id).await;
    drop(ticket);
    tracing::debug!(%room_id, %conn_id, "connection detached");
    Ok(())
}

/// Checks the device token. A refused connection has already been sent
/// an `auth-failed` error and closed when this returns `false`.
async fn device_allowed<S: KvStore>(
    state: &ServerState<S>,
    conn: &WebSocketConnection,
    token: Option<&str>,
) -> Result<bool, PairlinkError> {
    let refusal = match token {
        None => "Device token required",
        Some(token) => match state.pairing.verify_device(token).await {
            Ok(_) => return Ok(true),
            Err(PairingError::TokenNotFound { .. }) => "Unknown device token",
            Err(e) => {
                tracing::error!(error = %e, "device lookup failed");
                let _ = conn.close_with(CLOSE_INTERNAL_ERROR, "Internal error").await;
                return Ok(false);
            }
        },
    };

    let frame = RelayFrame::error(ErrorCode::AuthFailed, refusal);
    conn.send(&JsonCodec.encode(&frame)?).await?;
    conn.close_with(CLOSE_POLICY_VIOLATION, refusal).await?;
    Ok(false)
}
