//! JSON pairing endpoints served on the relay port next to `/ws`.
//!
//! | Route                | Method | Success                                  |
//! |----------------------|--------|------------------------------------------|
//! | `/create-room`       | POST   | 201 `{roomId, pairingCode, expiresAt}`   |
//! | `/resolve?code=`     | any    | 200 `{roomId}`                           |
//! | `/room-status?room=` | any    | 200 `{roomId, peers, hasSidecar, hasClient}` |
//! | `/register-device`   | POST   | 201 `{userToken, deviceToken, stableRoomId}` |
//! | `/reconnect`         | POST   | 200 `{stableRoomId, devices?, pairingCode?, pairingExpiresAt?}` |
//!
//! Errors are `{"error": "..."}`. Every response carries CORS headers for
//! the configured origin, and `OPTIONS` is answered before the blocklist.

use pairlink_pairing::{KvStore, PairingError, ReconnectToken};
use pairlink_protocol::RoomId;
use pairlink_transport::http::Method;
use pairlink_transport::{HttpReply, HttpRequest, PendingUpgrade, RequestHead, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::PairlinkError;
use crate::handler::WS_PATH;
use crate::server::ServerState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterDeviceBody {
    room_id: Option<String>,
    device_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectBody {
    user_token: Option<String>,
    device_token: Option<String>,
}

fn error(status: u16, message: &str) -> HttpReply {
    HttpReply::json(status, serde_json::json!({ "error": message }).to_string())
}

fn reply<T: Serialize>(status: u16, body: &T) -> HttpReply {
    match serde_json::to_string(body) {
        Ok(json) => HttpReply::json(status, json),
        Err(e) => {
            tracing::error!(error = %e, "response encoding failed");
            error(500, "Internal server error")
        }
    }
}

fn pairing_error(e: &PairingError) -> HttpReply {
    match e {
        PairingError::InvalidCode => {
            error(400, "Invalid pairing code format. Expected: XXXX-XXXX")
        }
        PairingError::CodeNotFound => error(404, "Pairing code not found"),
        PairingError::CodeExpired => error(410, "Pairing code expired"),
        PairingError::TokenNotFound { kind: "user" } => error(404, "User token not found"),
        PairingError::TokenNotFound { .. } => error(404, "Device token not found"),
        PairingError::MissingField(field) => {
            error(400, &format!("Missing required field: {field}"))
        }
        PairingError::CodeAllocation { .. } => error(500, "Failed to generate unique code"),
        PairingError::Store(_) | PairingError::Serde(_) => {
            tracing::error!(error = %e, "pairing store failure");
            error(500, "Internal server error")
        }
    }
}

fn require_post(request: &HttpRequest) -> Result<(), HttpReply> {
    if *request.method() == Method::POST {
        Ok(())
    } else {
        Err(error(405, "Method not allowed"))
    }
}

/// An empty body reads as `T::default()`.
fn json_body<T: DeserializeOwned + Default>(request: &HttpRequest) -> Result<T, HttpReply> {
    if request.body().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(request.body()).map_err(|_| error(400, "Invalid JSON body"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Reads a plain HTTP request off `pending` and answers it.
pub(crate) async fn serve<S: KvStore>(
    pending: PendingUpgrade,
    head: RequestHead,
    state: &ServerState<S>,
    blocked: bool,
) -> Result<(), PairlinkError> {
    let peer_addr = pending.peer_addr();
    let (request, responder) = match pending.into_http(head).await {
        Ok(exchange) => exchange,
        Err(TransportError::Rejected { status, .. }) => {
            tracing::debug!(%peer_addr, status, "http request refused");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let answer = route(state, blocked, &request).await;
    tracing::info!(
        %peer_addr,
        method = %request.method(),
        path = request.path(),
        status = answer.status,
        "pairing request"
    );
    responder.respond(&answer).await?;
    Ok(())
}

/// Dispatches one request to its endpoint.
pub(crate) async fn route<S: KvStore>(
    state: &ServerState<S>,
    blocked: bool,
    request: &HttpRequest,
) -> HttpReply {
    let answer = if *request.method() == Method::OPTIONS {
        HttpReply::empty(204)
    } else if blocked {
        error(403, "Forbidden")
    } else {
        match request.path() {
            WS_PATH => error(426, "Expected WebSocket upgrade"),
            "/create-room" => create_room(state, request).await,
            "/resolve" => resolve(state, request).await,
            "/room-status" => room_status(state, request).await,
            "/register-device" => register_device(state, request).await,
            "/reconnect" => reconnect(state, request).await,
            _ => error(404, "Not Found"),
        }
    };
    answer.allow_origin(state.config.allowed_origins.as_str())
}

async fn create_room<S: KvStore>(state: &ServerState<S>, request: &HttpRequest) -> HttpReply {
    if let Err(refusal) = require_post(request) {
        return refusal;
    }
    match state.pairing.create_room().await {
        Ok(created) => reply(201, &created),
        Err(e) => pairing_error(&e),
    }
}

async fn resolve<S: KvStore>(state: &ServerState<S>, request: &HttpRequest) -> HttpReply {
    let code = request.param("code").unwrap_or_default();
    match state.pairing.resolve(code).await {
        Ok(room_id) => reply(200, &serde_json::json!({ "roomId": room_id })),
        Err(e) => pairing_error(&e),
    }
}

/// Live rooms report their attached peers. A room the pairing layer knows
/// but nobody has joined yet reports an empty one.
async fn room_status<S: KvStore>(state: &ServerState<S>, request: &HttpRequest) -> HttpReply {
    let Some(room_id) = request
        .param("room")
        .filter(|room| !room.is_empty())
        .map(RoomId::from)
    else {
        return error(400, "Missing room parameter");
    };

    let live = state.rooms().get(&room_id);
    if let Some(handle) = live {
        if let Ok(info) = handle.get_info().await {
            return reply(200, &info);
        }
    }

    match state.pairing.room_exists(&room_id).await {
        Ok(true) => reply(
            200,
            &serde_json::json!({
                "roomId": room_id,
                "peers": [],
                "hasSidecar": false,
                "hasClient": false,
                "connections": 0,
            }),
        ),
        Ok(false) => error(404, "Room not found"),
        Err(e) => pairing_error(&e),
    }
}

async fn register_device<S: KvStore>(
    state: &ServerState<S>,
    request: &HttpRequest,
) -> HttpReply {
    if let Err(refusal) = require_post(request) {
        return refusal;
    }
    let body: RegisterDeviceBody = match json_body(request) {
        Ok(body) => body,
        Err(refusal) => return refusal,
    };
    let Some(room_id) = non_empty(body.room_id) else {
        return error(400, "Missing required field: roomId");
    };
    match state
        .pairing
        .register_device(&RoomId::from(room_id), body.device_name.as_deref())
        .await
    {
        Ok(registration) => reply(201, &registration),
        Err(e) => pairing_error(&e),
    }
}

async fn reconnect<S: KvStore>(state: &ServerState<S>, request: &HttpRequest) -> HttpReply {
    if let Err(refusal) = require_post(request) {
        return refusal;
    }
    let body: ReconnectBody = match json_body(request) {
        Ok(body) => body,
        Err(refusal) => return refusal,
    };
    let token = match (non_empty(body.user_token), non_empty(body.device_token)) {
        (Some(user), _) => ReconnectToken::User(user),
        (None, Some(device)) => ReconnectToken::Device(device),
        (None, None) => return error(400, "Must provide userToken or deviceToken"),
    };
    match state.pairing.reconnect(&token).await {
        Ok(info) => reply(200, &info),
        Err(e) => pairing_error(&e),
    }
}
