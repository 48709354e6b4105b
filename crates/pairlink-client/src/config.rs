//! Connection manager configuration.

use std::time::Duration;

use pairlink_backoff::BackoffConfig;
use pairlink_protocol::{MAX_CHUNK_SIZE, PeerId, PeerRole, RoomId};

/// Where to connect, as whom, and the timing knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay base URL, e.g. `ws://relay.example:8787`.
    pub url: String,
    /// Room to join.
    pub room_id: RoomId,
    /// Kept across reconnections so the counterpart sees the same peer.
    pub peer_id: PeerId,
    /// Side of the pairing this end plays.
    pub role: PeerRole,
    /// Registered device token, sent as `?token=`.
    pub device_token: Option<String>,
    /// How long a fresh transport may wait for the counterpart to appear.
    pub handshake_timeout: Duration,
    /// Bytes the writer buffers before forcing a flush.
    pub high_water_mark: usize,
    /// Largest message sent in one relay frame before chunking.
    pub max_chunk_size: usize,
    /// Reconnection delays and attempt limit.
    pub backoff: BackoffConfig,
}

impl ConnectionConfig {
    /// A client-role configuration with a random peer id and defaults.
    pub fn new(url: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            url: url.into(),
            room_id,
            peer_id: PeerId::random(),
            role: PeerRole::Client,
            device_token: None,
            handshake_timeout: Duration::from_secs(30),
            high_water_mark: 128 * 1024,
            max_chunk_size: MAX_CHUNK_SIZE,
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets which side of the pairing this peer plays.
    pub fn with_role(mut self, role: PeerRole) -> Self {
        self.role = role;
        self
    }

    /// Replaces the random peer id.
    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    /// Sends a registered device token with every connection attempt.
    pub fn with_device_token(mut self, token: impl Into<String>) -> Self {
        self.device_token = Some(token.into());
        self
    }

    /// Sets the reconnection delays and attempt limit.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// How long to wait for the counterpart after joining.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Largest encoded slice of an outbound message per relay frame.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Raises zero values to usable minimums.
    pub fn validated(mut self) -> Self {
        if self.handshake_timeout.is_zero() {
            tracing::warn!("handshake_timeout of zero, using 30s");
            self.handshake_timeout = Duration::from_secs(30);
        }
        self.high_water_mark = self.high_water_mark.max(1);
        if self.max_chunk_size == 0 {
            tracing::warn!("max_chunk_size of zero, using default");
            self.max_chunk_size = MAX_CHUNK_SIZE;
        }
        self.backoff = self.backoff.validated();
        self
    }

    /// The relay's WebSocket endpoint for this room:
    /// `{url}/ws?room=<room>[&token=<token>]`.
    pub fn endpoint(&self) -> String {
        let mut url = self.url.trim_end_matches('/').to_string();
        url.push_str("/ws?room=");
        url.push_str(&urlencoding::encode(self.room_id.as_str()));
        if let Some(token) = &self.device_token {
            url.push_str("&token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }
}
