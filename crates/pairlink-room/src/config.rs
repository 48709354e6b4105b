//! Relay limits for a room.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Size, rate, and lifetime limits applied by every room actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayLimits {
    /// Maximum concurrent connections per room (one client, one sidecar).
    pub capacity: usize,

    /// Largest accepted inbound frame, in bytes.
    pub max_payload_bytes: usize,

    /// Length of the rate-limit window.
    pub rate_window: Duration,

    /// Relay frames allowed per connection per window.
    pub max_messages_per_window: u32,

    /// Policy violations (rate or size) before the connection is closed.
    pub max_violations: u32,

    /// How long a room may sit without accepted activity before its
    /// eviction check runs.
    pub idle_timeout: Duration,

    /// Capacity of each room actor's command channel.
    pub channel_size: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            capacity: 2,
            max_payload_bytes: 256 * 1024,
            rate_window: Duration::from_secs(1),
            max_messages_per_window: 100,
            max_violations: 5,
            idle_timeout: Duration::from_secs(10 * 60),
            channel_size: 256,
        }
    }
}

impl RelayLimits {
    /// Clamp and fix any out-of-range values so the limits are safe to use.
    ///
    /// Called by [`RoomManager::new`](crate::RoomManager::new). Rules:
    /// - `capacity` kept within `1..=2` (two roles exist).
    /// - zero counts, sizes and durations are raised to a minimum.
    pub fn validated(mut self) -> Self {
        if !(1..=2).contains(&self.capacity) {
            warn!(capacity = self.capacity, "room capacity must be 1 or 2, clamping");
            self.capacity = self.capacity.clamp(1, 2);
        }
        if self.max_payload_bytes < 1024 {
            warn!(bytes = self.max_payload_bytes, "max_payload_bytes below 1 KiB, raising");
            self.max_payload_bytes = 1024;
        }
        if self.rate_window.is_zero() {
            warn!("rate_window of zero, using 1s");
            self.rate_window = Duration::from_secs(1);
        }
        self.max_messages_per_window = self.max_messages_per_window.max(1);
        self.max_violations = self.max_violations.max(1);
        if self.idle_timeout < Duration::from_secs(1) {
            warn!("idle_timeout below 1s, raising");
            self.idle_timeout = Duration::from_secs(1);
        }
        self.channel_size = self.channel_size.max(1);
        self
    }
}
