//! Error types for the room layer.

use pairlink_protocol::RoomId;

/// Errors that can occur during room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist.
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// Every connection slot in the room is taken.
    #[error("room {0} is full")]
    RoomFull(RoomId),

    /// The room was evicted after idling and accepts no new connections.
    #[error("room {0} was evicted")]
    Evicted(RoomId),

    /// The room's command channel is closed.
    #[error("room {0} is unavailable")]
    Unavailable(RoomId),
}
