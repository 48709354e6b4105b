//! Wire protocol for pairlink.
//!
//! This crate defines what travels over a relay connection:
//!
//! - **Frames** ([`RelayFrame`], [`ErrorCode`], [`PeerRole`]): the JSON
//!   control frames exchanged between peers and the relay.
//! - **Identifiers** ([`RoomId`], [`PeerId`]): string newtypes.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how frames become bytes.
//! - **Chunking** ([`MessageChunker`]): splitting application messages
//!   that are larger than one frame and reassembling them.
//!
//! It knows nothing about sockets or rooms.
//!
//! ```text
//! Transport (bytes) → Protocol (RelayFrame) → Room actor / Connection manager
//! ```

mod codec;
mod error;
mod types;

#[cfg(feature = "json")]
pub mod chunk;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{ErrorCode, PeerId, PeerRole, RelayFrame, RoomId, random_hex};

#[cfg(feature = "json")]
pub use chunk::{ChunkEnvelope, ChunkHeader, MAX_CHUNK_SIZE, MAX_PENDING_GROUPS, MessageChunker};
