//! Relay room coordination for pairlink.
//!
//! Each room runs as an isolated Tokio task (actor model) that admits at
//! most two connections, attaches them as a client and a sidecar, and
//! relays frames between them under size and rate limits. A room with no
//! connections evicts itself once its idle timer fires.
//!
//! # Key types
//!
//! - [`RoomManager`]: routing table from room id to actor, lazy creation
//! - [`RoomHandle`]: send commands to a running room actor
//! - [`AdmissionTicket`]: a held connection slot, released on drop
//! - [`RelayLimits`]: payload, rate and idle settings
//! - [`Outbound`]: what the actor asks a connection task to write

mod config;
mod error;
mod manager;
mod room;
mod slots;

pub use config::RelayLimits;
pub use error::RoomError;
pub use manager::RoomManager;
pub use room::{Outbound, PeerInfo, PeerSender, RoomHandle, RoomInfo};
pub use slots::AdmissionTicket;
