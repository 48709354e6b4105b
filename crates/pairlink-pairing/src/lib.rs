//! Pairing for pairlink.
//!
//! Turns rooms into something a person can type: short `XXXX-XXXX` codes
//! bound to a room id with an expiry, plus long-lived device and user
//! tokens that let a paired machine find its stable room again without a
//! new code. Also owns the IP blocklist the relay server consults before
//! accepting a connection.
//!
//! All state lives in a [`KvStore`]. [`MemoryStore`] is the in-process
//! implementation; anything with an atomic put-if-absent can back it.
//!
//! ```text
//! pairing:<CODE>        → PairingRecord
//! room:<ROOM_ID>        → RoomRecord
//! user:<USER_TOKEN>     → UserRecord
//! device:<DEVICE_TOKEN> → DeviceRecord
//! blocklist:ip:<IP>     → BlocklistEntry
//! ```

mod code;
mod config;
mod error;
mod records;
mod service;
mod store;

pub use code::{CODE_ALPHABET, generate_code, generate_token, normalize_code};
pub use config::PairingConfig;
pub use error::{PairingError, StoreError};
pub use records::{
    BlocklistEntry, CreatedRoom, DeviceEntry, DeviceRecord, DeviceRegistration, PairingRecord,
    ReconnectInfo, RoomPeer, RoomRecord, UserRecord,
};
pub use service::{PairingService, ReconnectToken, unix_millis};
pub use store::{KvStore, MemoryStore};
