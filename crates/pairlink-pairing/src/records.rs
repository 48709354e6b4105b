//! Records kept in the store and the shapes the service hands back.
//!
//! Timestamps are Unix milliseconds. Field names are camelCase on the
//! wire so records stay readable to other tools sharing the store.

use pairlink_protocol::{PeerId, PeerRole, RoomId};
use serde::{Deserialize, Serialize};

/// `pairing:<CODE>`: a short code bound to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    /// Room the code resolves to.
    pub room_id: RoomId,
    /// Normalized `XXXX-XXXX` code.
    pub pairing_code: String,
    /// Creation time.
    pub created_at: u64,
    /// Last instant the code resolves.
    pub expires_at: u64,
}

impl PairingRecord {
    /// Whether the code lapsed before `now` (Unix milliseconds).
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at < now
    }
}

/// A peer listed in a stored room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPeer {
    /// The peer's id.
    pub peer_id: PeerId,
    /// The side it joined as.
    pub role: PeerRole,
    /// Join time.
    pub joined_at: u64,
}

/// `room:<ROOM_ID>`: marks a room as known to the pairing layer.
///
/// Live membership is tracked by the relay, not here; the peer list is
/// written empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    /// Always written empty.
    pub peers: Vec<RoomPeer>,
}

/// One device inside a [`UserRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    /// Token identifying the device.
    pub device_token: String,
    /// Display name chosen at registration.
    pub name: String,
    /// Last successful reconnection.
    pub last_seen: u64,
    /// Registration time.
    pub registered_at: u64,
}

/// `user:<USER_TOKEN>`: the devices sharing one stable room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Room shared by all of the user's devices.
    pub stable_room_id: RoomId,
    /// Registered devices, oldest first.
    pub devices: Vec<DeviceEntry>,
}

/// `device:<DEVICE_TOKEN>`: a single registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Room the device reconnects to.
    pub stable_room_id: RoomId,
    /// Owning user.
    pub user_token: String,
    /// Display name chosen at registration.
    pub name: String,
    /// Registration time.
    pub registered_at: u64,
    /// Last successful reconnection.
    pub last_seen: u64,
}

/// `blocklist:ip:<IP>`: a blocked client address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistEntry {
    /// Free-form note for operators.
    pub reason: String,
    /// When the block was added.
    pub blocked_at: u64,
    /// When the block lapses; `None` blocks forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl BlocklistEntry {
    /// Entries without an expiry never lapse.
    pub fn is_active(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at >= now)
    }
}

/// Result of [`create_room`](crate::PairingService::create_room).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    /// The new room.
    pub room_id: RoomId,
    /// Code the other side types in.
    pub pairing_code: String,
    /// When the code stops resolving.
    pub expires_at: u64,
}

/// Result of [`register_device`](crate::PairingService::register_device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Token for the user, shared by later devices.
    pub user_token: String,
    /// Token for this device.
    pub device_token: String,
    /// Room both sides reconnect to.
    pub stable_room_id: RoomId,
}

/// Result of [`reconnect`](crate::PairingService::reconnect).
///
/// A user-token reconnection lists the user's devices; a device-token
/// reconnection carries a fresh pairing code when one could be allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectInfo {
    /// Room to rejoin.
    pub stable_room_id: RoomId,
    /// The user's devices, for user-token reconnection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceEntry>>,
    /// Fresh code for device-token reconnection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    /// Expiry of `pairing_code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_expires_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_record_wire_shape() {
        let record = PairingRecord {
            room_id: RoomId::from("r1"),
            pairing_code: "ABCD-2345".into(),
            created_at: 10,
            expires_at: 20,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "roomId": "r1",
                "pairingCode": "ABCD-2345",
                "createdAt": 10,
                "expiresAt": 20
            })
        );
    }

    #[test]
    fn test_pairing_record_expired_strictly_after() {
        let record = PairingRecord {
            room_id: RoomId::from("r1"),
            pairing_code: "ABCD-2345".into(),
            created_at: 0,
            expires_at: 100,
        };
        assert!(!record.is_expired(100));
        assert!(record.is_expired(101));
    }

    #[test]
    fn test_blocklist_entry_without_expiry_is_permanent() {
        let entry: BlocklistEntry =
            serde_json::from_str(r#"{"reason":"abuse","blockedAt":5}"#).unwrap();
        assert!(entry.is_active(u64::MAX));
        let lapsed = BlocklistEntry {
            expires_at: Some(50),
            ..entry
        };
        assert!(lapsed.is_active(50));
        assert!(!lapsed.is_active(51));
    }

    #[test]
    fn test_reconnect_info_omits_absent_fields() {
        let info = ReconnectInfo {
            stable_room_id: RoomId::from("s"),
            devices: None,
            pairing_code: None,
            pairing_expires_at: None,
        };
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"stableRoomId":"s"}"#
        );
    }
}
