//! The pairing service: codes, device tokens and the blocklist.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pairlink_protocol::RoomId;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::code::{generate_code, generate_token, normalize_code};
use crate::records::{
    BlocklistEntry, CreatedRoom, DeviceEntry, DeviceRecord, DeviceRegistration, PairingRecord,
    ReconnectInfo, RoomRecord, UserRecord,
};
use crate::{KvStore, PairingConfig, PairingError};

const DEFAULT_DEVICE_NAME: &str = "Default Device";

/// Current time as Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn after(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl.as_millis() as u64)
}

fn pairing_key(code: &str) -> String {
    format!("pairing:{code}")
}

fn room_key(room_id: &RoomId) -> String {
    format!("room:{room_id}")
}

fn user_key(token: &str) -> String {
    format!("user:{token}")
}

fn device_key(token: &str) -> String {
    format!("device:{token}")
}

fn blocklist_key(ip: &str) -> String {
    format!("blocklist:ip:{ip}")
}

/// The credential a returning device presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectToken {
    /// A user token; lists every device.
    User(String),
    /// A device token; refreshes the device and mints a code.
    Device(String),
}

/// Issues and resolves pairing codes and device tokens over a [`KvStore`].
///
/// The service holds no state of its own; clones of the store it wraps
/// see the same records.
pub struct PairingService<S> {
    store: S,
    config: PairingConfig,
}

impl<S: KvStore> PairingService<S> {
    /// Wraps `store`. Out-of-range settings in `config` are corrected.
    pub fn new(store: S, config: PairingConfig) -> Self {
        Self {
            store,
            config: config.validated(),
        }
    }

    /// The validated configuration.
    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a room with a fresh id and a pairing code pointing at it.
    ///
    /// # Errors
    /// [`PairingError::CodeAllocation`] when every attempted code was
    /// already taken.
    pub async fn create_room(&self) -> Result<CreatedRoom, PairingError> {
        let room_id = RoomId::random();
        let record = self
            .allocate_code(&room_id, self.config.pairing_expiry)
            .await?;
        self.put_json(&room_key(&room_id), &RoomRecord::default())
            .await?;
        tracing::info!(%room_id, "room created for pairing");
        Ok(CreatedRoom {
            room_id,
            pairing_code: record.pairing_code,
            expires_at: record.expires_at,
        })
    }

    /// Resolves a typed code (any case) to its room.
    ///
    /// Resolution leaves the code in place; it stays usable until it
    /// expires.
    pub async fn resolve(&self, code: &str) -> Result<RoomId, PairingError> {
        let code = normalize_code(code).ok_or(PairingError::InvalidCode)?;
        let record: PairingRecord = self
            .get_json(&pairing_key(&code))
            .await?
            .ok_or(PairingError::CodeNotFound)?;
        if record.is_expired(unix_millis()) {
            tracing::debug!(%code, "expired pairing code presented");
            return Err(PairingError::CodeExpired);
        }
        Ok(record.room_id)
    }

    /// Registers a device under a new user and a new stable room.
    ///
    /// `room_id` is the room the device paired through; it must be
    /// present but the stable room is always freshly minted.
    pub async fn register_device(
        &self,
        room_id: &RoomId,
        name: Option<&str>,
    ) -> Result<DeviceRegistration, PairingError> {
        if room_id.as_str().is_empty() {
            return Err(PairingError::MissingField("roomId"));
        }
        let user_token = generate_token();
        let device_token = generate_token();
        let stable_room_id = RoomId::random();
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_DEVICE_NAME)
            .to_string();
        let now = unix_millis();

        let user = UserRecord {
            stable_room_id: stable_room_id.clone(),
            devices: vec![DeviceEntry {
                device_token: device_token.clone(),
                name: name.clone(),
                last_seen: now,
                registered_at: now,
            }],
        };
        let device = DeviceRecord {
            stable_room_id: stable_room_id.clone(),
            user_token: user_token.clone(),
            name,
            registered_at: now,
            last_seen: now,
        };

        self.put_json(&user_key(&user_token), &user).await?;
        self.put_json(&device_key(&device_token), &device).await?;
        self.put_json(&room_key(&stable_room_id), &RoomRecord::default())
            .await?;

        tracing::info!(paired_via = %room_id, %stable_room_id, "device registered");
        Ok(DeviceRegistration {
            user_token,
            device_token,
            stable_room_id,
        })
    }

    /// Finds the stable room for a returning user or device.
    ///
    /// The room record is recreated if it went missing. A device
    /// reconnection also refreshes the device's `lastSeen` and mints a
    /// pairing code with the reconnect expiry; if no code can be
    /// allocated the response simply carries none.
    pub async fn reconnect(&self, token: &ReconnectToken) -> Result<ReconnectInfo, PairingError> {
        match token {
            ReconnectToken::User(user_token) => {
                let user: UserRecord = self
                    .get_json(&user_key(user_token))
                    .await?
                    .ok_or(PairingError::TokenNotFound { kind: "user" })?;
                self.ensure_room(&user.stable_room_id).await?;
                Ok(ReconnectInfo {
                    stable_room_id: user.stable_room_id,
                    devices: Some(user.devices),
                    pairing_code: None,
                    pairing_expires_at: None,
                })
            }
            ReconnectToken::Device(device_token) => {
                let mut device = self.verify_device(device_token).await?;
                self.ensure_room(&device.stable_room_id).await?;

                let now = unix_millis();
                device.last_seen = now;
                self.put_json(&device_key(device_token), &device).await?;

                let user_key = user_key(&device.user_token);
                if let Some(mut user) = self.get_json::<UserRecord>(&user_key).await? {
                    if let Some(entry) = user
                        .devices
                        .iter_mut()
                        .find(|d| d.device_token == *device_token)
                    {
                        entry.last_seen = now;
                        self.put_json(&user_key, &user).await?;
                    }
                }

                let pairing = match self
                    .allocate_code(&device.stable_room_id, self.config.reconnect_expiry)
                    .await
                {
                    Ok(record) => Some(record),
                    Err(PairingError::CodeAllocation { attempts }) => {
                        tracing::warn!(attempts, "no pairing code for reconnecting device");
                        None
                    }
                    Err(e) => return Err(e),
                };

                tracing::info!(stable_room_id = %device.stable_room_id, "device reconnected");
                Ok(ReconnectInfo {
                    stable_room_id: device.stable_room_id,
                    devices: None,
                    pairing_expires_at: pairing.as_ref().map(|p| p.expires_at),
                    pairing_code: pairing.map(|p| p.pairing_code),
                })
            }
        }
    }

    /// Whether a room record exists for `room_id`: the room was created,
    /// registered as a stable room, or recreated by a reconnection.
    pub async fn room_exists(&self, room_id: &RoomId) -> Result<bool, PairingError> {
        Ok(self.store.get(&room_key(room_id)).await?.is_some())
    }

        /// Looks up a registered device by token.
    pub async fn verify_device(&self, device_token: &str) -> Result<DeviceRecord, PairingError> {
        self.get_json(&device_key(device_token))
            .await?
            .ok_or(PairingError::TokenNotFound { kind: "device" })
    }

    /// Blocks a client address, optionally for a limited time.
    pub async fn block_ip(
        &self,
        ip: &str,
        reason: &str,
        ttl: Option<Duration>,
    ) -> Result<(), PairingError> {
        let now = unix_millis();
        let entry = BlocklistEntry {
            reason: reason.to_string(),
            blocked_at: now,
            expires_at: ttl.map(|ttl| after(now, ttl)),
        };
        self.put_json(&blocklist_key(ip), &entry).await?;
        tracing::warn!(%ip, %reason, "ip blocked");
        Ok(())
    }

    /// Lifts a block.
    pub async fn unblock_ip(&self, ip: &str) -> Result<(), PairingError> {
        self.store.delete(&blocklist_key(ip)).await?;
        Ok(())
    }

    /// Whether `ip` has an active blocklist entry. Lapsed entries are
    /// removed on sight.
    pub async fn is_blocked(&self, ip: &str) -> Result<bool, PairingError> {
        let key = blocklist_key(ip);
        let Some(entry) = self.get_json::<BlocklistEntry>(&key).await? else {
            return Ok(false);
        };
        if entry.is_active(unix_millis()) {
            return Ok(true);
        }
        self.store.delete(&key).await?;
        Ok(false)
    }

    async fn allocate_code(
        &self,
        room_id: &RoomId,
        ttl: Duration,
    ) -> Result<PairingRecord, PairingError> {
        let attempts = self.config.max_code_attempts;
        for attempt in 1..=attempts {
            let now = unix_millis();
            let record = PairingRecord {
                room_id: room_id.clone(),
                pairing_code: generate_code(),
                created_at: now,
                expires_at: after(now, ttl),
            };
            let value = serde_json::to_string(&record)?;
            if self
                .store
                .put_if_absent(&pairing_key(&record.pairing_code), value)
                .await?
            {
                return Ok(record);
            }
            tracing::debug!(attempt, "pairing code collision");
        }
        Err(PairingError::CodeAllocation { attempts })
    }

    async fn ensure_room(&self, room_id: &RoomId) -> Result<(), PairingError> {
        let value = serde_json::to_string(&RoomRecord::default())?;
        if self.store.put_if_absent(&room_key(room_id), value).await? {
            tracing::debug!(%room_id, "room record recreated");
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PairingError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), PairingError> {
        self.store.put(key, serde_json::to_string(value)?).await?;
        Ok(())
    }
}
