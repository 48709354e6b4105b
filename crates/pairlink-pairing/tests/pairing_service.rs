//! Integration tests for the pairing service against in-memory stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pairlink_pairing::{
    CreatedRoom, DeviceRecord, KvStore, MemoryStore, PairingConfig, PairingError, PairingRecord,
    PairingService, ReconnectToken, StoreError, UserRecord, unix_millis,
};
use pairlink_protocol::RoomId;

fn service() -> PairingService<MemoryStore> {
    PairingService::new(MemoryStore::new(), PairingConfig::default())
}

async fn load<T: serde::de::DeserializeOwned>(store: &MemoryStore, key: &str) -> Option<T> {
    store
        .get(key)
        .await
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

/// Claims every key is already taken.
#[derive(Default)]
struct CollidingStore {
    inner: MemoryStore,
    put_if_absent_calls: Arc<AtomicU32>,
}

impl KvStore for CollidingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn put_if_absent(&self, key: &str, _value: String) -> Result<bool, StoreError> {
        self.put_if_absent_calls.fetch_add(1, Ordering::SeqCst);
        if key.starts_with("pairing:") {
            return Ok(false);
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Fails every operation.
struct BrokenStore;

impl KvStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError("bucket unavailable".into()))
    }

    async fn put(&self, _key: &str, _value: String) -> Result<(), StoreError> {
        Err(StoreError("bucket unavailable".into()))
    }

    async fn put_if_absent(&self, _key: &str, _value: String) -> Result<bool, StoreError> {
        Err(StoreError("bucket unavailable".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError("bucket unavailable".into()))
    }
}

// =========================================================================
// create_room / resolve
// =========================================================================

#[tokio::test]
async fn test_create_room_writes_pairing_and_room_records() {
    let service = service();
    let before = unix_millis();
    let CreatedRoom {
        room_id,
        pairing_code,
        expires_at,
    } = service.create_room().await.unwrap();

    let record: PairingRecord = load(service.store(), &format!("pairing:{pairing_code}"))
        .await
        .expect("pairing record");
    assert_eq!(record.room_id, room_id);
    assert_eq!(record.expires_at, expires_at);
    assert_eq!(record.expires_at - record.created_at, 30 * 60 * 1000);
    assert!(record.created_at >= before);

    let room = service
        .store()
        .get(&format!("room:{room_id}"))
        .await
        .unwrap();
    assert_eq!(room.as_deref(), Some(r#"{"peers":[]}"#));
}

#[tokio::test]
async fn test_room_exists_after_create_and_register() {
    let service = service();
    assert!(!service.room_exists(&RoomId::from("nowhere")).await.unwrap());

    let created = service.create_room().await.unwrap();
    assert!(service.room_exists(&created.room_id).await.unwrap());

    let registration = service
        .register_device(&created.room_id, None)
        .await
        .unwrap();
    assert!(service.room_exists(&registration.stable_room_id).await.unwrap());
}

#[tokio::test]
async fn test_create_room_first_attempt_succeeds_without_collisions() {
    let service = service();
    service.create_room().await.unwrap();
    // One pairing record plus one room record.
    assert_eq!(service.store().len().await, 2);
}

#[tokio::test]
async fn test_create_room_always_colliding_fails_after_five_attempts() {
    let store = CollidingStore::default();
    let calls = Arc::clone(&store.put_if_absent_calls);
    let service = PairingService::new(store, PairingConfig::default());

    let err = service.create_room().await.unwrap_err();
    assert!(matches!(err, PairingError::CodeAllocation { attempts: 5 }));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(service.store().inner.is_empty().await);
}

#[tokio::test]
async fn test_resolve_is_case_insensitive_and_repeatable() {
    let service = service();
    let created = service.create_room().await.unwrap();
    let lower = created.pairing_code.to_lowercase();

    assert_eq!(service.resolve(&lower).await.unwrap(), created.room_id);
    assert_eq!(
        service.resolve(&created.pairing_code).await.unwrap(),
        created.room_id
    );
}

#[tokio::test]
async fn test_resolve_bad_format_is_invalid_code() {
    let service = service();
    for bad in ["", "ABCD", "ABCD-12", "ABCD--1234", "ABCD 2345"] {
        assert!(
            matches!(service.resolve(bad).await, Err(PairingError::InvalidCode)),
            "{bad:?}"
        );
    }
}

#[tokio::test]
async fn test_resolve_unknown_code_is_not_found() {
    let service = service();
    assert!(matches!(
        service.resolve("ZZZZ-9999").await,
        Err(PairingError::CodeNotFound)
    ));
}

#[tokio::test]
async fn test_resolve_expired_code_is_expired() {
    let service = service();
    let record = PairingRecord {
        room_id: RoomId::from("old-room"),
        pairing_code: "ABCD-2345".into(),
        created_at: 1_000,
        expires_at: 2_000,
    };
    service
        .store()
        .put("pairing:ABCD-2345", serde_json::to_string(&record).unwrap())
        .await
        .unwrap();

    assert!(matches!(
        service.resolve("abcd-2345").await,
        Err(PairingError::CodeExpired)
    ));
}

#[tokio::test]
async fn test_resolve_store_failure_surfaces_store_error() {
    let service = PairingService::new(BrokenStore, PairingConfig::default());
    assert!(matches!(
        service.resolve("ABCD-2345").await,
        Err(PairingError::Store(_))
    ));
}

// =========================================================================
// Devices
// =========================================================================

#[tokio::test]
async fn test_register_device_persists_user_device_and_room() {
    let service = service();
    let paired = RoomId::from("paired-room");
    let reg = service
        .register_device(&paired, Some("Work laptop"))
        .await
        .unwrap();
    assert_ne!(reg.stable_room_id, paired);

    let user: UserRecord = load(service.store(), &format!("user:{}", reg.user_token))
        .await
        .unwrap();
    assert_eq!(user.stable_room_id, reg.stable_room_id);
    assert_eq!(user.devices.len(), 1);
    assert_eq!(user.devices[0].device_token, reg.device_token);
    assert_eq!(user.devices[0].name, "Work laptop");

    let device = service.verify_device(&reg.device_token).await.unwrap();
    assert_eq!(device.user_token, reg.user_token);
    assert_eq!(device.stable_room_id, reg.stable_room_id);

    assert!(
        service
            .store()
            .get(&format!("room:{}", reg.stable_room_id))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_register_device_without_name_uses_default() {
    let service = service();
    let reg = service
        .register_device(&RoomId::from("r"), Some("   "))
        .await
        .unwrap();
    let device = service.verify_device(&reg.device_token).await.unwrap();
    assert_eq!(device.name, "Default Device");
}

#[tokio::test]
async fn test_register_device_empty_room_is_missing_field() {
    let service = service();
    assert!(matches!(
        service.register_device(&RoomId::from(""), None).await,
        Err(PairingError::MissingField("roomId"))
    ));
}

#[tokio::test]
async fn test_verify_device_unknown_token_not_found() {
    let service = service();
    assert!(matches!(
        service.verify_device("nope").await,
        Err(PairingError::TokenNotFound { kind: "device" })
    ));
}

// =========================================================================
// Reconnect
// =========================================================================

#[tokio::test]
async fn test_reconnect_by_user_lists_devices_and_recreates_room() {
    let service = service();
    let reg = service
        .register_device(&RoomId::from("r"), Some("Desk"))
        .await
        .unwrap();
    let room_key = format!("room:{}", reg.stable_room_id);
    service.store().delete(&room_key).await.unwrap();

    let info = service
        .reconnect(&ReconnectToken::User(reg.user_token.clone()))
        .await
        .unwrap();
    assert_eq!(info.stable_room_id, reg.stable_room_id);
    let devices = info.devices.expect("devices listed");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "Desk");
    assert!(info.pairing_code.is_none());
    assert!(service.store().get(&room_key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reconnect_by_device_refreshes_last_seen_and_mints_code() {
    let service = service();
    let reg = service
        .register_device(&RoomId::from("r"), None)
        .await
        .unwrap();

    // Backdate the registration so the refresh is observable.
    let device_key = format!("device:{}", reg.device_token);
    let mut device: DeviceRecord = load(service.store(), &device_key).await.unwrap();
    device.last_seen = 1;
    service
        .store()
        .put(&device_key, serde_json::to_string(&device).unwrap())
        .await
        .unwrap();

    let info = service
        .reconnect(&ReconnectToken::Device(reg.device_token.clone()))
        .await
        .unwrap();
    assert_eq!(info.stable_room_id, reg.stable_room_id);
    assert!(info.devices.is_none());

    let code = info.pairing_code.expect("fresh code");
    let record: PairingRecord = load(service.store(), &format!("pairing:{code}"))
        .await
        .unwrap();
    assert_eq!(record.room_id, reg.stable_room_id);
    assert_eq!(Some(record.expires_at), info.pairing_expires_at);
    assert_eq!(record.expires_at - record.created_at, 240 * 60 * 1000);
    assert_eq!(service.resolve(&code).await.unwrap(), reg.stable_room_id);

    let device: DeviceRecord = load(service.store(), &device_key).await.unwrap();
    assert!(device.last_seen > 1);
    let user: UserRecord = load(service.store(), &format!("user:{}", reg.user_token))
        .await
        .unwrap();
    assert_eq!(user.devices[0].last_seen, device.last_seen);
}

#[tokio::test]
async fn test_reconnect_by_device_omits_code_when_allocation_fails() {
    let service = PairingService::new(CollidingStore::default(), PairingConfig::default());
    let reg = service
        .register_device(&RoomId::from("r"), None)
        .await
        .unwrap();

    let info = service
        .reconnect(&ReconnectToken::Device(reg.device_token))
        .await
        .unwrap();
    assert_eq!(info.stable_room_id, reg.stable_room_id);
    assert!(info.pairing_code.is_none());
    assert!(info.pairing_expires_at.is_none());
}

#[tokio::test]
async fn test_reconnect_unknown_tokens_not_found() {
    let service = service();
    assert!(matches!(
        service.reconnect(&ReconnectToken::User("x".into())).await,
        Err(PairingError::TokenNotFound { kind: "user" })
    ));
    assert!(matches!(
        service.reconnect(&ReconnectToken::Device("x".into())).await,
        Err(PairingError::TokenNotFound { kind: "device" })
    ));
}

// =========================================================================
// Blocklist
// =========================================================================

#[tokio::test]
async fn test_block_ip_then_is_blocked() {
    let service = service();
    assert!(!service.is_blocked("10.0.0.1").await.unwrap());
    service.block_ip("10.0.0.1", "abuse", None).await.unwrap();
    assert!(service.is_blocked("10.0.0.1").await.unwrap());
    assert!(!service.is_blocked("10.0.0.2").await.unwrap());

    service.unblock_ip("10.0.0.1").await.unwrap();
    assert!(!service.is_blocked("10.0.0.1").await.unwrap());
}

#[tokio::test]
async fn test_lapsed_block_is_removed() {
    let service = service();
    service
        .store()
        .put(
            "blocklist:ip:10.0.0.9",
            r#"{"reason":"spam","blockedAt":1,"expiresAt":2}"#.into(),
        )
        .await
        .unwrap();

    assert!(!service.is_blocked("10.0.0.9").await.unwrap());
    assert!(
        service
            .store()
            .get("blocklist:ip:10.0.0.9")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_timed_block_is_active_before_expiry() {
    let service = service();
    service
        .block_ip("10.0.0.3", "flood", Some(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert!(service.is_blocked("10.0.0.3").await.unwrap());
}
