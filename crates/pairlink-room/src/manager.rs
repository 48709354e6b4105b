//! Room manager: the routing table from room id to room actor.

use std::collections::HashMap;

use pairlink_protocol::RoomId;

use crate::room::spawn_room;
use crate::{AdmissionTicket, RelayLimits, RoomError, RoomHandle, RoomInfo};

/// Tracks every live room actor.
///
/// This is the only structure shared across rooms. Callers hold it just
/// long enough to look up (or spawn) a handle and claim a slot; every
/// other operation goes to the actor through the handle.
pub struct RoomManager {
    rooms: HashMap<RoomId, RoomHandle>,
    limits: RelayLimits,
}

impl RoomManager {
    /// Creates a new, empty room manager.
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            rooms: HashMap::new(),
            limits: limits.validated(),
        }
    }

    /// The validated limits every room is spawned with.
    pub fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    /// Returns the live handle for `room_id`, spawning an actor if the
    /// room does not exist or was evicted.
    pub fn get_or_create(&mut self, room_id: &RoomId) -> RoomHandle {
        if let Some(handle) = self.rooms.get(room_id) {
            if !handle.is_evicted() {
                return handle.clone();
            }
            tracing::debug!(%room_id, "replacing evicted room");
        }
        let handle = spawn_room(room_id.clone(), self.limits.clone());
        self.rooms.insert(room_id.clone(), handle.clone());
        tracing::info!(%room_id, "room created");
        handle
    }

    /// Claims a connection slot in `room_id`, creating the room lazily.
    ///
    /// Fails with [`RoomError::RoomFull`] without touching room state when
    /// every slot is held.
    pub fn admit(&mut self, room_id: &RoomId) -> Result<(RoomHandle, AdmissionTicket), RoomError> {
        self.prune();
        let handle = self.get_or_create(room_id);
        match handle.try_admit() {
            Ok(ticket) => Ok((handle, ticket)),
            Err(RoomError::Evicted(_)) => {
                // Evicted between lookup and admission; start over once.
                let handle = self.get_or_create(room_id);
                let ticket = handle.try_admit()?;
                Ok((handle, ticket))
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the handle for an existing, live room.
    pub fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms
            .get(room_id)
            .filter(|h| !h.is_evicted())
            .cloned()
    }

    /// Returns a status snapshot of a live room.
    pub async fn room_info(&self, room_id: &RoomId) -> Result<RoomInfo, RoomError> {
        let handle = self
            .get(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;
        handle.get_info().await
    }

    /// Shuts a room down, closing its connections.
    pub async fn destroy_room(&mut self, room_id: &RoomId) -> Result<(), RoomError> {
        let handle = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;
        let _ = handle.shutdown().await;
        tracing::info!(%room_id, "room destroyed");
        Ok(())
    }

    /// Drops handles of rooms whose actors evicted themselves.
    pub fn prune(&mut self) {
        let before = self.rooms.len();
        self.rooms.retain(|_, h| !h.is_evicted());
        let pruned = before - self.rooms.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned evicted rooms");
        }
    }

    /// Returns the number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.values().filter(|h| !h.is_evicted()).count()
    }

    /// Lists all live room ids.
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|(_, h)| !h.is_evicted())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns cloned handles to all live rooms.
    pub fn room_handles(&self) -> Vec<RoomHandle> {
        self.rooms
            .values()
            .filter(|h| !h.is_evicted())
            .cloned()
            .collect()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new(RelayLimits::default())
    }
}
