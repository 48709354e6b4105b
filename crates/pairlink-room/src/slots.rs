//! Lock-free connection slot counter shared by a room's handle and actor.
//!
//! The server checks capacity before it answers the WebSocket upgrade,
//! long before the room actor hears about the connection. The counter
//! lives outside the actor so that check is synchronous, and eviction
//! flips it to a sentinel with a single compare-and-swap so an idle
//! eviction and a late admission can never both win.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const EVICTED: usize = usize::MAX;

pub(crate) enum SlotError {
    Full,
    Evicted,
}

pub(crate) struct RoomSlots {
    count: AtomicUsize,
    capacity: usize,
}

impl RoomSlots {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            capacity,
        })
    }

    pub(crate) fn try_admit(self: &Arc<Self>) -> Result<AdmissionTicket, SlotError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == EVICTED {
                return Err(SlotError::Evicted);
            }
            if current >= self.capacity {
                return Err(SlotError::Full);
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(AdmissionTicket {
                        slots: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks the room evicted if nobody holds a slot.
    pub(crate) fn try_evict(&self) -> bool {
        self.count
            .compare_exchange(0, EVICTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the room evicted regardless of outstanding tickets.
    pub(crate) fn force_evict(&self) {
        self.count.store(EVICTED, Ordering::Release);
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.count.load(Ordering::Acquire) == EVICTED
    }

    pub(crate) fn occupied(&self) -> usize {
        match self.count.load(Ordering::Acquire) {
            EVICTED => 0,
            n => n,
        }
    }

    fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                EVICTED | 0 => None,
                n => Some(n - 1),
            });
    }
}

/// Proof that a connection holds one of a room's slots.
///
/// The slot is released when the ticket is dropped, so the connection
/// task simply keeps it alive for as long as the socket is open.
#[must_use = "dropping the ticket frees the slot immediately"]
pub struct AdmissionTicket {
    slots: Arc<RoomSlots>,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("occupied", &self.slots.occupied())
            .finish()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.slots.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_up_to_capacity_then_full() {
        let slots = RoomSlots::new(2);
        let a = slots.try_admit().ok().expect("first");
        let _b = slots.try_admit().ok().expect("second");
        assert!(matches!(slots.try_admit(), Err(SlotError::Full)));
        drop(a);
        assert!(slots.try_admit().is_ok());
    }

    #[test]
    fn test_evict_only_when_empty() {
        let slots = RoomSlots::new(2);
        let ticket = slots.try_admit().ok().expect("admit");
        assert!(!slots.try_evict());
        drop(ticket);
        assert!(slots.try_evict());
        assert!(slots.is_evicted());
        assert!(matches!(slots.try_admit(), Err(SlotError::Evicted)));
    }

    #[test]
    fn test_ticket_dropped_after_force_evict_keeps_sentinel() {
        let slots = RoomSlots::new(2);
        let ticket = slots.try_admit().ok().expect("admit");
        slots.force_evict();
        drop(ticket);
        assert!(slots.is_evicted());
        assert_eq!(slots.occupied(), 0);
    }
}
