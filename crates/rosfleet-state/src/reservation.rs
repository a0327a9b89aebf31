//! Reservation arena.
//!
//! Reservations live in a slab of slots addressed by [`ReservationId`]
//! (slot index + epoch). Retiring a reservation bumps the slot's epoch,
//! so every outstanding copy of the old id stops resolving at once. That
//! makes release, expiry and invalidation the same operation and rules
//! out double release: the second attempt finds a newer epoch.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::types::{NodeRef, ResourceAmount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId {
    index: u32,
    epoch: u32,
}

impl ReservationId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsv-{}.{}", self.index, self.epoch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// Held pending confirmation; stops counting once `expires_at` passes.
    Live { expires_at: Instant },
    /// Converted into an allocation by a successful apply.
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationEntry {
    pub node: NodeRef,
    pub amount: ResourceAmount,
    /// Cluster sync generation the reservation was taken against.
    pub generation: u64,
    pub state: ReservationState,
}

impl ReservationEntry {
    /// Whether the entry currently holds capacity.
    pub fn holds_at(&self, now: Instant) -> bool {
        match self.state {
            ReservationState::Live { expires_at } => expires_at > now,
            ReservationState::Committed => true,
        }
    }
}

/// Why a slot's previous occupant was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    Released,
    Expired,
    Invalidated,
}

#[derive(Debug)]
struct Slot {
    epoch: u32,
    entry: Option<ReservationEntry>,
    /// Fate of the reservation issued at `epoch - 1`.
    retired: Option<Retirement>,
}

#[derive(Debug, Default)]
pub struct ReservationArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ReservationArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ReservationEntry) -> ReservationId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return ReservationId {
                index,
                epoch: slot.epoch,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            epoch: 0,
            entry: Some(entry),
            retired: None,
        });
        ReservationId { index, epoch: 0 }
    }

    fn miss(&self, id: ReservationId) -> CacheError {
        let Some(slot) = self.slots.get(id.index as usize) else {
            return CacheError::UnknownReservation(id);
        };
        if id.epoch >= slot.epoch {
            return CacheError::UnknownReservation(id);
        }
        match (id.epoch.wrapping_add(1) == slot.epoch, slot.retired) {
            (true, Some(Retirement::Expired)) => CacheError::ReservationExpired(id),
            (true, Some(Retirement::Invalidated)) => CacheError::ReservationInvalidated(id),
            _ => CacheError::AlreadyReleased(id),
        }
    }

    pub fn get(&self, id: ReservationId) -> CacheResult<&ReservationEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.epoch == id.epoch)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| self.miss(id))
    }

    /// Remove a reservation and record why.
    pub fn retire(&mut self, id: ReservationId, reason: Retirement) -> CacheResult<ReservationEntry> {
        let miss = self.miss(id);
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.epoch == id.epoch)
            .ok_or(miss.clone())?;
        let entry = slot.entry.take().ok_or(miss)?;
        slot.epoch = slot.epoch.wrapping_add(1);
        slot.retired = Some(reason);
        self.free.push(id.index);
        Ok(entry)
    }

    /// Convert a live reservation into a committed allocation.
    pub fn commit(&mut self, id: ReservationId, now: Instant) -> CacheResult<()> {
        let state = self.get(id)?.state;
        match state {
            ReservationState::Committed => Err(CacheError::AlreadyCommitted(id)),
            ReservationState::Live { expires_at } if expires_at <= now => {
                self.retire(id, Retirement::Expired)?;
                Err(CacheError::ReservationExpired(id))
            }
            ReservationState::Live { .. } => {
                if let Some(entry) = self.slots[id.index as usize].entry.as_mut() {
                    entry.state = ReservationState::Committed;
                }
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReservationId, &ReservationEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    ReservationId {
                        index: index as u32,
                        epoch: slot.epoch,
                    },
                    entry,
                )
            })
        })
    }

    /// Committed and live-reserved totals on one node.
    pub fn held_on(&self, node: &NodeRef, now: Instant) -> (ResourceAmount, ResourceAmount) {
        let mut committed = ResourceAmount::default();
        let mut reserved = ResourceAmount::default();
        for (_, entry) in self.iter().filter(|(_, e)| &e.node == node) {
            match entry.state {
                ReservationState::Committed => committed = committed.saturating_add(&entry.amount),
                ReservationState::Live { expires_at } if expires_at > now => {
                    reserved = reserved.saturating_add(&entry.amount)
                }
                ReservationState::Live { .. } => {}
            }
        }
        (committed, reserved)
    }

    pub fn ids_where(&self, mut pred: impl FnMut(&ReservationEntry) -> bool) -> Vec<ReservationId> {
        self.iter().filter(|(_, e)| pred(e)).map(|(id, _)| id).collect()
    }

    /// Live reservations whose expiry has passed.
    pub fn expired(&self, now: Instant) -> Vec<ReservationId> {
        self.ids_where(|e| !e.holds_at(now))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
