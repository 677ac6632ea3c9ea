// 🗂️ Slot Registry - bounded, position-keyed store of pending callsigns
//
// Invariants (enforced under one lock shared by every writer):
//   - at most one Entry per position
//   - an occupied position always has a valid, non-empty callsign
//   - entries are immutable; they are only ever created or deleted
//   - occupied count never exceeds capacity
//   - a callsign occupies at most one position
//
// Every mutation is assigned a commit sequence number and its change event
// is published before the write lock is released.

use crate::callsign::Callsign;
use crate::notifier::{ChangeEvent, ChangeNotifier, RemovalCause};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Number of slots in the public queue
pub const DEFAULT_CAPACITY: usize = 6;

// ============================================================================
// ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable identity (UUID)
    pub id: String,
    pub position: usize,
    pub callsign: Callsign,
    pub location: Option<String>,
    pub comment: Option<String>,
    pub entered_at: DateTime<Utc>,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("all {capacity} positions are taken")]
    Full { capacity: usize },

    #[error("{callsign} is already queued at position {position}")]
    AlreadyQueued { callsign: Callsign, position: usize },
}

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub position: usize,
    pub entry: Option<Entry>,
}

/// Point-in-time copy of every slot, ordered by position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub slots: Vec<Slot>,
    pub taken_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied().count()
    }

    pub fn first_free_position(&self) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| slot.entry.is_none())
            .map(|slot| slot.position)
    }

    /// position -> callsign (or None) for every slot
    pub fn callsign_map(&self) -> BTreeMap<usize, Option<String>> {
        self.slots
            .iter()
            .map(|slot| {
                (
                    slot.position,
                    slot.entry.as_ref().map(|e| e.callsign.to_string()),
                )
            })
            .collect()
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

struct Slots {
    /// index = position - 1
    entries: Vec<Option<Entry>>,
    next_seq: u64,
}

impl Slots {
    fn empty(capacity: usize) -> Self {
        Slots {
            entries: vec![None; capacity],
            next_seq: 1,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn position_of(&self, callsign: &Callsign) -> Option<usize> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.callsign == *callsign)
            .map(|e| e.position)
    }
}

pub struct SlotRegistry {
    capacity: usize,
    slots: RwLock<Slots>,
    notifier: Arc<ChangeNotifier>,
}

impl SlotRegistry {
    pub fn new(capacity: usize, notifier: Arc<ChangeNotifier>) -> Self {
        assert!(capacity > 0, "registry capacity must be at least 1");

        SlotRegistry {
            capacity,
            slots: RwLock::new(Slots::empty(capacity)),
            notifier,
        }
    }

    /// Rebuild from persisted entries. Rows that would break an invariant
    /// are skipped and logged. No events are published.
    pub fn restore(
        capacity: usize,
        entries: impl IntoIterator<Item = Entry>,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        let registry = SlotRegistry::new(capacity, notifier);

        {
            let mut slots = registry.write();
            for entry in entries {
                if entry.position == 0 || entry.position > capacity {
                    tracing::warn!(
                        position = entry.position,
                        callsign = %entry.callsign,
                        capacity,
                        "skipping restored entry outside slot range"
                    );
                    continue;
                }
                if let Some(existing) = slots.position_of(&entry.callsign) {
                    tracing::warn!(
                        callsign = %entry.callsign,
                        existing,
                        "skipping duplicate restored callsign"
                    );
                    continue;
                }
                let slot = &mut slots.entries[entry.position - 1];
                if slot.is_some() {
                    tracing::warn!(
                        position = entry.position,
                        "skipping restored entry for occupied position"
                    );
                    continue;
                }
                *slot = Some(entry);
            }
        }

        tracing::info!(
            restored = registry.occupied_count(),
            capacity,
            "registry restored"
        );
        registry
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().expect("registry lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().expect("registry lock poisoned")
    }

    /// Place a new entry in the lowest free position.
    pub fn append(
        &self,
        callsign: Callsign,
        location: Option<String>,
        comment: Option<String>,
    ) -> Result<Entry, RegistryError> {
        let mut slots = self.write();

        if let Some(position) = slots.position_of(&callsign) {
            return Err(RegistryError::AlreadyQueued { callsign, position });
        }

        let index = slots
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::Full {
                capacity: self.capacity,
            })?;

        let entry = Entry {
            id: uuid::Uuid::new_v4().to_string(),
            position: index + 1,
            callsign,
            location,
            comment,
            entered_at: Utc::now(),
        };

        let slot = &mut slots.entries[index];
        assert!(slot.is_none(), "position {} assigned twice", index + 1);
        *slot = Some(entry.clone());

        let seq = slots.next_seq();
        self.notifier.publish(ChangeEvent::EntryAdded {
            seq,
            entry: entry.clone(),
        });

        tracing::info!(
            position = entry.position,
            callsign = %entry.callsign,
            seq,
            "entry added"
        );
        Ok(entry)
    }

    /// Clear one position. Returns false if it was already empty (or out of
    /// range); that is a no-op, not an error.
    pub fn remove(&self, position: usize, cause: RemovalCause) -> bool {
        self.remove_where(cause, |slots| {
            position
                .checked_sub(1)
                .filter(|index| slots.entries.get(*index).is_some_and(Option::is_some))
        })
        .is_some()
    }

    /// Clear `position` only if it still holds the entry with `entry_id`.
    /// A slot that was vacated and refilled since a snapshot is left alone.
    pub fn remove_if_current(&self, position: usize, entry_id: &str, cause: RemovalCause) -> bool {
        self.remove_where(cause, |slots| {
            let index = position.checked_sub(1)?;
            let current = slots.entries.get(index)?.as_ref()?;
            (current.id == entry_id).then_some(index)
        })
        .is_some()
    }

    /// Clear whichever position holds `callsign`; returns that position.
    pub fn remove_callsign(&self, callsign: &Callsign, cause: RemovalCause) -> Option<usize> {
        self.remove_where(cause, |slots| {
            slots.position_of(callsign).map(|position| position - 1)
        })
        .map(|entry| entry.position)
    }

    /// Locate an occupied slot index under the write lock and empty it.
    fn remove_where(
        &self,
        cause: RemovalCause,
        locate: impl FnOnce(&Slots) -> Option<usize>,
    ) -> Option<Entry> {
        let mut slots = self.write();

        let Some(removed) = locate(&slots).and_then(|index| slots.entries[index].take()) else {
            tracing::debug!(?cause, "nothing to remove (no-op)");
            return None;
        };
        let position = removed.position;

        let seq = slots.next_seq();
        self.notifier.publish(ChangeEvent::EntryRemoved {
            seq,
            position,
            callsign: removed.callsign.clone(),
            cause,
            at: Utc::now(),
        });

        tracing::info!(
            position,
            callsign = %removed.callsign,
            ?cause,
            seq,
            "entry removed"
        );
        Some(removed)
    }

    /// Empty every position; returns how many were occupied.
    pub fn clear_all(&self) -> usize {
        let mut slots = self.write();

        let count = slots
            .entries
            .iter_mut()
            .filter_map(Option::take)
            .count();

        if count > 0 {
            let seq = slots.next_seq();
            self.notifier.publish(ChangeEvent::AllCleared {
                seq,
                count,
                at: Utc::now(),
            });
            tracing::info!(count, seq, "registry cleared");
        }

        count
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let slots = self.read();

        RegistrySnapshot {
            slots: slots
                .entries
                .iter()
                .enumerate()
                .map(|(index, entry)| Slot {
                    position: index + 1,
                    entry: entry.clone(),
                })
                .collect(),
            taken_at: Utc::now(),
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.read().entries.iter().flatten().count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
