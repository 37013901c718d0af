//! The reservation ledger: authoritative, versioned slot and reservation rows.
//!
//! State is partitioned per event. Each event's slots and reservations sit
//! behind one `RwLock`, so the conditional slot update, the one-per-event
//! de-duplication check and the reservation insert of a commit happen under a
//! single write guard and land in the WAL as a single record.

mod error;
mod mutations;
mod queries;

pub use error::LedgerError;
pub use mutations::{CommitRequest, Committed};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::*;
use crate::wal::{Wal, WalHandle};

pub type SharedEventState = Arc<RwLock<EventState>>;

/// One event (e.g. a mentoring session) with its slots and reservations.
#[derive(Debug, Clone)]
pub struct EventState {
    pub id: EventId,
    pub slots: BTreeMap<SlotId, Slot>,
    pub reservations: BTreeMap<ReservationId, Reservation>,
    /// user → their pending/confirmed reservation in this event
    active_by_user: HashMap<String, ReservationId>,
}

impl EventState {
    pub fn new(id: EventId) -> Self {
        Self {
            id,
            slots: BTreeMap::new(),
            reservations: BTreeMap::new(),
            active_by_user: HashMap::new(),
        }
    }

    pub fn active_reservation(&self, user_id: &str) -> Option<&Reservation> {
        self.active_by_user
            .get(user_id)
            .and_then(|id| self.reservations.get(id))
    }
}

/// Apply a record directly to an EventState (no locking — caller holds the lock).
fn apply_record(es: &mut EventState, record: &LedgerRecord) {
    match record {
        LedgerRecord::SlotCreated {
            id,
            event_id,
            max_capacity,
        } => {
            es.slots.insert(*id, Slot::new(*id, *event_id, *max_capacity));
        }
        LedgerRecord::SlotRestored {
            id,
            event_id,
            max_capacity,
            version,
        } => {
            let mut slot = Slot::new(*id, *event_id, *max_capacity);
            slot.version = *version;
            es.slots.insert(*id, slot);
        }
        LedgerRecord::SlotResized {
            id,
            max_capacity,
            version,
        } => {
            if let Some(slot) = es.slots.get_mut(id) {
                slot.max_capacity = *max_capacity;
                slot.version = *version;
            }
        }
        LedgerRecord::ReservationConfirmed {
            id,
            slot_id,
            user_id,
            job_id,
            created_at,
            version,
        } => {
            if let Some(slot) = es.slots.get_mut(slot_id) {
                slot.current_count += 1;
                slot.version = *version;
            }
            es.reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    user_id: user_id.clone(),
                    slot_id: *slot_id,
                    event_id: es.id,
                    status: ReservationStatus::Confirmed,
                    created_at: *created_at,
                    job_id: *job_id,
                },
            );
            es.active_by_user.insert(user_id.clone(), *id);
        }
        LedgerRecord::ReservationCancelled { id, slot_id, version } => {
            if let Some(slot) = es.slots.get_mut(slot_id) {
                slot.current_count = slot.current_count.saturating_sub(1);
                slot.version = *version;
            }
            if let Some(r) = es.reservations.get_mut(id) {
                r.status = ReservationStatus::Cancelled;
                if es.active_by_user.get(&r.user_id) == Some(id) {
                    es.active_by_user.remove(&r.user_id);
                }
            }
        }
        LedgerRecord::ReservationRestored(r) => {
            if r.status.is_active() {
                if let Some(slot) = es.slots.get_mut(&r.slot_id) {
                    slot.current_count += 1;
                }
                es.active_by_user.insert(r.user_id.clone(), r.id);
            }
            es.reservations.insert(r.id, r.clone());
        }
    }
}

pub struct Ledger {
    events: DashMap<EventId, SharedEventState>,
    slot_to_event: DashMap<SlotId, EventId>,
    reservation_to_event: DashMap<ReservationId, EventId>,
    next_reservation_id: AtomicU64,
    wal: WalHandle<LedgerRecord>,
    /// Shared by every mutation, exclusive during compaction.
    compaction: RwLock<()>,
}

impl Ledger {
    /// Replay the WAL at `wal_path` and start its group-commit writer.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let records: Vec<LedgerRecord> = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;

        let mut states: HashMap<EventId, EventState> = HashMap::new();
        let slot_to_event = DashMap::new();
        let reservation_to_event = DashMap::new();
        let mut max_reservation_id = 0;

        for record in &records {
            let event_id = match record {
                LedgerRecord::SlotCreated { id, event_id, .. }
                | LedgerRecord::SlotRestored { id, event_id, .. } => {
                    slot_to_event.insert(*id, *event_id);
                    *event_id
                }
                other => match slot_to_event.get(&other.slot_id()) {
                    Some(e) => *e.value(),
                    None => continue,
                },
            };
            match record {
                LedgerRecord::ReservationConfirmed { id, .. } => {
                    reservation_to_event.insert(*id, event_id);
                    max_reservation_id = max_reservation_id.max(*id);
                }
                LedgerRecord::ReservationRestored(r) => {
                    reservation_to_event.insert(r.id, event_id);
                    max_reservation_id = max_reservation_id.max(r.id);
                }
                _ => {}
            }
            let es = states
                .entry(event_id)
                .or_insert_with(|| EventState::new(event_id));
            apply_record(es, record);
        }

        let events = DashMap::new();
        for (id, es) in states {
            events.insert(id, Arc::new(RwLock::new(es)));
        }

        Ok(Self {
            events,
            slot_to_event,
            reservation_to_event,
            next_reservation_id: AtomicU64::new(max_reservation_id + 1),
            wal: WalHandle::spawn(wal, "ledger"),
            compaction: RwLock::new(()),
        })
    }

    /// WAL-append + apply in one call. The caller holds the event's write guard.
    pub(super) async fn persist_and_apply(
        &self,
        es: &mut EventState,
        record: LedgerRecord,
    ) -> Result<(), LedgerError> {
        self.wal
            .append(record.clone())
            .await
            .map_err(|e| LedgerError::Wal(e.to_string()))?;
        apply_record(es, &record);
        Ok(())
    }

    pub fn event_state(&self, event_id: EventId) -> Option<SharedEventState> {
        self.events.get(&event_id).map(|e| e.value().clone())
    }

    /// Lookup slot → event, returning the event's shared state.
    pub(super) fn state_for_slot(
        &self,
        slot_id: SlotId,
    ) -> Result<(EventId, SharedEventState), LedgerError> {
        let event_id = self
            .slot_to_event
            .get(&slot_id)
            .map(|e| *e.value())
            .ok_or(LedgerError::SlotNotFound(slot_id))?;
        let es = self
            .event_state(event_id)
            .ok_or(LedgerError::SlotNotFound(slot_id))?;
        Ok((event_id, es))
    }

    pub(super) fn all_states(&self) -> Vec<SharedEventState> {
        self.events.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the WAL as the minimal set of records that recreates the
    /// current state. Returns the number of records written.
    pub async fn compact(&self) -> io::Result<usize> {
        let _exclusive = self.compaction.write().await;
        let mut slots = Vec::new();
        let mut reservations = Vec::new();
        for state in self.all_states() {
            let es = state.read().await;
            for slot in es.slots.values() {
                slots.push(LedgerRecord::SlotRestored {
                    id: slot.id,
                    event_id: slot.event_id,
                    max_capacity: slot.max_capacity,
                    version: slot.version,
                });
            }
            for r in es.reservations.values() {
                reservations.push(LedgerRecord::ReservationRestored(r.clone()));
            }
        }
        slots.append(&mut reservations);
        let count = slots.len();
        self.wal.compact(slots).await?;
        Ok(count)
    }
}
