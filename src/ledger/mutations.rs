use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EventState, Ledger, LedgerError};

/// Input to the durable commit protocol. `expected_version` is the slot
/// version the caller read before attempting the commit.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub slot_id: SlotId,
    pub expected_version: u64,
    pub user_id: &'a str,
    pub job_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    /// A new confirmed reservation row.
    Inserted(Reservation),
    /// The same job already committed this reservation (redelivery).
    AlreadyCommitted(Reservation),
}

impl Committed {
    pub fn reservation(&self) -> &Reservation {
        match self {
            Committed::Inserted(r) | Committed::AlreadyCommitted(r) => r,
        }
    }
}

fn validate_capacity(max_capacity: u32) -> Result<(), LedgerError> {
    if max_capacity == 0 || max_capacity > MAX_SLOT_CAPACITY {
        return Err(LedgerError::InvalidCapacity(max_capacity));
    }
    Ok(())
}

impl Ledger {
    pub async fn create_slot(
        &self,
        id: SlotId,
        event_id: EventId,
        max_capacity: u32,
    ) -> Result<Slot, LedgerError> {
        validate_capacity(max_capacity)?;
        if self.slot_to_event.len() >= MAX_SLOTS {
            return Err(LedgerError::LimitExceeded("too many slots"));
        }
        let _shared = self.compaction.read().await;

        match self.slot_to_event.entry(id) {
            Entry::Occupied(_) => return Err(LedgerError::SlotAlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(event_id);
            }
        }
        let state = self
            .events
            .entry(event_id)
            .or_insert_with(|| Arc::new(RwLock::new(EventState::new(event_id))))
            .value()
            .clone();
        let mut es = state.write().await;

        let record = LedgerRecord::SlotCreated {
            id,
            event_id,
            max_capacity,
        };
        if let Err(e) = self.persist_and_apply(&mut es, record).await {
            self.slot_to_event.remove(&id);
            return Err(e);
        }
        Ok(Slot::new(id, event_id, max_capacity))
    }

    /// Administrative resize. Returns the updated slot and its previous capacity.
    pub async fn resize_slot(
        &self,
        id: SlotId,
        max_capacity: u32,
    ) -> Result<(Slot, u32), LedgerError> {
        validate_capacity(max_capacity)?;
        let _shared = self.compaction.read().await;
        let (_, state) = self.state_for_slot(id)?;
        let mut es = state.write().await;
        let slot = es.slots.get(&id).ok_or(LedgerError::SlotNotFound(id))?;
        if max_capacity < slot.current_count {
            return Err(LedgerError::CapacityBelowCount {
                slot_id: id,
                requested: max_capacity,
                current: slot.current_count,
            });
        }
        let previous = slot.max_capacity;
        let record = LedgerRecord::SlotResized {
            id,
            max_capacity,
            version: slot.version + 1,
        };
        self.persist_and_apply(&mut es, record).await?;
        let slot = es.slots.get(&id).cloned().ok_or(LedgerError::SlotNotFound(id))?;
        Ok((slot, previous))
    }

    /// The durable commit protocol, as one atomic statement against the event:
    ///
    /// 1. the slot row must still carry `expected_version` and have room,
    ///    otherwise `OptimisticLockConflict`;
    /// 2. the user must not hold another pending/confirmed reservation in the
    ///    event, otherwise `DuplicateReservation`;
    /// 3. insert the reservation as CONFIRMED, bumping count and version.
    ///
    /// Nothing is applied unless all three hold and the record is durable.
    /// A job that already committed (redelivery after a crash before ack)
    /// gets its own row back as `AlreadyCommitted`.
    pub async fn commit_reservation(
        &self,
        req: CommitRequest<'_>,
    ) -> Result<Committed, LedgerError> {
        let _shared = self.compaction.read().await;
        let (event_id, state) = self.state_for_slot(req.slot_id)?;
        let mut es = state.write().await;

        if let (Some(job_id), Some(existing)) = (req.job_id, es.active_reservation(req.user_id))
            && existing.job_id == Some(job_id)
        {
            return Ok(Committed::AlreadyCommitted(existing.clone()));
        }

        let slot = es
            .slots
            .get(&req.slot_id)
            .ok_or(LedgerError::SlotNotFound(req.slot_id))?;
        if slot.version != req.expected_version || slot.is_full() {
            return Err(LedgerError::OptimisticLockConflict {
                slot_id: req.slot_id,
                expected_version: req.expected_version,
                actual_version: slot.version,
                full: slot.is_full(),
            });
        }
        let next_version = slot.version + 1;

        if let Some(existing) = es.active_reservation(req.user_id) {
            return Err(LedgerError::DuplicateReservation {
                user_id: req.user_id.to_string(),
                event_id,
                existing: existing.id,
            });
        }

        let id = self.next_reservation_id.fetch_add(1, Ordering::Relaxed);
        let record = LedgerRecord::ReservationConfirmed {
            id,
            slot_id: req.slot_id,
            user_id: req.user_id.to_string(),
            job_id: req.job_id,
            created_at: now_ms(),
            version: next_version,
        };
        self.persist_and_apply(&mut es, record).await?;
        self.reservation_to_event.insert(id, event_id);

        let reservation = es
            .reservations
            .get(&id)
            .cloned()
            .ok_or(LedgerError::ReservationNotFound(id))?;
        Ok(Committed::Inserted(reservation))
    }

    /// Cancel a reservation and free its unit of capacity in one statement.
    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        user_id: &str,
    ) -> Result<Reservation, LedgerError> {
        let _shared = self.compaction.read().await;
        let event_id = self
            .reservation_to_event
            .get(&id)
            .map(|e| *e.value())
            .ok_or(LedgerError::ReservationNotFound(id))?;
        let state = self
            .event_state(event_id)
            .ok_or(LedgerError::ReservationNotFound(id))?;
        let mut es = state.write().await;

        let reservation = es
            .reservations
            .get(&id)
            .ok_or(LedgerError::ReservationNotFound(id))?;
        if reservation.user_id != user_id {
            return Err(LedgerError::Unauthorized(id));
        }
        if reservation.status == ReservationStatus::Cancelled {
            return Err(LedgerError::AlreadyCancelled(id));
        }
        let slot_id = reservation.slot_id;
        let slot = es
            .slots
            .get(&slot_id)
            .ok_or(LedgerError::SlotNotFound(slot_id))?;

        let record = LedgerRecord::ReservationCancelled {
            id,
            slot_id,
            version: slot.version + 1,
        };
        self.persist_and_apply(&mut es, record).await?;
        es.reservations
            .get(&id)
            .cloned()
            .ok_or(LedgerError::ReservationNotFound(id))
    }
}
