use crate::model::*;

use super::{Ledger, LedgerError};

impl Ledger {
    /// Point read of one slot row.
    pub async fn slot(&self, id: SlotId) -> Result<Slot, LedgerError> {
        let (_, state) = self.state_for_slot(id)?;
        let es = state.read().await;
        es.slots.get(&id).cloned().ok_or(LedgerError::SlotNotFound(id))
    }

    /// All slots ordered by id.
    pub async fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        for state in self.all_states() {
            let es = state.read().await;
            slots.extend(es.slots.values().cloned());
        }
        slots.sort_by_key(|s| s.id);
        slots
    }

    pub async fn capacity_snapshot(&self) -> Vec<SlotCapacity> {
        self.slots().await.iter().map(Slot::capacity).collect()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_to_event.len()
    }

    pub async fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        let event_id = self.reservation_to_event.get(&id).map(|e| *e.value())?;
        let state = self.event_state(event_id)?;
        let es = state.read().await;
        es.reservations.get(&id).cloned()
    }

    /// Every reservation the user ever made, newest first.
    pub async fn reservations_for_user(&self, user_id: &str) -> Vec<Reservation> {
        let mut found = Vec::new();
        for state in self.all_states() {
            let es = state.read().await;
            found.extend(
                es.reservations
                    .values()
                    .filter(|r| r.user_id == user_id)
                    .cloned(),
            );
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found
    }

    /// The user's pending or confirmed reservation in an event, if any.
    pub async fn active_reservation(&self, user_id: &str, event_id: EventId) -> Option<Reservation> {
        let state = self.event_state(event_id)?;
        let es = state.read().await;
        es.active_reservation(user_id).cloned()
    }
}
