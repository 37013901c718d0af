use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub type SlotId = u64;
pub type EventId = u64;
pub type ReservationId = u64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    /// Pending and confirmed reservations both hold a unit of capacity and
    /// count against the one-per-event rule.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }
}

/// One bookable capacity unit of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: SlotId,
    pub event_id: EventId,
    pub max_capacity: u32,
    pub current_count: u32,
    /// Bumped on every committed mutation of the row.
    pub version: u64,
}

impl Slot {
    pub fn new(id: SlotId, event_id: EventId, max_capacity: u32) -> Self {
        Self {
            id,
            event_id,
            max_capacity,
            current_count: 0,
            version: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_count)
    }

    pub fn is_full(&self) -> bool {
        self.current_count >= self.max_capacity
    }

    pub fn capacity(&self) -> SlotCapacity {
        SlotCapacity {
            slot_id: self.id,
            current_count: self.current_count,
            max_capacity: self.max_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: String,
    pub slot_id: SlotId,
    pub event_id: EventId,
    pub status: ReservationStatus,
    pub created_at: Ms,
    /// Fulfillment job that committed this row, if it came through the queue.
    pub job_id: Option<Ulid>,
}

// ── Capacity snapshots ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotCapacity {
    pub slot_id: SlotId,
    pub current_count: u32,
    pub max_capacity: u32,
}

/// What subscribers receive: the full capacity picture plus what changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityUpdate {
    pub snapshot: Vec<SlotCapacity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_slot_id: Option<SlotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

// ── Queue payload ────────────────────────────────────────────────

/// Payload handed from the admission gate to the fulfillment workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentJob {
    pub user_id: String,
    pub slot_id: SlotId,
    /// Slot capacity when the job was admitted; caps compensation.
    pub max_capacity: u32,
}

// ── Ledger log ───────────────────────────────────────────────────

/// Ledger records — flat, no nesting. This is the ledger WAL format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerRecord {
    SlotCreated {
        id: SlotId,
        event_id: EventId,
        max_capacity: u32,
    },
    SlotResized {
        id: SlotId,
        max_capacity: u32,
        version: u64,
    },
    ReservationConfirmed {
        id: ReservationId,
        slot_id: SlotId,
        user_id: String,
        job_id: Option<Ulid>,
        created_at: Ms,
        /// Slot version after the increment.
        version: u64,
    },
    ReservationCancelled {
        id: ReservationId,
        slot_id: SlotId,
        /// Slot version after the decrement.
        version: u64,
    },
    /// Compaction output: a slot row without its count.
    SlotRestored {
        id: SlotId,
        event_id: EventId,
        max_capacity: u32,
        version: u64,
    },
    /// Compaction output: a reservation row as it stands.
    ReservationRestored(Reservation),
}

impl LedgerRecord {
    pub fn slot_id(&self) -> SlotId {
        match self {
            LedgerRecord::SlotCreated { id, .. }
            | LedgerRecord::SlotResized { id, .. }
            | LedgerRecord::SlotRestored { id, .. } => *id,
            LedgerRecord::ReservationConfirmed { slot_id, .. }
            | LedgerRecord::ReservationCancelled { slot_id, .. } => *slot_id,
            LedgerRecord::ReservationRestored(r) => r.slot_id,
        }
    }
}
