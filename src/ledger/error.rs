use thiserror::Error;

use crate::model::{EventId, ReservationId, SlotId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),
    #[error("slot already exists: {0}")]
    SlotAlreadyExists(SlotId),
    /// The conditional update matched no row: the version moved, or the slot
    /// is already at capacity.
    #[error(
        "optimistic lock conflict on slot {slot_id}: expected version {expected_version}, found {actual_version} (full: {full})"
    )]
    OptimisticLockConflict {
        slot_id: SlotId,
        expected_version: u64,
        actual_version: u64,
        full: bool,
    },
    #[error("user {user_id} already holds reservation {existing} for event {event_id}")]
    DuplicateReservation {
        user_id: String,
        event_id: EventId,
        existing: ReservationId,
    },
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),
    #[error("reservation {0} belongs to another user")]
    Unauthorized(ReservationId),
    #[error("reservation {0} is already cancelled")]
    AlreadyCancelled(ReservationId),
    #[error("invalid capacity: {0}")]
    InvalidCapacity(u32),
    #[error("slot {slot_id} holds {current} reservations, cannot shrink to {requested}")]
    CapacityBelowCount {
        slot_id: SlotId,
        requested: u32,
        current: u32,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl LedgerError {
    /// Stable machine-readable code for the wire layer.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::SlotNotFound(_) => "SLOT_NOT_FOUND",
            LedgerError::SlotAlreadyExists(_) => "SLOT_ALREADY_EXISTS",
            LedgerError::OptimisticLockConflict { .. } => "OPTIMISTIC_LOCK_CONFLICT",
            LedgerError::DuplicateReservation { .. } => "DUPLICATE_RESERVATION",
            LedgerError::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            LedgerError::Unauthorized(_) => "UNAUTHORIZED",
            LedgerError::AlreadyCancelled(_) => "ALREADY_CANCELLED",
            LedgerError::InvalidCapacity(_) | LedgerError::CapacityBelowCount { .. } => {
                "INVALID_CAPACITY"
            }
            LedgerError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            LedgerError::Wal(_) => "STORAGE_ERROR",
        }
    }

    /// Whether a fulfillment job that hit this error should be tried again.
    /// A conflict on a slot that is already full will not resolve by retrying.
    pub fn is_retriable(&self) -> bool {
        match self {
            LedgerError::OptimisticLockConflict { full, .. } => !full,
            LedgerError::Wal(_) => true,
            _ => false,
        }
    }
}
