use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use ulid::Ulid;

use crate::model::SlotId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Fast, non-authoritative per-slot "remaining capacity" counters.
///
/// Every method is one atomic operation against the store; callers never
/// read a value and write it back in a second round trip.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Take one unit unless that would drive the counter below zero.
    /// A missing entry is first seeded with `seed`. Returns the units left
    /// after the decrement, or `None` when the slot is exhausted (the counter
    /// is left unchanged).
    async fn try_decrement(&self, slot_id: SlotId, seed: i64) -> Result<Option<i64>, CounterError>;

    /// Give one unit back unless the entry is already at `cap` or above.
    /// Never lowers an entry. When `key` is given the increment applies at
    /// most once per key. Returns whether it applied.
    async fn increment(&self, slot_id: SlotId, cap: i64, key: Option<Ulid>) -> Result<bool, CounterError>;

    /// Shift an existing entry by `delta`, clamped at zero. Missing entries
    /// stay missing (they are seeded from the ledger on next use).
    async fn adjust(&self, slot_id: SlotId, delta: i64) -> Result<Option<i64>, CounterError>;

    /// Drop the idempotency record for `key` once the caller has durably
    /// recorded that the keyed increment happened. Stores that expire keys
    /// on their own can keep the default.
    async fn forget_key(&self, _key: Ulid) -> Result<(), CounterError> {
        Ok(())
    }

    /// Overwrite an entry. Only for resynchronising from the ledger.
    async fn set(&self, slot_id: SlotId, value: i64) -> Result<(), CounterError>;

    async fn get(&self, slot_id: SlotId) -> Result<Option<i64>, CounterError>;
}

/// In-process counter store. Each operation runs under the DashMap shard
/// lock for its slot, which makes check-and-decrement indivisible.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<SlotId, i64>,
    /// Keyed increments applied and not yet released with `forget_key`.
    applied_keys: DashSet<Ulid>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn try_decrement(&self, slot_id: SlotId, seed: i64) -> Result<Option<i64>, CounterError> {
        let mut entry = self.counters.entry(slot_id).or_insert(seed.max(0));
        if *entry <= 0 {
            return Ok(None);
        }
        *entry -= 1;
        Ok(Some(*entry))
    }

    async fn increment(&self, slot_id: SlotId, cap: i64, key: Option<Ulid>) -> Result<bool, CounterError> {
        if let Some(key) = key
            && !self.applied_keys.insert(key)
        {
            return Ok(false);
        }
        if let Some(mut entry) = self.counters.get_mut(&slot_id)
            && *entry < cap
        {
            *entry += 1;
        }
        Ok(true)
    }

    async fn adjust(&self, slot_id: SlotId, delta: i64) -> Result<Option<i64>, CounterError> {
        Ok(self.counters.get_mut(&slot_id).map(|mut entry| {
            *entry = (*entry + delta).max(0);
            *entry
        }))
    }

    async fn forget_key(&self, key: Ulid) -> Result<(), CounterError> {
        self.applied_keys.remove(&key);
        Ok(())
    }

    async fn set(&self, slot_id: SlotId, value: i64) -> Result<(), CounterError> {
        self.counters.insert(slot_id, value.max(0));
        Ok(())
    }

    async fn get(&self, slot_id: SlotId) -> Result<Option<i64>, CounterError> {
        Ok(self.counters.get(&slot_id).map(|e| *e.value()))
    }
}
