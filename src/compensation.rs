//! Gives counter units back for jobs that will never commit.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::counter::{CounterError, CounterStore};
use crate::ledger::Ledger;
use crate::model::SlotId;
use crate::observability::COMPENSATIONS_TOTAL;
use crate::queue::{JobId, JobQueue, QueueError};

pub struct CompensationHandler {
    ledger: Arc<Ledger>,
    counter: Arc<dyn CounterStore>,
    queue: Arc<JobQueue>,
}

impl CompensationHandler {
    pub fn new(ledger: Arc<Ledger>, counter: Arc<dyn CounterStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            ledger,
            counter,
            queue,
        }
    }

    /// Increment the slot's counter once for `job_id`, never above the
    /// slot's current capacity. `max_capacity` (the capacity at admission)
    /// is the cap only when the slot is gone from the ledger. Repeated calls
    /// for the same job are no-ops until its mark is recorded. Returns whether
    /// this call applied the unit.
    pub async fn compensate(
        &self,
        job_id: JobId,
        slot_id: SlotId,
        max_capacity: u32,
    ) -> Result<bool, CounterError> {
        let cap = match self.ledger.slot(slot_id).await {
            Ok(slot) => slot.max_capacity,
            Err(_) => max_capacity,
        };
        let applied = self
            .counter
            .increment(slot_id, i64::from(cap), Some(job_id))
            .await?;
        if applied {
            metrics::counter!(COMPENSATIONS_TOTAL).increment(1);
            info!("compensated slot {slot_id} for failed job {job_id}");
        }
        Ok(applied)
    }

    /// Compensate a dead-lettered job and record that it was done.
    /// The dead-letter record must already be durable.
    pub async fn settle(&self, job_id: JobId, slot_id: SlotId, max_capacity: u32) -> Result<(), QueueError> {
        if let Err(e) = self.compensate(job_id, slot_id, max_capacity).await {
            // Left unmarked; picked up again by `recover_pending`.
            warn!("compensation for job {job_id} failed: {e}");
            return Ok(());
        }
        self.queue.mark_compensated(job_id).await?;
        self.release_key(job_id).await;
        Ok(())
    }

    /// The durable mark now guards against a second unit.
    async fn release_key(&self, job_id: JobId) {
        if let Err(e) = self.counter.forget_key(job_id).await {
            debug!("could not release compensation key for job {job_id}: {e}");
        }
    }

    /// Finish compensations interrupted by a crash or a counter outage.
    /// Returns how many dead letters were settled.
    pub async fn recover_pending(&self) -> usize {
        let mut settled = 0;
        for dead in self.queue.pending_compensations().await {
            let job = &dead.job;
            match self.compensate(dead.id, job.slot_id, job.max_capacity).await {
                Ok(_) => match self.queue.mark_compensated(dead.id).await {
                    Ok(()) => {
                        self.release_key(dead.id).await;
                        settled += 1;
                    }
                    Err(e) => warn!("could not mark job {} compensated: {e}", dead.id),
                },
                Err(e) => warn!("compensation for job {} still failing: {e}", dead.id),
            }
        }
        if settled > 0 {
            info!("recovered {settled} pending compensations");
        }
        settled
    }
}
