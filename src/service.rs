//! The reservation service: wires the counter store, ledger, queue, workers
//! and capacity bus together and owns the paths that touch more than one of
//! them (cancellation, resize, counter resync).

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compensation::CompensationHandler;
use crate::config::PipelineConfig;
use crate::counter::{CounterError, CounterStore};
use crate::gate::{Admission, AdmissionError, AdmissionGate};
use crate::ledger::{Ledger, LedgerError};
use crate::model::*;
use crate::notify::{CapacityHub, CapacitySubscription};
use crate::queue::{DeadLetter, JobQueue, QueueStats};
use crate::reaper;
use crate::worker::{self, Worker};

pub const LEDGER_WAL: &str = "ledger.wal";
pub const QUEUE_WAL: &str = "queue.wal";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Counter(#[from] CounterError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Admission(e) => e.code(),
            ServiceError::Ledger(e) => e.code(),
            ServiceError::Counter(_) => "COUNTER_UNAVAILABLE",
        }
    }
}

pub struct ReservationService {
    ledger: Arc<Ledger>,
    counter: Arc<dyn CounterStore>,
    queue: Arc<JobQueue>,
    hub: Arc<CapacityHub>,
    gate: AdmissionGate,
    compensation: Arc<CompensationHandler>,
    worker: Arc<Worker>,
    config: PipelineConfig,
}

impl ReservationService {
    /// Open (or create) the ledger and queue logs under `data_dir` and finish
    /// any compensation a previous run left pending. Workers are not started.
    pub async fn open(
        data_dir: &Path,
        counter: Arc<dyn CounterStore>,
        config: PipelineConfig,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let ledger = Arc::new(Ledger::open(&data_dir.join(LEDGER_WAL))?);
        let queue = Arc::new(
            JobQueue::open(&data_dir.join(QUEUE_WAL), config.visibility_timeout)?
                .with_max_jobs(config.max_queued_jobs)
                .with_dead_letter_retention(config.dead_letter_retention),
        );
        let hub = Arc::new(CapacityHub::new(ledger.clone()));
        let compensation = Arc::new(CompensationHandler::new(
            ledger.clone(),
            counter.clone(),
            queue.clone(),
        ));
        let gate = AdmissionGate::new(
            ledger.clone(),
            counter.clone(),
            queue.clone(),
            config.counter_timeout,
        );
        let worker = Arc::new(Worker::new(
            ledger.clone(),
            queue.clone(),
            hub.clone(),
            compensation.clone(),
            config.retry.clone(),
        ));

        let stats = queue.stats().await;
        info!(
            "opened {} slots, {} queued jobs, {} dead letters",
            ledger.slot_count(),
            stats.ready + stats.delayed,
            stats.dead
        );
        compensation.recover_pending().await;

        Ok(Self {
            ledger,
            counter,
            queue,
            hub,
            gate,
            compensation,
            worker,
            config,
        })
    }

    /// Start the worker pool, the lease reaper and the WAL compactor.
    /// Everything stops when `shutdown` fires.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = worker::spawn_pool(self.worker.clone(), self.config.workers, shutdown);
        handles.push(tokio::spawn(reaper::run_reaper(
            self.queue.clone(),
            self.compensation.clone(),
            shutdown.clone(),
        )));
        handles.push(tokio::spawn(reaper::run_compactor(
            self.ledger.clone(),
            self.queue.clone(),
            self.config.compact_threshold,
            shutdown.clone(),
        )));
        handles
    }

    // ── Admission and cancellation ───────────────────────────────

    pub async fn apply(&self, user_id: &str, slot_id: SlotId) -> Result<Admission, AdmissionError> {
        self.gate.apply(user_id, slot_id).await
    }

    /// Cancel a reservation, give its unit back to the counter store and
    /// publish the new capacity.
    pub async fn cancel(&self, reservation_id: ReservationId, user_id: &str) -> Result<Reservation, LedgerError> {
        let reservation = self.ledger.cancel_reservation(reservation_id, user_id).await?;
        let slot = self.ledger.slot(reservation.slot_id).await?;
        if let Err(e) = self
            .counter
            .increment(slot.id, i64::from(slot.max_capacity), None)
            .await
        {
            warn!("cancelled reservation {reservation_id} but could not restore counter for slot {}: {e}", slot.id);
        }
        self.hub.publish(Some(slot.id), Some(slot.event_id)).await;
        Ok(reservation)
    }

    // ── Reads ────────────────────────────────────────────────────

    pub async fn reservations_for_user(&self, user_id: &str) -> Vec<Reservation> {
        self.ledger.reservations_for_user(user_id).await
    }

    pub async fn reservation(&self, id: ReservationId) -> Result<Reservation, LedgerError> {
        self.ledger
            .reservation(id)
            .await
            .ok_or(LedgerError::ReservationNotFound(id))
    }

    pub async fn active_reservation(&self, user_id: &str, event_id: EventId) -> Option<Reservation> {
        self.ledger.active_reservation(user_id, event_id).await
    }

    pub async fn slots(&self) -> Vec<Slot> {
        self.ledger.slots().await
    }

    pub async fn slot(&self, id: SlotId) -> Result<Slot, LedgerError> {
        self.ledger.slot(id).await
    }

    pub async fn capacity_snapshot(&self) -> Vec<SlotCapacity> {
        self.ledger.capacity_snapshot().await
    }

    pub async fn subscribe(&self) -> CapacitySubscription {
        self.hub.subscribe().await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters().await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// No admitted job is still waiting to be committed.
    pub async fn is_drained(&self) -> bool {
        self.queue.is_idle().await
    }

    // ── Administration ───────────────────────────────────────────

    pub async fn create_slot(
        &self,
        id: SlotId,
        event_id: EventId,
        max_capacity: u32,
    ) -> Result<Slot, LedgerError> {
        let slot = self.ledger.create_slot(id, event_id, max_capacity).await?;
        info!("created slot {id} in event {event_id} with capacity {max_capacity}");
        self.hub.publish(Some(id), Some(event_id)).await;
        Ok(slot)
    }

    /// Change a slot's capacity. The counter entry moves by the same delta.
    pub async fn resize_slot(&self, id: SlotId, max_capacity: u32) -> Result<Slot, ServiceError> {
        let (slot, previous) = self.ledger.resize_slot(id, max_capacity).await?;
        let delta = i64::from(max_capacity) - i64::from(previous);
        if delta != 0 {
            self.counter.adjust(id, delta).await?;
        }
        info!("resized slot {id} from {previous} to {max_capacity}");
        self.hub.publish(Some(id), Some(slot.event_id)).await;
        Ok(slot)
    }

    /// Overwrite every counter entry with the ledger's remaining capacity.
    /// Returns the number of entries written.
    pub async fn resync_counters(&self) -> Result<usize, CounterError> {
        let slots = self.ledger.slots().await;
        for slot in &slots {
            self.counter.set(slot.id, i64::from(slot.remaining())).await?;
        }
        info!("resynchronised {} counter entries from the ledger", slots.len());
        Ok(slots.len())
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}
