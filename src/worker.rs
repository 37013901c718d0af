//! Fulfillment workers: consume admitted jobs and commit them to the ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compensation::CompensationHandler;
use crate::ledger::{CommitRequest, Committed, Ledger, LedgerError};
use crate::model::Reservation;
use crate::notify::CapacityHub;
use crate::observability::{COMMIT_DURATION_SECONDS, COMMITS_TOTAL};
use crate::queue::{Delivery, JobQueue, QueueError};
use crate::retry::RetryPolicy;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// New reservation row, job acknowledged.
    Confirmed(Reservation),
    /// A previous delivery already committed this job.
    AlreadyConfirmed(Reservation),
    /// Transient failure; the queue redelivers after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Dead-lettered and compensated.
    Failed(LedgerError),
    /// Settling the job failed; its lease runs out and it is delivered again.
    Unsettled(QueueError),
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Confirmed(_) => "confirmed",
            JobOutcome::AlreadyConfirmed(_) => "already_confirmed",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::Failed(_) => "failed",
            JobOutcome::Unsettled(_) => "unsettled",
        }
    }
}

pub struct Worker {
    ledger: Arc<Ledger>,
    queue: Arc<JobQueue>,
    hub: Arc<CapacityHub>,
    compensation: Arc<CompensationHandler>,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(
        ledger: Arc<Ledger>,
        queue: Arc<JobQueue>,
        hub: Arc<CapacityHub>,
        compensation: Arc<CompensationHandler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            queue,
            hub,
            compensation,
            retry,
        }
    }

    /// Read the slot, then commit against the version that was read.
    async fn commit(&self, delivery: &Delivery) -> Result<Committed, LedgerError> {
        let job = &delivery.job;
        let slot = self.ledger.slot(job.slot_id).await?;
        self.ledger
            .commit_reservation(CommitRequest {
                slot_id: job.slot_id,
                expected_version: slot.version,
                user_id: &job.user_id,
                job_id: Some(delivery.id),
            })
            .await
    }

    /// Run the commit protocol for one delivery and settle it with the queue.
    pub async fn handle(&self, delivery: Delivery) -> JobOutcome {
        let start = Instant::now();
        let result = self.commit(&delivery).await;
        metrics::histogram!(COMMIT_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        let outcome = self.settle(&delivery, result).await;
        metrics::counter!(COMMITS_TOTAL, "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn settle(&self, delivery: &Delivery, result: Result<Committed, LedgerError>) -> JobOutcome {
        match result {
            Ok(committed) => self.on_committed(delivery, committed).await,
            Err(e) if e.is_retriable() && self.retry.allows_retry(delivery.attempt) => {
                let delay = self.retry.delay_for_attempt(delivery.attempt);
                debug!(
                    "job {} attempt {} failed ({e}), retrying in {delay:?}",
                    delivery.id, delivery.attempt
                );
                match self.queue.retry(delivery, delay).await {
                    Ok(()) => JobOutcome::Retrying {
                        attempt: delivery.attempt,
                        delay,
                    },
                    Err(qe) => self.unsettled(delivery, qe),
                }
            }
            Err(e) => self.on_failed(delivery, e).await,
        }
    }

    async fn on_committed(&self, delivery: &Delivery, committed: Committed) -> JobOutcome {
        let (Committed::Inserted(reservation) | Committed::AlreadyCommitted(reservation)) = &committed;
        // Published before the ack: the row is durable even if the lease is gone.
        self.hub
            .publish(Some(reservation.slot_id), Some(reservation.event_id))
            .await;
        if let Err(e) = self.queue.ack(delivery).await {
            // The redelivery finds the row and acks then.
            return self.unsettled(delivery, e);
        }
        match committed {
            Committed::Inserted(reservation) => {
                debug!(
                    "confirmed reservation {} for {} on slot {}",
                    reservation.id, reservation.user_id, reservation.slot_id
                );
                JobOutcome::Confirmed(reservation)
            }
            Committed::AlreadyCommitted(reservation) => {
                debug!("job {} was already committed as {}", delivery.id, reservation.id);
                JobOutcome::AlreadyConfirmed(reservation)
            }
        }
    }

    async fn on_failed(&self, delivery: &Delivery, error: LedgerError) -> JobOutcome {
        let job = &delivery.job;
        warn!(
            "job {} for {} on slot {} failed after {} attempts: {error}",
            delivery.id, job.user_id, job.slot_id, delivery.attempt
        );
        if let Err(e) = self.queue.dead_letter(delivery, &error.to_string()).await {
            // Not dead-lettered, so the job stays deliverable: do not compensate.
            return self.unsettled(delivery, e);
        }
        if let Err(e) = self
            .compensation
            .settle(delivery.id, job.slot_id, job.max_capacity)
            .await
        {
            warn!("could not record compensation for job {}: {e}", delivery.id);
        }
        JobOutcome::Failed(error)
    }

    fn unsettled(&self, delivery: &Delivery, error: QueueError) -> JobOutcome {
        match &error {
            QueueError::LeaseLost(_) => {
                debug!("lease on job {} lost, leaving it to the redelivery", delivery.id)
            }
            _ => warn!("could not settle job {}: {error}", delivery.id),
        }
        JobOutcome::Unsettled(error)
    }

    /// Consume jobs until `shutdown` fires. A job being handled when the
    /// token fires is finished first.
    pub async fn run(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        debug!("fulfillment worker {worker_id} started");
        while let Some(delivery) = self.queue.receive(&shutdown).await {
            self.handle(delivery).await;
        }
        debug!("fulfillment worker {worker_id} stopped");
    }
}

/// Start `count` workers sharing one `Worker`.
pub fn spawn_pool(
    worker: Arc<Worker>,
    count: usize,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!("starting {count} fulfillment workers");
    (0..count)
        .map(|id| tokio::spawn(worker.clone().run(id, shutdown.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::counter::{CounterStore, InMemoryCounterStore};
    use crate::model::{FulfillmentJob, ReservationStatus, now_ms};

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgate_test_worker").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Fixture {
        ledger: Arc<Ledger>,
        queue: Arc<JobQueue>,
        counter: Arc<InMemoryCounterStore>,
        hub: Arc<CapacityHub>,
        worker: Worker,
    }

    fn fixture(name: &str, max_attempts: u32) -> Fixture {
        let dir = test_dir(name);
        let ledger = Arc::new(Ledger::open(&dir.join("ledger.wal")).unwrap());
        let queue = Arc::new(JobQueue::open(&dir.join("queue.wal"), Duration::from_secs(30)).unwrap());
        let counter = Arc::new(InMemoryCounterStore::new());
        let hub = Arc::new(CapacityHub::new(ledger.clone()));
        let compensation = Arc::new(CompensationHandler::new(
            ledger.clone(),
            counter.clone(),
            queue.clone(),
        ));
        let retry = RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::ZERO)
            .build();
        let worker = Worker::new(ledger.clone(), queue.clone(), hub.clone(), compensation, retry);
        Fixture {
            ledger,
            queue,
            counter,
            hub,
            worker,
        }
    }

    fn job(user: &str, slot_id: u64, max_capacity: u32) -> FulfillmentJob {
        FulfillmentJob {
            user_id: user.into(),
            slot_id,
            max_capacity,
        }
    }

    #[tokio::test]
    async fn confirms_and_acks() {
        let f = fixture("confirm", 5);
        f.ledger.create_slot(1, 10, 2).await.unwrap();
        let job_id = f.queue.enqueue(job("alice", 1, 2)).await.unwrap();

        let delivery = f.queue.try_receive().await.unwrap();
        let JobOutcome::Confirmed(r) = f.worker.handle(delivery).await else {
            panic!("expected confirmation");
        };
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert_eq!(r.job_id, Some(job_id));
        assert!(f.queue.is_idle().await);

        let slot = f.ledger.slot(1).await.unwrap();
        assert_eq!((slot.current_count, slot.version), (1, 1));
    }

    #[tokio::test]
    async fn duplicate_is_dead_lettered_and_compensated() {
        let f = fixture("duplicate", 5);
        f.ledger.create_slot(1, 10, 3).await.unwrap();
        f.counter.set(1, 1).await.unwrap();

        f.queue.enqueue(job("alice", 1, 3)).await.unwrap();
        let first = f.queue.try_receive().await.unwrap();
        f.worker.handle(first).await;

        f.queue.enqueue(job("alice", 1, 3)).await.unwrap();
        let second = f.queue.try_receive().await.unwrap();
        let outcome = f.worker.handle(second).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed(LedgerError::DuplicateReservation { .. })
        ));

        assert_eq!(f.counter.get(1).await, Ok(Some(2)));
        let dead = f.queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].compensated);
        assert_eq!(f.ledger.slot(1).await.unwrap().current_count, 1);
    }

    #[tokio::test]
    async fn unknown_slot_is_terminal() {
        let f = fixture("unknown", 5);
        f.queue.enqueue(job("alice", 42, 1)).await.unwrap();
        let delivery = f.queue.try_receive().await.unwrap();
        assert_eq!(
            f.worker.handle(delivery).await,
            JobOutcome::Failed(LedgerError::SlotNotFound(42))
        );
        assert_eq!(f.queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn full_slot_conflict_is_terminal() {
        let f = fixture("full", 5);
        f.ledger.create_slot(1, 10, 1).await.unwrap();
        f.counter.set(1, 0).await.unwrap();
        f.ledger
            .commit_reservation(CommitRequest {
                slot_id: 1,
                expected_version: 0,
                user_id: "bob",
                job_id: None,
            })
            .await
            .unwrap();

        f.queue.enqueue(job("alice", 1, 1)).await.unwrap();
        let delivery = f.queue.try_receive().await.unwrap();
        let outcome = f.worker.handle(delivery).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed(LedgerError::OptimisticLockConflict { full: true, .. })
        ));
        // Compensation is capped at the slot's capacity
        assert_eq!(f.counter.get(1).await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn redelivered_committed_job_is_acked_without_compensation() {
        let f = fixture("redelivered", 5);
        f.ledger.create_slot(1, 10, 2).await.unwrap();
        f.counter.set(1, 1).await.unwrap();
        f.queue.enqueue(job("alice", 1, 2)).await.unwrap();

        // Commit lands, then the worker dies before acking
        let first = f.queue.try_receive().await.unwrap();
        f.ledger
            .commit_reservation(CommitRequest {
                slot_id: 1,
                expected_version: 0,
                user_id: "alice",
                job_id: Some(first.id),
            })
            .await
            .unwrap();
        f.queue.reclaim_expired(now_ms() + 60_000).await;

        let second = f.queue.try_receive().await.unwrap();
        assert!(matches!(
            f.worker.handle(second).await,
            JobOutcome::AlreadyConfirmed(_)
        ));
        assert!(f.queue.is_idle().await);
        assert!(f.queue.dead_letters().await.is_empty());
        assert_eq!(f.counter.get(1).await, Ok(Some(1)));
        assert_eq!(f.ledger.slot(1).await.unwrap().current_count, 1);
    }

    #[tokio::test]
    async fn lost_lease_never_compensates() {
        let f = fixture("lost_lease", 5);
        f.counter.set(9, 0).await.unwrap();
        f.queue.enqueue(job("alice", 9, 1)).await.unwrap();

        let stale = f.queue.try_receive().await.unwrap();
        f.queue.reclaim_expired(now_ms() + 60_000).await;
        let _fresh = f.queue.try_receive().await.unwrap();

        // Slot 9 does not exist: terminal, but the lease is gone
        let outcome = f.worker.handle(stale).await;
        assert!(matches!(
            outcome,
            JobOutcome::Unsettled(QueueError::LeaseLost(_))
        ));
        assert_eq!(f.counter.get(9).await, Ok(Some(0)));
        assert!(f.queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn commit_on_a_lost_lease_is_still_published() {
        let f = fixture("publish_lost_lease", 5);
        f.ledger.create_slot(1, 10, 2).await.unwrap();
        f.queue.enqueue(job("alice", 1, 2)).await.unwrap();
        let mut sub = f.hub.subscribe().await;
        sub.next().await.unwrap();

        let stale = f.queue.try_receive().await.unwrap();
        f.queue.reclaim_expired(now_ms() + 60_000).await;
        let fresh = f.queue.try_receive().await.unwrap();

        assert!(matches!(
            f.worker.handle(stale).await,
            JobOutcome::Unsettled(QueueError::LeaseLost(_))
        ));
        let update = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.updated_slot_id, Some(1));
        assert_eq!(update.snapshot[0].current_count, 1);

        assert!(matches!(
            f.worker.handle(fresh).await,
            JobOutcome::AlreadyConfirmed(_)
        ));
        assert!(f.queue.is_idle().await);
    }

    /// Commit the delivery against version 0 of slot 1, as a worker that read
    /// the slot before a competing commit would.
    async fn stale_commit(f: &Fixture, delivery: &Delivery) -> Result<Committed, LedgerError> {
        f.ledger
            .commit_reservation(CommitRequest {
                slot_id: 1,
                expected_version: 0,
                user_id: &delivery.job.user_id,
                job_id: Some(delivery.id),
            })
            .await
    }

    #[tokio::test]
    async fn version_conflict_with_room_retries_then_confirms() {
        let f = fixture("retry_conflict", 5);
        f.ledger.create_slot(1, 10, 3).await.unwrap();
        f.counter.set(1, 1).await.unwrap();
        f.queue.enqueue(job("alice", 1, 3)).await.unwrap();
        let delivery = f.queue.try_receive().await.unwrap();

        f.ledger
            .commit_reservation(CommitRequest {
                slot_id: 1,
                expected_version: 0,
                user_id: "bob",
                job_id: None,
            })
            .await
            .unwrap();
        let result = stale_commit(&f, &delivery).await;
        assert!(matches!(
            result,
            Err(LedgerError::OptimisticLockConflict { full: false, .. })
        ));

        let outcome = f.worker.settle(&delivery, result).await;
        assert!(matches!(outcome, JobOutcome::Retrying { attempt: 1, .. }));
        assert_eq!(f.counter.get(1).await, Ok(Some(1)));
        assert!(f.queue.dead_letters().await.is_empty());

        let redelivery = f.queue.try_receive().await.unwrap();
        assert_eq!(redelivery.attempt, 2);
        assert!(matches!(
            f.worker.handle(redelivery).await,
            JobOutcome::Confirmed(_)
        ));
        assert_eq!(f.ledger.slot(1).await.unwrap().current_count, 2);
        assert!(f.queue.is_idle().await);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_once() {
        let f = fixture("retry_exhausted", 2);
        f.ledger.create_slot(1, 10, 5).await.unwrap();
        f.counter.set(1, 3).await.unwrap();
        f.queue.enqueue(job("alice", 1, 5)).await.unwrap();
        f.ledger
            .commit_reservation(CommitRequest {
                slot_id: 1,
                expected_version: 0,
                user_id: "bob",
                job_id: None,
            })
            .await
            .unwrap();

        let first = f.queue.try_receive().await.unwrap();
        let result = stale_commit(&f, &first).await;
        assert!(matches!(
            f.worker.settle(&first, result).await,
            JobOutcome::Retrying { attempt: 1, .. }
        ));

        let second = f.queue.try_receive().await.unwrap();
        let result = stale_commit(&f, &second).await;
        assert!(matches!(
            f.worker.settle(&second, result).await,
            JobOutcome::Failed(LedgerError::OptimisticLockConflict { full: false, .. })
        ));

        let dead = f.queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert!(dead[0].compensated);
        assert_eq!(f.counter.get(1).await, Ok(Some(4)));
        assert!(f.queue.is_idle().await);
        assert_eq!(f.queue.try_receive().await, None);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops() {
        let f = fixture("pool", 50);
        f.ledger.create_slot(1, 10, 10).await.unwrap();
        for i in 0..10 {
            f.queue.enqueue(job(&format!("user-{i}"), 1, 10)).await.unwrap();
        }

        let shutdown = CancellationToken::new();
        let handles = spawn_pool(Arc::new(f.worker), 3, &shutdown);
        for _ in 0..200 {
            if f.queue.is_idle().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        for h in handles {
            h.await.unwrap();
        }

        assert!(f.queue.is_idle().await);
        assert!(f.queue.dead_letters().await.is_empty());
        assert_eq!(f.ledger.slot(1).await.unwrap().current_count, 10);
    }
}
