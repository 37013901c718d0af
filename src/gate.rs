//! Admission gate: the fast path in front of the ledger.
//!
//! One atomic decrement against the counter store decides whether a request
//! may proceed. Accepted requests become fulfillment jobs; nothing here
//! touches a ledger lock beyond the point read of the slot row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::counter::CounterStore;
use crate::ledger::{Ledger, LedgerError};
use crate::limits::*;
use crate::model::*;
use crate::observability::{ADMISSION_DURATION_SECONDS, ADMISSIONS_TOTAL};
use crate::queue::{JobId, JobQueue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("invalid user id: {0}")]
    InvalidUser(&'static str),
    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),
    #[error("slot {0} is full")]
    SlotFull(SlotId),
    #[error("counter store unavailable: {0}")]
    CounterUnavailable(String),
    #[error("could not enqueue fulfillment job: {0}")]
    Enqueue(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::InvalidUser(_) => "INVALID_USER",
            AdmissionError::SlotNotFound(_) => "SLOT_NOT_FOUND",
            AdmissionError::SlotFull(_) => "SLOT_FULL",
            AdmissionError::CounterUnavailable(_) => "COUNTER_UNAVAILABLE",
            AdmissionError::Enqueue(_) => "ENQUEUE_FAILED",
        }
    }

    /// Transient failures the caller may retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdmissionError::CounterUnavailable(_) | AdmissionError::Enqueue(_)
        )
    }

    fn outcome(&self) -> &'static str {
        match self {
            AdmissionError::InvalidUser(_) => "invalid_user",
            AdmissionError::SlotNotFound(_) => "slot_not_found",
            AdmissionError::SlotFull(_) => "slot_full",
            AdmissionError::CounterUnavailable(_) => "counter_unavailable",
            AdmissionError::Enqueue(_) => "enqueue_failed",
        }
    }
}

/// An accepted request. The reservation itself does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub status: ReservationStatus,
    pub job_id: JobId,
}

pub struct AdmissionGate {
    ledger: Arc<Ledger>,
    counter: Arc<dyn CounterStore>,
    queue: Arc<JobQueue>,
    counter_timeout: Duration,
}

fn validate_user(user_id: &str) -> Result<(), AdmissionError> {
    if user_id.is_empty() {
        return Err(AdmissionError::InvalidUser("empty"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(AdmissionError::InvalidUser("too long"));
    }
    Ok(())
}

impl AdmissionGate {
    pub fn new(
        ledger: Arc<Ledger>,
        counter: Arc<dyn CounterStore>,
        queue: Arc<JobQueue>,
        counter_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            counter,
            queue,
            counter_timeout,
        }
    }

    /// Admit or reject a reservation request.
    pub async fn apply(&self, user_id: &str, slot_id: SlotId) -> Result<Admission, AdmissionError> {
        let start = Instant::now();
        let result = self.admit(user_id, slot_id).await;
        metrics::histogram!(ADMISSION_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(e) => e.outcome(),
        };
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn admit(&self, user_id: &str, slot_id: SlotId) -> Result<Admission, AdmissionError> {
        validate_user(user_id)?;
        let slot = self.ledger.slot(slot_id).await.map_err(|e| match e {
            LedgerError::SlotNotFound(id) => AdmissionError::SlotNotFound(id),
            other => AdmissionError::CounterUnavailable(other.to_string()),
        })?;

        let seed = i64::from(slot.remaining());
        let decremented = tokio::time::timeout(
            self.counter_timeout,
            self.counter.try_decrement(slot_id, seed),
        )
        .await
        .map_err(|_| AdmissionError::CounterUnavailable("timed out".into()))?
        .map_err(|e| AdmissionError::CounterUnavailable(e.to_string()))?;

        let Some(remaining) = decremented else {
            debug!("rejected {user_id} for full slot {slot_id}");
            return Err(AdmissionError::SlotFull(slot_id));
        };

        let job = FulfillmentJob {
            user_id: user_id.to_string(),
            slot_id,
            max_capacity: slot.max_capacity,
        };
        match self.queue.enqueue(job).await {
            Ok(job_id) => {
                debug!("admitted {user_id} to slot {slot_id} as job {job_id} ({remaining} left)");
                Ok(Admission {
                    status: ReservationStatus::Pending,
                    job_id,
                })
            }
            Err(e) => {
                // The unit was taken but no job will ever commit it.
                if let Err(ce) = self
                    .counter
                    .increment(slot_id, i64::from(slot.max_capacity), None)
                    .await
                {
                    warn!("failed to restore counter for slot {slot_id} after enqueue error: {ce}");
                }
                Err(AdmissionError::Enqueue(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use tokio_test::assert_ok;
    use ulid::Ulid;

    use super::*;
    use crate::counter::{CounterError, InMemoryCounterStore};
    use crate::queue::QueueError;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotgate_test_gate").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Fixture {
        ledger: Arc<Ledger>,
        counter: Arc<InMemoryCounterStore>,
        queue: Arc<JobQueue>,
        gate: AdmissionGate,
    }

    async fn fixture(name: &str, capacity: u32) -> Fixture {
        let dir = test_dir(name);
        let ledger = Arc::new(Ledger::open(&dir.join("ledger.wal")).unwrap());
        ledger.create_slot(1, 100, capacity).await.unwrap();
        let queue = Arc::new(JobQueue::open(&dir.join("queue.wal"), Duration::from_secs(30)).unwrap());
        let counter = Arc::new(InMemoryCounterStore::new());
        let gate = AdmissionGate::new(
            ledger.clone(),
            counter.clone(),
            queue.clone(),
            Duration::from_millis(100),
        );
        Fixture {
            ledger,
            counter,
            queue,
            gate,
        }
    }

    #[tokio::test]
    async fn accepts_until_full_then_rejects() {
        let f = fixture("until_full", 2).await;
        let a = assert_ok!(f.gate.apply("alice", 1).await);
        assert_eq!(a.status, ReservationStatus::Pending);
        assert_ok!(f.gate.apply("bob", 1).await);
        assert_eq!(
            f.gate.apply("carol", 1).await,
            Err(AdmissionError::SlotFull(1))
        );

        assert_eq!(f.counter.get(1).await, Ok(Some(0)));
        assert_eq!(f.queue.stats().await.ready, 2);
        // Admission never touches the ledger row
        assert_eq!(f.ledger.slot(1).await.unwrap().current_count, 0);
    }

    #[tokio::test]
    async fn job_carries_capacity_at_admission() {
        let f = fixture("job_payload", 3).await;
        let admission = f.gate.apply("alice", 1).await.unwrap();
        let delivery = f.queue.try_receive().await.unwrap();
        assert_eq!(delivery.id, admission.job_id);
        assert_eq!(
            delivery.job,
            FulfillmentJob {
                user_id: "alice".into(),
                slot_id: 1,
                max_capacity: 3,
            }
        );
    }

    #[tokio::test]
    async fn unknown_slot_creates_no_counter_entry() {
        let f = fixture("unknown_slot", 1).await;
        assert_eq!(
            f.gate.apply("alice", 99).await,
            Err(AdmissionError::SlotNotFound(99))
        );
        assert_eq!(f.counter.get(99).await, Ok(None));
        assert!(f.queue.is_idle().await);
    }

    #[tokio::test]
    async fn counter_is_seeded_from_ledger() {
        let f = fixture("seeded", 3).await;
        let version = f.ledger.slot(1).await.unwrap().version;
        f.ledger
            .commit_reservation(crate::ledger::CommitRequest {
                slot_id: 1,
                expected_version: version,
                user_id: "early",
                job_id: None,
            })
            .await
            .unwrap();

        f.gate.apply("alice", 1).await.unwrap();
        // 3 - 1 committed - 1 admitted
        assert_eq!(f.counter.get(1).await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn rejects_bad_user_ids() {
        let f = fixture("bad_user", 1).await;
        assert_eq!(
            f.gate.apply("", 1).await,
            Err(AdmissionError::InvalidUser("empty"))
        );
        let long = "x".repeat(MAX_USER_ID_LEN + 1);
        assert_eq!(
            f.gate.apply(&long, 1).await,
            Err(AdmissionError::InvalidUser("too long"))
        );
        assert_eq!(f.counter.get(1).await, Ok(None));
    }

    struct StalledCounter;

    #[async_trait]
    impl CounterStore for StalledCounter {
        async fn try_decrement(&self, _: SlotId, _: i64) -> Result<Option<i64>, CounterError> {
            std::future::pending().await
        }
        async fn increment(&self, _: SlotId, _: i64, _: Option<Ulid>) -> Result<bool, CounterError> {
            Ok(true)
        }
        async fn adjust(&self, _: SlotId, _: i64) -> Result<Option<i64>, CounterError> {
            Ok(None)
        }
        async fn set(&self, _: SlotId, _: i64) -> Result<(), CounterError> {
            Ok(())
        }
        async fn get(&self, _: SlotId) -> Result<Option<i64>, CounterError> {
            Ok(None)
        }
    }

    struct BrokenCounter;

    #[async_trait]
    impl CounterStore for BrokenCounter {
        async fn try_decrement(&self, _: SlotId, _: i64) -> Result<Option<i64>, CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }
        async fn increment(&self, _: SlotId, _: i64, _: Option<Ulid>) -> Result<bool, CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }
        async fn adjust(&self, _: SlotId, _: i64) -> Result<Option<i64>, CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: SlotId, _: i64) -> Result<(), CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: SlotId) -> Result<Option<i64>, CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn stalled_counter_times_out_as_unavailable() {
        let f = fixture("stalled", 1).await;
        let gate = AdmissionGate::new(
            f.ledger.clone(),
            Arc::new(StalledCounter),
            f.queue.clone(),
            Duration::from_millis(20),
        );
        let err = gate.apply("alice", 1).await.unwrap_err();
        assert!(matches!(err, AdmissionError::CounterUnavailable(_)));
        assert!(err.is_transient());
        assert!(f.queue.is_idle().await);
    }

    #[tokio::test]
    async fn counter_error_is_unavailable_not_reject() {
        let f = fixture("broken", 1).await;
        let gate = AdmissionGate::new(
            f.ledger.clone(),
            Arc::new(BrokenCounter),
            f.queue.clone(),
            Duration::from_millis(100),
        );
        let err = gate.apply("alice", 1).await.unwrap_err();
        assert_eq!(err.code(), "COUNTER_UNAVAILABLE");
        assert!(f.queue.is_idle().await);
    }

    #[tokio::test]
    async fn enqueue_failure_gives_the_unit_back() {
        let dir = test_dir("enqueue_full");
        let ledger = Arc::new(Ledger::open(&dir.join("ledger.wal")).unwrap());
        ledger.create_slot(1, 100, 3).await.unwrap();
        let queue = Arc::new(
            JobQueue::open(&dir.join("queue.wal"), Duration::from_secs(30))
                .unwrap()
                .with_max_jobs(1),
        );
        let counter = Arc::new(InMemoryCounterStore::new());
        let gate = AdmissionGate::new(ledger, counter.clone(), queue.clone(), Duration::from_millis(100));

        assert_ok!(gate.apply("alice", 1).await);
        assert_eq!(counter.get(1).await, Ok(Some(2)));

        let err = gate.apply("bob", 1).await.unwrap_err();
        assert_eq!(err, AdmissionError::Enqueue(QueueError::Full.to_string()));
        assert_eq!(err.code(), "ENQUEUE_FAILED");
        assert_eq!(counter.get(1).await, Ok(Some(2)));
        assert_eq!(queue.stats().await.ready, 1);
    }
}
