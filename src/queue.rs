//! Durable, at-least-once fulfillment job queue.
//!
//! Jobs are logged to their own WAL. A delivered job is leased to one
//! consumer until it is acknowledged, rescheduled, or dead-lettered; a lease
//! that outlives the visibility timeout is reclaimed and the job becomes
//! deliverable again. Every settle call carries the lease token, so a
//! consumer whose lease was reclaimed cannot settle the job a second time.
//! After a restart every job without a terminal record is delivered again.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::{FulfillmentJob, Ms, now_ms};
use crate::wal::{Wal, WalHandle};

pub type JobId = Ulid;

/// Upper bound on how long an idle consumer sleeps before re-checking.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("lease on job {0} was lost")]
    LeaseLost(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("queue is full")]
    Full,
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Queue records — the queue WAL format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueRecord {
    Enqueued {
        id: JobId,
        job: FulfillmentJob,
        enqueued_at: Ms,
    },
    Retried {
        id: JobId,
        attempts: u32,
        not_before: Ms,
    },
    Acked {
        id: JobId,
    },
    DeadLettered {
        id: JobId,
        attempts: u32,
        reason: String,
        failed_at: Ms,
    },
    Compensated {
        id: JobId,
    },
}

/// A job handed to one consumer. Settle it with `ack`, `retry` or `dead_letter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: JobId,
    pub job: FulfillmentJob,
    /// 1-based count of deliveries of this job, this one included.
    pub attempt: u32,
    token: u64,
}

/// A job that failed for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: JobId,
    pub job: FulfillmentJob,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: Ms,
    /// Whether the counter unit taken at admission was given back.
    pub compensated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Ready,
    Delayed { not_before: Ms },
    InFlight { token: u64, lease_until: Ms },
}

#[derive(Debug, Clone)]
struct Entry {
    /// Enqueue order, preserved across replay and compaction.
    seq: u64,
    job: FulfillmentJob,
    attempts: u32,
    enqueued_at: Ms,
    state: EntryState,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<JobId, Entry>,
    ready: VecDeque<JobId>,
    delayed: BTreeSet<(Ms, JobId)>,
    dead: BTreeMap<JobId, DeadLetter>,
    next_token: u64,
    next_seq: u64,
}

impl QueueState {
    /// Rebuild from the log. Jobs that were in flight at crash time come back ready.
    fn replay(records: Vec<QueueRecord>) -> Self {
        let mut st = QueueState::default();
        for record in records {
            match record {
                QueueRecord::Enqueued {
                    id,
                    job,
                    enqueued_at,
                } => {
                    st.next_seq += 1;
                    st.entries.insert(
                        id,
                        Entry {
                            seq: st.next_seq,
                            job,
                            attempts: 0,
                            enqueued_at,
                            state: EntryState::Ready,
                        },
                    );
                }
                QueueRecord::Retried {
                    id,
                    attempts,
                    not_before,
                } => {
                    if let Some(entry) = st.entries.get_mut(&id) {
                        entry.attempts = attempts;
                        entry.state = EntryState::Delayed { not_before };
                    }
                }
                QueueRecord::Acked { id } => {
                    st.entries.remove(&id);
                }
                QueueRecord::DeadLettered {
                    id,
                    attempts,
                    reason,
                    failed_at,
                } => {
                    if let Some(entry) = st.entries.remove(&id) {
                        st.dead.insert(
                            id,
                            DeadLetter {
                                id,
                                job: entry.job,
                                attempts,
                                reason,
                                failed_at,
                                compensated: false,
                            },
                        );
                    }
                }
                QueueRecord::Compensated { id } => {
                    if let Some(dead) = st.dead.get_mut(&id) {
                        dead.compensated = true;
                    }
                }
            }
        }

        let mut ids: Vec<(u64, JobId)> = st.entries.iter().map(|(id, e)| (e.seq, *id)).collect();
        ids.sort();
        for (_, id) in ids {
            let state = st.entries[&id].state;
            match state {
                EntryState::Delayed { not_before } => {
                    st.delayed.insert((not_before, id));
                }
                _ => st.ready.push_back(id),
            }
        }
        st
    }

    fn promote_due(&mut self, now: Ms) {
        while let Some(&(not_before, id)) = self.delayed.first() {
            if not_before > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = EntryState::Ready;
                self.ready.push_back(id);
            }
        }
    }

    fn next_due(&self) -> Option<Ms> {
        self.delayed.first().map(|(not_before, _)| *not_before)
    }

    fn pop(&mut self, now: Ms, lease: Ms) -> Option<Delivery> {
        while let Some(id) = self.ready.pop_front() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.state != EntryState::Ready {
                continue;
            }
            self.next_token += 1;
            entry.attempts += 1;
            entry.state = EntryState::InFlight {
                token: self.next_token,
                lease_until: now + lease,
            };
            return Some(Delivery {
                id,
                job: entry.job.clone(),
                attempt: entry.attempts,
                token: self.next_token,
            });
        }
        None
    }

    /// Remove the entry if `delivery` still holds its lease.
    fn take_leased(&mut self, delivery: &Delivery) -> Result<Entry, QueueError> {
        let entry = self
            .entries
            .get(&delivery.id)
            .ok_or(QueueError::NotFound(delivery.id))?;
        match entry.state {
            EntryState::InFlight { token, .. } if token == delivery.token => {}
            _ => return Err(QueueError::LeaseLost(delivery.id)),
        }
        self.entries
            .remove(&delivery.id)
            .ok_or(QueueError::NotFound(delivery.id))
    }

    /// Put a taken entry back in flight after its settle record failed to persist.
    /// The lease runs out as before and the job is redelivered.
    fn restore(&mut self, id: JobId, entry: Entry) {
        self.entries.insert(id, entry);
    }

    fn stats(&self) -> QueueStats {
        let in_flight = self
            .entries
            .values()
            .filter(|e| matches!(e.state, EntryState::InFlight { .. }))
            .count();
        QueueStats {
            ready: self
                .entries
                .values()
                .filter(|e| e.state == EntryState::Ready)
                .count(),
            delayed: self.delayed.len(),
            in_flight,
            dead: self.dead.len(),
        }
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    wal: WalHandle<QueueRecord>,
    available: Notify,
    visibility_timeout: Duration,
    max_jobs: usize,
    /// Compensated dead letters older than this are dropped at compaction.
    dead_letter_retention: Duration,
    /// Shared by every logged operation, exclusive during compaction.
    compaction: RwLock<()>,
}

impl JobQueue {
    /// Replay the queue WAL at `wal_path` and start its group-commit writer.
    pub fn open(wal_path: &Path, visibility_timeout: Duration) -> io::Result<Self> {
        let records: Vec<QueueRecord> = Wal::replay(wal_path)?;
        let state = QueueState::replay(records);
        let wal = Wal::open(wal_path)?;
        Ok(Self {
            state: Mutex::new(state),
            wal: WalHandle::spawn(wal, "queue"),
            available: Notify::new(),
            visibility_timeout,
            max_jobs: MAX_QUEUED_JOBS,
            dead_letter_retention: DEAD_LETTER_RETENTION,
            compaction: RwLock::new(()),
        })
    }

    /// Refuse new jobs once `max_jobs` are waiting or in flight.
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.min(MAX_QUEUED_JOBS);
        self
    }

    pub fn with_dead_letter_retention(mut self, retention: Duration) -> Self {
        self.dead_letter_retention = retention;
        self
    }

    fn lease_ms(&self) -> Ms {
        self.visibility_timeout.as_millis() as Ms
    }

    async fn log(&self, record: QueueRecord) -> Result<(), QueueError> {
        self.wal
            .append(record)
            .await
            .map_err(|e| QueueError::Wal(e.to_string()))
    }

    /// Durably enqueue a job. Returns once the job is logged and deliverable.
    pub async fn enqueue(&self, job: FulfillmentJob) -> Result<JobId, QueueError> {
        let _shared = self.compaction.read().await;
        if self.state.lock().await.entries.len() >= self.max_jobs {
            return Err(QueueError::Full);
        }
        let id = Ulid::new();
        let enqueued_at = now_ms();
        self.log(QueueRecord::Enqueued {
            id,
            job: job.clone(),
            enqueued_at,
        })
        .await?;

        {
            let mut st = self.state.lock().await;
            st.next_seq += 1;
            let seq = st.next_seq;
            st.entries.insert(
                id,
                Entry {
                    seq,
                    job,
                    attempts: 0,
                    enqueued_at,
                    state: EntryState::Ready,
                },
            );
            st.ready.push_back(id);
        }
        self.available.notify_one();
        Ok(id)
    }

    /// Lease the next deliverable job without waiting.
    pub async fn try_receive(&self) -> Option<Delivery> {
        let now = now_ms();
        let mut st = self.state.lock().await;
        st.promote_due(now);
        st.pop(now, self.lease_ms())
    }

    /// Wait for the next deliverable job. Returns `None` once `shutdown` fires.
    pub async fn receive(&self, shutdown: &CancellationToken) -> Option<Delivery> {
        loop {
            let now = now_ms();
            let next_due = {
                let mut st = self.state.lock().await;
                st.promote_due(now);
                if let Some(delivery) = st.pop(now, self.lease_ms()) {
                    return Some(delivery);
                }
                st.next_due()
            };

            let wait = next_due
                .map(|due| Duration::from_millis((due - now).max(1) as u64))
                .map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// The job is done; forget it.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let _shared = self.compaction.read().await;
        let entry = self.state.lock().await.take_leased(delivery)?;
        if let Err(e) = self.log(QueueRecord::Acked { id: delivery.id }).await {
            self.state.lock().await.restore(delivery.id, entry);
            return Err(e);
        }
        Ok(())
    }

    /// Hand the job back for redelivery after `delay`.
    pub async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let _shared = self.compaction.read().await;
        let not_before = now_ms() + delay.as_millis() as Ms;
        let entry = self.state.lock().await.take_leased(delivery)?;
        let record = QueueRecord::Retried {
            id: delivery.id,
            attempts: entry.attempts,
            not_before,
        };
        if let Err(e) = self.log(record).await {
            self.state.lock().await.restore(delivery.id, entry);
            return Err(e);
        }

        {
            let mut st = self.state.lock().await;
            st.entries.insert(
                delivery.id,
                Entry {
                    state: EntryState::Delayed { not_before },
                    ..entry
                },
            );
            st.delayed.insert((not_before, delivery.id));
        }
        self.available.notify_one();
        Ok(())
    }

    /// Fail the job for good. Once this returns `Ok` the job will never be
    /// delivered again and shows up in `pending_compensations` until
    /// `mark_compensated` is called for it.
    pub async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let _shared = self.compaction.read().await;
        let entry = self.state.lock().await.take_leased(delivery)?;
        let reason: String = reason.chars().take(MAX_REASON_LEN).collect();
        let failed_at = now_ms();
        let record = QueueRecord::DeadLettered {
            id: delivery.id,
            attempts: entry.attempts,
            reason: reason.clone(),
            failed_at,
        };
        if let Err(e) = self.log(record).await {
            self.state.lock().await.restore(delivery.id, entry);
            return Err(e);
        }

        self.state.lock().await.dead.insert(
            delivery.id,
            DeadLetter {
                id: delivery.id,
                job: entry.job,
                attempts: entry.attempts,
                reason,
                failed_at,
                compensated: false,
            },
        );
        Ok(())
    }

    pub async fn mark_compensated(&self, id: JobId) -> Result<(), QueueError> {
        let _shared = self.compaction.read().await;
        {
            let st = self.state.lock().await;
            match st.dead.get(&id) {
                None => return Err(QueueError::NotFound(id)),
                Some(dead) if dead.compensated => return Ok(()),
                Some(_) => {}
            }
        }
        self.log(QueueRecord::Compensated { id }).await?;
        if let Some(dead) = self.state.lock().await.dead.get_mut(&id) {
            dead.compensated = true;
        }
        Ok(())
    }

    /// Dead letters whose compensation has not been recorded yet.
    pub async fn pending_compensations(&self) -> Vec<DeadLetter> {
        let st = self.state.lock().await;
        st.dead.values().filter(|d| !d.compensated).cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.values().cloned().collect()
    }

    /// Return jobs whose lease ran out to the ready set. Returns how many.
    pub async fn reclaim_expired(&self, now: Ms) -> usize {
        let reclaimed = {
            let mut st = self.state.lock().await;
            let expired: Vec<JobId> = st
                .entries
                .iter()
                .filter(|(_, e)| {
                    matches!(e.state, EntryState::InFlight { lease_until, .. } if lease_until <= now)
                })
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                if let Some(entry) = st.entries.get_mut(id) {
                    entry.state = EntryState::Ready;
                }
                st.ready.push_back(*id);
                debug!("lease expired on job {id}, redelivering");
            }
            expired.len()
        };
        for _ in 0..reclaimed {
            self.available.notify_one();
        }
        reclaimed
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats()
    }

    /// No job is waiting, delayed, or in flight.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the WAL as the live jobs plus the dead-letter set. Compensated
    /// dead letters past the retention period are dropped; uncompensated ones
    /// are always kept. Returns the number of records written.
    pub async fn compact(&self) -> io::Result<usize> {
        let _exclusive = self.compaction.write().await;
        let records = {
            let mut st = self.state.lock().await;
            let cutoff = now_ms() - self.dead_letter_retention.as_millis() as Ms;
            let before = st.dead.len();
            st.dead.retain(|_, d| !d.compensated || d.failed_at > cutoff);
            let expired = before - st.dead.len();
            if expired > 0 {
                debug!("dropping {expired} settled dead letters past retention");
            }
            let mut records = Vec::new();
            let mut live: Vec<(&JobId, &Entry)> = st.entries.iter().collect();
            live.sort_by_key(|(_, entry)| entry.seq);
            for (id, entry) in live {
                records.push(QueueRecord::Enqueued {
                    id: *id,
                    job: entry.job.clone(),
                    enqueued_at: entry.enqueued_at,
                });
                if entry.attempts > 0 {
                    let not_before = match entry.state {
                        EntryState::Delayed { not_before } => not_before,
                        _ => 0,
                    };
                    records.push(QueueRecord::Retried {
                        id: *id,
                        attempts: entry.attempts,
                        not_before,
                    });
                }
            }
            for dead in st.dead.values() {
                records.push(QueueRecord::Enqueued {
                    id: dead.id,
                    job: dead.job.clone(),
                    enqueued_at: dead.failed_at,
                });
                records.push(QueueRecord::DeadLettered {
                    id: dead.id,
                    attempts: dead.attempts,
                    reason: dead.reason.clone(),
                    failed_at: dead.failed_at,
                });
                if dead.compensated {
                    records.push(QueueRecord::Compensated { id: dead.id });
                }
            }
            records
        };
        let count = records.len();
        if let Err(e) = self.wal.compact(records).await {
            warn!("queue compaction failed: {e}");
            return Err(e);
        }
        Ok(count)
    }
}
