use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compensation::CompensationHandler;
use crate::ledger::Ledger;
use crate::model::now_ms;
use crate::observability::{DEAD_LETTERS, LEASES_RECLAIMED_TOTAL, QUEUE_DEPTH, QUEUE_IN_FLIGHT};
use crate::queue::JobQueue;

const REAP_INTERVAL: Duration = Duration::from_secs(1);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// One reaper pass: hand expired leases back to the queue and retry any
/// compensation that failed earlier. Returns the number of reclaimed leases.
pub async fn reap_once(queue: &JobQueue, compensation: &CompensationHandler) -> usize {
    let reclaimed = queue.reclaim_expired(now_ms()).await;
    if reclaimed > 0 {
        info!("reclaimed {reclaimed} expired job leases");
        metrics::counter!(LEASES_RECLAIMED_TOTAL).increment(reclaimed as u64);
    }
    compensation.recover_pending().await;

    let stats = queue.stats().await;
    metrics::gauge!(QUEUE_DEPTH).set((stats.ready + stats.delayed) as f64);
    metrics::gauge!(QUEUE_IN_FLIGHT).set(stats.in_flight as f64);
    metrics::gauge!(DEAD_LETTERS).set(stats.dead as f64);
    reclaimed
}

/// Background task that periodically reclaims expired job leases.
pub async fn run_reaper(
    queue: Arc<JobQueue>,
    compensation: Arc<CompensationHandler>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        reap_once(&queue, &compensation).await;
    }
    debug!("reaper stopped");
}

/// Compact each log that has grown past `threshold` appends.
pub async fn compact_once(ledger: &Ledger, queue: &JobQueue, threshold: u64) {
    if ledger.appends_since_compact().await >= threshold {
        match ledger.compact().await {
            Ok(records) => info!("compacted ledger WAL to {records} records"),
            Err(e) => warn!("ledger compaction failed: {e}"),
        }
    }
    if queue.appends_since_compact().await >= threshold {
        match queue.compact().await {
            Ok(records) => info!("compacted queue WAL to {records} records"),
            Err(e) => warn!("queue compaction failed: {e}"),
        }
    }
}

/// Background task that keeps both WALs bounded.
pub async fn run_compactor(
    ledger: Arc<Ledger>,
    queue: Arc<JobQueue>,
    threshold: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        compact_once(&ledger, &queue, threshold).await;
    }
    debug!("compactor stopped");
}
