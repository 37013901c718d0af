use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: admission attempts. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "slotgate_admissions_total";

/// Histogram: admission latency in seconds.
pub const ADMISSION_DURATION_SECONDS: &str = "slotgate_admission_duration_seconds";

/// Counter: durable commit attempts. Labels: outcome.
pub const COMMITS_TOTAL: &str = "slotgate_commits_total";

/// Histogram: commit protocol latency in seconds.
pub const COMMIT_DURATION_SECONDS: &str = "slotgate_commit_duration_seconds";

/// Counter: counter units given back for failed jobs.
pub const COMPENSATIONS_TOTAL: &str = "slotgate_compensations_total";

/// Counter: requests served over the wire. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotgate_requests_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: jobs waiting for delivery (ready + delayed).
pub const QUEUE_DEPTH: &str = "slotgate_queue_depth";

/// Gauge: jobs leased to a worker.
pub const QUEUE_IN_FLIGHT: &str = "slotgate_queue_in_flight";

/// Gauge: jobs in the dead-letter set.
pub const DEAD_LETTERS: &str = "slotgate_dead_letters";

/// Counter: leases reclaimed after the visibility timeout.
pub const LEASES_RECLAIMED_TOTAL: &str = "slotgate_leases_reclaimed_total";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotgate_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotgate_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotgate_connections_rejected_total";

/// Gauge: capacity stream subscribers.
pub const SUBSCRIBERS_ACTIVE: &str = "slotgate_subscribers_active";

/// Histogram: WAL group-commit flush duration in seconds. Labels: log.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotgate_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush). Labels: log.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotgate_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
