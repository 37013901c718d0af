use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{DEAD_LETTER_RETENTION, MAX_QUEUED_JOBS};
use crate::retry::RetryPolicy;

/// Knobs for the admission/fulfillment pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub counter_timeout: Duration,
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// Jobs waiting or in flight before admission fails with `ENQUEUE_FAILED`.
    pub max_queued_jobs: usize,
    pub dead_letter_retention: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            counter_timeout: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            compact_threshold: 1000,
            max_queued_jobs: MAX_QUEUED_JOBS,
            dead_letter_retention: DEAD_LETTER_RETENTION,
        }
    }
}

/// Server settings, read from `SLOTGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub pipeline: PipelineConfig,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Missing or unparsable values fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = PipelineConfig::default();
        let retry = RetryPolicy::builder()
            .max_attempts(env_or("SLOTGATE_MAX_ATTEMPTS", defaults.retry.max_attempts).max(1))
            .initial_delay(Duration::from_millis(env_or("SLOTGATE_RETRY_INITIAL_MS", 50)))
            .max_delay(Duration::from_millis(env_or("SLOTGATE_RETRY_MAX_MS", 5000)))
            .build();

        Self {
            bind: env_or("SLOTGATE_BIND", "0.0.0.0".to_string()),
            port: env_or("SLOTGATE_PORT", 7878),
            data_dir: PathBuf::from(env_or("SLOTGATE_DATA_DIR", "./data".to_string())),
            max_connections: env_or("SLOTGATE_MAX_CONNECTIONS", 256),
            metrics_port: std::env::var("SLOTGATE_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            pipeline: PipelineConfig {
                workers: env_or("SLOTGATE_WORKERS", defaults.workers).max(1),
                counter_timeout: Duration::from_millis(env_or("SLOTGATE_COUNTER_TIMEOUT_MS", 100)),
                visibility_timeout: Duration::from_millis(env_or(
                    "SLOTGATE_VISIBILITY_TIMEOUT_MS",
                    30_000,
                )),
                retry,
                compact_threshold: env_or("SLOTGATE_COMPACT_THRESHOLD", defaults.compact_threshold),
                max_queued_jobs: env_or("SLOTGATE_MAX_QUEUED_JOBS", defaults.max_queued_jobs),
                dead_letter_retention: Duration::from_secs(env_or(
                    "SLOTGATE_DEAD_LETTER_RETENTION_SECS",
                    defaults.dead_letter_retention.as_secs(),
                )),
            },
        }
    }
}
