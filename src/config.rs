use std::env;
use std::time::Duration;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

/// Configuration surface for the import pipeline.
///
/// Every component (runner, buffer, doc map, importer) takes its limits from
/// here so one struct describes a whole run.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Maximum number of tasks running at once.
    pub concurrency_limit: usize,
    /// Queued-task ceiling before `submit` starts rejecting.
    pub max_queue_length: usize,
    /// Entry count that triggers an automatic buffer flush.
    pub max_buffer_size: usize,
    /// Age of the oldest unflushed entry that triggers a flush.
    pub max_buffer_age: Duration,
    /// Attempts per batch (and per resolution) before giving up.
    pub max_retries: u32,
    /// How long `drain` waits before reporting partial completion.
    pub drain_timeout: Duration,
    /// Interval between periodic counter snapshots.
    pub counter_flush_interval: Duration,
    /// Base backoff between retry attempts; scaled by attempt number.
    pub retry_backoff: Duration,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            concurrency_limit: env_usize("IMPORT_CONCURRENCY_LIMIT", 4).max(1),
            max_queue_length: env_usize("IMPORT_MAX_QUEUE_LENGTH", 1024).max(1),
            max_buffer_size: env_usize("IMPORT_MAX_BUFFER_SIZE", 500).max(1),
            max_buffer_age: env_duration_millis("IMPORT_MAX_BUFFER_AGE_MS", 5_000),
            max_retries: env_u32("IMPORT_MAX_RETRIES", 3).max(1),
            drain_timeout: env_duration_millis("IMPORT_DRAIN_TIMEOUT_MS", 60_000),
            counter_flush_interval: env_duration_millis("IMPORT_COUNTER_FLUSH_MS", 10_000),
            retry_backoff: env_duration_millis("IMPORT_RETRY_BACKOFF_MS", 250),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
