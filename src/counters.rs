//! Named progress/error counters shared by every pipeline stage.
//!
//! The registry is injected into each component at construction rather than
//! living as process-global state, so tests can substitute a fake sink and
//! two concurrent runs never share counts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Well-known counter names used across the pipeline.
pub mod names {
    pub const RECORDS_READ: &str = "records_read";
    pub const RESOLVED: &str = "resolved";
    pub const MINTED: &str = "minted";
    pub const SKIPPED_STALE: &str = "skipped_stale";
    pub const IMPORTED: &str = "imported";
    pub const FLUSHES: &str = "flushes";
    pub const RETRIES: &str = "retries";
    pub const DROPPED: &str = "dropped";
    pub const TRANSFORM_FAILED: &str = "transform_failed";
    pub const QUEUE_FULL: &str = "queue_full";
    pub const BACKPRESSURE_WAITS: &str = "backpressure_waits";
    pub const TASKS_SUBMITTED: &str = "tasks_submitted";
    pub const TASKS_SUCCEEDED: &str = "tasks_succeeded";
    pub const TASKS_FAILED: &str = "tasks_failed";
    pub const TASKS_CANCELLED: &str = "tasks_cancelled";
    pub const SOURCE_ERRORS: &str = "source_errors";
    pub const RESOLUTION_RETRIES: &str = "resolution_retries";
    pub const DRAIN_TIMEOUTS: &str = "drain_timeouts";
}

/// Destination for counter snapshots.
pub trait CounterSink: Send + Sync {
    fn record(&self, name: &str, value: i64);
}

/// Default sink: one log line per counter.
pub struct LogSink;

impl CounterSink for LogSink {
    fn record(&self, name: &str, value: i64) {
        log::info!("counter {} = {}", name, value);
    }
}

#[derive(Clone)]
pub struct CounterLog {
    inner: Arc<CounterLogInner>,
}

struct CounterLogInner {
    counters: DashMap<String, AtomicI64>,
    sink: Box<dyn CounterSink>,
    last_flush: Mutex<DateTime<Utc>>,
}

impl CounterLog {
    pub fn new(sink: Box<dyn CounterSink>) -> Self {
        Self {
            inner: Arc::new(CounterLogInner {
                counters: DashMap::new(),
                sink,
                last_flush: Mutex::new(Utc::now()),
            }),
        }
    }

    /// Registry that emits snapshots through the process log.
    pub fn with_log_sink() -> Self {
        Self::new(Box::new(LogSink))
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: i64) {
        self.inner
            .counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, name: &str, value: i64) {
        self.inner
            .counters
            .entry(name.to_string())
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.inner
            .counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Zero every counter. Explicit only; nothing resets implicitly.
    pub fn reset(&self) {
        for entry in self.inner.counters.iter() {
            entry.value().store(0, Ordering::Relaxed);
        }
    }

    /// Current values, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut values: Vec<(String, i64)> = self
            .inner
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    /// Emit the current snapshot to the sink and stamp the flush time.
    pub fn flush(&self) {
        for (name, value) in self.snapshot() {
            self.inner.sink.record(&name, value);
        }
        *self.inner.last_flush.lock() = Utc::now();
    }

    pub fn last_flush(&self) -> DateTime<Utc> {
        *self.inner.last_flush.lock()
    }

    /// Spawn a periodic snapshot emitter. Abort the returned handle to stop.
    pub fn spawn_periodic_flush(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let counters = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                counters.flush();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct VecSink(PlMutex<Vec<(String, i64)>>);

    impl CounterSink for VecSink {
        fn record(&self, name: &str, value: i64) {
            self.0.lock().push((name.to_string(), value));
        }
    }

    #[test]
    fn add_and_get() {
        let counters = CounterLog::with_log_sink();
        counters.inc("imported");
        counters.add("imported", 4);
        assert_eq!(counters.get("imported"), 5);
        assert_eq!(counters.get("missing"), 0);
    }

    #[test]
    fn set_overrides() {
        let counters = CounterLog::with_log_sink();
        counters.add("queue_depth", 3);
        counters.set("queue_depth", 42);
        assert_eq!(counters.get("queue_depth"), 42);
    }

    #[test]
    fn reset_zeroes_everything() {
        let counters = CounterLog::with_log_sink();
        counters.add("a", 1);
        counters.add("b", 2);
        counters.reset();
        assert_eq!(counters.get("a"), 0);
        assert_eq!(counters.get("b"), 0);
    }

    #[test]
    fn flush_emits_sorted_snapshot_and_stamps_time() {
        let sink = Arc::new(VecSink(PlMutex::new(Vec::new())));
        struct Fwd(Arc<VecSink>);
        impl CounterSink for Fwd {
            fn record(&self, name: &str, value: i64) {
                self.0.record(name, value);
            }
        }

        let counters = CounterLog::new(Box::new(Fwd(sink.clone())));
        let before = counters.last_flush();
        counters.add("b", 2);
        counters.add("a", 1);
        counters.flush();

        let seen = sink.0.lock().clone();
        assert_eq!(seen, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(counters.last_flush() >= before);
    }
}
