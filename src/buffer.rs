//! Accumulation buffer for bulk document writes.
//!
//! `add` is synchronous and never touches I/O. Entries pile up until the
//! buffer reaches `max_buffer_size`, the oldest unflushed entry exceeds
//! `max_buffer_age`, or `flush` is called; the actual write then runs as a
//! TaskRunner task so callers are never blocked behind the storage backend.
//! At most one flush per buffer is in flight at a time; entries added while
//! a flush runs accumulate into the next batch.

use crate::config::ImportConfig;
use crate::counters::{CounterLog, names};
use crate::error::{ImportError, StoreError};
use crate::runner::TaskRunner;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Storage collaborator: persists one batch of entries as a bulk operation.
///
/// A failed call fails the whole batch; the buffer owns retry handling.
pub trait BatchWriter<P>: Send + Sync + 'static {
    fn write_batch(
        &self,
        batch: &[BufferEntry<P>],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<P, W> BatchWriter<P> for Arc<W>
where
    W: BatchWriter<P>,
{
    fn write_batch(
        &self,
        batch: &[BufferEntry<P>],
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        W::write_batch(self, batch)
    }
}

/// A (key, payload) pair awaiting flush.
#[derive(Debug, Clone)]
pub struct BufferEntry<P> {
    pub key: Uuid,
    pub payload: P,
}

/// What happens when the same key is added twice within one buffering
/// window. The choice is observable, so it is explicit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// A later `add` replaces the pending payload in place, keeping the
    /// first arrival's position in the batch.
    LastWriteWins,
    /// Every entry is kept in arrival order.
    PreserveAll,
}

struct BufferState<P> {
    entries: Vec<BufferEntry<P>>,
    index: HashMap<Uuid, usize>,
    oldest_since: Option<Instant>,
}

struct BufferInner<P, W> {
    state: Mutex<BufferState<P>>,
    policy: DuplicatePolicy,
    writer: W,
    runner: TaskRunner,
    counters: CounterLog,
    max_size: usize,
    max_age: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    flush_in_flight: AtomicBool,
    /// A trigger arrived while a flush was in flight; re-trigger after.
    flush_pending: AtomicBool,
    /// A flush-everything request (manual or age) folded into the current
    /// flush; drains partial batches, unlike size triggers.
    manual_pending: AtomicBool,
    flush_seq: AtomicU64,
    errors_tx: mpsc::UnboundedSender<ImportError>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Size/time-triggered write buffer. Cheap to clone; clones share state.
pub struct ItemBuffer<P, W> {
    inner: Arc<BufferInner<P, W>>,
}

impl<P, W> Clone for ItemBuffer<P, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, W> ItemBuffer<P, W>
where
    P: Send + Sync + 'static,
    W: BatchWriter<P>,
{
    /// Build a buffer that flushes through `runner` into `writer`. The
    /// returned receiver carries exhausted-retry flush failures.
    pub fn new(
        cfg: &ImportConfig,
        policy: DuplicatePolicy,
        writer: W,
        runner: TaskRunner,
        counters: CounterLog,
    ) -> (Self, mpsc::UnboundedReceiver<ImportError>) {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BufferInner {
            state: Mutex::new(BufferState {
                entries: Vec::new(),
                index: HashMap::new(),
                oldest_since: None,
            }),
            policy,
            writer,
            runner,
            counters,
            max_size: cfg.max_buffer_size.max(1),
            max_age: cfg.max_buffer_age,
            max_retries: cfg.max_retries.max(1),
            retry_backoff: cfg.retry_backoff,
            flush_in_flight: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
            manual_pending: AtomicBool::new(false),
            flush_seq: AtomicU64::new(0),
            errors_tx,
            ticker: Mutex::new(None),
        });

        let handle = spawn_age_ticker(&inner);
        *inner.ticker.lock() = Some(handle);

        (Self { inner }, errors_rx)
    }

    /// Append an entry. Synchronous, O(1) amortized, no I/O. Triggers a
    /// flush when the buffer reaches its size threshold.
    pub fn add(&self, key: Uuid, payload: P) {
        let should_flush = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            match self.inner.policy {
                DuplicatePolicy::LastWriteWins => {
                    if let Some(&at) = st.index.get(&key) {
                        st.entries[at].payload = payload;
                    } else {
                        st.index.insert(key, st.entries.len());
                        st.entries.push(BufferEntry { key, payload });
                    }
                }
                DuplicatePolicy::PreserveAll => {
                    st.entries.push(BufferEntry { key, payload });
                }
            }
            if st.oldest_since.is_none() {
                st.oldest_since = Some(Instant::now());
            }
            st.entries.len() >= self.inner.max_size
        };

        if should_flush {
            trigger_flush(&self.inner, false);
        }
    }

    /// Request a flush of everything currently buffered. If a flush is
    /// already in flight the request folds into the next batch.
    pub fn flush(&self) {
        trigger_flush(&self.inner, true);
    }

    /// Entries currently awaiting flush.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the age timer. Buffered entries stay until a manual flush.
    pub fn close(&self) {
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }
    }
}

fn trigger_flush<P, W>(inner: &Arc<BufferInner<P, W>>, drain_all: bool)
where
    P: Send + Sync + 'static,
    W: BatchWriter<P>,
{
    if inner
        .flush_in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        if drain_all {
            inner.manual_pending.store(true, Ordering::Release);
        }
        inner.flush_pending.store(true, Ordering::Release);
        return;
    }

    if inner.state.lock().entries.is_empty() {
        inner.flush_in_flight.store(false, Ordering::Release);
        return;
    }

    let seq = inner.flush_seq.fetch_add(1, Ordering::Relaxed);
    let task_inner = inner.clone();
    match inner
        .runner
        .submit(format!("flush-{seq}"), run_flush(task_inner, drain_all))
    {
        Ok(_) => {}
        Err(err) => {
            // Queue saturated: leave the entries buffered. The age timer
            // retriggers once the runner has room again.
            inner.flush_in_flight.store(false, Ordering::Release);
            if drain_all {
                inner.manual_pending.store(true, Ordering::Release);
            }
            inner.flush_pending.store(true, Ordering::Release);
            log::warn!("could not schedule flush: {}", err);
        }
    }
}

async fn run_flush<P, W>(inner: Arc<BufferInner<P, W>>, drain_all: bool) -> Result<(), String>
where
    P: Send + Sync + 'static,
    W: BatchWriter<P>,
{
    let mut dropped: Option<String> = None;

    loop {
        // One batch per iteration, capped at max_size so batch counts stay
        // predictable even when entries pile up during a slow write. Size
        // triggers only ever produce full batches; a manual or age request
        // (`drain_all` / `manual_pending`) also takes the final partial one.
        let batch = {
            let mut guard = inner.state.lock();
            let st = &mut *guard;
            let len = st.entries.len();
            let take = if len >= inner.max_size {
                inner.max_size
            } else if len > 0
                && (drain_all || inner.manual_pending.swap(false, Ordering::AcqRel))
            {
                len
            } else {
                0
            };
            if take == 0 {
                if len == 0 {
                    inner.manual_pending.store(false, Ordering::Release);
                }
                break;
            }
            let batch: Vec<BufferEntry<P>> = st.entries.drain(..take).collect();
            st.index.clear();
            for (at, entry) in st.entries.iter().enumerate() {
                st.index.insert(entry.key, at);
            }
            st.oldest_since = if st.entries.is_empty() {
                None
            } else {
                Some(Instant::now())
            };
            batch
        };

        let mut attempts: u32 = 0;
        loop {
            match inner.writer.write_batch(&batch).await {
                Ok(()) => {
                    inner.counters.inc(names::FLUSHES);
                    inner.counters.add(names::IMPORTED, batch.len() as i64);
                    log::debug!("flushed {} entries", batch.len());
                    break;
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= inner.max_retries {
                        let reason = err.to_string();
                        inner.counters.add(names::DROPPED, batch.len() as i64);
                        log::error!(
                            "dropping batch of {} entries after {} attempts: {}",
                            batch.len(),
                            attempts,
                            reason
                        );
                        let _ = inner.errors_tx.send(ImportError::Flush {
                            attempts,
                            entries: batch.len(),
                            reason: reason.clone(),
                        });
                        dropped = Some(reason);
                        break;
                    }
                    inner.counters.inc(names::RETRIES);
                    let backoff = retry_backoff(inner.retry_backoff, attempts);
                    log::warn!(
                        "batch write failed (attempt {}/{}), retrying in {:?}: {}",
                        attempts,
                        inner.max_retries,
                        backoff,
                        err
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    inner.flush_in_flight.store(false, Ordering::Release);
    if inner.flush_pending.swap(false, Ordering::AcqRel) {
        trigger_flush(&inner, false);
    }

    match dropped {
        None => Ok(()),
        Some(reason) => Err(format!("batch dropped: {reason}")),
    }
}

fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let jitter_ceiling = (base.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
    base * attempt + Duration::from_millis(jitter)
}

fn spawn_age_ticker<P, W>(inner: &Arc<BufferInner<P, W>>) -> tokio::task::JoinHandle<()>
where
    P: Send + Sync + 'static,
    W: BatchWriter<P>,
{
    let weak = Arc::downgrade(inner);
    let max_age = inner.max_age;
    let tick = (max_age / 4).max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tick).await;
            let Some(inner) = weak.upgrade() else { break };
            let due = inner
                .state
                .lock()
                .oldest_since
                .is_some_and(|since| since.elapsed() >= max_age);
            if due {
                trigger_flush(&inner, true);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct MemWriter {
        batches: Mutex<Vec<Vec<(Uuid, i64)>>>,
        fail_first: AtomicU32,
    }

    impl MemWriter {
        fn failing(times: u32) -> Arc<Self> {
            let writer = Self::default();
            writer.fail_first.store(times, Ordering::SeqCst);
            Arc::new(writer)
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().iter().map(|b| b.len()).collect()
        }
    }

    impl BatchWriter<i64> for MemWriter {
        async fn write_batch(&self, batch: &[BufferEntry<i64>]) -> Result<(), StoreError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::backend("simulated write failure"));
            }
            self.batches
                .lock()
                .push(batch.iter().map(|e| (e.key, e.payload)).collect());
            Ok(())
        }
    }

    fn test_config(max_size: usize, max_age: Duration, max_retries: u32) -> ImportConfig {
        let mut cfg = ImportConfig::from_env();
        cfg.concurrency_limit = 2;
        cfg.max_queue_length = 64;
        cfg.max_buffer_size = max_size;
        cfg.max_buffer_age = max_age;
        cfg.max_retries = max_retries;
        cfg.retry_backoff = Duration::from_millis(10);
        cfg
    }

    fn setup(
        cfg: &ImportConfig,
        policy: DuplicatePolicy,
        writer: Arc<MemWriter>,
    ) -> (
        ItemBuffer<i64, Arc<MemWriter>>,
        mpsc::UnboundedReceiver<ImportError>,
        TaskRunner,
        CounterLog,
    ) {
        let counters = CounterLog::with_log_sink();
        let runner = TaskRunner::new(cfg, counters.clone());
        let (buffer, errors) =
            ItemBuffer::new(cfg, policy, writer, runner.clone(), counters.clone());
        (buffer, errors, runner, counters)
    }

    #[tokio::test]
    async fn no_flush_below_thresholds() {
        let cfg = test_config(10, Duration::from_secs(60), 3);
        let writer = Arc::new(MemWriter::default());
        let (buffer, _errors, runner, _) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        for i in 0..5 {
            buffer.add(Uuid::new_v4(), i);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.drain().await;

        assert!(writer.batches.lock().is_empty());
        assert_eq!(buffer.len(), 5);
    }

    #[tokio::test]
    async fn size_threshold_triggers_flush() {
        let cfg = test_config(3, Duration::from_secs(60), 3);
        let writer = Arc::new(MemWriter::default());
        let (buffer, _errors, runner, counters) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        for i in 0..3 {
            buffer.add(Uuid::new_v4(), i);
        }
        runner.drain().await;

        assert_eq!(writer.batch_sizes(), vec![3]);
        assert_eq!(counters.get(names::IMPORTED), 3);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn manual_flush_writes_partial_batch() {
        let cfg = test_config(100, Duration::from_secs(60), 3);
        let writer = Arc::new(MemWriter::default());
        let (buffer, _errors, runner, _) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        buffer.add(Uuid::new_v4(), 1);
        buffer.add(Uuid::new_v4(), 2);
        buffer.flush();
        runner.drain().await;

        assert_eq!(writer.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn age_threshold_triggers_flush() {
        let cfg = test_config(100, Duration::from_millis(80), 3);
        let writer = Arc::new(MemWriter::default());
        let (buffer, _errors, runner, _) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        buffer.add(Uuid::new_v4(), 7);
        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.drain().await;

        assert_eq!(writer.batch_sizes(), vec![1]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn last_write_wins_coalesces_same_key() {
        let cfg = test_config(100, Duration::from_secs(60), 3);
        let writer = Arc::new(MemWriter::default());
        let (buffer, _errors, runner, _) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        let key = Uuid::new_v4();
        let other = Uuid::new_v4();
        buffer.add(key, 1);
        buffer.add(other, 2);
        buffer.add(key, 3);
        buffer.flush();
        runner.drain().await;

        let batches = writer.batches.lock();
        assert_eq!(batches.len(), 1);
        // Coalesced in place: first arrival's position, last write's payload.
        assert_eq!(batches[0], vec![(key, 3), (other, 2)]);
    }

    #[tokio::test]
    async fn preserve_all_keeps_duplicates_in_arrival_order() {
        let cfg = test_config(100, Duration::from_secs(60), 3);
        let writer = Arc::new(MemWriter::default());
        let (buffer, _errors, runner, _) =
            setup(&cfg, DuplicatePolicy::PreserveAll, writer.clone());

        let key = Uuid::new_v4();
        buffer.add(key, 1);
        buffer.add(key, 3);
        buffer.flush();
        runner.drain().await;

        let batches = writer.batches.lock();
        assert_eq!(batches[0], vec![(key, 1), (key, 3)]);
    }

    #[tokio::test]
    async fn failed_batch_retries_then_succeeds() {
        let cfg = test_config(2, Duration::from_secs(60), 3);
        let writer = MemWriter::failing(2);
        let (buffer, mut errors, runner, counters) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        buffer.add(Uuid::new_v4(), 1);
        buffer.add(Uuid::new_v4(), 2);
        runner.drain().await;

        assert_eq!(writer.batch_sizes(), vec![2]);
        assert_eq!(counters.get(names::RETRIES), 2);
        assert_eq!(counters.get(names::IMPORTED), 2);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhausted_retries_drop_batch_and_report() {
        let cfg = test_config(2, Duration::from_secs(60), 2);
        let writer = MemWriter::failing(10);
        let (buffer, mut errors, runner, counters) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        buffer.add(Uuid::new_v4(), 1);
        buffer.add(Uuid::new_v4(), 2);
        runner.drain().await;

        assert!(writer.batches.lock().is_empty());
        assert_eq!(counters.get(names::DROPPED), 2);
        match errors.try_recv() {
            Ok(ImportError::Flush { attempts, entries, .. }) => {
                assert_eq!(attempts, 2);
                assert_eq!(entries, 2);
            }
            other => panic!("expected flush error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn entries_added_during_flush_go_to_next_batch() {
        let mut cfg = test_config(2, Duration::from_secs(60), 3);
        cfg.retry_backoff = Duration::from_millis(100);
        let writer = MemWriter::failing(1); // first attempt stalls into a retry window
        let (buffer, _errors, runner, _) =
            setup(&cfg, DuplicatePolicy::LastWriteWins, writer.clone());

        buffer.add(Uuid::new_v4(), 1);
        buffer.add(Uuid::new_v4(), 2);
        // Let the flush task take its batch and enter the retry backoff,
        // then land another entry mid-retry.
        tokio::time::sleep(Duration::from_millis(30)).await;
        buffer.add(Uuid::new_v4(), 3);
        buffer.flush();
        runner.drain().await;

        let sizes = writer.batch_sizes();
        assert_eq!(sizes.iter().sum::<usize>(), 3);
        assert_eq!(sizes[0], 2);
    }
}
