//! Bounded-concurrency task scheduler.
//!
//! Work is submitted as futures and dispatched FIFO by a single dispatch
//! loop, never running more than `concurrency_limit` tasks at once.
//! Completion order is whatever the tasks make of it. `drain` waits for a
//! quiescent point: queue empty and nothing running, including tasks
//! submitted while the drain was already in progress.

use crate::config::ImportConfig;
use crate::counters::{CounterLog, names};
use crate::error::ImportError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

/// Result type for submitted task bodies.
pub type TaskResult = Result<(), String>;

type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send>>;

/// A task is in exactly one of these states at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal outcome reported through a task's handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

struct TaskCell {
    state: Mutex<TaskState>,
}

struct QueuedTask {
    id: u64,
    label: String,
    future: TaskFuture,
    cell: Arc<TaskCell>,
    outcome_tx: oneshot::Sender<TaskOutcome>,
}

/// Handle to a submitted task: inspect state, cancel while queued, await
/// the outcome. Dropping the handle detaches the task; it still runs.
pub struct TaskHandle {
    id: u64,
    label: String,
    submitted_at: DateTime<Utc>,
    cell: Arc<TaskCell>,
    outcome_rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn state(&self) -> TaskState {
        *self.cell.state.lock()
    }

    /// Cancel the task if it has not been dispatched yet. Tasks already
    /// running always run to completion. Returns true if the task moved to
    /// the cancelled terminal state.
    pub fn cancel(&self) -> bool {
        let mut state = self.cell.state.lock();
        if *state == TaskState::Queued {
            *state = TaskState::Cancelled;
            true
        } else {
            false
        }
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> TaskOutcome {
        self.outcome_rx
            .await
            .unwrap_or_else(|_| TaskOutcome::Failed("task runner shut down".to_string()))
    }
}

struct RunnerInner {
    queue: Mutex<VecDeque<QueuedTask>>,
    running: AtomicUsize,
    /// Queued + running. Zero means quiescent.
    outstanding: AtomicUsize,
    concurrency_limit: usize,
    max_queue_length: usize,
    dispatch: Notify,
    quiescent: Notify,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    counters: CounterLog,
}

/// Bounded-concurrency scheduler. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    pub fn new(cfg: &ImportConfig, counters: CounterLog) -> Self {
        let inner = Arc::new(RunnerInner {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            concurrency_limit: cfg.concurrency_limit.max(1),
            max_queue_length: cfg.max_queue_length.max(1),
            dispatch: Notify::new(),
            quiescent: Notify::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters,
        });

        tokio::spawn(dispatch_loop(inner.clone()));

        Self { inner }
    }

    /// Enqueue a unit of work. Never blocks: the task is appended to the
    /// internal queue and picked up by the dispatch loop. Fails with
    /// `QueueFull` when the queue is at `max_queue_length`.
    pub fn submit<F>(&self, label: impl Into<String>, future: F) -> Result<TaskHandle, ImportError>
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let label = label.into();
        let cell = Arc::new(TaskCell {
            state: Mutex::new(TaskState::Queued),
        });
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.max_queue_length {
                self.inner.counters.inc(names::QUEUE_FULL);
                return Err(ImportError::QueueFull {
                    queued: queue.len(),
                    limit: self.inner.max_queue_length,
                });
            }
            // Counted while still holding the queue lock: the task must
            // never be visible to the dispatch loop before it is counted,
            // or its completion could decrement first.
            self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
            queue.push_back(QueuedTask {
                id,
                label: label.clone(),
                future: Box::pin(future),
                cell: cell.clone(),
                outcome_tx,
            });
        }

        self.inner.counters.inc(names::TASKS_SUBMITTED);
        self.inner.dispatch.notify_one();

        Ok(TaskHandle {
            id,
            label,
            submitted_at: Utc::now(),
            cell,
            outcome_rx,
        })
    }

    /// Number of tasks currently queued or running.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Wait until the queue is empty and no task is running. Tasks
    /// submitted while waiting are also awaited; this observes a quiescent
    /// point, not a snapshot.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.quiescent.notified();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// `drain` with a deadline. Returns false when the timeout elapsed
    /// first; in-flight tasks keep running and reporting to the counters.
    pub async fn drain_timeout(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.drain()).await.is_ok() {
            true
        } else {
            self.inner.counters.inc(names::DRAIN_TIMEOUTS);
            log::warn!(
                "drain timed out after {:?} with {} tasks outstanding",
                timeout,
                self.outstanding()
            );
            false
        }
    }

    /// Stop the dispatch loop once the queue empties. Running tasks finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.dispatch.notify_one();
    }
}

fn finish_one(inner: &Arc<RunnerInner>) {
    if inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
        inner.quiescent.notify_waiters();
    }
}

async fn dispatch_loop(inner: Arc<RunnerInner>) {
    loop {
        while inner.running.load(Ordering::Acquire) < inner.concurrency_limit {
            let task = { inner.queue.lock().pop_front() };
            let Some(task) = task else { break };

            let QueuedTask {
                id,
                label,
                future,
                cell,
                outcome_tx,
            } = task;

            {
                let mut state = cell.state.lock();
                if *state == TaskState::Cancelled {
                    drop(state);
                    let _ = outcome_tx.send(TaskOutcome::Cancelled);
                    inner.counters.inc(names::TASKS_CANCELLED);
                    log::debug!("task {} '{}' cancelled before dispatch", id, label);
                    finish_one(&inner);
                    continue;
                }
                *state = TaskState::Running;
            }

            inner.running.fetch_add(1, Ordering::AcqRel);
            let inner_task = inner.clone();
            tokio::spawn(async move {
                let result = future.await;
                let outcome = match result {
                    Ok(()) => {
                        *cell.state.lock() = TaskState::Succeeded;
                        inner_task.counters.inc(names::TASKS_SUCCEEDED);
                        TaskOutcome::Succeeded
                    }
                    Err(reason) => {
                        *cell.state.lock() = TaskState::Failed;
                        inner_task.counters.inc(names::TASKS_FAILED);
                        log::warn!("task {} '{}' failed: {}", id, label, reason);
                        TaskOutcome::Failed(reason)
                    }
                };
                let _ = outcome_tx.send(outcome);
                inner_task.running.fetch_sub(1, Ordering::AcqRel);
                finish_one(&inner_task);
                inner_task.dispatch.notify_one();
            });
        }

        if inner.shutdown.load(Ordering::Acquire) && inner.queue.lock().is_empty() {
            break;
        }

        inner.dispatch.notified().await;
    }
}
