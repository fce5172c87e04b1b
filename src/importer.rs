//! Import orchestrator.
//!
//! Drives a bounded pipeline from a lazily-produced sequence of external
//! records to persisted documents: resolve each record through the doc map,
//! skip stale ones, hand the rest to the buffer via a runner task, then
//! flush and drain so nothing is left behind when the run reports done.
//!
//! Per-record failures are isolated: a transform or storage failure is
//! counted and logged but never aborts the run. Only a source-read failure
//! or an exhausted resolution retry budget does, and even then the counters
//! collected so far stand.

use crate::buffer::{BatchWriter, DuplicatePolicy, ItemBuffer};
use crate::config::ImportConfig;
use crate::counters::{CounterLog, names};
use crate::docmap::{DocMap, DocStore, Resolution};
use crate::error::{ImportError, StoreError};
use crate::runner::TaskRunner;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One record as produced by the upstream data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub external_id: String,
    /// Upstream version or timestamp, used for stale detection.
    pub version: Option<i64>,
    pub fields: Value,
}

/// Lazy record producer. Possibly infinite, possibly remote; the importer
/// pulls one record at a time and never materializes the sequence.
pub trait RecordSource: Send {
    fn next_record(
        &mut self,
    ) -> impl Future<Output = Result<Option<ExternalRecord>, StoreError>> + Send;
}

/// Turns an external record into the document payload to persist.
pub type Transform = Arc<dyn Fn(&ExternalRecord) -> Result<Value, String> + Send + Sync>;

/// Final tally of a run, read off the counter registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub records_read: i64,
    pub resolved: i64,
    pub minted: i64,
    pub skipped_stale: i64,
    pub imported: i64,
    pub flushes: i64,
    pub retries: i64,
    pub dropped: i64,
    pub transform_failed: i64,
    pub backpressure_waits: i64,
    /// False when the drain timeout elapsed first; in-flight tasks settle
    /// asynchronously and keep reporting to the counters.
    pub drained: bool,
}

impl ImportReport {
    fn from_counters(counters: &CounterLog, drained: bool) -> Self {
        Self {
            records_read: counters.get(names::RECORDS_READ),
            resolved: counters.get(names::RESOLVED),
            minted: counters.get(names::MINTED),
            skipped_stale: counters.get(names::SKIPPED_STALE),
            imported: counters.get(names::IMPORTED),
            flushes: counters.get(names::FLUSHES),
            retries: counters.get(names::RETRIES),
            dropped: counters.get(names::DROPPED),
            transform_failed: counters.get(names::TRANSFORM_FAILED),
            backpressure_waits: counters.get(names::BACKPRESSURE_WAITS),
            drained,
        }
    }
}

/// Orchestrator tying doc map, buffer, runner and counters together.
pub struct EntityImporter<S, W>
where
    S: DocStore,
    W: BatchWriter<Value>,
{
    doc_map: Arc<DocMap<S>>,
    buffer: ItemBuffer<Value, W>,
    runner: TaskRunner,
    counters: CounterLog,
    cfg: ImportConfig,
    transform: Transform,
}

impl<S, W> EntityImporter<S, W>
where
    S: DocStore,
    W: BatchWriter<Value>,
{
    /// Assemble the pipeline: a runner and a last-write-wins buffer over
    /// `writer`, plus the given doc map. The returned receiver carries
    /// exhausted-retry flush failures; dropping it is fine, the counters
    /// see those failures either way.
    pub fn new(
        cfg: ImportConfig,
        doc_map: Arc<DocMap<S>>,
        writer: W,
        counters: CounterLog,
    ) -> (Self, mpsc::UnboundedReceiver<ImportError>) {
        let runner = TaskRunner::new(&cfg, counters.clone());
        let (buffer, errors) = ItemBuffer::new(
            &cfg,
            DuplicatePolicy::LastWriteWins,
            writer,
            runner.clone(),
            counters.clone(),
        );
        let importer = Self {
            doc_map,
            buffer,
            runner,
            counters,
            cfg,
            transform: Arc::new(|record: &ExternalRecord| Ok(record.fields.clone())),
        };
        (importer, errors)
    }

    /// Replace the identity transform.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn counters(&self) -> &CounterLog {
        &self.counters
    }

    /// Import every record the source yields. Returns the final tally, or
    /// a run-level error once the source fails or a resolution exhausts
    /// its retry budget. Buffered work is flushed and drained either way.
    pub async fn run<R: RecordSource>(&self, mut source: R) -> Result<ImportReport, ImportError> {
        log::info!("import run started");
        let counter_task = self
            .counters
            .spawn_periodic_flush(self.cfg.counter_flush_interval);

        let outcome = self.pump(&mut source).await;

        // Settle even on abort so partial work lands and the counters
        // reflect what actually happened. Drain first so every accepted
        // record has reached the buffer, then flush the remainder and
        // drain once more to cover the flush task itself.
        let settled = self.runner.drain_timeout(self.cfg.drain_timeout).await;
        self.buffer.flush();
        let drained = settled && self.runner.drain_timeout(self.cfg.drain_timeout).await;

        counter_task.abort();
        self.counters.flush();

        match outcome {
            Ok(()) => {
                let report = ImportReport::from_counters(&self.counters, drained);
                log::info!(
                    "import run complete: {} read, {} imported, {} stale-skipped, {} dropped",
                    report.records_read,
                    report.imported,
                    report.skipped_stale,
                    report.dropped
                );
                Ok(report)
            }
            Err(err) => {
                log::error!("{}", err);
                Err(err)
            }
        }
    }

    /// Stop the background pieces once no further runs are planned.
    pub fn shutdown(&self) {
        self.buffer.close();
        self.runner.shutdown();
    }

    async fn pump<R: RecordSource>(&self, source: &mut R) -> Result<(), ImportError> {
        loop {
            let record = match source.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.counters.inc(names::SOURCE_ERRORS);
                    return Err(ImportError::RunAborted {
                        reason: format!("source read failed: {err}"),
                    });
                }
            };
            self.counters.inc(names::RECORDS_READ);

            // Exhausted resolution retries are a run-level abort, like a
            // source failure; the resolution error becomes the reason.
            let resolution = match self.resolve_with_retries(&record).await {
                Ok(resolution) => resolution,
                Err(err) => {
                    return Err(ImportError::RunAborted {
                        reason: err.to_string(),
                    });
                }
            };
            if resolution.is_stale() {
                self.counters.inc(names::SKIPPED_STALE);
                continue;
            }

            self.submit_record(record, resolution.internal_id()).await;
        }
    }

    async fn resolve_with_retries(
        &self,
        record: &ExternalRecord,
    ) -> Result<Resolution, ImportError> {
        let mut attempts: u32 = 0;
        loop {
            match self
                .doc_map
                .resolve(&record.external_id, record.version)
                .await
            {
                Ok(resolution) => return Ok(resolution),
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.cfg.max_retries {
                        return Err(ImportError::Resolution {
                            external_id: record.external_id.clone(),
                            source: err,
                        });
                    }
                    self.counters.inc(names::RESOLUTION_RETRIES);
                    log::warn!(
                        "resolution attempt {}/{} failed for '{}': {}",
                        attempts,
                        self.cfg.max_retries,
                        record.external_id,
                        err
                    );
                    tokio::time::sleep(self.cfg.retry_backoff * attempts).await;
                }
            }
        }
    }

    /// Submit the transform-and-buffer task, waiting out queue-full
    /// backpressure instead of failing the record.
    async fn submit_record(&self, record: ExternalRecord, internal_id: Uuid) {
        loop {
            let buffer = self.buffer.clone();
            let counters = self.counters.clone();
            let transform = self.transform.clone();
            let task_record = record.clone();
            let label = format!("import:{}", record.external_id);

            let submitted = self.runner.submit(label, async move {
                match (transform)(&task_record) {
                    Ok(payload) => {
                        buffer.add(internal_id, payload);
                        Ok(())
                    }
                    Err(reason) => {
                        counters.inc(names::TRANSFORM_FAILED);
                        Err(format!(
                            "transform failed for '{}': {}",
                            task_record.external_id, reason
                        ))
                    }
                }
            });

            match submitted {
                Ok(_handle) => return,
                // submit only rejects on a saturated queue; slow down and
                // offer the record again.
                Err(_) => {
                    self.counters.inc(names::BACKPRESSURE_WAITS);
                    tokio::time::sleep(self.cfg.retry_backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docmap::MapRecord;
    use crate::store::memory::{MemoryDocStore, MemoryDocWriter};
    use std::collections::VecDeque;
    use std::time::Duration;

    struct VecSource {
        records: VecDeque<ExternalRecord>,
        fail_at_end: bool,
    }

    impl VecSource {
        fn new(records: Vec<ExternalRecord>) -> Self {
            Self {
                records: records.into(),
                fail_at_end: false,
            }
        }
    }

    impl RecordSource for VecSource {
        async fn next_record(&mut self) -> Result<Option<ExternalRecord>, StoreError> {
            match self.records.pop_front() {
                Some(record) => Ok(Some(record)),
                None if self.fail_at_end => Err(StoreError::backend("connection reset")),
                None => Ok(None),
            }
        }
    }

    fn record(id: &str, version: i64) -> ExternalRecord {
        ExternalRecord {
            external_id: id.to_string(),
            version: Some(version),
            fields: serde_json::json!({ "id": id, "v": version }),
        }
    }

    fn test_config() -> ImportConfig {
        let mut cfg = ImportConfig::from_env();
        cfg.concurrency_limit = 4;
        cfg.max_queue_length = 256;
        cfg.max_buffer_size = 10;
        cfg.max_buffer_age = Duration::from_secs(60);
        cfg.max_retries = 3;
        cfg.drain_timeout = Duration::from_secs(10);
        cfg.retry_backoff = Duration::from_millis(10);
        cfg
    }

    fn importer(
        writer: Arc<MemoryDocWriter>,
    ) -> EntityImporter<MemoryDocStore, Arc<MemoryDocWriter>> {
        let counters = CounterLog::with_log_sink();
        let doc_map = Arc::new(DocMap::new(MemoryDocStore::new(), counters.clone()));
        let (importer, _errors) = EntityImporter::new(test_config(), doc_map, writer, counters);
        importer
    }

    #[tokio::test]
    async fn transform_failure_is_isolated() {
        let writer = Arc::new(MemoryDocWriter::new());
        let importer = importer(writer.clone()).with_transform(Arc::new(|record| {
            if record.external_id == "bad" {
                Err("unparseable geometry".to_string())
            } else {
                Ok(record.fields.clone())
            }
        }));

        let source = VecSource::new(vec![record("a", 1), record("bad", 1), record("b", 1)]);
        let report = importer.run(source).await.unwrap();

        assert_eq!(report.records_read, 3);
        assert_eq!(report.transform_failed, 1);
        assert_eq!(report.imported, 2);
        assert_eq!(writer.document_count(), 2);
    }

    struct FailingDocStore;

    impl DocStore for FailingDocStore {
        async fn upsert(
            &self,
            _external_id: &str,
            _candidate: Uuid,
            _version: Option<i64>,
        ) -> Result<Resolution, StoreError> {
            Err(StoreError::backend("doc map offline"))
        }

        async fn fetch(&self, _external_id: &str) -> Result<Option<MapRecord>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn exhausted_resolution_retries_abort_the_run() {
        let counters = CounterLog::with_log_sink();
        let doc_map = Arc::new(DocMap::new(FailingDocStore, counters.clone()));
        let writer = Arc::new(MemoryDocWriter::new());
        let (importer, _errors) =
            EntityImporter::new(test_config(), doc_map, writer.clone(), counters);

        let err = importer
            .run(VecSource::new(vec![record("a", 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::RunAborted { .. }));
        // max_retries = 3: two retried attempts before the third fails out.
        assert_eq!(importer.counters().get(names::RESOLUTION_RETRIES), 2);
        assert_eq!(writer.document_count(), 0);
    }

    #[tokio::test]
    async fn source_failure_aborts_with_partial_counters() {
        let writer = Arc::new(MemoryDocWriter::new());
        let importer = importer(writer.clone());

        let mut source = VecSource::new(vec![record("a", 1), record("b", 1)]);
        source.fail_at_end = true;

        let err = importer.run(source).await.unwrap_err();
        assert!(matches!(err, ImportError::RunAborted { .. }));

        // Partial work still flushed and counted before the abort surfaced.
        assert_eq!(importer.counters().get(names::RECORDS_READ), 2);
        assert_eq!(importer.counters().get(names::SOURCE_ERRORS), 1);
        assert_eq!(writer.document_count(), 2);
    }
}
