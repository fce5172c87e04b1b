//! Entity import pipeline for GIS document stores.
//!
//! Large external datasets are imported idempotently through four
//! cooperating pieces: a doc map that pins every external id to one
//! internal document id, a size/time-triggered write buffer that batches
//! upserts, a bounded-concurrency task runner that keeps the storage
//! backend from being overrun, and a counter registry observing every
//! stage. `EntityImporter` wires them together over pluggable source and
//! storage collaborators.

pub mod buffer;
pub mod config;
pub mod counters;
pub mod docmap;
pub mod error;
pub mod importer;
pub mod runner;
pub mod store;

pub use buffer::{BatchWriter, BufferEntry, DuplicatePolicy, ItemBuffer};
pub use config::ImportConfig;
pub use counters::{CounterLog, CounterSink, LogSink};
pub use docmap::{DocMap, DocStore, MapRecord, Resolution};
pub use error::{ImportError, StoreError};
pub use importer::{EntityImporter, ExternalRecord, ImportReport, RecordSource, Transform};
pub use runner::{TaskHandle, TaskOutcome, TaskRunner, TaskState};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Initialize env_logger once for binaries and examples.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}
