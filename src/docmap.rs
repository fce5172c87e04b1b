//! Persistent external-id to internal-document mapping.
//!
//! The idempotency backbone of the importer: the first successful import of
//! an external id mints an internal document id, and every re-import
//! resolves to that same id forever after. Only `last_seen_version` ever
//! moves on an existing record; the importer never deletes mappings.

use crate::counters::{CounterLog, names};
use crate::error::StoreError;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome of a resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A new mapping was minted for this external id.
    Created(Uuid),
    /// The external id was already mapped; the stored version was bumped
    /// when the incoming one is newer.
    Existing(Uuid),
    /// Control signal, not a failure: the incoming record is older than
    /// the stored version and should be skipped.
    Stale(Uuid),
}

impl Resolution {
    pub fn internal_id(&self) -> Uuid {
        match self {
            Resolution::Created(id) | Resolution::Existing(id) | Resolution::Stale(id) => *id,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Resolution::Stale(_))
    }
}

/// A persisted mapping record.
#[derive(Debug, Clone)]
pub struct MapRecord {
    pub external_id: String,
    pub internal_id: Uuid,
    pub last_seen_version: Option<i64>,
}

/// Backing store contract: a key-value-like persistent store supporting
/// atomic "insert if absent, else fetch" by external id.
pub trait DocStore: Send + Sync {
    /// Insert-if-absent, else fetch. `candidate` becomes the internal id
    /// only when no mapping exists yet; an existing mapping's internal id
    /// is never replaced. Version comparison happens in the same atomic
    /// step: a stored version newer than `version` yields `Stale`.
    fn upsert(
        &self,
        external_id: &str,
        candidate: Uuid,
        version: Option<i64>,
    ) -> impl Future<Output = Result<Resolution, StoreError>> + Send;

    fn fetch(
        &self,
        external_id: &str,
    ) -> impl Future<Output = Result<Option<MapRecord>, StoreError>> + Send;
}

/// Create-or-fetch mapping layer with per-key serialization.
///
/// Concurrent resolves of the same external id are funneled through one
/// keyed lock, so at most one new internal id is ever minted per external
/// id even when the backing store has weak transactional guarantees.
pub struct DocMap<S> {
    store: S,
    locks: DashMap<String, Arc<Mutex<()>>>,
    counters: CounterLog,
}

impl<S: DocStore> DocMap<S> {
    pub fn new(store: S, counters: CounterLog) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            counters,
        }
    }

    /// Create-or-fetch the internal id for `external_id`.
    ///
    /// Idempotent: repeated calls return the same internal id. When
    /// `version` is older than the stored `last_seen_version` the result is
    /// `Resolution::Stale` and nothing is written. Store I/O errors
    /// propagate; the caller decides whether to retry or skip.
    pub async fn resolve(
        &self,
        external_id: &str,
        version: Option<i64>,
    ) -> Result<Resolution, StoreError> {
        let lock = self
            .locks
            .entry(external_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            let candidate = Uuid::new_v4();
            self.store.upsert(external_id, candidate, version).await
        };

        // Keyed locks are transient; drop the entry once nobody waits on it.
        self.locks
            .remove_if(external_id, |_, held| Arc::strong_count(held) <= 2);

        match &result {
            Ok(Resolution::Created(id)) => {
                self.counters.inc(names::MINTED);
                self.counters.inc(names::RESOLVED);
                log::debug!("minted {} for external id '{}'", id, external_id);
            }
            Ok(Resolution::Existing(_)) => self.counters.inc(names::RESOLVED),
            Ok(Resolution::Stale(id)) => {
                log::debug!("stale record for external id '{}' ({})", external_id, id);
            }
            Err(err) => {
                log::warn!("resolution failed for '{}': {}", external_id, err);
            }
        }

        result
    }

    /// Fetch the stored mapping without creating one.
    pub async fn lookup(&self, external_id: &str) -> Result<Option<MapRecord>, StoreError> {
        self.store.fetch(external_id).await
    }
}
