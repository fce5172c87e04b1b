//! In-memory collaborators: DashMap-backed doc store and document writer.

use crate::buffer::{BatchWriter, BufferEntry};
use crate::docmap::{DocStore, MapRecord, Resolution};
use crate::error::StoreError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

struct StoredMapping {
    internal_id: Uuid,
    last_seen_version: Option<i64>,
}

/// DashMap-backed doc map store. The entry API gives the same atomic
/// insert-if-absent guarantee the Postgres upsert provides.
#[derive(Default)]
pub struct MemoryDocStore {
    records: DashMap<String, StoredMapping>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mappings created so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl DocStore for MemoryDocStore {
    async fn upsert(
        &self,
        external_id: &str,
        candidate: Uuid,
        version: Option<i64>,
    ) -> Result<Resolution, StoreError> {
        match self.records.entry(external_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if let (Some(stored), Some(incoming)) = (record.last_seen_version, version) {
                    if stored > incoming {
                        return Ok(Resolution::Stale(record.internal_id));
                    }
                }
                if version.is_some() {
                    record.last_seen_version = version;
                }
                Ok(Resolution::Existing(record.internal_id))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredMapping {
                    internal_id: candidate,
                    last_seen_version: version,
                });
                Ok(Resolution::Created(candidate))
            }
        }
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<MapRecord>, StoreError> {
        Ok(self.records.get(external_id).map(|record| MapRecord {
            external_id: external_id.to_string(),
            internal_id: record.internal_id,
            last_seen_version: record.last_seen_version,
        }))
    }
}

/// In-memory storage backend: upserts documents into a DashMap and counts
/// the batches it accepted.
#[derive(Default)]
pub struct MemoryDocWriter {
    documents: DashMap<Uuid, Value>,
    batches: AtomicUsize,
}

impl MemoryDocWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: Uuid) -> Option<Value> {
        self.documents.get(&id).map(|doc| doc.clone())
    }
}

impl BatchWriter<Value> for MemoryDocWriter {
    async fn write_batch(&self, batch: &[BufferEntry<Value>]) -> Result<(), StoreError> {
        for entry in batch {
            self.documents.insert(entry.key, entry.payload.clone());
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_keeps_first_internal_id() {
        let store = MemoryDocStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let created = store.upsert("a", first, Some(1)).await.unwrap();
        let existing = store.upsert("a", second, Some(2)).await.unwrap();

        assert_eq!(created, Resolution::Created(first));
        assert_eq!(existing, Resolution::Existing(first));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn writer_upserts_by_key() {
        let writer = MemoryDocWriter::new();
        let id = Uuid::new_v4();

        writer
            .write_batch(&[BufferEntry {
                key: id,
                payload: serde_json::json!({"rev": 1}),
            }])
            .await
            .unwrap();
        writer
            .write_batch(&[BufferEntry {
                key: id,
                payload: serde_json::json!({"rev": 2}),
            }])
            .await
            .unwrap();

        assert_eq!(writer.document_count(), 1);
        assert_eq!(writer.batch_count(), 2);
        assert_eq!(writer.get(id), Some(serde_json::json!({"rev": 2})));
    }
}
