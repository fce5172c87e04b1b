//! PostgreSQL collaborators.
//!
//! The doc map rides on a single upsert with `ON CONFLICT .. RETURNING`:
//! insert-if-absent, never touching `internal_id` on conflict, bumping
//! `last_seen_version` monotonically via GREATEST. Documents are written in
//! bulk through UNNEST so a whole batch is one round trip.

use crate::buffer::{BatchWriter, BufferEntry};
use crate::docmap::{DocStore, MapRecord, Resolution};
use crate::error::StoreError;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run database migrations. Idempotent; already-applied migrations are
/// skipped via SQLx's tracking table.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}

/// Doc map backed by the `doc_map` table.
pub struct PgDocStore {
    pool: PgPool,
}

impl PgDocStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DocStore for PgDocStore {
    async fn upsert(
        &self,
        external_id: &str,
        candidate: Uuid,
        version: Option<i64>,
    ) -> Result<Resolution, StoreError> {
        // The conflict arm never assigns internal_id, so the returned id
        // equals `candidate` exactly when this call created the mapping.
        let (internal_id, last_seen): (Uuid, Option<i64>) = sqlx::query_as(
            r#"INSERT INTO doc_map (external_id, internal_id, last_seen_version)
               VALUES ($1, $2, $3)
               ON CONFLICT (external_id) DO UPDATE
               SET last_seen_version =
                       GREATEST(doc_map.last_seen_version, EXCLUDED.last_seen_version),
                   updated_at = NOW()
               RETURNING internal_id, last_seen_version"#,
        )
        .bind(external_id)
        .bind(candidate)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;

        if internal_id == candidate {
            return Ok(Resolution::Created(internal_id));
        }
        match (last_seen, version) {
            (Some(stored), Some(incoming)) if stored > incoming => {
                Ok(Resolution::Stale(internal_id))
            }
            _ => Ok(Resolution::Existing(internal_id)),
        }
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<MapRecord>, StoreError> {
        let row: Option<(Uuid, Option<i64>)> = sqlx::query_as(
            "SELECT internal_id, last_seen_version FROM doc_map WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(internal_id, last_seen_version)| MapRecord {
            external_id: external_id.to_string(),
            internal_id,
            last_seen_version,
        }))
    }
}

/// Storage backend writing document payloads to the `documents` table.
///
/// Batches must not repeat a key; the buffer's `LastWriteWins` policy
/// guarantees that. A `PreserveAll` buffer pointed at this writer would
/// trip Postgres's one-row-per-conflict rule.
pub struct PgDocWriter {
    pool: PgPool,
}

impl PgDocWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl BatchWriter<Value> for PgDocWriter {
    async fn write_batch(&self, batch: &[BufferEntry<Value>]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut payloads = Vec::with_capacity(batch.len());
        for entry in batch {
            ids.push(entry.key);
            payloads.push(entry.payload.clone());
        }

        sqlx::query(
            r#"INSERT INTO documents (id, payload)
               SELECT * FROM UNNEST($1::uuid[], $2::jsonb[])
               ON CONFLICT (id) DO UPDATE
               SET payload = EXCLUDED.payload, updated_at = NOW()"#,
        )
        .bind(&ids)
        .bind(&payloads)
        .execute(&self.pool)
        .await?;

        log::trace!("wrote batch of {} documents", batch.len());
        Ok(())
    }
}
