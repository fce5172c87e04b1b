//! Backing-store implementations for the doc map and the storage backend.
//!
//! `memory` backs tests and zero-infrastructure runs; `postgres` is the
//! production pair (doc map table + documents table, bulk-written with
//! UNNEST).

pub mod memory;
pub mod postgres;

pub use memory::{MemoryDocStore, MemoryDocWriter};
pub use postgres::{PgDocStore, PgDocWriter, run_migrations};
