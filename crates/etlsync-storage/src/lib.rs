//! Source and destination plumbing for etlsync: the read side that runs
//! transformation queries, the write side that upserts and reconciles, and the
//! SQL statements both Postgres implementations share.

use async_trait::async_trait;
use etlsync_core::{CommitMode, KeySet, SyncError, SyncedRecord, TableSchema, Value};

pub mod memory;
pub mod postgres;
pub mod sql;

pub use memory::{MemoryDestination, MemoryTable, StaticSource};
pub use postgres::{connect_pool, PgDestination, PgSource, PoolSettings};

pub const CRATE_NAME: &str = "etlsync-storage";

/// Read-only query capability over the operational database.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Runs `sql` and materializes every row as positional values.
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Vec<Value>>, SyncError>;
}

/// Write side of a job: table creation, batched upserts and orphan deletion.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent `CREATE TABLE IF NOT EXISTS`.
    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), SyncError>;

    async fn begin(&self, mode: CommitMode) -> Result<Box<dyn BatchWriter>, SyncError>;

    /// Deletes every row of `schema.table` whose key is not in `valid_keys`.
    /// An empty `valid_keys` empties the table.
    async fn delete_absent(&self, schema: &TableSchema, valid_keys: &KeySet) -> Result<u64, SyncError>;
}

/// One open batch. Upserts resolve insert-vs-update atomically in the store;
/// `commit` makes a [`CommitMode::Batch`] writer's work visible.
#[async_trait]
pub trait BatchWriter: Send {
    async fn upsert(&mut self, schema: &TableSchema, record: &SyncedRecord) -> Result<(), SyncError>;

    async fn commit(self: Box<Self>) -> Result<(), SyncError>;

    async fn rollback(self: Box<Self>) -> Result<(), SyncError>;
}
