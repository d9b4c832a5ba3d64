//! In-process source and destination used for dry runs and tests.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use etlsync_core::{CommitMode, Key, KeySet, SyncError, SyncedRecord, TableSchema, Value};
use tokio::sync::Mutex;

use crate::{BatchWriter, Destination, Source};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    rows: BTreeMap<Key, Vec<Value>>,
}

impl MemoryTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.rows.keys().cloned().collect()
    }

    pub fn row(&self, key: &Key) -> Option<&Vec<Value>> {
        self.rows.get(key)
    }

    fn apply_upsert(&mut self, schema: &TableSchema, key: Key, record: &SyncedRecord) {
        match self.rows.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(record.values.clone());
            }
            Entry::Occupied(mut slot) => {
                let row = slot.get_mut();
                for idx in schema.refreshable_indices() {
                    if let (Some(cell), Some(value)) = (row.get_mut(idx), record.values.get(idx)) {
                        *cell = value.clone();
                    }
                }
            }
        }
    }
}

fn missing_table(destination: &str, table: &str) -> SyncError {
    SyncError::Query {
        target: destination.to_string(),
        message: format!("relation \"{table}\" does not exist"),
    }
}

/// Destination holding tables in memory. Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    name: String,
    tables: Arc<Mutex<BTreeMap<String, MemoryTable>>>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Snapshot of a table, `None` if it was never ensured.
    pub async fn table(&self, table: &str) -> Option<MemoryTable> {
        self.tables.lock().await.get(table).cloned()
    }

    pub async fn keys(&self, table: &str) -> Vec<Key> {
        self.table(table).await.map(|t| t.keys()).unwrap_or_default()
    }

    pub async fn row(&self, table: &str, key: &Key) -> Option<Vec<Value>> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|t| t.row(key).cloned())
    }

    pub async fn len(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, MemoryTable::len)
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), SyncError> {
        schema.validate()?;
        self.tables
            .lock()
            .await
            .entry(schema.table.clone())
            .or_default();
        Ok(())
    }

    async fn begin(&self, mode: CommitMode) -> Result<Box<dyn BatchWriter>, SyncError> {
        Ok(Box::new(MemoryBatchWriter {
            name: self.name.clone(),
            mode,
            tables: Arc::clone(&self.tables),
            staged: BTreeMap::new(),
        }))
    }

    async fn delete_absent(&self, schema: &TableSchema, valid_keys: &KeySet) -> Result<u64, SyncError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(&schema.table)
            .ok_or_else(|| missing_table(&self.name, &schema.table))?;
        let before = table.rows.len();
        table.rows.retain(|key, _| valid_keys.contains(key));
        Ok((before - table.rows.len()) as u64)
    }
}

/// Per-row writers write straight through; batch writers stage copies of the
/// touched tables and swap them in on commit.
struct MemoryBatchWriter {
    name: String,
    mode: CommitMode,
    tables: Arc<Mutex<BTreeMap<String, MemoryTable>>>,
    staged: BTreeMap<String, MemoryTable>,
}

#[async_trait]
impl BatchWriter for MemoryBatchWriter {
    async fn upsert(&mut self, schema: &TableSchema, record: &SyncedRecord) -> Result<(), SyncError> {
        let key = record.check_writable(schema)?;
        match self.mode {
            CommitMode::PerRow => {
                let mut tables = self.tables.lock().await;
                let table = tables
                    .get_mut(&schema.table)
                    .ok_or_else(|| missing_table(&self.name, &schema.table))?;
                table.apply_upsert(schema, key, record);
            }
            CommitMode::Batch => {
                if !self.staged.contains_key(&schema.table) {
                    let snapshot = self
                        .tables
                        .lock()
                        .await
                        .get(&schema.table)
                        .cloned()
                        .ok_or_else(|| missing_table(&self.name, &schema.table))?;
                    self.staged.insert(schema.table.clone(), snapshot);
                }
                if let Some(table) = self.staged.get_mut(&schema.table) {
                    table.apply_upsert(schema, key, record);
                }
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let this = *self;
        if this.staged.is_empty() {
            return Ok(());
        }
        let mut tables = this.tables.lock().await;
        for (name, table) in this.staged {
            tables.insert(name, table);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Source answering each query with canned rows.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    name: String,
    results: HashMap<String, Vec<Vec<Value>>>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: HashMap::new(),
        }
    }

    pub fn with_result(mut self, sql: impl Into<String>, rows: Vec<Vec<Value>>) -> Self {
        self.set_result(sql, rows);
        self
    }

    pub fn set_result(&mut self, sql: impl Into<String>, rows: Vec<Vec<Value>>) {
        self.results.insert(sql.into(), rows);
    }
}

#[async_trait]
impl Source for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Vec<Value>>, SyncError> {
        self.results
            .get(sql)
            .cloned()
            .ok_or_else(|| SyncError::Query {
                target: self.name.clone(),
                message: "no result registered for query".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etlsync_core::{ColumnSpec, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(
            "topics",
            "topic_node_id",
            vec![
                ColumnSpec::new("topic_node_id", ColumnType::BigInt).not_null(),
                ColumnSpec::new("topic_id", ColumnType::BigInt),
                ColumnSpec::new("topic_name", ColumnType::Varchar(128)),
            ],
        )
        .refreshable(["topic_name"])
    }

    fn row(key: i64, topic_id: i64, name: &str) -> SyncedRecord {
        SyncedRecord::new(vec![key.into(), topic_id.into(), name.into()])
    }

    async fn write(dest: &MemoryDestination, mode: CommitMode, rows: &[SyncedRecord]) {
        let mut writer = dest.begin(mode).await.unwrap();
        for record in rows {
            writer.upsert(&schema(), record).await.unwrap();
        }
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_refreshes_only_refreshable_columns() {
        let dest = MemoryDestination::default();
        dest.ensure_table(&schema()).await.unwrap();
        write(&dest, CommitMode::Batch, &[row(1, 10, "Arrays")]).await;
        write(&dest, CommitMode::Batch, &[row(1, 99, "Arrays II")]).await;

        let stored = dest.row("topics", &Key::Int(1)).await.unwrap();
        assert_eq!(stored[1], Value::Int(10));
        assert_eq!(stored[2], Value::Text("Arrays II".into()));
    }

    #[tokio::test]
    async fn repeated_batches_are_idempotent() {
        let dest = MemoryDestination::default();
        dest.ensure_table(&schema()).await.unwrap();
        let batch = [row(1, 10, "a"), row(2, 20, "b")];
        write(&dest, CommitMode::Batch, &batch).await;
        let first = dest.table("topics").await.unwrap();
        write(&dest, CommitMode::Batch, &batch).await;
        assert_eq!(dest.table("topics").await.unwrap(), first);
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_last_write_wins() {
        let dest = MemoryDestination::default();
        dest.ensure_table(&schema()).await.unwrap();
        write(&dest, CommitMode::PerRow, &[row(5, 1, "first"), row(5, 2, "second")]).await;

        let stored = dest.row("topics", &Key::Int(5)).await.unwrap();
        assert_eq!(stored, vec![Value::Int(5), Value::Int(1), Value::Text("second".into())]);
        assert_eq!(dest.len("topics").await, 1);
    }

    #[tokio::test]
    async fn uncommitted_batch_is_invisible() {
        let dest = MemoryDestination::default();
        dest.ensure_table(&schema()).await.unwrap();
        let mut writer = dest.begin(CommitMode::Batch).await.unwrap();
        writer.upsert(&schema(), &row(1, 1, "x")).await.unwrap();
        assert_eq!(dest.len("topics").await, 0);
        writer.rollback().await.unwrap();
        assert_eq!(dest.len("topics").await, 0);
    }

    #[tokio::test]
    async fn writing_to_unknown_table_fails() {
        let dest = MemoryDestination::default();
        let mut writer = dest.begin(CommitMode::PerRow).await.unwrap();
        let err = writer.upsert(&schema(), &row(1, 1, "x")).await.unwrap_err();
        assert!(matches!(err, SyncError::Query { .. }));
    }

    #[tokio::test]
    async fn delete_absent_keeps_only_valid_keys() {
        let dest = MemoryDestination::default();
        dest.ensure_table(&schema()).await.unwrap();
        write(&dest, CommitMode::Batch, &[row(1, 1, "a"), row(2, 2, "b"), row(3, 3, "c")]).await;

        let valid: KeySet = [2, 3, 4].into_iter().map(Key::Int).collect();
        let removed = dest.delete_absent(&schema(), &valid).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dest.keys("topics").await, vec![Key::Int(2), Key::Int(3)]);
    }

    #[tokio::test]
    async fn delete_absent_with_empty_set_clears_table() {
        let dest = MemoryDestination::default();
        dest.ensure_table(&schema()).await.unwrap();
        write(&dest, CommitMode::Batch, &[row(1, 1, "a"), row(2, 2, "b")]).await;

        let removed = dest.delete_absent(&schema(), &KeySet::new()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(dest.len("topics").await, 0);
    }

    #[tokio::test]
    async fn static_source_rejects_unknown_queries() {
        let source = StaticSource::new("replica").with_result("SELECT 1", vec![vec![Value::Int(1)]]);
        assert_eq!(source.fetch_rows("SELECT 1").await.unwrap().len(), 1);
        assert!(source.fetch_rows("SELECT 2").await.is_err());
    }
}
