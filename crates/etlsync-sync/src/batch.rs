//! Batch synchronization and orphan reconciliation over a [`Destination`].

use etlsync_core::{CommitMode, KeySet, SyncError, SyncedRecord, TableSchema};
use etlsync_storage::Destination;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Drives one upsert per record, in order, under a single commit strategy.
pub struct BatchSynchronizer<'a> {
    destination: &'a dyn Destination,
    mode: CommitMode,
}

impl<'a> BatchSynchronizer<'a> {
    pub fn new(destination: &'a dyn Destination, mode: CommitMode) -> Self {
        Self { destination, mode }
    }

    /// Returns the number of upserts applied. Duplicate keys are applied in
    /// order, so the later row wins.
    pub async fn sync(&self, schema: &TableSchema, records: &[SyncedRecord]) -> Result<usize, SyncError> {
        let mut writer = self.destination.begin(self.mode).await?;
        let mut applied = 0usize;

        for record in records {
            if let Err(err) = writer.upsert(schema, record).await {
                return Err(match self.mode {
                    CommitMode::Batch => {
                        if let Err(rollback_err) = writer.rollback().await {
                            warn!(table = %schema.table, error = %rollback_err, "rollback failed");
                        }
                        err
                    }
                    CommitMode::PerRow if applied == 0 => err,
                    CommitMode::PerRow => SyncError::PartialBatchFailure {
                        table: schema.table.clone(),
                        applied,
                        source: Box::new(err),
                    },
                });
            }
            applied += 1;
        }

        writer.commit().await?;
        info!(table = %schema.table, upserted = applied, mode = %self.mode, "batch synchronized");
        Ok(applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "rows")]
pub enum ReconcileOutcome {
    Deleted(u64),
    /// Empty valid-key set with the guard enabled; nothing was deleted.
    Refused,
}

/// Deletes destination rows whose key is missing from a freshly computed set.
pub struct OrphanReconciler<'a> {
    destination: &'a dyn Destination,
    refuse_empty_valid_set: bool,
}

impl<'a> OrphanReconciler<'a> {
    pub fn new(destination: &'a dyn Destination) -> Self {
        Self {
            destination,
            refuse_empty_valid_set: false,
        }
    }

    pub fn refuse_empty_valid_set(mut self, refuse: bool) -> Self {
        self.refuse_empty_valid_set = refuse;
        self
    }

    pub async fn reconcile(&self, schema: &TableSchema, valid_keys: &KeySet) -> Result<ReconcileOutcome, SyncError> {
        if valid_keys.is_empty() {
            if self.refuse_empty_valid_set {
                warn!(table = %schema.table, "valid key set is empty; reconciliation refused");
                return Ok(ReconcileOutcome::Refused);
            }
            warn!(table = %schema.table, "valid key set is empty; every row will be deleted");
        }
        let deleted = self.destination.delete_absent(schema, valid_keys).await?;
        info!(table = %schema.table, valid_keys = valid_keys.len(), deleted, "orphans reconciled");
        Ok(ReconcileOutcome::Deleted(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use etlsync_core::{ColumnSpec, ColumnType, Key, Value};
    use etlsync_storage::MemoryDestination;

    fn points_schema() -> TableSchema {
        TableSchema::new(
            "points",
            "k",
            vec![
                ColumnSpec::new("k", ColumnType::BigInt).not_null(),
                ColumnSpec::new("created_at", ColumnType::Date),
                ColumnSpec::new("points", ColumnType::Integer).not_null(),
            ],
        )
        .refreshable(["points"])
    }

    fn day(y: i32, m: u32, d: u32) -> Value {
        Value::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn rec(k: i64, created: Value, points: i64) -> SyncedRecord {
        SyncedRecord::new(vec![Value::Int(k), created, Value::Int(points)])
    }

    async fn ready() -> MemoryDestination {
        let dest = MemoryDestination::default();
        dest.ensure_table(&points_schema()).await.unwrap();
        dest
    }

    #[tokio::test]
    async fn immutable_fields_keep_first_insert() {
        let dest = ready().await;
        let sync = BatchSynchronizer::new(&dest, CommitMode::Batch);
        sync.sync(&points_schema(), &[rec(1, day(2023, 1, 1), 10)]).await.unwrap();
        sync.sync(&points_schema(), &[rec(1, day(2024, 6, 30), 15)]).await.unwrap();

        let row = dest.row("points", &Key::Int(1)).await.unwrap();
        assert_eq!(row, vec![Value::Int(1), day(2023, 1, 1), Value::Int(15)]);
    }

    #[tokio::test]
    async fn syncing_twice_is_idempotent() {
        let dest = ready().await;
        let rows = vec![rec(1, day(2023, 1, 1), 1), rec(2, Value::Null, 2)];
        let sync = BatchSynchronizer::new(&dest, CommitMode::Batch);
        assert_eq!(sync.sync(&points_schema(), &rows).await.unwrap(), 2);
        let once = dest.table("points").await;
        sync.sync(&points_schema(), &rows).await.unwrap();
        assert_eq!(dest.table("points").await, once);
    }

    #[tokio::test]
    async fn later_duplicate_wins_within_batch() {
        let dest = ready().await;
        let rows = vec![rec(7, Value::Null, 1), rec(7, Value::Null, 2)];
        BatchSynchronizer::new(&dest, CommitMode::Batch)
            .sync(&points_schema(), &rows)
            .await
            .unwrap();
        assert_eq!(dest.row("points", &Key::Int(7)).await.unwrap()[2], Value::Int(2));
    }

    #[tokio::test]
    async fn per_row_failure_keeps_earlier_rows() {
        let dest = ready().await;
        let rows = vec![
            rec(1, Value::Null, 1),
            SyncedRecord::new(vec![Value::Null, Value::Null, Value::Int(2)]),
            rec(3, Value::Null, 3),
        ];
        let err = BatchSynchronizer::new(&dest, CommitMode::PerRow)
            .sync(&points_schema(), &rows)
            .await
            .unwrap_err();

        match err {
            SyncError::PartialBatchFailure { applied, source, .. } => {
                assert_eq!(applied, 1);
                assert!(matches!(*source, SyncError::ConstraintViolation { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dest.keys("points").await, vec![Key::Int(1)]);
    }

    #[tokio::test]
    async fn batch_failure_rolls_back_everything() {
        let dest = ready().await;
        let rows = vec![
            rec(1, Value::Null, 1),
            SyncedRecord::new(vec![Value::Int(2), Value::Null]),
        ];
        let err = BatchSynchronizer::new(&dest, CommitMode::Batch)
            .sync(&points_schema(), &rows)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ConstraintViolation { ref column, .. } if column == "points"
        ));
        assert_eq!(dest.len("points").await, 0);
    }

    #[tokio::test]
    async fn per_row_failure_on_first_row_is_not_partial() {
        let dest = ready().await;
        let rows = vec![
            SyncedRecord::new(vec![Value::Null, Value::Null, Value::Int(1)]),
            rec(2, Value::Null, 2),
        ];
        let err = BatchSynchronizer::new(&dest, CommitMode::PerRow)
            .sync(&points_schema(), &rows)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConstraintViolation { .. }));
        assert_eq!(dest.len("points").await, 0);
    }

    #[tokio::test]
    async fn reconcile_removes_keys_absent_from_valid_set() {
        let dest = ready().await;
        let rows: Vec<_> = (1..=3).map(|k| rec(k, Value::Null, 0)).collect();
        BatchSynchronizer::new(&dest, CommitMode::Batch)
            .sync(&points_schema(), &rows)
            .await
            .unwrap();

        let valid: KeySet = [2, 3, 4].into_iter().map(Key::Int).collect();
        let outcome = OrphanReconciler::new(&dest)
            .reconcile(&points_schema(), &valid)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deleted(1));
        assert_eq!(dest.keys("points").await, vec![Key::Int(2), Key::Int(3)]);
        // reconciliation never inserts
        assert!(dest.row("points", &Key::Int(4)).await.is_none());
    }

    #[tokio::test]
    async fn empty_valid_set_deletes_all_rows_unless_refused() {
        let dest = ready().await;
        let rows: Vec<_> = (1..=3).map(|k| rec(k, Value::Null, 0)).collect();
        BatchSynchronizer::new(&dest, CommitMode::Batch)
            .sync(&points_schema(), &rows)
            .await
            .unwrap();

        let refused = OrphanReconciler::new(&dest)
            .refuse_empty_valid_set(true)
            .reconcile(&points_schema(), &KeySet::new())
            .await
            .unwrap();
        assert_eq!(refused, ReconcileOutcome::Refused);
        assert_eq!(dest.len("points").await, 3);

        let outcome = OrphanReconciler::new(&dest)
            .reconcile(&points_schema(), &KeySet::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deleted(3));
        assert_eq!(dest.len("points").await, 0);
    }
}
