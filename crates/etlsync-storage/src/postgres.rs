//! Postgres source and destination backed by `sqlx` pools.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::ToPrimitive;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use etlsync_core::{
    ColumnSpec, ColumnType, CommitMode, Key, KeySet, SyncError, SyncedRecord, TableSchema, Value,
};
use sqlx::postgres::{PgArguments, PgDatabaseError, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::{BigDecimal, Uuid};
use sqlx::{Column, Executor, PgPool, Postgres, Row, Transaction, TypeInfo};
use tracing::debug;

use crate::sql::{create_table_sql, delete_absent_sql, upsert_sql};
use crate::{BatchWriter, Destination, Source};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Sets `default_transaction_read_only` on every pooled connection.
    pub read_only: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            read_only: false,
        }
    }
}

/// Opens a pool; any failure to reach the server is a [`SyncError::ConnectionFailure`].
pub async fn connect_pool(endpoint: &str, url: &str, settings: PoolSettings) -> Result<PgPool, SyncError> {
    let mut options = PgPoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.acquire_timeout);
    if settings.read_only {
        options = options.after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET default_transaction_read_only = on").await?;
                Ok(())
            })
        });
    }
    let pool = options
        .connect(url)
        .await
        .map_err(|err| SyncError::ConnectionFailure {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
    debug!(endpoint, max_connections = settings.max_connections, "connected pool");
    Ok(pool)
}

pub(crate) fn map_sqlx_error(target: &str, table: Option<&str>, err: sqlx::Error) -> SyncError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SyncError::ConnectionFailure {
            endpoint: target.to_string(),
            message: err.to_string(),
        },
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if code.starts_with("08") {
                return SyncError::ConnectionFailure {
                    endpoint: target.to_string(),
                    message: db.message().to_string(),
                };
            }
            // class 22 is data exceptions (bad casts, overflow), class 23 integrity violations
            if code.starts_with("22") || code.starts_with("23") {
                let column = db
                    .try_downcast_ref::<PgDatabaseError>()
                    .and_then(|pg| pg.column())
                    .or(db.constraint())
                    .unwrap_or("-")
                    .to_string();
                return SyncError::ConstraintViolation {
                    table: table.unwrap_or(target).to_string(),
                    column,
                    reason: format!("{} ({code})", db.message()),
                };
            }
            SyncError::Query {
                target: target.to_string(),
                message: db.to_string(),
            }
        }
        other => SyncError::Query {
            target: target.to_string(),
            message: other.to_string(),
        },
    }
}

/// Read replica (or any other read-only source database).
#[derive(Debug, Clone)]
pub struct PgSource {
    name: String,
    pool: PgPool,
}

impl PgSource {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl Source for PgSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Vec<Value>>, SyncError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(&self.name, None, err))?;
        debug!(source = %self.name, rows = rows.len(), "fetched rows");
        rows.iter().map(|row| decode_row(&self.name, row)).collect()
    }
}

fn decode_row(source: &str, row: &PgRow) -> Result<Vec<Value>, SyncError> {
    row.columns()
        .iter()
        .map(|column| {
            let type_name = column.type_info().name().to_string();
            decode_column(row, column.ordinal(), &type_name)
                .map_err(|err| map_sqlx_error(source, None, err))?
                .ok_or_else(|| SyncError::ConstraintViolation {
                    table: source.to_string(),
                    column: column.name().to_string(),
                    reason: format!("unsupported source type {type_name}"),
                })
        })
        .collect()
}

/// `Ok(None)` means the Postgres type has no mapping.
fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Option<Value>, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::Int(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::Int(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(idx)?
            .map(numeric_value),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::Text)
        }
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)?
            .map(|v| Value::Text(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(Value::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|v| Value::Timestamp(v.naive_utc())),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(idx)?.map(Value::Date),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(Value::Json),
        "INT2[]" => row
            .try_get::<Option<Vec<i16>>, _>(idx)?
            .map(|v| Value::IntArray(v.into_iter().map(i64::from).collect())),
        "INT4[]" => row
            .try_get::<Option<Vec<i32>>, _>(idx)?
            .map(|v| Value::IntArray(v.into_iter().map(i64::from).collect())),
        "INT8[]" => row.try_get::<Option<Vec<i64>>, _>(idx)?.map(Value::IntArray),
        _ => return Ok(None),
    };
    Ok(Some(value.unwrap_or(Value::Null)))
}

fn numeric_value(d: BigDecimal) -> Value {
    if d.is_integer() {
        if let Some(v) = d.to_i64() {
            return Value::Int(v);
        }
    }
    match d.to_f64() {
        Some(v) => Value::Float(v),
        None => Value::Text(d.to_string()),
    }
}

/// Result database.
#[derive(Debug, Clone)]
pub struct PgDestination {
    name: String,
    pool: PgPool,
}

impl PgDestination {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl Destination for PgDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_table(&self, schema: &TableSchema) -> Result<(), SyncError> {
        schema.validate()?;
        sqlx::query(&create_table_sql(schema))
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(&self.name, Some(&schema.table), err))?;
        debug!(destination = %self.name, table = %schema.table, "ensured table");
        Ok(())
    }

    async fn begin(&self, mode: CommitMode) -> Result<Box<dyn BatchWriter>, SyncError> {
        let target = match mode {
            CommitMode::Batch => WriteTarget::Transaction(
                self.pool
                    .begin()
                    .await
                    .map_err(|err| map_sqlx_error(&self.name, None, err))?,
            ),
            CommitMode::PerRow => WriteTarget::Autocommit(self.pool.clone()),
        };
        Ok(Box::new(PgBatchWriter {
            name: self.name.clone(),
            target,
            statements: HashMap::new(),
        }))
    }

    async fn delete_absent(&self, schema: &TableSchema, valid_keys: &KeySet) -> Result<u64, SyncError> {
        let key = schema.key_column_spec().ok_or_else(|| SyncError::InvalidSchema {
            table: schema.table.clone(),
            reason: format!("key column {} is not declared", schema.key_column),
        })?;
        let sql = delete_absent_sql(schema);
        let query = bind_key_array(sqlx::query(&sql), &schema.table, key.ty, valid_keys)?;
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(&self.name, Some(&schema.table), err))?;
        Ok(result.rows_affected())
    }
}

enum WriteTarget {
    Transaction(Transaction<'static, Postgres>),
    Autocommit(PgPool),
}

pub struct PgBatchWriter {
    name: String,
    target: WriteTarget,
    statements: HashMap<String, String>,
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    async fn upsert(&mut self, schema: &TableSchema, record: &SyncedRecord) -> Result<(), SyncError> {
        record.check_writable(schema)?;
        let sql = self
            .statements
            .entry(schema.table.clone())
            .or_insert_with(|| upsert_sql(schema))
            .clone();

        let mut query = sqlx::query(&sql);
        for (column, value) in schema.columns.iter().zip(&record.values) {
            query = bind_value(query, &schema.table, column, value)?;
        }
        let result = match &mut self.target {
            WriteTarget::Transaction(tx) => query.execute(&mut **tx).await,
            WriteTarget::Autocommit(pool) => query.execute(&*pool).await,
        };
        result.map_err(|err| map_sqlx_error(&self.name, Some(&schema.table), err))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let this = *self;
        match this.target {
            WriteTarget::Transaction(tx) => tx
                .commit()
                .await
                .map_err(|err| map_sqlx_error(&this.name, None, err)),
            WriteTarget::Autocommit(_) => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), SyncError> {
        let this = *self;
        match this.target {
            WriteTarget::Transaction(tx) => tx
                .rollback()
                .await
                .map_err(|err| map_sqlx_error(&this.name, None, err)),
            WriteTarget::Autocommit(_) => Ok(()),
        }
    }
}

fn bind_value<'q>(
    query: PgQuery<'q>,
    table: &str,
    column: &ColumnSpec,
    value: &Value,
) -> Result<PgQuery<'q>, SyncError> {
    let violation = |reason: String| SyncError::ConstraintViolation {
        table: table.to_string(),
        column: column.name.clone(),
        reason,
    };
    let out_of_range = |v: i64| violation(format!("{v} is out of range for int"));

    let query = match (column.ty, value) {
        (ColumnType::Integer, Value::Null) => query.bind(None::<i32>),
        (ColumnType::Integer, Value::Int(v)) => {
            query.bind(i32::try_from(*v).map_err(|_| out_of_range(*v))?)
        }
        (ColumnType::BigInt, Value::Null) => query.bind(None::<i64>),
        (ColumnType::BigInt, Value::Int(v)) => query.bind(*v),
        (ColumnType::Real, Value::Null) => query.bind(None::<f32>),
        (ColumnType::Real, Value::Float(v)) => query.bind(*v as f32),
        (ColumnType::DoublePrecision, Value::Null) => query.bind(None::<f64>),
        (ColumnType::DoublePrecision, Value::Float(v)) => query.bind(*v),
        (ColumnType::Boolean, Value::Null) => query.bind(None::<bool>),
        (ColumnType::Boolean, Value::Bool(b)) => query.bind(*b),
        (ColumnType::Text | ColumnType::Varchar(_), Value::Null) => query.bind(None::<String>),
        (ColumnType::Text | ColumnType::Varchar(_), Value::Text(s)) => query.bind(s.clone()),
        (ColumnType::Timestamp, Value::Null) => query.bind(None::<NaiveDateTime>),
        (ColumnType::Timestamp, Value::Timestamp(ts)) => query.bind(*ts),
        (ColumnType::Date, Value::Null) => query.bind(None::<NaiveDate>),
        (ColumnType::Date, Value::Date(d)) => query.bind(*d),
        (ColumnType::Jsonb, Value::Null) => query.bind(None::<serde_json::Value>),
        (ColumnType::Jsonb, Value::Json(j)) => query.bind(j.clone()),
        (ColumnType::IntegerArray, Value::Null) => query.bind(None::<Vec<i32>>),
        (ColumnType::IntegerArray, Value::IntArray(items)) => {
            let items = items
                .iter()
                .map(|v| i32::try_from(*v).map_err(|_| out_of_range(*v)))
                .collect::<Result<Vec<_>, _>>()?;
            query.bind(items)
        }
        (ty, other) => {
            return Err(violation(format!(
                "cannot bind {} value to {ty} column",
                other.type_name()
            )))
        }
    };
    Ok(query)
}

fn bind_key_array<'q>(
    query: PgQuery<'q>,
    table: &str,
    ty: ColumnType,
    keys: &KeySet,
) -> Result<PgQuery<'q>, SyncError> {
    let wrong = |key: &Key| SyncError::InvalidSchema {
        table: table.to_string(),
        reason: format!("key {key} does not match {ty} key column"),
    };
    match ty {
        ColumnType::Integer | ColumnType::BigInt => {
            let ints = keys
                .iter()
                .map(|k| match k {
                    Key::Int(v) => Ok(*v),
                    other => Err(wrong(other)),
                })
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(query.bind(ints))
        }
        ColumnType::Real | ColumnType::DoublePrecision => {
            let floats = keys
                .iter()
                .map(|k| match k {
                    Key::Float(f) => Ok(f.get()),
                    Key::Int(v) => Ok(*v as f64),
                    other => Err(wrong(other)),
                })
                .collect::<Result<Vec<f64>, _>>()?;
            Ok(query.bind(floats))
        }
        ColumnType::Text | ColumnType::Varchar(_) => {
            let texts = keys
                .iter()
                .map(|k| match k {
                    Key::Text(s) => Ok(s.clone()),
                    other => Err(wrong(other)),
                })
                .collect::<Result<Vec<String>, _>>()?;
            Ok(query.bind(texts))
        }
        other => Err(SyncError::InvalidSchema {
            table: table.to_string(),
            reason: format!("{other} cannot be used as a key type"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_keep_integers_exact() {
        let whole: BigDecimal = "42".parse().unwrap();
        assert_eq!(numeric_value(whole), Value::Int(42));
        let fraction: BigDecimal = "12.5".parse().unwrap();
        assert_eq!(numeric_value(fraction), Value::Float(12.5));
    }

    #[test]
    fn connection_errors_are_classified() {
        let err = map_sqlx_error("result_db", None, sqlx::Error::PoolTimedOut);
        assert!(matches!(err, SyncError::ConnectionFailure { ref endpoint, .. } if endpoint == "result_db"));

        let err = map_sqlx_error("result_db", Some("topics"), sqlx::Error::RowNotFound);
        assert!(matches!(err, SyncError::Query { .. }));
    }

    #[test]
    fn binding_rejects_mismatched_values() {
        let column = ColumnSpec::new("points", ColumnType::Integer);
        let err = bind_value(sqlx::query("SELECT $1"), "t", &column, &Value::Text("x".into()))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::ConstraintViolation { .. }));

        let err = bind_value(
            sqlx::query("SELECT $1"),
            "t",
            &column,
            &Value::Int(i64::from(i32::MAX) + 1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SyncError::ConstraintViolation { .. }));
    }

    #[test]
    fn key_arrays_must_match_key_type() {
        let mut keys = KeySet::new();
        keys.insert(Key::Text("a".into()));
        let err = bind_key_array(sqlx::query("SELECT $1"), "t", ColumnType::BigInt, &keys)
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidSchema { .. }));
        assert!(bind_key_array(sqlx::query("SELECT $1"), "t", ColumnType::Text, &keys).is_ok());
    }
}
