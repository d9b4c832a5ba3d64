//! Core value, schema and record types for etlsync.
//!
//! Everything in here is storage-agnostic: a [`TableSchema`] describes one
//! destination table, the [`RowNormalizer`] turns positional source rows into
//! [`SyncedRecord`]s for that table, and [`SyncError`] is the failure taxonomy
//! shared by every stage of a job run.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "etlsync-core";

/// A single database value as carried between source and destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Json(serde_json::Value),
    IntArray(Vec<i64>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Date(_) => "date",
            Value::Json(_) => "json",
            Value::IntArray(_) => "integer array",
        }
    }

    /// Renders the value the way Postgres `concat()` would, with NULL as the empty string.
    pub fn concat_fragment(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(true) => "t".to_string(),
            Value::Bool(false) => "f".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Json(j) => j.to_string(),
            Value::IntArray(items) => format!(
                "{{{}}}",
                items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Bit pattern of a float key; `-0.0` is folded onto `0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FloatKey(u64);

impl FloatKey {
    pub fn new(v: f64) -> Self {
        if v == 0.0 {
            Self(0.0f64.to_bits())
        } else {
            Self(v.to_bits())
        }
    }

    pub fn get(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// Conflict key of a destination row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Text(String),
    Float(FloatKey),
}

impl Key {
    /// `None` for NULL and for value kinds that cannot act as a key.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Key::Int(*v)),
            Value::Text(s) => Some(Key::Text(s.clone())),
            Value::Float(v) => Some(Key::Float(FloatKey::new(*v))),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{v}"),
            Key::Text(s) => write!(f, "{s}"),
            Key::Float(v) => write!(f, "{}", v.get()),
        }
    }
}

pub type KeySet = BTreeSet<Key>;

/// Destination column types understood by the DDL generator and the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Boolean,
    Text,
    Varchar(u32),
    Timestamp,
    Date,
    Jsonb,
    IntegerArray,
}

impl ColumnType {
    pub fn sql_name(&self) -> String {
        match self {
            ColumnType::Integer => "int".to_string(),
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::Real => "real".to_string(),
            ColumnType::DoublePrecision => "double precision".to_string(),
            ColumnType::Boolean => "boolean".to_string(),
            ColumnType::Text => "text".to_string(),
            ColumnType::Varchar(n) => format!("varchar({n})"),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::Date => "date".to_string(),
            ColumnType::Jsonb => "jsonb".to_string(),
            ColumnType::IntegerArray => "integer[]".to_string(),
        }
    }

    pub fn can_be_key(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer
                | ColumnType::BigInt
                | ColumnType::Real
                | ColumnType::DoublePrecision
                | ColumnType::Text
                | ColumnType::Varchar(_)
        )
    }

    fn is_textual(&self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Varchar(_))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// How the key column is populated from a raw source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    /// The key is an ordinary positional column of the row.
    Column,
    /// The row starts with `components` values that are concatenated with
    /// `separator` into the key; the remaining values fill every other column.
    Composite { components: usize, separator: String },
}

/// Descriptor for one destination table and its conflict-resolution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub key_column: String,
    pub refreshable: Vec<String>,
    pub key_spec: KeySpec,
    /// Adds an `id serial` column to the DDL; it never appears in records.
    pub surrogate_id: bool,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            table: table.into(),
            columns,
            key_column: key_column.into(),
            refreshable: Vec::new(),
            key_spec: KeySpec::Column,
            surrogate_id: false,
        }
    }

    pub fn refreshable<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refreshable = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Marks every non-key column refreshable.
    pub fn refresh_all(mut self) -> Self {
        self.refreshable = self
            .columns
            .iter()
            .filter(|c| c.name != self.key_column)
            .map(|c| c.name.clone())
            .collect();
        self
    }

    pub fn composite_key(mut self, components: usize, separator: impl Into<String>) -> Self {
        self.key_spec = KeySpec::Composite {
            components,
            separator: separator.into(),
        };
        self
    }

    pub fn with_surrogate_id(mut self) -> Self {
        self.surrogate_id = true;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |reason: String| SyncError::InvalidSchema {
            table: self.table.clone(),
            reason,
        };

        if self.columns.is_empty() {
            return Err(invalid("no columns declared".to_string()));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("column {} declared twice", column.name)));
            }
        }
        if self.surrogate_id && seen.contains("id") {
            return Err(invalid("surrogate id collides with declared column id".to_string()));
        }

        let key = self
            .key_column_spec()
            .ok_or_else(|| invalid(format!("key column {} is not declared", self.key_column)))?;
        if !key.ty.can_be_key() {
            return Err(invalid(format!("{} cannot be used as a key type", key.ty)));
        }

        let mut refreshed = HashSet::new();
        for name in &self.refreshable {
            if name == &self.key_column {
                return Err(invalid("key column cannot be refreshable".to_string()));
            }
            if !seen.contains(name.as_str()) {
                return Err(invalid(format!("refreshable column {name} is not declared")));
            }
            if !refreshed.insert(name.as_str()) {
                return Err(invalid(format!("refreshable column {name} listed twice")));
            }
        }

        if let KeySpec::Composite { components, .. } = &self.key_spec {
            if *components == 0 {
                return Err(invalid("composite key needs at least one component".to_string()));
            }
            if !key.ty.is_textual() {
                return Err(invalid("composite key column must be textual".to_string()));
            }
        }
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn key_index(&self) -> Option<usize> {
        self.column_index(&self.key_column)
    }

    pub fn key_column_spec(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == self.key_column)
    }

    pub fn is_refreshable(&self, name: &str) -> bool {
        self.refreshable.iter().any(|r| r == name)
    }

    /// Non-key columns that are only ever written at first insert.
    pub fn immutable_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.name != self.key_column && !self.is_refreshable(&c.name))
    }

    pub fn refreshable_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| self.is_refreshable(&c.name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of values a raw source row must carry.
    pub fn source_arity(&self) -> usize {
        match &self.key_spec {
            KeySpec::Column => self.columns.len(),
            KeySpec::Composite { components, .. } => self.columns.len() - 1 + components,
        }
    }

    /// Builds the valid-key set from single-column source values, dropping NULLs.
    pub fn key_set<I>(&self, values: I) -> Result<KeySet, SyncError>
    where
        I: IntoIterator<Item = Value>,
    {
        let key = self.key_column_spec().ok_or_else(|| SyncError::InvalidSchema {
            table: self.table.clone(),
            reason: format!("key column {} is not declared", self.key_column),
        })?;
        let mut keys = KeySet::new();
        for value in values {
            let value = coerce(&self.table, key, value)?;
            if let Some(k) = Key::from_value(&value) {
                keys.insert(k);
            }
        }
        Ok(keys)
    }
}

/// A typed row ready for the upsert executor, one value per declared column.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedRecord {
    pub values: Vec<Value>,
}

impl SyncedRecord {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn key(&self, schema: &TableSchema) -> Option<Key> {
        schema
            .key_index()
            .and_then(|i| self.values.get(i))
            .and_then(Key::from_value)
    }

    /// Pre-flight checks performed before any write reaches the destination.
    pub fn check_writable(&self, schema: &TableSchema) -> Result<Key, SyncError> {
        let missing_required = schema
            .columns
            .iter()
            .skip(self.values.len())
            .find(|column| column.name == schema.key_column || !column.nullable);
        if let Some(column) = missing_required {
            return Err(SyncError::ConstraintViolation {
                table: schema.table.clone(),
                column: column.name.clone(),
                reason: "missing non-nullable column".to_string(),
            });
        }
        if self.values.len() != schema.columns.len() {
            return Err(SyncError::SchemaMismatch {
                table: schema.table.clone(),
                expected: schema.columns.len(),
                actual: self.values.len(),
            });
        }
        for (column, value) in schema.columns.iter().zip(&self.values) {
            if !value.is_null() {
                continue;
            }
            let reason = if column.name == schema.key_column {
                "key is null"
            } else if !column.nullable {
                "null in non-nullable column"
            } else {
                continue;
            };
            return Err(SyncError::ConstraintViolation {
                table: schema.table.clone(),
                column: column.name.clone(),
                reason: reason.to_string(),
            });
        }
        self.key(schema).ok_or_else(|| SyncError::ConstraintViolation {
            table: schema.table.clone(),
            column: schema.key_column.clone(),
            reason: "key value has an unsupported type".to_string(),
        })
    }
}

/// Concatenates key components with `separator`, NULL components contributing nothing.
pub fn composite_key(parts: &[Value], separator: &str) -> String {
    parts
        .iter()
        .map(Value::concat_fragment)
        .collect::<Vec<_>>()
        .join(separator)
}

/// Maps positional source rows onto a destination schema.
#[derive(Debug, Clone, Copy)]
pub struct RowNormalizer<'a> {
    schema: &'a TableSchema,
}

impl<'a> RowNormalizer<'a> {
    pub fn new(schema: &'a TableSchema) -> Self {
        Self { schema }
    }

    pub fn normalize(&self, raw: Vec<Value>) -> Result<SyncedRecord, SyncError> {
        let schema = self.schema;
        let expected = schema.source_arity();
        if raw.len() != expected {
            return Err(SyncError::SchemaMismatch {
                table: schema.table.clone(),
                expected,
                actual: raw.len(),
            });
        }

        let ordered = match &schema.key_spec {
            KeySpec::Column => raw,
            KeySpec::Composite {
                components,
                separator,
            } => {
                let mut rest = raw;
                let tail = rest.split_off(*components);
                let key = Value::Text(composite_key(&rest, separator));
                let key_index = schema.key_index().ok_or_else(|| SyncError::InvalidSchema {
                    table: schema.table.clone(),
                    reason: format!("key column {} is not declared", schema.key_column),
                })?;
                let mut ordered = tail;
                ordered.insert(key_index, key);
                ordered
            }
        };

        let values = schema
            .columns
            .iter()
            .zip(ordered)
            .map(|(column, value)| coerce(&schema.table, column, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SyncedRecord { values })
    }

    pub fn normalize_all(&self, rows: Vec<Vec<Value>>) -> Result<Vec<SyncedRecord>, SyncError> {
        rows.into_iter().map(|row| self.normalize(row)).collect()
    }
}

fn coerce(table: &str, column: &ColumnSpec, value: Value) -> Result<Value, SyncError> {
    let violation = |reason: String| SyncError::ConstraintViolation {
        table: table.to_string(),
        column: column.name.clone(),
        reason,
    };
    let mismatch = |value: &Value| {
        violation(format!(
            "cannot store {} value in {} column",
            value.type_name(),
            column.ty
        ))
    };

    match (column.ty, value) {
        (_, Value::Null) => Ok(Value::Null),
        (ColumnType::Integer | ColumnType::BigInt, Value::Json(json)) => {
            let unwrapped = match json {
                serde_json::Value::Null => Value::Null,
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(v) => Value::Int(v),
                    None => return Err(mismatch(&Value::Json(serde_json::Value::Number(n)))),
                },
                serde_json::Value::String(s) => match s.trim().parse::<i64>() {
                    Ok(v) => Value::Int(v),
                    Err(_) => return Err(mismatch(&Value::Json(serde_json::Value::String(s)))),
                },
                other => return Err(mismatch(&Value::Json(other))),
            };
            coerce(table, column, unwrapped)
        }
        (ColumnType::Integer, Value::Int(v)) => i32::try_from(v)
            .map(|_| Value::Int(v))
            .map_err(|_| violation(format!("{v} is out of range for int"))),
        (ColumnType::BigInt, Value::Int(v)) => Ok(Value::Int(v)),
        (ColumnType::Real | ColumnType::DoublePrecision, Value::Int(v)) => Ok(Value::Float(v as f64)),
        (ColumnType::Real | ColumnType::DoublePrecision, Value::Float(v)) => Ok(Value::Float(v)),
        (ColumnType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ColumnType::Text, Value::Text(s)) => Ok(Value::Text(s)),
        (ColumnType::Varchar(limit), Value::Text(s)) => {
            let len = s.chars().count();
            if len > limit as usize {
                Err(violation(format!("value of length {len} exceeds varchar({limit})")))
            } else {
                Ok(Value::Text(s))
            }
        }
        (ColumnType::Timestamp, Value::Timestamp(ts)) => Ok(Value::Timestamp(ts)),
        (ColumnType::Timestamp, Value::Date(d)) => d
            .and_hms_opt(0, 0, 0)
            .map(Value::Timestamp)
            .ok_or_else(|| mismatch(&Value::Date(d))),
        (ColumnType::Date, Value::Date(d)) => Ok(Value::Date(d)),
        (ColumnType::Jsonb, Value::Json(j)) => Ok(Value::Json(j)),
        // json stored in a text column upstream
        (ColumnType::Jsonb, Value::Text(s)) => match serde_json::from_str(&s) {
            Ok(j) => Ok(Value::Json(j)),
            Err(_) => Err(violation("text value is not valid json".to_string())),
        },
        (ColumnType::IntegerArray, Value::IntArray(items)) => {
            if let Some(bad) = items.iter().find(|v| i32::try_from(**v).is_err()) {
                return Err(violation(format!("array element {bad} is out of range for int")));
            }
            Ok(Value::IntArray(items))
        }
        (_, other) => Err(mismatch(&other)),
    }
}

/// Commit strategy for one batch of upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// One transaction per batch; a failure rolls back the whole batch.
    #[default]
    Batch,
    /// Every upsert is durable as soon as it executes.
    PerRow,
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitMode::Batch => f.write_str("batch"),
            CommitMode::PerRow => f.write_str("per_row"),
        }
    }
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(CommitMode::Batch),
            "per_row" | "per-row" | "row" => Ok(CommitMode::PerRow),
            other => Err(format!("unknown commit mode {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("schema mismatch for {table}: expected {expected} values, got {actual}")]
    SchemaMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },
    #[error("constraint violation on {table}.{column}: {reason}")]
    ConstraintViolation {
        table: String,
        column: String,
        reason: String,
    },
    #[error("connection to {endpoint} failed: {message}")]
    ConnectionFailure { endpoint: String, message: String },
    #[error("batch for {table} failed after {applied} durable upserts")]
    PartialBatchFailure {
        table: String,
        applied: usize,
        #[source]
        source: Box<SyncError>,
    },
    #[error("invalid schema for {table}: {reason}")]
    InvalidSchema { table: String, reason: String },
    #[error("query on {target} failed: {message}")]
    Query { target: String, message: String },
}
