// =============================================================================
// models.rs — THE SHAPES THAT FLOW THROUGH THE PIPELINE
// =============================================================================
//
// A unit goes in, records come out, a table gets replaced. These are the
// types for each of those steps:
//
//   ScrapeUnit    one fetchable target (a company symbol, a sector code)
//   RawRecord     an ordered tuple of typed, nullable fields
//   InsertSpec    the table a record must fit, column by column
//   Destination   an insert spec plus how to write it (replace or append)
//   RunReport     what happened during one run, for humans and dashboards
//
// Records are positional on purpose: the storage layer binds them straight
// into a multi-row INSERT, so field N always lands in column N.
// =============================================================================

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::StorageError;

/// One independently fetchable target. Produced at the start of a run,
/// consumed exactly once by the coordinator, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScrapeUnit(String);

impl ScrapeUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScrapeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScrapeUnit {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ScrapeUnit {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The SQL-level type of a column. Each [`Field`] variant maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
    Float,
    Timestamp,
}

impl FieldKind {
    /// Column type used when a table has to be created from scratch.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Text => "TEXT",
            FieldKind::Int => "BIGINT",
            FieldKind::Float => "DOUBLE PRECISION",
            FieldKind::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "text"),
            FieldKind::Int => write!(f, "int"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// A single typed, nullable value. A `None` still knows its type, so NULLs
/// bind with the right SQL type and shape checks can tell a missing float
/// from a missing string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Field {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
    Timestamp(Option<NaiveDateTime>),
}

impl Field {
    pub fn text(value: impl Into<String>) -> Self {
        Field::Text(Some(value.into()))
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Text(_) => FieldKind::Text,
            Field::Int(_) => FieldKind::Int,
            Field::Float(_) => FieldKind::Float,
            Field::Timestamp(_) => FieldKind::Timestamp,
        }
    }

    /// The value rendered as a string, or `None` for NULL. Used for
    /// identifier columns and for the in-memory backend's lookups.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Field::Text(v) => v.clone(),
            Field::Int(v) => v.map(|n| n.to_string()),
            Field::Float(v) => v.map(|n| n.to_string()),
            Field::Timestamp(v) => v.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

/// An ordered tuple of fields, positionally matching an [`InsertSpec`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord(Vec<Field>);

impl RawRecord {
    pub fn new(fields: Vec<Field>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&Field> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One column of a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Column {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

/// The insert contract of a table: its name and its columns, in bind order.
/// Storage backends generate all SQL from this; nobody hand-writes INSERTs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertSpec {
    pub table: &'static str,
    pub columns: &'static [Column],
}

impl InsertSpec {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    /// Check that `record` (at position `index` in its batch) fits this
    /// contract: same arity, and each field of the declared kind.
    pub fn check(&self, index: usize, record: &RawRecord) -> Result<(), StorageError> {
        if record.len() != self.columns.len() {
            return Err(StorageError::Shape {
                table: self.table,
                index,
                reason: format!(
                    "expected {} fields, got {}",
                    self.columns.len(),
                    record.len()
                ),
            });
        }

        for (column, field) in self.columns.iter().zip(record.fields()) {
            if column.kind != field.kind() {
                return Err(StorageError::Shape {
                    table: self.table,
                    index,
                    reason: format!(
                        "column {} expects {}, got {}",
                        column.name,
                        column.kind,
                        field.kind()
                    ),
                });
            }
        }

        Ok(())
    }

    /// Check every record in a batch. Stops at the first misfit.
    pub fn check_all(&self, records: &[RawRecord]) -> Result<(), StorageError> {
        records
            .iter()
            .enumerate()
            .try_for_each(|(index, record)| self.check(index, record))
    }
}

/// Whether a store wipes the table first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteMode {
    /// Delete every row, then insert, in one transaction.
    Replace,
    /// Insert alongside whatever is already there.
    Append,
}

/// Where a domain's records end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub spec: InsertSpec,
    pub mode: WriteMode,
}

impl Destination {
    /// The table to clear before inserting, if this destination replaces.
    pub fn replace_table(&self) -> Option<&'static str> {
        match self.mode {
            WriteMode::Replace => Some(self.spec.table),
            WriteMode::Append => None,
        }
    }
}

/// Where a run's unit list comes from when it is read out of storage:
/// the distinct values of `column` in `table`, optionally ordered by the
/// latest value of another column (oldest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitQuery {
    pub table: &'static str,
    pub column: &'static str,
    pub order_by_latest: Option<&'static str>,
}

/// Counters a job hands back to the engine when its execute step finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub units_total: usize,
    pub units_completed: usize,
    pub units_failed: usize,
    pub records_stored: u64,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Every unit came back empty or failed; the table was left alone.
    NothingToStore,
    Cancelled,
    Failed(String),
    Panicked(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded | RunOutcome::NothingToStore)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "SUCCEEDED"),
            RunOutcome::NothingToStore => write!(f, "NOTHING_TO_STORE"),
            RunOutcome::Cancelled => write!(f, "CANCELLED"),
            RunOutcome::Failed(reason) => write!(f, "FAILED: {reason}"),
            RunOutcome::Panicked(reason) => write!(f, "PANICKED: {reason}"),
        }
    }
}

/// The structured account of one run. Built by the engine after the execute
/// step returns (or panics) and kept as the engine's last report.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub job: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units_total: usize,
    pub units_completed: usize,
    pub units_failed: usize,
    pub records_stored: u64,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
