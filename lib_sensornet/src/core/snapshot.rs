//! # Snapshot Reader
//!
//! The read side of a retention buffer. A `Snapshot` is an immutable,
//! point-in-time list of records that the presentation layer can filter,
//! project into a `Table` and serialize, all without touching the buffer
//! again. Rendering and CSV export go through the same projection.

use std::collections::BTreeSet;
use std::string::FromUtf8Error;
use std::sync::Arc;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use thiserror::Error;

use super::record::{Field, FieldValue, Metric, TelemetryRecord};
use super::retention::RetentionBuffer;

/// # Export Error
#[derive(Debug, Error)]
pub enum ExportError {
    /// The CSV writer failed.
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    /// The in-memory writer could not be flushed.
    #[error("CSV flush failed: {0}")]
    Flush(String),

    /// The output was not valid UTF-8.
    #[error("CSV output is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

/// # Snapshot
///
/// Consistent, immutable view of a buffer, oldest first. Cloning shares the
/// underlying slice.
#[derive(Debug, Clone)]
pub struct Snapshot {
    generation: u64,
    records: Arc<[Arc<TelemetryRecord>]>,
}

impl Snapshot {
    pub(crate) fn new(generation: u64, records: Arc<[Arc<TelemetryRecord>]>) -> Self {
        Self {
            generation,
            records,
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(0, Arc::from(Vec::new()))
    }

    /// Buffer generation this snapshot was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<TelemetryRecord>> + '_ {
        self.records.iter()
    }

    /// The oldest record.
    pub fn oldest(&self) -> Option<&Arc<TelemetryRecord>> {
        self.records.first()
    }

    /// The most recent record.
    pub fn latest(&self) -> Option<&Arc<TelemetryRecord>> {
        self.records.last()
    }

    /// Up to `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<TelemetryRecord>> {
        self.records.iter().rev().take(n).cloned().collect()
    }

    /// Records from `origin` only, relative order preserved.
    pub fn select_origin(&self, origin: &str) -> Snapshot {
        self.filtered(|r| r.origin_id == origin)
    }

    /// Records that carry `metric`.
    pub fn with_metric(&self, metric: Metric) -> Snapshot {
        self.filtered(|r| r.readings.get(metric).is_some())
    }

    /// Fields present in at least one record, in canonical order. `ID` and
    /// `received_at` are always included, even when empty.
    pub fn columns_present(&self) -> Vec<Field> {
        let mut columns: BTreeSet<Field> = BTreeSet::from([Field::Origin, Field::ReceivedAt]);
        for record in self.records.iter() {
            columns.extend(record.present_fields());
        }
        columns.into_iter().collect()
    }

    /// Projects the selected fields into rows. Fields a record does not carry
    /// are empty cells.
    pub fn project(&self, fields: &[Field]) -> Table {
        let rows = self
            .records
            .iter()
            .map(|record| Row {
                values: fields.iter().map(|f| record.value(f)).collect(),
            })
            .collect();

        Table {
            columns: fields.to_vec(),
            rows,
        }
    }

    /// Every present field as CSV, header first.
    pub fn export_csv(&self) -> Result<String, ExportError> {
        self.project(&self.columns_present()).to_csv()
    }

    fn filtered(&self, keep: impl Fn(&TelemetryRecord) -> bool) -> Snapshot {
        let records: Arc<[Arc<TelemetryRecord>]> = self
            .records
            .iter()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        Snapshot::new(self.generation, records)
    }
}

/// One projected row. Values line up with `Table::columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Cell values, `None` where the record lacks the field.
    pub values: Vec<Option<FieldValue>>,
}

impl Row {
    /// Value at column `index`.
    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(Option::as_ref)
    }
}

/// # Table
///
/// A projection of a snapshot. Serializes to JSON as
/// `{"columns":[..],"rows":[{"name":value,..},..]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Selected columns, in request order.
    pub columns: Vec<Field>,
    /// One row per record, insertion order.
    pub rows: Vec<Row>,
}

impl Table {
    /// Index of `field` among the columns.
    pub fn column_index(&self, field: &Field) -> Option<usize> {
        self.columns.iter().position(|c| c == field)
    }

    /// Serializes as comma-delimited text with a header row.
    pub fn to_csv(&self) -> Result<String, ExportError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.columns.iter().map(Field::name))?;

        for row in &self.rows {
            writer.write_record(row.values.iter().map(|cell| match cell {
                Some(value) => value.to_string(),
                None => String::new(),
            }))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| ExportError::Flush(e.to_string()))?;
        Ok(String::from_utf8(bytes)?)
    }
}

struct RowView<'a> {
    columns: &'a [Field],
    row: &'a Row,
}

impl Serialize for RowView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (field, value) in self.columns.iter().zip(&self.row.values) {
            map.serialize_entry(field.name(), value)?;
        }
        map.end()
    }
}

impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let columns: Vec<&str> = self.columns.iter().map(Field::name).collect();
        let rows: Vec<RowView<'_>> = self
            .rows
            .iter()
            .map(|row| RowView {
                columns: &self.columns,
                row,
            })
            .collect();

        let mut state = serializer.serialize_struct("Table", 2)?;
        state.serialize_field("columns", &columns)?;
        state.serialize_field("rows", &rows)?;
        state.end()
    }
}

/// # Snapshot Reader
///
/// Read-side handle on one buffer for the presentation layer.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    buffer: Arc<RetentionBuffer>,
}

impl SnapshotReader {
    /// Wraps a shared buffer.
    pub fn new(buffer: Arc<RetentionBuffer>) -> Self {
        Self { buffer }
    }

    /// The wrapped buffer.
    pub fn buffer(&self) -> &Arc<RetentionBuffer> {
        &self.buffer
    }

    /// Current snapshot of the buffer.
    pub fn snapshot(&self) -> Snapshot {
        self.buffer.snapshot()
    }

    /// Snapshot, optionally narrowed to one origin, projected to `fields`.
    pub fn view(&self, origin: Option<&str>, fields: &[Field]) -> Table {
        let snapshot = self.buffer.snapshot();
        match origin {
            Some(origin) => snapshot.select_origin(origin).project(fields),
            None => snapshot.project(fields),
        }
    }

    /// The whole buffer as CSV, every present field.
    pub fn export(&self) -> Result<String, ExportError> {
        self.buffer.snapshot().export_csv()
    }
}
