//! Measurement data model.
//!
//! [`MeasurementResult`] is the typed value container every driver operation
//! returns: a scalar with optional uncertainty, a waveform, or a tabular
//! frame, together with units, a dual timestamp, and provenance.
//!
//! [`DataFrame`] is a small columnar table - typed, unit-tagged columns
//! addressable by name and iterable as rows. It is deliberately not tied to
//! any external DataFrame library; sessions and waveform readouts only need
//! "rows with named, typed cells".

use crate::timestamp::Timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Cells and columns
// =============================================================================

/// One cell of a [`DataFrame`]. `Null` is the sentinel for a missing
/// acquisition key at a sweep point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Null,
    Float(f64),
    /// A reading with attached standard uncertainty.
    Measured { value: f64, sigma: f64 },
    Text(String),
    Time(DateTime<Utc>),
}

impl Cell {
    /// Numeric view of the cell, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Float(v) => Some(*v),
            Cell::Measured { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}

/// A named, unit-tagged column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Physical unit, when the column has one ("V", "s", …).
    pub unit: Option<String>,
    pub cells: Vec<Cell>,
}

impl Column {
    /// All numeric values in the column, skipping nulls and text.
    pub fn f64_values(&self) -> Vec<f64> {
        self.cells.iter().filter_map(Cell::as_f64).collect()
    }
}

// =============================================================================
// DataFrame
// =============================================================================

/// Columnar in-memory table. All columns always have the same length; rows
/// appended with missing columns are padded with [`Cell::Null`], and new
/// columns appearing mid-stream are back-filled the same way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    columns: Vec<Column>,
    rows: usize,
}

impl DataFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a column up front (used so parameter columns keep their
    /// declared order and units even before the first row lands).
    pub fn declare_column(&mut self, name: &str, unit: Option<&str>) {
        if self.column(name).is_none() {
            self.columns.push(Column {
                name: name.to_string(),
                unit: unit.map(str::to_string),
                cells: vec![Cell::Null; self.rows],
            });
        }
    }

    /// Build a frame directly from equal-length columns.
    pub fn from_columns(columns: Vec<Column>) -> Self {
        let rows = columns.first().map(|c| c.cells.len()).unwrap_or(0);
        debug_assert!(columns.iter().all(|c| c.cells.len() == rows));
        Self { columns, rows }
    }

    /// Append one row. Keys not yet seen become new columns back-filled with
    /// nulls; declared columns missing from the row get a null.
    pub fn push_row(&mut self, row: BTreeMap<String, Cell>) {
        for (name, _) in row.iter() {
            self.declare_column(name, None);
        }
        for column in &mut self.columns {
            let cell = row.get(&column.name).cloned().unwrap_or(Cell::Null);
            column.cells.push(cell);
        }
        self.rows += 1;
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Cell at (row, column name).
    pub fn cell(&self, row: usize, name: &str) -> Option<&Cell> {
        self.column(name).and_then(|c| c.cells.get(row))
    }

    /// Iterate rows as `(column name → cell)` maps.
    pub fn iter_rows(&self) -> impl Iterator<Item = BTreeMap<&str, &Cell>> + '_ {
        (0..self.rows).map(move |i| {
            self.columns
                .iter()
                .map(|c| (c.name.as_str(), &c.cells[i]))
                .collect()
        })
    }
}

// =============================================================================
// Measurement results
// =============================================================================

/// A reading with optional standard uncertainty attached from the profile's
/// accuracy table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measured {
    pub value: f64,
    pub sigma: Option<f64>,
}

impl Measured {
    pub fn exact(value: f64) -> Self {
        Self { value, sigma: None }
    }

    pub fn with_sigma(value: f64, sigma: f64) -> Self {
        Self {
            value,
            sigma: Some(sigma),
        }
    }
}

/// Shape of a measurement payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Scalar,
    Waveform,
    Tabular,
}

/// Payload of a [`MeasurementResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementValue {
    Scalar(Measured),
    /// Time/value columns reconstructed from a waveform readout.
    Waveform(DataFrame),
    Tabular(DataFrame),
}

impl MeasurementValue {
    pub fn kind(&self) -> MeasurementKind {
        match self {
            MeasurementValue::Scalar(_) => MeasurementKind::Scalar,
            MeasurementValue::Waveform(_) => MeasurementKind::Waveform,
            MeasurementValue::Tabular(_) => MeasurementKind::Tabular,
        }
    }
}

/// Who and what produced a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Operator or process identity.
    pub actor: String,
    /// `*IDN?` response (or simulator tag) of the producing instrument.
    pub instrument_idn: String,
    /// SHA-256 of the canonical profile the instrument was built from.
    pub profile_hash: String,
    /// Digest over the sorted SCPI commands executed since the previous
    /// envelope.
    pub trace_fingerprint: String,
}

/// Detached compliance envelope stored next to a result. Created and checked
/// by the compliance crate; carried here so results can travel with their
/// signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Signature algorithm identifier.
    pub alg: String,
    /// Fingerprint of the signing key.
    pub key_id: String,
    /// Hex SHA-256 of the canonical result bytes.
    pub sha: String,
    /// Hex detached signature bytes.
    pub sig: String,
    /// Wall-clock time the envelope was created.
    pub ts: DateTime<Utc>,
}

/// Typed value container returned by every measurement operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub value: MeasurementValue,
    pub units: String,
    pub timestamp: Timestamp,
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
}

impl MeasurementResult {
    pub fn kind(&self) -> MeasurementKind {
        self.value.kind()
    }

    /// Scalar view, for the common single-reading case.
    pub fn scalar(&self) -> Option<Measured> {
        match &self.value {
            MeasurementValue::Scalar(m) => Some(*m),
            _ => None,
        }
    }
}
