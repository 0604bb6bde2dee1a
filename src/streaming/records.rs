//! CSV text to typed, normalized records.
//!
//! Headers are renamed through [`normalize`] and cells are coerced according
//! to the survey's declared column types. The schema is a typing hint, not a
//! filter: undeclared columns pass through as strings.
//!
//! Rows are produced lazily by [`RecordStream`], one per CSV record, in file
//! order. The stream owns its input and is single-pass.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::catalog::{FieldType, SurveyDefinition};
use crate::error::AppError;
use crate::normalize::normalize;

/// One output row: canonical field name to typed value.
pub type NormalizedRecord = Map<String, Value>;

/// Callback invoked for every header collision found while parsing.
pub type CollisionHook = Arc<dyn Fn(&HeaderCollision) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Several source headers normalized to the same canonical name.
///
/// Only the last of them feeds the output field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCollision {
    pub canonical: String,
    /// Original header text, in CSV order.
    pub headers: Vec<String>,
    /// Zero-based CSV position of the column that wins.
    pub kept_position: usize,
}

/// A declared numeric cell that did not parse. The raw string is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    /// One-based data row (the header is row 0).
    pub row: u64,
    pub column: String,
    pub declared: FieldType,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} column '{}' is not a valid {}",
            self.row,
            self.column,
            self.declared.json_type()
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field plan
// ─────────────────────────────────────────────────────────────────────────────

/// Where one output field comes from.
#[derive(Debug, Clone)]
struct FieldSlot {
    name: String,
    /// CSV column feeding the field; `None` when the column is absent.
    source: Option<usize>,
    declared: Option<FieldType>,
}

/// Computes output fields: declared columns in definition order, then
/// undeclared columns in CSV order. Duplicated canonical names resolve to the
/// last matching CSV column.
fn plan_fields(
    headers: &StringRecord,
    survey: &SurveyDefinition,
) -> (Vec<FieldSlot>, Vec<HeaderCollision>) {
    let mut order: Vec<String> = Vec::new();
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();

    for (position, header) in headers.iter().enumerate() {
        let canonical = normalize(header);
        let entry = positions.entry(canonical.clone()).or_default();
        if entry.is_empty() {
            order.push(canonical);
        }
        entry.push(position);
    }

    let collisions = order
        .iter()
        .filter_map(|canonical| {
            let found = &positions[canonical];
            (found.len() > 1).then(|| HeaderCollision {
                canonical: canonical.clone(),
                headers: found.iter().map(|&p| headers[p].to_string()).collect(),
                kept_position: found[found.len() - 1],
            })
        })
        .collect();

    let last = |name: &str| positions.get(name).and_then(|p| p.last().copied());

    let mut slots: Vec<FieldSlot> = survey
        .columns
        .iter()
        .map(|column| FieldSlot {
            name: column.name.clone(),
            source: last(&column.name),
            declared: Some(column.field_type),
        })
        .collect();

    for canonical in &order {
        if survey.field_type(canonical).is_none() {
            slots.push(FieldSlot {
                name: canonical.clone(),
                source: last(canonical),
                declared: None,
            });
        }
    }

    (slots, collisions)
}

/// Coerces a cell according to its declared type.
///
/// Returns the value plus whether it was a numeric parse failure.
fn coerce(cell: &str, declared: Option<FieldType>) -> (Value, bool) {
    match declared {
        Some(FieldType::Integer) => {
            let trimmed = cell.trim();
            if trimmed.is_empty() {
                return (Value::Null, false);
            }
            match trimmed.parse::<i64>() {
                Ok(n) => (Value::Number(n.into()), false),
                Err(_) => (Value::String(cell.to_string()), true),
            }
        }
        Some(FieldType::Number) => {
            let trimmed = cell.trim();
            if trimmed.is_empty() {
                return (Value::Null, false);
            }
            match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) => (Value::Number(n), false),
                None => (Value::String(cell.to_string()), true),
            }
        }
        Some(FieldType::String) | None => (Value::String(cell.to_string()), false),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordNormalizer
// ─────────────────────────────────────────────────────────────────────────────

/// Stateless CSV-to-record converter. Parsing the same text twice yields the
/// same output.
#[derive(Clone, Default)]
pub struct RecordNormalizer {
    on_collision: Option<CollisionHook>,
}

impl fmt::Debug for RecordNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordNormalizer")
            .field("on_collision", &self.on_collision.is_some())
            .finish()
    }
}

impl RecordNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for duplicate canonical headers.
    pub fn with_collision_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HeaderCollision) + Send + Sync + 'static,
    {
        self.on_collision = Some(Arc::new(hook));
        self
    }

    /// Reads the header row and returns a lazy stream over the data rows.
    ///
    /// # Errors
    ///
    /// `AppError::Csv` if the header row cannot be read.
    pub fn parse(
        &self,
        csv_text: impl Into<String>,
        survey: &SurveyDefinition,
    ) -> Result<RecordStream, AppError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(csv_text.into().into_bytes()));

        let headers = reader.headers()?.clone();
        let (slots, collisions) = plan_fields(&headers, survey);

        for collision in &collisions {
            warn!(
                "[PARSE] Stream '{}': {} headers normalize to '{}', keeping column {}",
                survey.stream,
                collision.headers.len(),
                collision.canonical,
                collision.kept_position + 1
            );
            if let Some(hook) = &self.on_collision {
                hook(collision);
            }
        }

        debug!(
            "[PARSE] Stream '{}': {} CSV columns, {} output fields",
            survey.stream,
            headers.len(),
            slots.len()
        );

        Ok(RecordStream {
            stream: survey.stream.clone(),
            reader,
            row: StringRecord::new(),
            slots,
            clean_values: survey.clean_values,
            collisions,
            mismatches: 0,
            rows_read: 0,
            done: false,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStream
// ─────────────────────────────────────────────────────────────────────────────

/// Lazy, single-pass sequence of records for one survey.
///
/// Ends after the last row or after the first error.
pub struct RecordStream {
    stream: String,
    reader: csv::Reader<Cursor<Vec<u8>>>,
    row: StringRecord,
    slots: Vec<FieldSlot>,
    clean_values: bool,
    collisions: Vec<HeaderCollision>,
    mismatches: u64,
    rows_read: u64,
    done: bool,
}

impl RecordStream {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn header_collisions(&self) -> &[HeaderCollision] {
        &self.collisions
    }

    /// Numeric cells that failed to parse so far.
    pub fn schema_mismatches(&self) -> u64 {
        self.mismatches
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn build_record(&mut self) -> NormalizedRecord {
        let mut record = Map::with_capacity(self.slots.len());

        for slot in &self.slots {
            let Some(cell) = slot.source.and_then(|p| self.row.get(p)) else {
                record.insert(slot.name.clone(), Value::Null);
                continue;
            };

            let (value, mismatch) = if self.clean_values {
                coerce(&normalize(cell), slot.declared)
            } else {
                coerce(cell, slot.declared)
            };

            if mismatch {
                if let Some(declared) = slot.declared {
                    let report = SchemaMismatch {
                        row: self.rows_read,
                        column: slot.name.clone(),
                        declared,
                    };
                    warn!("[PARSE] Stream '{}': {}", self.stream, report);
                }
                self.mismatches += 1;
            }

            record.insert(slot.name.clone(), value);
        }

        record
    }
}

impl Iterator for RecordStream {
    type Item = Result<NormalizedRecord, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.reader.read_record(&mut self.row) {
            Ok(true) => {
                self.rows_read += 1;
                Some(Ok(self.build_record()))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

impl std::iter::FusedIterator for RecordStream {}

impl fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStream")
            .field("stream", &self.stream)
            .field("rows_read", &self.rows_read)
            .field("mismatches", &self.mismatches)
            .field("done", &self.done)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
