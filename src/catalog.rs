//! Survey catalog: one `SurveyDefinition` per stream, loaded as data.
//!
//! Column names are normalized once here, at catalog-build time, so they
//! line up with the headers `RecordNormalizer` produces at parse time.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::AppError;
use crate::normalize::normalize;

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Declared primitive type of a survey column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
}

impl FieldType {
    /// JSON-Schema type name.
    pub fn json_type(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
        }
    }

    /// Nullable JSON-Schema `type` list for a column of this type.
    ///
    /// Numeric columns also admit strings: a cell that fails to parse is
    /// emitted as its raw text.
    pub fn schema_types(self) -> Value {
        match self {
            FieldType::String => json!(["null", "string"]),
            other => json!(["null", other.json_type(), "string"]),
        }
    }
}

/// One declared column: canonical name plus type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Everything the pipeline needs to know about one survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyDefinition {
    /// Unique stream identifier.
    pub stream: String,
    pub site_id: u64,
    pub survey_id: u64,
    /// Ordered columns; order defines output field order.
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    /// Also run every cell value through `normalize`.
    #[serde(default)]
    pub clean_values: bool,
}

impl SurveyDefinition {
    pub fn new(
        stream: impl Into<String>,
        site_id: u64,
        survey_id: u64,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            stream: stream.into(),
            site_id,
            survey_id,
            columns,
            clean_values: false,
        }
    }

    pub fn with_clean_values(mut self, clean_values: bool) -> Self {
        self.clean_values = clean_values;
        self
    }

    /// Declared type for a canonical column name, if any.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.field_type)
    }

    /// JSON-Schema for the records of this stream. Every property is nullable.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for column in &self.columns {
            properties.insert(
                column.name.clone(),
                json!({ "type": column.field_type.schema_types() }),
            );
        }
        json!({
            "type": "object",
            "properties": properties,
        })
    }

    fn normalized(mut self) -> Self {
        for column in &mut self.columns {
            column.name = normalize(&column.name);
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SurveyCatalog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireCatalog {
    surveys: Vec<SurveyDefinition>,
}

/// Ordered collection of survey definitions with unique stream ids.
#[derive(Debug, Clone, Default)]
pub struct SurveyCatalog {
    surveys: Vec<SurveyDefinition>,
}

impl SurveyCatalog {
    /// Builds a catalog, normalizing column names and rejecting duplicate streams.
    pub fn new(surveys: Vec<SurveyDefinition>) -> Result<Self, AppError> {
        let mut seen = HashSet::new();
        for survey in &surveys {
            if survey.stream.trim().is_empty() {
                return Err(AppError::Config("survey with empty stream id".into()));
            }
            if !seen.insert(survey.stream.clone()) {
                return Err(AppError::Config(format!(
                    "duplicate stream id '{}'",
                    survey.stream
                )));
            }
        }

        Ok(Self {
            surveys: surveys.into_iter().map(SurveyDefinition::normalized).collect(),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        let wire: WireCatalog = serde_json::from_str(json)
            .map_err(|e| AppError::Config(format!("invalid catalog: {}", e)))?;
        Self::new(wire.surveys)
    }

    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn surveys(&self) -> &[SurveyDefinition] {
        &self.surveys
    }

    pub fn get(&self, stream: &str) -> Option<&SurveyDefinition> {
        self.surveys.iter().find(|s| s.stream == stream)
    }

    pub fn len(&self) -> usize {
        self.surveys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surveys.is_empty()
    }

    /// Keeps only the named streams, preserving catalog order.
    /// An empty selection keeps everything.
    pub fn select(&self, streams: &[String]) -> Result<Vec<SurveyDefinition>, AppError> {
        if streams.is_empty() {
            return Ok(self.surveys.clone());
        }

        if let Some(unknown) = streams.iter().find(|s| self.get(s).is_none()) {
            return Err(AppError::Config(format!("unknown stream '{}'", unknown)));
        }

        Ok(self
            .surveys
            .iter()
            .filter(|s| streams.contains(&s.stream))
            .cloned()
            .collect())
    }
}
