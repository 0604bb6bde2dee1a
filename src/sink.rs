//! Record output in the Singer JSON-lines format.
//!
//! Each line is one message: a `SCHEMA` message before a stream's first
//! record, then one `RECORD` message per row.

use std::io::Write;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::catalog::SurveyDefinition;
use crate::error::AppError;
use crate::streaming::NormalizedRecord;

/// Destination for one survey's records, handed over in emission order.
pub trait RecordSink {
    fn write_schema(&mut self, survey: &SurveyDefinition) -> Result<(), AppError>;

    fn write_record(&mut self, stream: &str, record: &NormalizedRecord) -> Result<(), AppError>;

    fn flush(&mut self) -> Result<(), AppError>;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum Message<'a> {
    Schema {
        stream: &'a str,
        schema: Value,
        key_properties: [&'a str; 0],
    },
    Record {
        stream: &'a str,
        record: &'a NormalizedRecord,
        time_extracted: String,
    },
}

/// Writes Singer messages, one JSON object per line.
#[derive(Debug)]
pub struct SingerSink<W: Write> {
    out: W,
    records_written: u64,
}

impl<W: Write> SingerSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, message: &Message<'_>) -> Result<(), AppError> {
        serde_json::to_writer(&mut self.out, message)
            .map_err(|e| AppError::Internal(format!("failed to write message: {}", e)))?;
        self.out
            .write_all(b"\n")
            .map_err(|e| AppError::Internal(format!("failed to write message: {}", e)))
    }
}

impl<W: Write> RecordSink for SingerSink<W> {
    fn write_schema(&mut self, survey: &SurveyDefinition) -> Result<(), AppError> {
        self.emit(&Message::Schema {
            stream: &survey.stream,
            schema: survey.json_schema(),
            key_properties: [],
        })
    }

    fn write_record(&mut self, stream: &str, record: &NormalizedRecord) -> Result<(), AppError> {
        self.emit(&Message::Record {
            stream,
            record,
            time_extracted: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })?;
        self.records_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AppError> {
        self.out
            .flush()
            .map_err(|e| AppError::Internal(format!("failed to flush output: {}", e)))
    }
}
