//! Hotjar survey export extraction.
//!
//! Per survey the pipeline authenticates once, triggers a CSV export,
//! downloads the signed ZIP archive, decodes it, and yields typed records
//! with ASCII-normalized field names.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod hotjar;
pub mod normalize;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod streaming;

pub use catalog::{ColumnDef, FieldType, SurveyCatalog, SurveyDefinition};
pub use config::Config;
pub use error::{AppError, Stage, SurveyFailure};
pub use hotjar::{AuthSession, Credentials, ExportRequester, RetryPolicy};
pub use normalize::normalize;
pub use runner::{RunState, SurveyExtraction, SurveyStreamRunner};
pub use scheduler::SurveyScheduler;
pub use sink::{RecordSink, SingerSink};
pub use streaming::{ArchiveDecoder, NormalizedRecord, RecordNormalizer};
