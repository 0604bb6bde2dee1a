//! Decoding of downloaded exports.
//!
//! The archive layer turns ZIP bytes into CSV text. The record layer turns
//! CSV text into typed records with canonical field names.

pub mod archive;
pub mod records;

pub use archive::ArchiveDecoder;
pub use records::{
    CollisionHook, HeaderCollision, NormalizedRecord, RecordNormalizer, RecordStream,
    SchemaMismatch,
};
