//! Tap commands invoked from the binary.

pub mod discover;
pub mod sync;

pub use discover::{discover, DiscoveredCatalog, DiscoveredStream};
pub use sync::{run_sync, SyncSummary};
