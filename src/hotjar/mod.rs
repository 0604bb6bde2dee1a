//! Hotjar HTTP client layer.
//!
//! - **Session handling** via cookie login with single-flight refresh
//! - **Safe logging** that never leaks cookies or signed download URLs
//! - **Bounded retries** for 5xx, 429 and connection failures

pub mod export;
pub mod http;
pub mod retry;
pub mod session;

pub use export::{DownloadArtifact, ExportFormat, ExportRequest, ExportRequester};
pub use http::{sanitize_url_for_logs, LoggingMode};
pub use retry::RetryPolicy;
pub use session::{AuthSession, Credentials, Session, DEFAULT_SESSION_TTL, MAX_SESSION_TTL};
