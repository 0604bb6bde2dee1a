//! Survey response exports.
//!
//! An export is a two-step indirection:
//! 1. An authenticated trigger call returns JSON with a `download_url`.
//! 2. An unauthenticated GET on that pre-signed URL returns a ZIP archive.
//!
//! # Security
//!
//! - The signed download URL is never logged beyond its path
//! - The session cookie is only sent to the trigger endpoint

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::catalog::SurveyDefinition;
use crate::error::AppError;
use crate::hotjar::http::{send_logged, status_error, LoggingMode};
use crate::hotjar::retry::RetryPolicy;
use crate::hotjar::session::AuthSession;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Export file format requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
        }
    }
}

/// Parameters of one export trigger call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub site_id: u64,
    pub survey_id: u64,
    pub format: ExportFormat,
    /// Synchronous completion. Always false: the provider prepares the file
    /// and answers with a download URL.
    pub async_export: bool,
    /// Response filter passed verbatim as `survey_query`. Empty means "all".
    pub survey_query: serde_json::Value,
}

impl ExportRequest {
    pub fn for_survey(survey: &SurveyDefinition) -> Self {
        Self {
            site_id: survey.site_id,
            survey_id: survey.survey_id,
            format: ExportFormat::Csv,
            async_export: false,
            survey_query: serde_json::json!({}),
        }
    }

    /// `{api_base}sites/{site}/polls/{survey}/responses/export?survey_query=..&format=csv&async_export=false`
    pub fn url(&self, api_base: &Url) -> Result<Url, AppError> {
        let path = format!(
            "sites/{}/polls/{}/responses/export",
            self.site_id, self.survey_id
        );
        let mut url = api_base
            .join(&path)
            .map_err(|e| AppError::Internal(format!("Failed to build export URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("survey_query", &self.survey_query.to_string())
            .append_pair("format", self.format.as_str())
            .append_pair("async_export", if self.async_export { "true" } else { "false" });

        Ok(url)
    }
}

/// A prepared export waiting to be fetched.
///
/// Consumed by [`ExportRequester::download`]: signed URLs are single-use, so
/// the artifact cannot be fetched twice.
#[derive(Clone)]
pub struct DownloadArtifact {
    survey_id: u64,
    url: Url,
}

impl DownloadArtifact {
    pub fn survey_id(&self) -> u64 {
        self.survey_id
    }

    /// Path of the signed URL, safe for logs.
    pub fn display_path(&self) -> &str {
        self.url.path()
    }
}

impl std::fmt::Debug for DownloadArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadArtifact")
            .field("survey_id", &self.survey_id)
            .field("path", &self.url.path())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireExportResponse {
    #[serde(default)]
    download_url: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ExportRequester
// ─────────────────────────────────────────────────────────────────────────────

/// Triggers survey exports and fetches the resulting archives.
#[derive(Clone)]
pub struct ExportRequester {
    session: Arc<AuthSession>,
    http: reqwest::Client,
    api_base: Url,
    retry: RetryPolicy,
    logging_mode: LoggingMode,
}

impl ExportRequester {
    /// `api_base` must end with a slash (e.g. `https://insights.hotjar.com/api/v1/`).
    pub fn new(session: Arc<AuthSession>, http: reqwest::Client, api_base: Url) -> Self {
        Self {
            session,
            http,
            api_base,
            retry: RetryPolicy::default(),
            logging_mode: LoggingMode::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    pub fn logging_mode(&self) -> LoggingMode {
        self.logging_mode
    }

    /// Triggers the export and downloads the archive bytes.
    pub async fn fetch_archive(&self, survey: &SurveyDefinition) -> Result<Vec<u8>, AppError> {
        let artifact = self.trigger_export(survey).await?;
        self.download(artifact).await
    }

    /// Calls the export trigger and resolves the download indirection.
    ///
    /// # Errors
    ///
    /// - `AppError::ExportUnavailable` - no (or empty) `download_url`; not retried
    /// - `AppError::Protocol` - body is not the expected JSON, or URL invalid
    /// - `AppError::TransientNetwork` - 5xx/connection errors after retries
    /// - `AppError::RequestRejected` - other 4xx
    pub async fn trigger_export(
        &self,
        survey: &SurveyDefinition,
    ) -> Result<DownloadArtifact, AppError> {
        let request = ExportRequest::for_survey(survey);
        let url = request.url(&self.api_base)?;

        info!(
            "[EXPORT] Triggering export for '{}' (site {}, survey {})",
            survey.stream, survey.site_id, survey.survey_id
        );

        let body = self
            .retry
            .run("export trigger", || async {
                let response = self.session.send_authed(Method::GET, &url).await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status));
                }
                response
                    .text()
                    .await
                    .map_err(|_| AppError::TransientNetwork("export trigger body read failed".into()))
            })
            .await?;

        let wire: WireExportResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::Protocol(format!("Failed to parse export trigger response: {}", e))
        })?;

        let download_url = match wire.download_url {
            Some(u) if !u.trim().is_empty() => u,
            _ => {
                warn!(
                    "[EXPORT] No download URL for '{}' (survey {})",
                    survey.stream, survey.survey_id
                );
                return Err(AppError::ExportUnavailable {
                    survey_id: survey.survey_id,
                });
            }
        };

        let url = Url::parse(download_url.trim())
            .map_err(|_| AppError::Protocol("download_url is not a valid URL".into()))?;

        Ok(DownloadArtifact {
            survey_id: survey.survey_id,
            url,
        })
    }

    /// Fetches the archive behind a signed URL. No session cookie is sent.
    pub async fn download(&self, artifact: DownloadArtifact) -> Result<Vec<u8>, AppError> {
        let url = artifact.url;

        let bytes = self
            .retry
            .run("archive download", || async {
                let request = self.http.get(url.as_str());
                let response = send_logged(request, &Method::GET, &url, self.logging_mode).await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status));
                }
                response
                    .bytes()
                    .await
                    .map_err(|_| AppError::TransientNetwork("archive body read failed".into()))
            })
            .await?;

        info!(
            "[EXPORT] Downloaded archive for survey {} ({} bytes)",
            artifact.survey_id,
            bytes.len()
        );

        Ok(bytes.to_vec())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
