use std::fmt;

use thiserror::Error;

/// Patterns (lowercase) that indicate a message may carry credentials.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "cookie:",
    "set-cookie",
    "authorization:",
    "signature=",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for operator-facing output.
/// If sensitive content is detected, returns the fallback instead.
pub(crate) fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Authentication failed: {0}")]
    Authentication(String),

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Request rejected with HTTP {status}")]
    RequestRejected { status: u16 },

    #[error("Unexpected response: {0}")]
    Protocol(String),

    // ── Export ────────────────────────────────────────────────────────────────
    #[error("Export unavailable for survey {survey_id}: no download URL returned")]
    ExportUnavailable { survey_id: u64 },

    #[error("Malformed archive: {0}")]
    MalformedArchive(String),

    #[error("Invalid CSV: {0}")]
    Csv(String),

    // ── Setup ─────────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failed call may succeed if issued again after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientNetwork(_))
    }

    /// Message safe to show operators. Never leaks credentials or signed URLs.
    pub fn operator_message(&self) -> String {
        match self {
            AppError::Authentication(msg) => format!(
                "Authentication failed: {}",
                sanitize_message(msg, "credentials were rejected")
            ),
            AppError::TransientNetwork(msg) => format!(
                "Network error: {}",
                sanitize_message(msg, "connection to Hotjar failed")
            ),
            AppError::Protocol(msg) => format!(
                "Unexpected response: {}",
                sanitize_message(msg, "response did not match the expected shape")
            ),
            AppError::MalformedArchive(msg) => format!(
                "Malformed archive: {}",
                sanitize_message(msg, "archive could not be read")
            ),
            AppError::Internal(msg) => format!(
                "Internal error: {}",
                sanitize_message(msg, "something went wrong")
            ),
            other => other.to_string(),
        }
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Csv(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-survey failures
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline stage in which a survey extraction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Auth,
    Trigger,
    Download,
    Decode,
    Parse,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Auth => "auth",
            Stage::Trigger => "trigger",
            Stage::Download => "download",
            Stage::Decode => "decode",
            Stage::Parse => "parse",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error for one survey's extraction.
///
/// The message always names the failing stage and the survey so operators can
/// tell "no export ready" apart from genuine failures without a backtrace.
#[derive(Debug, Error)]
#[error(
    "survey '{stream}' (site {site_id}, survey {survey_id}) failed during {stage}: {}",
    .source.operator_message()
)]
pub struct SurveyFailure {
    pub stream: String,
    pub site_id: u64,
    pub survey_id: u64,
    pub stage: Stage,
    #[source]
    pub source: AppError,
}

impl SurveyFailure {
    /// True when the provider simply had no export ready.
    pub fn is_export_unavailable(&self) -> bool {
        matches!(self.source, AppError::ExportUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns all AppError variants for exhaustive testing.
    fn all_variants() -> Vec<AppError> {
        vec![
            AppError::Authentication("bad credentials".into()),
            AppError::TransientNetwork("connection reset".into()),
            AppError::RequestRejected { status: 404 },
            AppError::Protocol("missing cookies".into()),
            AppError::ExportUnavailable { survey_id: 42 },
            AppError::MalformedArchive("zero entries".into()),
            AppError::Csv("unterminated quote".into()),
            AppError::Config("email is empty".into()),
            AppError::Cancelled,
            AppError::Internal("something broke".into()),
        ]
    }

    #[test]
    fn all_variants_have_nonempty_operator_message() {
        for variant in all_variants() {
            assert!(
                !variant.operator_message().trim().is_empty(),
                "Empty message for {:?}",
                variant
            );
        }
    }

    #[test]
    fn only_network_errors_are_transient() {
        for variant in all_variants() {
            let expected = matches!(variant, AppError::TransientNetwork(_));
            assert_eq!(variant.is_transient(), expected, "{:?}", variant);
        }
    }

    #[test]
    fn no_secret_leakage_in_operator_message() {
        let test_cases: Vec<(&str, AppError)> = vec![
            ("Authentication", AppError::Authentication("password=hunter2".into())),
            ("TransientNetwork", AppError::TransientNetwork("Cookie: SESSION=abc".into())),
            ("Protocol", AppError::Protocol("Set-Cookie: _hjSession=xyz".into())),
            ("MalformedArchive", AppError::MalformedArchive("?Signature=deadbeef".into())),
            ("Internal", AppError::Internal("Authorization: Bearer t".into())),
        ];

        for (label, variant) in test_cases {
            let output = variant.operator_message().to_ascii_lowercase();
            for pattern in SENSITIVE_PATTERNS {
                assert!(
                    !output.contains(pattern),
                    "{} message contains sensitive pattern",
                    label
                );
            }
        }
    }

    #[test]
    fn survey_failure_names_stage_and_survey() {
        let failure = SurveyFailure {
            stream: "b2b_us".into(),
            site_id: 1234,
            survey_id: 5678,
            stage: Stage::Trigger,
            source: AppError::ExportUnavailable { survey_id: 5678 },
        };

        let msg = failure.to_string();
        assert!(msg.contains("trigger"), "{}", msg);
        assert!(msg.contains("b2b_us"), "{}", msg);
        assert!(msg.contains("5678"), "{}", msg);
        assert!(failure.is_export_unavailable());
    }

    #[test]
    fn stage_names_are_stable() {
        let names: Vec<&str> = [
            Stage::Auth,
            Stage::Trigger,
            Stage::Download,
            Stage::Decode,
            Stage::Parse,
        ]
        .iter()
        .map(|s| s.as_str())
        .collect();
        assert_eq!(names, vec!["auth", "trigger", "download", "decode", "parse"]);
    }
}
