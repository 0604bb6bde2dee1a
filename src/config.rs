//! Tap configuration, loaded from the JSON file given with `--config`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::error::AppError;
use crate::hotjar::http::LoggingMode;
use crate::hotjar::retry::RetryPolicy;
use crate::hotjar::session::{Credentials, MAX_SESSION_TTL};

const DEFAULT_API_BASE_URL: &str = "https://insights.hotjar.com/api/v1/";
const DEFAULT_AUTH_URL: &str = "https://insights.hotjar.com/api/v2/users";

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_session_ttl_secs() -> u64 {
    30 * 60
}

fn default_max_concurrent_surveys() -> usize {
    1
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub email: String,
    pub password: SecretString,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_max_concurrent_surveys")]
    pub max_concurrent_surveys: usize,

    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    /// How request URLs appear in `[HTTP]` log lines.
    #[serde(default)]
    pub logging_mode: LoggingMode,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("auth_url", &self.auth_url)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("retry", &self.retry)
            .field("max_concurrent_surveys", &self.max_concurrent_surveys)
            .field("catalog_path", &self.catalog_path)
            .field("logging_mode", &self.logging_mode)
            .finish()
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        // serde_json errors quote the offending input, which may be the password.
        let config: Config = serde_json::from_str(json).map_err(|e| {
            AppError::Config(format!(
                "invalid config at line {} column {}",
                e.line(),
                e.column()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.email.trim().is_empty() {
            return Err(AppError::Config("email must not be empty".into()));
        }
        if self.password.expose_secret().is_empty() {
            return Err(AppError::Config("password must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.session_ttl() > MAX_SESSION_TTL {
            return Err(AppError::Config(format!(
                "session_ttl_secs must not exceed {}",
                MAX_SESSION_TTL.as_secs()
            )));
        }
        if self.max_concurrent_surveys == 0 {
            return Err(AppError::Config(
                "max_concurrent_surveys must be at least 1".into(),
            ));
        }
        self.api_base()?;
        self.auth_endpoint()?;
        Ok(())
    }

    /// API base with a guaranteed trailing slash so relative joins keep the
    /// version segment.
    pub fn api_base(&self) -> Result<Url, AppError> {
        let raw = if self.api_base_url.ends_with('/') {
            self.api_base_url.clone()
        } else {
            format!("{}/", self.api_base_url)
        };
        Url::parse(&raw).map_err(|e| AppError::Config(format!("invalid api_base_url: {}", e)))
    }

    pub fn auth_endpoint(&self) -> Result<Url, AppError> {
        Url::parse(&self.auth_url)
            .map_err(|e| AppError::Config(format!("invalid auth_url: {}", e)))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.email.clone(), self.password.expose_secret())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
