//! Session-scoped authentication for the Hotjar API.
//!
//! One `AuthSession` is shared by every survey in a run. It logs in with
//! email/password on first use, caches the session cookie, and logs in again
//! when the cookie expires or the API rejects it.
//!
//! # Thread Safety
//!
//! - `session`: `RwLock` so concurrent requests read the cookie in parallel
//!   while a (re)login writes it exclusively.
//! - `login_lock`: `Mutex` serializing logins. Callers waiting on it re-check
//!   the session afterwards, so at most one login is in flight (single-flight).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cookie::time::OffsetDateTime;
use cookie::Cookie;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use url::Url;

use crate::error::AppError;
use crate::hotjar::http::{is_auth_rejection, send_logged, status_error, LoggingMode};
use crate::hotjar::retry::RetryPolicy;

/// Default lifetime assumed for a session when the cookies carry no Max-Age.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Longest lifetime trusted for a session, whatever the configuration says.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Login credentials. Loaded once at startup and never mutated.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An authenticated session: the cookie header plus its expiry hint.
#[derive(Clone)]
pub struct Session {
    cookie: SecretString,
    expires_at: Instant,
    generation: u64,
}

impl Session {
    /// Whether the session can still be used.
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }

    /// Increments on every successful login. Used to detect whether another
    /// caller already replaced a rejected session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn cookie_header(&self) -> Result<HeaderValue, AppError> {
        let mut value = HeaderValue::from_str(self.cookie.expose_secret())
            .map_err(|_| AppError::Protocol("session cookie is not a valid header".into()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cookie", &"[REDACTED]")
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct LoginRequest<'a> {
    action: &'static str,
    email: &'a str,
    password: &'a str,
    remember: bool,
}

/// What a successful login hands back.
#[derive(Debug)]
struct LoginGrant {
    cookie: String,
    max_age: Option<Duration>,
}

/// Collects `Set-Cookie` pairs into a single `Cookie` header value.
///
/// Cookies being cleared (`Max-Age<=0` or an `Expires` in the past) are
/// skipped. The shortest remaining lifetime becomes the expiry hint;
/// `Max-Age` wins over `Expires` on the same cookie.
fn parse_login_cookies(headers: &HeaderMap) -> Result<LoginGrant, AppError> {
    let now = OffsetDateTime::now_utc();
    let mut pairs: Vec<String> = Vec::new();
    let mut max_age: Option<Duration> = None;

    for value in headers.get_all(SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        let cookie = match Cookie::parse(raw) {
            Ok(cookie) => cookie,
            Err(e) => {
                warn!("[AUTH] Ignoring unparsable Set-Cookie: {}", e);
                continue;
            }
        };

        let lifetime = cookie
            .max_age()
            .or_else(|| cookie.expires_datetime().map(|at| at - now));

        if let Some(lifetime) = lifetime {
            if !lifetime.is_positive() {
                continue;
            }
            let age = Duration::from_secs(lifetime.whole_seconds().unsigned_abs());
            max_age = Some(max_age.map_or(age, |m| m.min(age)));
        }

        pairs.push(format!("{}={}", cookie.name(), cookie.value()));
    }

    if pairs.is_empty() {
        return Err(AppError::Protocol(
            "login response carried no session cookie".into(),
        ));
    }

    Ok(LoginGrant {
        cookie: pairs.join("; "),
        max_age,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// AuthSession
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the run's single authenticated session.
pub struct AuthSession {
    http: reqwest::Client,
    auth_url: Url,
    credentials: Credentials,
    session: RwLock<Option<Session>>,
    login_lock: Mutex<()>,
    retry: RetryPolicy,
    session_ttl: Duration,
    logging_mode: LoggingMode,
    logins: AtomicU64,
}

impl AuthSession {
    pub fn new(http: reqwest::Client, auth_url: Url, credentials: Credentials) -> Self {
        Self {
            http,
            auth_url,
            credentials,
            session: RwLock::new(None),
            login_lock: Mutex::new(()),
            retry: RetryPolicy::default(),
            session_ttl: DEFAULT_SESSION_TTL,
            logging_mode: LoggingMode::default(),
            logins: AtomicU64::new(0),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the assumed session lifetime, capped at `MAX_SESSION_TTL`.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl.min(MAX_SESSION_TTL);
        self
    }

    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    pub fn logging_mode(&self) -> LoggingMode {
        self.logging_mode
    }

    /// Number of successful logins performed so far.
    pub fn logins_performed(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    /// Returns the cached session if still valid, otherwise logs in.
    ///
    /// # Errors
    ///
    /// - `AppError::Authentication` - credentials rejected (never retried)
    /// - `AppError::TransientNetwork` - login kept failing after retries
    /// - `AppError::Protocol` - login succeeded but returned no cookie
    pub async fn ensure_session(&self) -> Result<Session, AppError> {
        if let Some(session) = self.current_valid().await {
            return Ok(session);
        }

        let _login_guard = self.login_lock.lock().await;

        // Double-check: another caller may have logged in while we waited
        if let Some(session) = self.current_valid().await {
            return Ok(session);
        }

        self.login_locked().await
    }

    /// Replaces a session the API rejected. If another caller already did so,
    /// the newer session is returned without logging in again.
    pub async fn refresh_after_rejection(&self, rejected: &Session) -> Result<Session, AppError> {
        let _login_guard = self.login_lock.lock().await;

        let current = self.session.read().await.clone();
        if let Some(current) = current {
            if current.generation != rejected.generation && current.is_valid() {
                info!("[AUTH] Session already refreshed by another caller");
                return Ok(current);
            }
        }

        self.login_locked().await
    }

    /// Sends a request carrying the session cookie.
    ///
    /// On 401/403 the session is refreshed and the request retried once.
    /// A second rejection is reported as `AppError::Authentication`.
    pub async fn send_authed(&self, method: Method, url: &Url) -> Result<reqwest::Response, AppError> {
        let session = self.ensure_session().await?;
        let response = self.send_with_session(method.clone(), url, &session).await?;

        if !is_auth_rejection(response.status()) {
            return Ok(response);
        }

        info!(
            "[AUTH] Received {}, refreshing session...",
            response.status().as_u16()
        );
        let refreshed = self.refresh_after_rejection(&session).await?;

        let retry_response = self.send_with_session(method, url, &refreshed).await?;
        if is_auth_rejection(retry_response.status()) {
            warn!("[AUTH] Still unauthorized after session refresh");
            return Err(AppError::Authentication(
                "session rejected after refresh".into(),
            ));
        }

        Ok(retry_response)
    }

    async fn send_with_session(
        &self,
        method: Method,
        url: &Url,
        session: &Session,
    ) -> Result<reqwest::Response, AppError> {
        let request = self
            .http
            .request(method.clone(), url.as_str())
            .header(COOKIE, session.cookie_header()?);
        send_logged(request, &method, url, self.logging_mode).await
    }

    async fn current_valid(&self) -> Option<Session> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_valid())
            .cloned()
    }

    /// Performs the login. Caller must hold `login_lock`.
    async fn login_locked(&self) -> Result<Session, AppError> {
        let previous_generation = self
            .session
            .read()
            .await
            .as_ref()
            .map_or(0, |s| s.generation);

        info!("[AUTH] Logging in...");
        let grant = self.retry.run("login", || self.login_once()).await?;

        let ttl = grant
            .max_age
            .map_or(self.session_ttl, |age| age.min(self.session_ttl));
        let session = Session {
            cookie: SecretString::from(grant.cookie),
            expires_at: Instant::now() + ttl,
            generation: previous_generation + 1,
        };

        *self.session.write().await = Some(session.clone());
        self.logins.fetch_add(1, Ordering::SeqCst);
        info!("[AUTH] Login successful (session #{})", session.generation);

        Ok(session)
    }

    async fn login_once(&self) -> Result<LoginGrant, AppError> {
        let body = LoginRequest {
            action: "login",
            email: &self.credentials.email,
            password: self.credentials.password.expose_secret(),
            remember: true,
        };

        let request = self.http.post(self.auth_url.as_str()).json(&body);
        let response = send_logged(request, &Method::POST, &self.auth_url, self.logging_mode).await?;
        let status = response.status();

        if status == StatusCode::BAD_REQUEST || is_auth_rejection(status) {
            error!("[AUTH] Login rejected: {}", status.as_u16());
            return Err(AppError::Authentication(format!(
                "login rejected with HTTP {}",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            return Err(status_error(status));
        }

        parse_login_cookies(response.headers())
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("auth_url", &self.auth_url.path())
            .field("credentials", &self.credentials)
            .field("logins", &self.logins_performed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(cookies: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for c in cookies {
            map.append(SET_COOKIE, HeaderValue::from_str(c).unwrap());
        }
        map
    }

    #[test]
    fn parses_cookie_pairs_and_shortest_max_age() {
        let grant = parse_login_cookies(&headers(&[
            "SESSION=abc; Path=/; HttpOnly; Max-Age=3600",
            "csrftoken=xyz; max-age=600; Secure",
            "_hjLocal=1",
        ]))
        .unwrap();

        assert_eq!(grant.cookie, "SESSION=abc; csrftoken=xyz; _hjLocal=1");
        assert_eq!(grant.max_age, Some(Duration::from_secs(600)));
    }

    #[test]
    fn skips_cleared_and_malformed_cookies() {
        let grant = parse_login_cookies(&headers(&[
            "old=gone; Max-Age=0",
            "novalue",
            "SESSION=abc",
        ]))
        .unwrap();

        assert_eq!(grant.cookie, "SESSION=abc");
        assert_eq!(grant.max_age, None);
    }

    #[test]
    fn expires_attribute_bounds_the_session() {
        let grant = parse_login_cookies(&headers(&[
            "old=gone; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
            "SESSION=abc; Expires=Fri, 01 Jan 2100 00:00:00 GMT; Path=/",
            "csrftoken=xyz; Max-Age=900; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
        ]))
        .unwrap();

        assert_eq!(grant.cookie, "SESSION=abc; csrftoken=xyz");
        assert_eq!(grant.max_age, Some(Duration::from_secs(900)));
    }

    #[test]
    fn attribute_spacing_and_case_do_not_leak_into_the_pair() {
        let grant =
            parse_login_cookies(&headers(&["SESSION=abc ;  PATH=/ ; max-AGE = 120 ; httponly"]))
                .unwrap();

        assert_eq!(grant.cookie, "SESSION=abc");
        assert_eq!(grant.max_age, Some(Duration::from_secs(120)));
    }

    #[test]
    fn no_cookie_is_protocol_error() {
        let result = parse_login_cookies(&HeaderMap::new());
        assert!(matches!(result, Err(AppError::Protocol(_))));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("ops@example.com", "hunter2");
        let out = format!("{:?}", creds);
        assert!(out.contains("ops@example.com"));
        assert!(!out.contains("hunter2"));
        assert!(out.contains("[REDACTED]"));
    }
}
