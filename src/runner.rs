//! Per-survey extraction pipeline.
//!
//! One run walks a strictly forward state machine:
//!
//! ```text
//! Start → Authenticated → ExportTriggered → ArchiveFetched → Decoded → Streaming → Done
//! ```
//!
//! Any unrecoverable error moves the run to `Failed(stage)`. Retries happen
//! inside the session and export layers, never by re-walking these states.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::SurveyDefinition;
use crate::config::Config;
use crate::error::{AppError, Stage, SurveyFailure};
use crate::hotjar::http::build_http_client;
use crate::hotjar::{AuthSession, ExportRequester};
use crate::streaming::{
    ArchiveDecoder, HeaderCollision, NormalizedRecord, RecordNormalizer, RecordStream,
};

// ─────────────────────────────────────────────────────────────────────────────
// RunState
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Authenticated,
    ExportTriggered,
    ArchiveFetched,
    Decoded,
    Streaming,
    Done,
    Failed(Stage),
}

impl RunState {
    /// Stage a failure in this state is attributed to.
    fn pending_stage(self) -> Stage {
        match self {
            RunState::Start => Stage::Auth,
            RunState::Authenticated => Stage::Trigger,
            RunState::ExportTriggered => Stage::Download,
            RunState::ArchiveFetched => Stage::Decode,
            RunState::Decoded | RunState::Streaming | RunState::Done => Stage::Parse,
            RunState::Failed(stage) => stage,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Start => f.write_str("start"),
            RunState::Authenticated => f.write_str("authenticated"),
            RunState::ExportTriggered => f.write_str("export-triggered"),
            RunState::ArchiveFetched => f.write_str("archive-fetched"),
            RunState::Decoded => f.write_str("decoded"),
            RunState::Streaming => f.write_str("streaming"),
            RunState::Done => f.write_str("done"),
            RunState::Failed(stage) => write!(f, "failed({})", stage),
        }
    }
}

/// Tracks one survey's state and turns errors into `SurveyFailure`.
struct RunTracker<'a> {
    survey: &'a SurveyDefinition,
    state: RunState,
}

impl<'a> RunTracker<'a> {
    fn new(survey: &'a SurveyDefinition) -> Self {
        Self {
            survey,
            state: RunState::Start,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!("[RUN] '{}': {} -> {}", self.survey.stream, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, source: AppError) -> SurveyFailure {
        let stage = self.state.pending_stage();
        self.advance(RunState::Failed(stage));
        failure(self.survey, stage, source)
    }
}

fn failure(survey: &SurveyDefinition, stage: Stage, source: AppError) -> SurveyFailure {
    SurveyFailure {
        stream: survey.stream.clone(),
        site_id: survey.site_id,
        survey_id: survey.survey_id,
        stage,
        source,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SurveyStreamRunner
// ─────────────────────────────────────────────────────────────────────────────

/// Runs the auth, trigger, download, decode and parse steps for one survey.
#[derive(Clone)]
pub struct SurveyStreamRunner {
    session: Arc<AuthSession>,
    exports: ExportRequester,
    decoder: ArchiveDecoder,
    normalizer: RecordNormalizer,
    cancel: CancellationToken,
}

impl SurveyStreamRunner {
    pub fn new(session: Arc<AuthSession>, exports: ExportRequester) -> Self {
        Self {
            session,
            exports,
            decoder: ArchiveDecoder::new(),
            normalizer: RecordNormalizer::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Wires the HTTP client, session and export requester from configuration.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let http = build_http_client(config.request_timeout())?;

        let session = Arc::new(
            AuthSession::new(http.clone(), config.auth_endpoint()?, config.credentials())
                .with_retry(config.retry)
                .with_session_ttl(config.session_ttl())
                .with_logging_mode(config.logging_mode),
        );
        let exports = ExportRequester::new(Arc::clone(&session), http, config.api_base()?)
            .with_retry(config.retry)
            .with_logging_mode(config.logging_mode);

        Ok(Self::new(session, exports))
    }

    pub fn with_normalizer(mut self, normalizer: RecordNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    /// Extracts one survey and returns its lazy record sequence.
    ///
    /// All network I/O happens here; the returned sequence only parses.
    pub async fn run(&self, survey: &SurveyDefinition) -> Result<SurveyExtraction, SurveyFailure> {
        let mut tracker = RunTracker::new(survey);
        info!(
            "[RUN] Starting '{}' (site {}, survey {})",
            survey.stream, survey.site_id, survey.survey_id
        );

        if let Err(e) = self.cancellable(self.session.ensure_session()).await {
            return Err(tracker.fail(e));
        }
        tracker.advance(RunState::Authenticated);

        let artifact = match self.cancellable(self.exports.trigger_export(survey)).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(tracker.fail(e)),
        };
        tracker.advance(RunState::ExportTriggered);

        let bytes = match self.cancellable(self.exports.download(artifact)).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(tracker.fail(e)),
        };
        tracker.advance(RunState::ArchiveFetched);

        if self.cancel.is_cancelled() {
            return Err(tracker.fail(AppError::Cancelled));
        }

        let text = match self.decoder.extract_csv(&bytes) {
            Ok(text) => text,
            Err(e) => return Err(tracker.fail(e)),
        };
        tracker.advance(RunState::Decoded);

        let records = match self.normalizer.parse(text, survey) {
            Ok(records) => records,
            Err(e) => return Err(tracker.fail(e)),
        };
        tracker.advance(RunState::Streaming);

        Ok(SurveyExtraction {
            survey: survey.clone(),
            records,
            state: tracker.state,
        })
    }

    /// Races `fut` against the run's cancellation token.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AppError::Cancelled),
            result = fut => result,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SurveyExtraction
// ─────────────────────────────────────────────────────────────────────────────

/// Records of one survey, produced lazily in CSV row order.
///
/// A row-level error ends the sequence with a `SurveyFailure` at the parse
/// stage.
pub struct SurveyExtraction {
    survey: SurveyDefinition,
    records: RecordStream,
    state: RunState,
}

impl SurveyExtraction {
    pub fn survey(&self) -> &SurveyDefinition {
        &self.survey
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn header_collisions(&self) -> &[HeaderCollision] {
        self.records.header_collisions()
    }

    pub fn schema_mismatches(&self) -> u64 {
        self.records.schema_mismatches()
    }

    pub fn rows_read(&self) -> u64 {
        self.records.rows_read()
    }
}

impl Iterator for SurveyExtraction {
    type Item = Result<NormalizedRecord, SurveyFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state.is_terminal() {
            return None;
        }

        match self.records.next() {
            Some(Ok(record)) => Some(Ok(record)),
            Some(Err(e)) => {
                self.state = RunState::Failed(Stage::Parse);
                warn!(
                    "[RUN] '{}' failed after {} rows",
                    self.survey.stream,
                    self.records.rows_read()
                );
                Some(Err(failure(&self.survey, Stage::Parse, e)))
            }
            None => {
                self.state = RunState::Done;
                info!(
                    "[RUN] Finished '{}': {} rows, {} schema mismatches",
                    self.survey.stream,
                    self.records.rows_read(),
                    self.records.schema_mismatches()
                );
                None
            }
        }
    }
}

impl std::iter::FusedIterator for SurveyExtraction {}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod wiremock_tests {
    use super::*;
    use crate::catalog::{ColumnDef, FieldType};
    use crate::hotjar::{Credentials, RetryPolicy};
    use crate::streaming::archive::test_support::zip_with;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const EXPORT_PATH: &str = "/api/v1/sites/1234/polls/5678/responses/export";

    fn survey() -> SurveyDefinition {
        SurveyDefinition::new(
            "b2b_us",
            1234,
            5678,
            vec![
                ColumnDef::new("Number", FieldType::Integer),
                ColumnDef::new("User", FieldType::String),
            ],
        )
    }

    fn runner(server: &MockServer) -> SurveyStreamRunner {
        let http = reqwest::Client::new();
        let retry = RetryPolicy::new(2, 1);
        let auth_url = Url::parse(&format!("{}/api/v2/users", server.uri())).unwrap();
        let session = Arc::new(
            AuthSession::new(http.clone(), auth_url, Credentials::new("ops@example.com", "pw"))
                .with_retry(retry),
        );
        let base = Url::parse(&format!("{}/api/v1/", server.uri())).unwrap();
        let exports = ExportRequester::new(Arc::clone(&session), http, base).with_retry(retry);
        SurveyStreamRunner::new(session, exports)
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v2/users"))
            .respond_with(ResponseTemplate::new(200).append_header("set-cookie", "SESSION=abc"))
            .mount(server)
            .await;
    }

    async fn mount_export(server: &MockServer, archive: Vec<u8>) {
        let download_url = format!("{}/downloads/y.zip", server.uri());
        Mock::given(method("GET"))
            .and(path(EXPORT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "download_url": download_url })),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/downloads/y.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn end_to_end_produces_typed_records() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_export(&server, zip_with("export.csv", b"Number,User\n1,alice\n")).await;

        let mut extraction = runner(&server).run(&survey()).await.unwrap();
        assert_eq!(extraction.state(), RunState::Streaming);

        let records: Vec<_> = extraction
            .by_ref()
            .map(|r| serde_json::Value::Object(r.unwrap()))
            .collect();

        assert_eq!(records, vec![json!({"Number": 1, "User": "alice"})]);
        assert_eq!(extraction.state(), RunState::Done);
        assert_eq!(extraction.rows_read(), 1);
        assert_eq!(extraction.survey().stream, "b2b_us");
    }

    #[tokio::test]
    async fn rows_keep_source_order() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_export(
            &server,
            zip_with("export.csv", b"Number,User\n3,c\n1,a\n2,b\n"),
        )
        .await;

        let numbers: Vec<i64> = runner(&server)
            .run(&survey())
            .await
            .unwrap()
            .map(|r| r.unwrap()["Number"].as_i64().unwrap())
            .collect();

        assert_eq!(numbers, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn bad_credentials_fail_at_auth_stage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/users"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(EXPORT_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let failure = runner(&server).run(&survey()).await.err().unwrap();

        assert_eq!(failure.stage, Stage::Auth);
        assert!(matches!(failure.source, AppError::Authentication(_)));
        let message = failure.to_string();
        assert!(message.contains("auth"));
        assert!(message.contains("5678"));
    }

    #[tokio::test]
    async fn missing_download_url_fails_at_trigger_stage() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path(EXPORT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "download_url": null })))
            .mount(&server)
            .await;

        let failure = runner(&server).run(&survey()).await.err().unwrap();

        assert_eq!(failure.stage, Stage::Trigger);
        assert!(failure.is_export_unavailable());
    }

    #[tokio::test]
    async fn broken_archive_fails_at_decode_stage() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_export(&server, b"definitely not a zip".to_vec()).await;

        let failure = runner(&server).run(&survey()).await.err().unwrap();

        assert_eq!(failure.stage, Stage::Decode);
        assert!(matches!(failure.source, AppError::MalformedArchive(_)));
    }

    #[tokio::test]
    async fn download_error_fails_at_download_stage() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        let download_url = format!("{}/downloads/gone.zip", server.uri());
        Mock::given(method("GET"))
            .and(path(EXPORT_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "download_url": download_url })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/downloads/gone.zip"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let failure = runner(&server).run(&survey()).await.err().unwrap();

        assert_eq!(failure.stage, Stage::Download);
        assert!(matches!(failure.source, AppError::RequestRejected { status: 410 }));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/users"))
            .respond_with(ResponseTemplate::new(200).append_header("set-cookie", "SESSION=abc"))
            .expect(0)
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        token.cancel();
        let failure = runner(&server)
            .with_cancellation(token)
            .run(&survey())
            .await
            .err()
            .unwrap();

        assert_eq!(failure.stage, Stage::Auth);
        assert!(matches!(failure.source, AppError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_interrupts_slow_trigger() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path(EXPORT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "download_url": "https://x/y.zip" }))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        let runner = runner(&server).with_cancellation(token.clone());
        let def = survey();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run(&def))
            .await
            .expect("run should stop promptly after cancellation");
        canceller.await.unwrap();

        let failure = result.err().unwrap();
        assert_eq!(failure.stage, Stage::Trigger);
        assert!(matches!(failure.source, AppError::Cancelled));
    }

    #[tokio::test]
    async fn reports_header_collisions_through_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_export(
            &server,
            zip_with("export.csv", "Number,User,Usér\n1,a,b\n".as_bytes()),
        )
        .await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let normalizer = RecordNormalizer::new().with_collision_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let extraction = runner(&server)
            .with_normalizer(normalizer)
            .run(&survey())
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(extraction.header_collisions().len(), 1);
        let records: Vec<_> = extraction.map(|r| r.unwrap()).collect();
        assert_eq!(records[0]["User"], json!("b"));
    }
}
