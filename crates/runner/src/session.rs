//! Session lifecycle
//!
//! A session covers one test on one environment: open, any number of
//! checks, then close or abort. `SessionCore` owns the state machine and
//! the remote running-session handle; capability structs layer capture
//! strategies on top of it.

use crate::match_task::{CaptureProvider, CheckSettings, MatchExchange, MatchTask};
use async_trait::async_trait;
use ocular_common::{
    AppEnvironment, AppOutput, Config, Error, FailureReports, MatchResult, RectangleSize, Result,
    RunningSession, SessionStartInfo, SessionType, TestResults,
};
use ocular_transport::{MatchWindowData, ServerClient, Trigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

/// What a session can do, independent of how it captures output.
#[async_trait]
pub trait Session: Send {
    async fn open(
        &mut self,
        app_name: &str,
        test_name: &str,
        viewport: Option<RectangleSize>,
    ) -> Result<()>;
    async fn check(&mut self, settings: CheckSettings) -> Result<MatchResult>;
    async fn close(&mut self, throw_ex: bool) -> Result<TestResults>;
    /// Best effort. Never errors; a failed abort is logged and reported as
    /// `None`.
    async fn abort(&mut self) -> Option<TestResults>;
}

/// State machine shared by every session flavor.
pub struct SessionCore {
    client: Arc<ServerClient>,
    config: Config,
    state: SessionState,
    running: Option<RunningSession>,
    app_name: String,
    test_name: String,
    viewport: Option<RectangleSize>,
    session_type: SessionType,
    run_once_on_timeout: bool,
    user_inputs: Vec<Trigger>,
    last_output: Option<AppOutput>,
    opened_at: Option<Instant>,
}

impl SessionCore {
    pub fn new(client: Arc<ServerClient>, config: Config) -> Self {
        Self {
            client,
            config,
            state: SessionState::Closed,
            running: None,
            app_name: String::new(),
            test_name: String::new(),
            viewport: None,
            session_type: SessionType::Sequential,
            run_once_on_timeout: false,
            user_inputs: Vec::new(),
            last_output: None,
            opened_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn running_session(&self) -> Option<&RunningSession> {
        self.running.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn add_user_input(&mut self, trigger: Trigger) {
        self.user_inputs.push(trigger);
    }

    /// Open the session. A second open on a live session force-aborts the
    /// first and reports the conflict.
    pub async fn open(
        &mut self,
        app_name: &str,
        test_name: &str,
        viewport: Option<RectangleSize>,
        session_type: SessionType,
    ) -> Result<()> {
        if self.state == SessionState::Open {
            warn!(test = %test_name, "open called while a test is running; aborting it");
            self.abort().await;
            return Err(Error::TestAlreadyRunning);
        }

        self.app_name = app_name.to_string();
        self.test_name = test_name.to_string();
        self.viewport = viewport;
        self.session_type = session_type;
        self.run_once_on_timeout = false;
        self.user_inputs.clear();
        self.state = SessionState::Open;
        self.opened_at = Some(Instant::now());
        info!(app = %app_name, test = %test_name, "test opened");

        // With a known viewport the remote session starts eagerly; without
        // one it waits for the first check to supply the environment.
        if self.viewport.is_some() {
            self.ensure_running().await?;
        }
        Ok(())
    }

    fn start_info(&self) -> SessionStartInfo {
        SessionStartInfo {
            agent_id: self.config.agent_id.clone(),
            app_id_or_name: self.app_name.clone(),
            scenario_id_or_name: self.test_name.clone(),
            batch_info: self.config.batch.clone(),
            environment: AppEnvironment {
                display_size: self.viewport,
                inferred: None,
                os: None,
                hosting_app: None,
            },
            default_match_settings: self.config.default_match_settings.clone(),
            branch_name: self.config.branch_name.clone(),
            parent_branch_name: self.config.parent_branch_name.clone(),
            baseline_branch_name: self.config.baseline_branch_name.clone(),
            baseline_env_name: self.config.baseline_env_name.clone(),
            save_diffs: self.config.save_diffs,
            session_type: self.session_type,
        }
    }

    /// Start the remote session if it has not started yet.
    pub async fn ensure_running(&mut self) -> Result<&RunningSession> {
        if self.state != SessionState::Open {
            return Err(Error::NotOpen);
        }
        if self.running.is_none() {
            let session = self.client.start_session(&self.start_info()).await?;
            info!(session_id = %session.id, is_new = session.is_new, "remote session started");
            self.running = Some(session);
        }
        self.running
            .as_ref()
            .ok_or_else(|| Error::Internal("running session missing after start".into()))
    }

    /// Update the viewport used for environment inference. Only meaningful
    /// before the remote session starts.
    pub fn set_viewport(&mut self, viewport: RectangleSize) {
        if self.running.is_none() {
            self.viewport = Some(viewport);
        }
    }

    /// Run one check through the match retry loop.
    pub async fn check(
        &mut self,
        settings: CheckSettings,
        capture: &dyn CaptureProvider,
    ) -> Result<MatchResult> {
        if self.state != SessionState::Open {
            return Err(Error::NotOpen);
        }
        let session = self.ensure_running().await?.clone();

        let mut settings = settings;
        settings.user_inputs.append(&mut self.user_inputs);

        let (result, output) = {
            let exchange = SessionExchange {
                client: &self.client,
                session: &session,
            };
            let task = MatchTask::new(
                &exchange,
                capture,
                Duration::from_millis(self.config.match_timeout_ms),
            );
            task.match_window(&settings, self.run_once_on_timeout, self.last_output.as_ref())
                .await?
        };
        // Kept as the diff base for the next check on this session.
        self.last_output = Some(output);

        if !result.as_expected {
            debug!(tag = %settings.tag, "mismatch recorded");
            // Later checks of a knowingly-changed page match once, without
            // burning the full retry budget.
            self.run_once_on_timeout = true;
            if self.config.failure_reports == FailureReports::Immediate {
                return Err(Error::MismatchImmediate {
                    app_name: self.app_name.clone(),
                    test_name: self.test_name.clone(),
                });
            }
        }
        Ok(result)
    }

    /// End the session and fetch its results. With `throw_ex`, unresolved
    /// and failed outcomes are raised as typed errors carrying the results.
    pub async fn close(&mut self, throw_ex: bool) -> Result<TestResults> {
        if self.state != SessionState::Open {
            return Err(Error::NotOpen);
        }
        self.user_inputs.clear();

        let Some(session) = self.running.take() else {
            // Nothing ever reached the server; synthesize an empty passed
            // result without a round-trip.
            self.reset();
            let mut results = TestResults::empty(self.test_name.clone());
            results.app_name = self.app_name.clone();
            info!(test = %self.test_name, "test never started remotely; empty results");
            return Ok(results);
        };

        let stop = self
            .client
            .stop_session(
                &session,
                false,
                self.config.save_new_tests,
                self.config.save_failed_tests,
            )
            .await;
        let duration = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        self.reset();

        let mut results = stop?;
        results.is_new = session.is_new;
        results.url = session.url.clone();
        results.batch_id = Some(self.config.batch.id.clone());
        results.duration_ms = Some(duration.as_millis() as u64);
        results.classify();
        info!(
            test = %results.name,
            status = ?results.status,
            matches = results.matches,
            mismatches = results.mismatches,
            "test closed"
        );

        if throw_ex {
            if let Some(error) = Error::from_test_results(&results) {
                return Err(error);
            }
        }
        Ok(results)
    }

    /// Abort the session. Idempotent: with no remote session this is a
    /// local no-op, and transport failures are swallowed.
    pub async fn abort(&mut self) -> Option<TestResults> {
        let session = match self.running.take() {
            Some(session) => session,
            None => {
                self.reset();
                return None;
            }
        };
        let stopped = self.client.stop_session(&session, true, false, false).await;
        self.reset();
        match stopped {
            Ok(mut results) => {
                results.is_new = session.is_new;
                results.url = session.url;
                info!(test = %results.name, "test aborted");
                Some(results)
            }
            Err(error) => {
                warn!(%error, "abort failed; dropping session handle");
                None
            }
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Closed;
        self.running = None;
        self.run_once_on_timeout = false;
        self.last_output = None;
        self.opened_at = None;
    }
}

/// Match exchanges bound to one running session.
struct SessionExchange<'a> {
    client: &'a ServerClient,
    session: &'a RunningSession,
}

#[async_trait]
impl MatchExchange for SessionExchange<'_> {
    async fn perform_match(&self, data: MatchWindowData) -> Result<MatchResult> {
        self.client.match_window(self.session, &data).await
    }

    async fn perform_match_and_close(&self, data: MatchWindowData) -> Result<TestResults> {
        self.client.match_window_and_close(self.session, &data).await
    }
}

/// A session whose output comes straight from the embedding capture layer
/// (a local browser or image source).
pub struct ClassicSession {
    core: SessionCore,
    capture: Arc<dyn CaptureProvider>,
}

impl ClassicSession {
    pub fn new(client: Arc<ServerClient>, config: Config, capture: Arc<dyn CaptureProvider>) -> Self {
        Self {
            core: SessionCore::new(client, config),
            capture,
        }
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }
}

#[async_trait]
impl Session for ClassicSession {
    async fn open(
        &mut self,
        app_name: &str,
        test_name: &str,
        viewport: Option<RectangleSize>,
    ) -> Result<()> {
        self.core
            .open(app_name, test_name, viewport, SessionType::Sequential)
            .await
    }

    async fn check(&mut self, settings: CheckSettings) -> Result<MatchResult> {
        let capture = Arc::clone(&self.capture);
        self.core.check(settings, capture.as_ref()).await
    }

    async fn close(&mut self, throw_ex: bool) -> Result<TestResults> {
        self.core.close(throw_ex).await
    }

    async fn abort(&mut self) -> Option<TestResults> {
        self.core.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use parking_lot::Mutex;

    struct StaticCapture;

    #[async_trait]
    impl CaptureProvider for StaticCapture {
        async fn capture_output(
            &self,
            _settings: &CheckSettings,
            _last_output: Option<&AppOutput>,
        ) -> Result<AppOutput> {
            Ok(AppOutput::default())
        }
    }

    fn config_for(server: &MockServer) -> Config {
        let mut config = Config::default();
        config.api_key = "k".into();
        config.server_url = server.base_url();
        config.match_timeout_ms = 0;
        config
    }

    fn session_for(server: &MockServer) -> ClassicSession {
        let client = Arc::new(ServerClient::new(config_for(server)).unwrap());
        ClassicSession::new(client, config_for(server), Arc::new(StaticCapture))
    }

    async fn mock_start(server: &MockServer, is_new: bool) {
        server
            .mock_async(move |when, then| {
                when.method(POST).path("/api/sessions/running");
                then.status(200).json_body(serde_json::json!({
                    "id": "s1",
                    "isNew": is_new,
                    "url": "https://review/s1"
                }));
            })
            .await;
    }

    #[tokio::test]
    async fn double_open_aborts_and_reports_conflict() {
        let server = MockServer::start_async().await;
        let mut session = session_for(&server);

        session.open("app", "test", None).await.unwrap();
        let err = session.open("app", "test", None).await.unwrap_err();
        assert!(matches!(err, Error::TestAlreadyRunning));
    }

    #[tokio::test]
    async fn check_before_open_is_rejected() {
        let server = MockServer::start_async().await;
        let mut session = session_for(&server);
        let err = session.check(CheckSettings::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen));
    }

    #[tokio::test]
    async fn close_without_remote_session_is_empty_and_local() {
        let server = MockServer::start_async().await;
        let mut session = session_for(&server);

        session.open("app", "test", None).await.unwrap();
        let results = session.close(true).await.unwrap();

        assert!(results.is_empty);
        assert!(results.is_passed());
    }

    #[tokio::test]
    async fn lazy_start_happens_at_first_check() {
        let server = MockServer::start_async().await;
        mock_start(&server, false).await;
        let start = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/sessions/running/s1");
                then.status(200)
                    .json_body(serde_json::json!({"asExpected": true}));
            })
            .await;

        let mut session = session_for(&server);
        session.open("app", "test", None).await.unwrap();
        let result = session.check(CheckSettings::default()).await.unwrap();

        assert!(result.as_expected);
        start.assert_async().await;
    }

    #[tokio::test]
    async fn second_check_reuses_the_first_output_as_diff_base() {
        struct BaseTrackingCapture {
            saw_base: Mutex<Vec<bool>>,
        }

        #[async_trait]
        impl CaptureProvider for BaseTrackingCapture {
            async fn capture_output(
                &self,
                _settings: &CheckSettings,
                last_output: Option<&AppOutput>,
            ) -> Result<AppOutput> {
                self.saw_base.lock().push(last_output.is_some());
                Ok(AppOutput::default())
            }
        }

        let server = MockServer::start_async().await;
        mock_start(&server, false).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/sessions/running/s1");
                then.status(200)
                    .json_body(serde_json::json!({"asExpected": true}));
            })
            .await;

        let capture = Arc::new(BaseTrackingCapture {
            saw_base: Mutex::new(Vec::new()),
        });
        let client = Arc::new(ServerClient::new(config_for(&server)).unwrap());
        let mut session = ClassicSession::new(
            client,
            config_for(&server),
            Arc::clone(&capture) as Arc<dyn CaptureProvider>,
        );

        session.open("app", "test", None).await.unwrap();
        session.check(CheckSettings::default()).await.unwrap();
        session.check(CheckSettings::default()).await.unwrap();

        assert_eq!(*capture.saw_base.lock(), vec![false, true]);
    }

    #[tokio::test]
    async fn unresolved_new_close_raises_new_test() {
        let server = MockServer::start_async().await;
        mock_start(&server, true).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/sessions/running/s1");
                then.status(200)
                    .json_body(serde_json::json!({"asExpected": true}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/sessions/running/s1");
                then.status(200).json_body(serde_json::json!({
                    "name": "test",
                    "appName": "app",
                    "status": "Unresolved",
                    "missing": 0,
                    "mismatches": 0
                }));
            })
            .await;

        let mut session = session_for(&server);
        session
            .open("app", "test", Some(RectangleSize::new(800, 600)))
            .await
            .unwrap();
        session.check(CheckSettings::default()).await.unwrap();
        let err = session.close(true).await.unwrap_err();

        match err {
            Error::NewTest { results } => {
                assert!(results.is_new);
                assert_eq!(results.url.as_deref(), Some("https://review/s1"));
            }
            other => panic!("expected NewTest, got {other}"),
        }
    }

    #[tokio::test]
    async fn double_abort_makes_one_network_call() {
        let server = MockServer::start_async().await;
        mock_start(&server, false).await;
        let stop = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/api/sessions/running/s1")
                    .query_param("aborted", "true");
                then.status(200).json_body(serde_json::json!({
                    "name": "test",
                    "appName": "app",
                    "status": "Failed"
                }));
            })
            .await;

        let mut session = session_for(&server);
        session
            .open("app", "test", Some(RectangleSize::new(800, 600)))
            .await
            .unwrap();

        let first = session.abort().await;
        let second = session.abort().await;

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(stop.hits_async().await, 1);
    }

    #[tokio::test]
    async fn abort_swallows_transport_failure() {
        let server = MockServer::start_async().await;
        mock_start(&server, false).await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/sessions/running/s1");
                then.status(500);
            })
            .await;

        let mut session = session_for(&server);
        session
            .open("app", "test", Some(RectangleSize::new(800, 600)))
            .await
            .unwrap();
        assert!(session.abort().await.is_none());
    }
}
