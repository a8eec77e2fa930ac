//! Client for the baseline service and the remote rendering service
//!
//! One send loop covers every outbound request: long-request continuation,
//! concurrency backoff, generic retry, and terminal classification (401,
//! 410, opt-out 404).

use crate::api::*;
use crate::retry::{
    is_retryable_status, is_retryable_transport_error, retry_after_delay, schedule_delay,
    RetryPolicy, CONCURRENCY_BACKOFF, DELAY_BEFORE_POLLING,
};
use bytes::Bytes;
use ocular_common::{Config, Error, MatchResult, Result, RunningSession, TestResults};
use parking_lot::RwLock;
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const CLIENT_ID_HEADER: &str = "x-ocular-client";
const REQUEST_ID_HEADER: &str = "x-ocular-client-request-id";
const EXPECT_HEADER: &str = "ocular-expect";
const EXPECT_VERSION_HEADER: &str = "ocular-expect-version";
const DATE_HEADER: &str = "ocular-date";

/// Reduced timeout for render-status polls, distinct from the default
/// request timeout.
const RENDER_STATUS_TIMEOUT: Duration = Duration::from_secs(15);
const RENDER_STATUS_RETRY: RetryPolicy = RetryPolicy {
    retries: 3,
    delay_before_retry: Duration::from_millis(500),
};

/// Whether the server supports the combined match-and-close endpoint.
/// Probed once per connection; a 404 is the "unsupported" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CombinedEndpoint {
    Unknown,
    Supported,
    Unsupported,
}

/// Response surfaced to endpoint methods after the resilience layer is done
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: header::HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Request {
            name: name.to_string(),
            reason: format!("invalid response body: {e}"),
        })
    }
}

enum RequestBody {
    None,
    Json(serde_json::Value),
    Bytes { data: Vec<u8>, content_type: String },
}

struct RequestSpec {
    name: &'static str,
    method: Method,
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(&'static str, String)>,
    body: RequestBody,
    with_api_key: bool,
    dont_retry_on_404: bool,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl RequestSpec {
    fn new(name: &'static str, method: Method, url: String) -> Self {
        Self {
            name,
            method,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::None,
            with_api_key: true,
            dont_retry_on_404: false,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn json<T: serde::Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    fn bytes(mut self, data: Vec<u8>, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Bytes {
            data,
            content_type: content_type.into(),
        };
        self
    }

    fn without_api_key(mut self) -> Self {
        self.with_api_key = false;
        self
    }

    fn dont_retry_on_404(mut self) -> Self {
        self.dont_retry_on_404 = true;
        self
    }
}

/// Provides an API for communication with the Ocular baseline server and
/// the rendering grid.
pub struct ServerClient {
    http: reqwest::Client,
    config: Config,
    run_id: String,
    request_counter: AtomicU64,
    rendering_info: RwLock<Option<RenderingInfo>>,
    combined_endpoint: AtomicU8,
}

impl ServerClient {
    pub fn new(config: Config) -> Result<Self> {
        if config.server_url.is_empty() {
            return Err(Error::InvalidConfig("server URL is missing".into()));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.connection_timeout_ms));
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy).map_err(|e| {
                Error::InvalidConfig(format!("invalid proxy {proxy}: {e}"))
            })?);
        }
        let http = builder.build().map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            http,
            config,
            run_id: Uuid::new_v4().to_string(),
            request_counter: AtomicU64::new(0),
            rendering_info: RwLock::new(None),
            combined_endpoint: AtomicU8::new(CombinedEndpoint::Unknown as u8),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rendering_info(&self) -> Option<RenderingInfo> {
        self.rendering_info.read().clone()
    }

    pub fn set_rendering_info(&self, info: RenderingInfo) {
        *self.rendering_info.write() = Some(info);
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}--{}", n, self.run_id)
    }

    fn sessions_url(&self, suffix: &str) -> String {
        let base = self.config.server_url.trim_end_matches('/');
        format!("{base}/api/sessions{suffix}")
    }

    fn render_url(&self, suffix: &str) -> Result<String> {
        let info = self.rendering_info.read();
        let info = info.as_ref().ok_or_else(|| {
            Error::Internal("rendering info not fetched before render call".into())
        })?;
        let base = info.service_url.trim_end_matches('/');
        Ok(format!("{base}{suffix}"))
    }

    fn render_auth(&self) -> Result<String> {
        let info = self.rendering_info.read();
        Ok(info
            .as_ref()
            .ok_or_else(|| Error::Internal("rendering info not fetched".into()))?
            .access_token
            .clone())
    }

    // ------------------------------------------------------------------
    // Send loop
    // ------------------------------------------------------------------

    async fn send(&self, spec: RequestSpec) -> Result<ApiResponse> {
        let request_id = self.next_request_id();
        let original_request_id = request_id.clone();
        let mut retries_left = spec.retry.retries;
        // 503 backoff keeps its own counter so it never interferes with the
        // generic retry budget.
        let mut concurrency_attempt: Option<usize> = None;
        let mut delay = Duration::ZERO;

        loop {
            if !delay.is_zero() {
                debug!(name = spec.name, ?delay, "request delayed");
                tokio::time::sleep(delay).await;
            }

            let response = match self.execute(&spec, &original_request_id, false).await {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_transport_error(&err) && retries_left > 0 {
                        retries_left -= 1;
                        delay = spec.retry.delay_before_retry;
                        warn!(name = spec.name, error = %err, retries_left, "transport error, retrying");
                        continue;
                    }
                    return Err(Error::Request {
                        name: spec.name.to_string(),
                        reason: err.to_string(),
                    });
                }
            };

            let status = response.status();
            debug!(name = spec.name, request_id = %original_request_id, %status, "response");

            if status == StatusCode::UNAUTHORIZED && spec.with_api_key {
                return Err(Error::IncorrectApiKey);
            }

            if status == StatusCode::ACCEPTED {
                if let Some(location) = header_str(response.headers(), header::LOCATION) {
                    let first_delay = retry_after_delay(response.headers());
                    return self.poll_long_request(spec.name, location, first_delay).await;
                }
            }

            if status == StatusCode::SERVICE_UNAVAILABLE {
                let attempt = concurrency_attempt.map(|a| a + 1).unwrap_or(0);
                concurrency_attempt = Some(attempt);
                // The backoff resubmits the original request with a fresh
                // generic-retry budget.
                retries_left = spec.retry.retries;
                delay = schedule_delay(CONCURRENCY_BACKOFF, attempt);
                debug!(name = spec.name, attempt, "concurrency blocked, backing off");
                continue;
            }

            if status == StatusCode::NOT_FOUND && spec.dont_retry_on_404 {
                return Ok(into_api_response(response).await?);
            }

            if is_retryable_status(status) && retries_left > 0 {
                retries_left -= 1;
                delay = retry_after_delay(response.headers())
                    .unwrap_or(spec.retry.delay_before_retry);
                warn!(name = spec.name, %status, retries_left, "transient failure, retrying");
                continue;
            }

            return Ok(into_api_response(response).await?);
        }
    }

    /// Poll the Location of a 202 response until the task finishes.
    /// 200 ends polling, 201 takes one more fetch-result hop, 410 means the
    /// server task is gone.
    async fn poll_long_request(
        &self,
        name: &'static str,
        location: String,
        first_delay: Option<Duration>,
    ) -> Result<ApiResponse> {
        let mut url = location;
        let mut attempt = 0usize;
        let mut delay = first_delay.unwrap_or_else(|| schedule_delay(DELAY_BEFORE_POLLING, 0));

        loop {
            tokio::time::sleep(delay).await;

            let spec = RequestSpec::new(name, Method::GET, url.clone());
            let response = self
                .execute(&spec, &self.next_request_id(), true)
                .await
                .map_err(|e| Error::Request {
                    name: name.to_string(),
                    reason: format!("long request polling failed: {e}"),
                })?;

            match response.status() {
                StatusCode::OK => return Ok(into_api_response(response).await?),
                StatusCode::CREATED => {
                    // Task done; fetch the result from the final location.
                    let result_url = header_str(response.headers(), header::LOCATION)
                        .unwrap_or_else(|| url.clone());
                    let spec = RequestSpec::new(name, Method::DELETE, result_url)
                        .header(DATE_HEADER, chrono::Utc::now().to_rfc2822());
                    let response = self
                        .execute(&spec, &self.next_request_id(), true)
                        .await
                        .map_err(|e| Error::Request {
                            name: name.to_string(),
                            reason: format!("long request result fetch failed: {e}"),
                        })?;
                    return Ok(into_api_response(response).await?);
                }
                StatusCode::GONE => return Err(Error::ServerGone),
                StatusCode::ACCEPTED => {
                    if let Some(next) = header_str(response.headers(), header::LOCATION) {
                        url = next;
                    }
                    attempt += 1;
                    delay = retry_after_delay(response.headers())
                        .unwrap_or_else(|| schedule_delay(DELAY_BEFORE_POLLING, attempt));
                }
                status => {
                    return Err(Error::Request {
                        name: name.to_string(),
                        reason: format!("unexpected status {status} during long request"),
                    })
                }
            }
        }
    }

    async fn execute(
        &self,
        spec: &RequestSpec,
        request_id: &str,
        is_polling: bool,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut request = self.http.request(spec.method.clone(), &spec.url);

        if spec.with_api_key && !self.config.api_key.is_empty() {
            request = request.query(&[("apiKey", self.config.api_key.as_str())]);
        }
        for (key, value) in &spec.query {
            request = request.query(&[(key.as_str(), value.as_str())]);
        }

        request = request
            .header(CLIENT_ID_HEADER, &self.config.agent_id)
            .header(REQUEST_ID_HEADER, request_id)
            .header(header::ACCEPT, "application/json");

        // Polling sub-requests must not renegotiate long-running handling.
        if !is_polling {
            request = request
                .header(EXPECT_HEADER, "202+location")
                .header(EXPECT_VERSION_HEADER, "2")
                .header(DATE_HEADER, chrono::Utc::now().to_rfc2822());
        }

        for (name, value) in &spec.headers {
            request = request.header(*name, value);
        }

        match &spec.body {
            RequestBody::None => {}
            RequestBody::Json(value) => {
                request = request.json(value);
            }
            RequestBody::Bytes { data, content_type } => {
                request = request
                    .header(header::CONTENT_TYPE, content_type.as_str())
                    .body(data.clone());
            }
        }

        if let Some(timeout) = spec.timeout {
            request = request.timeout(timeout);
        }

        request.send().await
    }

    // ------------------------------------------------------------------
    // Baseline service endpoints
    // ------------------------------------------------------------------

    /// Start a new running session, linking to an existing baseline when
    /// one matches the start descriptor.
    pub async fn start_session(&self, start_info: &ocular_common::SessionStartInfo) -> Result<RunningSession> {
        debug!(app = %start_info.app_id_or_name, test = %start_info.scenario_id_or_name, "start session");

        let spec = RequestSpec::new("startSession", Method::POST, self.sessions_url("/running"))
            .json(&StartSessionRequest {
                start_info: start_info.clone(),
            })?;
        let response = self.send(spec).await?;

        match response.status {
            StatusCode::OK | StatusCode::CREATED => {
                let mut session: RunningSession = response.json("startSession")?;
                // Outdated servers omit isNew; 201 means a baseline did not
                // exist yet.
                if !serde_json::from_slice::<serde_json::Value>(&response.body)
                    .map(|v| v.get("isNew").is_some())
                    .unwrap_or(false)
                {
                    session.is_new = response.status == StatusCode::CREATED;
                }
                debug!(session_id = %session.id, is_new = session.is_new, "session started");
                Ok(session)
            }
            status => Err(Error::Request {
                name: "startSession".into(),
                reason: format!("unexpected status {status}"),
            }),
        }
    }

    /// Stop a running session; `aborted` marks the session as aborted
    /// rather than completed.
    pub async fn stop_session(
        &self,
        session: &RunningSession,
        aborted: bool,
        update_baseline_if_new: bool,
        update_baseline_if_different: bool,
    ) -> Result<TestResults> {
        debug!(session_id = %session.id, aborted, "stop session");

        let update_baseline = if session.is_new {
            update_baseline_if_new
        } else {
            update_baseline_if_different
        };

        let url = self.sessions_url(&format!("/running/{}", urlencoding::encode(&session.id)));
        let spec = RequestSpec::new("stopSession", Method::DELETE, url)
            .query("aborted", aborted)
            .query("updateBaseline", update_baseline);
        let response = self.send(spec).await?;

        if response.status == StatusCode::OK {
            response.json("stopSession")
        } else {
            Err(Error::Request {
                name: "stopSession".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    /// Match the captured output against the session baseline.
    pub async fn match_window(
        &self,
        session: &RunningSession,
        data: &MatchWindowData,
    ) -> Result<MatchResult> {
        let url = self.sessions_url(&format!("/running/{}", urlencoding::encode(&session.id)));
        let spec = self.match_request("matchWindow", url, data)?;
        let response = self.send(spec).await?;

        if response.status == StatusCode::OK {
            response.json("matchWindow")
        } else {
            Err(Error::Request {
                name: "matchWindow".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    /// Match and finalize the session in one request. Falls back to a plain
    /// match plus explicit stop when the server lacks the combined
    /// endpoint; the capability is remembered per connection.
    pub async fn match_window_and_close(
        &self,
        session: &RunningSession,
        data: &MatchWindowData,
    ) -> Result<TestResults> {
        if self.combined_endpoint() == CombinedEndpoint::Unsupported {
            return self.match_and_stop_fallback(session, data).await;
        }

        let url = self.sessions_url(&format!(
            "/running/{}/matchandend",
            urlencoding::encode(&session.id)
        ));
        let spec = self
            .match_request("matchWindowAndClose", url, data)?
            .dont_retry_on_404();
        let response = self.send(spec).await?;

        match response.status {
            StatusCode::OK => {
                self.set_combined_endpoint(CombinedEndpoint::Supported);
                response.json("matchWindowAndClose")
            }
            StatusCode::NOT_FOUND => {
                debug!("matchandend endpoint not found, using match+stop fallback");
                self.set_combined_endpoint(CombinedEndpoint::Unsupported);
                self.match_and_stop_fallback(session, data).await
            }
            status => Err(Error::Request {
                name: "matchWindowAndClose".into(),
                reason: format!("unexpected status {status}"),
            }),
        }
    }

    async fn match_and_stop_fallback(
        &self,
        session: &RunningSession,
        data: &MatchWindowData,
    ) -> Result<TestResults> {
        self.match_window(session, data).await?;
        self.stop_session(
            session,
            false,
            data.update_baseline_if_new.unwrap_or(false),
            data.update_baseline_if_different.unwrap_or(false),
        )
        .await
    }

    fn match_request(
        &self,
        name: &'static str,
        url: String,
        data: &MatchWindowData,
    ) -> Result<RequestSpec> {
        let spec = RequestSpec::new(name, Method::POST, url);
        // Inline image bytes switch the body to octet-stream framing: a
        // 4-byte big-endian JSON length prefix, the JSON, then the image.
        if let Some(screenshot) = &data.app_output.screenshot_bytes {
            let json = serde_json::to_vec(data)?;
            let mut body = Vec::with_capacity(4 + json.len() + screenshot.len());
            body.extend_from_slice(&(json.len() as u32).to_be_bytes());
            body.extend_from_slice(&json);
            body.extend_from_slice(screenshot);
            Ok(spec.bytes(body, "application/octet-stream"))
        } else {
            spec.json(data)
        }
    }

    /// Close every session in a batch by its pointer id. Best effort at
    /// runner teardown.
    pub async fn delete_batch_sessions(&self, batch_id: &str) -> Result<()> {
        let url = self.sessions_url(&format!(
            "/batches/{}/close/bypointerid",
            urlencoding::encode(batch_id)
        ));
        let response = self.send(RequestSpec::new("deleteBatchSessions", Method::DELETE, url)).await?;
        if response.status == StatusCode::OK {
            Ok(())
        } else {
            Err(Error::Request {
                name: "deleteBatchSessions".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    /// Fetch (and cache) rendering-service connection details.
    pub async fn render_info(&self) -> Result<RenderingInfo> {
        if let Some(info) = self.rendering_info() {
            return Ok(info);
        }
        let spec = RequestSpec::new("renderInfo", Method::GET, self.sessions_url("/renderinfo"));
        let response = self.send(spec).await?;
        if response.status == StatusCode::OK {
            let info: RenderingInfo = response.json("renderInfo")?;
            self.set_rendering_info(info.clone());
            Ok(info)
        } else {
            Err(Error::Request {
                name: "renderInfo".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    // ------------------------------------------------------------------
    // Rendering service endpoints
    // ------------------------------------------------------------------

    /// Submit a batch of render jobs.
    pub async fn render(&self, requests: &[RenderRequest]) -> Result<Vec<RunningRender>> {
        let spec = RequestSpec::new("render", Method::POST, self.render_url("/render")?)
            .without_api_key()
            .header("x-auth-token", self.render_auth()?)
            .json(&requests)?;
        let response = self.send(spec).await?;
        if response.status == StatusCode::OK {
            response.json("render")
        } else {
            Err(Error::Request {
                name: "render".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    /// Poll render status for a batch of render ids. Carries a reduced
    /// timeout and a smaller retry budget than ordinary requests.
    pub async fn render_status(&self, render_ids: &[String]) -> Result<Vec<RenderStatusResult>> {
        let mut spec = RequestSpec::new("renderStatus", Method::POST, self.render_url("/render-status")?)
            .without_api_key()
            .header("x-auth-token", self.render_auth()?)
            .json(&render_ids)?;
        spec.retry = RENDER_STATUS_RETRY;
        spec.timeout = Some(RENDER_STATUS_TIMEOUT);
        let response = self.send(spec).await?;
        if response.status == StatusCode::OK {
            response.json("renderStatus")
        } else {
            Err(Error::Request {
                name: "renderStatus".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    /// Ask which of the given content hashes the rendering service already
    /// stores.
    pub async fn check_resources(&self, hashes: &[ResourceRef]) -> Result<Vec<bool>> {
        let spec = RequestSpec::new(
            "checkResources",
            Method::POST,
            self.render_url("/resources/query/resources-exist/")?,
        )
        .without_api_key()
        .header("x-auth-token", self.render_auth()?)
        .query("render-id", Uuid::new_v4())
        .json(&hashes)?;
        let response = self.send(spec).await?;
        if response.status == StatusCode::OK {
            response.json("checkResources")
        } else {
            Err(Error::Request {
                name: "checkResources".into(),
                reason: format!("unexpected status {}", response.status),
            })
        }
    }

    /// Upload one resource's raw bytes under its sha256 hash.
    pub async fn put_resource(&self, hash: &str, content_type: &str, value: Vec<u8>) -> Result<()> {
        let spec = RequestSpec::new(
            "putResource",
            Method::PUT,
            self.render_url(&format!("/resources/sha256/{hash}"))?,
        )
        .without_api_key()
        .header("x-auth-token", self.render_auth()?)
        .query("render-id", Uuid::new_v4())
        .bytes(value, content_type.to_string());
        let response = self.send(spec).await?;
        if response.status == StatusCode::OK {
            Ok(())
        } else {
            Err(Error::Request {
                name: "putResource".into(),
                reason: format!("unexpected status {} for resource {hash}", response.status),
            })
        }
    }

    fn combined_endpoint(&self) -> CombinedEndpoint {
        match self.combined_endpoint.load(Ordering::Relaxed) {
            x if x == CombinedEndpoint::Supported as u8 => CombinedEndpoint::Supported,
            x if x == CombinedEndpoint::Unsupported as u8 => CombinedEndpoint::Unsupported,
            _ => CombinedEndpoint::Unknown,
        }
    }

    fn set_combined_endpoint(&self, state: CombinedEndpoint) {
        self.combined_endpoint.store(state as u8, Ordering::Relaxed);
    }
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

async fn into_api_response(response: reqwest::Response) -> Result<ApiResponse> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| Error::Request {
        name: "response".into(),
        reason: format!("failed reading body: {e}"),
    })?;
    Ok(ApiResponse {
        status,
        headers,
        body,
    })
}
