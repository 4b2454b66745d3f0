//! The stub server.
//!
//! [`StubState`] holds mappings and the journal and answers requests;
//! [`StubServer`] owns the axum listener in front of it.

use crate::config::{
    RequestPattern, ResponseBody, ResponseDefinition, ServerOptions, StubDefinition,
    StubServerConfig,
};
use crate::error::StubError;
use crate::journal::{CountMatcher, LoggedRequest, RequestJournal};
use crate::matcher::{CompiledPattern, MatchContext};
use crate::registry::{MappingId, MatchResult, NearMiss, StubMapping, StubRegistry};
use crate::template::TemplateEngine;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Header naming the mapping that served a response.
pub const MATCHED_STUB_NAME: &str = "Matched-Stub-Name";
/// Header carrying the id of the mapping that served a response.
pub const MATCHED_STUB_ID: &str = "Matched-Stub-Id";

const NEAR_MISS_LIMIT: usize = 3;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A response produced by the stub engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubResponse {
    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn text(status: u16, body: String) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: body.into_bytes(),
        }
    }
}

impl IntoResponse for StubResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Body::from(self.body)).into_response();
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Dropping invalid response header"),
            }
        }
        response
    }
}

/// Shared state behind the listener: mappings, journal and counters.
pub struct StubState {
    options: ServerOptions,
    default_response: Option<ResponseDefinition>,
    registry: RwLock<StubRegistry>,
    journal: RequestJournal,
    templates: TemplateEngine,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
}

impl StubState {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            default_response: None,
            registry: RwLock::new(StubRegistry::new()),
            journal: RequestJournal::new(),
            templates: TemplateEngine::new(),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Build state from a configuration file's contents.
    pub fn from_config(config: StubServerConfig) -> Result<Self, StubError> {
        config.validate()?;

        let mut registry = StubRegistry::new();
        for stub in config.stubs {
            registry.insert(stub)?;
        }

        info!(
            stubs = registry.len(),
            default_response = config.default_response.is_some(),
            "Stub state initialized"
        );

        let mut state = Self::new(config.server);
        state.registry = RwLock::new(registry);
        state.default_response = config.default_response;
        Ok(state)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Register a stub mapping.
    pub async fn register(&self, stub: StubDefinition) -> Result<StubMapping, StubError> {
        let mapping = self.registry.write().await.insert(stub)?;
        debug!(
            stub_id = %mapping.id,
            name = mapping.name.as_deref().unwrap_or(""),
            "Registered stub"
        );
        Ok(mapping.as_ref().clone())
    }

    /// Remove a single mapping.
    pub async fn remove(&self, id: MappingId) -> Option<StubMapping> {
        self.registry
            .write()
            .await
            .remove(id)
            .map(|m| m.as_ref().clone())
    }

    /// Registered mappings in registration order.
    pub async fn mappings(&self) -> Vec<StubMapping> {
        self.registry
            .read()
            .await
            .mappings()
            .iter()
            .map(|m| m.as_ref().clone())
            .collect()
    }

    pub async fn find_by_name(&self, name: &str) -> Option<StubMapping> {
        self.registry
            .read()
            .await
            .find_by_name(name)
            .map(|m| m.as_ref().clone())
    }

    /// Match a request without serving or journaling it.
    pub async fn match_request(&self, request: &LoggedRequest) -> Result<MatchResult, StubError> {
        self.registry
            .read()
            .await
            .find_match(request)
            .ok_or_else(|| StubError::NoStubMatch {
                method: request.method.clone(),
                url: request.url.clone(),
            })
    }

    /// Journal a request and answer it.
    pub async fn handle(&self, mut request: LoggedRequest) -> StubResponse {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if self.options.verbose {
            info!(
                method = %request.method,
                url = %request.url,
                headers = ?request.headers,
                body_len = request.body.len(),
                "Request received"
            );
        }

        // Journaled under the registry guard so a reset cannot land between
        // matching and recording.
        let (matched, near_misses) = {
            let registry = self.registry.read().await;
            let outcome = match registry.find_match(&request) {
                Some(result) => (Some(result), Vec::new()),
                None => (None, registry.near_misses(&request, NEAR_MISS_LIMIT)),
            };
            request.matched_stub = outcome.0.as_ref().map(|result| result.mapping.id);
            self.journal.record(request.clone()).await;
            outcome
        };

        match matched {
            Some(result) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);

                if self.options.log_matches {
                    info!(
                        stub_id = %result.mapping.id,
                        name = result.mapping.name.as_deref().unwrap_or(""),
                        method = %request.method,
                        url = %request.url,
                        "Request matched stub"
                    );
                }

                self.build_response(&result.mapping, &result.context, &request)
                    .await
            }
            None => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);

                if self.options.log_unmatched {
                    warn!(
                        method = %request.method,
                        url = %request.url,
                        near_misses = near_misses.len(),
                        "No matching stub found"
                    );
                }

                self.build_unmatched_response(&request, &near_misses)
            }
        }
    }

    async fn build_response(
        &self,
        mapping: &StubMapping,
        match_ctx: &MatchContext,
        request: &LoggedRequest,
    ) -> StubResponse {
        let response = &mapping.response;

        if response.fixed_delay_ms > 0 {
            debug!(stub_id = %mapping.id, delay_ms = response.fixed_delay_ms, "Applying delay");
            tokio::time::sleep(Duration::from_millis(response.fixed_delay_ms)).await;
        }

        let body = match &response.body {
            Some(body) if response.template => self.render_body(body, match_ctx, request),
            Some(body) => body.to_bytes(),
            None => Ok(Vec::new()),
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(stub_id = %mapping.id, error = %e, "Failed to build stub body");
                return StubResponse::text(
                    500,
                    format!("Stub {} could not produce a body: {}", mapping.id, e),
                );
            }
        };

        let mut headers = self.scripted_headers(response);
        headers.push((MATCHED_STUB_ID.to_string(), mapping.id.to_string()));
        if let Some(name) = &mapping.name {
            headers.push((MATCHED_STUB_NAME.to_string(), name.clone()));
        }

        StubResponse {
            status: response.status,
            headers,
            body,
        }
    }

    fn render_body(
        &self,
        body: &ResponseBody,
        match_ctx: &MatchContext,
        request: &LoggedRequest,
    ) -> Result<Vec<u8>, StubError> {
        let rendered = match body {
            ResponseBody::Text { content } => self
                .templates
                .render(content, match_ctx, request)
                .map(String::into_bytes),
            ResponseBody::Json { content } => self
                .templates
                .render_json(content, match_ctx, request)
                .map(|v| v.to_string().into_bytes()),
            ResponseBody::Base64 { .. } => return body.to_bytes(),
        };
        rendered.map_err(|e| StubError::malformed(format!("template error: {}", e)))
    }

    /// Content-Type first, then the remaining scripted headers.
    fn scripted_headers(&self, response: &ResponseDefinition) -> Vec<(String, String)> {
        let content_type = response
            .header("content-type")
            .map(str::to_string)
            .or_else(|| response.body.as_ref().map(|b| b.content_type().to_string()))
            .unwrap_or_else(|| self.options.default_content_type.clone());

        let mut headers = vec![("Content-Type".to_string(), content_type)];
        headers.extend(
            response
                .headers
                .iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        headers
    }

    fn build_unmatched_response(
        &self,
        request: &LoggedRequest,
        near_misses: &[NearMiss],
    ) -> StubResponse {
        if let Some(default) = &self.default_response {
            let body = default
                .body
                .as_ref()
                .and_then(|b| b.to_bytes().ok())
                .unwrap_or_default();
            return StubResponse {
                status: default.status,
                headers: self.scripted_headers(default),
                body,
            };
        }

        StubResponse::text(404, describe_unmatched(request, near_misses))
    }

    /// Check the journal against a pattern and expected count.
    pub async fn verify(
        &self,
        pattern: &RequestPattern,
        expected: CountMatcher,
    ) -> Result<(), StubError> {
        let compiled = CompiledPattern::compile(pattern)?;
        let recorded = self.journal.entries().await;
        let actual = recorded.iter().filter(|r| compiled.matches(r)).count();

        if expected.matches(actual) {
            return Ok(());
        }
        Err(StubError::Verification {
            expected,
            actual,
            pattern: compiled.describe(),
            recorded: recorded.iter().map(|r| format!("  {}", r.summary())).collect(),
        })
    }

    /// Verify that at least one matching request was received.
    pub async fn verify_called(&self, pattern: &RequestPattern) -> Result<(), StubError> {
        self.verify(pattern, CountMatcher::AtLeast(1)).await
    }

    /// Journal entries matching a pattern.
    pub async fn find_requests(
        &self,
        pattern: &RequestPattern,
    ) -> Result<Vec<LoggedRequest>, StubError> {
        let compiled = CompiledPattern::compile(pattern)?;
        Ok(self.journal.find(&compiled).await)
    }

    pub async fn requests(&self) -> Vec<LoggedRequest> {
        self.journal.entries().await
    }

    pub async fn unmatched_requests(&self) -> Vec<LoggedRequest> {
        self.journal.unmatched().await
    }

    /// Clear mappings and journal.
    pub async fn reset(&self) {
        let mut registry = self.registry.write().await;
        registry.clear();
        self.journal.clear().await;
        debug!("Stub state reset");
    }

    /// Clear only the journal.
    pub async fn reset_requests(&self) {
        // Wait out requests that are mid-journal.
        let _registry = self.registry.write().await;
        self.journal.clear().await;
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }
}

fn describe_unmatched(request: &LoggedRequest, near_misses: &[NearMiss]) -> String {
    let mut out = String::from("Request was not matched\n=======================\n\n");
    out.push_str(&format!("{} {}\n", request.method, request.url));

    let mut headers: Vec<_> = request.headers.iter().collect();
    headers.sort();
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\n", name, value));
    }
    if let Some(body) = request.body_text().filter(|b| !b.is_empty()) {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }

    if near_misses.is_empty() {
        out.push_str("\nNo stub mappings are registered.\n");
        return out;
    }

    out.push_str("\nClosest stub mappings:\n");
    for miss in near_misses {
        match &miss.mapping.name {
            Some(name) => out.push_str(&format!("- stub {} ({})\n", miss.mapping.id, name)),
            None => out.push_str(&format!("- stub {}\n", miss.mapping.id)),
        }
        for failure in &miss.failures {
            out.push_str(&format!("    expected {}\n", failure));
        }
    }
    out
}

/// Flatten multi-valued headers into a single comma-joined value per name.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    flat
}

async fn dispatch(
    State(state): State<Arc<StubState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StubResponse {
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let request = LoggedRequest::new(method.as_str(), &url, flatten_headers(&headers), body.to_vec());
    state.handle(request).await
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// An HTTP stub server with a scoped listener.
///
/// Dropping the server releases its port.
pub struct StubServer {
    state: Arc<StubState>,
    running: Option<RunningServer>,
}

impl StubServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            state: Arc::new(StubState::new(options)),
            running: None,
        }
    }

    /// Create a server with the stubs and options from a configuration.
    pub fn from_config(config: StubServerConfig) -> Result<Self, StubError> {
        Ok(Self {
            state: Arc::new(StubState::from_config(config)?),
            running: None,
        })
    }

    /// Bind the listener and start serving. Starting twice is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr, StubError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let addr = self.state.options.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| StubError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| StubError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let app = Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(&self.state));
        let (shutdown, signal) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Stub server stopped with error");
            }
        });

        info!(address = %local_addr, "Stub server listening");
        self.running = Some(RunningServer {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop serving and release the port. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        let mut task = running.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("Stub server did not drain in time, aborting");
            task.abort();
        }
        info!(address = %running.local_addr, "Stub server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// `http://host:port` of the running listener.
    pub fn base_url(&self) -> Result<String, StubError> {
        self.local_addr()
            .map(|addr| format!("http://{}", addr))
            .ok_or(StubError::NotRunning)
    }

    /// Absolute URL for a path on the running listener.
    pub fn url(&self, path: &str) -> Result<String, StubError> {
        Ok(format!("{}{}", self.base_url()?, path))
    }

    /// Shared state, for handing to other tasks.
    pub fn state(&self) -> &Arc<StubState> {
        &self.state
    }

    pub async fn register(&self, stub: StubDefinition) -> Result<StubMapping, StubError> {
        self.state.register(stub).await
    }

    pub async fn remove(&self, id: MappingId) -> Option<StubMapping> {
        self.state.remove(id).await
    }

    pub async fn mappings(&self) -> Vec<StubMapping> {
        self.state.mappings().await
    }

    pub async fn verify(
        &self,
        pattern: &RequestPattern,
        expected: CountMatcher,
    ) -> Result<(), StubError> {
        self.state.verify(pattern, expected).await
    }

    pub async fn verify_called(&self, pattern: &RequestPattern) -> Result<(), StubError> {
        self.state.verify_called(pattern).await
    }

    pub async fn requests(&self) -> Vec<LoggedRequest> {
        self.state.requests().await
    }

    pub async fn find_requests(
        &self,
        pattern: &RequestPattern,
    ) -> Result<Vec<LoggedRequest>, StubError> {
        self.state.find_requests(pattern).await
    }

    pub async fn unmatched_requests(&self) -> Vec<LoggedRequest> {
        self.state.unmatched_requests().await
    }

    pub async fn reset(&self) {
        self.state.reset().await
    }

    pub async fn reset_requests(&self) {
        self.state.reset_requests().await
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{a_response, equal_to, get, get_requested_for, url_equal_to};
    use crate::config::UrlMatcher;

    fn request(method: &str, url: &str, headers: &[(&str, &str)]) -> LoggedRequest {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LoggedRequest::new(method, url, headers, Vec::new())
    }

    fn state() -> StubState {
        StubState::new(ServerOptions::default())
    }

    #[tokio::test]
    async fn test_matched_response_is_scripted() {
        let state = state();
        state
            .register(
                get(url_equal_to("/mock/demo/1"))
                    .with_name("mock_demo_1")
                    .will_return(
                        a_response()
                            .with_status(200)
                            .with_header("Content-Type", "text/plain")
                            .with_text_body("Hello world!"),
                    ),
            )
            .await
            .unwrap();

        let response = state
            .handle(request("GET", "/mock/demo/1", &[("content-type", "text/plain")]))
            .await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"Hello world!");
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header(MATCHED_STUB_NAME), Some("mock_demo_1"));
        assert!(response.header(MATCHED_STUB_ID).is_some());
    }

    #[tokio::test]
    async fn test_unmatched_request_is_journaled() {
        let state = state();
        state
            .register(get(url_equal_to("/mock/demo/1")).with_name("mock_demo_1"))
            .await
            .unwrap();

        let response = state.handle(request("GET", "/does/not/exist", &[])).await;
        assert_eq!(response.status, 404);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("GET /does/not/exist"));
        assert!(body.contains("mock_demo_1"));

        state
            .verify(&get_requested_for(url_equal_to("/does/not/exist")), CountMatcher::Exactly(1))
            .await
            .unwrap();
        assert_eq!(state.unmatched_requests().await.len(), 1);
        assert_eq!(state.total_unmatched(), 1);
    }

    #[tokio::test]
    async fn test_match_request_reports_no_stub_match() {
        let state = state();
        let err = state
            .match_request(&request("GET", "/missing", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StubError::NoStubMatch { .. }));
        assert!(state.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_serves_once() {
        let state = state();
        for _ in 0..2 {
            state
                .register(get(url_equal_to("/dup")).will_return(a_response().with_text_body("once")))
                .await
                .unwrap();
        }

        let response = state.handle(request("GET", "/dup", &[])).await;
        assert_eq!(response.body, b"once");
        assert_eq!(state.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_counts() {
        let state = state();
        state.register(get(url_equal_to("/x"))).await.unwrap();
        state.handle(request("GET", "/x", &[("Accept", "text/plain")])).await;
        state.handle(request("GET", "/x", &[])).await;

        let pattern = get_requested_for(url_equal_to("/x"));
        state.verify(&pattern, CountMatcher::Exactly(2)).await.unwrap();
        state.verify_called(&pattern).await.unwrap();

        let with_header = get_requested_for(url_equal_to("/x")).with_header("Accept", equal_to("text/plain"));
        state.verify(&with_header, CountMatcher::Exactly(1)).await.unwrap();

        match state.verify(&pattern, CountMatcher::Exactly(3)).await {
            Err(StubError::Verification { actual, expected, recorded, .. }) => {
                assert_eq!(actual, 2);
                assert_eq!(expected, CountMatcher::Exactly(3));
                assert_eq!(recorded.len(), 2);
            }
            other => panic!("expected verification error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let state = state();
        state.register(get(url_equal_to("/x"))).await.unwrap();
        state.handle(request("GET", "/x", &[])).await;

        state.reset().await;
        assert!(state.mappings().await.is_empty());
        state
            .verify(&RequestPattern::default(), CountMatcher::Exactly(0))
            .await
            .unwrap();
        assert_eq!(state.handle(request("GET", "/x", &[])).await.status, 404);
    }

    #[tokio::test]
    async fn test_reset_requests_keeps_mappings() {
        let state = state();
        state.register(get(url_equal_to("/x"))).await.unwrap();
        state.handle(request("GET", "/x", &[])).await;

        state.reset_requests().await;
        assert!(state.requests().await.is_empty());
        assert_eq!(state.mappings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_templated_response() {
        let state = state();
        state
            .register(
                get(UrlMatcher::template("/users/{id}")).will_return(
                    a_response()
                        .with_json_body(serde_json::json!({"id": "{{path.id}}"}))
                        .templated(),
                ),
            )
            .await
            .unwrap();

        let response = state.handle(request("GET", "/users/42", &[])).await;
        assert_eq!(response.header("content-type"), Some("application/json"));
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(json["id"], "42");
    }

    #[tokio::test]
    async fn test_default_response_for_unmatched() {
        let config = StubServerConfig {
            default_response: Some(a_response().with_status(418).with_text_body("teapot")),
            ..Default::default()
        };
        let state = StubState::from_config(config).unwrap();

        let response = state.handle(request("GET", "/anything", &[])).await;
        assert_eq!(response.status, 418);
        assert_eq!(response.body, b"teapot");
        assert_eq!(state.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fixed_delay() {
        let state = state();
        state
            .register(get(url_equal_to("/slow")).will_return(a_response().with_fixed_delay(50)))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        state.handle(request("GET", "/slow", &[])).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_malformed_registration_fails_fast() {
        let state = state();
        let err = state
            .register(get(url_equal_to("/x")).will_return(a_response().with_status(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, StubError::MalformedStub(_)));
        assert!(state.mappings().await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_template_rejected_at_registration() {
        let state = state();
        let err = state
            .register(
                get(url_equal_to("/t"))
                    .will_return(a_response().with_text_body("{{#if}").templated()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StubError::MalformedStub(_)));

        let err = state
            .register(get(url_equal_to("/t")).with_name("démo"))
            .await
            .unwrap_err();
        assert!(matches!(err, StubError::MalformedStub(_)));
        assert!(state.mappings().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_with_request_in_flight() {
        let state = Arc::new(state());
        state
            .register(
                get(url_equal_to("/slow")).will_return(a_response().with_fixed_delay(100)),
            )
            .await
            .unwrap();

        let handler = Arc::clone(&state);
        let in_flight =
            tokio::spawn(async move { handler.handle(request("GET", "/slow", &[])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.reset_requests().await;

        assert_eq!(in_flight.await.unwrap().status, 200);
        state
            .verify(&get_requested_for(url_equal_to("/slow")), CountMatcher::Exactly(0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_date_format_answers_500() {
        let state = Arc::new(state());
        state
            .register(
                get(url_equal_to("/n"))
                    .will_return(a_response().with_text_body("{{now \"%Q\"}}").templated()),
            )
            .await
            .unwrap();

        let handler = Arc::clone(&state);
        let response = tokio::spawn(async move { handler.handle(request("GET", "/n", &[])).await })
            .await
            .expect("request task should not panic");
        assert_eq!(response.status, 500);
        assert_eq!(state.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let mut server = StubServer::new(ServerOptions::default());
        assert!(matches!(server.base_url(), Err(StubError::NotRunning)));

        server.stop().await;
        let addr = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), addr);
        assert!(server.is_running());

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());

        // The port is free again.
        let rebound = tokio::net::TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = StubServer::new(ServerOptions::default().port(port));
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, StubError::Bind { .. }));
        assert!(!server.is_running());
        server.stop().await;
    }
}
