//! Resilient request orchestration
//!
//! [`ResilientClient`] ties the components together. For each logical request
//! it resolves the backend through discovery, sizes the deadline from the
//! calibrated timeout and the link tier, sends through the endpoint group's
//! circuit breaker, classifies failures and retries with tier backoff. Every
//! attempt that reaches the backend retrains the calibrator and the assessor.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use steadylink_error::{Error, ErrorType, Result};
use steadylink_resilience::{
    parse_retry_after, AdaptiveTimeoutCalibrator, CalibratorConfig, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState, ConnectionAssessment, ErrorClassifier, FailureSignal, RequestRecord,
};
use steadylink_traits::{HttpMethod, HttpRequest, HttpResponse, SharedStore, SharedTransport, TransportError};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::assessor::{AssessorConfig, NetworkQualityAssessor};
use crate::discovery::{DiscoveryConfig, DiscoveryResult, ServiceDiscovery};
use crate::events::ClientEvent;
use crate::monitor::{ConnectionHealthMonitor, MonitorConfig};
use crate::preflight::{PreflightOptions, PreflightValidator};
use crate::transport::{HttpClientConfig, ReqwestTransport};
use crate::{join_url, parse_base_url};

const EVENT_CAPACITY: usize = 64;

/// Group used when a path has no usable segment
pub const DEFAULT_GROUP: &str = "default";

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend discovery
    pub discovery: DiscoveryConfig,
    /// Quality probes
    pub assessor: AssessorConfig,
    /// Timeout calibration
    pub calibrator: CalibratorConfig,
    /// Template for every endpoint-group breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Background health monitor
    pub monitor: MonitorConfig,
    /// Pooled HTTP client, used when no transport is injected
    pub http: HttpClientConfig,
    /// Defaults applied to every request
    pub requests: RequestDefaults,
}

impl ClientConfig {
    /// Check settings that would otherwise break the client at runtime
    pub fn validate(&self) -> Result<()> {
        self.calibrator.validate()?;
        self.monitor.validate()?;
        if !(0.0..=1.0).contains(&self.requests.jitter) {
            return Err(Error::ConfigError(format!(
                "request jitter must be within [0, 1], got {}",
                self.requests.jitter
            )));
        }
        Ok(())
    }
}

/// Defaults applied to every request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    /// How old a cached assessment may be
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub assessment_max_age: Duration,
    /// Backoff jitter fraction in `[0, 1]`
    pub jitter: f64,
    /// Headers sent with every request
    pub headers: Vec<(String, String)>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            assessment_max_age: Duration::from_secs(30),
            jitter: 0.0,
            headers: Vec::new(),
        }
    }
}

/// Per-request overrides
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Breaker group; derived from the path when absent
    pub group: Option<String>,
    /// Fixed deadline instead of the calibrated one
    pub timeout: Option<Duration>,
    /// Retry cap instead of the tier's
    pub max_retries: Option<u32>,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Backoff jitter instead of the configured one
    pub jitter: Option<f64>,
}

impl RequestOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Use breaker group `group`
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Fix the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cap retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set backoff jitter
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }
}

/// Successful response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Raw body
    pub body: Vec<u8>,
    /// Attempts used
    pub attempts: u32,
    /// Time across all attempts and waits
    pub duration: Duration,
    /// URL that answered
    pub url: String,
}

impl ApiResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::JsonError(e.to_string()))
    }

    /// Body as UTF-8, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Header value, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Breaker group for a path: the first segment, skipping a leading `api`
pub fn endpoint_group(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match segments.next() {
        Some("api") => segments.next().unwrap_or("api").to_string(),
        Some(first) => first.to_string(),
        None => DEFAULT_GROUP.to_string(),
    }
}

/// What one attempt produced
enum AttemptOutcome {
    Success(HttpResponse),
    Failed {
        signal: FailureSignal,
        status: Option<u16>,
    },
}

/// HTTP client that adapts to the link it runs on
#[derive(Debug)]
pub struct ResilientClient {
    config: ClientConfig,
    transport: SharedTransport,
    discovery: Arc<ServiceDiscovery>,
    assessor: Arc<NetworkQualityAssessor>,
    calibrator: Arc<AdaptiveTimeoutCalibrator>,
    breakers: Arc<CircuitBreakerRegistry>,
    preflight: Arc<PreflightValidator>,
    monitor: Arc<ConnectionHealthMonitor>,
    classifier: ErrorClassifier,
    events: broadcast::Sender<ClientEvent>,
}

impl ResilientClient {
    /// Start building a client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Client config
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Transport in use
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Backend discovery
    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    /// Quality assessor
    pub fn assessor(&self) -> &Arc<NetworkQualityAssessor> {
        &self.assessor
    }

    /// Timeout calibrator
    pub fn calibrator(&self) -> &Arc<AdaptiveTimeoutCalibrator> {
        &self.calibrator
    }

    /// Breakers by endpoint group
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Pre-flight validator
    pub fn preflight(&self) -> &Arc<PreflightValidator> {
        &self.preflight
    }

    /// Health monitor; not started until [`ConnectionHealthMonitor::start`]
    pub fn monitor(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.monitor
    }

    /// Receive client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Switch networks: calibration and discovery start over
    pub fn set_network_id(&self, network_id: Option<String>) {
        self.calibrator.set_network_id(network_id.clone());
        self.discovery.set_network_id(network_id);
    }

    /// Resolve the backend and point every probe at it
    pub async fn resolve_backend(&self) -> DiscoveryResult {
        let found = self.discovery.discover().await;
        self.assessor.set_base_url(found.url.clone());
        self.preflight.set_base_url(found.url.clone());
        found
    }

    /// Deadline for the next attempt given an assessment
    pub fn effective_timeout(&self, assessment: &ConnectionAssessment) -> Duration {
        self.calibrator
            .current_timeout()
            .max(assessment.tier.minimum_timeout())
    }

    /// GET `path`
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(HttpMethod::Get, path, None, RequestOptions::default()).await
    }

    /// POST a JSON body to `path`
    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.request(HttpMethod::Post, path, Some(body), RequestOptions::default())
            .await
    }

    /// PUT a JSON body to `path`
    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.request(HttpMethod::Put, path, Some(body), RequestOptions::default())
            .await
    }

    /// DELETE `path`
    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(HttpMethod::Delete, path, None, RequestOptions::default())
            .await
    }

    /// Check connectivity, then POST credentials.
    ///
    /// The preflight recommendation is published as a progress event. When the
    /// server cannot be reached the call fails without sending the body.
    pub async fn login(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.resolve_backend().await;
        let check = self.preflight.validate(PreflightOptions::default()).await;
        self.emit(ClientEvent::progress(check.recommendation.clone()));

        if !check.reachable {
            let detail = check.error.unwrap_or_else(|| "server unreachable".to_string());
            let classification =
                self.classifier
                    .classify(&FailureSignal::Transport(TransportError::Network(detail)), check.tier, None, 1);
            tracing::warn!(path, "Login aborted, server unreachable");
            return Err(Error::request(classification, None, 0));
        }

        self.post(path, body).await
    }

    /// Send a request with discovery, calibrated deadlines, breakers and retries
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let backend = self.resolve_backend().await;
        let assessment = self
            .assessor
            .get_cached(self.config.requests.assessment_max_age)
            .await;

        let group = options.group.clone().unwrap_or_else(|| endpoint_group(path));
        let breaker = self.breakers.get_or_create(&group);
        let max_retries = options.max_retries.unwrap_or(assessment.max_retries);
        let jitter = options.jitter.unwrap_or(self.config.requests.jitter);
        let strategy = assessment.backoff_strategy;
        let url = join_url(&backend.url, path);

        let mut request = HttpRequest::new(method, url.clone());
        for (name, value) in self.config.requests.headers.iter().chain(options.headers.iter()) {
            request = request.with_header(name.clone(), value.clone());
        }
        if let Some(body) = &body {
            let bytes = serde_json::to_vec(body).map_err(|e| Error::JsonError(e.to_string()))?;
            request = request
                .with_header("Content-Type", "application/json")
                .with_body(bytes);
        }

        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            let timeout = options
                .timeout
                .unwrap_or_else(|| self.effective_timeout(&assessment));

            if let Err(open) = breaker.can_execute() {
                let classification = self.classifier.classify(
                    &FailureSignal::CircuitOpen {
                        retry_after: open.retry_after,
                    },
                    Some(assessment.tier),
                    Some(CircuitState::Open),
                    attempt,
                );
                tracing::debug!(circuit = %group, attempt, "Request rejected by open circuit");
                return Err(self.give_up(&url, classification, None, attempt));
            }

            self.emit(ClientEvent::AttemptStarted {
                method,
                url: url.clone(),
                attempt,
                timeout_ms: timeout.as_millis() as u64,
            });
            tracing::debug!(%method, url = %url, attempt, timeout_ms = timeout.as_millis() as u64, circuit = %group, "Sending attempt");

            let sent = Instant::now();
            let result = self.transport.send(request.clone().with_timeout(timeout)).await;
            let elapsed = sent.elapsed();

            let (signal, status) = match self.observe(&breaker, result, elapsed).await {
                AttemptOutcome::Success(response) => {
                    let duration = started.elapsed();
                    self.emit(ClientEvent::RequestSucceeded {
                        url: url.clone(),
                        status: response.status,
                        attempts: attempt,
                        duration_ms: duration.as_millis() as u64,
                    });
                    return Ok(ApiResponse {
                        status: response.status,
                        headers: response.headers,
                        body: response.body,
                        attempts: attempt,
                        duration,
                        url,
                    });
                }
                AttemptOutcome::Failed { signal, status } => (signal, status),
            };

            let circuit_state = breaker.state();
            let classification = self
                .classifier
                .classify(&signal, Some(assessment.tier), Some(circuit_state), attempt);

            let can_retry =
                classification.retry_recommended && attempt <= max_retries && circuit_state != CircuitState::Open;
            if !can_retry {
                return Err(self.give_up(&url, classification, status, attempt));
            }

            let mut delay = strategy.delay(attempt, jitter);
            if classification.error_type == ErrorType::RateLimited {
                if let Some(hint) = classification.retry_after() {
                    delay = delay.max(hint);
                }
            }
            self.emit(ClientEvent::RetryScheduled {
                url: url.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error_type: classification.error_type,
            });
            tracing::trace!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error_type = %classification.error_type,
                %strategy,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Feed one attempt's outcome to the breaker, calibrator and assessor
    async fn observe(
        &self,
        breaker: &steadylink_resilience::CircuitBreaker,
        result: std::result::Result<HttpResponse, TransportError>,
        elapsed: Duration,
    ) -> AttemptOutcome {
        match result {
            Ok(response) => {
                // only 5xx counts against the breaker and calibrator; 4xx is a healthy backend
                let reached = !response.is_server_error();
                if reached {
                    breaker.record_success(elapsed);
                } else {
                    breaker.record_failure(elapsed);
                }
                self.calibrator
                    .record_request(RequestRecord::new(elapsed, reached))
                    .await;
                self.assessor.record_outcome(reached, elapsed);

                if response.is_success() {
                    return AttemptOutcome::Success(response);
                }
                let retry_after = response.header("retry-after").and_then(parse_retry_after);
                AttemptOutcome::Failed {
                    signal: FailureSignal::Status {
                        status: response.status,
                        retry_after,
                    },
                    status: Some(response.status),
                }
            }
            Err(error) => {
                breaker.record_failure(elapsed);
                // refused and unreachable never reached the backend; only timeouts are sampled
                if error.is_timeout() {
                    self.calibrator
                        .record_request(RequestRecord::new(elapsed, false))
                        .await;
                }
                self.assessor.record_outcome(false, elapsed);
                AttemptOutcome::Failed {
                    signal: FailureSignal::Transport(error),
                    status: None,
                }
            }
        }
    }

    fn give_up(
        &self,
        url: &str,
        classification: steadylink_error::ErrorClassification,
        status: Option<u16>,
        attempts: u32,
    ) -> Error {
        tracing::debug!(
            url,
            attempts,
            error_type = %classification.error_type,
            severity = %classification.severity,
            "Request failed"
        );
        self.emit(ClientEvent::RequestFailed {
            url: url.to_string(),
            error_type: classification.error_type,
            attempts,
            user_message: classification.user_message.clone(),
        });
        Error::request(classification, status, attempts)
    }
}

/// Builder for [`ResilientClient`]
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<SharedTransport>,
    store: Option<SharedStore>,
}

impl ClientBuilder {
    /// Builder with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole config
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Try `url` before anything else during discovery
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.discovery.explicit_url = Some(url.into());
        self
    }

    /// Scope calibration and cached endpoints to a network
    pub fn network_id(mut self, network_id: impl Into<String>) -> Self {
        self.config.discovery.network_id = Some(network_id.into());
        self
    }

    /// Use `transport` instead of a pooled reqwest client
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persist calibration and cached endpoints in `store`
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the client, restoring persisted state when a store is set
    pub async fn build(self) -> Result<ResilientClient> {
        let config = self.config;
        config.validate()?;
        if let Some(url) = &config.discovery.explicit_url {
            parse_base_url(url)?;
        }

        let transport: SharedTransport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_config(config.http.clone())?),
        };

        let network_id = config.discovery.network_id.clone();
        let (discovery, calibrator) = match self.store {
            Some(store) => (
                ServiceDiscovery::with_store(config.discovery.clone(), transport.clone(), store.clone()).await,
                AdaptiveTimeoutCalibrator::with_store(config.calibrator.clone(), store, network_id).await,
            ),
            None => {
                let calibrator = AdaptiveTimeoutCalibrator::new(config.calibrator.clone());
                calibrator.set_network_id(network_id);
                (
                    ServiceDiscovery::new(config.discovery.clone(), transport.clone()),
                    calibrator,
                )
            }
        };

        let initial_url = config.discovery.explicit_url.clone().unwrap_or_else(|| {
            config
                .discovery
                .platform
                .default_url(config.discovery.port, &config.discovery.common_gateway)
        });
        let assessor = Arc::new(NetworkQualityAssessor::new(
            transport.clone(),
            initial_url.clone(),
            config.assessor.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            assessor.clone(),
            breakers.clone(),
            config.monitor.clone(),
        ));
        let preflight = Arc::new(PreflightValidator::new(transport.clone(), initial_url));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(ResilientClient {
            config,
            transport,
            discovery: Arc::new(discovery),
            assessor,
            calibrator: Arc::new(calibrator),
            breakers,
            preflight,
            monitor,
            classifier: ErrorClassifier::new(),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::HEALTH_PATH;
    use steadylink_error::RecoveryOption;
    use steadylink_resilience::QualityTier;
    use steadylink_testing::{Route, ScriptedResponse, ScriptedTransport};
    use steadylink_traits::KeyValueStore;

    async fn client_for(transport: &Arc<ScriptedTransport>) -> ResilientClient {
        ResilientClient::builder()
            .base_url("http://localhost:8000")
            .transport(transport.clone())
            .build()
            .await
            .unwrap()
    }

    /// Backend whose health route is fast enough to rate Excellent
    fn fast_backend() -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(
            Route::path(HEALTH_PATH),
            ScriptedResponse::ok().with_latency(Duration::from_millis(10)),
        );
        transport
    }

    #[test]
    fn test_endpoint_group() {
        assert_eq!(endpoint_group("/api/jobs/42"), "jobs");
        assert_eq!(endpoint_group("/auth/login"), "auth");
        assert_eq!(endpoint_group("api/uploads?x=1"), "uploads");
        assert_eq!(endpoint_group("/api"), "api");
        assert_eq!(endpoint_group("/"), DEFAULT_GROUP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_success() {
        let transport = fast_backend();
        transport.fallback(
            Route::path("/api/jobs"),
            ScriptedResponse::json(200, &serde_json::json!({"id": 7})),
        );
        let client = client_for(&transport).await;

        let response = client.get("/api/jobs/7").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.attempts, 1);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["id"], 7);
        assert_eq!(client.breakers().names(), vec!["jobs".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_uses_tier_minimum_and_calibration() {
        let transport = fast_backend();
        transport.fallback(Route::path("/api/jobs"), ScriptedResponse::ok());
        let client = client_for(&transport).await;

        client.get("/api/jobs").await.unwrap();
        let call = transport.calls_to("/api/jobs");
        assert_eq!(call, 1);
        let sent = transport
            .calls()
            .into_iter()
            .find(|c| c.path() == "/api/jobs")
            .unwrap();
        // Calibrator starts at the 30s platform default, above the Excellent minimum.
        assert_eq!(sent.timeout, Duration::from_secs(30));

        let fixed = client
            .request(
                HttpMethod::Get,
                "/api/jobs",
                None,
                RequestOptions::new().with_timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(fixed.attempts, 1);
        assert_eq!(transport.calls().last().unwrap().timeout, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retry_with_linear_backoff() {
        let transport = fast_backend();
        transport.script(
            Route::path("/api/jobs"),
            [ScriptedResponse::status(503), ScriptedResponse::status(502)],
        );
        transport.fallback(Route::path("/api/jobs"), ScriptedResponse::ok());
        let client = client_for(&transport).await;
        let mut events = client.subscribe();

        let started = Instant::now();
        let response = client.get("/api/jobs").await.unwrap();
        assert_eq!(response.attempts, 3);

        let job_calls: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| c.path() == "/api/jobs")
            .map(|c| c.at - started)
            .collect();
        let first = job_calls[0];
        // Excellent tier: 500ms then 1000ms
        assert_eq!(job_calls[1] - first, Duration::from_millis(500));
        assert_eq!(job_calls[2] - job_calls[1], Duration::from_millis(1000));

        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::RetryScheduled { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let transport = fast_backend();
        transport.fallback(Route::path("/auth"), ScriptedResponse::status(401));
        let client = client_for(&transport).await;

        let err = client.post("/auth/login", serde_json::json!({"u": "a"})).await.unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::AuthenticationFailed));
        assert!(!err.is_retryable());
        assert_eq!(transport.calls_to("/auth"), 1);

        // 4xx does not count against the breaker
        assert_eq!(client.breakers().get("auth").unwrap().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_surfaces_immediately() {
        let transport = fast_backend();
        transport.fallback(Route::path("/api/jobs"), ScriptedResponse::status(422));
        let client = client_for(&transport).await;

        let err = client.post("/api/jobs", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::Unknown));
        assert_eq!(transport.calls_to("/api/jobs"), 1);
        match err {
            Error::Request { status, attempts, .. } => {
                assert_eq!(status, Some(422));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honours_retry_after() {
        let transport = fast_backend();
        transport.script(
            Route::path("/api/jobs"),
            [ScriptedResponse::status(429).with_header("Retry-After", "4")],
        );
        transport.fallback(Route::path("/api/jobs"), ScriptedResponse::ok());
        let client = client_for(&transport).await;

        client.get("/api/jobs").await.unwrap();
        let calls: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| c.path() == "/api/jobs")
            .collect();
        assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let transport = fast_backend();
        transport.fallback(Route::path("/api/jobs"), ScriptedResponse::status(500));
        let client = client_for(&transport).await;

        let err = client
            .request(
                HttpMethod::Get,
                "/api/jobs",
                None,
                RequestOptions::new().with_max_retries(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::ServerUnavailable));
        assert_eq!(transport.calls_to("/api/jobs"), 3);
        match err {
            Error::Request { attempts, status, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, Some(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_once_breaker_opens() {
        let transport = fast_backend();
        transport.fallback(Route::path("/api/jobs"), ScriptedResponse::status(500));
        let client = client_for(&transport).await;

        let err = client
            .request(
                HttpMethod::Get,
                "/api/jobs",
                None,
                RequestOptions::new().with_max_retries(10),
            )
            .await
            .unwrap_err();
        // Fifth failure opens the breaker and stops the loop.
        assert_eq!(transport.calls_to("/api/jobs"), 5);
        assert_eq!(err.error_type(), Some(ErrorType::ServerUnavailable));

        let err = client.get("/api/jobs").await.unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::CircuitBreakerOpen));
        assert!(err
            .recovery_options()
            .iter()
            .any(|o| matches!(o, RecoveryOption::WaitAndRetry { .. })));
        assert_eq!(transport.calls_to("/api/jobs"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_retrain_calibrator() {
        let transport = fast_backend();
        transport.fallback(
            Route::path("/api/jobs"),
            ScriptedResponse::ok().with_latency(Duration::from_millis(100)),
        );
        let client = client_for(&transport).await;

        for _ in 0..5 {
            client.get("/api/jobs").await.unwrap();
        }
        assert!(client.calibrator().current_timeout() < Duration::from_secs(30));
        assert_eq!(client.calibrator().snapshot().recent_requests.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_not_recorded_in_calibrator() {
        let transport = fast_backend();
        let client = client_for(&transport).await;

        let err = client
            .request(
                HttpMethod::Get,
                "/api/jobs",
                None,
                RequestOptions::new().with_max_retries(0),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::NetworkUnreachable));
        assert!(client.calibrator().snapshot().recent_requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_fails_fast_when_unreachable() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client_for(&transport).await;
        let mut events = client.subscribe();

        let err = client
            .login("/auth/login", serde_json::json!({"user": "a"}))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), Some(ErrorType::NetworkUnreachable));
        assert_eq!(transport.calls_to("/auth"), 0);

        match events.recv().await.unwrap() {
            ClientEvent::Progress { message } => assert!(message.contains("refused")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_posts_after_preflight() {
        let transport = fast_backend();
        transport.fallback(
            Route::path("/auth/login"),
            ScriptedResponse::json(200, &serde_json::json!({"token": "t"})),
        );
        let client = client_for(&transport).await;

        let response = client
            .login("/auth/login", serde_json::json!({"user": "a"}))
            .await
            .unwrap();
        assert_eq!(response.json::<serde_json::Value>().unwrap()["token"], "t");
        assert_eq!(client.preflight().last_result().unwrap().tier, Some(QualityTier::Excellent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_persists_through_store() {
        let transport = fast_backend();
        transport.fallback(
            Route::path("/api/jobs"),
            ScriptedResponse::ok().with_latency(Duration::from_millis(100)),
        );
        let store = Arc::new(MemoryStore::new());
        let client = ResilientClient::builder()
            .base_url("http://localhost:8000")
            .transport(transport.clone())
            .store(store.clone())
            .build()
            .await
            .unwrap();

        for _ in 0..5 {
            client.get("/api/jobs").await.unwrap();
        }
        let learned = client.calibrator().current_timeout();
        assert!(store
            .get(steadylink_traits::CALIBRATION_STORAGE_KEY)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(steadylink_traits::ENDPOINT_CACHE_STORAGE_KEY)
            .await
            .unwrap()
            .is_some());

        let restored = ResilientClient::builder()
            .base_url("http://localhost:8000")
            .transport(transport)
            .store(store)
            .build()
            .await
            .unwrap();
        assert_eq!(restored.calibrator().current_timeout(), learned);
    }

    #[tokio::test]
    async fn test_invalid_base_url_rejected() {
        let err = ResilientClient::builder()
            .base_url("not a url")
            .transport(Arc::new(ScriptedTransport::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_inconsistent_config_rejected() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"calibrator": {"min_timeout": 200000}, "monitor": {"check_interval": 0}}"#,
        )
        .unwrap();
        let err = ResilientClient::builder()
            .config(config)
            .transport(Arc::new(ScriptedTransport::new()))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
