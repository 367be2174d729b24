//! # Steadylink Testing Infrastructure
//!
//! Deterministic test doubles and generators for the Steadylink workspace:
//! - [`ScriptedTransport`]: a fake backend answering from per-route scripts
//! - [`FailingStore`]: a key-value store on which every call fails
//! - Property-based testing strategies for samples, signals and durations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use steadylink_testing::*;
//!
//! let transport = ScriptedTransport::new();
//! transport.fallback(Route::path("/healthz"), ScriptedResponse::ok());
//! transport.script(
//!     Route::path("/api/jobs"),
//!     [ScriptedResponse::status(503), ScriptedResponse::json(200, &serde_json::json!({"id": 1}))],
//! );
//! ```
//!
//! The transport sleeps through `tokio::time`, so tests that script latency run
//! best with `#[tokio::test(start_paused = true)]`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use steadylink_resilience::{FailureSignal, QualitySample};
use steadylink_traits::{
    HttpMethod, HttpRequest, HttpResponse, KeyValueStore, StorageError, Transport, TransportError,
};
use tokio::time::Instant;
use url::Url;

// ============================================================================
// Scripted responses
// ============================================================================

/// What a scripted exchange produces
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// An HTTP response
    Respond {
        /// Status code
        status: u16,
        /// Headers
        headers: Vec<(String, String)>,
        /// Body
        body: Vec<u8>,
    },
    /// A transport failure after the latency
    Fail(TransportError),
    /// Never answers; the request deadline expires
    Hang,
}

/// One scripted exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedResponse {
    /// Outcome
    pub outcome: ScriptedOutcome,
    /// Simulated time before the outcome
    pub latency: Duration,
}

impl ScriptedResponse {
    /// Response with a status and empty body
    pub fn status(status: u16) -> Self {
        Self {
            outcome: ScriptedOutcome::Respond {
                status,
                headers: Vec::new(),
                body: Vec::new(),
            },
            latency: Duration::ZERO,
        }
    }

    /// 200 with empty body
    pub fn ok() -> Self {
        Self::status(200)
    }

    /// Response with a JSON body
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::status(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    /// Transport failure
    pub fn fail(error: TransportError) -> Self {
        Self {
            outcome: ScriptedOutcome::Fail(error),
            latency: Duration::ZERO,
        }
    }

    /// Connection refused
    pub fn refused() -> Self {
        Self::fail(TransportError::ConnectionRefused("scripted".into()))
    }

    /// Generic network failure
    pub fn network_error() -> Self {
        Self::fail(TransportError::Network("fetch failed".into()))
    }

    /// Never answers
    pub fn hang() -> Self {
        Self {
            outcome: ScriptedOutcome::Hang,
            latency: Duration::ZERO,
        }
    }

    /// Add a header (ignored for failures)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let ScriptedOutcome::Respond { headers, .. } = &mut self.outcome {
            headers.push((name.into(), value.into()));
        }
        self
    }

    /// Set the body (ignored for failures)
    pub fn with_body(mut self, bytes: Vec<u8>) -> Self {
        if let ScriptedOutcome::Respond { body, .. } = &mut self.outcome {
            *body = bytes;
        }
        self
    }

    /// Delay the outcome
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Which requests a script applies to. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    host: Option<String>,
    method: Option<HttpMethod>,
    path_prefix: Option<String>,
}

impl Route {
    /// Matches every request
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches paths starting with `prefix`
    pub fn path(prefix: impl Into<String>) -> Self {
        Self::any().and_path(prefix)
    }

    /// Matches one host
    pub fn host(host: impl Into<String>) -> Self {
        Self::any().and_host(host)
    }

    /// Also require a path prefix
    pub fn and_path(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Also require a host
    pub fn and_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Also require a method
    pub fn and_method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    fn matches(&self, method: HttpMethod, url: &Url) -> bool {
        self.method.map_or(true, |m| m == method)
            && self
                .host
                .as_deref()
                .map_or(true, |h| url.host_str() == Some(h))
            && self
                .path_prefix
                .as_deref()
                .map_or(true, |p| url.path().starts_with(p))
    }
}

#[derive(Debug)]
struct Script {
    route: Route,
    queue: VecDeque<ScriptedResponse>,
    fallback: Option<ScriptedResponse>,
}

/// A request the transport received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Method
    pub method: HttpMethod,
    /// Full URL
    pub url: String,
    /// Deadline the caller set
    pub timeout: Duration,
    /// Body size
    pub body_len: usize,
    /// When the call arrived
    pub at: Instant,
}

impl RecordedCall {
    /// Path component of the URL
    pub fn path(&self) -> String {
        Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: Vec<Script>,
    default: Option<ScriptedResponse>,
    calls: Vec<RecordedCall>,
}

/// Fake backend answering from per-route scripts.
///
/// For each request the first script whose [`Route`] matches answers: queued
/// responses are consumed in order, then the script's fallback repeats. A
/// request no script answers gets the transport default, or connection
/// refused when there is none. Latency and hangs honour the request deadline.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    /// Create a transport that refuses everything
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut<'a>(state: &'a mut ScriptState, route: &Route) -> &'a mut Script {
        let idx = match state.scripts.iter().position(|s| &s.route == route) {
            Some(idx) => idx,
            None => {
                state.scripts.push(Script {
                    route: route.clone(),
                    queue: VecDeque::new(),
                    fallback: None,
                });
                state.scripts.len() - 1
            }
        };
        &mut state.scripts[idx]
    }

    /// Queue one-shot responses for a route
    pub fn script(&self, route: Route, responses: impl IntoIterator<Item = ScriptedResponse>) {
        let mut state = self.state.lock();
        Self::script_mut(&mut state, &route).queue.extend(responses);
    }

    /// Set the repeating response for a route
    pub fn fallback(&self, route: Route, response: ScriptedResponse) {
        let mut state = self.state.lock();
        Self::script_mut(&mut state, &route).fallback = Some(response);
    }

    /// Response for requests no route answers
    pub fn set_default(&self, response: ScriptedResponse) {
        self.state.lock().default = Some(response);
    }

    /// Every request received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Number of requests whose path starts with `prefix`
    pub fn calls_to(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.path().starts_with(prefix))
            .count()
    }

    /// Number of requests to a host
    pub fn calls_to_host(&self, host: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| {
                Url::parse(&c.url)
                    .map(|u| u.host_str() == Some(host))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Forget recorded requests
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn next_response(&self, request: &HttpRequest) -> Result<ScriptedResponse, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", request.url)))?;

        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            method: request.method,
            url: request.url.clone(),
            timeout: request.timeout,
            body_len: request.body_len(),
            at: Instant::now(),
        });

        for script in state.scripts.iter_mut() {
            if !script.route.matches(request.method, &url) {
                continue;
            }
            if let Some(response) = script.queue.pop_front() {
                return Ok(response);
            }
            if let Some(response) = &script.fallback {
                return Ok(response.clone());
            }
        }

        Ok(state
            .default
            .clone()
            .unwrap_or_else(|| ScriptedResponse::fail(TransportError::ConnectionRefused(request.url.clone()))))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let scripted = self.next_response(&request)?;
        let deadline = request.timeout;

        let wait = match scripted.outcome {
            ScriptedOutcome::Hang => deadline,
            _ => scripted.latency,
        };
        if wait >= deadline {
            tokio::time::sleep(deadline).await;
            return Err(TransportError::Timeout { after: deadline });
        }
        tokio::time::sleep(wait).await;

        match scripted.outcome {
            ScriptedOutcome::Respond {
                status,
                headers,
                body,
            } => Ok(HttpResponse {
                status,
                headers,
                body,
                elapsed: wait,
            }),
            ScriptedOutcome::Fail(error) => Err(error),
            ScriptedOutcome::Hang => Err(TransportError::Timeout { after: deadline }),
        }
    }
}

// ============================================================================
// Storage doubles
// ============================================================================

/// Store on which every call fails
#[derive(Debug, Default)]
pub struct FailingStore {
    calls: AtomicUsize,
}

impl FailingStore {
    /// Create a failing store
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls attempted so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("storage offline".into()))
    }

    async fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Io("disk full".into()))
    }

    async fn remove(&self, _key: &str) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Io("disk full".into()))
    }
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Generates plausible link measurements
pub fn quality_sample() -> impl Strategy<Value = QualitySample> {
    (0.0f64..10_000.0, 0.0f64..10_000.0, 0.0f64..=100.0, 0.0f64..=100.0).prop_map(
        |(latency, bandwidth, stability, error_rate)| {
            QualitySample::new(latency, bandwidth, stability, error_rate)
        },
    )
}

/// Generates request durations from instant to slow-mobile
pub fn request_duration() -> impl Strategy<Value = Duration> {
    (0u64..180_000).prop_map(Duration::from_millis)
}

/// Generates any HTTP status the client may see
pub fn http_status() -> impl Strategy<Value = u16> {
    prop_oneof![200u16..300, 400u16..500, 500u16..600]
}

/// Generates transport failures
pub fn transport_error() -> impl Strategy<Value = TransportError> {
    prop_oneof![
        (1u64..120_000).prop_map(|ms| TransportError::Timeout {
            after: Duration::from_millis(ms)
        }),
        Just(TransportError::Aborted),
        "[a-z]{1,12}".prop_map(TransportError::ConnectionRefused),
        "[a-z]{1,12}".prop_map(TransportError::Network),
    ]
}

/// Generates failure signals of every kind
pub fn failure_signal() -> impl Strategy<Value = FailureSignal> {
    prop_oneof![
        transport_error().prop_map(FailureSignal::Transport),
        (http_status(), proptest::option::of(0u64..600)).prop_map(|(status, secs)| {
            FailureSignal::Status {
                status,
                retry_after: secs.map(Duration::from_secs),
            }
        }),
        (0u64..60_000).prop_map(|ms| FailureSignal::CircuitOpen {
            retry_after: Duration::from_millis(ms)
        }),
        "[a-z ]{0,20}".prop_map(FailureSignal::Other),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_queue_then_fallback() {
        let transport = ScriptedTransport::new();
        transport.script(Route::path("/api"), [ScriptedResponse::status(503)]);
        transport.fallback(Route::path("/api"), ScriptedResponse::ok());

        let first = transport.send(HttpRequest::get("http://x/api/jobs")).await.unwrap();
        let second = transport.send(HttpRequest::get("http://x/api/jobs")).await.unwrap();
        let third = transport.send(HttpRequest::get("http://x/api/jobs")).await.unwrap();
        assert_eq!([first.status, second.status, third.status], [503, 200, 200]);
        assert_eq!(transport.calls_to("/api"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscripted_is_refused() {
        let transport = ScriptedTransport::new();
        let err = transport.send(HttpRequest::get("http://x/other")).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));

        transport.set_default(ScriptedResponse::status(404));
        let res = transport.send(HttpRequest::get("http://x/other")).await.unwrap();
        assert_eq!(res.status, 404);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_and_method_routes() {
        let transport = ScriptedTransport::new();
        transport.fallback(Route::host("10.0.2.2"), ScriptedResponse::ok());
        transport.fallback(
            Route::path("/healthz").and_method(HttpMethod::Head),
            ScriptedResponse::status(204),
        );

        let res = transport.send(HttpRequest::get("http://10.0.2.2:8000/healthz")).await.unwrap();
        assert_eq!(res.status, 200);
        let res = transport.send(HttpRequest::head("http://localhost:8000/healthz")).await.unwrap();
        assert_eq!(res.status, 204);
        assert!(transport.send(HttpRequest::get("http://localhost:8000/healthz")).await.is_err());
        assert_eq!(transport.calls_to_host("10.0.2.2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_deadline() {
        let transport = ScriptedTransport::new();
        transport.fallback(
            Route::any(),
            ScriptedResponse::ok().with_latency(Duration::from_millis(250)),
        );

        let started = Instant::now();
        let res = transport.send(HttpRequest::get("http://x/")).await.unwrap();
        assert_eq!(res.elapsed, Duration::from_millis(250));
        assert_eq!(started.elapsed(), Duration::from_millis(250));

        let err = transport
            .send(HttpRequest::get("http://x/").with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout { after: Duration::from_millis(100) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out() {
        let transport = ScriptedTransport::new();
        transport.script(Route::any(), [ScriptedResponse::hang()]);
        let started = Instant::now();
        let err = transport
            .send(HttpRequest::get("http://x/").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = FailingStore::new();
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", "v".into()).await.is_err());
        assert_eq!(store.calls(), 2);
    }
}
