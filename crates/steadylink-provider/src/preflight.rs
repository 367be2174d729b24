//! Pre-flight connectivity checks
//!
//! One health request, mapped to a status, a quality tier and a sentence the
//! UI can show before the user commits to a network-heavy action.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use steadylink_error::Confidence;
use steadylink_resilience::QualityTier;
use steadylink_traits::{HttpRequest, SharedTransport, TransportError};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::{join_url, HEALTH_PATH};

const EVENT_CAPACITY: usize = 16;
const RETRY_STEP: Duration = Duration::from_millis(500);

/// Connectivity as seen by the last check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Healthy and fast enough
    Connected,
    /// Reachable but slow or unhealthy
    Degraded,
    /// Not reachable
    Disconnected,
    /// A check is in flight
    Checking,
    /// Never checked
    #[default]
    Unknown,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
            Self::Checking => "checking",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Options for [`PreflightValidator::validate`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightOptions {
    /// Deadline for the health request
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub timeout: Duration,
    /// Retry when unreachable
    pub retry_on_failure: bool,
    /// Extra attempts when retrying
    pub retry_attempts: u32,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_on_failure: false,
            retry_attempts: 2,
        }
    }
}

impl PreflightOptions {
    /// Options used by [`PreflightValidator::quick_check`]
    pub fn quick() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry_on_failure: false,
            retry_attempts: 0,
        }
    }

    /// Set the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry up to `attempts` more times when unreachable
    pub fn with_retries(mut self, attempts: u32) -> Self {
        self.retry_on_failure = true;
        self.retry_attempts = attempts;
        self
    }
}

/// Outcome of a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightResult {
    /// Resulting status
    pub status: ConnectionStatus,
    /// Round trip of a successful check
    pub latency_ms: Option<u64>,
    /// Whether the server answered at all
    pub reachable: bool,
    /// Tier implied by the latency
    pub tier: Option<QualityTier>,
    /// What to tell the user
    pub recommendation: String,
    /// When the check finished
    pub checked_at: DateTime<Utc>,
    /// How much the tier can be trusted
    pub confidence: Confidence,
    /// Failure detail
    pub error: Option<String>,
}

impl PreflightResult {
    fn answered(latency: Duration) -> Self {
        let latency_ms = latency.as_millis() as u64;
        let (status, tier, confidence, recommendation) = match latency_ms {
            0..=99 => (
                ConnectionStatus::Connected,
                QualityTier::Excellent,
                Confidence::High,
                "Connection is excellent.",
            ),
            100..=499 => (
                ConnectionStatus::Connected,
                QualityTier::Good,
                Confidence::High,
                "Connection is good.",
            ),
            500..=2000 => (
                ConnectionStatus::Degraded,
                QualityTier::Fair,
                Confidence::High,
                "Connection is slow. Large uploads may take a while.",
            ),
            _ => (
                ConnectionStatus::Degraded,
                QualityTier::Poor,
                Confidence::Low,
                "Connection is very slow. Consider moving to a stronger network before continuing.",
            ),
        };

        Self {
            status,
            latency_ms: Some(latency_ms),
            reachable: true,
            tier: Some(tier),
            recommendation: recommendation.to_string(),
            checked_at: Utc::now(),
            confidence,
            error: None,
        }
    }

    fn unhealthy(status: u16) -> Self {
        Self {
            status: ConnectionStatus::Degraded,
            latency_ms: None,
            reachable: true,
            tier: None,
            recommendation: format!(
                "The server is reachable but reported a problem (HTTP {status}). Some features may be unavailable."
            ),
            checked_at: Utc::now(),
            confidence: Confidence::High,
            error: Some(format!("health check returned HTTP {status}")),
        }
    }

    fn unreachable(error: &TransportError, deadline: Duration) -> Self {
        let recommendation = match error {
            TransportError::Timeout { .. } | TransportError::Aborted => format!(
                "The server did not respond within {} seconds. Check your connection or try again on a stronger network.",
                deadline.as_secs().max(1)
            ),
            TransportError::ConnectionRefused(_) => {
                "The server refused the connection. Make sure it is running and the address and port are correct."
                    .to_string()
            }
            TransportError::Network(_) => {
                "Could not reach the server (fetch failed). Check that you are online.".to_string()
            }
            TransportError::InvalidRequest(_) => {
                "The server address is invalid. Check the configured URL.".to_string()
            }
        };

        Self {
            status: ConnectionStatus::Disconnected,
            latency_ms: None,
            reachable: false,
            tier: None,
            recommendation,
            checked_at: Utc::now(),
            confidence: Confidence::High,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct PreflightState {
    status: ConnectionStatus,
    settled: ConnectionStatus,
    in_flight: usize,
    last: Option<PreflightResult>,
}

/// Checks that the backend is reachable before work starts
#[derive(Debug)]
pub struct PreflightValidator {
    transport: SharedTransport,
    base_url: RwLock<String>,
    state: Mutex<PreflightState>,
    events: broadcast::Sender<PreflightResult>,
}

impl PreflightValidator {
    /// Validator checking `base_url`
    pub fn new(transport: SharedTransport, base_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            base_url: RwLock::new(base_url.into()),
            state: Mutex::new(PreflightState::default()),
            events,
        }
    }

    /// Retarget the checks
    pub fn set_base_url(&self, url: impl Into<String>) {
        *self.base_url.write() = url.into();
    }

    /// URL being checked
    pub fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    /// Current status; `Checking` while a validation runs
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Last finished check
    pub fn last_result(&self) -> Option<PreflightResult> {
        self.state.lock().last.clone()
    }

    /// Receive a result whenever the settled status changes
    pub fn subscribe(&self) -> broadcast::Receiver<PreflightResult> {
        self.events.subscribe()
    }

    /// Two-second check without retries
    pub async fn quick_check(&self) -> PreflightResult {
        self.validate(PreflightOptions::quick()).await
    }

    /// Whether the last finished check reached the server; no I/O
    pub fn is_reachable(&self) -> bool {
        self.state.lock().last.as_ref().is_some_and(|r| r.reachable)
    }

    /// Run a check
    pub async fn validate(&self, options: PreflightOptions) -> PreflightResult {
        {
            let mut state = self.state.lock();
            state.in_flight += 1;
            state.status = ConnectionStatus::Checking;
        }

        let attempts = 1 + if options.retry_on_failure { options.retry_attempts } else { 0 };
        let mut attempt = 1;
        let result = loop {
            let result = self.check_once(options.timeout).await;
            if result.reachable || attempt >= attempts {
                break result;
            }
            let wait = RETRY_STEP * attempt;
            tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "Preflight failed, retrying");
            tokio::time::sleep(wait).await;
            attempt += 1;
        };

        let changed = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            let changed = state.settled != result.status;
            state.settled = result.status;
            state.status = if state.in_flight > 0 {
                ConnectionStatus::Checking
            } else {
                result.status
            };
            state.last = Some(result.clone());
            changed
        };

        if changed {
            tracing::info!(
                status = %result.status,
                latency_ms = ?result.latency_ms,
                tier = ?result.tier,
                "Connection status changed"
            );
            let _ = self.events.send(result.clone());
        }
        result
    }

    async fn check_once(&self, timeout: Duration) -> PreflightResult {
        let url = join_url(&self.base_url(), HEALTH_PATH);
        let started = Instant::now();
        match self.transport.send(HttpRequest::get(url).with_timeout(timeout)).await {
            Ok(response) if response.is_success() => PreflightResult::answered(started.elapsed()),
            Ok(response) => PreflightResult::unhealthy(response.status),
            Err(e) => PreflightResult::unreachable(&e, timeout),
        }
    }
}
