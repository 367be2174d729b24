//! Circuit breaker pattern implementation
//!
//! Prevents cascading failures by stopping requests to unhealthy endpoint groups.
//!
//! The state machine is driven only by consecutive-outcome counters. The
//! time-windowed outcome history is for reporting (uptime, error rate, latency)
//! and never decides whether a request is allowed. The Open -> HalfOpen move is
//! lazy: it happens on the first [`CircuitBreaker::can_execute`] call after the
//! recovery timeout, never on a timer.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Circuit is half-open - testing if service recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in half-open to close the circuit
    pub success_threshold: u32,
    /// Time to wait in open before letting a trial request through
    #[serde(with = "crate::serde_millis")]
    pub recovery_timeout: Duration,
    /// Window of outcome history kept for reporting
    #[serde(with = "crate::serde_millis")]
    pub monitoring_window: Duration,
    /// Name for logging/metrics
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set success threshold for half-open state
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set recovery timeout
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set reporting window
    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }

    /// Copy of this config under another name
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
    latency: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    history: VecDeque<Outcome>,
    total_requests: u64,
    total_failures: u64,
    rejected_requests: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure: None,
            history: VecDeque::new(),
            total_requests: 0,
            total_failures: 0,
            rejected_requests: 0,
            times_opened: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.history.front() {
            if now.saturating_duration_since(front.at) > window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.times_opened += 1;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

/// Circuit breaker for preventing cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Error when circuit is open
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    /// Name of the circuit breaker
    pub name: String,
    /// Time until a trial request will be let through
    pub retry_after: Duration,
    /// Instant at which a trial request will be let through
    pub next_attempt_at: Instant,
    /// Metrics at the time of rejection
    pub metrics: CircuitMetrics,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Circuit '{}' is open, retry after {}ms",
            self.name,
            self.retry_after.as_millis()
        )
    }
}

impl std::error::Error for CircuitOpenError {}

impl CircuitBreaker {
    /// Create a new circuit breaker with config
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Breaker config
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current state.
    ///
    /// Reports the stored state; an expired open circuit still reads `Open`
    /// until the next [`can_execute`](Self::can_execute).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Check if circuit allows a request, moving Open -> HalfOpen when the
    /// recovery timeout has elapsed.
    pub fn can_execute(&self) -> Result<(), CircuitOpenError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened = inner.opened_at.unwrap_or(now);
                let next_attempt_at = opened + self.config.recovery_timeout;
                if now >= next_attempt_at {
                    inner.half_open();
                    tracing::info!(
                        circuit = %self.config.name,
                        "Circuit half-open, allowing trial request"
                    );
                    Ok(())
                } else {
                    inner.rejected_requests += 1;
                    let metrics = self.snapshot(&mut inner, now);
                    Err(CircuitOpenError {
                        name: self.config.name.clone(),
                        retry_after: next_attempt_at - now,
                        next_attempt_at,
                        metrics,
                    })
                }
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self, latency: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.history.push_back(Outcome {
            at: now,
            success: true,
            latency,
        });
        inner.prune(now, self.config.monitoring_window);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.close();
                    tracing::info!(
                        circuit = %self.config.name,
                        "Circuit closed after successful recovery"
                    );
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {
                // A request admitted before the circuit opened finished late.
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self, latency: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.total_failures += 1;
        inner.last_failure = Some(now);
        inner.history.push_back(Outcome {
            at: now,
            success: false,
            latency,
        });
        inner.prune(now, self.config.monitoring_window);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open(now);
                    tracing::warn!(
                        circuit = %self.config.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.open(now);
                tracing::warn!(
                    circuit = %self.config.name,
                    "Circuit reopened after half-open failure"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Execute a function with circuit breaker protection.
    ///
    /// When the circuit is open `f` is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.can_execute().map_err(CircuitBreakerError::CircuitOpen)?;

        let started = Instant::now();
        match f().await {
            Ok(result) => {
                self.record_success(started.elapsed());
                Ok(result)
            }
            Err(e) => {
                self.record_failure(started.elapsed());
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn snapshot(&self, inner: &mut BreakerState, now: Instant) -> CircuitMetrics {
        inner.prune(now, self.config.monitoring_window);

        let window_samples = inner.history.len();
        let failures = inner.history.iter().filter(|o| !o.success).count();
        let (uptime_pct, recent_error_rate, average_latency_ms) = if window_samples == 0 {
            (100.0, 0.0, 0.0)
        } else {
            let total_latency: f64 = inner
                .history
                .iter()
                .map(|o| o.latency.as_secs_f64() * 1000.0)
                .sum();
            let error_rate = failures as f64 / window_samples as f64 * 100.0;
            (
                100.0 - error_rate,
                error_rate,
                total_latency / window_samples as f64,
            )
        };

        let next_attempt_at = match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| at + self.config.recovery_timeout),
            _ => None,
        };

        CircuitMetrics {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.consecutive_successes,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            rejected_requests: inner.rejected_requests,
            times_opened: inner.times_opened,
            window_samples,
            uptime_pct,
            recent_error_rate,
            average_latency_ms,
            next_attempt_at,
        }
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitMetrics {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.snapshot(&mut inner, now)
    }

    /// Drop all counters and history and close the circuit
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::new();
    }

    /// Force close the circuit (for testing/admin)
    pub fn force_close(&self) {
        self.inner.lock().close();
    }

    /// Force open the circuit (for testing/admin)
    pub fn force_open(&self) {
        self.inner.lock().open(Instant::now());
    }
}

/// Error type for circuit breaker operations
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open
    CircuitOpen(CircuitOpenError),
    /// Inner operation error
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CircuitOpen(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Consecutive successes (in half-open)
    pub success_count: u32,
    /// Lifetime requests that ran
    pub total_requests: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Lifetime requests rejected while open
    pub rejected_requests: u64,
    /// How many times the circuit has opened
    pub times_opened: u64,
    /// Outcomes inside the monitoring window
    pub window_samples: usize,
    /// Share of successes inside the window, percent
    pub uptime_pct: f64,
    /// Share of failures inside the window, percent
    pub recent_error_rate: f64,
    /// Mean latency inside the window
    pub average_latency_ms: f64,
    /// When an open circuit will let a trial request through
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
}

/// One breaker per logical endpoint group, created lazily and reused.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    template: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry; every breaker copies `template` under its own name
    pub fn new(template: CircuitBreakerConfig) -> Self {
        Self {
            template,
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for `group`, creating it on first use
    pub fn get_or_create(&self, group: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(group.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit = %group, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(self.template.named(group)))
            })
            .clone()
    }

    /// Get an existing breaker
    pub fn get(&self, group: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(group).map(|b| b.clone())
    }

    /// Names of all breakers, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of breakers
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no breaker has been created yet
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Reset every breaker to closed with empty history
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        tracing::info!(breakers = self.breakers.len(), "All circuit breakers reset");
    }

    /// Metrics of every breaker, sorted by name
    pub fn health_snapshot(&self) -> Vec<CircuitMetrics> {
        let mut snapshot: Vec<_> = self.breakers.iter().map(|e| e.value().metrics()).collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Names of breakers currently open
    pub fn open_breakers(&self) -> Vec<String> {
        self.health_snapshot()
            .into_iter()
            .filter(|m| m.state == CircuitState::Open)
            .map(|m| m.name)
            .collect()
    }
}
