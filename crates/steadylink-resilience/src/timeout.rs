//! Timeout utilities and adaptive calibration
//!
//! [`AdaptiveTimeoutCalibrator`] learns a request timeout from observed
//! durations. Every few recorded requests it recomputes a target from the
//! recent p95 and mean, moves toward it with exponential smoothing and clamps
//! the result to the configured bounds. Calibration is persisted per network
//! through a [`KeyValueStore`] on a best-effort basis.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use steadylink_error::Error;
use steadylink_traits::{SharedStore, CALIBRATION_STORAGE_KEY};
use tokio::time::timeout;

/// Network id used when none is known
pub const DEFAULT_NETWORK_ID: &str = "default";

/// Timeout error
#[derive(Debug, Clone)]
pub struct TimeoutError {
    /// The operation that timed out
    pub operation: String,
    /// The timeout duration
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Operation '{}' timed out after {:?}",
            self.operation, self.duration
        )
    }
}

impl std::error::Error for TimeoutError {}

/// Execute a future with a timeout
pub async fn with_timeout<T>(
    duration: Duration,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    let op = operation.into();
    timeout(duration, future).await.map_err(|_| TimeoutError {
        operation: op,
        duration,
    })
}

/// Calibrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    /// Lower bound for the calibrated timeout
    #[serde(with = "crate::serde_millis")]
    pub min_timeout: Duration,
    /// Upper bound for the calibrated timeout
    #[serde(with = "crate::serde_millis")]
    pub max_timeout: Duration,
    /// Timeout before any calibration
    #[serde(with = "crate::serde_millis")]
    pub platform_default: Duration,
    /// Weight of the new target in exponential smoothing
    pub smoothing_factor: f64,
    /// Recalibrate after this many recorded requests
    pub recalibration_interval: u32,
    /// Number of most recent requests used for statistics
    pub calibration_window: usize,
    /// Number of requests retained
    pub history_limit: usize,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(120),
            platform_default: Duration::from_secs(30),
            smoothing_factor: 0.3,
            recalibration_interval: 5,
            calibration_window: 20,
            history_limit: 50,
        }
    }
}

impl CalibratorConfig {
    /// Create default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout bounds
    pub fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_timeout = min.min(max);
        self.max_timeout = max.max(min);
        self
    }

    /// Set the starting timeout
    pub fn with_platform_default(mut self, timeout: Duration) -> Self {
        self.platform_default = timeout;
        self
    }

    /// Set smoothing factor (0.0 to 1.0)
    pub fn with_smoothing_factor(mut self, alpha: f64) -> Self {
        self.smoothing_factor = alpha.clamp(0.0, 1.0);
        self
    }

    /// Set recalibration interval
    pub fn with_recalibration_interval(mut self, every: u32) -> Self {
        self.recalibration_interval = every.max(1);
        self
    }

    /// Reject settings the calibrator cannot run with
    pub fn validate(&self) -> steadylink_error::Result<()> {
        if self.min_timeout.is_zero() {
            return Err(Error::ConfigError("calibrator min_timeout must be positive".into()));
        }
        if self.min_timeout > self.max_timeout {
            return Err(Error::ConfigError(format!(
                "calibrator min_timeout ({}ms) exceeds max_timeout ({}ms)",
                self.min_timeout.as_millis(),
                self.max_timeout.as_millis()
            )));
        }
        if !(0.0..=1.0).contains(&self.smoothing_factor) {
            return Err(Error::ConfigError(format!(
                "calibrator smoothing_factor must be within [0, 1], got {}",
                self.smoothing_factor
            )));
        }
        if self.recalibration_interval == 0 || self.calibration_window == 0 || self.history_limit == 0 {
            return Err(Error::ConfigError(
                "calibrator recalibration_interval, calibration_window and history_limit must be positive".into(),
            ));
        }
        Ok(())
    }

    fn clamp(&self, timeout_ms: f64) -> u64 {
        let min = self.min_timeout.as_millis() as f64;
        let max = self.max_timeout.as_millis() as f64;
        timeout_ms.min(max).max(min).round() as u64
    }

    fn initial_timeout_ms(&self) -> u64 {
        self.clamp(self.platform_default.as_millis() as f64)
    }
}

/// One completed request as seen by the calibrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Time from send to response or failure
    pub duration_ms: u64,
    /// Whether the request succeeded
    pub success: bool,
    /// When the request completed
    pub timestamp: DateTime<Utc>,
}

impl RequestRecord {
    /// Record stamped now
    pub fn new(duration: Duration, success: bool) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Persisted calibration state for one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Timeout currently in force
    pub current_timeout_ms: u64,
    /// Most recent requests, oldest first
    pub recent_requests: Vec<RequestRecord>,
    /// Mean duration at the last calibration
    pub average_latency_ms: f64,
    /// p95 duration at the last calibration
    pub p95_latency_ms: f64,
    /// Success rate at the last calibration (0.0 to 1.0)
    pub success_rate: f64,
    /// When the last calibration ran
    pub last_calibration: Option<DateTime<Utc>>,
    /// Network the data belongs to
    pub network_id: Option<String>,
}

impl CalibrationData {
    fn fresh(config: &CalibratorConfig, network_id: Option<String>) -> Self {
        Self {
            current_timeout_ms: config.initial_timeout_ms(),
            recent_requests: Vec::new(),
            average_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            success_rate: 1.0,
            last_calibration: None,
            network_id,
        }
    }

    fn storage_id(&self) -> String {
        self.network_id
            .clone()
            .unwrap_or_else(|| DEFAULT_NETWORK_ID.to_string())
    }
}

#[derive(Debug)]
struct CalibrationState {
    data: CalibrationData,
    since_calibration: u32,
}

/// Learns request timeouts from observed durations
#[derive(Debug)]
pub struct AdaptiveTimeoutCalibrator {
    config: CalibratorConfig,
    store: Option<SharedStore>,
    inner: Mutex<CalibrationState>,
}

impl Default for AdaptiveTimeoutCalibrator {
    fn default() -> Self {
        Self::new(CalibratorConfig::default())
    }
}

impl AdaptiveTimeoutCalibrator {
    /// Create an in-memory calibrator
    pub fn new(config: CalibratorConfig) -> Self {
        let data = CalibrationData::fresh(&config, None);
        Self {
            config,
            store: None,
            inner: Mutex::new(CalibrationState {
                data,
                since_calibration: 0,
            }),
        }
    }

    /// Create a calibrator backed by `store`, restoring data saved for `network_id`
    pub async fn with_store(
        config: CalibratorConfig,
        store: SharedStore,
        network_id: Option<String>,
    ) -> Self {
        let mut data = CalibrationData::fresh(&config, network_id);
        let id = data.storage_id();

        match store.get(CALIBRATION_STORAGE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, CalibrationData>>(&raw) {
                Ok(mut saved) => {
                    if let Some(mut restored) = saved.remove(&id) {
                        restored.current_timeout_ms =
                            config.clamp(restored.current_timeout_ms as f64);
                        if restored.recent_requests.len() > config.history_limit {
                            let excess = restored.recent_requests.len() - config.history_limit;
                            restored.recent_requests.drain(..excess);
                        }
                        restored.network_id = data.network_id.clone();
                        tracing::info!(
                            network = %id,
                            timeout_ms = restored.current_timeout_ms,
                            "Restored timeout calibration"
                        );
                        data = restored;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring unreadable timeout calibration");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Failed to load timeout calibration");
            }
        }

        Self {
            config,
            store: Some(store),
            inner: Mutex::new(CalibrationState {
                data,
                since_calibration: 0,
            }),
        }
    }

    /// Calibrator config
    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }

    /// Timeout currently in force
    pub fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.lock().data.current_timeout_ms)
    }

    /// Copy of the calibration state
    pub fn snapshot(&self) -> CalibrationData {
        self.inner.lock().data.clone()
    }

    /// Network the calibration belongs to
    pub fn network_id(&self) -> Option<String> {
        self.inner.lock().data.network_id.clone()
    }

    /// Record a completed request; recalibrates every `recalibration_interval` calls
    pub async fn record_request(&self, record: RequestRecord) {
        let to_persist = {
            let mut inner = self.inner.lock();
            inner.data.recent_requests.push(record);
            let len = inner.data.recent_requests.len();
            if len > self.config.history_limit {
                inner.data.recent_requests.drain(..len - self.config.history_limit);
            }

            inner.since_calibration += 1;
            if inner.since_calibration >= self.config.recalibration_interval {
                inner.since_calibration = 0;
                self.recalibrate_locked(&mut inner.data);
                Some(inner.data.clone())
            } else {
                None
            }
        };

        if let Some(data) = to_persist {
            self.persist(data).await;
        }
    }

    /// Recompute the timeout from the recorded requests now
    pub fn recalibrate(&self) -> Duration {
        let mut inner = self.inner.lock();
        inner.since_calibration = 0;
        self.recalibrate_locked(&mut inner.data);
        Duration::from_millis(inner.data.current_timeout_ms)
    }

    fn recalibrate_locked(&self, data: &mut CalibrationData) {
        let window = self.config.calibration_window.max(1);
        let start = data.recent_requests.len().saturating_sub(window);
        let recent = &data.recent_requests[start..];
        if recent.is_empty() {
            return;
        }

        let mut durations: Vec<f64> = recent.iter().map(|r| r.duration_ms as f64).collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let n = durations.len();
        let mean = durations.iter().sum::<f64>() / n as f64;
        let rank = ((0.95 * n as f64).ceil() as usize).clamp(1, n);
        let p95 = durations[rank - 1];
        let success_rate = recent.iter().filter(|r| r.success).count() as f64 / n as f64;

        let base = if success_rate < 0.80 {
            p95 * 2.5
        } else if success_rate < 0.90 {
            p95 * 2.0
        } else {
            p95 * 1.5
        };

        let current = data.current_timeout_ms as f64;
        let target = if mean > 0.8 * current {
            base.max(mean * 1.5)
        } else if mean < 0.3 * current && success_rate > 0.95 {
            base.max(mean * 3.0)
        } else {
            base.max(current)
        };

        let alpha = self.config.smoothing_factor;
        let smoothed = current * (1.0 - alpha) + target * alpha;
        let next = self.config.clamp(smoothed);

        tracing::debug!(
            previous_ms = data.current_timeout_ms,
            timeout_ms = next,
            mean_ms = mean,
            p95_ms = p95,
            success_rate,
            "Recalibrated request timeout"
        );

        data.current_timeout_ms = next;
        data.average_latency_ms = mean;
        data.p95_latency_ms = p95;
        data.success_rate = success_rate;
        data.last_calibration = Some(Utc::now());
    }

    /// Switch network. A different id resets calibration to the platform default.
    pub fn set_network_id(&self, network_id: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.data.network_id == network_id {
            return;
        }
        tracing::info!(
            from = ?inner.data.network_id,
            to = ?network_id,
            "Network changed, resetting timeout calibration"
        );
        inner.data = CalibrationData::fresh(&self.config, network_id);
        inner.since_calibration = 0;
    }

    /// Drop recorded requests and return to the platform default
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let network_id = inner.data.network_id.take();
        inner.data = CalibrationData::fresh(&self.config, network_id);
        inner.since_calibration = 0;
    }

    async fn persist(&self, data: CalibrationData) {
        let Some(store) = &self.store else {
            return;
        };

        let mut saved: HashMap<String, CalibrationData> = match store.get(CALIBRATION_STORAGE_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read timeout calibration before save");
                HashMap::new()
            }
        };
        saved.insert(data.storage_id(), data);

        let encoded = match serde_json::to_string(&saved) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to encode timeout calibration");
                return;
            }
        };
        if let Err(e) = store.set(CALIBRATION_STORAGE_KEY, encoded).await {
            tracing::debug!(error = %e, "Failed to persist timeout calibration");
        }
    }
}
