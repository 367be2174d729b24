//! Connection quality model
//!
//! Maps a measured [`QualitySample`] to a [`QualityTier`] and the tier to a
//! retry/timeout recommendation. Pure data and arithmetic; the probing itself
//! lives in the provider crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::backoff::BackoffStrategy;

/// Upper bound for any recommended timeout
pub const MAX_RECOMMENDED_TIMEOUT: Duration = Duration::from_secs(120);

/// Stability below which the recommended timeout is stretched
pub const UNSTABLE_BELOW_PCT: f64 = 80.0;

/// Connection quality, best first.
///
/// The derived ordering runs from best to worst, so `Excellent < Poor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Low latency, high bandwidth, stable
    Excellent,
    /// Typical good Wi-Fi or LTE
    Good,
    /// Usable but slow or flaky
    Fair,
    /// Everything else
    Poor,
}

impl QualityTier {
    /// All tiers from best to worst
    pub const ALL: [QualityTier; 4] = [Self::Excellent, Self::Good, Self::Fair, Self::Poor];

    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }

    /// Thresholds a sample must meet to be rated this tier; `None` for Poor
    pub fn thresholds(&self) -> Option<QualityThresholds> {
        match self {
            Self::Excellent => Some(QualityThresholds::new(100.0, 1000.0, 95.0, 1.0)),
            Self::Good => Some(QualityThresholds::new(300.0, 500.0, 90.0, 5.0)),
            Self::Fair => Some(QualityThresholds::new(1000.0, 100.0, 75.0, 15.0)),
            Self::Poor => None,
        }
    }

    /// Nominal latency bound of the tier. Poor borrows the Fair bound.
    pub fn latency_bound_ms(&self) -> f64 {
        match self {
            Self::Excellent => 100.0,
            Self::Good => 300.0,
            Self::Fair | Self::Poor => 1000.0,
        }
    }

    /// Timeout, retry budget and backoff table for the tier
    pub fn recommendation(&self) -> TierRecommendation {
        match self {
            Self::Excellent => TierRecommendation {
                timeout: Duration::from_secs(10),
                max_retries: 3,
                backoff_strategy: BackoffStrategy::Linear,
            },
            Self::Good => TierRecommendation {
                timeout: Duration::from_secs(20),
                max_retries: 5,
                backoff_strategy: BackoffStrategy::Exponential,
            },
            Self::Fair => TierRecommendation {
                timeout: Duration::from_secs(40),
                max_retries: 7,
                backoff_strategy: BackoffStrategy::Extended,
            },
            Self::Poor => TierRecommendation {
                timeout: Duration::from_secs(60),
                max_retries: 10,
                backoff_strategy: BackoffStrategy::Conservative,
            },
        }
    }

    /// Floor applied to the calibrated timeout for requests on this tier
    pub fn minimum_timeout(&self) -> Duration {
        match self {
            Self::Excellent => Duration::from_secs(5),
            Self::Good => Duration::from_secs(10),
            Self::Fair => Duration::from_secs(20),
            Self::Poor => Duration::from_secs(30),
        }
    }

    /// First tier, best first, whose thresholds all hold; Poor otherwise
    pub fn classify(sample: &QualitySample) -> Self {
        Self::ALL
            .into_iter()
            .find(|tier| {
                tier.thresholds()
                    .map(|t| t.is_met_by(sample))
                    .unwrap_or(true)
            })
            .unwrap_or(Self::Poor)
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-dimensional bound on a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Latency must be at most this
    pub max_latency_ms: f64,
    /// Bandwidth must be at least this
    pub min_bandwidth_kbps: f64,
    /// Stability must be at least this
    pub min_stability_pct: f64,
    /// Error rate must be at most this
    pub max_error_rate_pct: f64,
}

impl QualityThresholds {
    /// Create thresholds
    pub fn new(
        max_latency_ms: f64,
        min_bandwidth_kbps: f64,
        min_stability_pct: f64,
        max_error_rate_pct: f64,
    ) -> Self {
        Self {
            max_latency_ms,
            min_bandwidth_kbps,
            min_stability_pct,
            max_error_rate_pct,
        }
    }

    /// True when every dimension is within bounds
    pub fn is_met_by(&self, sample: &QualitySample) -> bool {
        sample.latency_ms <= self.max_latency_ms
            && sample.bandwidth_kbps >= self.min_bandwidth_kbps
            && sample.stability_pct >= self.min_stability_pct
            && sample.error_rate_pct <= self.max_error_rate_pct
    }
}

/// What to do on a connection of a given tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRecommendation {
    /// Request timeout
    #[serde(with = "crate::serde_millis")]
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay table between retries
    pub backoff_strategy: BackoffStrategy,
}

/// One measurement of the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    /// Round-trip latency
    pub latency_ms: f64,
    /// Throughput
    pub bandwidth_kbps: f64,
    /// Share of stability probes that succeeded, percent
    pub stability_pct: f64,
    /// Share of recent requests that failed, percent
    pub error_rate_pct: f64,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

impl QualitySample {
    /// Create a sample stamped now
    pub fn new(latency_ms: f64, bandwidth_kbps: f64, stability_pct: f64, error_rate_pct: f64) -> Self {
        Self {
            latency_ms,
            bandwidth_kbps,
            stability_pct,
            error_rate_pct,
            timestamp: Utc::now(),
        }
    }

    /// Sample used when no measurement could be made
    pub fn unmeasured() -> Self {
        Self::new(0.0, 0.0, 0.0, 100.0)
    }
}

/// Result of assessing the link: tier plus recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAssessment {
    /// Tier the sample falls into
    pub tier: QualityTier,
    /// The measurement
    pub sample: QualitySample,
    /// Timeout after latency and stability adjustments
    pub recommended_timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay table between retries
    pub backoff_strategy: BackoffStrategy,
    /// True when produced by the conservative fallback path
    pub is_fallback: bool,
    /// Monotonic time the assessment was made, for cache ageing
    #[serde(skip, default = "Instant::now")]
    pub assessed_at: Instant,
}

impl ConnectionAssessment {
    /// Classify a sample and derive the adjusted recommendation
    pub fn from_sample(sample: QualitySample) -> Self {
        let tier = QualityTier::classify(&sample);
        let recommendation = tier.recommendation();

        let mut timeout_ms = recommendation.timeout.as_millis() as f64;
        if sample.latency_ms > tier.latency_bound_ms() {
            timeout_ms = timeout_ms.max(sample.latency_ms * 20.0);
        }
        if sample.stability_pct < UNSTABLE_BELOW_PCT {
            timeout_ms *= 1.5;
        }
        let timeout_ms = timeout_ms.min(MAX_RECOMMENDED_TIMEOUT.as_millis() as f64);

        Self {
            tier,
            sample,
            recommended_timeout_ms: timeout_ms.round() as u64,
            max_retries: recommendation.max_retries,
            backoff_strategy: recommendation.backoff_strategy,
            is_fallback: false,
            assessed_at: Instant::now(),
        }
    }

    /// Conservative assessment used when measuring failed outright
    pub fn fallback() -> Self {
        let recommendation = QualityTier::Poor.recommendation();
        Self {
            tier: QualityTier::Poor,
            sample: QualitySample::unmeasured(),
            recommended_timeout_ms: recommendation.timeout.as_millis() as u64,
            max_retries: recommendation.max_retries,
            backoff_strategy: recommendation.backoff_strategy,
            is_fallback: true,
            assessed_at: Instant::now(),
        }
    }

    /// Recommended timeout as a [`Duration`]
    pub fn recommended_timeout(&self) -> Duration {
        Duration::from_millis(self.recommended_timeout_ms)
    }

    /// Time since the assessment was made
    pub fn age(&self) -> Duration {
        self.assessed_at.elapsed()
    }

    /// True when younger than `max_age`
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() <= max_age
    }
}

/// Bounded FIFO of recent values
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    capacity: usize,
    values: VecDeque<T>,
}

impl<T> RollingWindow<T> {
    /// Create an empty window holding at most `capacity` values
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Push a value, evicting the oldest when full
    pub fn push(&mut self, value: T) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Number of values held
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    /// Drop every value
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl RollingWindow<f64> {
    /// Arithmetic mean, `None` when empty
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }
}

impl RollingWindow<bool> {
    /// Share of `false` entries as a percentage, 0 when empty
    pub fn failure_pct(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let failures = self.values.iter().filter(|ok| !**ok).count();
        failures as f64 / self.values.len() as f64 * 100.0
    }
}
