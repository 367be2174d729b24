//! Tier-aware retry backoff
//!
//! Each connection quality tier has its own delay table. Delays are computed from
//! the 1-based retry number, capped at the strategy maximum, then optionally
//! jittered and capped again.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::quality::QualityTier;

/// Delay table used between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// 500ms × n, up to 3s
    Linear,
    /// 1s × 2^(n-1), up to 10s
    Exponential,
    /// 2, 4, 8, 15, 20s
    Extended,
    /// 5, 10, 20, 30, 45, 60s
    Conservative,
}

const EXTENDED_STEPS_MS: [u64; 5] = [2_000, 4_000, 8_000, 15_000, 20_000];
const CONSERVATIVE_STEPS_MS: [u64; 6] = [5_000, 10_000, 20_000, 30_000, 45_000, 60_000];

impl BackoffStrategy {
    /// Strategy recommended for a quality tier
    pub fn for_tier(tier: QualityTier) -> Self {
        match tier {
            QualityTier::Excellent => Self::Linear,
            QualityTier::Good => Self::Exponential,
            QualityTier::Fair => Self::Extended,
            QualityTier::Poor => Self::Conservative,
        }
    }

    /// Largest delay this strategy will produce
    pub fn max_delay(&self) -> Duration {
        match self {
            Self::Linear => Duration::from_secs(3),
            Self::Exponential => Duration::from_secs(10),
            Self::Extended => Duration::from_secs(20),
            Self::Conservative => Duration::from_secs(60),
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based; 0 is treated as 1)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let n = retry.max(1);
        let ms = match self {
            Self::Linear => 500u64.saturating_mul(n as u64),
            Self::Exponential => {
                let shift = (n - 1).min(20);
                1_000u64.saturating_mul(1u64 << shift)
            }
            Self::Extended => table_step(&EXTENDED_STEPS_MS, n),
            Self::Conservative => table_step(&CONSERVATIVE_STEPS_MS, n),
        };
        Duration::from_millis(ms).min(self.max_delay())
    }

    /// Delay before retry number `retry` with `jitter` (0.0 to 1.0) applied
    pub fn delay(&self, retry: u32, jitter: f64) -> Duration {
        let base = self.base_delay(retry);
        apply_jitter(base, jitter).min(self.max_delay())
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
            Self::Extended => write!(f, "extended"),
            Self::Conservative => write!(f, "conservative"),
        }
    }
}

fn table_step(steps: &[u64], n: u32) -> u64 {
    let idx = (n as usize).saturating_sub(1).min(steps.len() - 1);
    steps[idx]
}

fn apply_jitter(base: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }

    let mut rng = rand::thread_rng();
    let range = base.as_secs_f64() * jitter;
    let offset = rng.gen_range(-range..range);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

/// Backoff configuration for one logical request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay table
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::for_tier(QualityTier::Poor)
    }
}

impl BackoffConfig {
    /// Config matching the recommendation for a tier, without jitter
    pub fn for_tier(tier: QualityTier) -> Self {
        let recommendation = tier.recommendation();
        Self {
            strategy: recommendation.backoff_strategy,
            jitter: 0.0,
            max_retries: recommendation.max_retries,
        }
    }

    /// Set strategy
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set retry budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Backoff iterator yielding the delay before each retry
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    retry: u32,
}

impl Backoff {
    /// Create a new backoff instance
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, retry: 0 }
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.retry
    }

    /// Check if more retries are allowed
    pub fn can_retry(&self) -> bool {
        self.retry < self.config.max_retries
    }

    /// Get remaining retries
    pub fn remaining(&self) -> u32 {
        self.config.max_retries.saturating_sub(self.retry)
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.retry = 0;
    }

    /// Strategy in use
    pub fn strategy(&self) -> BackoffStrategy {
        self.config.strategy
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.can_retry() {
            return None;
        }
        self.retry += 1;
        Some(self.config.strategy.delay(self.retry, self.config.jitter))
    }
}
