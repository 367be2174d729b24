//! # Steadylink Resilience
//!
//! Resilience policy for the Steadylink adaptive HTTP client.
//!
//! Everything in this crate is transport-agnostic policy:
//!
//! - **Circuit Breaker**: Stop sending to an endpoint group after repeated failures
//! - **Tier Backoff**: Retry delays chosen by connection quality
//! - **Error Classifier**: Map raw failures to types, severities and recovery options
//! - **Timeout Calibration**: Learn request timeouts from observed durations
//! - **Quality Model**: Tiers, thresholds and per-tier recommendations
//! - **Health Evaluation**: Issues, alert levels and uptime history
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use steadylink_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig,
//!     Backoff, BackoffConfig, QualityTier,
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Circuit breaker for the jobs endpoints
//! let cb = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("jobs")
//!         .with_failure_threshold(5)
//!         .with_recovery_timeout(Duration::from_secs(30))
//! );
//!
//! // Execute with circuit breaker protection
//! let result = cb.execute(|| async {
//!     // Your HTTP call here
//!     Ok::<_, &str>("success")
//! }).await;
//!
//! // Delays for a fair connection: 2s, 4s, 8s, 15s, 20s, ...
//! for delay in Backoff::new(BackoffConfig::for_tier(QualityTier::Fair)) {
//!     tokio::time::sleep(delay).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use steadylink_resilience::{CircuitBreakerRegistry, CircuitBreakerConfig, CircuitState};
//!
//! let registry = CircuitBreakerRegistry::new(
//!     CircuitBreakerConfig::default().with_failure_threshold(3),
//! );
//! let auth = registry.get_or_create("auth");
//! assert_eq!(auth.state(), CircuitState::Closed);
//! ```
//!
//! ## Error Classification
//!
//! ```rust
//! use steadylink_resilience::{ErrorClassifier, FailureSignal, QualityTier};
//! use steadylink_error::ErrorType;
//!
//! let classifier = ErrorClassifier::new();
//! let c = classifier.classify(&FailureSignal::status(503), Some(QualityTier::Good), None, 1);
//! assert_eq!(c.error_type, ErrorType::ServerUnavailable);
//! assert!(c.retry_recommended);
//!
//! let c = classifier.classify(&FailureSignal::status(401), None, None, 1);
//! assert!(!c.retry_recommended);
//! ```
//!
//! ## Quality Tiers
//!
//! ```rust
//! use steadylink_resilience::{ConnectionAssessment, QualitySample, QualityTier};
//!
//! let assessment = ConnectionAssessment::from_sample(QualitySample::new(250.0, 800.0, 95.0, 2.0));
//! assert_eq!(assessment.tier, QualityTier::Good);
//! assert_eq!(assessment.max_retries, 5);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit_breaker;
pub mod classifier;
pub mod health;
pub mod quality;
pub mod timeout;

// Re-export main types
pub use backoff::{Backoff, BackoffConfig, BackoffStrategy};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitMetrics, CircuitOpenError, CircuitState,
};

pub use classifier::{parse_retry_after, ErrorClassifier, FailureSignal};

pub use health::{
    default_alert_thresholds, default_health_thresholds, detect_issues, is_healthy,
    DetectedIssue, HealthIssue, HealthStatus, IssueKind, IssueTracker, UptimeHistory,
};

pub use quality::{
    ConnectionAssessment, QualitySample, QualityThresholds, QualityTier, RollingWindow,
    TierRecommendation,
};

pub use timeout::{
    with_timeout, AdaptiveTimeoutCalibrator, CalibrationData, CalibratorConfig, RequestRecord,
    TimeoutError, DEFAULT_NETWORK_ID,
};

/// Serde helper storing a [`std::time::Duration`] as integer milliseconds
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_circuit_breaker_creation() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_backoff_config() {
        let config = BackoffConfig::default();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.strategy, BackoffStrategy::Conservative);
    }

    #[test]
    fn test_calibrator_config() {
        let config = CalibratorConfig::default();
        assert_eq!(config.platform_default, Duration::from_secs(30));
        assert!(config.min_timeout < config.max_timeout);
    }

    #[test]
    fn test_config_json_uses_millis() {
        let json = serde_json::to_value(CircuitBreakerConfig::default()).unwrap();
        assert_eq!(json["recovery_timeout"], 30_000);

        let config: CalibratorConfig =
            serde_json::from_str(r#"{"min_timeout": 2000}"#).unwrap();
        assert_eq!(config.min_timeout, Duration::from_secs(2));
        assert_eq!(config.max_timeout, Duration::from_secs(120));
    }
}
