//! Connection health evaluation
//!
//! Turns a quality sample and the breaker snapshot into a set of health
//! issues, tracks how long each issue has persisted and keeps an uptime
//! history. The periodic loop that feeds this lives in the provider crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use steadylink_error::Severity;
use tokio::time::Instant;

use crate::circuit_breaker::{CircuitMetrics, CircuitState};
use crate::quality::{QualitySample, QualityThresholds};

/// Error rate at or above which an issue is critical
pub const CRITICAL_ERROR_RATE_PCT: f64 = 50.0;

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All health thresholds met, nothing worse than a medium alert
    Healthy,
    /// Reachable but outside the health thresholds
    Degraded,
    /// A check failed or a high/critical issue is active
    Unhealthy,
    /// No check has run yet
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Default health thresholds: 1000ms, 100Kbps, 80%, 10%
pub fn default_health_thresholds() -> QualityThresholds {
    QualityThresholds::new(1000.0, 100.0, 80.0, 10.0)
}

/// Default alert thresholds: 2000ms, 50Kbps, 60%, 25%
pub fn default_alert_thresholds() -> QualityThresholds {
    QualityThresholds::new(2000.0, 50.0, 60.0, 25.0)
}

/// What is wrong
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "circuit", rename_all = "snake_case")]
pub enum IssueKind {
    /// Latency past the alert threshold
    HighLatency,
    /// Bandwidth below the alert threshold
    LowBandwidth,
    /// Stability below the alert threshold
    UnstableConnection,
    /// Error rate past the alert threshold
    HighErrorRate,
    /// A breaker is open
    CircuitOpen(String),
    /// A breaker is probing recovery
    CircuitHalfOpen(String),
}

/// Issue found by a single evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedIssue {
    /// What is wrong
    pub kind: IssueKind,
    /// How bad it is
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
}

/// Issue that has been observed on one or more consecutive checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    /// What is wrong
    pub kind: IssueKind,
    /// How bad it is, as of the latest check
    pub severity: Severity,
    /// Description, as of the latest check
    pub message: String,
    /// First check on which the issue was seen
    pub detected_at: DateTime<Utc>,
    /// How long the issue has been active
    #[serde(with = "crate::serde_millis")]
    pub persistence_duration: Duration,
    #[serde(skip, default = "Instant::now")]
    first_seen: Instant,
}

/// Evaluate a sample and breaker snapshot against alert thresholds
pub fn detect_issues(
    sample: &QualitySample,
    breakers: &[CircuitMetrics],
    alert: &QualityThresholds,
) -> Vec<DetectedIssue> {
    let mut issues = Vec::new();

    if sample.latency_ms > alert.max_latency_ms {
        let severity = if sample.latency_ms > alert.max_latency_ms * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        issues.push(DetectedIssue {
            kind: IssueKind::HighLatency,
            severity,
            message: format!("Latency {:.0}ms exceeds {:.0}ms", sample.latency_ms, alert.max_latency_ms),
        });
    }

    if sample.bandwidth_kbps < alert.min_bandwidth_kbps {
        let severity = if sample.bandwidth_kbps < alert.min_bandwidth_kbps / 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        issues.push(DetectedIssue {
            kind: IssueKind::LowBandwidth,
            severity,
            message: format!(
                "Bandwidth {:.0}Kbps below {:.0}Kbps",
                sample.bandwidth_kbps, alert.min_bandwidth_kbps
            ),
        });
    }

    if sample.stability_pct < alert.min_stability_pct {
        let severity = if sample.stability_pct < alert.min_stability_pct / 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        issues.push(DetectedIssue {
            kind: IssueKind::UnstableConnection,
            severity,
            message: format!(
                "Stability {:.0}% below {:.0}%",
                sample.stability_pct, alert.min_stability_pct
            ),
        });
    }

    if sample.error_rate_pct > alert.max_error_rate_pct {
        let severity = if sample.error_rate_pct >= CRITICAL_ERROR_RATE_PCT {
            Severity::Critical
        } else if sample.error_rate_pct > alert.max_error_rate_pct * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        issues.push(DetectedIssue {
            kind: IssueKind::HighErrorRate,
            severity,
            message: format!(
                "Error rate {:.0}% exceeds {:.0}%",
                sample.error_rate_pct, alert.max_error_rate_pct
            ),
        });
    }

    for breaker in breakers {
        match breaker.state {
            CircuitState::Open => issues.push(DetectedIssue {
                kind: IssueKind::CircuitOpen(breaker.name.clone()),
                severity: Severity::High,
                message: format!("Circuit '{}' is open", breaker.name),
            }),
            CircuitState::HalfOpen => issues.push(DetectedIssue {
                kind: IssueKind::CircuitHalfOpen(breaker.name.clone()),
                severity: Severity::Low,
                message: format!("Circuit '{}' is testing recovery", breaker.name),
            }),
            CircuitState::Closed => {}
        }
    }

    issues
}

/// Active issues keyed by kind
#[derive(Debug, Default)]
pub struct IssueTracker {
    active: HashMap<IssueKind, HealthIssue>,
}

impl IssueTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the result of one check: new issues are added, persisting ones keep
    /// their `detected_at` and grow `persistence_duration`, cleared ones are removed.
    pub fn update(&mut self, detected: Vec<DetectedIssue>) {
        let now = Instant::now();
        let mut next = HashMap::with_capacity(detected.len());

        for issue in detected {
            let entry = match self.active.remove(&issue.kind) {
                Some(mut existing) => {
                    existing.severity = issue.severity;
                    existing.message = issue.message;
                    existing.persistence_duration = now.saturating_duration_since(existing.first_seen);
                    existing
                }
                None => {
                    tracing::info!(issue = ?issue.kind, severity = %issue.severity, "Health issue detected");
                    HealthIssue {
                        kind: issue.kind.clone(),
                        severity: issue.severity,
                        message: issue.message,
                        detected_at: Utc::now(),
                        persistence_duration: Duration::ZERO,
                        first_seen: now,
                    }
                }
            };
            next.insert(issue.kind, entry);
        }

        for cleared in self.active.keys() {
            tracing::info!(issue = ?cleared, "Health issue cleared");
        }
        self.active = next;
    }

    /// Active issues, most severe first
    pub fn issues(&self) -> Vec<HealthIssue> {
        let mut issues: Vec<_> = self.active.values().cloned().collect();
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        issues
    }

    /// Highest active severity
    pub fn alert_level(&self) -> Option<Severity> {
        self.active.values().map(|i| i.severity).max()
    }

    /// Drop all issues
    pub fn clear(&mut self) {
        self.active.clear();
    }
}

/// True when every health threshold is met and no issue is worse than Medium
pub fn is_healthy(sample: &QualitySample, health: &QualityThresholds, alert_level: Option<Severity>) -> bool {
    health.is_met_by(sample) && alert_level.map_or(true, |level| level <= Severity::Medium)
}

/// Time-bounded history of check outcomes
#[derive(Debug)]
pub struct UptimeHistory {
    window: Duration,
    entries: VecDeque<(Instant, bool)>,
}

impl UptimeHistory {
    /// Keep outcomes for `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    /// Record one check outcome
    pub fn record(&mut self, healthy: bool) {
        let now = Instant::now();
        self.entries.push_back((now, healthy));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.entries.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Share of healthy checks in the window; 100 when empty
    pub fn uptime_pct(&mut self) -> f64 {
        self.prune(Instant::now());
        if self.entries.is_empty() {
            return 100.0;
        }
        let healthy = self.entries.iter().filter(|(_, ok)| *ok).count();
        healthy as f64 / self.entries.len() as f64 * 100.0
    }

    /// Outcomes in the window
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no outcome is in the window
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

    fn good_sample() -> QualitySample {
        QualitySample::new(120.0, 900.0, 100.0, 0.0)
    }

    fn kinds(issues: &[DetectedIssue]) -> Vec<IssueKind> {
        issues.iter().map(|i| i.kind.clone()).collect()
    }

    #[test]
    fn test_no_issues_on_good_link() {
        let issues = detect_issues(&good_sample(), &[], &default_alert_thresholds());
        assert!(issues.is_empty());
        assert!(is_healthy(&good_sample(), &default_health_thresholds(), None));
    }

    #[test]
    fn test_latency_severity() {
        let alert = default_alert_thresholds();
        let mut sample = good_sample();

        sample.latency_ms = 2500.0;
        let issues = detect_issues(&sample, &[], &alert);
        assert_eq!(kinds(&issues), vec![IssueKind::HighLatency]);
        assert_eq!(issues[0].severity, Severity::Medium);

        sample.latency_ms = 4500.0;
        assert_eq!(detect_issues(&sample, &[], &alert)[0].severity, Severity::High);
    }

    #[test]
    fn test_lower_is_worse_metrics_use_half() {
        let alert = default_alert_thresholds();
        let mut sample = good_sample();
        sample.bandwidth_kbps = 40.0;
        sample.stability_pct = 20.0;

        let issues = detect_issues(&sample, &[], &alert);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].kind, IssueKind::LowBandwidth);
        assert_eq!(issues[0].severity, Severity::Medium);
        assert_eq!(issues[1].kind, IssueKind::UnstableConnection);
        assert_eq!(issues[1].severity, Severity::High);
    }

    #[test]
    fn test_error_rate_critical() {
        let alert = default_alert_thresholds();
        let mut sample = good_sample();

        sample.error_rate_pct = 30.0;
        assert_eq!(detect_issues(&sample, &[], &alert)[0].severity, Severity::Medium);

        sample.error_rate_pct = 50.0;
        assert_eq!(detect_issues(&sample, &[], &alert)[0].severity, Severity::Critical);
    }

    #[test]
    fn test_breaker_issues() {
        let open = CircuitBreaker::new(CircuitBreakerConfig::new("jobs"));
        open.force_open();
        let closed = CircuitBreaker::with_name("auth");

        let issues = detect_issues(
            &good_sample(),
            &[open.metrics(), closed.metrics()],
            &default_alert_thresholds(),
        );
        assert_eq!(kinds(&issues), vec![IssueKind::CircuitOpen("jobs".into())]);
        assert_eq!(issues[0].severity, Severity::High);

        let mut tracker = IssueTracker::new();
        tracker.update(issues);
        assert!(!is_healthy(
            &good_sample(),
            &default_health_thresholds(),
            tracker.alert_level()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_persistence() {
        let mut tracker = IssueTracker::new();
        let mut sample = good_sample();
        sample.latency_ms = 3000.0;
        let alert = default_alert_thresholds();

        tracker.update(detect_issues(&sample, &[], &alert));
        let first = tracker.issues()[0].clone();
        assert_eq!(first.persistence_duration, Duration::ZERO);

        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.update(detect_issues(&sample, &[], &alert));
        let second = tracker.issues()[0].clone();
        assert_eq!(second.detected_at, first.detected_at);
        assert_eq!(second.persistence_duration, Duration::from_secs(30));

        tracker.update(detect_issues(&good_sample(), &[], &alert));
        assert!(tracker.issues().is_empty());
        assert_eq!(tracker.alert_level(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_history_window() {
        let mut history = UptimeHistory::new(Duration::from_secs(3600));
        history.record(false);
        tokio::time::advance(Duration::from_secs(1800)).await;
        history.record(true);
        assert!((history.uptime_pct() - 50.0).abs() < f64::EPSILON);

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert!((history.uptime_pct() - 100.0).abs() < f64::EPSILON);
        assert_eq!(history.len(), 1);
    }
}
