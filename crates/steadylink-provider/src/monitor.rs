//! Periodic connection health monitoring

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use steadylink_error::{Error, Result, Severity};
use steadylink_resilience::{
    default_alert_thresholds, default_health_thresholds, detect_issues, is_healthy, CircuitBreakerRegistry,
    HealthIssue, HealthStatus, IssueTracker, QualitySample, QualityThresholds, QualityTier, UptimeHistory,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::assessor::NetworkQualityAssessor;

const EVENT_CAPACITY: usize = 32;
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between checks
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub check_interval: Duration,
    /// Deadline for one check
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub check_timeout: Duration,
    /// Bounds a healthy link stays within
    pub health_thresholds: QualityThresholds,
    /// Bounds past which issues are raised
    pub alert_thresholds: QualityThresholds,
    /// How far back uptime is computed
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub history_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(20),
            health_thresholds: default_health_thresholds(),
            alert_thresholds: default_alert_thresholds(),
            history_window: Duration::from_secs(60 * 60),
        }
    }
}

impl MonitorConfig {
    /// Set the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set the per-check deadline
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Reject zero durations
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("check_interval", self.check_interval),
            ("check_timeout", self.check_timeout),
            ("history_window", self.history_window),
        ] {
            if value.is_zero() {
                return Err(Error::ConfigError(format!("monitor {name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Result of one health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Health thresholds met and no alert above Medium
    pub is_healthy: bool,
    /// Link tier, when measured
    pub tier: Option<QualityTier>,
    /// Measured sample, when measured
    pub sample: Option<QualitySample>,
    /// Active issues, most severe first
    pub issues: Vec<HealthIssue>,
    /// Highest active severity
    pub alert_level: Option<Severity>,
    /// Healthy share of checks in the history window
    pub uptime_pct: f64,
    /// When the check finished
    pub checked_at: DateTime<Utc>,
    /// Why the check failed
    pub error: Option<String>,
}

#[derive(Debug)]
struct MonitorState {
    issues: IssueTracker,
    uptime: UptimeHistory,
    last: Option<ConnectionHealthReport>,
}

/// Watches the link and the breakers in the background
#[derive(Debug)]
pub struct ConnectionHealthMonitor {
    config: MonitorConfig,
    assessor: Arc<NetworkQualityAssessor>,
    breakers: Arc<CircuitBreakerRegistry>,
    state: Mutex<MonitorState>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionHealthReport>,
}

impl ConnectionHealthMonitor {
    /// Monitor using `assessor` for samples and `breakers` for circuit issues
    pub fn new(
        assessor: Arc<NetworkQualityAssessor>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: MonitorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = MonitorState {
            issues: IssueTracker::new(),
            uptime: UptimeHistory::new(config.history_window),
            last: None,
        };
        Self {
            config,
            assessor,
            breakers,
            state: Mutex::new(state),
            task: Mutex::new(None),
            events,
        }
    }

    /// Monitor config
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start checking: once now, then every `check_interval`. No-op when running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.check_interval.max(MIN_CHECK_INTERVAL);
        tracing::info!(interval_ms = period.as_millis() as u64, "Health monitor started");

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.perform_health_check().await;
            }
        }));
    }

    /// Stop the background loop
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("Health monitor stopped");
        }
    }

    /// True while the background loop runs
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Receive every report, including failed checks
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionHealthReport> {
        self.events.subscribe()
    }

    /// Last report
    pub fn last_report(&self) -> Option<ConnectionHealthReport> {
        self.state.lock().last.clone()
    }

    /// Currently active issues
    pub fn active_issues(&self) -> Vec<HealthIssue> {
        self.state.lock().issues.issues()
    }

    /// Healthy share of checks in the history window
    pub fn uptime_pct(&self) -> f64 {
        self.state.lock().uptime.uptime_pct()
    }

    /// Run one check now
    pub async fn perform_health_check(&self) -> ConnectionHealthReport {
        let outcome = tokio::time::timeout(self.config.check_timeout, self.assessor.assess()).await;

        let report = match outcome {
            Ok(assessment) if !assessment.is_fallback => {
                let breakers = self.breakers.health_snapshot();
                let detected = detect_issues(&assessment.sample, &breakers, &self.config.alert_thresholds);

                let mut state = self.state.lock();
                state.issues.update(detected);
                let alert_level = state.issues.alert_level();
                let healthy = is_healthy(&assessment.sample, &self.config.health_thresholds, alert_level);
                let status = if healthy {
                    HealthStatus::Healthy
                } else if alert_level.is_some_and(|level| level >= Severity::High) {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                state.uptime.record(healthy);

                let report = ConnectionHealthReport {
                    status,
                    is_healthy: healthy,
                    tier: Some(assessment.tier),
                    sample: Some(assessment.sample),
                    issues: state.issues.issues(),
                    alert_level,
                    uptime_pct: state.uptime.uptime_pct(),
                    checked_at: Utc::now(),
                    error: None,
                };
                state.last = Some(report.clone());
                report
            }
            Ok(_) => self.failed_check("assessment fell back to defaults".to_string()),
            Err(_) => self.failed_check(format!(
                "health check exceeded {}ms",
                self.config.check_timeout.as_millis()
            )),
        };

        if report.error.is_some() {
            tracing::warn!(error = ?report.error, "Health check failed");
        } else {
            tracing::debug!(
                status = %report.status,
                issues = report.issues.len(),
                uptime_pct = report.uptime_pct,
                "Health check complete"
            );
        }
        let _ = self.events.send(report.clone());
        report
    }

    fn failed_check(&self, error: String) -> ConnectionHealthReport {
        let mut state = self.state.lock();
        state.uptime.record(false);
        let report = ConnectionHealthReport {
            status: HealthStatus::Unhealthy,
            is_healthy: false,
            tier: None,
            sample: None,
            issues: state.issues.issues(),
            alert_level: state.issues.alert_level(),
            uptime_pct: state.uptime.uptime_pct(),
            checked_at: Utc::now(),
            error: Some(error),
        };
        state.last = Some(report.clone());
        report
    }
}

impl Drop for ConnectionHealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessor::AssessorConfig;
    use crate::HEALTH_PATH;
    use steadylink_resilience::{CircuitBreakerConfig, IssueKind};
    use steadylink_testing::{Route, ScriptedResponse, ScriptedTransport};

    fn monitor_with(transport: &Arc<ScriptedTransport>, breakers: Arc<CircuitBreakerRegistry>) -> Arc<ConnectionHealthMonitor> {
        let assessor = Arc::new(NetworkQualityAssessor::new(
            transport.clone(),
            "http://localhost:8000",
            AssessorConfig::default(),
        ));
        Arc::new(ConnectionHealthMonitor::new(assessor, breakers, MonitorConfig::default()))
    }

    fn healthy_backend() -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(
            Route::path(HEALTH_PATH),
            ScriptedResponse::ok().with_latency(Duration::from_millis(20)),
        );
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_link() {
        let monitor = monitor_with(&healthy_backend(), Arc::new(CircuitBreakerRegistry::default()));
        let report = monitor.perform_health_check().await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.is_healthy);
        assert!(report.issues.is_empty());
        assert_eq!(report.uptime_pct, 100.0);
        assert_eq!(report.tier, Some(QualityTier::Excellent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_raises_high_issue() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        breakers.get_or_create("jobs").record_failure(Duration::from_millis(5));

        let monitor = monitor_with(&healthy_backend(), breakers.clone());
        let report = monitor.perform_health_check().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.alert_level, Some(Severity::High));
        assert_eq!(report.issues[0].kind, IssueKind::CircuitOpen("jobs".into()));

        breakers.reset_all();
        let report = monitor.perform_health_check().await;
        assert!(report.issues.is_empty());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.uptime_pct, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_persists_across_checks() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(
            Route::path(HEALTH_PATH),
            ScriptedResponse::ok().with_latency(Duration::from_millis(2500)),
        );
        let monitor = monitor_with(&transport, Arc::new(CircuitBreakerRegistry::default()));

        let first = monitor.perform_health_check().await;
        let issue = first
            .issues
            .iter()
            .find(|i| i.kind == IssueKind::HighLatency)
            .cloned()
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = monitor.perform_health_check().await;
        let persisted = second
            .issues
            .iter()
            .find(|i| i.kind == IssueKind::HighLatency)
            .unwrap();

        assert_eq!(persisted.detected_at, issue.detected_at);
        assert!(persisted.persistence_duration >= Duration::from_secs(30));
        assert!(!second.is_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_check_is_unhealthy_and_notified() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(Route::path(HEALTH_PATH), ScriptedResponse::hang());
        let assessor = Arc::new(NetworkQualityAssessor::new(
            transport,
            "http://localhost:8000",
            AssessorConfig::default().with_assessment_budget(Duration::from_secs(60)),
        ));
        let monitor = ConnectionHealthMonitor::new(
            assessor,
            Arc::new(CircuitBreakerRegistry::default()),
            MonitorConfig::default().with_check_timeout(Duration::from_secs(1)),
        );
        let mut events = monitor.subscribe();

        let report = monitor.perform_health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.is_some());
        assert_eq!(monitor.uptime_pct(), 0.0);
        assert_eq!(events.recv().await.unwrap().status, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_checks_immediately_then_on_interval() {
        let monitor = monitor_with(&healthy_backend(), Arc::new(CircuitBreakerRegistry::default()));
        let mut events = monitor.subscribe();

        monitor.start();
        assert!(monitor.is_running());
        events.recv().await.unwrap();

        let before = tokio::time::Instant::now();
        events.recv().await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(29));

        monitor.stop();
        assert!(!monitor.is_running());
        assert!(monitor.last_report().is_some());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        assert!(MonitorConfig::default().validate().is_ok());

        let config: MonitorConfig = serde_json::from_str(r#"{"check_interval": 0}"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let config = MonitorConfig::default().with_check_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_panic_on_start() {
        let assessor = Arc::new(NetworkQualityAssessor::new(
            healthy_backend(),
            "http://localhost:8000",
            AssessorConfig::default(),
        ));
        let config = MonitorConfig::default().with_check_interval(Duration::ZERO);
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            assessor,
            Arc::new(CircuitBreakerRegistry::default()),
            config,
        ));
        let mut events = monitor.subscribe();

        monitor.start();
        events.recv().await.unwrap();
        assert!(monitor.is_running());
        monitor.stop();
    }
}
