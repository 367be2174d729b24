//! Network quality assessment
//!
//! Probes the health route three ways at once (latency, bandwidth, stability),
//! folds the results into rolling windows and rates the link. Real request
//! outcomes reported by the client feed the same windows.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use steadylink_resilience::{ConnectionAssessment, QualitySample, RollingWindow};
use steadylink_traits::{HttpRequest, SharedTransport};
use tokio::time::Instant;

use crate::{join_url, HEALTH_PATH};

/// Assessor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessorConfig {
    /// Deadline for each probe request
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub probe_timeout: Duration,
    /// Deadline for a whole assessment
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub assessment_budget: Duration,
    /// Size of the bandwidth probe payload
    pub bandwidth_payload_bytes: usize,
    /// Number of stability probes
    pub stability_probes: u32,
    /// Stagger between stability probes
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub stability_spacing: Duration,
    /// Latency samples kept
    pub latency_window: usize,
    /// Outcomes kept for the error rate
    pub error_window: usize,
}

impl Default for AssessorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            assessment_budget: Duration::from_secs(15),
            bandwidth_payload_bytes: 8 * 1024,
            stability_probes: 5,
            stability_spacing: Duration::from_millis(100),
            latency_window: 10,
            error_window: 20,
        }
    }
}

impl AssessorConfig {
    /// Set probe deadline
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set whole-assessment deadline
    pub fn with_assessment_budget(mut self, budget: Duration) -> Self {
        self.assessment_budget = budget;
        self
    }
}

#[derive(Debug)]
struct AssessorState {
    latencies: RollingWindow<f64>,
    outcomes: RollingWindow<bool>,
    last: Option<ConnectionAssessment>,
}

/// Measures the link to the backend and rates it
#[derive(Debug)]
pub struct NetworkQualityAssessor {
    config: AssessorConfig,
    transport: SharedTransport,
    base_url: RwLock<String>,
    state: Mutex<AssessorState>,
}

impl NetworkQualityAssessor {
    /// Creates an assessor probing `base_url`
    pub fn new(transport: SharedTransport, base_url: impl Into<String>, config: AssessorConfig) -> Self {
        let state = AssessorState {
            latencies: RollingWindow::new(config.latency_window),
            outcomes: RollingWindow::new(config.error_window),
            last: None,
        };
        Self {
            config,
            transport,
            base_url: RwLock::new(base_url.into()),
            state: Mutex::new(state),
        }
    }

    /// Retarget the probes, e.g. after discovery
    pub fn set_base_url(&self, url: impl Into<String>) {
        let url = url.into();
        let mut current = self.base_url.write();
        if *current != url {
            tracing::debug!(from = %current, to = %url, "Assessor retargeted");
            *current = url;
        }
    }

    /// URL the probes target
    pub fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    /// Feed a real request outcome into the windows
    pub fn record_outcome(&self, success: bool, latency: Duration) {
        let mut state = self.state.lock();
        state.outcomes.push(success);
        if success {
            state.latencies.push(latency.as_secs_f64() * 1000.0);
        }
    }

    /// Last assessment, however old
    pub fn cached(&self) -> Option<ConnectionAssessment> {
        self.state.lock().last.clone()
    }

    /// Last assessment if younger than `max_age`, otherwise a fresh one
    pub async fn get_cached(&self, max_age: Duration) -> ConnectionAssessment {
        if let Some(cached) = self.cached().filter(|a| a.is_fresh(max_age)) {
            return cached;
        }
        self.assess().await
    }

    /// Probe the link now. Never fails: falls back to a conservative assessment.
    pub async fn assess(&self) -> ConnectionAssessment {
        let assessment = match tokio::time::timeout(self.config.assessment_budget, self.measure()).await {
            Ok(sample) => {
                let assessment = ConnectionAssessment::from_sample(sample);
                tracing::info!(
                    tier = %assessment.tier,
                    latency_ms = assessment.sample.latency_ms,
                    bandwidth_kbps = assessment.sample.bandwidth_kbps,
                    stability_pct = assessment.sample.stability_pct,
                    error_rate_pct = assessment.sample.error_rate_pct,
                    timeout_ms = assessment.recommended_timeout_ms,
                    "Connection assessed"
                );
                assessment
            }
            Err(_) => {
                tracing::warn!(
                    budget_ms = self.config.assessment_budget.as_millis() as u64,
                    "Assessment exceeded its budget, using fallback"
                );
                ConnectionAssessment::fallback()
            }
        };

        self.state.lock().last = Some(assessment.clone());
        assessment
    }

    async fn measure(&self) -> QualitySample {
        let health = join_url(&self.base_url(), HEALTH_PATH);
        let (_, bandwidth_kbps, stability_pct) = tokio::join!(
            self.probe_latency(&health),
            self.probe_bandwidth(&health),
            self.probe_stability(&health),
        );

        let state = self.state.lock();
        let latency_ms = state
            .latencies
            .mean()
            .unwrap_or(self.config.probe_timeout.as_millis() as f64);
        QualitySample::new(latency_ms, bandwidth_kbps, stability_pct, state.outcomes.failure_pct())
    }

    async fn probe_latency(&self, url: &str) {
        let request = HttpRequest::get(url).with_timeout(self.config.probe_timeout);
        let started = Instant::now();
        let ok = matches!(self.transport.send(request).await, Ok(r) if r.is_success());

        let latency_ms = if ok {
            started.elapsed().as_secs_f64() * 1000.0
        } else {
            self.config.probe_timeout.as_millis() as f64
        };
        let mut state = self.state.lock();
        state.outcomes.push(ok);
        state.latencies.push(latency_ms);
    }

    async fn probe_bandwidth(&self, url: &str) -> f64 {
        let payload = vec![0u8; self.config.bandwidth_payload_bytes];
        let sent = payload.len();
        let request = HttpRequest::post(url)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(payload)
            .with_timeout(self.config.probe_timeout);

        let started = Instant::now();
        let result = self.transport.send(request).await;
        let elapsed_ms = (started.elapsed().as_secs_f64() * 1000.0).max(1.0);

        match result {
            Ok(response) if response.is_success() => {
                self.state.lock().outcomes.push(true);
                (sent + response.body.len()) as f64 * 8.0 / elapsed_ms
            }
            _ => {
                self.state.lock().outcomes.push(false);
                0.0
            }
        }
    }

    async fn probe_stability(&self, url: &str) -> f64 {
        let probes = self.config.stability_probes.max(1);
        let spacing = self.config.stability_spacing;

        let results = join_all((0..probes).map(|i| async move {
            tokio::time::sleep(spacing * i).await;
            let request = HttpRequest::head(url).with_timeout(self.config.probe_timeout);
            matches!(self.transport.send(request).await, Ok(r) if r.is_success())
        }))
        .await;

        let successes = {
            let mut state = self.state.lock();
            for ok in &results {
                state.outcomes.push(*ok);
            }
            results.iter().filter(|ok| **ok).count()
        };
        successes as f64 / probes as f64 * 100.0
    }
}
