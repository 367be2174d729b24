//! Failure classification
//!
//! Turns a raw failure (transport error, HTTP status, breaker rejection) into an
//! [`ErrorClassification`]: what kind of failure it is, how severe, whether a
//! retry is worth it, and what the user can do. Pure and deterministic: the same
//! inputs always give the same output.

use std::time::Duration;
use steadylink_error::{Confidence, ErrorClassification, ErrorType, RecoveryOption, Severity};
use steadylink_traits::TransportError;

use crate::circuit_breaker::CircuitState;
use crate::quality::QualityTier;

/// Wait suggested for 429 responses without a usable `Retry-After`
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(5);

/// Wait suggested for a 5xx response
pub const SERVER_ERROR_WAIT: Duration = Duration::from_secs(5);

/// Raw failure as observed by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSignal {
    /// No status was received
    Transport(TransportError),
    /// A non-2xx status was received
    Status {
        /// HTTP status
        status: u16,
        /// Parsed `Retry-After` hint
        retry_after: Option<Duration>,
    },
    /// The local breaker refused to send
    CircuitOpen {
        /// Time until the breaker lets a trial through
        retry_after: Duration,
    },
    /// Anything else
    Other(String),
}

impl FailureSignal {
    /// Status signal without a hint
    pub fn status(status: u16) -> Self {
        Self::Status {
            status,
            retry_after: None,
        }
    }

    /// HTTP status, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Transport(e) => e.to_string(),
            Self::Status { status, .. } => format!("HTTP {status}"),
            Self::CircuitOpen { retry_after } => {
                format!("circuit open, retry in {}ms", retry_after.as_millis())
            }
            Self::Other(message) => message.clone(),
        }
    }
}

impl From<TransportError> for FailureSignal {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

/// Parse a `Retry-After` value given in seconds.
///
/// HTTP-date values are not supported and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Stateless failure classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create a classifier
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure.
    ///
    /// `previous_attempts` counts attempts already made for the same logical
    /// request, including the one that produced `signal`.
    pub fn classify(
        &self,
        signal: &FailureSignal,
        tier: Option<QualityTier>,
        circuit_state: Option<CircuitState>,
        previous_attempts: u32,
    ) -> ErrorClassification {
        let technical = signal.describe();
        let status = signal.http_status();

        let is_timeout = matches!(signal, FailureSignal::Transport(e) if e.is_timeout())
            || status == Some(408);
        if is_timeout {
            let severity = if tier == Some(QualityTier::Poor) || previous_attempts > 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            return ErrorClassification::new(
                ErrorType::ConnectionTimeout,
                severity,
                technical,
                "The server is taking too long to respond. Your connection may be slow.",
            )
            .with_retry(true)
            .with_option(RecoveryOption::Retry)
            .with_option(RecoveryOption::CheckNetwork);
        }

        if let Some(status) = status {
            if status >= 500 {
                let severity = if previous_attempts > 3 {
                    Severity::Critical
                } else {
                    Severity::High
                };
                return ErrorClassification::new(
                    ErrorType::ServerUnavailable,
                    severity,
                    technical,
                    "The server is temporarily unavailable. Please try again shortly.",
                )
                .with_retry(true)
                .with_option(RecoveryOption::WaitAndRetry {
                    wait_ms: SERVER_ERROR_WAIT.as_millis() as u64,
                })
                .with_option(RecoveryOption::ContactSupport);
            }

            if status == 401 {
                return ErrorClassification::new(
                    ErrorType::AuthenticationFailed,
                    Severity::Medium,
                    technical,
                    "Your session has expired or your credentials are incorrect.",
                )
                .with_retry(false)
                .with_option(RecoveryOption::SignInAgain);
            }

            if status == 429 {
                let wait = match signal {
                    FailureSignal::Status {
                        retry_after: Some(after),
                        ..
                    } => *after,
                    _ => DEFAULT_RATE_LIMIT_WAIT,
                };
                return ErrorClassification::new(
                    ErrorType::RateLimited,
                    Severity::Medium,
                    technical,
                    "Too many requests. Please wait a moment before trying again.",
                )
                .with_retry(true)
                .with_option(RecoveryOption::WaitAndRetry {
                    wait_ms: wait.as_millis() as u64,
                })
                .with_option(RecoveryOption::Retry)
                .with_retry_after(wait);
            }
        }

        if matches!(signal, FailureSignal::Transport(e) if e.is_unreachable()) {
            return ErrorClassification::new(
                ErrorType::NetworkUnreachable,
                Severity::High,
                technical,
                "Cannot reach the server. Check that you are connected to the network.",
            )
            .with_retry(true)
            .with_option(RecoveryOption::CheckNetwork)
            .with_option(RecoveryOption::Retry)
            .with_option(RecoveryOption::UseOfflineMode);
        }

        let breaker_wait = match signal {
            FailureSignal::CircuitOpen { retry_after } => Some(*retry_after),
            _ if circuit_state == Some(CircuitState::Open) => Some(Duration::ZERO),
            _ => None,
        };
        if let Some(wait) = breaker_wait {
            return ErrorClassification::new(
                ErrorType::CircuitBreakerOpen,
                Severity::Medium,
                technical,
                "The service is recovering from repeated failures. Please wait before trying again.",
            )
            .with_retry(true)
            .with_option(RecoveryOption::WaitAndRetry {
                wait_ms: wait.as_millis() as u64,
            })
            .with_option(RecoveryOption::UseOfflineMode)
            .with_retry_after(wait);
        }

        // remaining 4xx are request errors and never retried
        if let Some(status) = status.filter(|s| (400..500).contains(s)) {
            return ErrorClassification::new(
                ErrorType::Unknown,
                Severity::Low,
                format!("HTTP {status} rejected by server"),
                "The request could not be completed. Please check your input.",
            )
            .with_retry(false)
            .with_option(RecoveryOption::ContactSupport);
        }

        ErrorClassification::new(
            ErrorType::Unknown,
            Severity::Medium,
            technical,
            "Something went wrong. Please try again.",
        )
        .with_retry(true)
        .with_confidence(Confidence::Low)
        .with_option(RecoveryOption::Retry)
        .with_option(RecoveryOption::ContactSupport)
    }
}
