//! # Steadylink Error
//!
//! Unified error types for the Steadylink resilient client. Every failure a caller
//! can observe is reduced to one of a small set of [`ErrorType`]s and carried as an
//! [`ErrorClassification`]: a technical message for logs, a separate message for
//! humans, and an ordered list of [`RecoveryOption`]s.
//!
//! ## Example
//!
//! ```
//! use steadylink_error::{Error, ErrorClassification, ErrorType, Severity};
//!
//! let classification = ErrorClassification::new(
//!     ErrorType::ServerUnavailable,
//!     Severity::High,
//!     "HTTP 503 from /api/jobs",
//!     "The server is temporarily unavailable.",
//! )
//! .with_retry(true);
//!
//! let err = Error::request(classification, Some(503), 1);
//! assert!(err.is_retryable());
//! assert_eq!(err.error_type(), Some(ErrorType::ServerUnavailable));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of failure, independent of where it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ErrorType {
    /// The request did not complete before its deadline (or was aborted)
    ConnectionTimeout,
    /// The backend answered with a 5xx status
    ServerUnavailable,
    /// The backend could not be reached at all
    NetworkUnreachable,
    /// The backend rejected the credentials (401)
    AuthenticationFailed,
    /// The backend asked the client to slow down (429)
    RateLimited,
    /// The local circuit breaker refused to send the request
    CircuitBreakerOpen,
    /// Anything else
    Unknown,
}

impl ErrorType {
    /// Stable kebab-case identifier, suitable for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "connection-timeout",
            Self::ServerUnavailable => "server-unavailable",
            Self::NetworkUnreachable => "network-unreachable",
            Self::AuthenticationFailed => "authentication-failed",
            Self::RateLimited => "rate-limited",
            Self::CircuitBreakerOpen => "circuit-breaker-open",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure (or a health issue) is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Severity {
    /// Cosmetic or self-healing
    Low,
    /// Noticeable, usually transient
    Medium,
    /// Operation is failing
    High,
    /// Operation cannot succeed without intervention
    Critical,
}

impl Severity {
    /// One step more severe, saturating at [`Severity::Critical`]
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// How sure the classifier is about the chosen [`ErrorType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Confidence {
    /// Fell through to a catch-all branch
    Low,
    /// Matched on a strong signal (status code, transport error kind)
    High,
}

/// Something a user (or the calling code) can do about a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "action", rename_all = "kebab-case"))]
pub enum RecoveryOption {
    /// Try the same operation again now
    Retry,
    /// Wait before trying again
    WaitAndRetry {
        /// Suggested wait in milliseconds
        wait_ms: u64,
    },
    /// Check Wi-Fi / mobile data / VPN
    CheckNetwork,
    /// Credentials are stale or wrong
    SignInAgain,
    /// Continue without the backend
    UseOfflineMode,
    /// Nothing local will help
    ContactSupport,
}

impl RecoveryOption {
    /// Short label suitable for a button or a bullet point
    pub fn label(&self) -> String {
        match self {
            Self::Retry => "Try again".to_string(),
            Self::WaitAndRetry { wait_ms } => {
                let secs = wait_ms.div_ceil(1000).max(1);
                format!("Wait {secs}s and try again")
            }
            Self::CheckNetwork => "Check your network connection".to_string(),
            Self::SignInAgain => "Sign in again".to_string(),
            Self::UseOfflineMode => "Continue in offline mode".to_string(),
            Self::ContactSupport => "Contact support".to_string(),
        }
    }
}

/// Result of classifying a raw failure.
///
/// Produced by the resilience crate's classifier; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ErrorClassification {
    /// Kind of failure
    pub error_type: ErrorType,
    /// How bad it is
    pub severity: Severity,
    /// Message for logs
    pub technical_message: String,
    /// Message for humans
    pub user_message: String,
    /// Whether retrying locally is expected to help
    pub retry_recommended: bool,
    /// Ordered recovery suggestions, most useful first
    pub recovery_options: Vec<RecoveryOption>,
    /// How sure the classifier is
    pub confidence: Confidence,
    /// Earliest useful retry, in milliseconds from now
    pub retry_after_ms: Option<u64>,
}

impl ErrorClassification {
    /// Create a classification with no recovery options and no retry
    pub fn new(
        error_type: ErrorType,
        severity: Severity,
        technical_message: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            severity,
            technical_message: technical_message.into(),
            user_message: user_message.into(),
            retry_recommended: false,
            recovery_options: Vec::new(),
            confidence: Confidence::High,
            retry_after_ms: None,
        }
    }

    /// Set whether a retry is recommended
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry_recommended = retry;
        self
    }

    /// Append a recovery option
    pub fn with_option(mut self, option: RecoveryOption) -> Self {
        self.recovery_options.push(option);
        self
    }

    /// Set classifier confidence
    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set the earliest useful retry
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after_ms = Some(after.as_millis() as u64);
        self
    }

    /// Earliest useful retry as a [`Duration`]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.technical_message)
    }
}

/// The main error type for Steadylink operations.
#[derive(Error, Debug)]
pub enum Error {
    // ============ Request Errors ============
    /// A logical request failed after the retry policy gave up
    #[error("Request failed after {attempts} attempt(s): {classification}")]
    Request {
        /// What went wrong
        classification: Box<ErrorClassification>,
        /// HTTP status of the last response, if any
        status: Option<u16>,
        /// Number of attempts that reached the transport or the breaker
        attempts: u32,
    },

    // ============ Setup Errors ============
    /// A URL could not be parsed or joined
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ============ Parsing Errors ============
    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    JsonError(String),

    // ============ IO Errors ============
    /// File IO error
    #[error("IO error: {0}")]
    IoError(String),

    // ============ Generic ============
    /// Unknown/other error
    #[error("{0}")]
    Other(String),

    /// Wrapped error from external source
    #[error("External error: {message}")]
    External {
        /// Error message
        message: String,
    },
}

/// Convenient Result type using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::Request`]
    pub fn request(classification: ErrorClassification, status: Option<u16>, attempts: u32) -> Self {
        Error::Request {
            classification: Box::new(classification),
            status,
            attempts,
        }
    }

    /// Classification of a request failure
    pub fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            Error::Request { classification, .. } => Some(classification),
            _ => None,
        }
    }

    /// Kind of a request failure
    pub fn error_type(&self) -> Option<ErrorType> {
        self.classification().map(|c| c.error_type)
    }

    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Request { classification, .. } => match classification.error_type {
                ErrorType::ConnectionTimeout => ErrorCode::ConnectionTimeout,
                ErrorType::ServerUnavailable => ErrorCode::ServerUnavailable,
                ErrorType::NetworkUnreachable => ErrorCode::NetworkUnreachable,
                ErrorType::AuthenticationFailed => ErrorCode::AuthenticationFailed,
                ErrorType::RateLimited => ErrorCode::RateLimited,
                ErrorType::CircuitBreakerOpen => ErrorCode::CircuitBreakerOpen,
                ErrorType::Unknown => ErrorCode::Unknown,
            },
            Error::InvalidUrl(_) => ErrorCode::InvalidUrl,
            Error::ConfigError(_) => ErrorCode::ConfigError,
            _ => ErrorCode::Unknown,
        }
    }

    /// Returns true if a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        self.classification()
            .map(|c| c.retry_recommended)
            .unwrap_or(false)
    }

    /// Returns the suggested retry delay, if any
    pub fn retry_after(&self) -> Option<Duration> {
        self.classification().and_then(ErrorClassification::retry_after)
    }

    /// Message that is safe to show to a human
    pub fn user_message(&self) -> String {
        match self {
            Error::Request { classification, .. } => classification.user_message.clone(),
            Error::InvalidUrl(_) | Error::ConfigError(_) => {
                "The app is not configured correctly.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }

    /// Recovery options for this error
    pub fn recovery_options(&self) -> &[RecoveryOption] {
        self.classification()
            .map(|c| c.recovery_options.as_slice())
            .unwrap_or(&[])
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::External {
            message: format!("{}: {}", ctx.into(), e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::External {
            message: format!("{}: {}", f(), e),
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| Error::Other(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| Error::Other(f()))
    }
}

// ============ From implementations for common error types ============

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Request deadline exceeded
    ConnectionTimeout = 1001,
    /// Backend 5xx
    ServerUnavailable = 1002,
    /// Backend unreachable
    NetworkUnreachable = 1003,
    /// Credentials rejected
    AuthenticationFailed = 2001,
    /// Too many requests
    RateLimited = 2002,
    /// Local breaker open
    CircuitBreakerOpen = 3001,
    /// Invalid URL
    InvalidUrl = 9001,
    /// Invalid configuration
    ConfigError = 9002,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_classification() -> ErrorClassification {
        ErrorClassification::new(
            ErrorType::ConnectionTimeout,
            Severity::Medium,
            "deadline of 10s exceeded",
            "The server is taking too long to respond.",
        )
        .with_retry(true)
        .with_option(RecoveryOption::Retry)
        .with_retry_after(Duration::from_millis(1500))
    }

    #[test]
    fn test_error_display() {
        let err = Error::request(timeout_classification(), None, 3);
        let text = err.to_string();
        assert!(text.contains("3 attempt"));
        assert!(text.contains("connection-timeout"));
        assert!(text.contains("deadline of 10s exceeded"));
    }

    #[test]
    fn test_error_code() {
        let err = Error::request(timeout_classification(), None, 1);
        assert_eq!(err.code(), ErrorCode::ConnectionTimeout);
        assert_eq!(Error::InvalidUrl("x".into()).code(), ErrorCode::InvalidUrl);
    }

    #[test]
    fn test_retryable() {
        let err = Error::request(timeout_classification(), None, 1);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(err.recovery_options(), &[RecoveryOption::Retry]);

        let config = Error::ConfigError("missing port".into());
        assert!(!config.is_retryable());
        assert_eq!(config.retry_after(), None);
        assert!(config.recovery_options().is_empty());
    }

    #[test]
    fn test_user_message_never_technical() {
        let err = Error::request(timeout_classification(), None, 1);
        assert_eq!(err.user_message(), "The server is taking too long to respond.");

        let other = Error::Other("socket closed by peer".into());
        assert!(!other.user_message().contains("socket"));
    }

    #[test]
    fn test_severity_escalate() {
        assert_eq!(Severity::Low.escalate(), Severity::Medium);
        assert_eq!(Severity::High.escalate(), Severity::Critical);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn test_recovery_labels() {
        assert_eq!(
            RecoveryOption::WaitAndRetry { wait_ms: 1200 }.label(),
            "Wait 2s and try again"
        );
        assert_eq!(
            RecoveryOption::WaitAndRetry { wait_ms: 0 }.label(),
            "Wait 1s and try again"
        );
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file missing"));

        let with_ctx = result.context("Failed to load config");
        assert!(with_ctx.is_err());
        assert!(with_ctx.unwrap_err().to_string().contains("Failed to load config"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_classification_serializes_kebab_case() {
        let json = serde_json::to_string(&timeout_classification()).unwrap();
        assert!(json.contains("\"connection-timeout\""));
        assert!(json.contains("\"medium\""));
    }
}
