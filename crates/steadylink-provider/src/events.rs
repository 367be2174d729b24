//! Events published by the resilient client

use serde::{Deserialize, Serialize};
use steadylink_error::ErrorType;
use steadylink_traits::HttpMethod;

/// Something the client did, for progress UIs and logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Human-readable progress text
    Progress {
        /// Message to show
        message: String,
    },
    /// An attempt is about to be sent
    AttemptStarted {
        /// Method
        method: HttpMethod,
        /// Full URL
        url: String,
        /// 1-based attempt number
        attempt: u32,
        /// Deadline for this attempt
        timeout_ms: u64,
    },
    /// An attempt failed and another one will follow
    RetryScheduled {
        /// Full URL
        url: String,
        /// Attempt that failed
        attempt: u32,
        /// Wait before the next attempt
        delay_ms: u64,
        /// How the failure was classified
        error_type: ErrorType,
    },
    /// The request got a 2xx
    RequestSucceeded {
        /// Full URL
        url: String,
        /// Response status
        status: u16,
        /// Attempts used
        attempts: u32,
        /// Time across all attempts
        duration_ms: u64,
    },
    /// The request gave up
    RequestFailed {
        /// Full URL
        url: String,
        /// How the last failure was classified
        error_type: ErrorType,
        /// Attempts sent
        attempts: u32,
        /// Message for the user
        user_message: String,
    },
}

impl ClientEvent {
    /// Progress event
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = ClientEvent::RetryScheduled {
            url: "http://localhost:8000/api/jobs".into(),
            attempt: 1,
            delay_ms: 2000,
            error_type: ErrorType::ServerUnavailable,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "retry_scheduled");
        assert_eq!(json["delay_ms"], 2000);
        assert_eq!(json["error_type"], "server-unavailable");
    }
}
