//! # Steadylink - Adaptive Resilient HTTP Client
//!
//! Steadylink turns a flaky mobile or LAN link into a dependable channel to a
//! single backend. It measures the link, finds the backend, sizes deadlines
//! from observed latency, isolates failing endpoint groups behind circuit
//! breakers and retries with backoff matched to the link quality.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `default` | Core policy plus the resilient client |
//! | `provider` | Transport, discovery, assessment, preflight, monitor, client |
//! | `testing` | Scripted transport and proptest strategies |
//! | `full` | Everything |
//!
//! ## Quick Start
//!
//! ```no_run
//! use steadylink::prelude::*;
//!
//! # async fn demo() -> steadylink::error::Result<()> {
//! let client = ResilientClient::builder()
//!     .base_url("http://192.168.1.20:8000")
//!     .build()
//!     .await?;
//!
//! match client.get("/api/jobs").await {
//!     Ok(response) => println!("{}", response.text()),
//!     Err(err) => eprintln!("{}", err.user_message()),
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

// ============================================================================
// Core re-exports (always available)
// ============================================================================

pub use steadylink_error as error;
pub use steadylink_resilience as resilience;
pub use steadylink_traits as traits;

pub use steadylink_error::{Error, Result};

// ============================================================================
// Optional re-exports
// ============================================================================

#[cfg(feature = "provider")]
#[cfg_attr(docsrs, doc(cfg(feature = "provider")))]
pub use steadylink_provider as provider;

#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub use steadylink_testing as testing;

// ============================================================================
// Prelude - commonly used types
// ============================================================================

/// Prelude module for convenient imports
///
/// ```
/// use steadylink::prelude::*;
/// ```
pub mod prelude {
    pub use steadylink_error::{ErrorClassification, ErrorType, RecoveryOption, Severity};
    pub use steadylink_resilience::{
        BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionAssessment, QualityTier,
    };
    pub use steadylink_traits::prelude::*;

    #[cfg(feature = "provider")]
    pub use steadylink_provider::{
        ApiResponse, ClientConfig, ClientEvent, ConnectionStatus, RequestOptions, ResilientClient,
    };
}

// ============================================================================
// Process-wide client
// ============================================================================

/// One client for the whole process.
///
/// Components are normally passed around explicitly; this is a thin
/// convenience for apps that want a single shared handle.
#[cfg(feature = "provider")]
#[cfg_attr(docsrs, doc(cfg(feature = "provider")))]
pub mod global {
    use once_cell::sync::OnceCell;
    use std::sync::Arc;
    use steadylink_error::{Error, Result};
    use steadylink_provider::ResilientClient;

    static CLIENT: OnceCell<Arc<ResilientClient>> = OnceCell::new();

    /// Install the process-wide client. Fails if one is already installed.
    pub fn install(client: ResilientClient) -> Result<Arc<ResilientClient>> {
        let client = Arc::new(client);
        CLIENT
            .set(client.clone())
            .map_err(|_| Error::ConfigError("global client already installed".to_string()))?;
        Ok(client)
    }

    /// The installed client, if any
    pub fn client() -> Option<Arc<ResilientClient>> {
        CLIENT.get().cloned()
    }

    /// The installed client, or a configuration error
    pub fn require() -> Result<Arc<ResilientClient>> {
        client().ok_or_else(|| Error::ConfigError("global client not installed".to_string()))
    }
}

// ============================================================================
// Version information
// ============================================================================

/// Returns the Steadylink version
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let v = version();
        assert!(!v.is_empty());
        assert!(v.contains('.'));
    }

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let _ = HttpRequest::get("http://localhost:8000/healthz");
        assert_eq!(QualityTier::Excellent.recommendation().backoff_strategy, BackoffStrategy::Linear);
    }

    #[cfg(feature = "provider")]
    #[tokio::test]
    async fn test_global_client() {
        use std::sync::Arc;
        use steadylink_testing::ScriptedTransport;

        assert!(global::require().is_err());
        let client = provider::ResilientClient::builder()
            .base_url("http://localhost:8000")
            .transport(Arc::new(ScriptedTransport::new()))
            .build()
            .await
            .unwrap();
        let installed = global::install(client).unwrap();
        assert!(Arc::ptr_eq(&installed, &global::require().unwrap()));

        let second = provider::ResilientClient::builder()
            .transport(Arc::new(ScriptedTransport::new()))
            .build()
            .await
            .unwrap();
        assert!(global::install(second).is_err());
    }
}
