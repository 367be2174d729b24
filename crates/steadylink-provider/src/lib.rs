//! # Steadylink Provider
//!
//! Network-facing half of Steadylink: the reqwest transport, key-value stores,
//! and the components that talk to the backend.
//!
//! ## Features
//!
//! - Link quality assessment with concurrent probes
//! - Backend discovery with a persisted endpoint cache
//! - Pre-flight connectivity checks
//! - Background health monitoring
//! - [`ResilientClient`]: calibrated deadlines, per-group circuit breakers,
//!   classified failures and tier backoff
//!
//! ## Example
//!
//! ```no_run
//! use steadylink_provider::{FileStore, ResilientClient};
//! use std::sync::Arc;
//!
//! # async fn demo() -> steadylink_error::Result<()> {
//! let client = ResilientClient::builder()
//!     .base_url("http://192.168.1.20:8000")
//!     .store(Arc::new(FileStore::new("/tmp/steadylink")))
//!     .build()
//!     .await?;
//!
//! let jobs = client.get("/api/jobs").await?;
//! println!("{}", jobs.text());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assessor;
pub mod client;
pub mod discovery;
pub mod events;
pub mod monitor;
pub mod preflight;
pub mod storage;
pub mod transport;

pub use assessor::{AssessorConfig, NetworkQualityAssessor};
pub use client::{
    endpoint_group, ApiResponse, ClientBuilder, ClientConfig, RequestDefaults, RequestOptions, ResilientClient,
};
pub use discovery::{CachedEndpoint, DiscoveryConfig, DiscoveryResult, DiscoverySource, Platform, ServiceDiscovery};
pub use events::ClientEvent;
pub use monitor::{ConnectionHealthMonitor, ConnectionHealthReport, MonitorConfig};
pub use preflight::{ConnectionStatus, PreflightOptions, PreflightResult, PreflightValidator};
pub use storage::{FileStore, MemoryStore};
pub use transport::{HttpClientConfig, ReqwestTransport};

use steadylink_error::{Error, Result};
use url::Url;

/// Health route probed by every component
pub const HEALTH_PATH: &str = "/healthz";

/// Join a base URL and a path with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Check that `url` is an absolute http(s) URL
pub fn parse_base_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(Error::InvalidUrl(format!("{url}: expected an http(s) URL with a host"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://localhost:8000", "/healthz"), "http://localhost:8000/healthz");
        assert_eq!(join_url("http://localhost:8000/", "healthz"), "http://localhost:8000/healthz");
        assert_eq!(join_url("http://h/api/", "/jobs?x=1"), "http://h/api/jobs?x=1");
    }

    #[test]
    fn test_parse_base_url() {
        assert!(parse_base_url("https://api.example.com").is_ok());
        assert!(matches!(parse_base_url("localhost:8000"), Err(Error::InvalidUrl(_))));
        assert!(matches!(parse_base_url("ftp://example.com"), Err(Error::InvalidUrl(_))));
    }
}
