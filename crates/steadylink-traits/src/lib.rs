//! # Steadylink Traits
//!
//! The two ports the resilient client core talks through:
//!
//! - [`Transport`] - perform exactly one HTTP request under a deadline
//! - [`KeyValueStore`] - best-effort persistence for calibration and discovery caches
//!
//! Everything policy-related (retries, breakers, timeouts) lives above these traits,
//! so tests can swap in a scripted backend or a store that always fails.
//!
//! ## Example
//!
//! ```ignore
//! use steadylink_traits::prelude::*;
//!
//! async fn ping<T: Transport>(transport: &T, base: &str) -> Result<u16, TransportError> {
//!     let response = transport.send(HttpRequest::get(format!("{base}/healthz"))).await?;
//!     Ok(response.status)
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Storage key holding persisted timeout calibration
pub const CALIBRATION_STORAGE_KEY: &str = "timeout-calibration";

/// Storage key holding the discovered-endpoint cache
pub const ENDPOINT_CACHE_STORAGE_KEY: &str = "cached-endpoints";

/// Default per-request deadline when the caller does not set one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(TransportError::InvalidRequest(format!(
                "unsupported method: {other}"
            ))),
        }
    }
}

/// A single outbound HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method
    pub method: HttpMethod,
    /// Absolute URL
    pub url: String,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Raw body
    pub body: Option<Vec<u8>>,
    /// Deadline for the whole exchange
    pub timeout: Duration,
}

impl HttpRequest {
    /// Create a request with no headers, no body and the default deadline
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    /// HEAD request
    pub fn head(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Head, url)
    }

    /// POST request
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the raw body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Size of the body in bytes
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// A completed HTTP exchange, whatever its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Raw body
    pub body: Vec<u8>,
    /// Time from send to full body received
    pub elapsed: Duration,
}

impl HttpResponse {
    /// Response with a status and empty body
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 5xx
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// First header matching `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport-level failure: no HTTP status was received
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Deadline expired
    #[error("Request timed out after {}ms", .after.as_millis())]
    Timeout {
        /// The deadline that expired
        after: Duration,
    },

    /// Request was cancelled before it completed
    #[error("Request aborted")]
    Aborted,

    /// Remote host actively refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// DNS, routing, TLS or any other failure to reach the host
    #[error("Network error: {0}")]
    Network(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Timeout or abort; callers must not distinguish the two
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Aborted)
    }

    /// Host could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::ConnectionRefused(_) | Self::Network(_))
    }
}

/// Performs exactly one HTTP request. No retries, no policy.
///
/// Implementations must honour [`HttpRequest::timeout`] and must release the
/// underlying connection when the returned future is dropped.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send the request and wait for the full response
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

/// Storage failure. Callers treat these as best-effort and never surface them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend not available (e.g. no writable directory)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Read or write failed
    #[error("Storage IO error: {0}")]
    Io(String),

    /// Stored value could not be encoded or decoded
    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

/// Scoped string key-value storage.
///
/// Any call may fail. Components that persist through this port log and swallow
/// failures so that the operation which triggered the write never fails because
/// of it. A missing key is `Ok(None)`, not an error.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Delete a value; deleting a missing key succeeds
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Shared transport handle
pub type SharedTransport = Arc<dyn Transport>;

/// Shared store handle
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Common imports
pub mod prelude {
    pub use crate::{
        HttpMethod, HttpRequest, HttpResponse, KeyValueStore, SharedStore, SharedTransport,
        StorageError, Transport, TransportError,
    };
}
