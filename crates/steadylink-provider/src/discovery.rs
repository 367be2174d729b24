//! Backend discovery
//!
//! Finds a reachable backend by trying, in order: an explicit URL, endpoints
//! that worked before, the platform default, a LAN scan, and finally an
//! unvalidated best guess. Every validated endpoint is remembered.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use steadylink_traits::{HttpRequest, SharedStore, SharedTransport, ENDPOINT_CACHE_STORAGE_KEY};
use tokio::time::Instant;
use url::Url;

use crate::{join_url, HEALTH_PATH};

/// Cached endpoints unused for longer are forgotten
pub const CACHE_MAX_AGE_DAYS: i64 = 7;

/// Endpoints that succeeded this recently get a ranking bonus
const RECENT_SUCCESS_HOURS: i64 = 24;
const RECENT_SUCCESS_BONUS: u32 = 5;
const CACHED_CANDIDATES: usize = 3;

/// Where the client runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Android emulator, host reachable at 10.0.2.2
    AndroidEmulator,
    /// iOS simulator, shares the host's loopback
    IosSimulator,
    /// Phone or tablet on the LAN
    PhysicalDevice,
    /// Desktop process
    #[default]
    Desktop,
    /// Browser
    Browser,
}

impl Platform {
    /// Default backend URL for the platform
    pub fn default_url(&self, port: u16, gateway: &str) -> String {
        match self {
            Self::AndroidEmulator => format!("http://10.0.2.2:{port}"),
            Self::PhysicalDevice => format!("http://{gateway}:{port}"),
            Self::IosSimulator | Self::Desktop | Self::Browser => format!("http://localhost:{port}"),
        }
    }
}

/// Which cascade step produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// Configured override
    Explicit,
    /// Previously validated endpoint
    Cached,
    /// Platform default address
    PlatformDefault,
    /// LAN scan
    NetworkScan,
    /// Nothing validated; best guess
    Fallback,
}

impl std::fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Explicit => "explicit",
            Self::Cached => "cached",
            Self::PlatformDefault => "platform_default",
            Self::NetworkScan => "network_scan",
            Self::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Override tried before anything else
    pub explicit_url: Option<String>,
    /// Backend port
    pub port: u16,
    /// Host platform
    pub platform: Platform,
    /// Scan the LAN on physical devices
    pub enable_network_scan: bool,
    /// Use and update the endpoint cache
    pub cache_enabled: bool,
    /// Deadline for each health check
    #[serde(with = "steadylink_resilience::serde_millis")]
    pub validation_timeout: Duration,
    /// Health checks in flight during a scan
    pub scan_concurrency: usize,
    /// Subnet prefixes to scan
    pub scan_subnets: Vec<String>,
    /// Host numbers tried in each subnet
    pub scan_hosts: Vec<u8>,
    /// Physical-device default host
    pub common_gateway: String,
    /// Network the cache entries are scoped to
    pub network_id: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            explicit_url: None,
            port: 8000,
            platform: Platform::Desktop,
            enable_network_scan: false,
            cache_enabled: true,
            validation_timeout: Duration::from_secs(3),
            scan_concurrency: 5,
            scan_subnets: ["192.168.1", "192.168.0", "10.0.0", "172.16.0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            scan_hosts: vec![1, 2, 100, 101, 102],
            common_gateway: "192.168.1.1".to_string(),
            network_id: None,
        }
    }
}

impl DiscoveryConfig {
    /// Try `url` first
    pub fn with_explicit_url(mut self, url: impl Into<String>) -> Self {
        self.explicit_url = Some(url.into());
        self
    }

    /// Set the backend port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the platform
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Enable or disable the LAN scan
    pub fn with_network_scan(mut self, enabled: bool) -> Self {
        self.enable_network_scan = enabled;
        self
    }

    /// Enable or disable the endpoint cache
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Scope the cache to a network
    pub fn with_network_id(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }
}

/// Outcome of discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Base URL to use
    pub url: String,
    /// Cascade step that produced it
    pub source: DiscoverySource,
    /// Whether the health check passed
    pub validated: bool,
    /// Health check round trip
    pub latency_ms: Option<u64>,
}

/// An endpoint that passed validation before
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEndpoint {
    /// `http` or `https`; entries saved without one are plain HTTP
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Network the endpoint was seen on
    pub network_id: Option<String>,
    /// Last successful validation
    pub last_success: DateTime<Utc>,
    /// Successful validations so far
    pub success_count: u32,
    /// Passed a health check
    pub verified: bool,
}

impl CachedEndpoint {
    /// Base URL of the endpoint
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    fn score(&self, now: DateTime<Utc>) -> u32 {
        let recent = now - self.last_success < ChronoDuration::hours(RECENT_SUCCESS_HOURS);
        self.success_count + if recent { RECENT_SUCCESS_BONUS } else { 0 }
    }

    fn visible_on(&self, network_id: Option<&str>) -> bool {
        self.network_id.is_none() || self.network_id.as_deref() == network_id
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Default)]
struct DiscoveryState {
    cache: HashMap<String, CachedEndpoint>,
    last: Option<DiscoveryResult>,
    network_id: Option<String>,
}

fn evict_stale(cache: &mut HashMap<String, CachedEndpoint>, now: DateTime<Utc>) {
    let cutoff = now - ChronoDuration::days(CACHE_MAX_AGE_DAYS);
    cache.retain(|host, endpoint| {
        let keep = endpoint.last_success >= cutoff;
        if !keep {
            tracing::debug!(host = %host, "Evicting stale cached endpoint");
        }
        keep
    });
}

/// Locates a reachable backend
#[derive(Debug)]
pub struct ServiceDiscovery {
    config: DiscoveryConfig,
    transport: SharedTransport,
    store: Option<SharedStore>,
    state: Mutex<DiscoveryState>,
}

impl ServiceDiscovery {
    /// Discovery without persistence
    pub fn new(config: DiscoveryConfig, transport: SharedTransport) -> Self {
        let state = DiscoveryState {
            network_id: config.network_id.clone(),
            ..Default::default()
        };
        Self {
            config,
            transport,
            store: None,
            state: Mutex::new(state),
        }
    }

    /// Discovery persisting its endpoint cache in `store`
    pub async fn with_store(config: DiscoveryConfig, transport: SharedTransport, store: SharedStore) -> Self {
        let mut cache = HashMap::new();
        if config.cache_enabled {
            match store.get(ENDPOINT_CACHE_STORAGE_KEY).await {
                Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, CachedEndpoint>>(&raw) {
                    Ok(saved) => cache = saved,
                    Err(e) => tracing::debug!(error = %e, "Ignoring unreadable endpoint cache"),
                },
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "Failed to load endpoint cache"),
            }
            evict_stale(&mut cache, Utc::now());
        }

        let mut discovery = Self::new(config, transport);
        discovery.store = Some(store);
        discovery.state.get_mut().cache = cache;
        discovery
    }

    /// Discovery config
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Last validated result, if any
    pub fn last_result(&self) -> Option<DiscoveryResult> {
        self.state.lock().last.clone()
    }

    /// Cached endpoints, most successful first
    pub fn cached_endpoints(&self) -> Vec<CachedEndpoint> {
        let mut endpoints: Vec<_> = self.state.lock().cache.values().cloned().collect();
        endpoints.sort_by(|a, b| b.success_count.cmp(&a.success_count).then(a.host.cmp(&b.host)));
        endpoints
    }

    /// Forget every cached endpoint
    pub async fn clear_cache(&self) {
        self.state.lock().cache.clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(ENDPOINT_CACHE_STORAGE_KEY).await {
                tracing::debug!(error = %e, "Failed to clear endpoint cache");
            }
        }
    }

    /// Switch networks; the in-memory result no longer applies
    pub fn set_network_id(&self, network_id: Option<String>) {
        let mut state = self.state.lock();
        if state.network_id != network_id {
            tracing::info!(from = ?state.network_id, to = ?network_id, "Network changed, rediscovering");
            state.network_id = network_id;
            state.last = None;
        }
    }

    /// Drop the remembered result and run the cascade again
    pub async fn refresh(&self) -> DiscoveryResult {
        self.state.lock().last = None;
        self.discover().await
    }

    /// Find the backend
    pub async fn discover(&self) -> DiscoveryResult {
        if let Some(last) = self.last_result() {
            return last;
        }

        let result = match self.run_cascade().await {
            Some(found) => {
                self.remember(&found).await;
                found
            }
            None => self.fallback(),
        };

        tracing::info!(
            url = %result.url,
            source = %result.source,
            validated = result.validated,
            latency_ms = ?result.latency_ms,
            "Backend discovered"
        );
        result
    }

    async fn run_cascade(&self) -> Option<DiscoveryResult> {
        if let Some(url) = &self.config.explicit_url {
            if let Some(found) = self.try_candidate(url, DiscoverySource::Explicit).await {
                return Some(found);
            }
        }

        if self.config.cache_enabled {
            for url in self.ranked_cache_candidates() {
                if let Some(found) = self.try_candidate(&url, DiscoverySource::Cached).await {
                    return Some(found);
                }
            }
        }

        let default_url = self
            .config
            .platform
            .default_url(self.config.port, &self.config.common_gateway);
        if let Some(found) = self.try_candidate(&default_url, DiscoverySource::PlatformDefault).await {
            return Some(found);
        }

        if self.config.platform == Platform::PhysicalDevice && self.config.enable_network_scan {
            return self.scan().await;
        }
        None
    }

    fn ranked_cache_candidates(&self) -> Vec<String> {
        let now = Utc::now();
        let mut state = self.state.lock();
        evict_stale(&mut state.cache, now);

        let network_id = state.network_id.clone();
        let mut candidates: Vec<_> = state
            .cache
            .values()
            .filter(|e| e.visible_on(network_id.as_deref()))
            .collect();
        candidates.sort_by(|a, b| b.score(now).cmp(&a.score(now)).then(b.last_success.cmp(&a.last_success)));
        candidates
            .into_iter()
            .take(CACHED_CANDIDATES)
            .map(CachedEndpoint::url)
            .collect()
    }

    async fn scan(&self) -> Option<DiscoveryResult> {
        let candidates: Vec<String> = self
            .config
            .scan_subnets
            .iter()
            .flat_map(|subnet| {
                self.config
                    .scan_hosts
                    .iter()
                    .map(move |host| format!("http://{subnet}.{host}:{}", self.config.port))
            })
            .collect();
        tracing::debug!(candidates = candidates.len(), "Scanning local network");

        let mut probes = stream::iter(candidates)
            .map(|url| async move {
                let latency = self.validate(&url).await;
                latency.map(|latency_ms| (url, latency_ms))
            })
            .buffer_unordered(self.config.scan_concurrency.max(1));

        while let Some(outcome) = probes.next().await {
            if let Some((url, latency_ms)) = outcome {
                return Some(DiscoveryResult {
                    url,
                    source: DiscoverySource::NetworkScan,
                    validated: true,
                    latency_ms: Some(latency_ms),
                });
            }
        }
        None
    }

    fn fallback(&self) -> DiscoveryResult {
        let state = self.state.lock();
        let url = state
            .cache
            .values()
            .filter(|e| e.visible_on(state.network_id.as_deref()))
            .max_by_key(|e| e.last_success)
            .map(CachedEndpoint::url)
            .unwrap_or_else(|| format!("http://localhost:{}", self.config.port));
        tracing::warn!(url = %url, "No backend validated, falling back");

        DiscoveryResult {
            url,
            source: DiscoverySource::Fallback,
            validated: false,
            latency_ms: None,
        }
    }

    async fn try_candidate(&self, url: &str, source: DiscoverySource) -> Option<DiscoveryResult> {
        let latency_ms = self.validate(url).await?;
        Some(DiscoveryResult {
            url: url.trim_end_matches('/').to_string(),
            source,
            validated: true,
            latency_ms: Some(latency_ms),
        })
    }

    /// Health-check `base_url`; returns the round trip on a 2xx
    async fn validate(&self, base_url: &str) -> Option<u64> {
        let request = HttpRequest::get(join_url(base_url, HEALTH_PATH)).with_timeout(self.config.validation_timeout);
        let started = Instant::now();
        match self.transport.send(request).await {
            Ok(response) if response.is_success() => Some(started.elapsed().as_millis() as u64),
            Ok(response) => {
                tracing::debug!(url = %base_url, status = response.status, "Candidate unhealthy");
                None
            }
            Err(e) => {
                tracing::debug!(url = %base_url, error = %e, "Candidate unreachable");
                None
            }
        }
    }

    async fn remember(&self, found: &DiscoveryResult) {
        let snapshot = {
            let mut state = self.state.lock();
            state.last = Some(found.clone());
            if !self.config.cache_enabled {
                return;
            }

            let Some((scheme, host, port)) = endpoint_parts(&found.url) else {
                return;
            };
            let network_id = state.network_id.clone();
            let now = Utc::now();
            state
                .cache
                .entry(host.clone())
                .and_modify(|e| {
                    e.scheme = scheme.clone();
                    e.port = port;
                    e.network_id = network_id.clone();
                    e.last_success = now;
                    e.success_count += 1;
                    e.verified = true;
                })
                .or_insert_with(|| CachedEndpoint {
                    scheme,
                    host,
                    port,
                    network_id,
                    last_success: now,
                    success_count: 1,
                    verified: true,
                });
            state.cache.clone()
        };

        let Some(store) = &self.store else {
            return;
        };
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(e) = store.set(ENDPOINT_CACHE_STORAGE_KEY, raw).await {
                    tracing::debug!(error = %e, "Failed to persist endpoint cache");
                }
            }
            Err(e) => tracing::debug!(error = %e, "Failed to serialize endpoint cache"),
        }
    }
}

fn endpoint_parts(url: &str) -> Option<(String, String, u16)> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default()?;
    Some((parsed.scheme().to_string(), host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;
    use steadylink_testing::{FailingStore, Route, ScriptedResponse, ScriptedTransport};
    use steadylink_traits::KeyValueStore;

    fn healthy(host: &str) -> Route {
        Route::host(host).and_path(HEALTH_PATH)
    }

    fn endpoint(host: &str, success_count: u32, age: ChronoDuration) -> CachedEndpoint {
        CachedEndpoint {
            scheme: "http".to_string(),
            host: host.to_string(),
            port: 8000,
            network_id: None,
            last_success: Utc::now() - age,
            success_count,
            verified: true,
        }
    }

    async fn seeded_store(endpoints: &[CachedEndpoint]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let map: HashMap<_, _> = endpoints.iter().map(|e| (e.host.clone(), e.clone())).collect();
        store
            .set(ENDPOINT_CACHE_STORAGE_KEY, serde_json::to_string(&map).unwrap())
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_url_wins() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("api.example.com"), ScriptedResponse::ok());
        transport.fallback(healthy("localhost"), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::new(
            DiscoveryConfig::default().with_explicit_url("http://api.example.com:8443/"),
            transport,
        );
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::Explicit);
        assert_eq!(result.url, "http://api.example.com:8443");
        assert!(result.validated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(Platform::AndroidEmulator.default_url(8000, &config.common_gateway), "http://10.0.2.2:8000");
        assert_eq!(Platform::IosSimulator.default_url(8000, &config.common_gateway), "http://localhost:8000");
        assert_eq!(Platform::PhysicalDevice.default_url(9000, &config.common_gateway), "http://192.168.1.1:9000");
        assert_eq!(Platform::Browser.default_url(8000, &config.common_gateway), "http://localhost:8000");

        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("10.0.2.2"), ScriptedResponse::ok());
        let discovery = ServiceDiscovery::new(
            DiscoveryConfig::default().with_platform(Platform::AndroidEmulator),
            transport,
        );
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::PlatformDefault);
        assert_eq!(result.url, "http://10.0.2.2:8000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_ranking_prefers_recent_successes() {
        let store = seeded_store(&[
            endpoint("192.168.1.50", 3, ChronoDuration::hours(1)),
            endpoint("192.168.1.60", 6, ChronoDuration::days(2)),
        ])
        .await;
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(Route::any(), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::with_store(DiscoveryConfig::default(), transport.clone(), store).await;
        let result = discovery.discover().await;

        // 3 + 5 recency bonus outranks 6
        assert_eq!(result.source, DiscoverySource::Cached);
        assert_eq!(result.url, "http://192.168.1.50:8000");
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_evicted_on_load() {
        let store = seeded_store(&[
            endpoint("192.168.1.50", 9, ChronoDuration::days(8)),
            endpoint("192.168.1.60", 1, ChronoDuration::days(1)),
        ])
        .await;
        let transport = Arc::new(ScriptedTransport::new());

        let discovery = ServiceDiscovery::with_store(DiscoveryConfig::default(), transport, store).await;
        let hosts: Vec<_> = discovery.cached_endpoints().into_iter().map(|e| e.host).collect();
        assert_eq!(hosts, vec!["192.168.1.60".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_scoped_to_network() {
        let mut other = endpoint("10.1.1.5", 4, ChronoDuration::hours(1));
        other.network_id = Some("office".into());
        let store = seeded_store(&[other]).await;
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(Route::any(), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::with_store(
            DiscoveryConfig::default().with_network_id("home"),
            transport.clone(),
            store,
        )
        .await;
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::PlatformDefault);
        assert_eq!(transport.calls_to_host("10.1.1.5"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_scan_finds_backend() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("10.0.0.101"), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::new(
            DiscoveryConfig::default()
                .with_platform(Platform::PhysicalDevice)
                .with_network_scan(true),
            transport.clone(),
        );
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::NetworkScan);
        assert_eq!(result.url, "http://10.0.0.101:8000");
        assert!(transport.calls().len() <= 21);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_disabled_by_default() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("10.0.0.101"), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::new(
            DiscoveryConfig::default().with_platform(Platform::PhysicalDevice),
            transport.clone(),
        );
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::Fallback);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_is_unvalidated_and_not_remembered() {
        let transport = Arc::new(ScriptedTransport::new());
        let discovery = ServiceDiscovery::new(DiscoveryConfig::default().with_port(9000), transport.clone());

        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::Fallback);
        assert_eq!(result.url, "http://localhost:9000");
        assert!(!result.validated);
        assert!(discovery.last_result().is_none());

        discovery.discover().await;
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_prefers_last_cached_host() {
        let store = seeded_store(&[
            endpoint("192.168.1.50", 9, ChronoDuration::days(3)),
            endpoint("192.168.1.60", 1, ChronoDuration::days(1)),
        ])
        .await;
        let transport = Arc::new(ScriptedTransport::new());

        let discovery = ServiceDiscovery::with_store(DiscoveryConfig::default(), transport, store).await;
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::Fallback);
        assert_eq!(result.url, "http://192.168.1.60:8000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_cached_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("localhost"), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::with_store(DiscoveryConfig::default(), transport.clone(), store.clone()).await;
        discovery.discover().await;
        discovery.refresh().await;

        let cached = discovery.cached_endpoints();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].host, "localhost");
        assert_eq!(cached[0].success_count, 2);

        let raw = store.get(ENDPOINT_CACHE_STORAGE_KEY).await.unwrap().unwrap();
        let saved: HashMap<String, CachedEndpoint> = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved["localhost"].success_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_endpoint_keeps_https() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("api.example.com"), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::with_store(
            DiscoveryConfig::default().with_explicit_url("https://api.example.com/"),
            transport.clone(),
            store.clone(),
        )
        .await;
        assert_eq!(discovery.discover().await.url, "https://api.example.com");
        assert_eq!(discovery.cached_endpoints()[0].url(), "https://api.example.com:443");

        let restored = ServiceDiscovery::with_store(DiscoveryConfig::default(), transport, store).await;
        let result = restored.discover().await;
        assert_eq!(result.source, DiscoverySource::Cached);
        assert_eq!(result.url, "https://api.example.com:443");
    }

    #[test]
    fn test_entry_without_scheme_loads_as_http() {
        let raw = r#"{"host": "192.168.1.40", "port": 8000, "network_id": null,
                      "last_success": "2026-01-01T00:00:00Z", "success_count": 1, "verified": true}"#;
        let endpoint: CachedEndpoint = serde_json::from_str(raw).unwrap();
        assert_eq!(endpoint.url(), "http://192.168.1.40:8000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_is_memoized_until_refresh() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("localhost"), ScriptedResponse::ok());
        let discovery = ServiceDiscovery::new(DiscoveryConfig::default(), transport.clone());

        discovery.discover().await;
        discovery.discover().await;
        assert_eq!(transport.calls().len(), 1);

        discovery.refresh().await;
        assert_eq!(transport.calls().len(), 2);

        discovery.set_network_id(Some("cafe".into()));
        assert!(discovery.last_result().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_store_does_not_break_discovery() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(healthy("localhost"), ScriptedResponse::ok());
        let store = Arc::new(FailingStore::new());

        let discovery = ServiceDiscovery::with_store(DiscoveryConfig::default(), transport, store.clone()).await;
        let result = discovery.discover().await;
        assert!(result.validated);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_candidate_fails_validation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fallback(
            healthy("api.example.com"),
            ScriptedResponse::ok().with_latency(Duration::from_secs(4)),
        );
        transport.fallback(healthy("localhost"), ScriptedResponse::ok());

        let discovery = ServiceDiscovery::new(
            DiscoveryConfig::default().with_explicit_url("http://api.example.com"),
            transport,
        );
        let result = discovery.discover().await;
        assert_eq!(result.source, DiscoverySource::PlatformDefault);
    }
}
