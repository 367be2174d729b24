//! The client over real HTTP

use std::sync::Arc;
use steadylink_provider::{
    ConnectionStatus, DiscoveryConfig, DiscoverySource, MemoryStore, ReqwestTransport, ResilientClient,
    ServiceDiscovery,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn healthy_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/healthz"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn request_recovers_from_transient_503() {
    let server = healthy_server().await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([1, 2, 3])))
        .mount(&server)
        .await;

    let client = ResilientClient::builder()
        .base_url(server.uri())
        .store(Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap();

    let response = client.get("/api/items").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 2);
    assert_eq!(response.json::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn preflight_and_discovery_against_live_server() {
    let server = healthy_server().await;
    let transport = Arc::new(ReqwestTransport::new().unwrap());

    let discovery = ServiceDiscovery::new(
        DiscoveryConfig::default().with_explicit_url(server.uri()),
        transport.clone(),
    );
    let found = discovery.discover().await;
    assert_eq!(found.source, DiscoverySource::Explicit);
    assert!(found.validated);

    let client = ResilientClient::builder()
        .base_url(server.uri())
        .transport(transport)
        .build()
        .await
        .unwrap();
    let result = client.preflight().quick_check().await;
    assert!(result.reachable);
    assert_ne!(result.status, ConnectionStatus::Disconnected);
}
