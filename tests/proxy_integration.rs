//! Proxy integration tests
//!
//! These tests drive the proxy router in-process against wiremock origins
//! and verify that callers see the origin response unchanged, that failures
//! map to the right status codes, and that telemetry lands afterwards.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use vantage::analytics::{AggregationBucket, AnalyticsAggregator, BucketKey, GeoResolver};
use vantage::config::{ProxyConfig, TelemetryConfig};
use vantage::models::{ExchangeRecord, NewRoute, TenantRoute};
use vantage::proxy::{create_proxy_router, Forwarder, ProxyState};
use vantage::security::FindingKind;
use vantage::storage::{BucketUpdater, SqliteStorage, Storage, StorageResult};
use vantage::telemetry::TelemetryPipeline;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CALLER: ([u8; 4], u16) = ([203, 0, 113, 9], 40_000);

struct Harness {
    router: Router,
    storage: Arc<dyn Storage>,
    pipeline: Arc<TelemetryPipeline>,
}

async fn create_test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn harness(storage: Arc<dyn Storage>, config: ProxyConfig) -> Harness {
    let aggregator = Arc::new(AnalyticsAggregator::new(Arc::clone(&storage), 2, 64));
    let pipeline = Arc::new(TelemetryPipeline::new(
        Arc::clone(&storage),
        GeoResolver::disabled(),
        aggregator,
        &TelemetryConfig::default(),
    ));

    let state = Arc::new(ProxyState {
        storage: Arc::clone(&storage),
        forwarder: Forwarder::new(&config).unwrap(),
        pipeline: Arc::clone(&pipeline),
        config,
    });

    let router = create_proxy_router(state).layer(MockConnectInfo(SocketAddr::from(CALLER)));

    Harness {
        router,
        storage,
        pipeline,
    }
}

async fn register(storage: &Arc<dyn Storage>, identifier: &str, origin: &str) {
    storage
        .create_route(&NewRoute {
            tenant_id: format!("tenant-{identifier}"),
            identifier: identifier.to_string(),
            origin_base_url: origin.to_string(),
            owner: None,
        })
        .await
        .unwrap();
}

/// Storage where every telemetry write fails
struct BrokenTelemetryStorage {
    inner: Arc<dyn Storage>,
}

#[async_trait]
impl Storage for BrokenTelemetryStorage {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }
    async fn create_route(&self, route: &NewRoute) -> StorageResult<TenantRoute> {
        self.inner.create_route(route).await
    }
    async fn lookup_route(&self, identifier: &str) -> Result<Option<TenantRoute>> {
        self.inner.lookup_route(identifier).await
    }
    async fn list_routes(&self, owner: Option<&str>) -> Result<Vec<TenantRoute>> {
        self.inner.list_routes(owner).await
    }
    async fn delete_route(&self, identifier: &str) -> Result<bool> {
        self.inner.delete_route(identifier).await
    }
    async fn insert_exchange(&self, _record: &ExchangeRecord) -> Result<i64> {
        anyhow::bail!("exchange table unavailable")
    }
    async fn list_exchanges(&self, tenant_id: &str, limit: i64, offset: i64) -> Result<Vec<ExchangeRecord>> {
        self.inner.list_exchanges(tenant_id, limit, offset).await
    }
    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<AggregationBucket>> {
        self.inner.get_bucket(key).await
    }
    async fn list_buckets(&self, tenant_id: &str, date: NaiveDate) -> Result<Vec<AggregationBucket>> {
        self.inner.list_buckets(tenant_id, date).await
    }
    async fn upsert_buckets(
        &self,
        _keys: &[BucketKey],
        _updater: BucketUpdater<'_>,
    ) -> Result<Vec<AggregationBucket>> {
        anyhow::bail!("bucket table unavailable")
    }
}

#[tokio::test]
async fn test_health_check() {
    let h = harness(create_test_storage().await, ProxyConfig::default());

    let response = h
        .router
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], br#"{"status":"OK"}"#);
}

#[tokio::test]
async fn test_relays_origin_response_exactly() {
    let origin = MockServer::start().await;
    let authority = origin.address().to_string();

    Mock::given(method("GET"))
        .and(path("/v1/users/7"))
        .and(query_param("page", "2"))
        .and(header("host", authority.as_str()))
        .and(header("x-request-tag", "abc"))
        .respond_with(
            ResponseTemplate::new(203)
                .insert_header("x-origin", "yes")
                .insert_header("cache-control", "no-store")
                .set_body_raw(r#"{"id":7,"name":"Ada"}"#, "application/json"),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let h = harness(create_test_storage().await, ProxyConfig::default());
    register(&h.storage, "shop", &format!("{}/v1/", origin.uri())).await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/shop/users/7?page=2")
                .header("host", "proxy.local")
                .header("x-request-tag", "abc")
                .header("user-agent", "integration-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
    assert_eq!(response.headers().get("x-origin").unwrap(), "yes");
    assert_eq!(response.headers().get("content-type").unwrap(), "application/json");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], br#"{"id":7,"name":"Ada"}"#);

    h.pipeline.drain().await;

    let records = h.storage.list_exchanges("tenant-shop", 10, 0).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.method, "GET");
    assert_eq!(record.path, "/users/7");
    assert_eq!(record.query.as_deref(), Some("page=2"));
    assert_eq!(record.status, 203);
    assert_eq!(record.response_size, 21);
    assert_eq!(record.client_ip, "203.0.113.9");
    assert_eq!(record.user_agent.as_deref(), Some("integration-test"));
    assert_eq!(record.response_json().unwrap()["name"], "Ada");

    let created = chrono::DateTime::from_timestamp_millis(record.created_at).unwrap();
    let bucket = h
        .storage
        .get_bucket(&BucketKey::hourly("tenant-shop", created))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket.total_requests, 1);
    assert_eq!(bucket.unique_ips, 1);
}

#[tokio::test]
async fn test_post_body_is_forwarded_and_scored() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_string(r#"{"sku":"X-1","qty":2}"#))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&origin)
        .await;

    let h = harness(create_test_storage().await, ProxyConfig::default());
    register(&h.storage, "orders-api", &origin.uri()).await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders-api/orders")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"sku":"X-1","qty":2}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"created");

    h.pipeline.drain().await;

    let records = h.storage.list_exchanges("tenant-orders-api", 10, 0).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request_size, 21);
    assert_eq!(records[0].request_json().unwrap()["qty"], 2);
    assert!(records[0]
        .findings
        .0
        .iter()
        .any(|f| f.kind == FindingKind::MissingAuthentication));
}

#[tokio::test]
async fn test_origin_error_status_is_relayed() {
    let origin = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
        .mount(&origin)
        .await;

    let h = harness(create_test_storage().await, ProxyConfig::default());
    register(&h.storage, "things", &origin.uri()).await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/things/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"conflict");

    h.pipeline.drain().await;
    let records = h.storage.list_exchanges("tenant-things", 10, 0).await.unwrap();
    let created = chrono::DateTime::from_timestamp_millis(records[0].created_at).unwrap();
    let bucket = h
        .storage
        .get_bucket(&BucketKey::daily("tenant-things", created))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bucket.error_requests, 1);
}

#[tokio::test]
async fn test_unknown_identifier_returns_404_without_telemetry() {
    let h = harness(create_test_storage().await, ProxyConfig::default());
    register(&h.storage, "known", "http://127.0.0.1:9").await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/nope/anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"].as_str().unwrap().contains("nope"));

    h.pipeline.drain().await;
    assert!(h.storage.list_exchanges("nope", 10, 0).await.unwrap().is_empty());
    assert!(h.storage.list_exchanges("tenant-known", 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_origin_returns_502_without_telemetry() {
    // Reserve a port, then free it so nothing is listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let h = harness(create_test_storage().await, ProxyConfig::default());
    register(&h.storage, "down", &format!("http://127.0.0.1:{port}")).await;

    let response = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/down/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    h.pipeline.drain().await;
    assert!(h.storage.list_exchanges("tenant-down", 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_oversized_body_rejected_before_origin() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&origin)
        .await;

    let config = ProxyConfig {
        max_body_bytes: 8,
        ..ProxyConfig::default()
    };
    let h = harness(create_test_storage().await, config);
    register(&h.storage, "small", &origin.uri()).await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/small/upload")
                .body(Body::from("this body is far too long"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_failing_telemetry_never_changes_response() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-trace", "t-1")
                .set_body_string("all good"),
        )
        .mount(&origin)
        .await;

    let inner = create_test_storage().await;
    register(&inner, "fragile", &origin.uri()).await;
    let broken: Arc<dyn Storage> = Arc::new(BrokenTelemetryStorage {
        inner: Arc::clone(&inner),
    });
    let h = harness(broken, ProxyConfig::default());

    for _ in 0..3 {
        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/fragile/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-trace").unwrap(), "t-1");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"all good");
    }

    // Failures are absorbed by the pipeline
    h.pipeline.drain().await;
    assert_eq!(h.pipeline.pending(), 0);
    assert!(inner.list_exchanges("tenant-fragile", 10, 0).await.unwrap().is_empty());
}
