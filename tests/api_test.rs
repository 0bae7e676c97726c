//! Admin API integration tests over the full stack (router, manager,
//! in-memory broker)

use axum::body::Body;
use axum::http::{self, Request, StatusCode};
use axum::Router;
use carrier::broker::memory::MemoryConnector;
use carrier::broker::ConnectionGuardian;
use carrier::{create_router, AppState, LogHandler, ReconnectConfig, TenantManager};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    connector: Arc<MemoryConnector>,
    router: Router,
}

async fn harness() -> Harness {
    let connector = Arc::new(MemoryConnector::new());
    let guardian = ConnectionGuardian::connect(connector.clone(), ReconnectConfig::default())
        .await
        .unwrap();
    let manager = TenantManager::new(guardian, 5, Arc::new(LogHandler));
    let router = create_router(AppState {
        manager,
        prometheus: None,
    });
    Harness { connector, router }
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn scoped_request(method: &str, uri: &str, tenant: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Tenant-ID", tenant);
    match body {
        Some(body) => builder
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(resp: axum::response::Response) -> T {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_tenant(router: &Router, name: &str, workers: usize) {
    let resp = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/tenants",
            serde_json::json!({ "name": name, "worker_count": workers }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_tenant_crud_flow() {
    let h = harness().await;
    create_tenant(&h.router, "acme", 3).await;

    let resp = h
        .router
        .clone()
        .oneshot(empty_request("GET", "/api/v1/tenants"))
        .await
        .unwrap();
    let list: Vec<serde_json::Value> = body_json(resp).await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "acme");
    assert_eq!(list[0]["worker_count"], 3);

    let resp = h
        .router
        .clone()
        .oneshot(empty_request("GET", "/api/v1/tenants/acme"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = h
        .router
        .clone()
        .oneshot(scoped_request("DELETE", "/api/v1/tenants/acme", "acme", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = h
        .router
        .oneshot(empty_request("GET", "/api/v1/tenants/acme"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_code_mapping() {
    let h = harness().await;
    create_tenant(&h.router, "acme", 1).await;

    // 409 on duplicate
    let resp = h
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/tenants",
            serde_json::json!({ "name": "acme", "worker_count": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // 400 on invalid worker count
    let resp = h
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/tenants",
            serde_json::json!({ "name": "other", "worker_count": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // 400 on invalid tenant id
    let resp = h
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/tenants",
            serde_json::json!({ "name": "bad name!", "worker_count": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // 404 on unknown tenant
    let resp = h
        .router
        .clone()
        .oneshot(scoped_request(
            "PUT",
            "/api/v1/tenants/ghost/config/concurrency",
            "ghost",
            Some(serde_json::json!({ "worker_count": 2 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // 401 without the tenant header
    let resp = h
        .router
        .clone()
        .oneshot(empty_request("DELETE", "/api/v1/tenants/acme"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 403 on header/path mismatch
    let resp = h
        .router
        .oneshot(scoped_request("DELETE", "/api/v1/tenants/acme", "mallory", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_concurrency_update_applies() {
    let h = harness().await;
    create_tenant(&h.router, "acme", 2).await;

    let resp = h
        .router
        .clone()
        .oneshot(scoped_request(
            "PUT",
            "/api/v1/tenants/acme/config/concurrency",
            "acme",
            Some(serde_json::json!({ "worker_count": 8 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let tenant: serde_json::Value = body_json(resp).await;
    assert_eq!(tenant["worker_count"], 8);

    // Out-of-bounds counts do not disturb the running pool.
    let resp = h
        .router
        .clone()
        .oneshot(scoped_request(
            "PUT",
            "/api/v1/tenants/acme/config/concurrency",
            "acme",
            Some(serde_json::json!({ "worker_count": 11 })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = h
        .router
        .oneshot(empty_request("GET", "/api/v1/tenants/acme"))
        .await
        .unwrap();
    let tenant: serde_json::Value = body_json(resp).await;
    assert_eq!(tenant["worker_count"], 8);
}

#[tokio::test]
async fn test_publish_endpoint_feeds_workers() {
    let h = harness().await;
    create_tenant(&h.router, "acme", 2).await;

    for i in 0..5 {
        let resp = h
            .router
            .clone()
            .oneshot(scoped_request(
                "POST",
                "/api/v1/tenants/acme/messages",
                "acme",
                Some(serde_json::json!({ "payload": format!("event-{}", i) })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    let state = h.connector.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.acked_count("tenant_acme_queue") < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("messages were not consumed");
    assert!(state.dead_letters("dl.acme").is_empty());
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness().await;
    let resp = h
        .router
        .oneshot(empty_request("GET", "/health"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: serde_json::Value = body_json(resp).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connection"], "connected");
}

#[tokio::test]
async fn test_metrics_unavailable_without_recorder() {
    let h = harness().await;
    let resp = h
        .router
        .oneshot(empty_request("GET", "/metrics"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}
