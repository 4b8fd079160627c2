//! End-to-end tests against the axum router, backed by the in-memory
//! `Store` so they run without a live Postgres (spec §3.4/§8's seed
//! scenarios, exercised through the actual HTTP surface this time).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use metabindd::cache::CacheCoordinator;
use metabindd::http::{router, AppState};
use metabindd::resolver::{Resolver, TrustedProxies};
use metabindd::store::memory::MemoryStore;
use metabindd::store::Store;
use metabindd::template::TemplateAugmenter;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_state(admin_token: Option<&str>) -> Arc<AppState> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Arc::new(AppState {
        cache: Arc::new(CacheCoordinator::new(store.clone(), None)),
        resolver: Arc::new(Resolver::new(store.clone())),
        store,
        template: Arc::new(TemplateAugmenter::new(Default::default())),
        trusted_proxies: Arc::new(TrustedProxies::new(&[]).unwrap()),
        admin_token: admin_token.map(str::to_string),
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
    Request::builder().method(method).uri(uri).header("content-type", "application/json").body(body).unwrap()
}

#[tokio::test]
async fn healthz_reports_up() {
    let state = test_state(None);
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "UP"}));
}

#[tokio::test]
async fn admin_upsert_then_lookup_by_id_round_trips() {
    let state = test_state(None);
    let app = router(state);

    let id = "22bc79fc-aaaa-bbbb-cccc-000009634939";
    let upsert_body = Body::from(
        json!({
            "id": id,
            "metadata": {"some": "metadata"},
            "ipAddresses": ["1.2.3.4", "1f00::9/127"]
        })
        .to_string(),
    );

    let response = app
        .clone()
        .oneshot(request("POST", "/api/v1/device-metadata", upsert_body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/device-metadata/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"some": "metadata"}));
}

#[tokio::test]
async fn admin_upsert_rejects_invalid_ip() {
    let state = test_state(None);
    let app = router(state);

    let body = Body::from(
        json!({
            "id": "22bc79fc-aaaa-bbbb-cccc-000009634939",
            "metadata": {"some": "metadata"},
            "ipAddresses": ["not-an-ip"]
        })
        .to_string(),
    );

    let response = app.oneshot(request("POST", "/api/v1/device-metadata", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_routes_require_bearer_token_when_configured() {
    let state = test_state(Some("s3cr3t"));
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/device-metadata/22bc79fc-aaaa-bbbb-cccc-000009634939")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn public_metadata_endpoint_resolves_caller_by_source_ip() {
    let state = test_state(None);
    let cancel = tokio_util::sync::CancellationToken::new();
    let id = uuid::Uuid::new_v4();
    state
        .store
        .upsert_metadata(id, &["203.0.113.9".to_string()], json!({"hostname": "h1"}), &cancel)
        .await
        .unwrap();

    let app = router(state);
    let mut req = Request::builder().uri("/api/v1/metadata").body(Body::empty()).unwrap();
    req.extensions_mut()
        .insert(axum::extract::ConnectInfo("203.0.113.9:4321".parse::<SocketAddr>().unwrap()));

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"hostname": "h1"}));
}

#[tokio::test]
async fn ec2_meta_data_tree_lists_fixed_top_level_order() {
    let state = test_state(None);
    let cancel = tokio_util::sync::CancellationToken::new();
    let id = uuid::Uuid::new_v4();
    state
        .store
        .upsert_metadata(
            id,
            &["198.51.100.7".to_string()],
            json!({
                "hostname": "h1",
                "network": {"addresses": [{"address": "198.51.100.7", "address_family": 4, "public": true}]}
            }),
            &cancel,
        )
        .await
        .unwrap();

    let app = router(state);
    let mut req = Request::builder().uri("/2009-04-04/meta-data").body(Body::empty()).unwrap();
    req.extensions_mut()
        .insert(axum::extract::ConnectInfo("198.51.100.7:4321".parse::<SocketAddr>().unwrap()));

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("public-ipv4"));
    assert!(text.contains("hostname"));
}
