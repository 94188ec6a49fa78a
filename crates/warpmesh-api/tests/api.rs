//! Router-level tests for the store API.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use warpmesh_api::build_router;
use warpmesh_api::wire::*;
use warpmesh_state::*;

fn test_store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn healthz_returns_ok() {
    let router = build_router(test_store());
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn put_then_get_raw_value() {
    let store = test_store();
    let router = build_router(store.clone());

    let req = Request::builder()
        .method("PUT")
        .uri("/api/v1/kv/mesh/cluster-config/east")
        .body(Body::from(r#"{"id":3}"#))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = Request::builder()
        .uri("/api/v1/kv/mesh/cluster-config/east")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(REVISION_HEADER).unwrap(), "1");
    assert_eq!(body_bytes(resp).await, br#"{"id":3}"#);

    assert_eq!(store.get_cluster_config("east").unwrap().unwrap().id, 3);
}

#[tokio::test]
async fn get_missing_key_is_404() {
    let router = build_router(test_store());
    let req = Request::builder()
        .uri("/api/v1/kv/mesh/nope")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_reports_existence() {
    let store = test_store();
    store.put("mesh/a", b"1").unwrap();
    let router = build_router(store.clone());

    let req = Request::builder()
        .method("DELETE")
        .uri("/api/v1/kv/mesh/a")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let parsed: ApiResponse<WriteResponse> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let data = parsed.data.unwrap();
    assert_eq!(data.existed, Some(true));
    assert_eq!(data.revision, 2);
    assert!(store.get("mesh/a").unwrap().is_none());
}

#[tokio::test]
async fn list_returns_hex_entries() {
    let store = test_store();
    store.put("mesh/state/nodes/v1/east/n1", b"{}").unwrap();
    store.put("mesh/state/nodes/v1/west/n1", b"{}").unwrap();
    let router = build_router(store);

    let req = Request::builder()
        .uri("/api/v1/list?prefix=mesh/state/nodes/v1/east/")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let parsed: ApiResponse<ListResponse> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let list = parsed.data.unwrap();
    assert_eq!(list.revision, 2);
    assert_eq!(list.entries.len(), 1);
    let pair = list.entries[0].clone().into_pair().unwrap();
    assert_eq!(pair.value, b"{}");
}

#[tokio::test]
async fn watch_returns_pending_events_immediately() {
    let store = test_store();
    store.put("w/a", b"1").unwrap();
    store.put("w/b", b"2").unwrap();
    let router = build_router(store);

    let req = Request::builder()
        .uri("/api/v1/watch?prefix=w/&since=1&timeout_ms=5000")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let parsed: ApiResponse<WatchResponse> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let watch = parsed.data.unwrap();
    assert_eq!(watch.events.len(), 1);
    assert_eq!(watch.events[0].key, "w/b");
}

#[tokio::test]
async fn watch_on_compacted_revision_is_gone() {
    let store = StateStore::open_in_memory_with_history(1).unwrap();
    for i in 0..3 {
        store.put(&format!("w/{i}"), b"v").unwrap();
    }
    let router = build_router(store);

    let req = Request::builder()
        .uri("/api/v1/watch?prefix=w/&since=0&timeout_ms=10")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GONE);
}
