//! Mesh diagnostics routes.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/clustermesh/clusters` | Every remote cluster plus the ID table |
//! | GET | `/api/v1/clustermesh/clusters/{name}` | One configured remote cluster |

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use warpmesh_api::wire::ApiResponse;
use warpmesh_clustermesh::{ClusterMesh, ClusterStatus};
use warpmesh_state::ClusterId;

#[derive(Clone)]
pub struct StatusState {
    pub mesh: Arc<ClusterMesh>,
}

#[derive(Debug, Serialize)]
pub struct LocalCluster {
    pub name: String,
    pub cluster_id: ClusterId,
}

#[derive(Debug, Serialize)]
pub struct MeshStatus {
    pub local: LocalCluster,
    pub ready_clusters: usize,
    pub clusters: Vec<ClusterStatus>,
    pub used_cluster_ids: BTreeMap<ClusterId, String>,
}

pub fn router(mesh: Arc<ClusterMesh>) -> Router {
    let routes = Router::new()
        .route("/clusters", get(list_clusters))
        .route("/clusters/{name}", get(get_cluster))
        .with_state(StatusState { mesh });

    Router::new().nest("/api/v1/clustermesh", routes)
}

/// GET /api/v1/clustermesh/clusters
async fn list_clusters(State(state): State<StatusState>) -> Json<ApiResponse<MeshStatus>> {
    let config = state.mesh.config();
    Json(ApiResponse::ok(MeshStatus {
        local: LocalCluster {
            name: config.cluster_name.clone(),
            cluster_id: config.cluster_id,
        },
        ready_clusters: state.mesh.num_ready_clusters().await,
        clusters: state.mesh.cluster_statuses().await,
        used_cluster_ids: state.mesh.used_cluster_ids(),
    }))
}

/// GET /api/v1/clustermesh/clusters/{name}
async fn get_cluster(State(state): State<StatusState>, Path(name): Path<String>) -> Response {
    match state.mesh.status(&name).await {
        Some(status) => Json(ApiResponse::ok(status)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::err(format!("cluster {name} not found"))),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use warpmesh_clustermesh::{ClusterDescriptor, LocalDialer, MeshConfig, ObjectCache};
    use warpmesh_state::{ClusterCapabilities, ClusterConfig, StateStore, Subsystem, SyncStore};

    use super::*;

    fn test_mesh(dialer: LocalDialer) -> Arc<ClusterMesh> {
        let config = MeshConfig::new("local", 10)
            .with_config_timeout(Duration::from_millis(100))
            .with_backoff(Duration::from_millis(20), Duration::from_millis(200));
        Arc::new(ClusterMesh::new(config, Arc::new(dialer), ObjectCache::new().observers()))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn empty_mesh_reports_local_cluster() {
        let mesh = test_mesh(LocalDialer::new());
        let (status, body) = get_json(router(mesh), "/api/v1/clustermesh/clusters").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["local"]["name"], "local");
        assert_eq!(body["data"]["local"]["cluster_id"], 10);
        assert_eq!(body["data"]["ready_clusters"], 0);
        assert!(body["data"]["clusters"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ready_cluster_is_listed_with_its_id() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .set_cluster_config(
                "east",
                &ClusterConfig {
                    id: 4,
                    capabilities: ClusterCapabilities {
                        synced_canaries: true,
                        max_connected_clusters: None,
                    },
                },
            )
            .unwrap();
        for subsystem in Subsystem::ALL {
            SyncStore::new(store.clone(), "east", subsystem).synced().unwrap();
        }
        let dialer = LocalDialer::new();
        dialer.register("east", store);

        let mesh = test_mesh(dialer);
        mesh.upsert_cluster(ClusterDescriptor::new("east", vec!["local://east".into()]))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while mesh.num_ready_clusters().await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "east never became ready");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let app = router(Arc::clone(&mesh));
        let (status, body) = get_json(app.clone(), "/api/v1/clustermesh/clusters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ready_clusters"], 1);
        assert_eq!(body["data"]["used_cluster_ids"]["4"], "east");
        assert_eq!(body["data"]["clusters"][0]["name"], "east");
        assert_eq!(body["data"]["clusters"][0]["state"], "ready");

        let (status, body) = get_json(app.clone(), "/api/v1/clustermesh/clusters/east").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["cluster_id"], 4);
        assert_eq!(body["data"]["synced"]["nodes"], true);

        let (status, body) = get_json(app, "/api/v1/clustermesh/clusters/west").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        mesh.close().await;
    }
}
