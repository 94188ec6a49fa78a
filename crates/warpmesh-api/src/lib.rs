//! warpmesh-api — HTTP surface of a cluster's state store.
//!
//! Peers connect here to read the cluster configuration object and to
//! mirror the published subsystems with list + long-poll watch.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/kv/{key}` | Raw value (404 if absent) |
//! | PUT | `/api/v1/kv/{key}` | Store the raw request body |
//! | DELETE | `/api/v1/kv/{key}` | Delete a key |
//! | GET | `/api/v1/list?prefix=` | List pairs under a prefix |
//! | GET | `/api/v1/watch?prefix=&since=&timeout_ms=` | Long-poll for changes |
//! | GET | `/healthz` | Liveness probe |

pub mod handlers;
pub mod wire;

use axum::Router;
use axum::routing::get;
use warpmesh_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the store API router.
pub fn build_router(store: StateStore) -> Router {
    let api_state = ApiState { store };

    let api_routes = Router::new()
        .route(
            "/kv/{*key}",
            get(handlers::get_key)
                .put(handlers::put_key)
                .delete(handlers::delete_key),
        )
        .route("/list", get(handlers::list_prefix))
        .route("/watch", get(handlers::watch_prefix))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
