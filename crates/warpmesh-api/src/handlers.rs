//! Store API handlers.
//!
//! Each handler reads/writes via `StateStore`. Raw reads return the stored
//! bytes; everything else returns JSON in the `ApiResponse` envelope.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use warpmesh_state::StateError;

use crate::ApiState;
use crate::wire::*;

/// Default long-poll duration when the client does not pass one.
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a single long-poll.
const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(60);

fn error_response(msg: &str, status: StatusCode) -> Response {
    (status, Json(ApiResponse::<()>::err(msg))).into_response()
}

fn state_error(e: StateError) -> Response {
    match e {
        StateError::Compacted { .. } => error_response(&e.to_string(), StatusCode::GONE),
        other => {
            warn!(error = %other, "state store request failed");
            error_response(&other.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Keys ───────────────────────────────────────────────────────

/// GET /api/v1/kv/{key}
pub async fn get_key(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    let revision = match state.store.revision() {
        Ok(r) => r,
        Err(e) => return state_error(e),
    };
    match state.store.get(&key) {
        Ok(Some(value)) => (
            StatusCode::OK,
            [(REVISION_HEADER, revision.to_string())],
            value,
        )
            .into_response(),
        Ok(None) => error_response("key not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// PUT /api/v1/kv/{key}
pub async fn put_key(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    match state.store.put(&key, &body) {
        Ok(revision) => Json(ApiResponse::ok(WriteResponse {
            revision,
            existed: None,
        }))
        .into_response(),
        Err(e) => state_error(e),
    }
}

/// DELETE /api/v1/kv/{key}
pub async fn delete_key(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    let existed = match state.store.delete(&key) {
        Ok(existed) => existed,
        Err(e) => return state_error(e),
    };
    match state.store.revision() {
        Ok(revision) => Json(ApiResponse::ok(WriteResponse {
            revision,
            existed: Some(existed),
        }))
        .into_response(),
        Err(e) => state_error(e),
    }
}

// ── List / watch ───────────────────────────────────────────────

/// Query parameters for `/list`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}

/// GET /api/v1/list?prefix=
pub async fn list_prefix(State(state): State<ApiState>, Query(q): Query<ListQuery>) -> Response {
    match state.store.list_prefix(&q.prefix) {
        Ok((pairs, revision)) => Json(ApiResponse::ok(ListResponse {
            revision,
            entries: pairs.into_iter().map(WireEntry::from).collect(),
        }))
        .into_response(),
        Err(e) => state_error(e),
    }
}

/// Query parameters for `/watch`.
#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub since: u64,
    pub timeout_ms: Option<u64>,
}

/// GET /api/v1/watch?prefix=&since=&timeout_ms=
///
/// Returns as soon as an event newer than `since` exists under `prefix`,
/// or with an empty event list once the timeout elapses. Replies 410 when
/// `since` is older than the retained history; the client must relist.
pub async fn watch_prefix(
    State(state): State<ApiState>,
    Query(q): Query<WatchQuery>,
) -> Response {
    let timeout = q
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WATCH_TIMEOUT)
        .min(MAX_WATCH_TIMEOUT);

    match state.store.wait_for_events(&q.prefix, q.since, timeout).await {
        Ok((revision, events)) => {
            debug!(prefix = %q.prefix, since = q.since, events = events.len(), "watch answered");
            Json(ApiResponse::ok(WatchResponse {
                revision,
                events: events.into_iter().map(WireEvent::from).collect(),
            }))
            .into_response()
        }
        Err(e) => state_error(e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(ApiResponse::ok("ok"))
}
