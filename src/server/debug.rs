//! Introspection endpoints, available only when `allow_debug_endpoints` is
//! set. When disabled every route answers 404 so the surface is
//! indistinguishable from absent.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found"}))).into_response()
}

pub async fn ping(State(state): State<AppState>) -> Response {
    if !state.config.service.allow_debug_endpoints {
        return not_found();
    }
    Json(json!({"ok": true})).into_response()
}

pub async fn event(State(state): State<AppState>, Path(event_id): Path<String>) -> Response {
    if !state.config.service.allow_debug_endpoints {
        return not_found();
    }
    match state.events.load(&event_id).await {
        Ok(Some(ev)) => Json(json!({
            "id": ev.event_id,
            "source": ev.source.as_str(),
            "event_type": ev.event_type,
            "external_id": ev.external_id,
            "idempotency_key": ev.idempotency_key,
            "status": ev.status.as_str(),
            "attempts": ev.attempts,
            "last_error": ev.last_error,
            "created_at": ev.created_at.to_rfc3339(),
            "updated_at": ev.updated_at.to_rfc3339(),
            "payload": ev.payload,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Event not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn idem(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    if !state.config.service.allow_debug_endpoints {
        return not_found();
    }
    let held_by = state.guard.holder(&key).await.unwrap_or(None);
    let processed = state.guard.is_processed(&key).await.unwrap_or(false);
    Json(json!({
        "idempotency_key": key,
        "held_by": held_by,
        "processed": processed,
    }))
    .into_response()
}

pub async fn status(State(state): State<AppState>) -> Response {
    if !state.config.service.allow_debug_endpoints {
        return not_found();
    }
    match state.queue.stats().await {
        Ok(stats) => Json(json!({
            "queued": stats.queued,
            "started": stats.started,
            "finished": stats.finished,
            "failed": stats.failed,
            "recent_failures": stats.recent_failures,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": e.to_string()})),
        )
            .into_response(),
    }
}
