//! HTTP surface: webhook ingress, the manual enrichment endpoint, liveness,
//! and the gated debug routes.

pub mod debug;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::info;

use crate::config::AppConfig;
use crate::events::EventStore;
use crate::idempotency::IdempotencyGuard;
use crate::queue::Queue;
use crate::staging::Staging;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub events: Arc<EventStore>,
    pub guard: Arc<IdempotencyGuard>,
    pub queue: Arc<Queue>,
    pub staging: Arc<Staging>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/calendar", post(webhooks::calendar_webhook))
        .route("/webhooks/meetings", post(webhooks::meetings_webhook))
        .route("/webhooks/support", post(webhooks::support_webhook))
        .route("/enrich/lead", post(webhooks::enrich_lead))
        .route("/debug/ping", get(debug::ping))
        .route("/debug/events/:event_id", get(debug::event))
        .route("/debug/idem/:key", get(debug::idem))
        .route("/debug/status", get(debug::status))
        .with_state(state)
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "Ingress server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, finishing in-flight requests");
        })
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
