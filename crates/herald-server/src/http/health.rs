use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": state.gateway.name(),
        "started_at": state.started_at.to_rfc3339(),
        "tick_interval_ms": state.config.scheduler.tick_interval_ms,
    }))
}
