//! Device token and topic membership endpoints.
//!
//! Topic changes go to the gateway first; the local record is only written
//! once the gateway accepted it, so the registry never claims a membership
//! the gateway does not know about.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiError;
use crate::app::AppState;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub platform: Option<String>,
}

/// POST /api/v1/tokens
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state
        .registry
        .register_token(&req.user_id, &req.token, req.platform.as_deref())?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "user_id": req.user_id, "registered": true })),
    ))
}

/// DELETE /api/v1/tokens/{token}
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.registry.remove_token(&token)?;
    Ok(Json(json!({ "removed": removed })))
}

/// GET /api/v1/tokens/{token}
pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(user_id) = state.registry.user_for_token(&token)? else {
        return Err(ApiError::not_found("TOKEN_NOT_FOUND", "device token is not registered"));
    };
    let topics = state.registry.topics_for_token(&token)?;
    Ok(Json(json!({ "token": token, "user_id": user_id, "topics": topics })))
}

#[derive(Serialize)]
pub struct TokenView {
    pub token: String,
    pub platform: Option<String>,
    pub topics: Vec<String>,
    pub updated_at: String,
}

/// GET /api/v1/users/{user_id}/tokens
pub async fn list_for_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut tokens = Vec::new();
    for t in state.registry.tokens_for_user(&user_id)? {
        let topics = state.registry.topics_for_token(&t.token)?;
        tokens.push(TokenView {
            token: t.token,
            platform: t.platform,
            topics,
            updated_at: t.updated_at,
        });
    }
    Ok(Json(json!({ "user_id": user_id, "tokens": tokens })))
}

#[derive(Deserialize)]
pub struct TopicRequest {
    pub tokens: Vec<String>,
    pub topic: String,
}

impl TopicRequest {
    fn check(&self) -> Result<(), ApiError> {
        if self.tokens.is_empty() {
            return Err(ApiError::bad_request(
                "INVALID_REQUEST",
                "at least one token is required",
            ));
        }
        herald_core::types::validate_topic(&self.topic)
            .map_err(|e| ApiError::bad_request("INVALID_REQUEST", e.to_string()))
    }
}

/// POST /api/v1/topics/subscribe
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TopicRequest>,
) -> Result<Json<Value>, ApiError> {
    req.check()?;
    state.gateway.subscribe(&req.tokens, &req.topic).await?;
    for token in &req.tokens {
        state.registry.subscribe(token, &req.topic)?;
    }
    info!(topic = %req.topic, count = req.tokens.len(), "tokens subscribed");
    Ok(Json(json!({ "topic": req.topic, "count": req.tokens.len() })))
}

/// POST /api/v1/topics/unsubscribe
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TopicRequest>,
) -> Result<Json<Value>, ApiError> {
    req.check()?;
    state.gateway.unsubscribe(&req.tokens, &req.topic).await?;
    let mut removed = 0;
    for token in &req.tokens {
        if state.registry.unsubscribe(token, &req.topic)? {
            removed += 1;
        }
    }
    info!(topic = %req.topic, removed, "tokens unsubscribed");
    Ok(Json(json!({ "topic": req.topic, "count": removed })))
}

/// GET /api/v1/topics/{topic}
pub async fn topic_info(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Result<Json<Value>, ApiError> {
    herald_core::types::validate_topic(&topic)
        .map_err(|e| ApiError::bad_request("INVALID_REQUEST", e.to_string()))?;
    let subscribers = state.registry.subscriber_count(&topic)?;
    Ok(Json(json!({ "topic": topic, "subscribers": subscribers })))
}
