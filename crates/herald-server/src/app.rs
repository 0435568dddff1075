use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use herald_core::config::HeraldConfig;
use herald_push::{PushGateway, SqliteTokenRegistry};
use herald_scheduler::NotificationScheduler;

use crate::http::{health, notifications, tokens};

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: HeraldConfig,
    pub scheduler: NotificationScheduler,
    pub registry: Arc<SqliteTokenRegistry>,
    /// Same gateway the executor sends through; used here for topic membership.
    pub gateway: Arc<dyn PushGateway>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: HeraldConfig,
        scheduler: NotificationScheduler,
        registry: Arc<SqliteTokenRegistry>,
        gateway: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            config,
            scheduler,
            registry,
            gateway,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/notifications/send", post(notifications::send))
        .route("/notifications/schedule", post(notifications::schedule))
        .route("/notifications/scheduled", get(notifications::list_scheduled))
        .route(
            "/notifications/scheduled/{id}",
            delete(notifications::cancel).get(notifications::get_job),
        )
        .route(
            "/notifications/scheduled/{id}/deliveries",
            get(notifications::deliveries),
        )
        .route("/notifications/sequences", post(notifications::compose_sequence))
        .route(
            "/notifications/sequences/{group_id}",
            delete(notifications::cancel_sequence),
        )
        .route("/notifications/tournaments", post(notifications::tournament))
        .route("/tokens", post(tokens::register))
        .route("/tokens/{token}", delete(tokens::remove).get(tokens::lookup))
        .route("/users/{user_id}/tokens", get(tokens::list_for_user))
        .route("/topics/subscribe", post(tokens::subscribe))
        .route("/topics/unsubscribe", post(tokens::unsubscribe))
        .route("/topics/{topic}", get(tokens::topic_info));

    Router::new()
        .route("/health", get(health::health_handler))
        .nest("/api/v1", api)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
