//! Notification endpoints under `/api/v1/notifications`.
//!
//! Handlers are thin: they deserialize, call [`NotificationScheduler`] and map
//! its errors through [`ApiError`]. Creation errors (bad cron, unknown
//! timezone, malformed target) come back synchronously as 400s.
//!
//! [`NotificationScheduler`]: herald_scheduler::NotificationScheduler

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::{Payload, PushMessage, TargetSelector};
use herald_scheduler::{
    DeliveryRecord, JobFilter, JobSummary, SequenceHandle, SequenceSpec, SequenceStep,
    TargetFailure, Trigger,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::ApiError;
use crate::app::AppState;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
pub struct SendRequest {
    pub target: TargetSelector,
    pub message: PushMessage,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub success: bool,
    pub succeeded: usize,
    pub failed: Vec<TargetFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POST /api/v1/notifications/send: deliver right away, no job is created.
pub async fn send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> ApiResult<Json<SendResponse>> {
    let payload = Payload::new(req.target, req.message);
    let result = state.scheduler.send_now(&payload).await?;
    let error = result.verdict().err().map(|e| e.to_string());
    if let Some(ref reason) = error {
        warn!(target = %payload.target, %reason, "immediate send failed");
    }
    Ok(Json(SendResponse {
        success: error.is_none(),
        succeeded: result.succeeded.len(),
        failed: result.failed,
        error,
    }))
}

#[derive(Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub trigger: Trigger,
    pub target: TargetSelector,
    pub message: PushMessage,
}

/// POST /api/v1/notifications/schedule
pub async fn schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let name = req.name.unwrap_or_default();
    let payload = Payload::new(req.target, req.message);
    let id = state.scheduler.schedule(&name, req.trigger, payload)?;
    let job = state.scheduler.job(&id)?;
    info!(job_id = %id, trigger = %job.trigger, "notification scheduled");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": id, "next_fire_at": job.next_fire_at })),
    ))
}

/// GET /api/v1/notifications/scheduled?state=&group_id=&name=&limit=
pub async fn list_scheduled(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> ApiResult<Json<Value>> {
    let jobs: Vec<JobSummary> = state.scheduler.list_scheduled(&filter)?;
    Ok(Json(json!({ "jobs": jobs })))
}

/// GET /api/v1/notifications/scheduled/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobSummary>> {
    let job = state.scheduler.job(&id)?;
    Ok(Json(JobSummary::from(&job)))
}

/// DELETE /api/v1/notifications/scheduled/{id}
///
/// `cancelled: false` when the job is unknown, already running or finished.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let cancelled = state.scheduler.cancel(&id)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

/// GET /api/v1/notifications/scheduled/{id}/deliveries
pub async fn deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let history: Vec<DeliveryRecord> = state.scheduler.deliveries(&id)?;
    Ok(Json(json!({ "job_id": id, "deliveries": history })))
}

#[derive(Deserialize)]
pub struct SequenceRequest {
    pub name: String,
    pub anchor: DateTime<Utc>,
    /// Minutes before `anchor`; `0` fires at the anchor.
    #[serde(default)]
    pub offsets: Vec<u32>,
    /// Per-step overrides; appended after `offsets`.
    #[serde(default)]
    pub steps: Vec<SequenceStep>,
    pub target: TargetSelector,
    /// `{minutes}` in title or body is replaced with each offset.
    pub message: PushMessage,
}

/// POST /api/v1/notifications/sequences
pub async fn compose_sequence(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SequenceRequest>,
) -> ApiResult<(StatusCode, Json<SequenceHandle>)> {
    let mut spec = SequenceSpec::new(
        req.name,
        req.anchor,
        &req.offsets,
        Payload::new(req.target, req.message),
    );
    spec.steps.extend(req.steps);
    let handle = state.scheduler.compose_sequence(&spec)?;
    Ok((StatusCode::CREATED, Json(handle)))
}

/// DELETE /api/v1/notifications/sequences/{group_id}
pub async fn cancel_sequence(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let cancelled = state.scheduler.cancel_group(&group_id)?;
    Ok(Json(json!({ "group_id": group_id, "cancelled": cancelled })))
}

#[derive(Deserialize)]
pub struct TournamentRequest {
    pub tournament_id: String,
    pub tournament_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default = "default_reminders")]
    pub reminder_minutes: Vec<u32>,
}

fn default_reminders() -> Vec<u32> {
    vec![60, 15, 5]
}

/// POST /api/v1/notifications/tournaments: reminders plus a start announcement.
pub async fn tournament(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TournamentRequest>,
) -> ApiResult<(StatusCode, Json<SequenceHandle>)> {
    if req.tournament_id.trim().is_empty() || req.tournament_name.trim().is_empty() {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            "tournament_id and tournament_name are required",
        ));
    }
    let spec = SequenceSpec::tournament(
        &req.tournament_id,
        &req.tournament_name,
        req.start_time,
        &req.reminder_minutes,
    );
    let handle = state.scheduler.compose_sequence(&spec)?;
    info!(
        tournament_id = %req.tournament_id,
        group_id = %handle.group_id,
        jobs = handle.job_ids.len(),
        "tournament notifications scheduled"
    );
    Ok((StatusCode::CREATED, Json(handle)))
}
