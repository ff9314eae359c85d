//! Operational HTTP surface: scheduler control, on-demand triggers, monitor queries.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::ai::AiTask;
use crate::context::AppContext;
use crate::error::{AiError, MailError, SchedulerError};
use crate::mail::ProviderKind;
use crate::worker::monitor::DEFAULT_HISTORY_LIMIT;
use crate::worker::{
    AiProcessingArgs, BulkAiProcessingArgs, BulkEmailSyncArgs, EmailSyncArgs, Worker,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
}

/// Build the router with every operational route and the configured CORS policy.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = cors_layer(&ctx.config.cors_origins);
    let state = AppState { ctx };

    Router::new()
        .route("/health", get(health))
        // Scheduler
        .route("/api/workers/scheduler/status", get(scheduler_status))
        .route("/api/workers/scheduler/start", post(scheduler_start))
        .route("/api/workers/scheduler/stop", post(scheduler_stop))
        .route("/api/workers/scheduler/jobs/{id}/pause", post(pause_job))
        .route("/api/workers/scheduler/jobs/{id}/resume", post(resume_job))
        .route("/api/workers/scheduler/jobs/{id}", delete(remove_job))
        // Sync
        .route("/api/workers/sync/trigger", post(trigger_sync))
        .route("/api/workers/sync/status/{user_id}", get(sync_status))
        .route("/api/workers/mail/reply", post(send_reply))
        // AI
        .route("/api/workers/ai/trigger", post(trigger_ai))
        .route("/api/workers/ai/bulk", post(trigger_bulk_ai))
        .route("/api/workers/ai/rewrite", post(rewrite_reply))
        // Monitor
        .route(
            "/api/workers/monitor/stats",
            get(all_stats).delete(clear_all_stats),
        )
        .route(
            "/api/workers/monitor/stats/{worker}",
            get(worker_stats).delete(clear_worker_stats),
        )
        .route("/api/workers/monitor/history/{worker}", get(worker_history))
        .route("/api/workers/monitor/failures", get(recent_failures))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn bad_id(name: &str) -> (StatusCode, Json<serde_json::Value>) {
    error_body(StatusCode::BAD_REQUEST, format!("Invalid {name}"))
}

fn scheduler_error(e: SchedulerError) -> (StatusCode, Json<serde_json::Value>) {
    match e {
        SchedulerError::JobNotFound(_) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        SchedulerError::InvalidTrigger(_) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "Request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-workers",
    }))
}

// ── Scheduler ───────────────────────────────────────────────────────────

async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = &state.ctx.scheduler;
    Json(serde_json::json!({
        "running": scheduler.is_running().await,
        "jobs": scheduler.get_jobs_info().await,
    }))
}

async fn scheduler_start(State(state): State<AppState>) -> impl IntoResponse {
    let started = state.ctx.scheduler.start().await;
    info!(started, "Scheduler start requested");
    Json(serde_json::json!({
        "running": true,
        "started": started,
    }))
}

async fn scheduler_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.ctx.scheduler.stop().await;
    info!("Scheduler stop requested");
    Json(serde_json::json!({ "running": false }))
}

async fn pause_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if id.trim().is_empty() {
        return bad_id("job id");
    }
    match state.ctx.scheduler.pause_job(&id).await {
        Ok(job) => (StatusCode::OK, Json(serde_json::json!(job))),
        Err(e) => scheduler_error(e),
    }
}

async fn resume_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if id.trim().is_empty() {
        return bad_id("job id");
    }
    match state.ctx.scheduler.resume_job(&id).await {
        Ok(job) => (StatusCode::OK, Json(serde_json::json!(job))),
        Err(e) => scheduler_error(e),
    }
}

async fn remove_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if id.trim().is_empty() {
        return bad_id("job id");
    }
    match state.ctx.scheduler.remove_job(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "removed": id })),
        ),
        Err(e) => scheduler_error(e),
    }
}

// ── Sync ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SyncTriggerRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    provider: Option<ProviderKind>,
    #[serde(default)]
    lookback_days: Option<u32>,
    #[serde(default)]
    full_sync: bool,
}

async fn trigger_sync(
    State(state): State<AppState>,
    Json(body): Json<SyncTriggerRequest>,
) -> impl IntoResponse {
    let envelope = match body.user_id {
        Some(user_id) => {
            if user_id.trim().is_empty() {
                return bad_id("user_id");
            }
            state
                .ctx
                .email_sync
                .run(EmailSyncArgs {
                    user_id,
                    provider: body.provider,
                    lookback_days: body.lookback_days,
                    full_sync: body.full_sync,
                })
                .await
        }
        None => {
            state
                .ctx
                .bulk_email_sync
                .run(BulkEmailSyncArgs {
                    lookback_days: body.lookback_days,
                    full_sync: body.full_sync,
                })
                .await
        }
    };
    (StatusCode::OK, Json(serde_json::json!(envelope)))
}

async fn sync_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    if user_id.trim().is_empty() {
        return bad_id("user_id");
    }
    match state.ctx.mail_sync.sync_status(&user_id).await {
        Ok(logs) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "user_id": user_id,
                "providers": logs,
            })),
        ),
        Err(e) => internal(e),
    }
}

#[derive(Debug, Deserialize)]
struct SendReplyRequest {
    user_id: String,
    thread_id: String,
    /// Falls back to the stored reply draft when absent.
    #[serde(default)]
    body: Option<String>,
}

async fn send_reply(
    State(state): State<AppState>,
    Json(req): Json<SendReplyRequest>,
) -> impl IntoResponse {
    if req.user_id.trim().is_empty() {
        return bad_id("user_id");
    }
    let Ok(thread_id) = uuid::Uuid::parse_str(req.thread_id.trim()) else {
        return bad_id("thread_id");
    };
    match state
        .ctx
        .replies
        .send_reply(&req.user_id, thread_id, req.body.as_deref())
        .await
    {
        Ok(sent) => (StatusCode::OK, Json(serde_json::json!(sent))),
        Err(e @ MailError::ThreadNotFound(_)) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ (MailError::EmptyReply(_) | MailError::NotConnected { .. })) => {
            error_body(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => internal(e),
    }
}

// ── AI ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AiTriggerRequest {
    user_id: String,
    thread_id: String,
    #[serde(default)]
    tasks: Option<Vec<AiTask>>,
    #[serde(default)]
    force_regenerate: bool,
}

async fn trigger_ai(
    State(state): State<AppState>,
    Json(body): Json<AiTriggerRequest>,
) -> impl IntoResponse {
    if body.user_id.trim().is_empty() {
        return bad_id("user_id");
    }
    if body.thread_id.trim().is_empty() {
        return bad_id("thread_id");
    }
    let envelope = state
        .ctx
        .ai_processing
        .run(AiProcessingArgs {
            user_id: body.user_id,
            thread_id: body.thread_id,
            tasks: body.tasks,
            force_regenerate: body.force_regenerate,
        })
        .await;
    (StatusCode::OK, Json(serde_json::json!(envelope)))
}

async fn trigger_bulk_ai(
    State(state): State<AppState>,
    Json(args): Json<BulkAiProcessingArgs>,
) -> impl IntoResponse {
    let envelope = state.ctx.bulk_ai_processing.run(args).await;
    Json(serde_json::json!(envelope))
}

#[derive(Debug, Deserialize)]
struct RewriteRequest {
    draft: String,
    instruction: String,
}

async fn rewrite_reply(
    State(state): State<AppState>,
    Json(body): Json<RewriteRequest>,
) -> impl IntoResponse {
    let orchestrator = state.ctx.artifacts.orchestrator();
    match orchestrator.rewrite_reply(&body.draft, &body.instruction).await {
        Ok(text) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "text": text,
                "model_used": orchestrator.model_name(),
            })),
        ),
        Err(e @ AiError::Validation(_)) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ AiError::ServiceUnavailable { .. }) => {
            error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => internal(e),
    }
}

// ── Monitor ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FailuresQuery {
    limit: Option<usize>,
    hours: Option<i64>,
}

async fn all_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.ctx.monitor.get_all_worker_stats().await {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!({ "workers": stats }))),
        Err(e) => internal(e),
    }
}

async fn worker_stats(
    State(state): State<AppState>,
    Path(worker): Path<String>,
) -> impl IntoResponse {
    if worker.trim().is_empty() {
        return bad_id("worker name");
    }
    match state.ctx.monitor.get_worker_stats(&worker).await {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
        Err(e) => internal(e),
    }
}

async fn worker_history(
    State(state): State<AppState>,
    Path(worker): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    if worker.trim().is_empty() {
        return bad_id("worker name");
    }
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.ctx.monitor.get_worker_history(&worker, limit).await {
        Ok(history) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "worker": worker,
                "history": history,
            })),
        ),
        Err(e) => internal(e),
    }
}

async fn recent_failures(
    State(state): State<AppState>,
    Query(query): Query<FailuresQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(10);
    let hours = query.hours.unwrap_or(24);
    if hours < 0 {
        return error_body(StatusCode::BAD_REQUEST, "hours must not be negative");
    }
    match state.ctx.monitor.get_recent_failures(limit, hours).await {
        Ok(failures) => (
            StatusCode::OK,
            Json(serde_json::json!({ "failures": failures })),
        ),
        Err(e) => internal(e),
    }
}

async fn clear_worker_stats(
    State(state): State<AppState>,
    Path(worker): Path<String>,
) -> impl IntoResponse {
    if worker.trim().is_empty() {
        return bad_id("worker name");
    }
    match state.ctx.monitor.clear_worker_stats(&worker).await {
        Ok(cleared) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "worker": worker,
                "cleared": cleared,
            })),
        ),
        Err(e) => internal(e),
    }
}

async fn clear_all_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.ctx.monitor.clear_all_stats().await {
        Ok(cleared) => (StatusCode::OK, Json(serde_json::json!({ "cleared": cleared }))),
        Err(e) => internal(e),
    }
}
