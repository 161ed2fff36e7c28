//! The Inspection API (C8): a thin JSON wrapper over the `Store`. Grounded
//! in the donor's own `routes.rs` (the `internal()` error-helper pattern,
//! `State`/`Query`/`Path` extractor conventions, `Json<Value>` bodies).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Pagination ──────────────────────────────────────────────────────────────

const DEFAULT_LIMIT: i64 = 25;
const MAX_LIMIT: i64 = 500;

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(0, MAX_LIMIT)
}

fn clamp_offset(offset: Option<i64>) -> i64 {
    offset.unwrap_or(0).max(0)
}

// ── Query param types ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct QueueQuery {
    pub project: Option<String>,
    pub branch: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    pub project: Option<String>,
    pub branch: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct RidQuery {
    pub rid: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct PauseQuery {
    pub value: Option<String>,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn like_pattern(s: &Option<String>) -> Option<String> {
    s.as_ref().map(|v| format!("%{v}%"))
}

pub(crate) async fn get_queue(
    State(state): State<Arc<AppState>>,
    Query(q): Query<QueueQuery>,
) -> Result<Json<Value>, StatusCode> {
    let offset = clamp_offset(q.offset);
    let limit = clamp_limit(q.limit);
    let store = Arc::clone(&state.store);
    let project_like = like_pattern(&q.project);
    let branch_like = like_pattern(&q.branch);
    let (count, result) = tokio::task::spawn_blocking(move || {
        store.get_queue(project_like.as_deref(), branch_like.as_deref(), offset, limit)
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(json!({ "count": count, "result": result })))
}

pub(crate) async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Value>, StatusCode> {
    let offset = clamp_offset(q.offset);
    let limit = clamp_limit(q.limit);
    let store = Arc::clone(&state.store);
    let project_like = like_pattern(&q.project);
    let branch_like = like_pattern(&q.branch);
    let (count, result) = tokio::task::spawn_blocking(move || {
        store.get_history(project_like.as_deref(), branch_like.as_deref(), offset, limit)
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;
    Ok(Json(json!({ "count": count, "result": result })))
}

pub(crate) async fn get_merge_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RidQuery>,
) -> Result<Json<Value>, StatusCode> {
    let store = Arc::clone(&state.store);
    let rid = match &q.rid {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let detail = tokio::task::spawn_blocking(move || match rid {
        Some(rid) => store.get_merge_status_detail(rid),
        None => match store.get_latest_merge_status() {
            Ok(Some(status)) => {
                let changes = store.get_merge_changes(status.rid).unwrap_or_default();
                Ok(Some(mqd_core::types::MergeStatusDetail { status, changes }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        },
    })
    .await
    .map_err(internal)?
    .map_err(internal)?;

    match detail {
        Some(detail) => Ok(Json(serde_json::to_value(detail).map_err(internal)?)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub(crate) async fn get_active_merge_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let store = Arc::clone(&state.store);
    let status = tokio::task::spawn_blocking(move || store.get_latest_merge_status())
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok(Json(match status {
        Some(s) => serde_json::to_value(s).map_err(internal)?,
        None => json!({}),
    }))
}

pub(crate) async fn cancel_merge(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RidQuery>,
) -> Result<Json<Value>, StatusCode> {
    let rid: i64 = q
        .rid
        .as_deref()
        .ok_or(StatusCode::BAD_REQUEST)?
        .parse()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let store = Arc::clone(&state.store);
    let inserted = tokio::task::spawn_blocking(move || store.request_cancel(rid, "inspection-api"))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    let message = if inserted { "Canceled" } else { "Already Canceled in DB" };
    Ok(Json(json!({ "message": message })))
}

pub(crate) async fn get_daemon_status(
    State(state): State<Arc<AppState>>,
) -> Json<Value> {
    let pid = crate::pidfile::read_live_pid(&state.config.daemon.pidfile_path);
    let alive = pid.is_some();
    let paused = crate::pidfile::sentinel_present(&state.config.daemon.offline_sentinel_path);
    Json(json!({ "alive": alive, "paused": paused, "pid": pid }))
}

pub(crate) async fn set_daemon_pause(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PauseQuery>,
) -> Result<Json<Value>, StatusCode> {
    let present = matches!(q.value.as_deref(), Some("true") | Some("1"));
    crate::pidfile::set_sentinel(&state.config.daemon.offline_sentinel_path, present).map_err(internal)?;
    Ok(get_daemon_status(State(state)).await)
}
