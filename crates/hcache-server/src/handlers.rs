//! Admin API handlers.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use hcache_core::CacheStatisticsSnapshot;
use serde::Serialize;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    /// `up`, `down`, or `disabled`
    pub far_cache: &'static str,
    pub caches: usize,
    pub uptime_secs: u64,
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let far_cache = match state.manager.far_available().await {
        Some(true) => "up",
        Some(false) => "down",
        None => "disabled",
    };
    // A down far tier degrades caching but does not make the service unhealthy.
    let status = if far_cache == "down" { "degraded" } else { "ok" };
    (
        StatusCode::OK,
        Json(HealthResponse {
            status,
            far_cache,
            caches: state.manager.cache_names().len(),
            uptime_secs: state.started_at.elapsed().as_secs(),
        }),
    )
}

pub async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::render_metrics()
        .ok_or_else(|| ApiError::unavailable("metrics recorder not installed"))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

pub async fn cache_names(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.manager.cache_names())
}

pub async fn all_stats(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, CacheStatisticsSnapshot>> {
    Json(state.manager.snapshots())
}

pub async fn cache_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CacheStatisticsSnapshot>, ApiError> {
    state
        .manager
        .snapshot(&name)
        .map(Json)
        .ok_or_else(|| ApiError::unknown_cache(&name))
}

pub async fn reset_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CacheStatisticsSnapshot>, ApiError> {
    reset(&state, &name, false)
}

pub async fn hard_reset_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CacheStatisticsSnapshot>, ApiError> {
    reset(&state, &name, true)
}

fn reset(state: &AppState, name: &str, hard: bool) -> Result<Json<CacheStatisticsSnapshot>, ApiError> {
    if !state.manager.reset_statistics(name, hard) {
        return Err(ApiError::unknown_cache(name));
    }
    tracing::info!(cache = %name, hard, "statistics reset");
    state
        .manager
        .snapshot(name)
        .map(Json)
        .ok_or_else(|| ApiError::unknown_cache(name))
}

pub async fn clear_cache(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.manager.clear(&name).await {
        return Err(ApiError::unknown_cache(&name));
    }
    tracing::info!(cache = %name, "cache cleared");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_all(State(state): State<AppState>) -> StatusCode {
    state.manager.clear_all().await;
    tracing::info!("all caches cleared");
    StatusCode::NO_CONTENT
}

pub async fn evict_key(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if !state.manager.evict(&name, &key).await? {
        return Err(ApiError::unknown_cache(&name));
    }
    tracing::debug!(cache = %name, key = %key, "key evicted");
    Ok(StatusCode::NO_CONTENT)
}
