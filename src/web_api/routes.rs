//! API Routes

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::Result;
use crate::models::DataKind;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Aggregates
        .route("/api/aggregate/{kind}", get(get_aggregate))
        // Fleet status (always live, never cached)
        .route("/api/status", get(get_status))
        // Cache management
        .route("/api/cache/{kind}/age", get(get_cache_age))
        .route("/api/cache/{kind}", delete(invalidate_cache))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AggregateParams {
    /// Force a refresh even when the cache is fresh
    #[serde(default)]
    refresh: bool,
}

/// GET /api/aggregate/{kind}?refresh=true
async fn get_aggregate(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<AggregateParams>,
) -> Result<impl IntoResponse> {
    let kind: DataKind = kind.parse()?;
    let result = state.orchestrator.get_aggregate(kind, params.refresh).await;
    Ok(Json(result))
}

/// GET /api/status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let probes = state.orchestrator.get_status().await;

    let healthy = probes
        .iter()
        .filter(|p| p.status == crate::remote_client::ServerStatus::Healthy)
        .count();

    Json(json!({
        "total": probes.len(),
        "healthy": healthy,
        "servers": probes,
    }))
}

/// GET /api/cache/{kind}/age
async fn get_cache_age(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse> {
    let kind: DataKind = kind.parse()?;
    let age = state.orchestrator.get_cache_age(kind).await;
    Ok(Json(json!({
        "kind": kind,
        "generated_at": age,
    })))
}

/// DELETE /api/cache/{kind}
async fn invalidate_cache(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse> {
    let kind: DataKind = kind.parse()?;
    state.orchestrator.invalidate(kind).await?;
    Ok(Json(json!({
        "kind": kind,
        "cleared": true,
    })))
}
