//! API route definitions.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use crate::storage::HistoryEntry;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", get(list_projects))
        .route("/projects/{key}/run", post(run_project))
        .route("/flows", get(list_flows))
        .route("/flows/{name}/run", post(run_flow))
        .route("/history", get(list_history))
        .route("/history/clear", post(clear_history))
        .route("/stats", get(stats))
}

/// Handler error mapped to a JSON body.
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": { "message": message } }))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_projects(State(state): State<AppState>) -> Json<Value> {
    let config = state.orchestrator.config();
    let projects: Vec<Value> = config
        .projects
        .iter()
        .map(|(key, p)| {
            json!({
                "key": key,
                "name": p.name,
                "testFiles": p.test_files,
                "environment": p.environment,
            })
        })
        .collect();
    let total = projects.len();
    Json(json!({ "data": projects, "meta": { "total": total } }))
}

#[derive(Debug, Deserialize)]
struct RunParams {
    env: Option<String>,
}

async fn run_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    info!(project = %key, env = ?params.env, "run requested");
    let report = state
        .orchestrator
        .execute_project(&key, params.env.as_deref())
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(Json(json!({ "data": report })))
}

async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    let config = state.orchestrator.config();
    let flows: Vec<Value> = config
        .flows
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "project": f.project,
                "environment": f.environment,
                "trigger": f.trigger,
                "checks": f.checks,
                "testFiles": f.test_files,
            })
        })
        .collect();
    let total = flows.len();
    Json(json!({ "data": flows, "meta": { "total": total } }))
}

async fn run_flow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    info!(flow = %name, env = ?params.env, "flow run requested");
    let report = state
        .orchestrator
        .execute_flow(&name, params.env.as_deref())
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(Json(json!({ "data": report })))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(state.orchestrator.config().server.history_limit);
    let records = state
        .orchestrator
        .history()
        .list_recent(limit)
        .map_err(internal)?;
    let entries: Vec<HistoryEntry> = records.iter().map(HistoryEntry::from).collect();
    let total = entries.len();
    Ok(Json(json!({ "data": entries, "meta": { "total": total, "limit": limit } })))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .orchestrator
        .history()
        .aggregate_stats()
        .map_err(internal)?;
    Ok(Json(json!({ "data": stats })))
}

async fn clear_history(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .orchestrator
        .clear_history()
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "data": { "deleted": deleted } })))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "request failed");
    ApiError::Internal(e.to_string())
}
