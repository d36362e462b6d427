//! Node agent endpoints

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::common::{api_error, ApiError, ApiResult, CoreParams, ResetParams};
use super::AppState;
use crate::service::{NodeAgent, NodeStatus};

fn agent(state: &AppState) -> ApiResult<&std::sync::Arc<NodeAgent>> {
    state.agent.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new("node agent is not available on this role")),
        )
    })
}

/// POST /node/config?core=
pub async fn apply_config(
    State(state): State<AppState>,
    Query(params): Query<CoreParams>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let applied = agent(&state)?
        .apply_config(params.core, &body)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "success": true, "restarted": applied })))
}

/// GET /node/status
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<NodeStatus>> {
    Ok(Json(agent(&state)?.status().await))
}

/// POST /node/reload
pub async fn reload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    agent(&state)?.reload().await.map_err(api_error)?;
    Ok(Json(json!({ "success": true })))
}

/// POST /node/force-reload
pub async fn force_reload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    agent(&state)?.force_reload().await.map_err(api_error)?;
    Ok(Json(json!({ "success": true })))
}

/// POST /node/stop
pub async fn stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    agent(&state)?.stop().await.map_err(api_error)?;
    Ok(Json(json!({ "success": true })))
}

/// GET /node/traffic?reset=
pub async fn traffic(
    State(state): State<AppState>,
    Query(params): Query<ResetParams>,
) -> ApiResult<Json<Value>> {
    let (traffics, clients) = agent(&state)?
        .traffic(params.reset)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "traffics": traffics, "clientTraffics": clients })))
}
