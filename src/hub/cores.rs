//! Panel-side core endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::common::{api_error, ApiError, ApiResult, ForceParams, SwitchRequest};
use super::AppState;
use crate::model::OutboundTraffic;
use crate::service::{CoreManager, CoreStatus};

fn manager(state: &AppState) -> ApiResult<&std::sync::Arc<CoreManager>> {
    state.manager.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new("core manager is not available on this role")),
        )
    })
}

/// GET /core/status
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<CoreStatus>> {
    let status = manager(&state)?.status().await.map_err(api_error)?;
    Ok(Json(status))
}

/// POST /core/restart
pub async fn restart(
    State(state): State<AppState>,
    Query(params): Query<ForceParams>,
) -> ApiResult<Json<Value>> {
    manager(&state)?
        .restart(params.force)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "success": true })))
}

/// POST /core/restart-async
pub async fn restart_async(
    State(state): State<AppState>,
    Query(params): Query<ForceParams>,
) -> ApiResult<StatusCode> {
    manager(&state)?.restart_async(params.force);
    Ok(StatusCode::ACCEPTED)
}

/// POST /core/stop
pub async fn stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    manager(&state)?.stop().await.map_err(api_error)?;
    Ok(Json(json!({ "success": true })))
}

/// POST /core/switch
pub async fn switch(
    State(state): State<AppState>,
    Json(body): Json<SwitchRequest>,
) -> ApiResult<Json<Value>> {
    let manager = manager(&state)?;
    manager
        .switch_core_with_conversion(&body.core)
        .await
        .map_err(api_error)?;
    let core = manager.settings().get_core_type().await.map_err(api_error)?;
    Ok(Json(json!({ "success": true, "type": core })))
}

/// GET /core/traffic
pub async fn traffic(State(state): State<AppState>) -> ApiResult<Json<Vec<OutboundTraffic>>> {
    let rows = manager(&state)?
        .store()
        .outbound_traffics()
        .await
        .map_err(api_error)?;
    Ok(Json(rows))
}

/// POST /core/traffic/reset/:tag
pub async fn reset_traffic(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> ApiResult<Json<Value>> {
    manager(&state)?
        .store()
        .reset_outbound_traffic(&tag)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "success": true })))
}

/// GET /core/config
pub async fn config(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let manager = manager(&state)?;
    let core = manager.settings().get_core_type().await.map_err(api_error)?;
    let config = manager.build_config(core).await.map_err(api_error)?;
    Ok(Json(config))
}
