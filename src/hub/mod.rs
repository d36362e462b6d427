//! REST API server (hub)
//!
//! A panel mounts the `/core` endpoints, a node mounts `/node`. Both share
//! the bearer-token middleware and the public `/` and `/version` routes.

mod auth;
mod common;
mod cores;
mod node;

pub use auth::auth_middleware;
pub use common::{status_of, ApiError, ApiResult};

use crate::service::{CoreManager, NodeAgent};
use crate::{Result, VERSION};

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Bearer token; empty disables auth
    pub secret: String,
    pub manager: Option<Arc<CoreManager>>,
    pub agent: Option<Arc<NodeAgent>>,
}

impl AppState {
    pub fn panel(secret: String, manager: Arc<CoreManager>) -> Self {
        AppState {
            secret,
            manager: Some(manager),
            agent: None,
        }
    }

    pub fn node(secret: String, agent: Arc<NodeAgent>) -> Self {
        AppState {
            secret,
            manager: None,
            agent: Some(agent),
        }
    }
}

/// Create the router for whatever the state carries.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/", get(hello))
        .route("/version", get(version));

    if state.manager.is_some() {
        router = router
            .route("/core/status", get(cores::status))
            .route("/core/restart", post(cores::restart))
            .route("/core/restart-async", post(cores::restart_async))
            .route("/core/stop", post(cores::stop))
            .route("/core/switch", post(cores::switch))
            .route("/core/traffic", get(cores::traffic))
            .route("/core/traffic/reset/:tag", post(cores::reset_traffic))
            .route("/core/config", get(cores::config));
    }
    if state.agent.is_some() {
        router = router
            .route("/node/config", post(node::apply_config))
            .route("/node/status", get(node::status))
            .route("/node/reload", post(node::reload))
            .route("/node/force-reload", post(node::force_reload))
            .route("/node/stop", post(node::stop))
            .route("/node/traffic", get(node::traffic));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("REST API listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "corepanel" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::manager::tests::manager_at;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::path::Path;
    use tower::ServiceExt;

    fn panel(secret: &str) -> Router {
        let manager = Arc::new(manager_at(Path::new("/nonexistent-bin-folder")));
        create_router(AppState::panel(secret.to_string(), manager))
    }

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_version_is_public() {
        let (status, body) = call(panel("s3cret"), get_req("/version")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], VERSION);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let (status, _) = call(panel("s3cret"), get_req("/core/status")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::get("/core/status")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(panel("s3cret"), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "xray");
        assert_eq!(body["running"], false);

        let (status, _) = call(panel("s3cret"), get_req("/core/status?token=s3cret")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_panel_routes() {
        let (status, body) = call(panel(""), get_req("/core/config")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inbounds"][0]["tag"], "api");

        let (status, body) = call(panel(""), get_req("/core/traffic")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let req = Request::post("/core/stop").body(Body::empty()).unwrap();
        let (status, _) = call(panel(""), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let req = Request::post("/core/switch")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"type": "v2ray"}"#))
            .unwrap();
        let (status, body) = call(panel(""), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("must be 'xray' or 'sing-box'"));

        let (status, _) = call(panel(""), get_req("/node/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_node_routes() {
        let agent = Arc::new(NodeAgent::with_bin_folder(
            Path::new("/nonexistent-bin-folder"),
            Path::new("/nonexistent-bin-folder/log"),
        ));
        let router = create_router(AppState::node(String::new(), agent));

        let (status, body) = call(router.clone(), get_req("/node/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["type"], Value::Null);

        let req = Request::post("/node/config?core=sing-box")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = call(router.clone(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let req = Request::post("/node/reload").body(Body::empty()).unwrap();
        let (status, _) = call(router.clone(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = call(router, get_req("/core/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
