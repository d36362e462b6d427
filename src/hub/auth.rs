//! Bearer token authentication with constant-time comparison.

use super::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Paths served without a token
const PUBLIC_PATHS: &[&str] = &["/", "/version"];

/// Accepts `Authorization: Bearer <secret>` or a `token` query parameter.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.secret.is_empty() {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path();
    if PUBLIC_PATHS.iter().any(|p| *p == path) {
        return Ok(next.run(req).await);
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                let token = urlencoding::decode(token).unwrap_or_default();
                if constant_time_eq(token.as_bytes(), state.secret.as_bytes()) {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        if constant_time_eq(token.as_bytes(), state.secret.as_bytes()) {
            return Ok(next.run(req).await);
        }
    }

    debug!("Auth failed for {}", path);
    Err(StatusCode::UNAUTHORIZED)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
