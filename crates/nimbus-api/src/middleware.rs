//! Identity middleware.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use nimbus_core::{CoreError, RequestContext};

use crate::ApiState;
use crate::response::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// `X-API-Key: <key>`, or `Authorization: Bearer <key>` as a fallback.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Resolve the API key and attach a [`RequestContext`] to the request.
pub async fn require_api_key(State(state): State<ApiState>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let key = presented_key(req.headers())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| CoreError::Unauthorized("missing api key".into()))?;
    let api_key = state.auth.validate_api_key(key).await?;
    req.extensions_mut()
        .insert(RequestContext::new(api_key.user_id, api_key.tenant_id));
    Ok(next.run(req).await)
}
