//! The public gateway listener: every request is matched against the
//! route table and forwarded.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use nimbus_gateway::Gateway;

/// Requests larger than this are refused before forwarding.
pub const MAX_GATEWAY_BODY: usize = 10 * 1024 * 1024;

async fn proxy(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_GATEWAY_BODY).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "gateway request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };
    let response = gateway.forward(axum::http::Request::from_parts(parts, body)).await;
    response.map(Body::from).into_response()
}

pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(proxy).with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_gateway::RouteTable;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unrouted_path_is_404() {
        let app = gateway_router(Arc::new(Gateway::new(Arc::new(RouteTable::new()))));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
