//! Pipeline handlers, including the unauthenticated provider webhook.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use nimbus_core::{CoreError, RequestContext};
use nimbus_pipeline::{CreatePipelineRequest, Provider, WebhookRequest};
use nimbus_state::{Build, BuildId, Pipeline, PipelineId, PipelineStatus, Timestamp};

use crate::ApiState;
use crate::response::{ApiError, ApiResponse, ApiResult, Created, created};

/// A pipeline with its webhook secret withheld.
#[derive(Serialize)]
pub struct PipelineView {
    pub id: PipelineId,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub build_image: String,
    pub steps: Vec<String>,
    pub has_webhook_secret: bool,
    pub status: PipelineStatus,
    pub created_at: Timestamp,
}

impl From<Pipeline> for PipelineView {
    fn from(p: Pipeline) -> Self {
        Self {
            id: p.id,
            name: p.name,
            repo_url: p.repo_url,
            branch: p.branch,
            build_image: p.build_image,
            steps: p.steps,
            has_webhook_secret: p.webhook_secret.is_some(),
            status: p.status,
            created_at: p.created_at,
        }
    }
}

/// POST /pipelines
pub async fn create_pipeline(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreatePipelineRequest>,
) -> Created<PipelineView> {
    Ok(created(state.pipelines.create_pipeline(&ctx, req).await?.into()))
}

/// GET /pipelines
pub async fn list_pipelines(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<PipelineView>> {
    let pipelines = state.pipelines.list_pipelines(&ctx).await?;
    Ok(ApiResponse::ok(pipelines.into_iter().map(Into::into).collect()))
}

/// GET /pipelines/{id}
pub async fn get_pipeline(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<PipelineId>,
) -> ApiResult<PipelineView> {
    Ok(ApiResponse::ok(state.pipelines.get_pipeline(&ctx, id).await?.into()))
}

#[derive(Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

/// PUT /pipelines/{id}/active
pub async fn set_pipeline_active(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<PipelineId>,
    Json(req): Json<ActiveRequest>,
) -> ApiResult<PipelineView> {
    Ok(ApiResponse::ok(state.pipelines.set_active(&ctx, id, req.active).await?.into()))
}

/// DELETE /pipelines/{id}
pub async fn delete_pipeline(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<PipelineId>,
) -> ApiResult<&'static str> {
    state.pipelines.delete_pipeline(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

#[derive(Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub commit: Option<String>,
}

/// POST /pipelines/{id}/builds
pub async fn trigger_build(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<PipelineId>,
    body: Bytes,
) -> Created<Build> {
    // The body is optional; an empty POST builds HEAD.
    let commit = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<TriggerRequest>(&body)
            .map_err(|e| CoreError::InvalidInput(format!("invalid trigger body: {e}")))?
            .commit
    };
    let build = state.pipelines.trigger_build(&ctx, id, commit).await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(build)))
}

/// GET /pipelines/{id}/builds
pub async fn list_builds(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<PipelineId>,
) -> ApiResult<Vec<Build>> {
    Ok(ApiResponse::ok(state.pipelines.list_builds(&ctx, id).await?))
}

/// GET /pipelines/{id}/builds/{build_id}
pub async fn get_build(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, build_id)): Path<(PipelineId, BuildId)>,
) -> ApiResult<Build> {
    Ok(ApiResponse::ok(state.pipelines.get_build(&ctx, id, build_id).await?))
}

/// Signature, event and delivery-id header names per provider.
fn provider_headers(provider: Provider) -> (&'static str, &'static str, &'static str) {
    match provider {
        Provider::Github => ("x-hub-signature-256", "x-github-event", "x-github-delivery"),
        Provider::Gitlab => ("x-gitlab-token", "x-gitlab-event", "x-gitlab-event-uuid"),
    }
}

/// POST /pipelines/{id}/webhook/{provider}
///
/// The body is taken byte-for-byte; the signature covers it exactly.
pub async fn pipeline_webhook(
    State(state): State<ApiState>,
    Path((id, provider)): Path<(PipelineId, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let provider: Provider = provider.parse()?;
    let (signature, event, delivery) = provider_headers(provider);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let req = WebhookRequest {
        pipeline_id: id,
        provider,
        event: header(event),
        signature: header(signature),
        delivery_id: header(delivery),
        payload: body.to_vec(),
    };
    let response = match state.pipelines.handle_webhook(req).await? {
        Some(build) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(json!({ "status": "queued", "build_id": build.id })),
        )
            .into_response(),
        None => ApiResponse::ok(json!({ "status": "ignored" })).into_response(),
    };
    Ok(response)
}
