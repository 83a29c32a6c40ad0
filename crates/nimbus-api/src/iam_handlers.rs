//! Roles, IAM policies and volumes.
//!
//! Role and policy mutations go through the cached authorizer so every
//! cached decision they could affect is dropped.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use nimbus_core::RequestContext;
use nimbus_state::{Policy, PolicyId, Role, Statement, UserId, Volume};

use crate::ApiState;
use crate::response::{ApiResponse, ApiResult, Created, created};

// ── Roles ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// GET /iam/roles
pub async fn list_roles(State(state): State<ApiState>) -> ApiResult<Vec<Role>> {
    Ok(ApiResponse::ok(state.iam.list_roles().await?))
}

/// POST /iam/roles
pub async fn create_role(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<RoleRequest>,
) -> Created<Role> {
    let role = state
        .iam
        .create_role(&ctx, &req.name, &req.description, req.permissions)
        .await?;
    Ok(created(role))
}

#[derive(Deserialize)]
pub struct UpdateRoleRequest {
    #[serde(default)]
    pub description: String,
    pub permissions: Vec<String>,
}

/// PUT /iam/roles/{id}
pub async fn update_role(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRoleRequest>,
) -> ApiResult<Role> {
    let role = state
        .iam
        .update_role(&ctx, id, &req.description, req.permissions)
        .await?;
    Ok(ApiResponse::ok(role))
}

/// DELETE /iam/roles/{id}
pub async fn delete_role(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Role> {
    Ok(ApiResponse::ok(state.iam.delete_role(&ctx, id).await?))
}

#[derive(Deserialize)]
pub struct BindRoleRequest {
    pub role: String,
}

/// PUT /iam/users/{id}/role
pub async fn bind_role(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<UserId>,
    Json(req): Json<BindRoleRequest>,
) -> ApiResult<&'static str> {
    state.iam.bind_role(&ctx, user_id, &req.role).await?;
    Ok(ApiResponse::ok("bound"))
}

// ── Policies ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PolicyRequest {
    pub name: String,
    pub statements: Vec<Statement>,
}

/// POST /iam/policies
pub async fn create_policy(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<PolicyRequest>,
) -> Created<Policy> {
    Ok(created(state.iam.create_policy(&ctx, &req.name, req.statements).await?))
}

/// GET /iam/policies
pub async fn list_policies(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<Policy>> {
    Ok(ApiResponse::ok(state.iam.list_policies(&ctx).await?))
}

/// DELETE /iam/policies/{id}
pub async fn delete_policy(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<PolicyId>,
) -> ApiResult<&'static str> {
    state.iam.delete_policy(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

/// PUT /iam/users/{user_id}/policies/{policy_id}
pub async fn attach_policy(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((user_id, policy_id)): Path<(UserId, PolicyId)>,
) -> ApiResult<&'static str> {
    state.iam.attach_policy(&ctx, user_id, policy_id).await?;
    Ok(ApiResponse::ok("attached"))
}

/// DELETE /iam/users/{user_id}/policies/{policy_id}
pub async fn detach_policy(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((user_id, policy_id)): Path<(UserId, PolicyId)>,
) -> ApiResult<&'static str> {
    state.iam.detach_policy(&ctx, user_id, policy_id).await?;
    Ok(ApiResponse::ok("detached"))
}

// ── Volumes ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_gb: u32,
}

/// POST /volumes
pub async fn create_volume(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateVolumeRequest>,
) -> Created<Volume> {
    Ok(created(state.volumes.create_volume(&ctx, &req.name, req.size_gb).await?))
}

/// GET /volumes/{id}
pub async fn get_volume(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Volume> {
    Ok(ApiResponse::ok(state.volumes.get_volume(&ctx, id).await?))
}
