//! REST handlers for identity, instances and scaling groups.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use nimbus_autoscale::{CreateGroupRequest, CreatePolicyRequest};
use nimbus_core::{LaunchParams, RequestContext, UserData, VolumeAttachment};
use nimbus_state::{GroupId, Instance, InstanceId, PolicyId, ScalingGroup, ScalingPolicy, Timestamp, User};

use crate::ApiState;
use crate::response::{ApiResponse, ApiResult, Created, created};

// ── Identity ───────────────────────────────────────────────────

/// A user without the password hash.
#[derive(Serialize)]
pub struct UserView {
    pub id: uuid::Uuid,
    pub tenant_id: uuid::Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub created_at: Timestamp,
}

impl From<User> for UserView {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            tenant_id: u.tenant_id,
            email: u.email,
            name: u.name,
            role: u.role,
            created_at: u.created_at,
        }
    }
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: UserView,
    pub api_key: String,
}

/// POST /auth/register
pub async fn register(State(state): State<ApiState>, Json(req): Json<RegisterRequest>) -> Created<UserView> {
    let user = state.auth.register(&req.email, &req.password, &req.name).await?;
    Ok(created(user.into()))
}

/// POST /auth/login
pub async fn login(State(state): State<ApiState>, Json(req): Json<LoginRequest>) -> ApiResult<LoginResponse> {
    let outcome = state.auth.login(&req.email, &req.password).await?;
    Ok(ApiResponse::ok(LoginResponse {
        user: outcome.user.into(),
        api_key: outcome.api_key.key,
    }))
}

/// GET /auth/me
pub async fn me(State(state): State<ApiState>, Extension(ctx): Extension<RequestContext>) -> ApiResult<UserView> {
    Ok(ApiResponse::ok(state.auth.get_user(&ctx).await?.into()))
}

// ── Instances ──────────────────────────────────────────────────

fn default_instance_type() -> String {
    "basic-1".to_string()
}

#[derive(Deserialize)]
pub struct LaunchInstanceRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default)]
    pub vpc_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub volumes: Vec<VolumeAttachment>,
    #[serde(default)]
    pub user_data: Option<UserData>,
}

impl From<LaunchInstanceRequest> for LaunchParams {
    fn from(r: LaunchInstanceRequest) -> Self {
        LaunchParams {
            name: r.name,
            image: r.image,
            ports: r.ports,
            instance_type: r.instance_type,
            vpc_id: r.vpc_id,
            volumes: r.volumes,
            user_data: r.user_data,
        }
    }
}

/// POST /instances
pub async fn launch_instance(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<LaunchInstanceRequest>,
) -> Created<Instance> {
    // Provisioning continues in the background; the row comes back STARTING.
    let instance = state.instances.launch(&ctx, req.into()).await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(instance)))
}

/// GET /instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<Instance>> {
    Ok(ApiResponse::ok(state.instances.list(&ctx).await?))
}

/// GET /instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<InstanceId>,
) -> ApiResult<Instance> {
    Ok(ApiResponse::ok(state.instances.get(&ctx, id).await?))
}

/// GET /instances/{id}/logs
pub async fn instance_logs(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<InstanceId>,
) -> ApiResult<String> {
    Ok(ApiResponse::ok(state.instances.logs(&ctx, id).await?))
}

/// POST /instances/{id}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<InstanceId>,
) -> ApiResult<Instance> {
    Ok(ApiResponse::ok(state.instances.stop(&ctx, id).await?))
}

/// POST /instances/{id}/start
pub async fn start_instance(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<InstanceId>,
) -> ApiResult<Instance> {
    Ok(ApiResponse::ok(state.instances.start(&ctx, id).await?))
}

/// DELETE /instances/{id}
pub async fn terminate_instance(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<InstanceId>,
) -> ApiResult<&'static str> {
    state.instances.terminate(&ctx, id).await?;
    Ok(ApiResponse::ok("terminated"))
}

// ── Auto-scaling ───────────────────────────────────────────────

/// POST /autoscaling/groups
pub async fn create_group(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateGroupRequest>,
) -> Created<ScalingGroup> {
    Ok(created(state.groups.create_group(&ctx, req).await?))
}

/// GET /autoscaling/groups
pub async fn list_groups(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<ScalingGroup>> {
    Ok(ApiResponse::ok(state.groups.list_groups(&ctx).await?))
}

/// GET /autoscaling/groups/{id}
pub async fn get_group(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<GroupId>,
) -> ApiResult<ScalingGroup> {
    Ok(ApiResponse::ok(state.groups.get_group(&ctx, id).await?))
}

#[derive(Deserialize)]
pub struct DesiredRequest {
    pub desired_count: u32,
}

/// PUT /autoscaling/groups/{id}/desired
pub async fn set_desired(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<GroupId>,
    Json(req): Json<DesiredRequest>,
) -> ApiResult<ScalingGroup> {
    Ok(ApiResponse::ok(state.groups.set_desired(&ctx, id, req.desired_count).await?))
}

/// DELETE /autoscaling/groups/{id}
pub async fn delete_group(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<GroupId>,
) -> ApiResult<&'static str> {
    state.groups.delete_group(&ctx, id).await?;
    Ok(ApiResponse::ok("deleting"))
}

/// POST /autoscaling/groups/{id}/policies
pub async fn create_policy(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<GroupId>,
    Json(req): Json<CreatePolicyRequest>,
) -> Created<ScalingPolicy> {
    Ok(created(state.groups.create_policy(&ctx, id, req).await?))
}

/// GET /autoscaling/groups/{id}/policies
pub async fn list_policies(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<GroupId>,
) -> ApiResult<Vec<ScalingPolicy>> {
    Ok(ApiResponse::ok(state.groups.list_policies(&ctx, id).await?))
}

/// DELETE /autoscaling/groups/{id}/policies/{policy_id}
pub async fn delete_policy(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, policy_id)): Path<(GroupId, PolicyId)>,
) -> ApiResult<&'static str> {
    state.groups.delete_policy(&ctx, id, policy_id).await?;
    Ok(ApiResponse::ok("deleted"))
}

// ── Ops ────────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
}
