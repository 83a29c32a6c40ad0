//! REST handlers for deployments, load balancers, DNS, cron, messaging,
//! gateway routes and bucket keys.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nimbus_cron::CreateCronJobRequest;
use nimbus_deploy::CreateDeploymentRequest;
use nimbus_gateway::CreateRouteRequest;
use nimbus_messaging::CreateQueueRequest;
use nimbus_core::RequestContext;
use nimbus_state::{
    CronJob, CronJobRun, Deployment, DeploymentId, DnsRecord, DnsZone, GatewayRoute, InstanceId, LbAlgorithm, LbTarget,
    LoadBalancer, LoadBalancerId, Queue, QueueMessage, RecordType, Subscription, SubscriptionProtocol, Topic, VpcId,
    ZoneId,
};

use crate::ApiState;
use crate::response::{ApiResponse, ApiResult, Created, created};

// ── Deployments ────────────────────────────────────────────────

/// POST /deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Created<Deployment> {
    Ok(created(state.deployments.create_deployment(&ctx, req).await?))
}

/// GET /deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<Deployment>> {
    Ok(ApiResponse::ok(state.deployments.list_deployments(&ctx).await?))
}

/// GET /deployments/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<DeploymentId>,
) -> ApiResult<Deployment> {
    Ok(ApiResponse::ok(state.deployments.get_deployment(&ctx, id).await?))
}

#[derive(Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

/// POST /deployments/{id}/scale
pub async fn scale_deployment(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<DeploymentId>,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<Deployment> {
    Ok(ApiResponse::ok(state.deployments.scale_deployment(&ctx, id, req.replicas).await?))
}

/// DELETE /deployments/{id}
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<DeploymentId>,
) -> ApiResult<&'static str> {
    state.deployments.delete_deployment(&ctx, id).await?;
    Ok(ApiResponse::ok("deleting"))
}

// ── Load balancers ─────────────────────────────────────────────

fn default_algorithm() -> LbAlgorithm {
    LbAlgorithm::RoundRobin
}

#[derive(Deserialize)]
pub struct CreateLbRequest {
    pub name: String,
    pub vpc_id: VpcId,
    pub port: u16,
    #[serde(default = "default_algorithm")]
    pub algorithm: LbAlgorithm,
}

/// POST /loadbalancers
pub async fn create_lb(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateLbRequest>,
) -> Created<LoadBalancer> {
    let lb = state
        .lbs
        .create_lb(&ctx, &req.name, req.vpc_id, req.port, req.algorithm)
        .await?;
    Ok(created(lb))
}

/// GET /loadbalancers
pub async fn list_lbs(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<LoadBalancer>> {
    Ok(ApiResponse::ok(state.lbs.list_lbs(&ctx).await?))
}

/// GET /loadbalancers/{id}
pub async fn get_lb(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<LoadBalancerId>,
) -> ApiResult<LoadBalancer> {
    Ok(ApiResponse::ok(state.lbs.get_lb(&ctx, id).await?))
}

/// DELETE /loadbalancers/{id}
pub async fn delete_lb(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<LoadBalancerId>,
) -> ApiResult<&'static str> {
    state.lbs.delete_lb(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

fn default_weight() -> u32 {
    1
}

#[derive(Deserialize)]
pub struct AddTargetRequest {
    pub instance_id: InstanceId,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// POST /loadbalancers/{id}/targets
pub async fn add_target(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<LoadBalancerId>,
    Json(req): Json<AddTargetRequest>,
) -> Created<LbTarget> {
    let target = state
        .lbs
        .add_target(&ctx, id, req.instance_id, req.port, req.weight)
        .await?;
    Ok(created(target))
}

/// GET /loadbalancers/{id}/targets
pub async fn list_targets(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<LoadBalancerId>,
) -> ApiResult<Vec<LbTarget>> {
    Ok(ApiResponse::ok(state.lbs.list_targets(&ctx, id).await?))
}

/// DELETE /loadbalancers/{id}/targets/{instance_id}
pub async fn remove_target(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, instance_id)): Path<(LoadBalancerId, InstanceId)>,
) -> ApiResult<&'static str> {
    state.lbs.remove_target(&ctx, id, instance_id).await?;
    Ok(ApiResponse::ok("removed"))
}

// ── DNS ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateZoneRequest {
    pub vpc_id: VpcId,
    pub name: String,
}

/// POST /dns/zones
pub async fn create_zone(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateZoneRequest>,
) -> Created<DnsZone> {
    Ok(created(state.dns.create_zone(&ctx, req.vpc_id, &req.name).await?))
}

/// GET /dns/zones
pub async fn list_zones(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<DnsZone>> {
    Ok(ApiResponse::ok(state.dns.list_zones(&ctx).await?))
}

/// DELETE /dns/zones/{id}
pub async fn delete_zone(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ZoneId>,
) -> ApiResult<&'static str> {
    state.dns.delete_zone(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

fn default_ttl() -> u32 {
    300
}

#[derive(Deserialize)]
pub struct CreateRecordRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub content: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default)]
    pub priority: Option<u16>,
}

/// POST /dns/zones/{id}/records
pub async fn create_record(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ZoneId>,
    Json(req): Json<CreateRecordRequest>,
) -> Created<DnsRecord> {
    let record = state
        .dns
        .create_record(&ctx, id, &req.name, req.record_type, &req.content, req.ttl, req.priority)
        .await?;
    Ok(created(record))
}

/// GET /dns/zones/{id}/records
pub async fn list_records(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ZoneId>,
) -> ApiResult<Vec<DnsRecord>> {
    Ok(ApiResponse::ok(state.dns.list_records(&ctx, id).await?))
}

/// DELETE /dns/zones/{id}/records/{record_id}
pub async fn delete_record(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, record_id)): Path<(ZoneId, Uuid)>,
) -> ApiResult<&'static str> {
    state.dns.delete_record(&ctx, id, record_id).await?;
    Ok(ApiResponse::ok("deleted"))
}

// ── Cron ───────────────────────────────────────────────────────

/// POST /cron/jobs
pub async fn create_cron_job(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateCronJobRequest>,
) -> Created<CronJob> {
    Ok(created(state.cron.create_job(&ctx, req).await?))
}

/// GET /cron/jobs
pub async fn list_cron_jobs(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<CronJob>> {
    Ok(ApiResponse::ok(state.cron.list_jobs(&ctx).await?))
}

/// GET /cron/jobs/{id}
pub async fn get_cron_job(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<CronJob> {
    Ok(ApiResponse::ok(state.cron.get_job(&ctx, id).await?))
}

/// POST /cron/jobs/{id}/pause
pub async fn pause_cron_job(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<CronJob> {
    Ok(ApiResponse::ok(state.cron.pause_job(&ctx, id).await?))
}

/// POST /cron/jobs/{id}/resume
pub async fn resume_cron_job(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<CronJob> {
    Ok(ApiResponse::ok(state.cron.resume_job(&ctx, id).await?))
}

/// DELETE /cron/jobs/{id}
pub async fn delete_cron_job(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<&'static str> {
    state.cron.delete_job(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

/// GET /cron/jobs/{id}/runs
pub async fn list_cron_runs(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<CronJobRun>> {
    Ok(ApiResponse::ok(state.cron.list_runs(&ctx, id).await?))
}

// ── Queues ─────────────────────────────────────────────────────

/// POST /queues
pub async fn create_queue(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateQueueRequest>,
) -> Created<Queue> {
    Ok(created(state.queues.create_queue(&ctx, req).await?))
}

/// GET /queues
pub async fn list_queues(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<Queue>> {
    Ok(ApiResponse::ok(state.queues.list_queues(&ctx).await?))
}

/// DELETE /queues/{id}
pub async fn delete_queue(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<&'static str> {
    state.queues.delete_queue(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

/// POST /queues/{id}/messages
pub async fn send_message(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Created<QueueMessage> {
    Ok(created(state.queues.send_message(&ctx, id, req.body).await?))
}

#[derive(Deserialize)]
pub struct ReceiveParams {
    #[serde(default)]
    pub max: Option<usize>,
}

/// GET /queues/{id}/messages?max=N
pub async fn receive_messages(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
    Query(params): Query<ReceiveParams>,
) -> ApiResult<Vec<QueueMessage>> {
    let max = params.max.unwrap_or(1);
    Ok(ApiResponse::ok(state.queues.receive_messages(&ctx, id, max).await?))
}

/// DELETE /queues/{id}/messages/{receipt_handle}
pub async fn delete_message(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, receipt)): Path<(Uuid, String)>,
) -> ApiResult<&'static str> {
    state.queues.delete_message(&ctx, id, &receipt).await?;
    Ok(ApiResponse::ok("deleted"))
}

#[derive(Serialize)]
pub struct PurgeResponse {
    pub purged: u32,
}

/// POST /queues/{id}/purge
pub async fn purge_queue(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<PurgeResponse> {
    let purged = state.queues.purge_queue(&ctx, id).await?;
    Ok(ApiResponse::ok(PurgeResponse { purged }))
}

// ── Topics ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTopicRequest {
    pub name: String,
}

/// POST /topics
pub async fn create_topic(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateTopicRequest>,
) -> Created<Topic> {
    Ok(created(state.topics.create_topic(&ctx, &req.name).await?))
}

/// GET /topics
pub async fn list_topics(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<Topic>> {
    Ok(ApiResponse::ok(state.topics.list_topics(&ctx).await?))
}

/// DELETE /topics/{id}
pub async fn delete_topic(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<&'static str> {
    state.topics.delete_topic(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub protocol: SubscriptionProtocol,
    pub endpoint: String,
}

/// POST /topics/{id}/subscriptions
pub async fn subscribe(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubscribeRequest>,
) -> Created<Subscription> {
    Ok(created(state.topics.subscribe(&ctx, id, req.protocol, &req.endpoint).await?))
}

/// GET /topics/{id}/subscriptions
pub async fn list_subscriptions(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Subscription>> {
    Ok(ApiResponse::ok(state.topics.list_subscriptions(&ctx, id).await?))
}

/// DELETE /topics/{id}/subscriptions/{subscription_id}
pub async fn unsubscribe(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path((id, subscription_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<&'static str> {
    state.topics.unsubscribe(&ctx, id, subscription_id).await?;
    Ok(ApiResponse::ok("deleted"))
}

#[derive(Deserialize)]
pub struct PublishRequest {
    pub body: String,
}

#[derive(Serialize)]
pub struct PublishResponse {
    pub message_id: Uuid,
}

/// POST /topics/{id}/publish
///
/// Returns once the message is stored; fan-out continues in the background.
pub async fn publish(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
    Json(req): Json<PublishRequest>,
) -> ApiResult<PublishResponse> {
    let publication = state.topics.publish(&ctx, id, req.body).await?;
    Ok(ApiResponse::ok(PublishResponse {
        message_id: publication.message.id,
    }))
}

// ── Gateway routes ─────────────────────────────────────────────

/// POST /gateway/routes
pub async fn create_route(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateRouteRequest>,
) -> Created<GatewayRoute> {
    Ok(created(state.routes.create_route(&ctx, req).await?))
}

/// GET /gateway/routes
pub async fn list_routes(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<Vec<GatewayRoute>> {
    Ok(ApiResponse::ok(state.routes.list_routes(&ctx).await?))
}

/// DELETE /gateway/routes/{id}
pub async fn delete_route(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<&'static str> {
    state.routes.delete_route(&ctx, id).await?;
    Ok(ApiResponse::ok("deleted"))
}

// ── Bucket keys ────────────────────────────────────────────────

/// POST /buckets/{bucket}/key/rotate
pub async fn rotate_bucket_key(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    Path(bucket): Path<String>,
) -> ApiResult<&'static str> {
    state.cipher.rotate(&ctx, &bucket).await?;
    Ok(ApiResponse::ok("rotated"))
}
