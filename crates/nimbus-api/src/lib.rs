//! nimbus-api — REST API for the Nimbus control plane.
//!
//! Every route except registration, login, provider webhooks, `/health`
//! and `/metrics` requires an API key (`X-API-Key`, or
//! `Authorization: Bearer`). Responses use the `{success, data}` /
//! `{success: false, error}` envelope; error kinds map to status codes via
//! `CoreError::http_status`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/auth/register` | Create a user and personal tenant |
//! | POST | `/auth/login` | Exchange credentials for an API key |
//! | GET | `/auth/me` | The calling user |
//! | POST/GET | `/iam/roles`, `/iam/policies` | Custom roles and IAM policies |
//! | PUT | `/iam/users/{id}/role` | Bind a role |
//! | PUT/DELETE | `/iam/users/{id}/policies/{policy_id}` | Attach / detach a policy |
//! | POST/GET | `/instances` | Launch / list instances |
//! | GET/DELETE | `/instances/{id}` | Inspect / terminate |
//! | POST | `/instances/{id}/stop`, `/start` | Power state |
//! | GET | `/instances/{id}/logs` | Container logs |
//! | POST/GET | `/volumes`, `/volumes/{id}` | Block volumes |
//! | POST/GET | `/autoscaling/groups` | Create / list scaling groups |
//! | GET/DELETE | `/autoscaling/groups/{id}` | Inspect / delete a group |
//! | PUT | `/autoscaling/groups/{id}/desired` | Set desired count |
//! | POST/GET | `/autoscaling/groups/{id}/policies` | Scaling policies |
//! | POST/GET | `/deployments` | Replicated deployments |
//! | POST/GET | `/loadbalancers`, `/loadbalancers/{id}/targets` | Load balancers |
//! | POST/GET | `/dns/zones`, `/dns/zones/{id}/records` | DNS |
//! | POST/GET | `/cron/jobs` | Scheduled HTTP jobs |
//! | POST/GET | `/queues`, `/queues/{id}/messages` | Queues |
//! | POST/GET | `/topics`, `/topics/{id}/subscriptions` | Pub/sub |
//! | POST/GET | `/pipelines`, `/pipelines/{id}/builds` | CI pipelines |
//! | POST | `/pipelines/{id}/webhook/{provider}` | Provider webhook (signed) |
//! | POST/GET | `/gateway/routes` | API gateway routes |
//! | POST | `/buckets/{bucket}/key/rotate` | Rotate a bucket data key |
//! | GET | `/metrics` | Prometheus exposition |

pub mod gateway;
pub mod handlers;
pub mod iam_handlers;
pub mod middleware;
pub mod pipeline_handlers;
pub mod resource_handlers;
pub mod response;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};

use nimbus_auth::{AuthService, CachedRbac};
use nimbus_autoscale::ScalingGroupService;
use nimbus_compute::{DnsService, InstanceService, VolumeService};
use nimbus_core::Registry;
use nimbus_cron::CronService;
use nimbus_crypto::EnvelopeCipher;
use nimbus_deploy::DeploymentService;
use nimbus_gateway::RouteService;
use nimbus_lb::LoadBalancerService;
use nimbus_messaging::{QueueService, TopicService};
use nimbus_pipeline::PipelineService;

pub use gateway::gateway_router;
pub use response::{ApiError, ApiResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub auth: Arc<AuthService>,
    pub iam: Arc<CachedRbac>,
    pub instances: Arc<InstanceService>,
    pub volumes: Arc<VolumeService>,
    pub groups: Arc<ScalingGroupService>,
    pub deployments: Arc<DeploymentService>,
    pub lbs: Arc<LoadBalancerService>,
    pub dns: Arc<DnsService>,
    pub cron: Arc<CronService>,
    pub queues: Arc<QueueService>,
    pub topics: Arc<TopicService>,
    pub pipelines: Arc<PipelineService>,
    pub routes: Arc<RouteService>,
    pub cipher: Arc<EnvelopeCipher>,
    pub metrics: Arc<Registry>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    use handlers as h;
    use iam_handlers as i;
    use pipeline_handlers as p;
    use resource_handlers as r;

    let protected = Router::new()
        .route("/auth/me", get(h::me))
        .route("/iam/roles", get(i::list_roles).post(i::create_role))
        .route("/iam/roles/{id}", put(i::update_role).delete(i::delete_role))
        .route("/iam/policies", get(i::list_policies).post(i::create_policy))
        .route("/iam/policies/{id}", axum::routing::delete(i::delete_policy))
        .route("/iam/users/{id}/role", put(i::bind_role))
        .route("/iam/users/{id}/policies/{policy_id}", put(i::attach_policy).delete(i::detach_policy))
        .route("/instances", get(h::list_instances).post(h::launch_instance))
        .route("/instances/{id}", get(h::get_instance).delete(h::terminate_instance))
        .route("/instances/{id}/stop", post(h::stop_instance))
        .route("/instances/{id}/start", post(h::start_instance))
        .route("/instances/{id}/logs", get(h::instance_logs))
        .route("/volumes", post(i::create_volume))
        .route("/volumes/{id}", get(i::get_volume))
        .route("/autoscaling/groups", get(h::list_groups).post(h::create_group))
        .route("/autoscaling/groups/{id}", get(h::get_group).delete(h::delete_group))
        .route("/autoscaling/groups/{id}/desired", put(h::set_desired))
        .route("/autoscaling/groups/{id}/policies", get(h::list_policies).post(h::create_policy))
        .route("/autoscaling/groups/{id}/policies/{policy_id}", axum::routing::delete(h::delete_policy))
        .route("/deployments", get(r::list_deployments).post(r::create_deployment))
        .route("/deployments/{id}", get(r::get_deployment).delete(r::delete_deployment))
        .route("/deployments/{id}/scale", post(r::scale_deployment))
        .route("/loadbalancers", get(r::list_lbs).post(r::create_lb))
        .route("/loadbalancers/{id}", get(r::get_lb).delete(r::delete_lb))
        .route("/loadbalancers/{id}/targets", get(r::list_targets).post(r::add_target))
        .route("/loadbalancers/{id}/targets/{instance_id}", axum::routing::delete(r::remove_target))
        .route("/dns/zones", get(r::list_zones).post(r::create_zone))
        .route("/dns/zones/{id}", axum::routing::delete(r::delete_zone))
        .route("/dns/zones/{id}/records", get(r::list_records).post(r::create_record))
        .route("/dns/zones/{id}/records/{record_id}", axum::routing::delete(r::delete_record))
        .route("/cron/jobs", get(r::list_cron_jobs).post(r::create_cron_job))
        .route("/cron/jobs/{id}", get(r::get_cron_job).delete(r::delete_cron_job))
        .route("/cron/jobs/{id}/pause", post(r::pause_cron_job))
        .route("/cron/jobs/{id}/resume", post(r::resume_cron_job))
        .route("/cron/jobs/{id}/runs", get(r::list_cron_runs))
        .route("/queues", get(r::list_queues).post(r::create_queue))
        .route("/queues/{id}", axum::routing::delete(r::delete_queue))
        .route("/queues/{id}/messages", get(r::receive_messages).post(r::send_message))
        .route("/queues/{id}/messages/{receipt}", axum::routing::delete(r::delete_message))
        .route("/queues/{id}/purge", post(r::purge_queue))
        .route("/topics", get(r::list_topics).post(r::create_topic))
        .route("/topics/{id}", axum::routing::delete(r::delete_topic))
        .route("/topics/{id}/subscriptions", get(r::list_subscriptions).post(r::subscribe))
        .route("/topics/{id}/subscriptions/{subscription_id}", axum::routing::delete(r::unsubscribe))
        .route("/topics/{id}/publish", post(r::publish))
        .route("/pipelines", get(p::list_pipelines).post(p::create_pipeline))
        .route("/pipelines/{id}", get(p::get_pipeline).delete(p::delete_pipeline))
        .route("/pipelines/{id}/active", put(p::set_pipeline_active))
        .route("/pipelines/{id}/builds", get(p::list_builds).post(p::trigger_build))
        .route("/pipelines/{id}/builds/{build_id}", get(p::get_build))
        .route("/gateway/routes", get(r::list_routes).post(r::create_route))
        .route("/gateway/routes/{id}", axum::routing::delete(r::delete_route))
        .route("/buckets/{bucket}/key/rotate", post(r::rotate_bucket_key))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ));

    Router::new()
        .route("/auth/register", post(h::register))
        .route("/auth/login", post(h::login))
        .route("/pipelines/{id}/webhook/{provider}", post(p::pipeline_webhook))
        .route("/health", get(h::health))
        .route("/metrics", get(h::prometheus_metrics))
        .merge(protected)
        .with_state(state)
}
