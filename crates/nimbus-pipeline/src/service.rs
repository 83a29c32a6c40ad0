//! Pipeline CRUD, manual triggers and webhook admission.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nimbus_core::queue::{BUILD_QUEUE, enqueue_json};
use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Metrics, Recorder, RequestContext, TaskQueue};
use nimbus_state::{
    Build, BuildId, BuildJob, BuildStatus, Pipeline, PipelineId, PipelineRepository, PipelineStatus, TriggerType,
    WebhookDelivery,
};

use crate::payload::{extract_push, normalize_branch};
use crate::signature::{Provider, verify_signature};

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub build_image: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// An inbound provider webhook, body byte-for-byte as received.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub pipeline_id: PipelineId,
    pub provider: Provider,
    pub event: String,
    pub signature: String,
    pub delivery_id: String,
    pub payload: Vec<u8>,
}

pub struct PipelineService {
    pipelines: Arc<dyn PipelineRepository>,
    tasks: Arc<dyn TaskQueue>,
    recorder: Recorder,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
}

impl PipelineService {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        tasks: Arc<dyn TaskQueue>,
        recorder: Recorder,
        metrics: Arc<dyn Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipelines,
            tasks,
            recorder,
            metrics,
            clock,
        }
    }

    async fn owned(&self, ctx: &RequestContext, id: PipelineId) -> CoreResult<Pipeline> {
        let user_id = ctx.user_id()?;
        self.pipelines
            .get_pipeline(id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("pipeline {id}")))
    }

    pub async fn create_pipeline(&self, ctx: &RequestContext, req: CreatePipelineRequest) -> CoreResult<Pipeline> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("pipeline name is required".into()));
        }
        if req.repo_url.trim().is_empty() || req.build_image.trim().is_empty() {
            return Err(CoreError::InvalidInput("repo_url and build_image are required".into()));
        }
        let branch = normalize_branch(req.branch.trim()).to_string();
        if branch.is_empty() {
            return Err(CoreError::InvalidInput("branch is required".into()));
        }
        let steps: Vec<String> = req
            .steps
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            name: name.to_string(),
            repo_url: req.repo_url.trim().to_string(),
            branch,
            build_image: req.build_image.trim().to_string(),
            steps,
            webhook_secret: req.webhook_secret.filter(|s| !s.is_empty()),
            status: PipelineStatus::Active,
            created_at: self.clock.now(),
        };
        self.pipelines.create_pipeline(&pipeline).await?;
        info!(pipeline_id = %pipeline.id, branch = %pipeline.branch, "pipeline created");
        self.recorder
            .audit(
                ctx,
                AuditAction::PipelineCreate {
                    pipeline_id: pipeline.id,
                    name: pipeline.name.clone(),
                },
            )
            .await;
        Ok(pipeline)
    }

    pub async fn get_pipeline(&self, ctx: &RequestContext, id: PipelineId) -> CoreResult<Pipeline> {
        self.owned(ctx, id).await
    }

    pub async fn list_pipelines(&self, ctx: &RequestContext) -> CoreResult<Vec<Pipeline>> {
        Ok(self.pipelines.list_pipelines(ctx.user_id()?).await?)
    }

    pub async fn set_active(&self, ctx: &RequestContext, id: PipelineId, active: bool) -> CoreResult<Pipeline> {
        let mut pipeline = self.owned(ctx, id).await?;
        pipeline.status = if active { PipelineStatus::Active } else { PipelineStatus::Inactive };
        self.pipelines.update_pipeline(&pipeline).await?;
        Ok(pipeline)
    }

    pub async fn delete_pipeline(&self, ctx: &RequestContext, id: PipelineId) -> CoreResult<()> {
        self.owned(ctx, id).await?;
        self.pipelines.delete_pipeline(id).await?;
        info!(pipeline_id = %id, "pipeline deleted");
        self.recorder
            .audit(ctx, AuditAction::PipelineDelete { pipeline_id: id })
            .await;
        Ok(())
    }

    pub async fn trigger_build(&self, ctx: &RequestContext, id: PipelineId, commit: Option<String>) -> CoreResult<Build> {
        let pipeline = self.owned(ctx, id).await?;
        if pipeline.status != PipelineStatus::Active {
            return Err(CoreError::InvalidState(format!("pipeline {id} is inactive")));
        }
        let commit = commit.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| "HEAD".to_string());
        self.queue_build(ctx, &pipeline, commit, TriggerType::Manual).await
    }

    pub async fn get_build(&self, ctx: &RequestContext, pipeline_id: PipelineId, id: BuildId) -> CoreResult<Build> {
        self.owned(ctx, pipeline_id).await?;
        self.pipelines
            .get_build(pipeline_id, id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("build {id}")))
    }

    pub async fn list_builds(&self, ctx: &RequestContext, pipeline_id: PipelineId) -> CoreResult<Vec<Build>> {
        self.owned(ctx, pipeline_id).await?;
        Ok(self.pipelines.list_builds(pipeline_id).await?)
    }

    /// Admit a provider webhook. `Ok(None)` is a silent no-op: a replayed
    /// delivery, a non-push event, or a push to another branch.
    pub async fn handle_webhook(&self, req: WebhookRequest) -> CoreResult<Option<Build>> {
        let outcome = self.admit(req).await;
        let label = match &outcome {
            Ok(Some(_)) => "accepted",
            Ok(None) => "ignored",
            Err(_) => "rejected",
        };
        self.metrics.incr(
            "nimbus_webhook_deliveries_total",
            &[("outcome", label)],
        );
        outcome
    }

    async fn admit(&self, req: WebhookRequest) -> CoreResult<Option<Build>> {
        let pipeline = self
            .pipelines
            .get_pipeline(req.pipeline_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("pipeline {}", req.pipeline_id)))?;
        if pipeline.status != PipelineStatus::Active {
            return Err(CoreError::InvalidState(format!("pipeline {} is inactive", pipeline.id)));
        }
        let Some(secret) = pipeline.webhook_secret.as_deref() else {
            return Err(CoreError::Unauthorized("pipeline has no webhook secret".into()));
        };
        if !verify_signature(req.provider, secret, &req.payload, &req.signature) {
            warn!(pipeline_id = %pipeline.id, provider = %req.provider, "webhook signature mismatch");
            return Err(CoreError::Unauthorized("invalid webhook signature".into()));
        }

        let mut reserved = None;
        if !req.delivery_id.is_empty() {
            let delivery = WebhookDelivery {
                pipeline_id: pipeline.id,
                provider: req.provider.to_string(),
                event: req.event.clone(),
                delivery_id: req.delivery_id.clone(),
                received_at: self.clock.now(),
            };
            if !self.pipelines.reserve_webhook_delivery(&delivery).await? {
                info!(pipeline_id = %pipeline.id, delivery_id = %req.delivery_id, "duplicate webhook delivery ignored");
                return Ok(None);
            }
            reserved = Some(delivery);
        }

        let Some(push) = extract_push(req.provider, &req.event, &req.payload) else {
            debug!(pipeline_id = %pipeline.id, event = %req.event, "webhook event ignored");
            return Ok(None);
        };
        let branch = normalize_branch(&push.git_ref);
        if branch != pipeline.branch {
            debug!(pipeline_id = %pipeline.id, %branch, "push to untracked branch ignored");
            return Ok(None);
        }

        let owner = RequestContext::for_user(pipeline.user_id);
        match self.queue_build(&owner, &pipeline, push.commit, TriggerType::Webhook).await {
            Ok(build) => Ok(Some(build)),
            Err(e) => {
                // Let the provider's retry through.
                if let Some(delivery) = &reserved {
                    if let Err(release) = self.pipelines.release_webhook_delivery(delivery).await {
                        warn!(pipeline_id = %pipeline.id, delivery_id = %delivery.delivery_id, error = %release, "failed to release webhook delivery");
                    }
                }
                Err(e)
            }
        }
    }

    async fn queue_build(
        &self,
        ctx: &RequestContext,
        pipeline: &Pipeline,
        commit: String,
        trigger: TriggerType,
    ) -> CoreResult<Build> {
        let mut build = Build {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            user_id: pipeline.user_id,
            commit_hash: commit,
            trigger_type: trigger,
            status: BuildStatus::Queued,
            logs: String::new(),
            started_at: None,
            finished_at: None,
            created_at: self.clock.now(),
        };
        self.pipelines.create_build(&build).await?;

        let job = BuildJob {
            build_id: build.id,
            pipeline_id: pipeline.id,
            user_id: pipeline.user_id,
        };
        if let Err(e) = enqueue_json(self.tasks.as_ref(), BUILD_QUEUE, &job).await {
            build.status = BuildStatus::Failed;
            build.logs = format!("enqueue failed: {e}\n");
            build.finished_at = Some(self.clock.now());
            if let Err(e) = self.pipelines.update_build(&build).await {
                warn!(build_id = %build.id, error = %e, "failed to mark unqueued build failed");
            }
            return Err(e);
        }

        let trigger_name = match trigger {
            TriggerType::Manual => "manual",
            TriggerType::Webhook => "webhook",
        };
        info!(build_id = %build.id, pipeline_id = %pipeline.id, commit = %build.commit_hash, trigger = trigger_name, "build queued");
        self.recorder
            .audit(
                ctx,
                AuditAction::BuildTrigger {
                    build_id: build.id,
                    pipeline_id: pipeline.id,
                    trigger: trigger_name.to_string(),
                    commit: build.commit_hash.clone(),
                },
            )
            .await;
        self.recorder
            .event(
                "pipeline.build_queued",
                "build",
                build.id,
                json!({ "pipeline_id": pipeline.id, "commit": build.commit_hash, "trigger": trigger_name }),
            )
            .await;
        Ok(build)
    }
}
