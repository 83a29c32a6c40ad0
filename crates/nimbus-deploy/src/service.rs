//! Deployment CRUD.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use nimbus_core::portmap::{format_ports, parse_ports};
use nimbus_core::{AuditAction, Clock, CoreError, CoreResult, Limits, Recorder, RequestContext};
use nimbus_state::{Deployment, DeploymentId, DeploymentRepository, DeploymentStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub image: String,
    pub replicas: u32,
    #[serde(default)]
    pub ports: String,
}

pub struct DeploymentService {
    deployments: Arc<dyn DeploymentRepository>,
    recorder: Recorder,
    clock: Arc<dyn Clock>,
    limits: Limits,
}

impl DeploymentService {
    pub fn new(
        deployments: Arc<dyn DeploymentRepository>,
        recorder: Recorder,
        clock: Arc<dyn Clock>,
        limits: Limits,
    ) -> Self {
        Self {
            deployments,
            recorder,
            clock,
            limits,
        }
    }

    fn check_replicas(&self, replicas: u32) -> CoreResult<()> {
        if replicas > self.limits.scaling_hard_limit {
            return Err(CoreError::InvalidInput(format!(
                "replicas must be at most {}",
                self.limits.scaling_hard_limit
            )));
        }
        Ok(())
    }

    async fn owned(&self, ctx: &RequestContext, id: DeploymentId) -> CoreResult<Deployment> {
        let user_id = ctx.user_id()?;
        self.deployments
            .get_deployment(id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| CoreError::not_found(format!("deployment {id}")))
    }

    pub async fn create_deployment(&self, ctx: &RequestContext, req: CreateDeploymentRequest) -> CoreResult<Deployment> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("deployment name is required".into()));
        }
        if req.image.trim().is_empty() {
            return Err(CoreError::InvalidInput("image is required".into()));
        }
        self.check_replicas(req.replicas)?;
        let ports = format_ports(&parse_ports(&req.ports, self.limits.max_ports_per_instance)?);

        let now = self.clock.now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            user_id: ctx.user_id()?,
            tenant_id: ctx.tenant_id()?,
            name: name.to_string(),
            image: req.image.trim().to_string(),
            replicas: req.replicas,
            current_count: 0,
            ports,
            status: DeploymentStatus::Scaling,
            created_at: now,
            updated_at: now,
        };
        self.deployments.create_deployment(&deployment).await?;
        info!(deployment_id = %deployment.id, replicas = deployment.replicas, "deployment created");
        self.recorder
            .audit(
                ctx,
                AuditAction::DeploymentCreate {
                    deployment_id: deployment.id,
                    name: deployment.name.clone(),
                    replicas: deployment.replicas,
                },
            )
            .await;
        Ok(deployment)
    }

    pub async fn get_deployment(&self, ctx: &RequestContext, id: DeploymentId) -> CoreResult<Deployment> {
        self.owned(ctx, id).await
    }

    pub async fn list_deployments(&self, ctx: &RequestContext) -> CoreResult<Vec<Deployment>> {
        Ok(self.deployments.list_deployments_for_user(ctx.user_id()?).await?)
    }

    pub async fn scale_deployment(&self, ctx: &RequestContext, id: DeploymentId, replicas: u32) -> CoreResult<Deployment> {
        self.check_replicas(replicas)?;
        let deployment = self.owned(ctx, id).await?;
        if deployment.status == DeploymentStatus::Deleting {
            return Err(CoreError::InvalidState(format!("deployment {id} is being deleted")));
        }
        let now = self.clock.now();
        let deployment = self
            .deployments
            .modify_deployment(id, &|row: &mut Deployment| {
                if row.status == DeploymentStatus::Deleting {
                    return false;
                }
                row.replicas = replicas;
                if row.current_count != replicas {
                    row.status = DeploymentStatus::Scaling;
                }
                row.updated_at = now;
                true
            })
            .await?
            .ok_or_else(|| CoreError::not_found(format!("deployment {id}")))?;
        if deployment.status == DeploymentStatus::Deleting {
            return Err(CoreError::InvalidState(format!("deployment {id} is being deleted")));
        }
        info!(deployment_id = %id, replicas, "deployment scaled");
        self.recorder
            .audit(ctx, AuditAction::DeploymentScale { deployment_id: id, replicas })
            .await;
        Ok(deployment)
    }

    pub async fn delete_deployment(&self, ctx: &RequestContext, id: DeploymentId) -> CoreResult<()> {
        let deployment = self.owned(ctx, id).await?;
        if deployment.status == DeploymentStatus::Deleting {
            return Ok(());
        }
        let now = self.clock.now();
        self.deployments
            .modify_deployment(id, &|row: &mut Deployment| {
                row.status = DeploymentStatus::Deleting;
                row.replicas = 0;
                row.updated_at = now;
                true
            })
            .await?;
        info!(deployment_id = %id, "deployment marked for deletion");
        self.recorder
            .audit(ctx, AuditAction::DeploymentDelete { deployment_id: id })
            .await;
        Ok(())
    }
}
