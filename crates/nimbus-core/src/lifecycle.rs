//! Capabilities the reconcilers need from the resource services.
//!
//! The auto-scaler and deployment reconciler launch and terminate
//! instances and (de)register load-balancer targets. They depend on these
//! traits rather than on the concrete services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nimbus_state::{Instance, InstanceId, LoadBalancerId, VpcId};

use crate::backend::UserData;
use crate::context::RequestContext;
use crate::error::CoreResult;

/// A volume to attach during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: Uuid,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchParams {
    pub name: String,
    pub image: String,
    /// Port map in `host:container[,...]` form.
    pub ports: String,
    pub instance_type: String,
    pub vpc_id: Option<VpcId>,
    pub volumes: Vec<VolumeAttachment>,
    pub user_data: Option<UserData>,
}

#[async_trait]
pub trait InstanceLifecycle: Send + Sync {
    /// Admit and persist a new instance. Provisioning happens later.
    async fn launch(&self, ctx: &RequestContext, params: LaunchParams) -> CoreResult<Instance>;
    /// Tear an instance down. `NotFound` if it is already gone.
    async fn terminate(&self, ctx: &RequestContext, id: InstanceId) -> CoreResult<()>;
}

#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn attach_target(
        &self,
        ctx: &RequestContext,
        lb_id: LoadBalancerId,
        instance_id: InstanceId,
        port: u16,
    ) -> CoreResult<()>;
    async fn detach_target(&self, ctx: &RequestContext, lb_id: LoadBalancerId, instance_id: InstanceId) -> CoreResult<()>;
}
