//! Authorization port and the permission vocabulary.

use async_trait::async_trait;

use nimbus_state::UserId;

use crate::context::RequestContext;
use crate::error::{CoreError, CoreResult};

/// Permission strings are `<service>:<verb>`.
pub mod permissions {
    pub const INSTANCE_LAUNCH: &str = "instance:launch";
    pub const INSTANCE_READ: &str = "instance:read";
    pub const INSTANCE_START: &str = "instance:start";
    pub const INSTANCE_STOP: &str = "instance:stop";
    pub const INSTANCE_TERMINATE: &str = "instance:terminate";

    pub const ASG_CREATE: &str = "asg:create";
    pub const ASG_READ: &str = "asg:read";
    pub const ASG_UPDATE: &str = "asg:update";
    pub const ASG_DELETE: &str = "asg:delete";

    pub const ROLE_MANAGE: &str = "role:manage";
    pub const POLICY_MANAGE: &str = "policy:manage";

    /// Granted to the built-in `developer` role.
    pub const DEVELOPER: &[&str] = &[
        INSTANCE_LAUNCH,
        INSTANCE_READ,
        INSTANCE_START,
        INSTANCE_STOP,
        INSTANCE_TERMINATE,
        ASG_CREATE,
        ASG_READ,
        ASG_UPDATE,
        ASG_DELETE,
    ];

    /// Granted to the built-in `viewer` role.
    pub const VIEWER: &[&str] = &[INSTANCE_READ, ASG_READ];
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn has_permission(&self, user_id: UserId, permission: &str, resource: &str) -> CoreResult<bool>;
}

/// Fail with `Forbidden` unless the caller holds `permission` on `resource`.
pub async fn require_permission(
    authz: &dyn Authorizer,
    ctx: &RequestContext,
    permission: &str,
    resource: &str,
) -> CoreResult<()> {
    let user_id = ctx.user_id()?;
    if authz.has_permission(user_id, permission, resource).await? {
        Ok(())
    } else {
        Err(CoreError::Forbidden(format!("{permission} on {resource}")))
    }
}
