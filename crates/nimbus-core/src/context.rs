//! Per-request identity.

use nimbus_state::{TenantId, UserId};

use crate::error::{CoreError, CoreResult};

/// Identity carried by every service call. The API middleware fills it
/// from the validated API key; reconcilers synthesize one per resource
/// from the owning user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    user_id: Option<UserId>,
    tenant_id: Option<TenantId>,
}

impl RequestContext {
    pub fn new(user_id: UserId, tenant_id: TenantId) -> Self {
        Self {
            user_id: Some(user_id),
            tenant_id: Some(tenant_id),
        }
    }

    /// Acting as `user_id` where no tenant is known, e.g. a verified webhook
    /// acting for the pipeline owner.
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            tenant_id: None,
        }
    }

    /// A context without identity, e.g. for unauthenticated endpoints.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> CoreResult<UserId> {
        self.user_id
            .ok_or_else(|| CoreError::Unauthorized("missing user identity".into()))
    }

    pub fn tenant_id(&self) -> CoreResult<TenantId> {
        self.tenant_id
            .ok_or_else(|| CoreError::Unauthorized("missing tenant identity".into()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}
