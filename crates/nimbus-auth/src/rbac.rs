//! Role-based access control combined with attached IAM policies.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use nimbus_core::authz::permissions;
use nimbus_core::{AuditAction, Authorizer, CoreError, CoreResult, Recorder, RequestContext, require_permission};
use nimbus_state::{Policy, PolicyId, PolicyRepository, Role, RoleRepository, Statement, UserId, UserRepository};

use crate::iam::{self, Decision};

pub const ADMIN: &str = "admin";
pub const DEVELOPER: &str = "developer";
pub const VIEWER: &str = "viewer";

pub const BUILTIN_ROLES: &[&str] = &[ADMIN, DEVELOPER, VIEWER];

/// Built-in roles are not stored; they resolve to fixed ids.
fn builtin_role(name: &str) -> Option<Role> {
    let (n, perms): (u128, Vec<String>) = match name {
        ADMIN => (1, vec!["*".to_string()]),
        DEVELOPER => (2, permissions::DEVELOPER.iter().map(|p| p.to_string()).collect()),
        VIEWER => (3, permissions::VIEWER.iter().map(|p| p.to_string()).collect()),
        _ => return None,
    };
    Some(Role {
        id: Uuid::from_u128(n),
        name: name.to_string(),
        description: format!("built-in {name} role"),
        permissions: perms,
    })
}

fn role_grants(role: &Role, permission: &str) -> bool {
    role.permissions.iter().any(|p| p == "*" || p == permission)
}

pub struct RbacService {
    users: Arc<dyn UserRepository>,
    roles: Arc<dyn RoleRepository>,
    policies: Arc<dyn PolicyRepository>,
    recorder: Recorder,
}

impl RbacService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        roles: Arc<dyn RoleRepository>,
        policies: Arc<dyn PolicyRepository>,
        recorder: Recorder,
    ) -> Self {
        Self {
            users,
            roles,
            policies,
            recorder,
        }
    }

    // ── Roles ──────────────────────────────────────────────────────

    pub async fn get_role(&self, id: Uuid) -> CoreResult<Role> {
        if let Some(role) = BUILTIN_ROLES.iter().filter_map(|n| builtin_role(n)).find(|r| r.id == id) {
            return Ok(role);
        }
        self.roles
            .get_role(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("role {id}")))
    }

    pub async fn get_role_by_name(&self, name: &str) -> CoreResult<Role> {
        if let Some(role) = builtin_role(name) {
            return Ok(role);
        }
        self.roles
            .get_role_by_name(name)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("role {name}")))
    }

    pub async fn list_roles(&self) -> CoreResult<Vec<Role>> {
        let mut roles: Vec<Role> = BUILTIN_ROLES.iter().filter_map(|n| builtin_role(n)).collect();
        roles.extend(self.roles.list_roles().await?);
        Ok(roles)
    }

    pub async fn create_role(
        &self,
        ctx: &RequestContext,
        name: &str,
        description: &str,
        permissions: Vec<String>,
    ) -> CoreResult<Role> {
        require_permission(self, ctx, permissions::ROLE_MANAGE, "*").await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidInput("role name is required".into()));
        }
        if builtin_role(name).is_some() {
            return Err(CoreError::Conflict(format!("role {name} is built in")));
        }
        let role = Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            permissions,
        };
        if !self.roles.create_role(&role).await? {
            return Err(CoreError::Conflict(format!("role {name} already exists")));
        }
        info!(role = %role.name, role_id = %role.id, "role created");
        self.recorder
            .audit(
                ctx,
                AuditAction::RoleCreate {
                    role_id: role.id,
                    name: role.name.clone(),
                },
            )
            .await;
        Ok(role)
    }

    /// Replace a custom role's description and permissions. The name is
    /// immutable.
    pub async fn update_role(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        description: &str,
        permissions: Vec<String>,
    ) -> CoreResult<Role> {
        self.mutate_role(ctx, id, |role| {
            role.description = description.to_string();
            role.permissions = permissions;
        })
        .await
    }

    pub async fn add_permission(&self, ctx: &RequestContext, id: Uuid, permission: &str) -> CoreResult<Role> {
        self.mutate_role(ctx, id, |role| {
            if !role.permissions.iter().any(|p| p == permission) {
                role.permissions.push(permission.to_string());
            }
        })
        .await
    }

    pub async fn remove_permission(&self, ctx: &RequestContext, id: Uuid, permission: &str) -> CoreResult<Role> {
        self.mutate_role(ctx, id, |role| role.permissions.retain(|p| p != permission))
            .await
    }

    async fn mutate_role(&self, ctx: &RequestContext, id: Uuid, apply: impl FnOnce(&mut Role) + Send) -> CoreResult<Role> {
        require_permission(self, ctx, permissions::ROLE_MANAGE, "*").await?;
        let mut role = self
            .roles
            .get_role(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("role {id}")))?;
        apply(&mut role);
        self.roles.update_role(&role).await?;
        self.recorder
            .audit(
                ctx,
                AuditAction::RoleUpdate {
                    role_id: role.id,
                    name: role.name.clone(),
                },
            )
            .await;
        Ok(role)
    }

    /// Delete a custom role. Returns the deleted role.
    pub async fn delete_role(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Role> {
        require_permission(self, ctx, permissions::ROLE_MANAGE, "*").await?;
        let role = self
            .roles
            .get_role(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("role {id}")))?;
        self.roles.delete_role(id).await?;
        self.recorder.audit(ctx, AuditAction::RoleDelete { role_id: id }).await;
        Ok(role)
    }

    /// Bind `user_id` to the role called `role_name`.
    pub async fn bind_role(&self, ctx: &RequestContext, user_id: UserId, role_name: &str) -> CoreResult<()> {
        require_permission(self, ctx, permissions::ROLE_MANAGE, "*").await?;
        self.get_role_by_name(role_name).await?;
        let mut user = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("user {user_id}")))?;
        user.role = role_name.to_string();
        self.users.update_user(&user).await?;
        self.recorder
            .audit(
                ctx,
                AuditAction::RoleBind {
                    user_id,
                    role: role_name.to_string(),
                },
            )
            .await;
        Ok(())
    }

    // ── IAM policies ───────────────────────────────────────────────

    pub async fn create_policy(&self, ctx: &RequestContext, name: &str, statements: Vec<Statement>) -> CoreResult<Policy> {
        require_permission(self, ctx, permissions::POLICY_MANAGE, "*").await?;
        if statements.is_empty() {
            return Err(CoreError::InvalidInput("policy needs at least one statement".into()));
        }
        if statements.iter().any(|s| s.actions.is_empty() || s.resources.is_empty()) {
            return Err(CoreError::InvalidInput(
                "every statement needs actions and resources".into(),
            ));
        }
        let policy = Policy {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id()?,
            name: name.to_string(),
            statements,
            created_at: Utc::now(),
        };
        self.policies.create_policy(&policy).await?;
        self.recorder
            .audit(
                ctx,
                AuditAction::IamPolicyCreate {
                    policy_id: policy.id,
                    name: policy.name.clone(),
                },
            )
            .await;
        Ok(policy)
    }

    pub async fn list_policies(&self, ctx: &RequestContext) -> CoreResult<Vec<Policy>> {
        Ok(self.policies.list_policies(ctx.tenant_id()?).await?)
    }

    async fn tenant_policy(&self, ctx: &RequestContext, id: PolicyId) -> CoreResult<Policy> {
        let tenant_id = ctx.tenant_id()?;
        self.policies
            .get_policy(id)
            .await?
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| CoreError::not_found(format!("policy {id}")))
    }

    pub async fn delete_policy(&self, ctx: &RequestContext, id: PolicyId) -> CoreResult<()> {
        require_permission(self, ctx, permissions::POLICY_MANAGE, "*").await?;
        self.tenant_policy(ctx, id).await?;
        self.policies.delete_policy(id).await?;
        self.recorder
            .audit(ctx, AuditAction::IamPolicyDelete { policy_id: id })
            .await;
        Ok(())
    }

    pub async fn attach_policy(&self, ctx: &RequestContext, user_id: UserId, policy_id: PolicyId) -> CoreResult<()> {
        require_permission(self, ctx, permissions::POLICY_MANAGE, "*").await?;
        let policy = self.tenant_policy(ctx, policy_id).await?;
        let user = self
            .users
            .get_user(user_id)
            .await?
            .filter(|u| u.tenant_id == policy.tenant_id)
            .ok_or_else(|| CoreError::not_found(format!("user {user_id}")))?;
        self.policies
            .attach_policy(policy.tenant_id, user.id, policy.id)
            .await?;
        self.recorder
            .audit(ctx, AuditAction::IamPolicyAttach { policy_id, user_id })
            .await;
        Ok(())
    }

    pub async fn detach_policy(&self, ctx: &RequestContext, user_id: UserId, policy_id: PolicyId) -> CoreResult<()> {
        require_permission(self, ctx, permissions::POLICY_MANAGE, "*").await?;
        let tenant_id = ctx.tenant_id()?;
        if !self.policies.detach_policy(tenant_id, user_id, policy_id).await? {
            return Err(CoreError::not_found(format!("attachment of policy {policy_id}")));
        }
        self.recorder
            .audit(ctx, AuditAction::IamPolicyDetach { policy_id, user_id })
            .await;
        Ok(())
    }
}

#[async_trait]
impl Authorizer for RbacService {
    async fn has_permission(&self, user_id: UserId, permission: &str, resource: &str) -> CoreResult<bool> {
        let Some(user) = self.users.get_user(user_id).await? else {
            debug!(%user_id, permission, "unknown user denied");
            return Ok(false);
        };

        let attached = self
            .policies
            .list_attached_policies(user.tenant_id, user.id)
            .await?;
        match iam::evaluate(&attached, permission, resource) {
            Decision::Deny => {
                debug!(%user_id, permission, resource, "explicit deny");
                return Ok(false);
            }
            Decision::Allow => return Ok(true),
            Decision::NoMatch => {}
        }

        match self.get_role_by_name(&user.role).await {
            Ok(role) => Ok(role_grants(&role, permission)),
            Err(CoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nimbus_core::SystemClock;
    use nimbus_state::{Effect, StateStore, Tenant, TenantQuota, TenantRepository, User};

    pub(crate) async fn seed_user(store: &StateStore, role: &str) -> User {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: format!("t-{}", Uuid::new_v4().simple()),
            name: "tenant".into(),
            owner_id: Uuid::new_v4(),
            quota: TenantQuota::default(),
            created_at: Utc::now(),
        };
        store.create_tenant(&tenant).await.unwrap();
        seed_member(store, tenant.id, role).await
    }

    pub(crate) async fn seed_member(store: &StateStore, tenant_id: nimbus_state::TenantId, role: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            email: format!("{}@nimbus.test", Uuid::new_v4().simple()),
            name: "user".into(),
            password_hash: String::new(),
            role: role.to_string(),
            created_at: Utc::now(),
        };
        store.create_user(&user).await.unwrap();
        user
    }

    pub(crate) fn service(store: &Arc<StateStore>) -> RbacService {
        let recorder = Recorder::new(store.clone(), store.clone(), Arc::new(SystemClock));
        RbacService::new(store.clone(), store.clone(), store.clone(), recorder)
    }

    fn ctx(user: &User) -> RequestContext {
        RequestContext::new(user.id, user.tenant_id)
    }

    #[tokio::test]
    async fn builtin_roles_grant_their_sets() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rbac = service(&store);
        let dev = seed_user(&store, DEVELOPER).await;
        let viewer = seed_user(&store, VIEWER).await;
        let admin = seed_user(&store, ADMIN).await;

        assert!(rbac.has_permission(dev.id, "instance:launch", "*").await.unwrap());
        assert!(!rbac.has_permission(dev.id, "role:manage", "*").await.unwrap());
        assert!(rbac.has_permission(viewer.id, "instance:read", "*").await.unwrap());
        assert!(!rbac.has_permission(viewer.id, "instance:launch", "*").await.unwrap());
        assert!(rbac.has_permission(admin.id, "anything:at-all", "*").await.unwrap());
        assert!(!rbac.has_permission(Uuid::new_v4(), "instance:read", "*").await.unwrap());
    }

    #[tokio::test]
    async fn attached_deny_overrides_role_and_allow() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rbac = service(&store);
        let admin = seed_user(&store, ADMIN).await;
        let user = seed_member(&store, admin.tenant_id, VIEWER).await;

        let allow = rbac
            .create_policy(
                &ctx(&admin),
                "allow-instances",
                vec![Statement {
                    effect: Effect::Allow,
                    actions: vec!["instance:*".into()],
                    resources: vec!["*".into()],
                }],
            )
            .await
            .unwrap();
        let deny = rbac
            .create_policy(
                &ctx(&admin),
                "protect-prod",
                vec![Statement {
                    effect: Effect::Deny,
                    actions: vec!["instance:terminate".into()],
                    resources: vec!["arn:nimbus:instance:prod-123".into()],
                }],
            )
            .await
            .unwrap();
        rbac.attach_policy(&ctx(&admin), user.id, allow.id).await.unwrap();
        rbac.attach_policy(&ctx(&admin), user.id, deny.id).await.unwrap();

        let check = |perm: &'static str, res: &'static str| rbac.has_permission(user.id, perm, res);
        assert!(!check("instance:terminate", "arn:nimbus:instance:prod-123").await.unwrap());
        assert!(check("instance:terminate", "arn:nimbus:instance:dev-456").await.unwrap());
        assert!(check("instance:launch", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn role_management_requires_permission() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rbac = service(&store);
        let dev = seed_user(&store, DEVELOPER).await;
        let err = rbac
            .create_role(&ctx(&dev), "ops", "", vec!["instance:read".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn custom_role_lifecycle() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let rbac = service(&store);
        let admin = seed_user(&store, ADMIN).await;
        let member = seed_user(&store, VIEWER).await;

        let role = rbac
            .create_role(&ctx(&admin), "ops", "operators", vec!["instance:stop".into()])
            .await
            .unwrap();
        let dup = rbac.create_role(&ctx(&admin), "ops", "", vec![]).await.unwrap_err();
        assert!(matches!(dup, CoreError::Conflict(_)));
        let shadow = rbac.create_role(&ctx(&admin), "admin", "", vec![]).await.unwrap_err();
        assert!(matches!(shadow, CoreError::Conflict(_)));

        rbac.bind_role(&ctx(&admin), member.id, "ops").await.unwrap();
        assert!(rbac.has_permission(member.id, "instance:stop", "*").await.unwrap());

        rbac.remove_permission(&ctx(&admin), role.id, "instance:stop").await.unwrap();
        assert!(!rbac.has_permission(member.id, "instance:stop", "*").await.unwrap());

        rbac.delete_role(&ctx(&admin), role.id).await.unwrap();
        assert!(!rbac.has_permission(member.id, "instance:read", "*").await.unwrap());
        assert!(matches!(rbac.bind_role(&ctx(&admin), member.id, "ops").await, Err(CoreError::NotFound(_))));
    }
}
