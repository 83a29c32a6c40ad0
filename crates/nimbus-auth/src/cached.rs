//! Write-invalidating cache in front of [`RbacService`].
//!
//! Permission decisions live at `rbac:perm:<user>:<perm>:<resource>` as
//! `"0"`/`"1"`. Roles are cached by id and by name. Every role or policy
//! mutation drops the affected role entries and the whole permission
//! namespace. Cache failures are treated as misses.
//!
//! Invalidations bump a generation counter. A fill computed under an older
//! generation is not written, and is deleted again if the generation moved
//! while it was being written.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use nimbus_core::cache::DEFAULT_TTL;
use nimbus_core::{Authorizer, Cache, CoreResult, RequestContext};
use nimbus_state::{Policy, PolicyId, Role, Statement, UserId};

use crate::rbac::RbacService;

const PERM_PREFIX: &str = "rbac:perm:";

fn perm_key(user_id: UserId, permission: &str, resource: &str) -> String {
    format!("{PERM_PREFIX}{user_id}:{permission}:{resource}")
}

fn role_id_key(id: Uuid) -> String {
    format!("rbac:role:{id}")
}

fn role_name_key(name: &str) -> String {
    format!("rbac:role:name:{name}")
}

pub struct CachedRbac {
    inner: Arc<RbacService>,
    cache: Arc<dyn Cache>,
    generation: AtomicU64,
}

impl CachedRbac {
    pub fn new(inner: Arc<RbacService>, cache: Arc<dyn Cache>) -> Self {
        Self {
            inner,
            cache,
            generation: AtomicU64::new(0),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Write `value` unless an invalidation ran since `read_at`.
    async fn fill(&self, key: &str, value: String, read_at: u64) {
        if self.generation() != read_at {
            return;
        }
        if let Err(e) = self.cache.set(key, value, DEFAULT_TTL).await {
            warn!(key = %key, error = %e, "cache write failed");
            return;
        }
        if self.generation() != read_at {
            if let Err(e) = self.cache.del(key).await {
                warn!(key = %key, error = %e, "cache delete failed");
            }
        }
    }

    pub fn inner(&self) -> &RbacService {
        &self.inner
    }

    async fn cached_role(&self, key: &str) -> Option<Role> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(role) => Some(role),
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupt cached role");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed");
                None
            }
        }
    }

    async fn store_role(&self, role: &Role, read_at: u64) {
        let Ok(raw) = serde_json::to_string(role) else {
            return;
        };
        for key in [role_id_key(role.id), role_name_key(&role.name)] {
            self.fill(&key, raw.clone(), read_at).await;
        }
    }

    async fn invalidate(&self, role: Option<&Role>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(role) = role {
            for key in [role_id_key(role.id), role_name_key(&role.name)] {
                if let Err(e) = self.cache.del(&key).await {
                    warn!(key = %key, error = %e, "cache delete failed");
                }
            }
        }
        if let Err(e) = self.cache.del_prefix(PERM_PREFIX).await {
            warn!(error = %e, "permission cache wipe failed");
        }
    }

    pub async fn get_role(&self, id: Uuid) -> CoreResult<Role> {
        if let Some(role) = self.cached_role(&role_id_key(id)).await {
            return Ok(role);
        }
        let read_at = self.generation();
        let role = self.inner.get_role(id).await?;
        self.store_role(&role, read_at).await;
        Ok(role)
    }

    pub async fn get_role_by_name(&self, name: &str) -> CoreResult<Role> {
        if let Some(role) = self.cached_role(&role_name_key(name)).await {
            return Ok(role);
        }
        let read_at = self.generation();
        let role = self.inner.get_role_by_name(name).await?;
        self.store_role(&role, read_at).await;
        Ok(role)
    }

    pub async fn list_roles(&self) -> CoreResult<Vec<Role>> {
        self.inner.list_roles().await
    }

    pub async fn create_role(
        &self,
        ctx: &RequestContext,
        name: &str,
        description: &str,
        permissions: Vec<String>,
    ) -> CoreResult<Role> {
        let role = self.inner.create_role(ctx, name, description, permissions).await?;
        self.invalidate(Some(&role)).await;
        Ok(role)
    }

    pub async fn update_role(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        description: &str,
        permissions: Vec<String>,
    ) -> CoreResult<Role> {
        let role = self.inner.update_role(ctx, id, description, permissions).await?;
        self.invalidate(Some(&role)).await;
        Ok(role)
    }

    pub async fn add_permission(&self, ctx: &RequestContext, id: Uuid, permission: &str) -> CoreResult<Role> {
        let role = self.inner.add_permission(ctx, id, permission).await?;
        self.invalidate(Some(&role)).await;
        Ok(role)
    }

    pub async fn remove_permission(&self, ctx: &RequestContext, id: Uuid, permission: &str) -> CoreResult<Role> {
        let role = self.inner.remove_permission(ctx, id, permission).await?;
        self.invalidate(Some(&role)).await;
        Ok(role)
    }

    pub async fn delete_role(&self, ctx: &RequestContext, id: Uuid) -> CoreResult<Role> {
        let role = self.inner.delete_role(ctx, id).await?;
        self.invalidate(Some(&role)).await;
        Ok(role)
    }

    pub async fn bind_role(&self, ctx: &RequestContext, user_id: UserId, role_name: &str) -> CoreResult<()> {
        self.inner.bind_role(ctx, user_id, role_name).await?;
        self.invalidate(None).await;
        Ok(())
    }

    pub async fn create_policy(&self, ctx: &RequestContext, name: &str, statements: Vec<Statement>) -> CoreResult<Policy> {
        self.inner.create_policy(ctx, name, statements).await
    }

    pub async fn list_policies(&self, ctx: &RequestContext) -> CoreResult<Vec<Policy>> {
        self.inner.list_policies(ctx).await
    }

    pub async fn delete_policy(&self, ctx: &RequestContext, id: PolicyId) -> CoreResult<()> {
        self.inner.delete_policy(ctx, id).await?;
        self.invalidate(None).await;
        Ok(())
    }

    pub async fn attach_policy(&self, ctx: &RequestContext, user_id: UserId, policy_id: PolicyId) -> CoreResult<()> {
        self.inner.attach_policy(ctx, user_id, policy_id).await?;
        self.invalidate(None).await;
        Ok(())
    }

    pub async fn detach_policy(&self, ctx: &RequestContext, user_id: UserId, policy_id: PolicyId) -> CoreResult<()> {
        self.inner.detach_policy(ctx, user_id, policy_id).await?;
        self.invalidate(None).await;
        Ok(())
    }
}

#[async_trait]
impl Authorizer for CachedRbac {
    async fn has_permission(&self, user_id: UserId, permission: &str, resource: &str) -> CoreResult<bool> {
        let key = perm_key(user_id, permission, resource);
        match self.cache.get(&key).await {
            Ok(Some(v)) if v == "1" => return Ok(true),
            Ok(Some(v)) if v == "0" => return Ok(false),
            Ok(Some(v)) => warn!(key = %key, value = %v, "corrupt cached decision"),
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "cache read failed"),
        }

        let read_at = self.generation();
        let allowed = self.inner.has_permission(user_id, permission, resource).await?;
        let value = if allowed { "1" } else { "0" };
        self.fill(&key, value.to_string(), read_at).await;
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::tests::{seed_member, seed_user, service};
    use nimbus_core::{MemoryCache, SystemClock};
    use nimbus_state::StateStore;

    fn cached(store: &Arc<StateStore>) -> (Arc<MemoryCache>, CachedRbac) {
        let cache = Arc::new(MemoryCache::new(Arc::new(SystemClock)));
        let rbac = CachedRbac::new(Arc::new(service(store)), cache.clone());
        (cache, rbac)
    }

    #[tokio::test]
    async fn decisions_are_cached() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (cache, rbac) = cached(&store);
        let user = seed_user(&store, "developer").await;

        assert!(rbac.has_permission(user.id, "instance:launch", "*").await.unwrap());
        let key = perm_key(user.id, "instance:launch", "*");
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("1"));

        // A stale "0" is served as-is until invalidated.
        cache.set(&key, "0".into(), DEFAULT_TTL).await.unwrap();
        assert!(!rbac.has_permission(user.id, "instance:launch", "*").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_entry_falls_through_to_store() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (cache, rbac) = cached(&store);
        let user = seed_user(&store, "viewer").await;

        let key = perm_key(user.id, "instance:read", "*");
        cache.set(&key, "garbage".into(), DEFAULT_TTL).await.unwrap();
        assert!(rbac.has_permission(user.id, "instance:read", "*").await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn role_update_invalidates_role_and_permission_entries() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (cache, rbac) = cached(&store);
        let admin = seed_user(&store, "admin").await;
        let ctx = RequestContext::new(admin.id, admin.tenant_id);
        let member = seed_member(&store, admin.tenant_id, "viewer").await;

        let role = rbac
            .create_role(&ctx, "ops", "operators", vec!["instance:stop".into()])
            .await
            .unwrap();
        rbac.bind_role(&ctx, member.id, "ops").await.unwrap();

        // Warm every cache entry for the role.
        rbac.get_role(role.id).await.unwrap();
        rbac.get_role_by_name("ops").await.unwrap();
        assert!(rbac.has_permission(member.id, "instance:stop", "*").await.unwrap());
        assert!(!rbac.has_permission(member.id, "instance:read", "*").await.unwrap());

        rbac.update_role(&ctx, role.id, "operators", vec!["instance:read".into()])
            .await
            .unwrap();

        assert_eq!(cache.get(&role_id_key(role.id)).await.unwrap(), None);
        assert_eq!(cache.get(&role_name_key("ops")).await.unwrap(), None);
        assert_eq!(cache.get(&perm_key(member.id, "instance:stop", "*")).await.unwrap(), None);
        assert_eq!(cache.get(&perm_key(member.id, "instance:read", "*")).await.unwrap(), None);

        assert!(!rbac.has_permission(member.id, "instance:stop", "*").await.unwrap());
        assert!(rbac.has_permission(member.id, "instance:read", "*").await.unwrap());
        assert_eq!(rbac.get_role_by_name("ops").await.unwrap().permissions, vec!["instance:read"]);
    }

    #[tokio::test]
    async fn fill_computed_before_invalidation_is_dropped() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (cache, rbac) = cached(&store);
        let admin = seed_user(&store, "admin").await;
        let ctx = RequestContext::new(admin.id, admin.tenant_id);
        let member = seed_member(&store, admin.tenant_id, "viewer").await;
        let role = rbac
            .create_role(&ctx, "ops", "operators", vec!["instance:stop".into()])
            .await
            .unwrap();
        rbac.bind_role(&ctx, member.id, "ops").await.unwrap();

        // A lookup reads the store, then the role changes before it fills.
        let read_at = rbac.generation();
        let stale = rbac.inner().has_permission(member.id, "instance:stop", "*").await.unwrap();
        assert!(stale);
        rbac.update_role(&ctx, role.id, "operators", vec!["instance:read".into()])
            .await
            .unwrap();
        let key = perm_key(member.id, "instance:stop", "*");
        rbac.fill(&key, "1".into(), read_at).await;

        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(!rbac.has_permission(member.id, "instance:stop", "*").await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("0"));
    }
}
