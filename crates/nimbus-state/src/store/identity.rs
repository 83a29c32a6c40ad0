//! Users, tenants, API keys, roles and IAM policies.

use async_trait::async_trait;
use redb::ReadableDatabase;
use tracing::debug;
use uuid::Uuid;

use super::{StateStore, keys_with_prefix, open, read_one};
use crate::error::{StateError, StateResult};
use crate::repo::*;
use crate::tables::*;
use crate::types::*;

#[async_trait]
impl UserRepository for StateStore {
    async fn create_user(&self, user: &User) -> StateResult<bool> {
        let email = user.email.to_lowercase();
        let created = self.insert_indexed(USER_EMAILS, &email, USERS, &user.id.to_string(), user)?;
        debug!(user_id = %user.id, created, "user stored");
        Ok(created)
    }

    async fn get_user(&self, id: UserId) -> StateResult<Option<User>> {
        self.get(USERS, &id.to_string())
    }

    async fn get_user_by_email(&self, email: &str) -> StateResult<Option<User>> {
        self.get_indexed(USER_EMAILS, &email.to_lowercase(), USERS)
    }

    async fn update_user(&self, user: &User) -> StateResult<()> {
        self.put(USERS, &user.id.to_string(), user)
    }
}

#[async_trait]
impl TenantRepository for StateStore {
    async fn create_tenant(&self, tenant: &Tenant) -> StateResult<bool> {
        self.insert_indexed(TENANT_SLUGS, &tenant.slug, TENANTS, &tenant.id.to_string(), tenant)
    }

    async fn get_tenant(&self, id: TenantId) -> StateResult<Option<Tenant>> {
        self.get(TENANTS, &id.to_string())
    }

    async fn reserve_usage(&self, id: TenantId, delta: ResourceCounts) -> StateResult<bool> {
        let reserved = self.modify(TENANTS, &id.to_string(), |tenant: &mut Tenant| {
            let quota = &mut tenant.quota;
            match quota.usage.checked_add_within(&delta, &quota.limits) {
                Some(next) => {
                    quota.usage = next;
                    true
                }
                None => false,
            }
        })?;
        let reserved = reserved.ok_or_else(|| StateError::NotFound(format!("tenant {id}")))?;
        debug!(tenant_id = %id, reserved, "quota reservation");
        Ok(reserved)
    }

    async fn release_usage(&self, id: TenantId, delta: ResourceCounts) -> StateResult<()> {
        self.modify(TENANTS, &id.to_string(), |tenant: &mut Tenant| {
            tenant.quota.usage = tenant.quota.usage.saturating_sub(&delta);
        })?
        .ok_or_else(|| StateError::NotFound(format!("tenant {id}")))
    }

    async fn delete_tenant(&self, id: TenantId) -> StateResult<bool> {
        self.write(|txn| {
            let mut tenants = open(txn, TENANTS)?;
            let Some(tenant) = read_one::<Tenant, _>(&tenants, &id.to_string())? else {
                return Ok(false);
            };
            tenants.remove(id.to_string().as_str()).map_err(map_err!(Write))?;
            let mut slugs = open(txn, TENANT_SLUGS)?;
            slugs.remove(tenant.slug.as_str()).map_err(map_err!(Write))?;
            Ok(true)
        })
    }
}

#[async_trait]
impl ApiKeyRepository for StateStore {
    async fn create_api_key(&self, key: &ApiKey) -> StateResult<bool> {
        self.insert_new(API_KEYS, &key.key, key)
    }

    async fn get_api_key(&self, key: &str) -> StateResult<Option<ApiKey>> {
        self.get(API_KEYS, key)
    }

    async fn delete_api_key(&self, key: &str) -> StateResult<bool> {
        self.remove(API_KEYS, key)
    }
}

#[async_trait]
impl RoleRepository for StateStore {
    async fn create_role(&self, role: &Role) -> StateResult<bool> {
        self.insert_unless(ROLES, "", &role.id.to_string(), role, |existing: &Role| {
            existing.name == role.name
        })
    }

    async fn get_role(&self, id: Uuid) -> StateResult<Option<Role>> {
        self.get(ROLES, &id.to_string())
    }

    async fn get_role_by_name(&self, name: &str) -> StateResult<Option<Role>> {
        let roles: Vec<Role> = self.scan(ROLES, "")?;
        Ok(roles.into_iter().find(|r| r.name == name))
    }

    async fn list_roles(&self) -> StateResult<Vec<Role>> {
        self.scan(ROLES, "")
    }

    async fn update_role(&self, role: &Role) -> StateResult<()> {
        self.put(ROLES, &role.id.to_string(), role)
    }

    async fn delete_role(&self, id: Uuid) -> StateResult<bool> {
        self.remove(ROLES, &id.to_string())
    }
}

#[async_trait]
impl PolicyRepository for StateStore {
    async fn create_policy(&self, policy: &Policy) -> StateResult<()> {
        self.put(POLICIES, &policy.id.to_string(), policy)
    }

    async fn get_policy(&self, id: PolicyId) -> StateResult<Option<Policy>> {
        self.get(POLICIES, &id.to_string())
    }

    async fn list_policies(&self, tenant_id: TenantId) -> StateResult<Vec<Policy>> {
        let all: Vec<Policy> = self.scan(POLICIES, "")?;
        Ok(all.into_iter().filter(|p| p.tenant_id == tenant_id).collect())
    }

    async fn delete_policy(&self, id: PolicyId) -> StateResult<bool> {
        let suffix = format!(":{id}");
        self.write(|txn| {
            let mut policies = open(txn, POLICIES)?;
            let existed = policies
                .remove(id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
            let mut attachments = open(txn, POLICY_ATTACHMENTS)?;
            for key in keys_with_prefix(&attachments, "")? {
                if key.ends_with(&suffix) {
                    attachments.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
            Ok(existed)
        })
    }

    async fn attach_policy(&self, tenant_id: TenantId, user_id: UserId, policy_id: PolicyId) -> StateResult<()> {
        self.put(POLICY_ATTACHMENTS, &format!("{tenant_id}:{user_id}:{policy_id}"), &policy_id)
    }

    async fn detach_policy(&self, tenant_id: TenantId, user_id: UserId, policy_id: PolicyId) -> StateResult<bool> {
        self.remove(POLICY_ATTACHMENTS, &format!("{tenant_id}:{user_id}:{policy_id}"))
    }

    async fn list_attached_policies(&self, tenant_id: TenantId, user_id: UserId) -> StateResult<Vec<Policy>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let attachments = txn.open_table(POLICY_ATTACHMENTS).map_err(map_err!(Table))?;
        let policies = txn.open_table(POLICIES).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for key in keys_with_prefix(&attachments, &format!("{tenant_id}:{user_id}:"))? {
            let Some(policy_id) = read_one::<PolicyId, _>(&attachments, &key)? else {
                continue;
            };
            if let Some(policy) = read_one::<Policy, _>(&policies, &policy_id.to_string())? {
                out.push(policy);
            }
        }
        Ok(out)
    }
}
