//! Registration, login and API-key validation.

use std::sync::Arc;

use chrono::Duration;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use nimbus_core::cache::DEFAULT_TTL;
use nimbus_core::{AuditAction, Cache, Clock, CoreError, CoreResult, Metrics, Recorder, RequestContext};
use nimbus_state::{
    ApiKey, ApiKeyRepository, ResourceCounts, Tenant, TenantQuota, TenantRepository, User, UserRepository,
};

use crate::lockout::LockoutTracker;
use crate::password::{PasswordHasher, check_strength};
use crate::rbac::DEVELOPER;

const ATTEMPTS_METRIC: &str = "nimbus_auth_attempts_total";

/// `[auth]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub lockout_threshold: u32,
    pub lockout_minutes: i64,
    /// Argon2 memory cost.
    pub hash_memory_kib: u32,
    pub hash_iterations: u32,
    /// Quota given to the personal tenant created at registration.
    pub default_quota: ResourceCounts,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            lockout_threshold: 5,
            lockout_minutes: 15,
            hash_memory_kib: 19 * 1024,
            hash_iterations: 2,
            default_quota: ResourceCounts {
                instances: 10,
                vcpus: 20,
                memory_mb: 40 * 1024,
            },
        }
    }
}

/// Result of a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub user: User,
    pub api_key: ApiKey,
}

pub struct AuthService {
    users: Arc<dyn UserRepository>,
    tenants: Arc<dyn TenantRepository>,
    keys: Arc<dyn ApiKeyRepository>,
    cache: Arc<dyn Cache>,
    recorder: Recorder,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
    hasher: PasswordHasher,
    lockout: LockoutTracker,
    default_quota: ResourceCounts,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserRepository>,
        tenants: Arc<dyn TenantRepository>,
        keys: Arc<dyn ApiKeyRepository>,
        cache: Arc<dyn Cache>,
        recorder: Recorder,
        metrics: Arc<dyn Metrics>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> CoreResult<Self> {
        Ok(Self {
            users,
            tenants,
            keys,
            cache,
            recorder,
            metrics,
            clock,
            hasher: PasswordHasher::new(config.hash_memory_kib, config.hash_iterations)?,
            lockout: LockoutTracker::new(config.lockout_threshold, Duration::minutes(config.lockout_minutes)),
            default_quota: config.default_quota,
        })
    }

    /// Create a user with a personal tenant and the `developer` role.
    pub async fn register(&self, email: &str, password: &str, name: &str) -> CoreResult<User> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(CoreError::InvalidInput(format!("invalid email {email:?}")));
        }
        check_strength(password)?;
        if self.users.get_user_by_email(&email).await?.is_some() {
            return Err(CoreError::InvalidInput("email already registered".into()));
        }

        let hasher = self.hasher.clone();
        let secret = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hasher.hash(&secret))
            .await
            .map_err(|e| CoreError::Internal(format!("hash task: {e}")))??;

        let now = self.clock.now();
        let user_id = Uuid::new_v4();
        let local = email.split('@').next().unwrap_or("user");
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: format!("{local}-{}", &Uuid::new_v4().simple().to_string()[..8]),
            name: format!("{name}'s workspace"),
            owner_id: user_id,
            quota: TenantQuota {
                limits: self.default_quota,
                usage: ResourceCounts::default(),
            },
            created_at: now,
        };
        if !self.tenants.create_tenant(&tenant).await? {
            return Err(CoreError::Conflict(format!("tenant slug {} taken", tenant.slug)));
        }

        let user = User {
            id: user_id,
            tenant_id: tenant.id,
            email: email.clone(),
            name: name.to_string(),
            password_hash,
            role: DEVELOPER.to_string(),
            created_at: now,
        };
        let created = match self.users.create_user(&user).await {
            Ok(created) => created,
            Err(e) => {
                self.drop_tenant(&tenant).await;
                return Err(e.into());
            }
        };
        if !created {
            self.drop_tenant(&tenant).await;
            return Err(CoreError::InvalidInput("email already registered".into()));
        }

        info!(user_id = %user.id, tenant = %tenant.slug, "user registered");
        let ctx = RequestContext::new(user.id, user.tenant_id);
        self.recorder
            .audit(&ctx, AuditAction::UserRegister { user_id: user.id, email })
            .await;
        Ok(user)
    }

    /// Undo the tenant of a registration that lost the email race.
    async fn drop_tenant(&self, tenant: &Tenant) {
        if let Err(e) = self.tenants.delete_tenant(tenant.id).await {
            warn!(tenant = %tenant.slug, error = %e, "failed to remove tenant of aborted registration");
        }
    }

    /// Verify credentials and issue a fresh API key.
    pub async fn login(&self, email: &str, password: &str) -> CoreResult<LoginOutcome> {
        let email = email.trim().to_lowercase();
        let now = self.clock.now();

        if let Some(until) = self.lockout.locked_until(&email, now) {
            self.metrics.incr(ATTEMPTS_METRIC, &[("outcome", "failure_locked")]);
            warn!(email = %email, %until, "login rejected: locked");
            return Err(CoreError::Unauthorized("locked".into()));
        }

        let Some(user) = self.users.get_user_by_email(&email).await? else {
            self.fail(&email, "failure_unknown_user");
            return Err(CoreError::Unauthorized("invalid credentials".into()));
        };

        let hasher = self.hasher.clone();
        let (secret, stored) = (password.to_string(), user.password_hash.clone());
        let verified = tokio::task::spawn_blocking(move || hasher.verify(&secret, &stored))
            .await
            .map_err(|e| CoreError::Internal(format!("verify task: {e}")))?;
        if !verified {
            self.fail(&email, "failure_password");
            return Err(CoreError::Unauthorized("invalid credentials".into()));
        }

        self.lockout.reset(&email);

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let api_key = ApiKey {
            id: Uuid::new_v4(),
            user_id: user.id,
            tenant_id: user.tenant_id,
            key: hex::encode(raw),
            name: "login".to_string(),
            created_at: now,
        };
        if !self.keys.create_api_key(&api_key).await? {
            return Err(CoreError::Internal("api key collision".into()));
        }

        self.metrics.incr(ATTEMPTS_METRIC, &[("outcome", "success")]);
        info!(user_id = %user.id, "login succeeded");
        let ctx = RequestContext::new(user.id, user.tenant_id);
        self.recorder
            .audit(
                &ctx,
                AuditAction::UserLogin {
                    user_id: user.id,
                    email: user.email.clone(),
                },
            )
            .await;
        Ok(LoginOutcome { user, api_key })
    }

    fn fail(&self, email: &str, outcome: &str) {
        self.metrics.incr(ATTEMPTS_METRIC, &[("outcome", outcome)]);
        if self.lockout.record_failure(email, self.clock.now()) {
            warn!(email, "login locked after repeated failures");
        }
    }

    /// Resolve an API key, consulting the cache first.
    pub async fn validate_api_key(&self, key: &str) -> CoreResult<ApiKey> {
        let cache_key = format!("apikey:{key}");
        match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ApiKey>(&raw) {
                Ok(api_key) => return Ok(api_key),
                Err(e) => warn!(error = %e, "corrupt cached api key, falling back to store"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "api key cache unavailable"),
        }

        let api_key = self
            .keys
            .get_api_key(key)
            .await?
            .ok_or_else(|| CoreError::Unauthorized("invalid api key".into()))?;
        if let Ok(raw) = serde_json::to_string(&api_key)
            && let Err(e) = self.cache.set(&cache_key, raw, DEFAULT_TTL).await
        {
            warn!(error = %e, "api key cache write failed");
        }
        Ok(api_key)
    }

    pub async fn get_user(&self, ctx: &RequestContext) -> CoreResult<User> {
        let user_id = ctx.user_id()?;
        self.users
            .get_user(user_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("user {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nimbus_core::{ManualClock, MemoryCache, Registry};
    use nimbus_state::{AuditRepository, StateResult, StateStore, TenantId, UserId};

    const PASSWORD: &str = "correct-Horse-battery-42";

    struct Fixture {
        store: Arc<StateStore>,
        cache: Arc<MemoryCache>,
        clock: Arc<ManualClock>,
        metrics: Arc<Registry>,
        auth: AuthService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let metrics = Arc::new(Registry::new());
        let recorder = Recorder::new(store.clone(), store.clone(), clock.clone());
        let config = AuthConfig {
            hash_memory_kib: 8,
            hash_iterations: 1,
            ..AuthConfig::default()
        };
        let auth = AuthService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            cache.clone(),
            recorder,
            metrics.clone(),
            clock.clone(),
            &config,
        )
        .unwrap();
        Fixture {
            store,
            cache,
            clock,
            metrics,
            auth,
        }
    }

    #[tokio::test]
    async fn register_creates_tenant_and_audits() {
        let f = fixture();
        let user = f.auth.register("Ada@Example.com", PASSWORD, "Ada").await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.role, "developer");
        assert_ne!(user.password_hash, PASSWORD);

        let tenant = f.store.get_tenant(user.tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.owner_id, user.id);
        assert_eq!(tenant.quota.limits, AuthConfig::default().default_quota);

        let logs = f.store.list_audit_logs(Some(user.id), 10).await.unwrap();
        assert_eq!(logs[0].action, "user.register");
    }

    #[tokio::test]
    async fn register_rejects_weak_password_and_duplicate_email() {
        let f = fixture();
        let weak = f.auth.register("a@x.io", "password", "A").await.unwrap_err();
        assert!(matches!(weak, CoreError::InvalidInput(_)));

        f.auth.register("a@x.io", PASSWORD, "A").await.unwrap();
        let dup = f.auth.register("A@x.io", PASSWORD, "A").await.unwrap_err();
        assert!(matches!(dup, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn login_issues_distinct_keys() {
        let f = fixture();
        f.auth.register("a@x.io", PASSWORD, "A").await.unwrap();
        let first = f.auth.login("a@x.io", PASSWORD).await.unwrap();
        let second = f.auth.login("a@x.io", PASSWORD).await.unwrap();
        assert_eq!(first.api_key.key.len(), 64);
        assert_ne!(first.api_key.key, second.api_key.key);
        assert_eq!(f.metrics.counter(ATTEMPTS_METRIC, &[("outcome", "success")]), 2);
    }

    #[tokio::test]
    async fn lockout_after_five_failures_then_window_expires() {
        let f = fixture();
        f.auth.register("a@x.io", PASSWORD, "A").await.unwrap();

        for _ in 0..5 {
            let err = f.auth.login("a@x.io", "wrong-Password-99").await.unwrap_err();
            assert!(matches!(err, CoreError::Unauthorized(ref m) if m == "invalid credentials"));
        }
        // Correct password is still rejected while locked.
        let err = f.auth.login("a@x.io", PASSWORD).await.unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(ref m) if m == "locked"));
        assert_eq!(f.metrics.counter(ATTEMPTS_METRIC, &[("outcome", "failure_locked")]), 1);

        f.clock.advance(Duration::minutes(15));
        f.auth.login("a@x.io", PASSWORD).await.unwrap();
        assert_eq!(f.auth.lockout.failures("a@x.io"), 0);
    }

    #[tokio::test]
    async fn api_key_validation_uses_cache() {
        let f = fixture();
        f.auth.register("a@x.io", PASSWORD, "A").await.unwrap();
        let login = f.auth.login("a@x.io", PASSWORD).await.unwrap();
        let key = login.api_key.key.clone();

        let resolved = f.auth.validate_api_key(&key).await.unwrap();
        assert_eq!(resolved.user_id, login.user.id);
        assert!(f.cache.get(&format!("apikey:{key}")).await.unwrap().is_some());

        // Served from cache even after the row is gone.
        f.store.delete_api_key(&key).await.unwrap();
        assert!(f.auth.validate_api_key(&key).await.is_ok());

        let unknown = f.auth.validate_api_key("nope").await.unwrap_err();
        assert!(matches!(unknown, CoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn corrupt_cache_entry_falls_open_to_store() {
        let f = fixture();
        f.auth.register("a@x.io", PASSWORD, "A").await.unwrap();
        let login = f.auth.login("a@x.io", PASSWORD).await.unwrap();
        let key = login.api_key.key;

        f.cache
            .set(&format!("apikey:{key}"), "{not json".into(), DEFAULT_TTL)
            .await
            .unwrap();
        let resolved = f.auth.validate_api_key(&key).await.unwrap();
        assert_eq!(resolved.key, key);
    }

    /// Hides an existing registration from the email pre-check and records
    /// every tenant created through it.
    struct RegisteredMeanwhile {
        store: Arc<StateStore>,
        tenants: std::sync::Mutex<Vec<TenantId>>,
    }

    #[async_trait::async_trait]
    impl UserRepository for RegisteredMeanwhile {
        async fn create_user(&self, user: &User) -> StateResult<bool> {
            self.store.create_user(user).await
        }
        async fn get_user(&self, id: UserId) -> StateResult<Option<User>> {
            self.store.get_user(id).await
        }
        async fn get_user_by_email(&self, _email: &str) -> StateResult<Option<User>> {
            Ok(None)
        }
        async fn update_user(&self, user: &User) -> StateResult<()> {
            self.store.update_user(user).await
        }
    }

    #[async_trait::async_trait]
    impl TenantRepository for RegisteredMeanwhile {
        async fn create_tenant(&self, tenant: &Tenant) -> StateResult<bool> {
            self.tenants.lock().unwrap().push(tenant.id);
            self.store.create_tenant(tenant).await
        }
        async fn get_tenant(&self, id: TenantId) -> StateResult<Option<Tenant>> {
            self.store.get_tenant(id).await
        }
        async fn reserve_usage(&self, id: TenantId, delta: ResourceCounts) -> StateResult<bool> {
            self.store.reserve_usage(id, delta).await
        }
        async fn release_usage(&self, id: TenantId, delta: ResourceCounts) -> StateResult<()> {
            self.store.release_usage(id, delta).await
        }
        async fn delete_tenant(&self, id: TenantId) -> StateResult<bool> {
            self.store.delete_tenant(id).await
        }
    }

    #[tokio::test]
    async fn lost_email_race_leaves_no_tenant() {
        let f = fixture();
        f.auth.register("a@x.io", PASSWORD, "A").await.unwrap();

        let racing = Arc::new(RegisteredMeanwhile {
            store: f.store.clone(),
            tenants: std::sync::Mutex::new(Vec::new()),
        });
        let config = AuthConfig {
            hash_memory_kib: 8,
            hash_iterations: 1,
            ..AuthConfig::default()
        };
        let auth = AuthService::new(
            racing.clone(),
            racing.clone(),
            f.store.clone(),
            f.cache.clone(),
            Recorder::new(f.store.clone(), f.store.clone(), f.clock.clone()),
            f.metrics.clone(),
            f.clock.clone(),
            &config,
        )
        .unwrap();

        let err = auth.register("a@x.io", PASSWORD, "B").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        let created = racing.tenants.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert!(f.store.get_tenant(created[0]).await.unwrap().is_none());
    }
}
