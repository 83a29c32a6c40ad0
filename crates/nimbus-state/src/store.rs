//! StateStore — redb-backed state persistence for Nimbus.
//!
//! Provides typed CRUD over every entity in [`crate::types`]. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! The repository trait implementations live in submodules grouped by
//! concern; this module holds the generic table helpers they share.
//! Anything that must be atomic (uniqueness checks, quota reservation,
//! read-modify-write of a row, queue leases) runs inside a single write
//! transaction via [`StateStore::write`].

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::StateResult;
use crate::repo::Edit;
use crate::tables::*;
use crate::types::*;

/// Tag any `Display` error with the store step that produced it.
macro_rules! map_err {
    ($op:ident) => {
        |e| $crate::error::StateError::storage($crate::error::StoreOp::$op, e.to_string())
    };
}

mod compute;
mod identity;
mod platform;
mod reconcile;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

type JsonTableMut<'txn> = Table<'txn, &'static str, &'static [u8]>;

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            for def in ALL_TABLES {
                txn.open_table(*def).map_err(map_err!(Table))?;
            }
            Ok(())
        })
    }

    // ── Transactions ───────────────────────────────────────────────

    /// Run `f` inside one write transaction. The transaction commits only
    /// if `f` succeeds; on error it is dropped and aborted.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    // ── Generic row helpers ────────────────────────────────────────

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            write_one(&mut table, key, value)
        })
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_one(&table, key)
    }

    /// Every row whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(read_prefix(&table, prefix)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Delete a row. Returns true if it existed.
    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
            Ok(existed)
        })
    }

    /// Remove a row, returning what was stored.
    fn take<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            let removed = match table.remove(key).map_err(map_err!(Write))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            Ok(removed)
        })
    }

    /// Delete every row whose key starts with `prefix`. Returns the count.
    fn remove_prefix(&self, def: JsonTable, prefix: &str) -> StateResult<u32> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            remove_prefix_in(&mut table, prefix)
        })
    }

    /// Insert a row only if the key is absent. Returns false on collision.
    fn insert_new<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            write_one(&mut table, key, value)?;
            Ok(true)
        })
    }

    /// Insert a row unless an existing row under `prefix` conflicts with it.
    fn insert_unless<T: Serialize + DeserializeOwned>(
        &self,
        def: JsonTable,
        prefix: &str,
        key: &str,
        value: &T,
        conflicts: impl Fn(&T) -> bool,
    ) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            let existing: Vec<(String, T)> = read_prefix(&table, prefix)?;
            if existing.iter().any(|(_, row)| conflicts(row)) {
                return Ok(false);
            }
            write_one(&mut table, key, value)?;
            Ok(true)
        })
    }

    /// Insert a row together with a unique index entry pointing at it.
    /// Returns false (and writes nothing) if the index key is taken.
    fn insert_indexed<T: Serialize>(
        &self,
        index: JsonTable,
        index_key: &str,
        def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<bool> {
        self.write(|txn| {
            let mut idx = open(txn, index)?;
            if idx.get(index_key).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            write_one(&mut idx, index_key, &key)?;
            let mut table = open(txn, def)?;
            write_one(&mut table, key, value)?;
            Ok(true)
        })
    }

    /// Resolve a unique index entry and fetch the row it points at.
    fn get_indexed<T: DeserializeOwned>(
        &self,
        index: JsonTable,
        index_key: &str,
        def: JsonTable,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let idx = txn.open_table(index).map_err(map_err!(Table))?;
        let Some(key) = read_one::<String, _>(&idx, index_key)? else {
            return Ok(None);
        };
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_one(&table, &key)
    }

    /// Atomic read-modify-write of one row. `None` if the row is absent.
    fn modify<T, R>(&self, def: JsonTable, key: &str, f: impl FnOnce(&mut T) -> R) -> StateResult<Option<R>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            let Some(mut row) = read_one::<T, _>(&table, key)? else {
                return Ok(None);
            };
            let out = f(&mut row);
            write_one(&mut table, key, &row)?;
            Ok(Some(out))
        })
    }

    /// Read-modify-write that only writes when `edit` returns true.
    /// Returns the row as stored afterwards, `None` if it is absent.
    fn update_if<T>(&self, def: JsonTable, key: &str, edit: Edit<'_, T>) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            let Some(mut row) = read_one::<T, _>(&table, key)? else {
                return Ok(None);
            };
            if edit(&mut row) {
                write_one(&mut table, key, &row)?;
            }
            Ok(Some(row))
        })
    }

    // ── Join tables ────────────────────────────────────────────────

    /// Add `instance` to `parent`, recording its join order. Idempotent.
    fn append_member(&self, def: JsonTable, parent: Uuid, instance: InstanceId) -> StateResult<()> {
        self.write(|txn| {
            let mut table = open(txn, def)?;
            let rows: Vec<(String, Membership)> = read_prefix(&table, &format!("{parent}:"))?;
            let key = format!("{parent}:{instance}");
            if rows.iter().any(|(k, _)| *k == key) {
                return Ok(());
            }
            let seq = rows.iter().map(|(_, m)| m.seq).max().map_or(0, |s| s + 1);
            let row = Membership {
                parent_id: parent,
                instance_id: instance,
                seq,
            };
            write_one(&mut table, &key, &row)
        })
    }

    /// Members of `parent` in join order.
    fn members(&self, def: JsonTable, parent: Uuid) -> StateResult<Vec<InstanceId>> {
        let mut rows: Vec<Membership> = self.scan(def, &format!("{parent}:"))?;
        rows.sort_by_key(|m| m.seq);
        Ok(rows.into_iter().map(|m| m.instance_id).collect())
    }
}

// ── Table-level helpers ────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn open<'txn>(txn: &'txn WriteTransaction, def: JsonTable) -> StateResult<JsonTableMut<'txn>> {
    txn.open_table(def).map_err(map_err!(Table))
}

fn read_one<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

/// `(key, row)` pairs whose key starts with `prefix`, in key order.
fn read_prefix<T, R>(table: &R, prefix: &str) -> StateResult<Vec<(String, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if key.starts_with(prefix) {
            rows.push((key.to_string(), decode(value.value())?));
        }
    }
    Ok(rows)
}

fn keys_with_prefix<R>(table: &R, prefix: &str) -> StateResult<Vec<String>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if key.starts_with(prefix) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

fn write_one<T: Serialize>(table: &mut JsonTableMut<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn remove_prefix_in(table: &mut JsonTableMut<'_>, prefix: &str) -> StateResult<u32> {
    let keys = keys_with_prefix(&*table, prefix)?;
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len() as u32)
}

/// Milliseconds since the epoch, clamped at zero, for sortable keys.
fn millis(ts: &Timestamp) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::repo::*;
    use chrono::{Duration, TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn test_user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            email: email.to_string(),
            name: "Test".to_string(),
            password_hash: "hash".to_string(),
            role: "developer".to_string(),
            created_at: at(0),
        }
    }

    fn test_tenant(limit_instances: u32) -> Tenant {
        Tenant {
            id: Uuid::new_v4(),
            slug: format!("t-{}", Uuid::new_v4().simple()),
            name: "tenant".to_string(),
            owner_id: Uuid::new_v4(),
            quota: TenantQuota {
                limits: ResourceCounts {
                    instances: limit_instances,
                    vcpus: 100,
                    memory_mb: 100_000,
                },
                usage: ResourceCounts::default(),
            },
            created_at: at(0),
        }
    }

    fn test_group(user_id: UserId, vpc_id: VpcId, key: Option<&str>) -> ScalingGroup {
        ScalingGroup {
            id: Uuid::new_v4(),
            user_id,
            tenant_id: Uuid::new_v4(),
            name: "web".to_string(),
            vpc_id,
            load_balancer_id: None,
            image: "nginx".to_string(),
            ports: "0:80".to_string(),
            instance_type: "basic-1".to_string(),
            min_instances: 1,
            max_instances: 3,
            desired_count: 1,
            current_count: 0,
            status: GroupStatus::Active,
            failure_count: 0,
            last_failure_at: None,
            idempotency_key: key.map(str::to_string),
            created_at: at(0),
            updated_at: at(0),
        }
    }

    fn test_queue(user_id: UserId, name: &str) -> Queue {
        Queue {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            visibility_timeout_secs: 30,
            retention_days: 4,
            max_message_size: 262_144,
            created_at: at(0),
        }
    }

    fn test_message(queue_id: Uuid, body: &str, created_at: Timestamp) -> QueueMessage {
        QueueMessage {
            id: Uuid::new_v4(),
            queue_id,
            body: body.to_string(),
            receipt_handle: None,
            visible_at: created_at,
            receive_count: 0,
            created_at,
        }
    }

    // ── Identity ───────────────────────────────────────────────────

    #[tokio::test]
    async fn user_create_and_lookup_by_email() {
        let store = StateStore::open_in_memory().unwrap();
        let user = test_user("Alice@Example.com");

        assert!(store.create_user(&user).await.unwrap());
        let by_email = store.get_user_by_email("alice@example.com").await.unwrap();
        assert_eq!(by_email, Some(user.clone()));
        assert_eq!(store.get_user(user.id).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn user_duplicate_email_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.create_user(&test_user("a@x.io")).await.unwrap());

        let dup = test_user("a@x.io");
        assert!(!store.create_user(&dup).await.unwrap());
        assert!(store.get_user(dup.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_reserve_respects_limits() {
        let store = StateStore::open_in_memory().unwrap();
        let tenant = test_tenant(2);
        assert!(store.create_tenant(&tenant).await.unwrap());

        let one = ResourceCounts {
            instances: 1,
            vcpus: 1,
            memory_mb: 512,
        };
        assert!(store.reserve_usage(tenant.id, one).await.unwrap());
        assert!(store.reserve_usage(tenant.id, one).await.unwrap());
        assert!(!store.reserve_usage(tenant.id, one).await.unwrap());

        store.release_usage(tenant.id, one).await.unwrap();
        let usage = store.get_tenant(tenant.id).await.unwrap().unwrap().quota.usage;
        assert_eq!(usage.instances, 1);
        assert_eq!(usage.memory_mb, 512);
    }

    #[tokio::test]
    async fn tenant_reserve_unknown_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .reserve_usage(Uuid::new_v4(), ResourceCounts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn tenant_delete_frees_slug() {
        let store = StateStore::open_in_memory().unwrap();
        let tenant = test_tenant(1);
        assert!(store.create_tenant(&tenant).await.unwrap());
        assert!(store.delete_tenant(tenant.id).await.unwrap());
        assert!(store.get_tenant(tenant.id).await.unwrap().is_none());
        assert!(!store.delete_tenant(tenant.id).await.unwrap());

        let mut again = test_tenant(1);
        again.slug = tenant.slug.clone();
        assert!(store.create_tenant(&again).await.unwrap());
    }

    #[tokio::test]
    async fn attached_policies_scoped_to_tenant_and_user() {
        let store = StateStore::open_in_memory().unwrap();
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let policy = Policy {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "deny-delete".to_string(),
            statements: vec![Statement {
                effect: Effect::Deny,
                actions: vec!["instance:delete".to_string()],
                resources: vec!["*".to_string()],
            }],
            created_at: at(0),
        };
        store.create_policy(&policy).await.unwrap();
        store.attach_policy(tenant, user, policy.id).await.unwrap();

        let attached = store.list_attached_policies(tenant, user).await.unwrap();
        assert_eq!(attached, vec![policy.clone()]);
        assert!(store.list_attached_policies(tenant, Uuid::new_v4()).await.unwrap().is_empty());

        assert!(store.delete_policy(policy.id).await.unwrap());
        assert!(store.list_attached_policies(tenant, user).await.unwrap().is_empty());
    }

    // ── Scaling groups ─────────────────────────────────────────────

    #[tokio::test]
    async fn group_idempotency_key_unique_per_user() {
        let store = StateStore::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let vpc = Uuid::new_v4();
        let first = test_group(user, vpc, Some("k1"));

        assert!(store.create_group(&first).await.unwrap());
        assert!(!store.create_group(&test_group(user, vpc, Some("k1"))).await.unwrap());
        // Another user may reuse the key.
        assert!(store.create_group(&test_group(Uuid::new_v4(), vpc, Some("k1"))).await.unwrap());

        let found = store.get_group_by_idempotency_key(user, "k1").await.unwrap();
        assert_eq!(found.map(|g| g.id), Some(first.id));
        assert_eq!(store.count_groups_by_vpc(vpc).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn group_members_keep_join_order() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group(Uuid::new_v4(), Uuid::new_v4(), None);
        store.create_group(&group).await.unwrap();

        let ids: Vec<InstanceId> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.add_group_instance(group.id, *id).await.unwrap();
        }
        // Re-adding is a no-op.
        store.add_group_instance(group.id, ids[0]).await.unwrap();
        assert_eq!(store.get_group_instances(group.id).await.unwrap(), ids);

        assert!(store.remove_group_instance(group.id, ids[1]).await.unwrap());
        let extra = Uuid::new_v4();
        store.add_group_instance(group.id, extra).await.unwrap();
        let members = store.get_group_instances(group.id).await.unwrap();
        assert_eq!(members, vec![ids[0], ids[2], ids[3], extra]);

        let all = store.get_all_group_instances(&[group.id]).await.unwrap();
        assert_eq!(all.get(&group.id), Some(&members));
    }

    #[tokio::test]
    async fn group_delete_cascades() {
        let store = StateStore::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let group = test_group(user, Uuid::new_v4(), Some("k"));
        store.create_group(&group).await.unwrap();
        store.add_group_instance(group.id, Uuid::new_v4()).await.unwrap();
        store
            .create_scaling_policy(&ScalingPolicy {
                id: Uuid::new_v4(),
                group_id: group.id,
                name: "cpu".to_string(),
                metric_type: "cpu".to_string(),
                target_value: 70.0,
                scale_out_step: 1,
                scale_in_step: 1,
                cooldown_sec: 60,
                last_scaled_at: None,
            })
            .await
            .unwrap();

        assert!(store.delete_group(group.id).await.unwrap());
        assert!(store.get_group(group.id).await.unwrap().is_none());
        assert!(store.get_group_instances(group.id).await.unwrap().is_empty());
        assert!(store.get_scaling_policies(group.id).await.unwrap().is_empty());
        assert!(store.get_group_by_idempotency_key(user, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn modify_group_edits_the_stored_row() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group(Uuid::new_v4(), Uuid::new_v4(), None);
        store.create_group(&group).await.unwrap();

        let mut deleting = group.clone();
        deleting.status = GroupStatus::Deleting;
        store.update_group(&deleting).await.unwrap();

        // Declined edits leave the row untouched but still report it.
        let row = store
            .modify_group(group.id, &|g: &mut ScalingGroup| {
                if g.status == GroupStatus::Deleting {
                    return false;
                }
                g.desired_count = 3;
                true
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, GroupStatus::Deleting);
        assert_eq!(store.get_group(group.id).await.unwrap().unwrap().desired_count, 1);

        let row = store
            .modify_group(group.id, &|g: &mut ScalingGroup| {
                g.current_count = 2;
                true
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!((row.current_count, row.status), (2, GroupStatus::Deleting));

        store.delete_group(group.id).await.unwrap();
        let gone = store.modify_group(group.id, &|_: &mut ScalingGroup| true).await.unwrap();
        assert!(gone.is_none());
    }

    // ── Metrics ────────────────────────────────────────────────────

    #[tokio::test]
    async fn average_cpu_over_window() {
        let store = StateStore::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for (id, cpu, secs) in [(a, 90.0, 0), (a, 80.0, 100), (b, 60.0, 100), (b, 70.0, 100)] {
            store
                .record_cpu_sample(&CpuSample {
                    instance_id: id,
                    cpu_percent: cpu,
                    recorded_at: at(secs),
                })
                .await
                .unwrap();
        }

        let avg = store.get_average_cpu(&[a, b], at(50)).await.unwrap();
        assert_eq!(avg, Some(70.0));
        assert_eq!(store.get_average_cpu(&[a], at(500)).await.unwrap(), None);
        assert_eq!(store.get_average_cpu(&[], at(0)).await.unwrap(), None);
    }

    // ── Load balancers and DNS ─────────────────────────────────────

    #[tokio::test]
    async fn lb_target_unique() {
        let store = StateStore::open_in_memory().unwrap();
        let target = LbTarget {
            lb_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            port: 8080,
            weight: 1,
            health: TargetHealth::Healthy,
        };
        assert!(store.add_lb_target(&target).await.unwrap());
        assert!(!store.add_lb_target(&target).await.unwrap());
        assert_eq!(store.list_lb_targets(target.lb_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dns_zone_name_unique_per_vpc_and_cname_single_valued() {
        let store = StateStore::open_in_memory().unwrap();
        let vpc = Uuid::new_v4();
        let zone = DnsZone {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            vpc_id: vpc,
            name: "internal".to_string(),
            backend_id: "z1".to_string(),
            created_at: at(0),
        };
        assert!(store.create_zone(&zone).await.unwrap());
        let dup = DnsZone {
            id: Uuid::new_v4(),
            ..zone.clone()
        };
        assert!(!store.create_zone(&dup).await.unwrap());
        assert_eq!(store.get_zone_by_vpc(vpc).await.unwrap().map(|z| z.id), Some(zone.id));

        let record = |kind: RecordType| DnsRecord {
            id: Uuid::new_v4(),
            zone_id: zone.id,
            name: "web".to_string(),
            record_type: kind,
            content: "10.0.0.1".to_string(),
            ttl: 300,
            priority: None,
            instance_id: None,
            created_at: at(0),
        };
        assert!(store.create_record(&record(RecordType::A)).await.unwrap());
        assert!(store.create_record(&record(RecordType::A)).await.unwrap());
        assert!(store.create_record(&record(RecordType::Cname)).await.unwrap());
        assert!(!store.create_record(&record(RecordType::Cname)).await.unwrap());

        assert!(store.delete_zone(zone.id).await.unwrap());
        assert!(store.list_records(zone.id).await.unwrap().is_empty());
        // The name is free again once the zone is gone.
        assert!(store.create_zone(&dup).await.unwrap());
    }

    // ── Queues ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn queue_receive_leases_and_hides_messages() {
        let store = StateStore::open_in_memory().unwrap();
        let queue = test_queue(Uuid::new_v4(), "jobs");
        assert!(store.create_queue(&queue).await.unwrap());
        for (i, body) in ["one", "two", "three"].iter().enumerate() {
            store
                .put_message(&test_message(queue.id, body, at(i as i64)))
                .await
                .unwrap();
        }

        let first = store.receive_messages(&queue, 2, at(10)).await.unwrap();
        let bodies: Vec<&str> = first.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
        assert!(first.iter().all(|m| m.receipt_handle.is_some() && m.receive_count == 1));

        // Leased messages are invisible until the timeout lapses.
        let second = store.receive_messages(&queue, 10, at(20)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "three");

        let handle = first[0].receipt_handle.clone().unwrap();
        assert!(store.delete_message(queue.id, &handle).await.unwrap());
        assert!(!store.delete_message(queue.id, &handle).await.unwrap());

        let redelivered = store.receive_messages(&queue, 10, at(10) + Duration::seconds(31)).await.unwrap();
        let bodies: Vec<&str> = redelivered.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["two"]);
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn queue_drops_messages_past_retention() {
        let store = StateStore::open_in_memory().unwrap();
        let queue = test_queue(Uuid::new_v4(), "old");
        store.create_queue(&queue).await.unwrap();
        store.put_message(&test_message(queue.id, "stale", at(0))).await.unwrap();

        let later = at(0) + Duration::days(5);
        assert!(store.receive_messages(&queue, 10, later).await.unwrap().is_empty());
        assert_eq!(store.purge_queue(queue.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_name_unique_per_owner() {
        let store = StateStore::open_in_memory().unwrap();
        let owner = Uuid::new_v4();
        assert!(store.create_queue(&test_queue(owner, "q")).await.unwrap());
        assert!(!store.create_queue(&test_queue(owner, "q")).await.unwrap());
        assert!(store.create_queue(&test_queue(Uuid::new_v4(), "q")).await.unwrap());
    }

    // ── Pipelines and tasks ────────────────────────────────────────

    #[tokio::test]
    async fn webhook_delivery_reserved_once() {
        let store = StateStore::open_in_memory().unwrap();
        let delivery = WebhookDelivery {
            pipeline_id: Uuid::new_v4(),
            provider: "github".to_string(),
            event: "push".to_string(),
            delivery_id: "d-1".to_string(),
            received_at: at(0),
        };
        assert!(store.reserve_webhook_delivery(&delivery).await.unwrap());
        assert!(!store.reserve_webhook_delivery(&delivery).await.unwrap());

        let other_event = WebhookDelivery {
            event: "ping".to_string(),
            ..delivery
        };
        assert!(store.reserve_webhook_delivery(&other_event).await.unwrap());
    }

    #[tokio::test]
    async fn tasks_pop_in_fifo_order_per_queue() {
        let store = StateStore::open_in_memory().unwrap();
        store.push_task("provision", b"a").await.unwrap();
        store.push_task("builds", b"x").await.unwrap();
        store.push_task("provision", b"b").await.unwrap();

        assert_eq!(store.pop_task("provision").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.pop_task("provision").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.pop_task("provision").await.unwrap(), None);
        assert_eq!(store.pop_task("builds").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn audit_logs_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        for (i, action) in ["user.register", "user.login", "instance.launch"].iter().enumerate() {
            store
                .append_audit_log(&AuditLog {
                    id: Uuid::new_v4(),
                    user_id: Some(user),
                    action: action.to_string(),
                    resource_type: "user".to_string(),
                    resource_id: user.to_string(),
                    details: serde_json::Map::new(),
                    created_at: at(i as i64),
                })
                .await
                .unwrap();
        }
        let logs = store.list_audit_logs(Some(user), 2).await.unwrap();
        let actions: Vec<&str> = logs.iter().map(|l| l.action.as_str()).collect();
        assert_eq!(actions, vec!["instance.launch", "user.login"]);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[tokio::test]
    async fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");
        let user = test_user("persist@x.io");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_user(&user).await.unwrap();
            store.push_task("provision", b"pending").await.unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_user(user.id).await.unwrap(), Some(user));
        assert_eq!(store.pop_task("provision").await.unwrap(), Some(b"pending".to_vec()));
    }
}
