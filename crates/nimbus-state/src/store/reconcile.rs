//! Scaling groups, deployments, load balancers and DNS.
//!
//! These are the resources driven by the reconcilers, so the batched
//! lookups here are the ones read once per tick.

use std::collections::HashMap;

use async_trait::async_trait;
use redb::ReadableDatabase;
use tracing::debug;
use uuid::Uuid;

use super::{StateStore, open, read_one, read_prefix, remove_prefix_in};
use crate::error::StateResult;
use crate::repo::*;
use crate::tables::*;
use crate::types::*;

fn idempotency_index_key(user_id: UserId, key: &str) -> String {
    format!("{user_id}/{key}")
}

fn zone_index_key(vpc_id: VpcId, name: &str) -> String {
    format!("{vpc_id}/{}", name.to_lowercase())
}

// ── Scaling groups ─────────────────────────────────────────────────

#[async_trait]
impl ScalingRepository for StateStore {
    async fn create_group(&self, group: &ScalingGroup) -> StateResult<bool> {
        let key = group.id.to_string();
        let created = match &group.idempotency_key {
            Some(idem) => self.insert_indexed(
                GROUP_IDEMPOTENCY,
                &idempotency_index_key(group.user_id, idem),
                SCALING_GROUPS,
                &key,
                group,
            )?,
            None => {
                self.put(SCALING_GROUPS, &key, group)?;
                true
            }
        };
        debug!(group_id = %group.id, created, "scaling group stored");
        Ok(created)
    }

    async fn get_group(&self, id: GroupId) -> StateResult<Option<ScalingGroup>> {
        self.get(SCALING_GROUPS, &id.to_string())
    }

    async fn get_group_by_idempotency_key(&self, user_id: UserId, key: &str) -> StateResult<Option<ScalingGroup>> {
        self.get_indexed(GROUP_IDEMPOTENCY, &idempotency_index_key(user_id, key), SCALING_GROUPS)
    }

    async fn list_groups(&self) -> StateResult<Vec<ScalingGroup>> {
        let mut groups: Vec<ScalingGroup> = self.scan(SCALING_GROUPS, "")?;
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn list_groups_for_user(&self, user_id: UserId) -> StateResult<Vec<ScalingGroup>> {
        let groups = self.list_groups().await?;
        Ok(groups.into_iter().filter(|g| g.user_id == user_id).collect())
    }

    async fn update_group(&self, group: &ScalingGroup) -> StateResult<()> {
        self.put(SCALING_GROUPS, &group.id.to_string(), group)
    }

    async fn modify_group(&self, id: GroupId, edit: Edit<'_, ScalingGroup>) -> StateResult<Option<ScalingGroup>> {
        self.update_if(SCALING_GROUPS, &id.to_string(), edit)
    }

    async fn delete_group(&self, id: GroupId) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        let existed = self.write(|txn| {
            let mut groups = open(txn, SCALING_GROUPS)?;
            let Some(group) = read_one::<ScalingGroup, _>(&groups, &key)? else {
                return Ok(false);
            };
            groups.remove(key.as_str()).map_err(map_err!(Write))?;
            if let Some(idem) = &group.idempotency_key {
                let mut index = open(txn, GROUP_IDEMPOTENCY)?;
                index
                    .remove(idempotency_index_key(group.user_id, idem).as_str())
                    .map_err(map_err!(Write))?;
            }
            remove_prefix_in(&mut open(txn, SCALING_POLICIES)?, &prefix)?;
            remove_prefix_in(&mut open(txn, GROUP_MEMBERS)?, &prefix)?;
            Ok(true)
        })?;
        debug!(group_id = %id, existed, "scaling group deleted");
        Ok(existed)
    }

    async fn count_groups_by_vpc(&self, vpc_id: VpcId) -> StateResult<u32> {
        let groups: Vec<ScalingGroup> = self.scan(SCALING_GROUPS, "")?;
        Ok(groups.iter().filter(|g| g.vpc_id == vpc_id).count() as u32)
    }

    async fn add_group_instance(&self, group_id: GroupId, instance_id: InstanceId) -> StateResult<()> {
        self.append_member(GROUP_MEMBERS, group_id, instance_id)
    }

    async fn remove_group_instance(&self, group_id: GroupId, instance_id: InstanceId) -> StateResult<bool> {
        self.remove(GROUP_MEMBERS, &format!("{group_id}:{instance_id}"))
    }

    async fn get_group_instances(&self, group_id: GroupId) -> StateResult<Vec<InstanceId>> {
        self.members(GROUP_MEMBERS, group_id)
    }

    async fn get_all_group_instances(&self, group_ids: &[GroupId]) -> StateResult<HashMap<GroupId, Vec<InstanceId>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        let mut out = HashMap::with_capacity(group_ids.len());
        for id in group_ids {
            let mut rows: Vec<(String, Membership)> = read_prefix(&table, &format!("{id}:"))?;
            rows.sort_by_key(|(_, m)| m.seq);
            out.insert(*id, rows.into_iter().map(|(_, m)| m.instance_id).collect());
        }
        Ok(out)
    }

    async fn create_scaling_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put(SCALING_POLICIES, &format!("{}:{}", policy.group_id, policy.id), policy)
    }

    async fn get_scaling_policies(&self, group_id: GroupId) -> StateResult<Vec<ScalingPolicy>> {
        self.scan(SCALING_POLICIES, &format!("{group_id}:"))
    }

    async fn get_all_scaling_policies(
        &self,
        group_ids: &[GroupId],
    ) -> StateResult<HashMap<GroupId, Vec<ScalingPolicy>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
        let mut out = HashMap::with_capacity(group_ids.len());
        for id in group_ids {
            let rows: Vec<(String, ScalingPolicy)> = read_prefix(&table, &format!("{id}:"))?;
            out.insert(*id, rows.into_iter().map(|(_, p)| p).collect());
        }
        Ok(out)
    }

    async fn update_scaling_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        self.put(SCALING_POLICIES, &format!("{}:{}", policy.group_id, policy.id), policy)
    }

    async fn delete_scaling_policy(&self, group_id: GroupId, policy_id: PolicyId) -> StateResult<bool> {
        self.remove(SCALING_POLICIES, &format!("{group_id}:{policy_id}"))
    }
}

// ── Deployments ────────────────────────────────────────────────────

#[async_trait]
impl DeploymentRepository for StateStore {
    async fn create_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.id.to_string(), deployment)
    }

    async fn get_deployment(&self, id: DeploymentId) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, &id.to_string())
    }

    async fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let mut all: Vec<Deployment> = self.scan(DEPLOYMENTS, "")?;
        all.sort_by_key(|d| d.created_at);
        Ok(all)
    }

    async fn list_deployments_for_user(&self, user_id: UserId) -> StateResult<Vec<Deployment>> {
        let all = self.list_deployments().await?;
        Ok(all.into_iter().filter(|d| d.user_id == user_id).collect())
    }

    async fn modify_deployment(
        &self,
        id: DeploymentId,
        edit: Edit<'_, Deployment>,
    ) -> StateResult<Option<Deployment>> {
        self.update_if(DEPLOYMENTS, &id.to_string(), edit)
    }

    async fn delete_deployment(&self, id: DeploymentId) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let existed = open(txn, DEPLOYMENTS)?
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            remove_prefix_in(&mut open(txn, DEPLOYMENT_MEMBERS)?, &prefix)?;
            Ok(existed)
        })
    }

    async fn add_deployment_container(&self, id: DeploymentId, instance_id: InstanceId) -> StateResult<()> {
        self.append_member(DEPLOYMENT_MEMBERS, id, instance_id)
    }

    async fn remove_deployment_container(&self, id: DeploymentId, instance_id: InstanceId) -> StateResult<bool> {
        self.remove(DEPLOYMENT_MEMBERS, &format!("{id}:{instance_id}"))
    }

    async fn get_deployment_containers(&self, id: DeploymentId) -> StateResult<Vec<InstanceId>> {
        self.members(DEPLOYMENT_MEMBERS, id)
    }
}

// ── Load balancers ─────────────────────────────────────────────────

#[async_trait]
impl LoadBalancerRepository for StateStore {
    async fn create_lb(&self, lb: &LoadBalancer) -> StateResult<()> {
        self.put(LOAD_BALANCERS, &lb.id.to_string(), lb)
    }

    async fn get_lb(&self, id: LoadBalancerId) -> StateResult<Option<LoadBalancer>> {
        self.get(LOAD_BALANCERS, &id.to_string())
    }

    async fn list_lbs(&self, user_id: UserId) -> StateResult<Vec<LoadBalancer>> {
        let all: Vec<LoadBalancer> = self.scan(LOAD_BALANCERS, "")?;
        Ok(all.into_iter().filter(|lb| lb.user_id == user_id).collect())
    }

    async fn list_lbs_by_status(&self, status: LbStatus) -> StateResult<Vec<LoadBalancer>> {
        let all: Vec<LoadBalancer> = self.scan(LOAD_BALANCERS, "")?;
        Ok(all.into_iter().filter(|lb| lb.status == status).collect())
    }

    async fn modify_lb(&self, id: LoadBalancerId, edit: Edit<'_, LoadBalancer>) -> StateResult<Option<LoadBalancer>> {
        self.update_if(LOAD_BALANCERS, &id.to_string(), edit)
    }

    async fn delete_lb(&self, id: LoadBalancerId) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let existed = open(txn, LOAD_BALANCERS)?
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            remove_prefix_in(&mut open(txn, LB_TARGETS)?, &prefix)?;
            Ok(existed)
        })
    }

    async fn add_lb_target(&self, target: &LbTarget) -> StateResult<bool> {
        self.insert_new(LB_TARGETS, &format!("{}:{}", target.lb_id, target.instance_id), target)
    }

    async fn remove_lb_target(&self, lb_id: LoadBalancerId, instance_id: InstanceId) -> StateResult<bool> {
        self.remove(LB_TARGETS, &format!("{lb_id}:{instance_id}"))
    }

    async fn list_lb_targets(&self, lb_id: LoadBalancerId) -> StateResult<Vec<LbTarget>> {
        self.scan(LB_TARGETS, &format!("{lb_id}:"))
    }

    async fn modify_lb_target(
        &self,
        lb_id: LoadBalancerId,
        instance_id: InstanceId,
        edit: Edit<'_, LbTarget>,
    ) -> StateResult<Option<LbTarget>> {
        self.update_if(LB_TARGETS, &format!("{lb_id}:{instance_id}"), edit)
    }
}

// ── DNS ────────────────────────────────────────────────────────────

#[async_trait]
impl DnsRepository for StateStore {
    async fn create_zone(&self, zone: &DnsZone) -> StateResult<bool> {
        self.insert_indexed(
            DNS_ZONE_NAMES,
            &zone_index_key(zone.vpc_id, &zone.name),
            DNS_ZONES,
            &zone.id.to_string(),
            zone,
        )
    }

    async fn get_zone(&self, id: ZoneId) -> StateResult<Option<DnsZone>> {
        self.get(DNS_ZONES, &id.to_string())
    }

    async fn get_zone_by_vpc(&self, vpc_id: VpcId) -> StateResult<Option<DnsZone>> {
        let zones: Vec<DnsZone> = self.scan(DNS_ZONES, "")?;
        Ok(zones
            .into_iter()
            .filter(|z| z.vpc_id == vpc_id)
            .min_by_key(|z| z.created_at))
    }

    async fn list_zones(&self, user_id: UserId) -> StateResult<Vec<DnsZone>> {
        let zones: Vec<DnsZone> = self.scan(DNS_ZONES, "")?;
        Ok(zones.into_iter().filter(|z| z.user_id == user_id).collect())
    }

    async fn delete_zone(&self, id: ZoneId) -> StateResult<bool> {
        let key = id.to_string();
        let prefix = format!("{id}:");
        self.write(|txn| {
            let mut zones = open(txn, DNS_ZONES)?;
            let Some(zone) = read_one::<DnsZone, _>(&zones, &key)? else {
                return Ok(false);
            };
            zones.remove(key.as_str()).map_err(map_err!(Write))?;
            open(txn, DNS_ZONE_NAMES)?
                .remove(zone_index_key(zone.vpc_id, &zone.name).as_str())
                .map_err(map_err!(Write))?;
            remove_prefix_in(&mut open(txn, DNS_RECORDS)?, &prefix)?;
            Ok(true)
        })
    }

    async fn create_record(&self, record: &DnsRecord) -> StateResult<bool> {
        let key = format!("{}:{}", record.zone_id, record.id);
        if record.record_type.allows_multiple() {
            self.put(DNS_RECORDS, &key, record)?;
            return Ok(true);
        }
        let prefix = format!("{}:", record.zone_id);
        self.insert_unless(DNS_RECORDS, &prefix, &key, record, |existing: &DnsRecord| {
            existing.record_type == record.record_type && existing.name.eq_ignore_ascii_case(&record.name)
        })
    }

    async fn get_record(&self, zone_id: ZoneId, id: Uuid) -> StateResult<Option<DnsRecord>> {
        self.get(DNS_RECORDS, &format!("{zone_id}:{id}"))
    }

    async fn delete_record(&self, zone_id: ZoneId, id: Uuid) -> StateResult<bool> {
        self.remove(DNS_RECORDS, &format!("{zone_id}:{id}"))
    }

    async fn list_records(&self, zone_id: ZoneId) -> StateResult<Vec<DnsRecord>> {
        self.scan(DNS_RECORDS, &format!("{zone_id}:"))
    }

    async fn list_records_for_instance(&self, instance_id: InstanceId) -> StateResult<Vec<DnsRecord>> {
        let all: Vec<DnsRecord> = self.scan(DNS_RECORDS, "")?;
        Ok(all
            .into_iter()
            .filter(|r| r.instance_id == Some(instance_id))
            .collect())
    }
}
