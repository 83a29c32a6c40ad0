//! Autoscaler — drives every scaling group toward its desired size.
//!
//! Membership lives in the join table and is authoritative; the group's
//! `current_count` is a cache written back whenever it drifts. Launch and
//! terminate go through [`InstanceLifecycle`] under the group owner's
//! identity, so quota and authorization apply exactly as for a user call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nimbus_compute::StatsCollector;
use nimbus_core::limits::{FAILURE_BACKOFF_THRESHOLD, FAILURE_BACKOFF_WINDOW_SECS, MAX_PORTS_PER_INSTANCE};
use nimbus_core::portmap::{format_ports, parse_ports, to_ephemeral};
use nimbus_core::{
    Clock, CoreError, CoreResult, InstanceLifecycle, LaunchParams, Metrics, Recorder, RequestContext, TargetRegistry,
};
use nimbus_state::{
    GroupId, GroupStatus, InstanceId, MetricRepository, ScalingGroup, ScalingPolicy, ScalingRepository, Timestamp,
};

use crate::policy::{ScaleDecision, evaluate_policies};

const ACTIONS_METRIC: &str = "nimbus_autoscale_actions_total";
const GROUPS_GAUGE: &str = "nimbus_scaling_groups";

/// CPU averages are taken over this window.
const CPU_WINDOW_SECS: i64 = 60;

pub struct Autoscaler {
    groups: Arc<dyn ScalingRepository>,
    samples: Arc<dyn MetricRepository>,
    lifecycle: Arc<dyn InstanceLifecycle>,
    targets: Option<Arc<dyn TargetRegistry>>,
    sampler: Option<Arc<StatsCollector>>,
    recorder: Recorder,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
}

impl Autoscaler {
    pub fn new(
        groups: Arc<dyn ScalingRepository>,
        samples: Arc<dyn MetricRepository>,
        lifecycle: Arc<dyn InstanceLifecycle>,
        recorder: Recorder,
        metrics: Arc<dyn Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            groups,
            samples,
            lifecycle,
            targets: None,
            sampler: None,
            recorder,
            metrics,
            clock,
        }
    }

    /// Attach new members to the group's load balancer.
    pub fn with_targets(mut self, targets: Arc<dyn TargetRegistry>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Collect fresh CPU samples for members before policies are evaluated.
    pub fn with_sampler(mut self, sampler: Arc<StatsCollector>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// One pass over every group. Returns the policy decision per group.
    pub async fn reconcile_all(&self) -> anyhow::Result<Vec<(GroupId, ScaleDecision)>> {
        let groups = self.groups.list_groups().await?;
        let ids: Vec<GroupId> = groups.iter().map(|g| g.id).collect();
        let mut members = self.groups.get_all_group_instances(&ids).await?;
        let mut policies = self.groups.get_all_scaling_policies(&ids).await?;
        self.metrics.set_gauge(GROUPS_GAUGE, &[], groups.len() as f64);

        let mut decisions = Vec::with_capacity(groups.len());
        for group in groups {
            let id = group.id;
            let group_members = members.remove(&id).unwrap_or_default();
            let group_policies = policies.remove(&id).unwrap_or_default();
            match self.reconcile_group(group, group_members, group_policies).await {
                Ok(decision) => decisions.push((id, decision)),
                Err(e) => warn!(group_id = %id, error = %e, "group reconcile failed"),
            }
        }
        debug!(groups = decisions.len(), "autoscale tick complete");
        Ok(decisions)
    }

    /// Run the autoscaler loop.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "autoscaler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }

    async fn reconcile_group(
        &self,
        mut group: ScalingGroup,
        mut members: Vec<InstanceId>,
        mut policies: Vec<ScalingPolicy>,
    ) -> CoreResult<ScaleDecision> {
        let original = group.clone();
        let owner = RequestContext::new(group.user_id, group.tenant_id);
        let now = self.clock.now();

        if group.status == GroupStatus::Deleting {
            if members.is_empty() {
                self.groups.delete_group(group.id).await?;
                info!(group_id = %group.id, "scaling group deleted");
                self.metrics.incr(ACTIONS_METRIC, &[("action", "group_deleted")]);
                self.recorder
                    .event("asg.group_deleted", "scaling_group", group.id, json!({ "name": group.name }))
                    .await;
                return Ok(ScaleDecision::NoChange);
            }
            group.desired_count = 0;
            group.min_instances = 0;
            let count = members.len();
            self.scale_in(&owner, &group, &mut members, count).await;
            group.current_count = members.len() as u32;
            self.persist(&original, &group, now).await?;
            return Ok(ScaleDecision::NoChange);
        }

        if group.current_count as usize != members.len() {
            debug!(
                group_id = %group.id,
                cached = group.current_count,
                actual = members.len(),
                "membership count drifted"
            );
        }

        let clamped = group.desired_count.clamp(group.min_instances, group.max_instances);
        if clamped != group.desired_count {
            info!(group_id = %group.id, from = group.desired_count, to = clamped, "desired count clamped");
            group.desired_count = clamped;
        }

        let actual = members.len() as u32;
        if actual < group.desired_count {
            if self.in_backoff(&group, now) {
                debug!(
                    group_id = %group.id,
                    failures = group.failure_count,
                    "scale-out suppressed by failure backoff"
                );
            } else {
                let need = group.desired_count - actual;
                self.scale_out(&owner, &mut group, &mut members, need, now).await;
            }
        } else if actual > group.desired_count {
            self.scale_in(&owner, &group, &mut members, (actual - group.desired_count) as usize)
                .await;
        }
        group.current_count = members.len() as u32;

        let decision = self.evaluate(&mut group, &members, &mut policies, now).await?;
        self.persist(&original, &group, now).await?;
        Ok(decision)
    }

    fn in_backoff(&self, group: &ScalingGroup, now: Timestamp) -> bool {
        group.failure_count >= FAILURE_BACKOFF_THRESHOLD
            && group
                .last_failure_at
                .is_some_and(|at| now - at < ChronoDuration::seconds(FAILURE_BACKOFF_WINDOW_SECS))
    }

    /// Merge the fields this tick owns into the stored row. Status and
    /// bounds belong to the user: a group deleted mid-tick stays DELETING
    /// and a changed desired count is clamped to the bounds stored now.
    async fn persist(&self, original: &ScalingGroup, group: &ScalingGroup, now: Timestamp) -> CoreResult<()> {
        if group == original {
            return Ok(());
        }
        let desired_changed = group.desired_count != original.desired_count;
        let stored = self
            .groups
            .modify_group(group.id, &|row: &mut ScalingGroup| {
                row.current_count = group.current_count;
                row.failure_count = group.failure_count;
                row.last_failure_at = group.last_failure_at;
                if row.status == GroupStatus::Deleting {
                    row.desired_count = 0;
                    row.min_instances = 0;
                } else if desired_changed {
                    row.desired_count = group.desired_count.clamp(row.min_instances, row.max_instances);
                }
                row.updated_at = now;
                true
            })
            .await?;
        match stored {
            Some(row) if row.status != original.status => {
                info!(group_id = %group.id, status = ?row.status, "group status changed during tick");
            }
            Some(_) => {}
            None => debug!(group_id = %group.id, "group removed during tick"),
        }
        Ok(())
    }

    /// Launch up to `count` members. Stops at the first failure.
    async fn scale_out(
        &self,
        owner: &RequestContext,
        group: &mut ScalingGroup,
        members: &mut Vec<InstanceId>,
        count: u32,
        now: Timestamp,
    ) {
        let container_ports = match parse_ports(&group.ports, MAX_PORTS_PER_INSTANCE) {
            Ok(p) => p,
            Err(e) => {
                warn!(group_id = %group.id, error = %e, "group has an invalid port map");
                return;
            }
        };
        let ports = format_ports(&to_ephemeral(&container_ports));

        for _ in 0..count {
            let params = LaunchParams {
                name: format!("{}-{}", group.name, &Uuid::new_v4().simple().to_string()[..8]),
                image: group.image.clone(),
                ports: ports.clone(),
                instance_type: group.instance_type.clone(),
                vpc_id: Some(group.vpc_id),
                ..Default::default()
            };
            let instance = match self.lifecycle.launch(owner, params).await {
                Ok(i) => i,
                Err(e) => {
                    group.failure_count += 1;
                    group.last_failure_at = Some(now);
                    self.metrics.incr(ACTIONS_METRIC, &[("action", "launch_failed")]);
                    warn!(
                        group_id = %group.id,
                        failures = group.failure_count,
                        error = %e,
                        "scale-out launch failed"
                    );
                    return;
                }
            };

            if let Err(e) = self.groups.add_group_instance(group.id, instance.id).await {
                // The instance exists but is not tracked; give it back.
                warn!(group_id = %group.id, instance_id = %instance.id, error = %e, "membership write failed");
                if let Err(e) = self.lifecycle.terminate(owner, instance.id).await {
                    error!(instance_id = %instance.id, error = %e, "failed to terminate untracked instance");
                }
                return;
            }
            members.push(instance.id);
            group.failure_count = 0;
            group.last_failure_at = None;
            self.metrics.incr(ACTIONS_METRIC, &[("action", "scale_out")]);
            info!(group_id = %group.id, instance_id = %instance.id, "scaled out");

            if let (Some(lb_id), Some(targets), Some(port)) =
                (group.load_balancer_id, &self.targets, container_ports.first())
                && let Err(e) = targets.attach_target(owner, lb_id, instance.id, port.container).await
            {
                warn!(group_id = %group.id, %lb_id, instance_id = %instance.id, error = %e, "lb attach failed");
            }
        }
    }

    /// Terminate `count` members, newest first.
    async fn scale_in(&self, owner: &RequestContext, group: &ScalingGroup, members: &mut Vec<InstanceId>, count: usize) {
        for _ in 0..count {
            let Some(&instance_id) = members.last() else {
                return;
            };

            if let (Some(lb_id), Some(targets)) = (group.load_balancer_id, &self.targets)
                && let Err(e) = targets.detach_target(owner, lb_id, instance_id).await
            {
                debug!(group_id = %group.id, %instance_id, error = %e, "lb detach failed");
            }

            if let Err(e) = self.groups.remove_group_instance(group.id, instance_id).await {
                warn!(group_id = %group.id, %instance_id, error = %e, "membership removal failed");
                return;
            }
            members.pop();

            match self.lifecycle.terminate(owner, instance_id).await {
                Ok(()) | Err(CoreError::NotFound(_)) => {}
                Err(e) => warn!(group_id = %group.id, %instance_id, error = %e, "terminate failed"),
            }
            self.metrics.incr(ACTIONS_METRIC, &[("action", "scale_in")]);
            info!(group_id = %group.id, %instance_id, "scaled in");
        }
    }

    /// Evaluate policies and apply at most one firing to `group`.
    async fn evaluate(
        &self,
        group: &mut ScalingGroup,
        members: &[InstanceId],
        policies: &mut [ScalingPolicy],
        now: Timestamp,
    ) -> CoreResult<ScaleDecision> {
        if policies.is_empty() || members.is_empty() {
            return Ok(ScaleDecision::NoChange);
        }
        if let Some(sampler) = &self.sampler
            && let Err(e) = sampler.sample(members).await
        {
            warn!(group_id = %group.id, error = %e, "cpu sampling failed");
        }
        let since = now - ChronoDuration::seconds(CPU_WINDOW_SECS);
        let Some(avg_cpu) = self.samples.get_average_cpu(members, since).await? else {
            debug!(group_id = %group.id, "no cpu samples in window");
            return Ok(ScaleDecision::NoChange);
        };

        let decision = evaluate_policies(group, members.len() as u32, policies, avg_cpu, now);
        let (policy_id, desired, action) = match decision {
            ScaleDecision::ScaleOut { policy_id, desired } => (policy_id, desired, "policy_scale_out"),
            ScaleDecision::ScaleIn { policy_id, desired } => (policy_id, desired, "policy_scale_in"),
            ScaleDecision::NoChange => return Ok(decision),
        };

        group.desired_count = desired;
        if let Some(policy) = policies.iter_mut().find(|p| p.id == policy_id) {
            policy.last_scaled_at = Some(now);
            self.groups.update_scaling_policy(policy).await?;
        }
        self.metrics.incr(ACTIONS_METRIC, &[("action", action)]);
        info!(group_id = %group.id, %policy_id, avg_cpu, desired, "scaling policy applied");
        self.recorder
            .event(
                "asg.policy_fired",
                "scaling_group",
                group.id,
                json!({ "policy_id": policy_id, "avg_cpu": avg_cpu, "desired": desired }),
            )
            .await;
        Ok(decision)
    }
}
