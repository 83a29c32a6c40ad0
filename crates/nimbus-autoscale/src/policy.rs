//! CPU policy evaluation.
//!
//! Only the `cpu` metric is understood. A policy fires at most once per
//! cooldown window, and at most one policy fires per group per tick.

use chrono::Duration;
use tracing::{debug, warn};

use nimbus_state::{PolicyId, ScalingGroup, ScalingPolicy, Timestamp};

pub const CPU_METRIC: &str = "cpu";

/// Scale-in triggers this many points below the target.
pub const SCALE_IN_MARGIN: f64 = 10.0;

/// A scaling decision for a single group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleDecision {
    /// Raise `desired_count` to the given value.
    ScaleOut { policy_id: PolicyId, desired: u32 },
    /// Lower `desired_count` to the given value.
    ScaleIn { policy_id: PolicyId, desired: u32 },
    /// No change needed.
    NoChange,
}

fn in_cooldown(policy: &ScalingPolicy, now: Timestamp) -> bool {
    let cooldown = Duration::seconds(i64::try_from(policy.cooldown_sec).unwrap_or(i64::MAX));
    policy.last_scaled_at.is_some_and(|last| now - last < cooldown)
}

/// Decide whether any of `policies` fires for `group`.
///
/// `current` is the group's actual member count; `avg_cpu` is the mean CPU
/// of its members over the sampling window.
pub fn evaluate_policies(
    group: &ScalingGroup,
    current: u32,
    policies: &[ScalingPolicy],
    avg_cpu: f64,
    now: Timestamp,
) -> ScaleDecision {
    for policy in policies {
        if policy.metric_type != CPU_METRIC {
            warn!(group_id = %group.id, policy = %policy.name, metric = %policy.metric_type, "unsupported scaling metric");
            continue;
        }
        if in_cooldown(policy, now) {
            debug!(group_id = %group.id, policy = %policy.name, "policy in cooldown");
            continue;
        }

        if avg_cpu > policy.target_value && current < group.max_instances {
            let desired = group
                .desired_count
                .saturating_add(policy.scale_out_step)
                .min(group.max_instances);
            debug!(
                group_id = %group.id,
                policy = %policy.name,
                avg_cpu,
                target = policy.target_value,
                from = group.desired_count,
                to = desired,
                "scale-out policy fired"
            );
            return ScaleDecision::ScaleOut {
                policy_id: policy.id,
                desired,
            };
        }

        if avg_cpu < policy.target_value - SCALE_IN_MARGIN && current > group.min_instances {
            let desired = group
                .desired_count
                .saturating_sub(policy.scale_in_step)
                .max(group.min_instances);
            debug!(
                group_id = %group.id,
                policy = %policy.name,
                avg_cpu,
                target = policy.target_value,
                from = group.desired_count,
                to = desired,
                "scale-in policy fired"
            );
            return ScaleDecision::ScaleIn {
                policy_id: policy.id,
                desired,
            };
        }
    }
    ScaleDecision::NoChange
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use nimbus_state::GroupStatus;
    use uuid::Uuid;

    pub(crate) fn group(min: u32, max: u32, desired: u32) -> ScalingGroup {
        let now = Utc::now();
        ScalingGroup {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "web".into(),
            vpc_id: Uuid::new_v4(),
            load_balancer_id: None,
            image: "nginx:1.27".into(),
            ports: "8080:80".into(),
            instance_type: "basic-1".into(),
            min_instances: min,
            max_instances: max,
            desired_count: desired,
            current_count: 0,
            status: GroupStatus::Active,
            failure_count: 0,
            last_failure_at: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn cpu_policy(group_id: Uuid, target: f64, out: u32, cooldown_sec: u64) -> ScalingPolicy {
        ScalingPolicy {
            id: Uuid::new_v4(),
            group_id,
            name: format!("cpu-{target}"),
            metric_type: CPU_METRIC.into(),
            target_value: target,
            scale_out_step: out,
            scale_in_step: 1,
            cooldown_sec,
            last_scaled_at: None,
        }
    }

    #[test]
    fn scale_out_above_target_clamped_to_max() {
        let g = group(1, 5, 4);
        let p = cpu_policy(g.id, 70.0, 3, 300);
        let decision = evaluate_policies(&g, 4, std::slice::from_ref(&p), 80.0, Utc::now());
        assert_eq!(decision, ScaleDecision::ScaleOut { policy_id: p.id, desired: 5 });
    }

    #[test]
    fn no_scale_out_at_max() {
        let g = group(1, 5, 5);
        let p = cpu_policy(g.id, 70.0, 1, 300);
        assert_eq!(evaluate_policies(&g, 5, &[p], 95.0, Utc::now()), ScaleDecision::NoChange);
    }

    #[test]
    fn scale_in_needs_margin_below_target() {
        let g = group(1, 5, 3);
        let p = cpu_policy(g.id, 70.0, 1, 300);
        // Inside the margin: nothing.
        assert_eq!(evaluate_policies(&g, 3, std::slice::from_ref(&p), 65.0, Utc::now()), ScaleDecision::NoChange);
        assert_eq!(
            evaluate_policies(&g, 3, std::slice::from_ref(&p), 40.0, Utc::now()),
            ScaleDecision::ScaleIn { policy_id: p.id, desired: 2 }
        );
    }

    #[test]
    fn scale_in_never_below_min() {
        let g = group(2, 5, 2);
        let mut p = cpu_policy(g.id, 70.0, 1, 300);
        p.scale_in_step = 5;
        // Current above min but desired already at min.
        assert_eq!(
            evaluate_policies(&g, 3, std::slice::from_ref(&p), 10.0, Utc::now()),
            ScaleDecision::ScaleIn { policy_id: p.id, desired: 2 }
        );
        assert_eq!(evaluate_policies(&g, 2, &[p], 10.0, Utc::now()), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let g = group(1, 5, 1);
        let now = Utc::now();
        let mut p = cpu_policy(g.id, 70.0, 1, 300);
        p.last_scaled_at = Some(now - Duration::seconds(299));
        assert_eq!(evaluate_policies(&g, 1, std::slice::from_ref(&p), 90.0, now), ScaleDecision::NoChange);
        p.last_scaled_at = Some(now - Duration::seconds(300));
        assert!(matches!(evaluate_policies(&g, 1, &[p], 90.0, now), ScaleDecision::ScaleOut { .. }));
    }

    #[test]
    fn first_eligible_policy_wins() {
        let g = group(1, 10, 2);
        let first = cpu_policy(g.id, 50.0, 1, 300);
        let second = cpu_policy(g.id, 60.0, 4, 300);
        let decision = evaluate_policies(&g, 2, &[first.clone(), second], 90.0, Utc::now());
        assert_eq!(decision, ScaleDecision::ScaleOut { policy_id: first.id, desired: 3 });
    }

    #[test]
    fn unknown_metric_is_ignored() {
        let g = group(1, 5, 1);
        let mut p = cpu_policy(g.id, 70.0, 1, 300);
        p.metric_type = "rps".into();
        assert_eq!(evaluate_policies(&g, 1, &[p], 99.0, Utc::now()), ScaleDecision::NoChange);
    }
}
