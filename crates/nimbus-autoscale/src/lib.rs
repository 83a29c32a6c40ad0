//! nimbus-autoscale — scaling groups and the reconciler that keeps them
//! at their desired size.
//!
//! # Reconcile Tick
//!
//! ```text
//! for group in all groups (members + policies loaded in one batch):
//!     DELETING  → no members: delete row
//!                 else: desired = min = 0, terminate members (newest first)
//!     current_count ← |members|                  (written back on drift)
//!     desired ← clamp(desired, min, max)
//!     |members| < desired → launch, unless in failure backoff
//!                           (≥ 5 failures, last one < 5 min ago)
//!     |members| > desired → terminate, newest member first
//!     avg_cpu(members, last 60 s):
//!         first policy out of cooldown that fires wins
//!         avg > target        and current < max → desired += out_step
//!         avg < target - 10   and current > min → desired -= in_step
//! ```
//!
//! Policy evaluation is a pure function in [`policy`]; the reconciler
//! applies its decision on the next tick.

pub mod group;
pub mod policy;
pub mod reconciler;

pub use group::{CreateGroupRequest, CreatePolicyRequest, ScalingGroupService};
pub use policy::{ScaleDecision, evaluate_policies};
pub use reconciler::Autoscaler;
