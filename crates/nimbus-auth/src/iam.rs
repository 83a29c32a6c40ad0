//! IAM statement matching.

use nimbus_state::{Effect, Policy, Statement};

/// Outcome of evaluating a set of policies for one `(action, resource)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deny,
    Allow,
    /// No statement applied; fall back to roles.
    NoMatch,
}

/// `*` matches anything, `prefix*` matches by prefix, anything else must be
/// equal.
pub fn pattern_matches(pattern: &str, target: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => target.starts_with(prefix),
        None => pattern == target,
    }
}

pub fn statement_matches(statement: &Statement, action: &str, resource: &str) -> bool {
    statement.actions.iter().any(|p| pattern_matches(p, action))
        && statement.resources.iter().any(|p| pattern_matches(p, resource))
}

/// A matching Deny anywhere wins; otherwise any matching Allow allows.
pub fn evaluate(policies: &[Policy], action: &str, resource: &str) -> Decision {
    let mut allowed = false;
    for statement in policies.iter().flat_map(|p| &p.statements) {
        if !statement_matches(statement, action, resource) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return Decision::Deny,
            Effect::Allow => allowed = true,
        }
    }
    if allowed { Decision::Allow } else { Decision::NoMatch }
}
