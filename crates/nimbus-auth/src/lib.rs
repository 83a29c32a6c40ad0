//! nimbus-auth — who the caller is and what they may do.
//!
//! # Architecture
//!
//! ```text
//! AuthService
//!   ├── register  → entropy check → argon2 hash → tenant + user rows
//!   ├── login     → LockoutTracker → verify → fresh API key
//!   └── validate_api_key → cache (apikey:<key>) → store
//!
//! CachedRbac ──wraps──► RbacService
//!   rbac:perm:<user>:<perm>:<resource>   "0" / "1"
//!   rbac:role:<id>, rbac:role:name:<name>
//!
//! RbacService::has_permission
//!   1. attached IAM policies (explicit Deny wins, any Allow allows)
//!   2. role permissions (built-in admin / developer / viewer, or custom)
//! ```

pub mod cached;
pub mod iam;
pub mod lockout;
pub mod password;
pub mod rbac;
pub mod service;

pub use cached::CachedRbac;
pub use iam::{Decision, evaluate, pattern_matches};
pub use lockout::LockoutTracker;
pub use password::{PasswordHasher, entropy_bits};
pub use rbac::{BUILTIN_ROLES, RbacService};
pub use service::{AuthConfig, AuthService, LoginOutcome};
