//! nimbus-state — domain model and embedded state store for the Nimbus
//! control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Every entity is JSON-serialized
//! into a `&[u8]` value column. Composite keys (`{parent_id}:{child_id}`,
//! `{user_id}/{name}`) give cheap prefix scans for join rows and
//! per-owner uniqueness indexes.
//!
//! # Layout
//!
//! - [`types`]: entities and enumerated states
//! - [`repo`]: repository ports consumed by services, one narrow trait
//!   per concern
//! - [`store`]: `StateStore`, the redb implementation of every port
//!
//! `StateStore` is `Clone + Send + Sync` (backed by `Arc<Database>`) and can
//! be shared across async tasks.

pub mod error;
pub mod repo;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult, StoreOp};
pub use repo::*;
pub use store::StateStore;
pub use types::*;
