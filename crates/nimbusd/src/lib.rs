//! nimbusd — the Nimbus control-plane daemon.
//!
//! The binary in `main.rs` parses flags and installs logging; this library
//! holds configuration and the [`ControlPlane`] assembly so the
//! integration tests can drive the same wiring through the router.

pub mod config;
pub mod control_plane;

pub use config::{CryptoConfig, NimbusConfig, ServerConfig, WorkerConfig};
pub use control_plane::{Backends, ControlPlane};
