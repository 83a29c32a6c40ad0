//! nimbus-gateway — path-prefix API gateway.
//!
//! ```text
//! RouteService ── create/delete ──► GatewayRepository
//!       │                                 │
//!       └──── refresh ◄───── list_routes ─┘
//!                 │
//!                 ▼
//!          RouteTable (RwLock, first matching prefix wins)
//!                 │
//! request ──► Gateway::forward ── strip prefix / rewrite host ──► upstream (hyper, HTTP/1.1)
//!                 │                                                  │
//!              no match → 404                              failure → 502
//! ```

pub mod forward;
pub mod service;
pub mod table;

pub use forward::{ForwardError, Gateway, UPSTREAM_TIMEOUT};
pub use service::{CreateRouteRequest, RouteService};
pub use table::{RouteMatch, RouteTable, Upstream};
