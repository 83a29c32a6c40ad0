//! nimbus-pipeline — CI pipelines and webhook-triggered builds.
//!
//! # Webhook admission
//!
//! ```text
//! POST /pipelines/{id}/webhook/{provider}
//!   │
//!   ├── pipeline ACTIVE with a secret?            no → reject
//!   ├── signature (constant time)                 bad → Unauthorized
//!   │     github: "sha256=" + hex(HMAC-SHA256(secret, body))
//!   │     gitlab: X-Gitlab-Token == secret
//!   ├── reserve (pipeline, provider, event, delivery)   seen → no-op
//!   ├── push event? ref → branch == pipeline.branch?    no → no-op
//!   └── Build QUEUED ──► pipeline_build_queue ──► BuildDispatcher
//! ```

pub mod dispatcher;
pub mod payload;
pub mod service;
pub mod signature;

pub use dispatcher::BuildDispatcher;
pub use payload::{PushEvent, extract_push, normalize_branch};
pub use service::{CreatePipelineRequest, PipelineService, WebhookRequest};
pub use signature::{Provider, github_signature, verify_signature};
