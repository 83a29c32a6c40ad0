//! nimbus-messaging — queues and notification topics.
//!
//! Queue messages are leased, not removed, on receive: a receive hands out
//! a receipt handle and hides the message for the queue's visibility
//! timeout. Only `delete_message(receipt)` removes it.
//!
//! ```text
//! publish(topic, body)
//!   ├── NotifyMessage persisted
//!   └── per subscription, spawned:
//!         queue   → QueueService::send_message as the topic owner
//!         webhook → POST application/json (response ignored)
//! ```
//!
//! Delivery is best effort: a failed fan-out is logged and dropped.

pub mod queue;
pub mod topic;

pub use queue::{CreateQueueRequest, MAX_RECEIVE_BATCH, QueueService};
pub use topic::{Publication, TopicService, WEBHOOK_TIMEOUT};
