//! Notification Worker Library
//!
//! Consumes notification messages from a durable queue and records each one
//! exactly once, retrying failures up to a budget and dead-lettering the rest.

pub mod config;
pub mod consumer;
pub mod metrics;
pub mod notifications;
pub mod queue;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use config::{AppConfig, CliConfig, FileConfig, WorkerSettings};
pub use consumer::{DeliveryOutcome, Dispatcher};
pub use notifications::{
    NotificationMessage, NotificationProcessor, NotificationPublisher, NotificationStore,
    RetryPolicy, SqliteNotificationStore,
};
pub use queue::{MessageQueue, SqliteMessageQueue};
