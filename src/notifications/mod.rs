//! Notification persistence and processing.
//!
//! Messages are recorded exactly once per `message_id`: the store's unique
//! constraint settles races between consumers, while the processor and the
//! retry ledger decide between retrying and dead-lettering failed attempts.

mod dead_letter;
mod models;
mod processor;
mod publisher;
mod retry_ledger;
mod retry_policy;
mod schema;
mod store;

pub use dead_letter::DeadLetterPublisher;
pub use models::*;
pub use processor::{FailureVerdict, NotificationProcessor, ProcessError, ProcessOutcome};
pub use publisher::{NotificationPublisher, NotificationRequest, PublishError, PublishReceipt};
pub use retry_ledger::{RetryLedger, SqliteRetryLedger};
pub use retry_policy::RetryPolicy;
pub use store::{
    ExistingRecord, FailureUpdate, NotificationStore, PersistOutcome, SqliteNotificationStore,
    StoreError,
};
