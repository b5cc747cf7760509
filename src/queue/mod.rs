//! Message transport.
//!
//! [`MessageQueue`] is the broker capability the consumer relies on: named
//! queues, at-least-once delivery, explicit ack/nack and confirmed publishes.
//! [`SqliteMessageQueue`] provides it on top of a shared SQLite file.

mod schema;
mod sqlite_queue;

pub use sqlite_queue::{QueueDepth, QueueOptions, SqliteMessageQueue};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The delivery was already settled, or its lease expired and another
    /// consumer took it over.
    #[error("delivery {0} is no longer held by this consumer")]
    StaleDelivery(i64),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("queue connection lock poisoned")]
    LockPoisoned,
}

/// A message handed to a consumer. It stays invisible to other consumers until
/// it is acked, nacked or its lease expires.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: i64,
    pub queue: String,
    pub body: Vec<u8>,
    /// True if this message was delivered before.
    pub redelivered: bool,
    /// Number of times this message has been handed out, including this one.
    pub delivery_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Durably enqueue `body` on `queue`. Returning Ok is the publish confirmation.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Wait for the next message on `queue`.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn receive(&self, queue: &str) -> Result<Delivery, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle negatively. With `requeue` the message becomes available again,
    /// otherwise it is discarded.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;
}
