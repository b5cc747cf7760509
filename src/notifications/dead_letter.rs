//! Publishes terminal failures to the dead-letter queue.

use super::models::{DeadLetterMessage, NotificationMessage};
use crate::queue::{MessageQueue, QueueError};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct DeadLetterPublisher {
    queue: Arc<dyn MessageQueue>,
    destination: String,
}

impl DeadLetterPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, destination: impl Into<String>) -> Self {
        Self {
            queue,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Publish the dead-letter envelope for `message` and wait for confirmation.
    pub async fn publish(&self, message: &NotificationMessage, error: &str) -> Result<(), QueueError> {
        let envelope = DeadLetterMessage::new(message.clone(), error, Utc::now());
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| QueueError::Unavailable(format!("failed to encode envelope: {}", e)))?;

        self.queue.publish(&self.destination, &body).await?;
        info!(
            "Message {} dead-lettered to {}",
            message.message_id, self.destination
        );
        Ok(())
    }
}
