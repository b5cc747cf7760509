//! Producer side: validates notification requests and enqueues them.

use super::models::NotificationMessage;
use crate::queue::{MessageQueue, QueueError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Payload must be a JSON object")]
    InvalidPayload,

    #[error("Failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish notification: {0}")]
    Queue(#[from] QueueError),
}

/// A notification as submitted by a client, before it gets a message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub target_user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub message_id: String,
    pub status: &'static str,
}

pub struct NotificationPublisher {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
}

impl NotificationPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    fn validate(request: &NotificationRequest) -> Result<(), PublishError> {
        if request.target_user_id.trim().is_empty() {
            return Err(PublishError::MissingField("targetUserId"));
        }
        if request.notification_type.trim().is_empty() {
            return Err(PublishError::MissingField("type"));
        }
        if !request.payload.is_object() {
            return Err(PublishError::InvalidPayload);
        }
        Ok(())
    }

    /// Assign a fresh message id and enqueue the notification.
    pub async fn publish(&self, request: NotificationRequest) -> Result<PublishReceipt, PublishError> {
        Self::validate(&request)?;

        let message_id = uuid::Uuid::new_v4().to_string();
        let message = NotificationMessage::new(
            message_id.clone(),
            request.target_user_id,
            request.notification_type,
            request.payload,
        )
        .with_timestamp(Utc::now());
        let body = serde_json::to_vec(&message)?;

        if let Err(e) = self.queue.publish(&self.queue_name, &body).await {
            error!(
                "Failed to publish notification for user {}: {}",
                message.target_user_id, e
            );
            return Err(e.into());
        }

        info!(
            "Published notification {} for user {} (type {})",
            message_id, message.target_user_id, message.notification_type
        );
        Ok(PublishReceipt {
            message_id,
            status: "queued",
        })
    }
}
