//! Data models for the notification pipeline.
//!
//! Defines the inbound queue message, the persisted record, its status
//! lifecycle and the dead-letter envelope.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Reason attached to every dead-letter envelope.
pub const DEAD_LETTER_REASON: &str = "Max retries exceeded";

/// Processing status of a persisted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// At least one attempt failed and a retry is expected.
    Pending,
    Processed, // terminal
    Failed,    // terminal
}

impl NotificationStatus {
    /// Returns true if no further processing will happen for this record.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Processed | NotificationStatus::Failed
        )
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processed => "processed",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "processed" => Some(NotificationStatus::Processed),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A notification request as it travels through the queue.
///
/// `message_id` is assigned by the publisher and is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub message_id: String,
    pub target_user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl NotificationMessage {
    pub fn new(
        message_id: impl Into<String>,
        target_user_id: impl Into<String>,
        notification_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            target_user_id: target_user_id.into(),
            notification_type: notification_type.into(),
            payload,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(to_iso8601(timestamp));
        self
    }
}

/// The durable record of a notification. At most one exists per `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// Store-assigned identifier
    pub id: i64,
    pub message_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub payload: JsonValue,
    pub status: NotificationStatus,
    /// Number of failed attempts recorded so far
    pub retries_attempted: u32,
    /// Last observed failure, if any attempt ever failed
    pub error_message: Option<String>,
    /// Unix timestamp of the first persistence attempt
    pub created_at: i64,
    /// Unix timestamp of the transition into `processed`
    pub processed_at: Option<i64>,
    /// Unix timestamp of the confirmed dead-letter publish
    pub dead_lettered_at: Option<i64>,
}

/// Envelope published to the dead-letter queue once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    #[serde(flatten)]
    pub message: NotificationMessage,
    pub failed_at: String,
    pub error: String,
    pub reason: String,
}

impl DeadLetterMessage {
    pub fn new(message: NotificationMessage, error: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            message,
            failed_at: to_iso8601(failed_at),
            error: error.into(),
            reason: DEAD_LETTER_REASON.to_string(),
        }
    }
}

/// Record counts per status, for operator tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processed: usize,
    pub failed: usize,
}

pub fn to_iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_status_db_conversion() {
        for status in [
            NotificationStatus::Pending,
            NotificationStatus::Processed,
            NotificationStatus::Failed,
        ] {
            assert_eq!(NotificationStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(NotificationStatus::from_db_str("PROCESSED"), None);
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(!NotificationStatus::Pending.is_terminal());
        assert!(NotificationStatus::Processed.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
    }

    #[test]
    fn test_message_wire_format() {
        let body = r#"{
            "messageId": "m1",
            "targetUserId": "u1",
            "type": "email",
            "payload": {"subject": "x"},
            "timestamp": "2024-01-15T10:00:00.000Z"
        }"#;

        let message: NotificationMessage = serde_json::from_str(body).unwrap();

        assert_eq!(message.message_id, "m1");
        assert_eq!(message.target_user_id, "u1");
        assert_eq!(message.notification_type, "email");
        assert_eq!(message.payload, json!({"subject": "x"}));
        assert_eq!(message.timestamp.as_deref(), Some("2024-01-15T10:00:00.000Z"));
    }

    #[test]
    fn test_message_without_timestamp() {
        let message: NotificationMessage = serde_json::from_str(
            r#"{"messageId":"m1","targetUserId":"u1","type":"sms","payload":{}}"#,
        )
        .unwrap();

        assert!(message.timestamp.is_none());
        let serialized = serde_json::to_value(&message).unwrap();
        assert!(serialized.get("timestamp").is_none());
    }

    #[test]
    fn test_dead_letter_envelope_keeps_original_fields() {
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let message = NotificationMessage::new("m2", "u2", "push", json!({"a": [1, 2]}))
            .with_timestamp(failed_at);

        let envelope = DeadLetterMessage::new(message, "database is locked", failed_at);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["messageId"], "m2");
        assert_eq!(value["targetUserId"], "u2");
        assert_eq!(value["type"], "push");
        assert_eq!(value["payload"], json!({"a": [1, 2]}));
        assert_eq!(value["timestamp"], "2024-01-15T10:30:00.000Z");
        assert_eq!(value["failedAt"], "2024-01-15T10:30:00.000Z");
        assert_eq!(value["error"], "database is locked");
        assert_eq!(value["reason"], "Max retries exceeded");

        let decoded: DeadLetterMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, envelope);
    }
}
