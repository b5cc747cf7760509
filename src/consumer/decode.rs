use crate::notifications::NotificationMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid notification JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("messageId must not be empty")]
    EmptyMessageId,

    #[error("payload must be a JSON object")]
    PayloadNotObject,
}

/// Parse a queue message body. Bodies that fail here can never succeed and
/// must not be retried.
pub fn decode(body: &[u8]) -> Result<NotificationMessage, DecodeError> {
    let message: NotificationMessage = serde_json::from_slice(body)?;
    if message.message_id.trim().is_empty() {
        return Err(DecodeError::EmptyMessageId);
    }
    if !message.payload.is_object() {
        return Err(DecodeError::PayloadNotObject);
    }
    Ok(message)
}
