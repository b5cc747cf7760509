//! Turns a decoded notification into a durable, deduplicated record.
//!
//! The processor only talks to the store. Acknowledging, requeueing and
//! dead-lettering are left to the caller, driven by the returned verdicts.

use super::models::{NotificationMessage, NotificationStatus};
use super::retry_policy::RetryPolicy;
use super::store::{FailureUpdate, NotificationStore, PersistOutcome, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to persist notification: {0}")]
    Store(#[from] StoreError),
}

/// Successful result of [`NotificationProcessor::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The message is now recorded as processed.
    Processed { notification_id: i64 },
    /// A terminal record already existed; nothing was written.
    Duplicate { status: NotificationStatus },
    /// The message exhausted its retries earlier but its dead-letter publish
    /// was never confirmed.
    PendingDeadLetter { error: String },
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureVerdict {
    pub should_retry: bool,
    pub new_retry_count: u32,
}

pub struct NotificationProcessor {
    store: Arc<dyn NotificationStore>,
    retry_policy: RetryPolicy,
}

impl NotificationProcessor {
    pub fn new(store: Arc<dyn NotificationStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Persist `message` exactly once.
    pub fn process(&self, message: &NotificationMessage) -> Result<ProcessOutcome, ProcessError> {
        let now = chrono::Utc::now().timestamp();

        match self.store.persist_processed(message, now)? {
            PersistOutcome::Inserted { notification_id } => {
                info!(
                    "Stored notification {} for message {} (user {}, type {})",
                    notification_id,
                    message.message_id,
                    message.target_user_id,
                    message.notification_type
                );
                Ok(ProcessOutcome::Processed { notification_id })
            }
            PersistOutcome::Resumed { notification_id } => {
                info!(
                    "Stored notification {} for message {} after earlier failures",
                    notification_id, message.message_id
                );
                Ok(ProcessOutcome::Processed { notification_id })
            }
            PersistOutcome::AlreadyRecorded(existing) => {
                if existing.status == NotificationStatus::Failed
                    && existing.dead_lettered_at.is_none()
                {
                    warn!(
                        "Message {} already failed permanently but was never dead-lettered",
                        message.message_id
                    );
                    return Ok(ProcessOutcome::PendingDeadLetter {
                        error: existing.error_message.unwrap_or_default(),
                    });
                }
                debug!(
                    "Duplicate message {} ignored (status {})",
                    message.message_id, existing.status
                );
                Ok(ProcessOutcome::Duplicate {
                    status: existing.status,
                })
            }
        }
    }

    /// Record a failed attempt and decide whether the message gets another one.
    ///
    /// The failure is persisted before the verdict is returned.
    pub fn handle_failure(
        &self,
        message: &NotificationMessage,
        error: &str,
        prior_retry_count: u32,
    ) -> Result<FailureVerdict, StoreError> {
        let should_retry = self.retry_policy.should_retry(prior_retry_count);
        let new_retry_count = prior_retry_count + 1;
        let status = self.retry_policy.status_after_failure(prior_retry_count);

        self.store.record_failure(
            message,
            &FailureUpdate {
                retries_attempted: new_retry_count,
                status,
                error_message: error.to_string(),
                now: chrono::Utc::now().timestamp(),
            },
        )?;

        if should_retry {
            warn!(
                "Message {} failed (attempt {}/{}): {}",
                message.message_id, new_retry_count, self.retry_policy.max_retries, error
            );
        } else {
            warn!(
                "Message {} exhausted its {} retries: {}",
                message.message_id, self.retry_policy.max_retries, error
            );
        }

        Ok(FailureVerdict {
            should_retry,
            new_retry_count,
        })
    }

    /// Note that the dead-letter publish for `message_id` was confirmed.
    pub fn mark_dead_lettered(&self, message_id: &str) -> Result<bool, StoreError> {
        self.store
            .mark_dead_lettered(message_id, chrono::Utc::now().timestamp())
    }
}
