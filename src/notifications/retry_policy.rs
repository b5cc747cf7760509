//! Retry policy for failed notification attempts.

use super::models::NotificationStatus;
use crate::config::WorkerSettings;

/// Bounded retry budget per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of redeliveries before the message is dead-lettered.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(config: &WorkerSettings) -> Self {
        Self {
            max_retries: config.max_retries,
        }
    }

    /// Whether a message that already failed `prior_retry_count` times may be
    /// retried once more. Strict comparison: `max_retries = k` allows exactly
    /// `k` retries.
    pub fn should_retry(&self, prior_retry_count: u32) -> bool {
        prior_retry_count < self.max_retries
    }

    /// Status to record after a failure with the given prior count.
    pub fn status_after_failure(&self, prior_retry_count: u32) -> NotificationStatus {
        if self.should_retry(prior_retry_count) {
            NotificationStatus::Pending
        } else {
            NotificationStatus::Failed
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_from_config() {
        let config = WorkerSettings {
            max_retries: 7,
            ..Default::default()
        };
        let policy = RetryPolicy::new(&config);

        assert_eq!(policy.max_retries, 7);
    }

    #[test]
    fn test_default() {
        assert_eq!(RetryPolicy::default().max_retries, 3);
        assert_eq!(
            RetryPolicy::new(&WorkerSettings::default()),
            RetryPolicy::default()
        );
    }

    #[test]
    fn test_should_retry_max_retries_exceeded() {
        let policy = RetryPolicy { max_retries: 3 };

        // Under max_retries: should retry
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));

        // At or above max_retries: should not retry
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        let policy = RetryPolicy { max_retries: 0 };

        assert!(!policy.should_retry(0));
        assert_eq!(policy.status_after_failure(0), NotificationStatus::Failed);
    }

    #[test]
    fn test_status_after_failure() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.status_after_failure(0), NotificationStatus::Pending);
        assert_eq!(policy.status_after_failure(2), NotificationStatus::Pending);
        assert_eq!(policy.status_after_failure(3), NotificationStatus::Failed);
    }
}
