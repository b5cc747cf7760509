//! Fault-injecting wrappers around the real store and queue.

use super::constants::*;
use async_trait::async_trait;
use notification_worker::notifications::{
    FailureUpdate, NotificationMessage, NotificationRecord, NotificationStatus, NotificationStore,
    PersistOutcome, SqliteNotificationStore, StatusCounts, StoreError,
};
use notification_worker::queue::{Delivery, MessageQueue, QueueError, SqliteMessageQueue};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Store whose `persist_processed` fails for selected message ids, and whose
/// `record_failure` can be switched off entirely.
pub struct FlakyStore {
    inner: Arc<SqliteNotificationStore>,
    /// Remaining failures per message id; `u32::MAX` fails forever
    failures: Mutex<Vec<(String, u32)>>,
    persist_calls: AtomicU32,
    record_failure_down: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteNotificationStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(Vec::new()),
            persist_calls: AtomicU32::new(0),
            record_failure_down: AtomicBool::new(false),
        }
    }

    pub fn fail_record_failure(&self, down: bool) {
        self.record_failure_down.store(down, Ordering::SeqCst);
    }

    pub fn fail_times(&self, message_id: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .push((message_id.to_string(), times));
    }

    pub fn fail_always(&self, message_id: &str) {
        self.fail_times(message_id, u32::MAX);
    }

    pub fn persist_calls(&self) -> u32 {
        self.persist_calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, message_id: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.iter_mut().find(|(id, _)| id == message_id) {
            Some((_, remaining)) if *remaining == u32::MAX => true,
            Some((_, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

fn transient_error() -> StoreError {
    StoreError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some(TRANSIENT_ERROR.to_string()),
    ))
}

impl NotificationStore for FlakyStore {
    fn persist_processed(
        &self,
        message: &NotificationMessage,
        now: i64,
    ) -> Result<PersistOutcome, StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(&message.message_id) {
            return Err(transient_error());
        }
        self.inner.persist_processed(message, now)
    }

    fn record_failure(
        &self,
        message: &NotificationMessage,
        update: &FailureUpdate,
    ) -> Result<bool, StoreError> {
        if self.record_failure_down.load(Ordering::SeqCst) {
            return Err(transient_error());
        }
        self.inner.record_failure(message, update)
    }

    fn mark_dead_lettered(&self, message_id: &str, at: i64) -> Result<bool, StoreError> {
        self.inner.mark_dead_lettered(message_id, at)
    }

    fn get_by_message_id(&self, message_id: &str) -> Result<Option<NotificationRecord>, StoreError> {
        self.inner.get_by_message_id(message_id)
    }

    fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        self.inner.list_by_status(status, limit)
    }

    fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.inner.count_by_status()
    }

    fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check()
    }
}

/// Queue that can refuse publishes to the dead-letter queue.
pub struct FlakyQueue {
    inner: Arc<SqliteMessageQueue>,
    dead_letter_down: AtomicBool,
}

impl FlakyQueue {
    pub fn new(inner: Arc<SqliteMessageQueue>) -> Self {
        Self {
            inner,
            dead_letter_down: AtomicBool::new(false),
        }
    }

    pub fn set_dead_letter_down(&self, down: bool) {
        self.dead_letter_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageQueue for FlakyQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        if queue == DEAD_LETTER_QUEUE && self.dead_letter_down.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable(
                "dead-letter queue not confirming publishes".to_string(),
            ));
        }
        self.inner.publish(queue, body).await
    }

    async fn receive(&self, queue: &str) -> Result<Delivery, QueueError> {
        self.inner.receive(queue).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        self.inner.nack(delivery, requeue).await
    }
}
