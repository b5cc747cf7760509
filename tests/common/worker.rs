//! Test worker instances sharing on-disk databases.
//!
//! A [`TestEnv`] owns a temporary database directory. Each [`TestWorker`]
//! opens its own connections to it, like a separate consumer process would.

use super::constants::*;
use super::doubles::{FlakyQueue, FlakyStore};
use notification_worker::config::WorkerSettings;
use notification_worker::consumer::{DeliveryOutcome, Dispatcher};
use notification_worker::notifications::{
    DeadLetterMessage, NotificationMessage, NotificationProcessor, RetryPolicy,
    SqliteNotificationStore,
};
use notification_worker::queue::{MessageQueue, QueueOptions, SqliteMessageQueue};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub fn notifications_db(&self) -> PathBuf {
        self.dir.path().join("notifications.db")
    }

    pub fn queue_db(&self) -> PathBuf {
        self.dir.path().join("queue.db")
    }

    /// Rows left in the retry ledger for `message_id`, read past the store.
    pub fn ledger_rows(&self, message_id: &str) -> i64 {
        let conn = rusqlite::Connection::open(self.notifications_db())
            .expect("Failed to open notifications db");
        conn.query_row(
            "SELECT COUNT(*) FROM retry_ledger WHERE message_id = ?1",
            [message_id],
            |row| row.get(0),
        )
        .expect("Failed to count ledger rows")
    }

    pub fn settings(max_retries: u32) -> WorkerSettings {
        WorkerSettings {
            max_retries,
            poll_interval_ms: 5,
            ..Default::default()
        }
    }

    /// Start a new consumer instance on this environment's databases.
    pub fn worker(&self, max_retries: u32) -> TestWorker {
        self.worker_with(Self::settings(max_retries))
    }

    pub fn worker_with(&self, settings: WorkerSettings) -> TestWorker {
        let store = Arc::new(
            SqliteNotificationStore::new(self.notifications_db())
                .expect("Failed to open notifications db"),
        );
        let queue = Arc::new(
            SqliteMessageQueue::new(self.queue_db(), QueueOptions::from(&settings))
                .expect("Failed to open queue db"),
        );
        let flaky_store = Arc::new(FlakyStore::new(store.clone()));
        let flaky_queue = Arc::new(FlakyQueue::new(queue.clone()));

        let processor = NotificationProcessor::new(flaky_store.clone(), RetryPolicy::new(&settings));
        let dispatcher = Arc::new(Dispatcher::new(
            flaky_queue.clone(),
            processor,
            Arc::new(store.retry_ledger()),
            &settings,
        ));

        TestWorker {
            store,
            queue,
            flaky_store,
            flaky_queue,
            dispatcher,
        }
    }
}

pub struct TestWorker {
    /// Direct access to the records, bypassing fault injection
    pub store: Arc<SqliteNotificationStore>,
    pub queue: Arc<SqliteMessageQueue>,
    pub flaky_store: Arc<FlakyStore>,
    pub flaky_queue: Arc<FlakyQueue>,
    pub dispatcher: Arc<Dispatcher>,
}

impl TestWorker {
    pub async fn submit(&self, message: &NotificationMessage) {
        let body = serde_json::to_vec(message).expect("Failed to encode message");
        self.submit_raw(&body).await;
    }

    pub async fn submit_raw(&self, body: &[u8]) {
        self.queue
            .publish(SOURCE_QUEUE, body)
            .await
            .expect("Failed to publish");
    }

    /// Handle the next available delivery, if any.
    pub async fn deliver_next(&self) -> Option<DeliveryOutcome> {
        let delivery = self
            .queue
            .try_receive(SOURCE_QUEUE)
            .expect("Failed to receive")?;
        Some(self.dispatcher.handle_delivery(&delivery).await)
    }

    /// Handle deliveries until the source queue is empty.
    pub async fn drain(&self) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.deliver_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.queue
            .peek(DEAD_LETTER_QUEUE, 1000)
            .expect("Failed to peek dead-letter queue")
            .iter()
            .map(|body| serde_json::from_slice(body).expect("Invalid dead-letter envelope"))
            .collect()
    }
}

pub fn message(message_id: &str) -> NotificationMessage {
    NotificationMessage::new(
        message_id,
        "u1",
        "email",
        serde_json::json!({"subject": "x"}),
    )
}
