//! Consumer loop: pulls deliveries from the source queue and settles each one
//! according to what the processor made of it.

use super::decode::decode;
use crate::config::WorkerSettings;
use crate::metrics;
use crate::notifications::{
    DeadLetterPublisher, NotificationMessage, NotificationProcessor, ProcessOutcome, RetryLedger,
};
use crate::queue::{Delivery, MessageQueue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause before receiving again after the transport reported an error.
const RECEIVE_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Pause before requeueing a message whose dead-letter publish failed.
pub const DEAD_LETTER_RETRY_DELAY: Duration = RECEIVE_ERROR_DELAY;

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Recorded, or already recorded by an earlier delivery.
    Acked { duplicate: bool },
    /// Failed; requeued for another attempt.
    Requeued { retry_count: u32 },
    /// Retries exhausted; the envelope is on the dead-letter queue and the
    /// original was acked.
    DeadLettered,
    /// Retries exhausted but the dead-letter publish was not confirmed; the
    /// original was requeued so the publish is attempted again.
    DeadLetterPending,
    /// Discarded without requeue.
    Rejected { reason: String },
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Acked { duplicate: false } => "acked",
            DeliveryOutcome::Acked { duplicate: true } => "duplicate",
            DeliveryOutcome::Requeued { .. } => "requeued",
            DeliveryOutcome::DeadLettered => "dead_lettered",
            DeliveryOutcome::DeadLetterPending => "dead_letter_pending",
            DeliveryOutcome::Rejected { .. } => "rejected",
        }
    }
}

pub struct Dispatcher {
    queue: Arc<dyn MessageQueue>,
    processor: NotificationProcessor,
    retry_ledger: Arc<dyn RetryLedger>,
    dead_letters: DeadLetterPublisher,
    queue_name: String,
    prefetch: usize,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        processor: NotificationProcessor,
        retry_ledger: Arc<dyn RetryLedger>,
        settings: &WorkerSettings,
    ) -> Self {
        let dead_letters = DeadLetterPublisher::new(queue.clone(), settings.dead_letter_queue.clone());
        Self {
            queue,
            processor,
            retry_ledger,
            dead_letters,
            queue_name: settings.queue_name.clone(),
            prefetch: settings.prefetch.max(1),
        }
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// Runs `prefetch` workers. Each worker handles one delivery at a time and
    /// always finishes the delivery it holds before observing shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Dispatcher starting on {} (prefetch={}, max_retries={}, dead letters to {})",
            self.queue_name,
            self.prefetch,
            self.processor.retry_policy().max_retries,
            self.dead_letters.destination()
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.prefetch {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { dispatcher.worker_loop(worker_id, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Dispatcher worker panicked: {}", e);
            }
        }

        info!("Dispatcher stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!("Worker {} started", worker_id);

        loop {
            // receive() is cancel-safe, so leaving it for shutdown loses nothing
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(&self.queue_name) => received,
            };

            match received {
                Ok(delivery) => {
                    self.handle_delivery(&delivery).await;
                }
                Err(e) => {
                    error!(
                        "Worker {} failed to receive from {}: {}",
                        worker_id, self.queue_name, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_ERROR_DELAY) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        debug!("Worker {} stopped", worker_id);
    }

    /// Process one delivery and settle it with the transport.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        let started = Instant::now();

        let outcome = match decode(&delivery.body) {
            Ok(message) => self.dispatch(delivery, &message).await,
            Err(e) => {
                error!(
                    "Rejecting undecodable delivery {} from {}: {}",
                    delivery.delivery_tag, delivery.queue, e
                );
                self.nack(delivery, false).await;
                DeliveryOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        };

        metrics::record_delivery(outcome.label(), started.elapsed());
        outcome
    }

    async fn dispatch(&self, delivery: &Delivery, message: &NotificationMessage) -> DeliveryOutcome {
        match self.processor.process(message) {
            Ok(ProcessOutcome::Processed { .. }) => {
                self.clear_retries(&message.message_id);
                self.ack(delivery).await;
                DeliveryOutcome::Acked { duplicate: false }
            }
            Ok(ProcessOutcome::Duplicate { .. }) => {
                self.clear_retries(&message.message_id);
                self.ack(delivery).await;
                DeliveryOutcome::Acked { duplicate: true }
            }
            Ok(ProcessOutcome::PendingDeadLetter { error }) => {
                self.dead_letter(delivery, message, &error).await
            }
            Err(e) => self.handle_processing_error(delivery, message, &e.to_string()).await,
        }
    }

    async fn handle_processing_error(
        &self,
        delivery: &Delivery,
        message: &NotificationMessage,
        error: &str,
    ) -> DeliveryOutcome {
        let prior_retry_count = match self.retry_ledger.get(&message.message_id) {
            Ok(count) => count,
            Err(e) => return self.reject_after_failed_handling(delivery, message, e).await,
        };

        let verdict = match self
            .processor
            .handle_failure(message, error, prior_retry_count)
        {
            Ok(verdict) => verdict,
            Err(e) => return self.reject_after_failed_handling(delivery, message, e).await,
        };

        if !verdict.should_retry {
            return self.dead_letter(delivery, message, error).await;
        }

        // The pending record already carries the new count, so a lost
        // increment cannot reset the budget
        if let Err(e) = self.retry_ledger.increment(&message.message_id) {
            warn!(
                "Failed to bump retry count for message {}: {}",
                message.message_id, e
            );
        }
        self.nack(delivery, true).await;
        DeliveryOutcome::Requeued {
            retry_count: verdict.new_retry_count,
        }
    }

    async fn reject_after_failed_handling(
        &self,
        delivery: &Delivery,
        message: &NotificationMessage,
        cause: impl std::fmt::Display,
    ) -> DeliveryOutcome {
        error!(
            "Failure handling for message {} failed, discarding delivery: {}",
            message.message_id, cause
        );
        self.clear_retries(&message.message_id);
        self.nack(delivery, false).await;
        DeliveryOutcome::Rejected {
            reason: format!("failure handling failed: {}", cause),
        }
    }

    /// Publish the envelope and only then ack the original.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        message: &NotificationMessage,
        error: &str,
    ) -> DeliveryOutcome {
        if let Err(e) = self.dead_letters.publish(message, error).await {
            error!(
                "Dead-letter publish for message {} failed, requeueing: {}",
                message.message_id, e
            );
            metrics::record_dead_letter_publish_failure();
            // The requeued message comes straight back; hold it while the
            // dead-letter queue recovers
            tokio::time::sleep(DEAD_LETTER_RETRY_DELAY).await;
            self.nack(delivery, true).await;
            return DeliveryOutcome::DeadLetterPending;
        }

        match self.processor.mark_dead_lettered(&message.message_id) {
            Ok(true) => {}
            Ok(false) => warn!(
                "No failed record to mark as dead-lettered for message {}",
                message.message_id
            ),
            Err(e) => warn!(
                "Failed to mark message {} as dead-lettered: {}",
                message.message_id, e
            ),
        }
        self.clear_retries(&message.message_id);
        self.ack(delivery).await;
        DeliveryOutcome::DeadLettered
    }

    fn clear_retries(&self, message_id: &str) {
        if let Err(e) = self.retry_ledger.clear(message_id) {
            warn!("Failed to clear retry count for message {}: {}", message_id, e);
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            // The message comes back once its lease expires; the store dedups it
            error!("Failed to ack delivery {}: {}", delivery.delivery_tag, e);
            metrics::record_settle_failure("ack");
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) {
        if let Err(e) = self.queue.nack(delivery, requeue).await {
            error!(
                "Failed to nack delivery {} (requeue={}): {}",
                delivery.delivery_tag, requeue, e
            );
            metrics::record_settle_failure("nack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{
        NotificationStatus, NotificationStore, RetryPolicy, SqliteNotificationStore,
    };
    use crate::queue::{QueueDepth, QueueOptions, SqliteMessageQueue};
    use serde_json::json;

    struct Fixture {
        queue: Arc<SqliteMessageQueue>,
        store: Arc<SqliteNotificationStore>,
        dispatcher: Arc<Dispatcher>,
    }

    fn setup() -> Fixture {
        let settings = WorkerSettings {
            poll_interval_ms: 10,
            ..Default::default()
        };
        let queue = Arc::new(SqliteMessageQueue::in_memory(QueueOptions::from(&settings)).unwrap());
        let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
        let processor = NotificationProcessor::new(store.clone(), RetryPolicy::new(&settings));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            processor,
            Arc::new(store.retry_ledger()),
            &settings,
        ));
        Fixture {
            queue,
            store,
            dispatcher,
        }
    }

    fn body(message_id: &str) -> Vec<u8> {
        serde_json::to_vec(&NotificationMessage::new(
            message_id,
            "u1",
            "email",
            json!({"subject": "x"}),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_message_is_acked() {
        let f = setup();
        f.queue.publish("notifications_queue", &body("m1")).await.unwrap();

        let delivery = f.queue.try_receive("notifications_queue").unwrap().unwrap();
        let outcome = f.dispatcher.handle_delivery(&delivery).await;

        assert_eq!(outcome, DeliveryOutcome::Acked { duplicate: false });
        assert_eq!(
            f.queue.depth("notifications_queue").unwrap(),
            QueueDepth::default()
        );
        let record = f.store.get_by_message_id("m1").unwrap().unwrap();
        assert_eq!(record.status, NotificationStatus::Processed);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_acked_as_duplicate() {
        let f = setup();
        f.queue.publish("notifications_queue", &body("m1")).await.unwrap();
        f.queue.publish("notifications_queue", &body("m1")).await.unwrap();

        let first = f.queue.try_receive("notifications_queue").unwrap().unwrap();
        let second = f.queue.try_receive("notifications_queue").unwrap().unwrap();

        assert_eq!(
            f.dispatcher.handle_delivery(&first).await,
            DeliveryOutcome::Acked { duplicate: false }
        );
        assert_eq!(
            f.dispatcher.handle_delivery(&second).await,
            DeliveryOutcome::Acked { duplicate: true }
        );
        assert_eq!(f.store.count_by_status().unwrap().processed, 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_rejected_without_record() {
        let f = setup();
        f.queue
            .publish("notifications_queue", b"{\"messageId\": 42")
            .await
            .unwrap();

        let delivery = f.queue.try_receive("notifications_queue").unwrap().unwrap();
        let outcome = f.dispatcher.handle_delivery(&delivery).await;

        assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));
        assert_eq!(
            f.queue.depth("notifications_queue").unwrap(),
            QueueDepth::default()
        );
        assert_eq!(f.queue.depth("notifications_dlq").unwrap().ready, 0);
        assert_eq!(f.store.count_by_status().unwrap(), Default::default());
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let f = setup();
        for i in 0..5 {
            f.queue
                .publish("notifications_queue", &body(&format!("m{}", i)))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.dispatcher.clone().run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.store.count_by_status().unwrap().processed < 5 {
            assert!(Instant::now() < deadline, "dispatcher did not drain the queue");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            f.queue.depth("notifications_queue").unwrap(),
            QueueDepth::default()
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(DeliveryOutcome::Acked { duplicate: false }.label(), "acked");
        assert_eq!(DeliveryOutcome::Acked { duplicate: true }.label(), "duplicate");
        assert_eq!(DeliveryOutcome::Requeued { retry_count: 1 }.label(), "requeued");
        assert_eq!(DeliveryOutcome::DeadLettered.label(), "dead_lettered");
        assert_eq!(DeliveryOutcome::DeadLetterPending.label(), "dead_letter_pending");
        assert_eq!(
            DeliveryOutcome::Rejected {
                reason: "bad".to_string()
            }
            .label(),
            "rejected"
        );
    }
}
