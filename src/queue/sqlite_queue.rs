use super::schema::QUEUE_VERSIONED_SCHEMAS;
use super::{Delivery, MessageQueue, QueueError};
use crate::config::WorkerSettings;
use crate::sqlite_persistence::{open_in_memory_db, open_versioned_db};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

const STATE_READY: &str = "ready";
const STATE_UNACKED: &str = "unacked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Sleep between polls while a queue is empty.
    pub poll_interval: Duration,
    /// How long an unacked delivery stays hidden before it is handed out again.
    pub visibility_timeout: Duration,
    /// Ready messages kept per capped queue; the oldest are dropped beyond
    /// this. 0 means unbounded.
    pub max_length: usize,
    /// Queues `max_length` applies to. Every other queue is unbounded.
    pub capped_queues: Vec<String>,
}

impl From<&WorkerSettings> for QueueOptions {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            visibility_timeout: Duration::from_secs(settings.visibility_timeout_secs),
            max_length: settings.max_queue_length,
            capped_queues: vec![settings.queue_name.clone()],
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub unacked: usize,
}

/// Durable queue broker backed by SQLite.
///
/// Several processes can open the same file; claims run in immediate
/// transactions so a message is held by at most one consumer at a time.
pub struct SqliteMessageQueue {
    conn: Arc<Mutex<Connection>>,
    options: QueueOptions,
}

impl SqliteMessageQueue {
    pub fn new<P: AsRef<Path>>(db_path: P, options: QueueOptions) -> anyhow::Result<Self> {
        let conn = open_versioned_db(db_path, QUEUE_VERSIONED_SCHEMAS, "queue")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    pub fn in_memory(options: QueueOptions) -> anyhow::Result<Self> {
        let conn = open_in_memory_db(QUEUE_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Claim the next available message without waiting.
    ///
    /// Ready messages and unacked messages whose lease expired are eligible,
    /// oldest first.
    pub fn try_receive(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Self::now_millis();

        let candidate: Option<(i64, Vec<u8>, u32)> = tx
            .query_row(
                r#"SELECT id, body, delivery_count FROM queue_messages
                WHERE queue = ?1 AND (state = ?2 OR (state = ?3 AND lease_expires_at <= ?4))
                ORDER BY id LIMIT 1"#,
                params![queue, STATE_READY, STATE_UNACKED, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, body, previous_deliveries)) = candidate else {
            return Ok(None);
        };

        let lease_expires_at = now + self.options.visibility_timeout.as_millis() as i64;
        tx.execute(
            r#"UPDATE queue_messages
            SET state = ?1, delivery_count = delivery_count + 1, lease_expires_at = ?2
            WHERE id = ?3"#,
            params![STATE_UNACKED, lease_expires_at, id],
        )?;
        tx.commit()?;

        if previous_deliveries > 0 {
            debug!(
                "Redelivering message {} from {} (delivery {})",
                id,
                queue,
                previous_deliveries + 1
            );
        }

        Ok(Some(Delivery {
            delivery_tag: id,
            queue: queue.to_string(),
            body,
            redelivered: previous_deliveries > 0,
            delivery_count: previous_deliveries + 1,
        }))
    }

    pub fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM queue_messages WHERE queue = ?1 GROUP BY state")?;
        let rows = stmt.query_map(params![queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let (state, count) = row?;
            match state.as_str() {
                STATE_READY => depth.ready = count as usize,
                STATE_UNACKED => depth.unacked = count as usize,
                other => warn!("Unknown queue message state '{}'", other),
            }
        }
        Ok(depth)
    }

    /// Bodies of the oldest messages on `queue`, without claiming them.
    pub fn peek(&self, queue: &str, limit: usize) -> Result<Vec<Vec<u8>>, QueueError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT body FROM queue_messages WHERE queue = ?1 ORDER BY id LIMIT ?2")?;
        let bodies = stmt
            .query_map(params![queue, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bodies)
    }

    pub fn health_check(&self) -> Result<(), QueueError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Settle `delivery`. The delivery count acts as a fencing token so a
    /// consumer whose lease expired cannot settle somebody else's claim.
    fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let conn = self.lock()?;
        let changed = if requeue {
            conn.execute(
                r#"UPDATE queue_messages SET state = ?1, lease_expires_at = 0
                WHERE id = ?2 AND state = ?3 AND delivery_count = ?4"#,
                params![
                    STATE_READY,
                    delivery.delivery_tag,
                    STATE_UNACKED,
                    delivery.delivery_count
                ],
            )?
        } else {
            conn.execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND state = ?2 AND delivery_count = ?3",
                params![delivery.delivery_tag, STATE_UNACKED, delivery.delivery_count],
            )?
        };

        if changed == 0 {
            return Err(QueueError::StaleDelivery(delivery.delivery_tag));
        }
        Ok(())
    }

    fn is_capped(&self, queue: &str) -> bool {
        self.options.max_length > 0 && self.options.capped_queues.iter().any(|q| q == queue)
    }

    fn publish_blocking(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO queue_messages (queue, body, state, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![queue, body, STATE_READY, chrono::Utc::now().timestamp()],
        )?;

        if self.is_capped(queue) {
            let ready: i64 = tx.query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1 AND state = ?2",
                params![queue, STATE_READY],
                |row| row.get(0),
            )?;
            let overflow = ready - self.options.max_length as i64;
            if overflow > 0 {
                tx.execute(
                    r#"DELETE FROM queue_messages WHERE id IN (
                        SELECT id FROM queue_messages WHERE queue = ?1 AND state = ?2
                        ORDER BY id LIMIT ?3
                    )"#,
                    params![queue, STATE_READY, overflow],
                )?;
                warn!(
                    "Queue {} exceeded {} messages, dropped {} oldest",
                    queue, self.options.max_length, overflow
                );
            }
        }

        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for SqliteMessageQueue {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        self.publish_blocking(queue, body)
    }

    async fn receive(&self, queue: &str) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.try_receive(queue)? {
                return Ok(delivery);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, false)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        self.settle(delivery, requeue)
    }
}
