//! Notification record storage.
//!
//! Provides the idempotent, transactional persistence surface keyed by
//! `message_id`, with a SQLite-backed implementation.

use super::models::*;
use super::retry_ledger::SqliteRetryLedger;
use super::schema::NOTIFICATIONS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_in_memory_db, open_versioned_db};
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the notification store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// Result of trying to durably record a successfully processed message.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    /// A new record was inserted as `processed`.
    Inserted { notification_id: i64 },
    /// A `pending` record left by an earlier failed attempt moved to `processed`.
    Resumed { notification_id: i64 },
    /// A terminal record already exists; nothing was written.
    AlreadyRecorded(ExistingRecord),
}

/// The parts of an existing record the processor needs to classify a redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRecord {
    pub notification_id: i64,
    pub status: NotificationStatus,
    pub error_message: Option<String>,
    pub dead_lettered_at: Option<i64>,
}

/// Failure state to write for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    pub retries_attempted: u32,
    pub status: NotificationStatus,
    pub error_message: String,
    pub now: i64,
}

/// Trait for notification storage operations.
///
/// Every method runs in its own transaction; implementations must keep at most
/// one record per `message_id` even when several processes share the store.
pub trait NotificationStore: Send + Sync {
    /// Record `message` as processed unless a terminal record already exists.
    ///
    /// A uniqueness violation on `message_id` raised by a concurrent insert is
    /// reported as [`PersistOutcome::AlreadyRecorded`], never as an error.
    fn persist_processed(
        &self,
        message: &NotificationMessage,
        now: i64,
    ) -> Result<PersistOutcome, StoreError>;

    /// Insert or update the failure state for `message`.
    ///
    /// Returns false if the record is already `processed` and was left untouched.
    fn record_failure(
        &self,
        message: &NotificationMessage,
        update: &FailureUpdate,
    ) -> Result<bool, StoreError>;

    /// Stamp `dead_lettered_at` on a failed record. Returns false if there was
    /// no failed record to stamp.
    fn mark_dead_lettered(&self, message_id: &str, at: i64) -> Result<bool, StoreError>;

    fn get_by_message_id(&self, message_id: &str) -> Result<Option<NotificationRecord>, StoreError>;

    /// Most recent records with the given status.
    fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError>;

    fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    fn health_check(&self) -> Result<(), StoreError>;
}

/// SQLite-backed notification store.
pub struct SqliteNotificationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNotificationStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path, NOTIFICATIONS_VERSIONED_SCHEMAS, "notifications")?;
        Ok(SqliteNotificationStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = open_in_memory_db(NOTIFICATIONS_VERSIONED_SCHEMAS)?;
        Ok(SqliteNotificationStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A retry ledger persisted in the same database as the records.
    pub fn retry_ledger(&self) -> SqliteRetryLedger {
        SqliteRetryLedger::new(self.conn.clone())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<NotificationRecord> {
        let payload_text: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload_text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        Ok(NotificationRecord {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            user_id: row.get("user_id")?,
            notification_type: row.get("type")?,
            payload,
            status: Self::read_status(row)?,
            retries_attempted: row.get("retries_attempted")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            processed_at: row.get("processed_at")?,
            dead_lettered_at: row.get("dead_lettered_at")?,
        })
    }

    fn row_to_existing(row: &rusqlite::Row) -> rusqlite::Result<ExistingRecord> {
        Ok(ExistingRecord {
            notification_id: row.get("id")?,
            status: Self::read_status(row)?,
            error_message: row.get("error_message")?,
            dead_lettered_at: row.get("dead_lettered_at")?,
        })
    }

    fn read_status(row: &rusqlite::Row) -> rusqlite::Result<NotificationStatus> {
        let status: String = row.get("status")?;
        NotificationStatus::from_db_str(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                format!("unknown notification status '{}'", status).into(),
            )
        })
    }

    fn find_existing(conn: &Connection, message_id: &str) -> rusqlite::Result<Option<ExistingRecord>> {
        conn.query_row(
            "SELECT id, status, error_message, dead_lettered_at FROM notifications WHERE message_id = ?1",
            params![message_id],
            Self::row_to_existing,
        )
        .optional()
    }
}

/// True if `err` is the uniqueness violation on `notifications.message_id`.
fn is_message_id_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            e.code == ErrorCode::ConstraintViolation && msg.contains("message_id")
        }
        _ => false,
    }
}

const RECORD_COLUMNS: &str = "id, message_id, user_id, type, payload, status, retries_attempted, \
     error_message, created_at, processed_at, dead_lettered_at";

impl NotificationStore for SqliteNotificationStore {
    fn persist_processed(
        &self,
        message: &NotificationMessage,
        now: i64,
    ) -> Result<PersistOutcome, StoreError> {
        let payload = serde_json::to_string(&message.payload)?;
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front, so the existence check and
        // the insert see the same snapshot across processes.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match Self::find_existing(&tx, &message.message_id)? {
            Some(existing) if existing.status.is_terminal() => {
                // Dropping the transaction rolls it back
                return Ok(PersistOutcome::AlreadyRecorded(existing));
            }
            Some(existing) => {
                tx.execute(
                    "UPDATE notifications SET status = ?1, processed_at = ?2 WHERE id = ?3 AND status = ?4",
                    params![
                        NotificationStatus::Processed.as_db_str(),
                        now,
                        existing.notification_id,
                        NotificationStatus::Pending.as_db_str(),
                    ],
                )?;
                tx.commit()?;
                return Ok(PersistOutcome::Resumed {
                    notification_id: existing.notification_id,
                });
            }
            None => {}
        }

        let inserted = tx.execute(
            r#"INSERT INTO notifications (
                user_id, type, payload, message_id, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                message.target_user_id,
                message.notification_type,
                payload,
                message.message_id,
                NotificationStatus::Processed.as_db_str(),
                now,
            ],
        );
        if let Err(e) = inserted {
            if is_message_id_conflict(&e) {
                drop(tx);
                debug!(
                    "Concurrent insert detected for message {}, treating as duplicate",
                    message.message_id
                );
                return match Self::find_existing(&conn, &message.message_id)? {
                    Some(existing) => Ok(PersistOutcome::AlreadyRecorded(existing)),
                    None => Err(StoreError::Database(e)),
                };
            }
            return Err(e.into());
        }
        let notification_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE notifications SET processed_at = ?1 WHERE id = ?2",
            params![now, notification_id],
        )?;

        tx.commit()?;
        Ok(PersistOutcome::Inserted { notification_id })
    }

    fn record_failure(
        &self,
        message: &NotificationMessage,
        update: &FailureUpdate,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(&message.payload)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match Self::find_existing(&tx, &message.message_id)? {
            None => {
                tx.execute(
                    r#"INSERT INTO notifications (
                        user_id, type, payload, message_id, status,
                        retries_attempted, error_message, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                    params![
                        message.target_user_id,
                        message.notification_type,
                        payload,
                        message.message_id,
                        update.status.as_db_str(),
                        update.retries_attempted,
                        update.error_message,
                        update.now,
                    ],
                )?;
            }
            Some(existing) if existing.status == NotificationStatus::Processed => {
                warn!(
                    "Message {} was processed elsewhere, not recording failure",
                    message.message_id
                );
                return Ok(false);
            }
            Some(existing) => {
                tx.execute(
                    r#"UPDATE notifications
                    SET retries_attempted = MAX(retries_attempted, ?1), status = ?2, error_message = ?3
                    WHERE id = ?4"#,
                    params![
                        update.retries_attempted,
                        update.status.as_db_str(),
                        update.error_message,
                        existing.notification_id,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn mark_dead_lettered(&self, message_id: &str, at: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE notifications SET dead_lettered_at = ?1 WHERE message_id = ?2 AND status = ?3",
            params![at, message_id, NotificationStatus::Failed.as_db_str()],
        )?;
        Ok(updated > 0)
    }

    fn get_by_message_id(&self, message_id: &str) -> Result<Option<NotificationRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM notifications WHERE message_id = ?1",
                    RECORD_COLUMNS
                ),
                params![message_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM notifications WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![status.as_db_str(), limit as i64], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM notifications GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            match NotificationStatus::from_db_str(&status) {
                Some(NotificationStatus::Pending) => counts.pending = count as usize,
                Some(NotificationStatus::Processed) => counts.processed = count as usize,
                Some(NotificationStatus::Failed) => counts.failed = count as usize,
                None => warn!("Ignoring records with unknown status '{}'", status),
            }
        }
        Ok(counts)
    }

    fn health_check(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
