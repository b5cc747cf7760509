//! Per-message retry counts.
//!
//! The broker does not carry a reliable attempt counter across redeliveries,
//! so the consumer keeps its own. The SQLite ledger survives restarts and is
//! shared by every consumer process that opens the same database.

use super::models::NotificationStatus;
use super::store::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub trait RetryLedger: Send + Sync {
    /// Failed attempts recorded so far for `message_id`; 0 if unknown.
    fn get(&self, message_id: &str) -> Result<u32, StoreError>;

    /// Record one more failed attempt and return the new count.
    fn increment(&self, message_id: &str) -> Result<u32, StoreError>;

    /// Forget `message_id`, once it succeeded or was dead-lettered.
    fn clear(&self, message_id: &str) -> Result<(), StoreError>;
}

/// Ledger stored in the `retry_ledger` table of the notifications database.
pub struct SqliteRetryLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRetryLedger {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl RetryLedger for SqliteRetryLedger {
    fn get(&self, message_id: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        let ledger: Option<u32> = conn
            .query_row(
                "SELECT attempts FROM retry_ledger WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        // A failure recorded right before a crash may be ahead of the ledger
        let recorded: Option<u32> = conn
            .query_row(
                "SELECT retries_attempted FROM notifications WHERE message_id = ?1 AND status != ?2",
                params![message_id, NotificationStatus::Processed.as_db_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ledger.unwrap_or(0).max(recorded.unwrap_or(0)))
    }

    fn increment(&self, message_id: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        let attempts = conn.query_row(
            r#"INSERT INTO retry_ledger (message_id, attempts, updated_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(message_id) DO UPDATE SET
                attempts = attempts + 1,
                updated_at = excluded.updated_at
            RETURNING attempts"#,
            params![message_id, chrono::Utc::now().timestamp()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    fn clear(&self, message_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM retry_ledger WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }
}
