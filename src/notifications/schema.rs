//! Database schema for notifications.db.
//!
//! Version 0 holds the notification records and the retry ledger. Version 1
//! adds `dead_lettered_at`, stamped once a dead-letter publish is confirmed.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Notifications Table
// =============================================================================

const NOTIFICATIONS_TABLE_V0: Table = Table {
    name: "notifications",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("message_id", &SqlType::Text, non_null = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("type", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "retries_attempted",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("processed_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_notifications_status", "status"),
        ("idx_notifications_user", "user_id"),
    ],
    // The actual guarantor of one record per message; see SqliteNotificationStore
    unique_constraints: &[&["message_id"]],
};

const NOTIFICATIONS_TABLE_V1: Table = Table {
    name: "notifications",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("message_id", &SqlType::Text, non_null = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("type", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "retries_attempted",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("processed_at", &SqlType::Integer),
        sqlite_column!("dead_lettered_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_notifications_status", "status"),
        ("idx_notifications_user", "user_id"),
    ],
    unique_constraints: &[&["message_id"]],
};

// =============================================================================
// Retry Ledger Table
// =============================================================================

const RETRY_LEDGER_TABLE_V0: Table = Table {
    name: "retry_ledger",
    columns: &[
        sqlite_column!("message_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "ALTER TABLE notifications ADD COLUMN dead_lettered_at INTEGER",
        [],
    )?;
    // Records that failed before this column existed were dead-lettered already.
    conn.execute(
        "UPDATE notifications SET dead_lettered_at = created_at WHERE status = 'failed'",
        [],
    )?;
    Ok(())
}

pub const NOTIFICATIONS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[NOTIFICATIONS_TABLE_V0, RETRY_LEDGER_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[NOTIFICATIONS_TABLE_V1, RETRY_LEDGER_TABLE_V0],
        migration: Some(migrate_v0_to_v1),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_persistence::open_versioned_db;

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();

        let schema = NOTIFICATIONS_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).expect("Schema should create successfully");
        schema.validate(&conn).expect("Schema should validate successfully");
    }

    #[test]
    fn test_message_id_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        NOTIFICATIONS_VERSIONED_SCHEMAS[1].create(&conn).unwrap();

        let insert = r#"INSERT INTO notifications (
                message_id, user_id, type, payload, status, created_at
            ) VALUES ('m1', 'u1', 'email', '{}', 'processed', 1700000000)"#;
        conn.execute(insert, []).unwrap();

        let err = conn.execute(insert, []).unwrap_err();
        assert_eq!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        );
    }

    #[test]
    fn test_retries_attempted_defaults_to_zero() {
        let conn = Connection::open_in_memory().unwrap();
        NOTIFICATIONS_VERSIONED_SCHEMAS[1].create(&conn).unwrap();

        conn.execute(
            r#"INSERT INTO notifications (
                message_id, user_id, type, payload, status, created_at
            ) VALUES ('m1', 'u1', 'email', '{}', 'processed', 1700000000)"#,
            [],
        )
        .unwrap();

        let retries: i64 = conn
            .query_row(
                "SELECT retries_attempted FROM notifications WHERE message_id = 'm1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(retries, 0);
    }

    #[test]
    fn test_v0_database_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.db");
        {
            let conn = Connection::open(&path).unwrap();
            NOTIFICATIONS_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
            conn.execute(
                r#"INSERT INTO notifications (
                    message_id, user_id, type, payload, status, retries_attempted, created_at
                ) VALUES ('m1', 'u1', 'email', '{}', 'failed', 4, 1700000000)"#,
                [],
            )
            .unwrap();
        }

        let conn = open_versioned_db(&path, NOTIFICATIONS_VERSIONED_SCHEMAS, "notifications")
            .unwrap();

        NOTIFICATIONS_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
        let dead_lettered_at: Option<i64> = conn
            .query_row(
                "SELECT dead_lettered_at FROM notifications WHERE message_id = 'm1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dead_lettered_at, Some(1700000000));
    }
}
