//! Database schema for queue.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const QUEUE_MESSAGES_TABLE_V0: Table = Table {
    name: "queue_messages",
    columns: &[
        // Monotonic id doubles as the delivery tag and the FIFO order
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("queue", &SqlType::Text, non_null = true),
        sqlite_column!("body", &SqlType::Blob, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!(
            "delivery_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("enqueued_at", &SqlType::Integer, non_null = true),
        // Unix millis; only meaningful while unacked
        sqlite_column!(
            "lease_expires_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_queue_messages_queue_state", "queue, state")],
    unique_constraints: &[],
};

pub const QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[QUEUE_MESSAGES_TABLE_V0],
    migration: None,
}];
