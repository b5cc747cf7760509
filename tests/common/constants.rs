//! Shared constants for end-to-end tests

pub const SOURCE_QUEUE: &str = "notifications_queue";

pub const DEAD_LETTER_QUEUE: &str = "notifications_dlq";

/// Error raised by the flaky store while it is failing
pub const TRANSIENT_ERROR: &str = "database is locked";

/// Upper bound for any test that waits on background workers
pub const WAIT_TIMEOUT_SECS: u64 = 10;
