//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Thread records, keyed by `thread_id`.
    pub const THREADS: &str = "threads";

    /// Finalized messages, keyed by `thread_id || position` (big-endian u32).
    pub const THREAD_MESSAGES: &str = "thread_messages";

    /// Key/value settings, keyed by UTF-8 setting name. Values are JSON.
    pub const SETTINGS: &str = "settings";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::THREADS, cf::THREAD_MESSAGES, cf::SETTINGS]
}
