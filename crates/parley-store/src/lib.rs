//! `RocksDB` storage layer for parley.
//!
//! This crate persists conversation threads, their finalized messages and the
//! application's key/value settings.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `threads`: Thread records, keyed by `thread_id`
//! - `thread_messages`: Finalized messages, keyed by `thread_id || position`
//! - `settings`: JSON settings values, keyed by name
//!
//! Message order is append-only. Edits and reloads truncate a thread at a
//! position and append replacements; stored messages are never rewritten in
//! place.
//!
//! # Example
//!
//! ```no_run
//! use parley_core::Message;
//! use parley_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/parley-db").unwrap();
//! let thread = store.create_thread(None).unwrap();
//! store.append_message(&thread.thread_id, &Message::user("Hello")).unwrap();
//!
//! let thread = store.get_thread(&thread.thread_id).unwrap().unwrap();
//! assert_eq!(thread.title, "Hello");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod settings;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use settings::{migrate_legacy_settings, SettingsExt};
pub use types::{auto_title, ExternalServerRecord, Thread};

use parley_core::{Message, ThreadId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different
/// implementations.
pub trait Store: Send + Sync {
    // =========================================================================
    // Thread Operations
    // =========================================================================

    /// Create an empty thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn create_thread(&self, title: Option<&str>) -> Result<Thread>;

    /// Get a thread by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>>;

    /// List all threads, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_threads(&self) -> Result<Vec<Thread>>;

    /// Delete a thread and all of its messages.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist.
    fn delete_thread(&self, thread_id: &ThreadId) -> Result<()>;

    /// Change a thread's title.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist.
    fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> Result<()>;

    // =========================================================================
    // Message Operations
    // =========================================================================

    /// List a thread's finalized messages in order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist.
    fn messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>>;

    /// Append a finalized message to the tail of a thread.
    ///
    /// Appending a user message with text to an empty thread titles the
    /// thread from that text.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist.
    fn append_message(&self, thread_id: &ThreadId, message: &Message) -> Result<()>;

    /// Truncate a thread to `index` messages, then append `messages`.
    ///
    /// Used by edit (replace the turn at `index` and everything after it) and
    /// reload (drop the turn at `index` and everything after it). A result of
    /// exactly one message retitles the thread from it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the thread doesn't exist, or
    /// `StoreError::IndexOutOfRange` if `index` exceeds the thread length.
    fn replace_messages_from(
        &self,
        thread_id: &ThreadId,
        index: usize,
        messages: &[Message],
    ) -> Result<()>;

    // =========================================================================
    // Settings Operations
    // =========================================================================

    /// Get a raw settings value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_setting(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or update a raw settings value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_setting(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a settings value. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn delete_setting(&self, key: &str) -> Result<()>;
}
