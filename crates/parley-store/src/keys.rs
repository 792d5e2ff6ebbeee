//! Key encoding utilities for `RocksDB`.
//!
//! Message keys sort by thread and then by position, so a prefix scan over a
//! thread id yields its messages in conversation order.

use parley_core::ThreadId;

/// Length in bytes of a message key.
pub const MESSAGE_KEY_LEN: usize = 20;

/// Encode a thread key (just the thread ID bytes).
#[must_use]
pub fn thread_key(thread_id: &ThreadId) -> Vec<u8> {
    thread_id.as_bytes().to_vec()
}

/// Encode a message key: `thread_id || position`.
///
/// The position is big-endian so lexicographic order matches numeric order.
#[must_use]
pub fn message_key(thread_id: &ThreadId, position: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(MESSAGE_KEY_LEN);
    key.extend_from_slice(thread_id.as_bytes());
    key.extend_from_slice(&position.to_be_bytes());
    key
}

/// Encode a thread prefix for scanning all messages of a thread.
#[must_use]
pub fn thread_prefix(thread_id: &ThreadId) -> Vec<u8> {
    thread_id.as_bytes().to_vec()
}

/// Extract the position from a message key.
///
/// # Panics
///
/// Panics if the key is not at least 20 bytes.
#[must_use]
pub fn extract_position_from_message_key(key: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&key[16..MESSAGE_KEY_LEN]);
    u32::from_be_bytes(bytes)
}

/// Encode a settings key.
#[must_use]
pub fn setting_key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}
