//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::{Message, ThreadId};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{auto_title, Thread};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes read-modify-write updates of thread records.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn require_thread(&self, thread_id: &ThreadId) -> Result<Thread> {
        self.get_thread(thread_id)?.ok_or(StoreError::NotFound)
    }

    fn position(index: usize) -> Result<u32> {
        u32::try_from(index)
            .map_err(|_| StoreError::Database(format!("thread position overflow: {index}")))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Thread Operations
    // =========================================================================

    fn create_thread(&self, title: Option<&str>) -> Result<Thread> {
        let cf = self.cf(cf::THREADS)?;
        let thread = Thread::new(title);

        self.db
            .put_cf(&cf, keys::thread_key(&thread.thread_id), Self::serialize(&thread)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(thread_id = %thread.thread_id, "Created thread");
        Ok(thread)
    }

    fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>> {
        let cf = self.cf(cf::THREADS)?;

        self.db
            .get_cf(&cf, keys::thread_key(thread_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_threads(&self) -> Result<Vec<Thread>> {
        let cf = self.cf(cf::THREADS)?;

        let mut threads = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            threads.push(Self::deserialize::<Thread>(&value)?);
        }

        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    fn delete_thread(&self, thread_id: &ThreadId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_threads = self.cf(cf::THREADS)?;
        let cf_messages = self.cf(cf::THREAD_MESSAGES)?;

        let thread = self.require_thread(thread_id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_threads, keys::thread_key(thread_id));
        for position in 0..thread.message_count {
            batch.delete_cf(&cf_messages, keys::message_key(thread_id, position));
        }
        self.write(batch)?;

        tracing::debug!(thread_id = %thread_id, "Deleted thread");
        Ok(())
    }

    fn rename_thread(&self, thread_id: &ThreadId, title: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(cf::THREADS)?;

        let mut thread = self.require_thread(thread_id)?;
        thread.title = title.to_string();
        thread.updated_at = chrono::Utc::now();

        self.db
            .put_cf(&cf, keys::thread_key(thread_id), Self::serialize(&thread)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    // =========================================================================
    // Message Operations
    // =========================================================================

    fn messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let cf = self.cf(cf::THREAD_MESSAGES)?;
        let thread = self.require_thread(thread_id)?;
        let prefix = keys::thread_prefix(thread_id);

        let mut messages = Vec::with_capacity(thread.message_count as usize);
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            if !key.starts_with(&prefix) {
                break;
            }
            if keys::extract_position_from_message_key(&key) >= thread.message_count {
                break;
            }

            messages.push(Self::deserialize(&value)?);
        }

        Ok(messages)
    }

    fn append_message(&self, thread_id: &ThreadId, message: &Message) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_threads = self.cf(cf::THREADS)?;
        let cf_messages = self.cf(cf::THREAD_MESSAGES)?;

        let mut thread = self.require_thread(thread_id)?;
        let position = thread.message_count;

        if position == 0 {
            if let Some(title) = auto_title(message) {
                thread.title = title;
            }
        }
        thread.message_count += 1;
        thread.updated_at = chrono::Utc::now();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_messages,
            keys::message_key(thread_id, position),
            Self::serialize(message)?,
        );
        batch.put_cf(&cf_threads, keys::thread_key(thread_id), Self::serialize(&thread)?);
        self.write(batch)?;

        tracing::trace!(thread_id = %thread_id, position, role = %message.role, "Appended message");
        Ok(())
    }

    fn replace_messages_from(
        &self,
        thread_id: &ThreadId,
        index: usize,
        messages: &[Message],
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf_threads = self.cf(cf::THREADS)?;
        let cf_messages = self.cf(cf::THREAD_MESSAGES)?;

        let mut thread = self.require_thread(thread_id)?;
        let len = thread.message_count as usize;
        if index > len {
            return Err(StoreError::IndexOutOfRange { index, len });
        }

        let start = Self::position(index)?;
        let new_count = Self::position(index + messages.len())?;

        let mut batch = WriteBatch::default();
        for position in start..thread.message_count {
            batch.delete_cf(&cf_messages, keys::message_key(thread_id, position));
        }
        for (position, message) in (start..).zip(messages) {
            batch.put_cf(
                &cf_messages,
                keys::message_key(thread_id, position),
                Self::serialize(message)?,
            );
        }

        if new_count == 1 {
            if let Some(title) = messages.first().and_then(auto_title) {
                thread.title = title;
            }
        }
        thread.message_count = new_count;
        thread.updated_at = chrono::Utc::now();
        batch.put_cf(&cf_threads, keys::thread_key(thread_id), Self::serialize(&thread)?);
        self.write(batch)?;

        tracing::debug!(
            thread_id = %thread_id,
            index,
            replaced = len - index,
            appended = messages.len(),
            "Replaced thread tail"
        );
        Ok(())
    }

    // =========================================================================
    // Settings Operations
    // =========================================================================

    fn get_setting(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf::SETTINGS)?;

        self.db
            .get_cf(&cf, keys::setting_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn put_setting(&self, key: &str, value: &[u8]) -> Result<()> {
        let cf = self.cf(cf::SETTINGS)?;

        self.db
            .put_cf(&cf, keys::setting_key(key), value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let cf = self.cf(cf::SETTINGS)?;

        self.db
            .delete_cf(&cf, keys::setting_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{Part, Role};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn texts(store: &RocksStore, thread_id: &ThreadId) -> Vec<String> {
        store
            .messages(thread_id)
            .unwrap()
            .iter()
            .map(Message::text)
            .collect()
    }

    #[test]
    fn thread_crud() {
        let (store, _dir) = create_test_store();

        // Create
        let thread = store.create_thread(None).unwrap();
        assert_eq!(thread.title, crate::types::DEFAULT_TITLE);

        // Read
        let retrieved = store.get_thread(&thread.thread_id).unwrap().unwrap();
        assert_eq!(retrieved, thread);

        // Rename
        store.rename_thread(&thread.thread_id, "Renamed").unwrap();
        let renamed = store.get_thread(&thread.thread_id).unwrap().unwrap();
        assert_eq!(renamed.title, "Renamed");
        assert!(renamed.updated_at >= thread.updated_at);

        // Delete
        store
            .append_message(&thread.thread_id, &Message::user("hi"))
            .unwrap();
        store.delete_thread(&thread.thread_id).unwrap();
        assert!(store.get_thread(&thread.thread_id).unwrap().is_none());
        assert!(matches!(
            store.messages(&thread.thread_id),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.delete_thread(&thread.thread_id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn list_threads_most_recent_first() {
        let (store, _dir) = create_test_store();
        let older = store.create_thread(Some("older")).unwrap();
        let newer = store.create_thread(Some("newer")).unwrap();

        store
            .append_message(&older.thread_id, &Message::user("bump"))
            .unwrap();

        let titles: Vec<_> = store
            .list_threads()
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["bump".to_string(), "newer".to_string()]);
        assert!(store.get_thread(&newer.thread_id).unwrap().is_some());
    }

    #[test]
    fn messages_keep_append_order() {
        let (store, _dir) = create_test_store();
        let thread = store.create_thread(None).unwrap();

        for i in 0..300 {
            store
                .append_message(&thread.thread_id, &Message::user(format!("m{i}")))
                .unwrap();
        }

        let all = texts(&store, &thread.thread_id);
        assert_eq!(all.len(), 300);
        assert_eq!(all[0], "m0");
        assert_eq!(all[256], "m256");
        assert_eq!(all[299], "m299");
    }

    #[test]
    fn truncate_and_replace() {
        let (store, _dir) = create_test_store();
        let thread = store.create_thread(None).unwrap();
        let id = thread.thread_id;

        for text in ["m0", "m1", "m2"] {
            store.append_message(&id, &Message::user(text)).unwrap();
        }

        store
            .replace_messages_from(&id, 1, &[Message::user("m1'")])
            .unwrap();
        assert_eq!(texts(&store, &id), vec!["m0", "m1'"]);

        store.append_message(&id, &Message::assistant("m2'")).unwrap();
        assert_eq!(texts(&store, &id), vec!["m0", "m1'", "m2'"]);
        assert_eq!(store.get_thread(&id).unwrap().unwrap().message_count, 3);
    }

    #[test]
    fn replace_with_nothing_drops_the_tail() {
        let (store, _dir) = create_test_store();
        let id = store.create_thread(None).unwrap().thread_id;
        for text in ["q", "a"] {
            store.append_message(&id, &Message::user(text)).unwrap();
        }

        store.replace_messages_from(&id, 1, &[]).unwrap();
        assert_eq!(texts(&store, &id), vec!["q"]);

        store.replace_messages_from(&id, 1, &[]).unwrap();
        assert_eq!(texts(&store, &id), vec!["q"]);
    }

    #[test]
    fn replace_past_end_is_rejected() {
        let (store, _dir) = create_test_store();
        let id = store.create_thread(None).unwrap().thread_id;
        store.append_message(&id, &Message::user("only")).unwrap();

        let err = store
            .replace_messages_from(&id, 2, &[Message::user("x")])
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexOutOfRange { index: 2, len: 1 }));
        assert_eq!(texts(&store, &id), vec!["only"]);
    }

    #[test]
    fn auto_title_only_on_first_message() {
        let (store, _dir) = create_test_store();
        let id = store.create_thread(None).unwrap().thread_id;

        let first = "What is the airspeed velocity of an unladen swallow?";
        store.append_message(&id, &Message::user(first)).unwrap();
        let title = store.get_thread(&id).unwrap().unwrap().title;
        assert_eq!(title, &first[..30]);

        store
            .append_message(&id, &Message::user("A completely different question"))
            .unwrap();
        assert_eq!(store.get_thread(&id).unwrap().unwrap().title, title);
    }

    #[test]
    fn editing_the_only_message_retitles() {
        let (store, _dir) = create_test_store();
        let id = store.create_thread(None).unwrap().thread_id;
        store.append_message(&id, &Message::user("typo")).unwrap();
        store.append_message(&id, &Message::assistant("?")).unwrap();

        store
            .replace_messages_from(&id, 0, &[Message::user("fixed question")])
            .unwrap();
        assert_eq!(store.get_thread(&id).unwrap().unwrap().title, "fixed question");
    }

    #[test]
    fn image_parts_survive_storage() {
        let (store, _dir) = create_test_store();
        let id = store.create_thread(None).unwrap().thread_id;
        let msg = Message::new(
            Role::User,
            vec![Part::text("what is this?"), Part::image(vec![0x89, b'P', b'N', b'G'])],
        );

        store.append_message(&id, &msg).unwrap();
        assert_eq!(store.messages(&id).unwrap(), vec![msg]);
    }

    #[test]
    fn settings_crud() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.get_setting("systemPrompt").unwrap(), None);

        store.put_setting("systemPrompt", b"\"be brief\"").unwrap();
        assert_eq!(
            store.get_setting("systemPrompt").unwrap().as_deref(),
            Some(&b"\"be brief\""[..])
        );

        store.delete_setting("systemPrompt").unwrap();
        store.delete_setting("systemPrompt").unwrap();
        assert_eq!(store.get_setting("systemPrompt").unwrap(), None);
    }
}
