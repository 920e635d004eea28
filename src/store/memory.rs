//! In-process key-value backend
//!
//! Used in development mode and by tests. Every operation yields to the
//! scheduler once, so concurrent callers interleave the way they would
//! against a remote store. Faults can be injected to exercise retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{HashWrite, KvBackend};
use crate::error::StoreError;

#[derive(Default)]
struct Data {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Data {
    fn field(&self, key: &str, field: &str) -> Option<&str> {
        self.hashes
            .get(key)
            .and_then(|h| h.get(field))
            .map(String::as_str)
    }

    /// Set or delete one field, dropping the hash once it is empty
    fn write_field(&mut self, key: &str, field: &str, value: Option<&str>) {
        match value {
            Some(value) => {
                self.hashes
                    .entry(key.to_string())
                    .or_default()
                    .insert(field.to_string(), value.to_string());
            }
            None => {
                if let Some(hash) = self.hashes.get_mut(key) {
                    hash.remove(field);
                    if hash.is_empty() {
                        self.hashes.remove(key);
                    }
                }
            }
        }
    }
}

/// Key-value backend held in memory
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Data>,
    /// Operations that will fail with `Unavailable` before the backend recovers
    fail_next: AtomicU32,
    /// Compare-and-swap and commit calls that will report a conflict without
    /// writing
    conflict_next: AtomicU32,
    /// Successful writes, for tests
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail as if the backend were down
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` compare-and-swap calls lose their race
    pub fn conflict_next(&self, count: u32) {
        self.conflict_next.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of a hash, for assertions
    pub fn snapshot(&self, key: &str) -> HashMap<String, String> {
        self.data.lock().hashes.get(key).cloned().unwrap_or_default()
    }

    /// Consume one injected conflict, if any are pending
    fn lose_race(&self) -> bool {
        self.conflict_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn enter(&self) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        Ok(self.data.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.data
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        Ok(self
            .data
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.enter().await?;
        Ok(self.snapshot(key))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.data
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        self.enter().await?;
        let mut data = self.data.lock();
        let hash = data.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.data.lock().write_field(key, field, None);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hcompare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        if self.lose_race() {
            return Ok(false);
        }

        let mut data = self.data.lock();
        if data.field(key, field) != expected {
            return Ok(false);
        }
        data.write_field(key, field, new);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn hcommit(&self, writes: &[HashWrite]) -> Result<bool, StoreError> {
        self.enter().await?;
        if self.lose_race() {
            return Ok(false);
        }

        let mut data = self.data.lock();
        let unchanged = writes
            .iter()
            .all(|w| data.field(&w.key, &w.field) == w.expected.as_deref());
        if !unchanged {
            return Ok(false);
        }
        for write in writes {
            data.write_field(&write.key, &write.field, write.new.as_deref());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_strings() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("a").await.unwrap(), None);

        backend.set("a", "1").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_hashes() {
        let backend = MemoryBackend::new();
        backend.hset("h", "f1", "x").await.unwrap();
        backend.hset("h", "f2", "y").await.unwrap();

        assert_eq!(backend.hget("h", "f1").await.unwrap(), Some("x".to_string()));
        assert_eq!(backend.hgetall("h").await.unwrap().len(), 2);

        backend.hdel("h", "f1").await.unwrap();
        backend.hdel("h", "f2").await.unwrap();
        assert!(backend.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let backend = MemoryBackend::new();

        assert!(backend.hcompare_and_swap("h", "f", None, Some("1")).await.unwrap());
        // Field now exists, so "absent" no longer matches
        assert!(!backend.hcompare_and_swap("h", "f", None, Some("2")).await.unwrap());
        assert!(backend
            .hcompare_and_swap("h", "f", Some("1"), Some("2"))
            .await
            .unwrap());
        assert!(backend.hcompare_and_swap("h", "f", Some("2"), None).await.unwrap());
        assert_eq!(backend.hget("h", "f").await.unwrap(), None);
    }

    fn write(key: &str, field: &str, expected: Option<&str>, new: Option<&str>) -> HashWrite {
        HashWrite {
            key: key.to_string(),
            field: field.to_string(),
            expected: expected.map(str::to_string),
            new: new.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_commit_spans_keys() {
        let backend = MemoryBackend::new();
        backend.hset("a", "f", "1").await.unwrap();

        let committed = backend
            .hcommit(&[write("a", "f", Some("1"), None), write("b", "g", None, Some("1"))])
            .await
            .unwrap();
        assert!(committed);
        assert!(backend.snapshot("a").is_empty());
        assert_eq!(backend.hget("b", "g").await.unwrap(), Some("1".to_string()));
        assert_eq!(backend.write_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        backend.hset("a", "f", "1").await.unwrap();
        backend.hset("b", "g", "9").await.unwrap();

        // Second expectation is stale, so the first write must not land either
        let committed = backend
            .hcommit(&[write("a", "f", Some("1"), None), write("b", "g", None, Some("1"))])
            .await
            .unwrap();
        assert!(!committed);
        assert_eq!(backend.hget("a", "f").await.unwrap(), Some("1".to_string()));
        assert_eq!(backend.hget("b", "g").await.unwrap(), Some("9".to_string()));

        backend.conflict_next(1);
        assert!(!backend
            .hcommit(&[write("c", "f", None, Some("1"))])
            .await
            .unwrap());
        assert!(backend.snapshot("c").is_empty());
    }

    #[tokio::test]
    async fn test_hset_multiple() {
        let backend = MemoryBackend::new();
        backend
            .hset_multiple("h", &[("x", "1"), ("y", "2")])
            .await
            .unwrap();
        assert_eq!(backend.hgetall("h").await.unwrap().len(), 2);
        assert_eq!(backend.write_count(), 1);

        backend.fail_next(1);
        assert!(backend.hset_multiple("h", &[("x", "5")]).await.is_err());
        assert_eq!(backend.hget("h", "x").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let backend = MemoryBackend::new();

        backend.fail_next(1);
        assert!(matches!(
            backend.ping().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(backend.ping().await.is_ok());

        backend.conflict_next(1);
        assert!(!backend.hcompare_and_swap("h", "f", None, Some("1")).await.unwrap());
        assert!(backend.hcompare_and_swap("h", "f", None, Some("1")).await.unwrap());
    }
}
