#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-store-memory** – In-memory store driver for whirr.
//!
//! A fast, non-persistent backend suitable for tests and local development.
//! All data lives in process memory behind a single async mutex, which
//! trivially gives the conditional operations the atomicity the protocol
//! requires. Everything is lost when the process terminates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use whirr_store_core::{Cache, MemKey, Store, StoreError};

/// An in-memory, non-persistent byte store.
///
/// Implements both [`Store`] and [`Cache`] so a single instance can back a
/// whole local deployment. Cloning is cheap and shares the underlying maps.
/// Keys are flattened to the `"<kind>/<call_hash>"` form.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Drops all records and counters. Useful for tests that simulate a
    /// best-effort cache reset.
    pub async fn clear(&self) {
        self.records.lock().await.clear();
        self.counters.lock().await.clear();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn has(&self, key: &MemKey) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.contains_key(&key.storage_key()))
    }

    async fn get(&self, key: &MemKey) -> Result<Vec<u8>, StoreError> {
        self.records
            .lock()
            .await
            .get(&key.storage_key())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn set(&self, key: &MemKey, value: &[u8]) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(key.storage_key(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &MemKey) -> Result<(), StoreError> {
        self.records.lock().await.remove(&key.storage_key());
        Ok(())
    }

    async fn set_new_value(&self, key: &MemKey, value: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let flat = key.storage_key();
        if records.contains_key(&flat) {
            return Err(StoreError::CompareMismatch);
        }
        records.insert(flat, value.to_vec());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &MemKey,
        value: &[u8],
        expected: &[u8],
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let flat = key.storage_key();
        match records.get(&flat) {
            Some(current) if current == expected => {
                records.insert(flat, value.to_vec());
                Ok(())
            }
            _ => Err(StoreError::CompareMismatch),
        }
    }

    async fn compare_and_delete(&self, key: &MemKey, expected: &[u8]) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let flat = key.storage_key();
        match records.get(&flat) {
            Some(current) if current == expected => {
                records.remove(&flat);
                Ok(())
            }
            _ => Err(StoreError::CompareMismatch),
        }
    }
}

#[async_trait]
impl Cache for MemoryStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_has_delete() {
        let store = MemoryStore::new();
        let key = MemKey::call("h1");

        assert!(!store.has(&key).await.unwrap());
        assert!(matches!(
            store.get(&key).await.unwrap_err(),
            StoreError::NotFound(_)
        ));

        store.set(&key, b"v1").await.unwrap();
        assert!(store.has(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), b"v1");

        store.set(&key, b"v2").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"v2");

        store.delete(&key).await.unwrap();
        assert!(!store.has(&key).await.unwrap());
        // Deleting an absent key is a no-op.
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn kinds_do_not_collide() {
        let store = MemoryStore::new();
        store.set(&MemKey::call("h"), b"call").await.unwrap();
        store.set(&MemKey::value("h"), b"value").await.unwrap();
        assert_eq!(store.get(&MemKey::call("h")).await.unwrap(), b"call");
        assert_eq!(store.get(&MemKey::value("h")).await.unwrap(), b"value");
        assert!(!store.has(&MemKey::pending_returns("h")).await.unwrap());
    }

    #[tokio::test]
    async fn set_new_value_is_first_writer_wins() {
        let store = MemoryStore::new();
        let key = MemKey::value("h");
        store.set_new_value(&key, b"first").await.unwrap();
        assert!(matches!(
            store.set_new_value(&key, b"second").await.unwrap_err(),
            StoreError::CompareMismatch
        ));
        assert_eq!(store.get(&key).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn compare_and_set_requires_exact_bytes() {
        let store = MemoryStore::new();
        let key = MemKey::pending_returns("h");

        // CAS against a missing key fails.
        assert!(matches!(
            store.compare_and_set(&key, b"new", b"old").await.unwrap_err(),
            StoreError::CompareMismatch
        ));

        store.set(&key, b"old").await.unwrap();
        store.compare_and_set(&key, b"new", b"old").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"new");

        assert!(matches!(
            store.compare_and_set(&key, b"x", b"old").await.unwrap_err(),
            StoreError::CompareMismatch
        ));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_exact_bytes() {
        let store = MemoryStore::new();
        let key = MemKey::pending_returns("h");
        store.set(&key, b"bytes").await.unwrap();

        assert!(matches!(
            store.compare_and_delete(&key, b"other").await.unwrap_err(),
            StoreError::CompareMismatch
        ));
        assert!(store.has(&key).await.unwrap());

        store.compare_and_delete(&key, b"bytes").await.unwrap();
        assert!(!store.has(&key).await.unwrap());

        // Gone now, so a further conditional delete mismatches.
        assert!(matches!(
            store.compare_and_delete(&key, b"bytes").await.unwrap_err(),
            StoreError::CompareMismatch
        ));
    }

    #[tokio::test]
    async fn incr_counts_per_key() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c/a").await.unwrap(), 1);
        assert_eq!(store.incr("c/a").await.unwrap(), 2);
        assert_eq!(store.incr("c/b").await.unwrap(), 1);
        store.clear().await;
        assert_eq!(store.incr("c/a").await.unwrap(), 1);
    }
}
