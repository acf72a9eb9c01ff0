#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-store-sled** – Sled-based persistent store driver for whirr.
//!
//! A durable, embedded backend using the sled database engine. Records and
//! spawn counters live in separate trees; the conditional operations map
//! directly onto sled's `compare_and_swap`, which gives the protocol the
//! atomicity it needs without any external service.

use std::path::Path;

use anyhow::anyhow;
use async_trait::async_trait;
use sled::{Db, Tree};

use whirr_store_core::{Cache, MemKey, Store, StoreError};

/// A persistent byte store backed by sled.
///
/// Keys use the flat `"<kind>/<call_hash>"` encoding. Reads are strongly
/// consistent within the process, so the protocol's read-after-write retry
/// never actually fires against this driver.
#[derive(Debug)]
pub struct SledStore {
    // Keep a handle so the database is not closed while trees are live.
    _db: Db,
    records: Tree,
    counters: Tree,
}

impl SledStore {
    /// Opens or creates a database at `path`, recovering if it was not
    /// closed cleanly.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::open_with_config(path, sled::Config::default())
    }

    /// Opens a database with custom sled configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: sled::Config) -> anyhow::Result<Self> {
        let db = config.path(path).open()?;
        Self::from_db(db)
    }

    /// Wraps an existing sled database instance.
    pub fn from_db(db: Db) -> anyhow::Result<Self> {
        let records = db.open_tree("records")?;
        let counters = db.open_tree("counters")?;
        Ok(Self {
            _db: db,
            records,
            counters,
        })
    }

    /// Creates a throwaway store in a temporary location.
    #[cfg(test)]
    fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    /// Flushes all pending writes to disk.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.records.flush_async().await?;
        self.counters.flush_async().await?;
        Ok(())
    }

    /// Number of records currently held.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn backend(e: sled::Error) -> StoreError {
        StoreError::Backend(anyhow!(e))
    }
}

#[async_trait]
impl Store for SledStore {
    async fn has(&self, key: &MemKey) -> Result<bool, StoreError> {
        self.records
            .contains_key(key.storage_key())
            .map_err(Self::backend)
    }

    async fn get(&self, key: &MemKey) -> Result<Vec<u8>, StoreError> {
        match self.records.get(key.storage_key()).map_err(Self::backend)? {
            Some(ivec) => Ok(ivec.to_vec()),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn set(&self, key: &MemKey, value: &[u8]) -> Result<(), StoreError> {
        self.records
            .insert(key.storage_key(), value)
            .map_err(Self::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &MemKey) -> Result<(), StoreError> {
        self.records
            .remove(key.storage_key())
            .map_err(Self::backend)?;
        Ok(())
    }

    async fn set_new_value(&self, key: &MemKey, value: &[u8]) -> Result<(), StoreError> {
        self.records
            .compare_and_swap(key.storage_key(), None as Option<&[u8]>, Some(value))
            .map_err(Self::backend)?
            .map_err(|_| StoreError::CompareMismatch)
    }

    async fn compare_and_set(
        &self,
        key: &MemKey,
        value: &[u8],
        expected: &[u8],
    ) -> Result<(), StoreError> {
        self.records
            .compare_and_swap(key.storage_key(), Some(expected), Some(value))
            .map_err(Self::backend)?
            .map_err(|_| StoreError::CompareMismatch)
    }

    async fn compare_and_delete(&self, key: &MemKey, expected: &[u8]) -> Result<(), StoreError> {
        self.records
            .compare_and_swap(key.storage_key(), Some(expected), None as Option<&[u8]>)
            .map_err(Self::backend)?
            .map_err(|_| StoreError::CompareMismatch)
    }
}

// Counters are stored as 8 big-endian bytes; anything else reads as zero.
fn decode_counter(bytes: Option<&[u8]>) -> u64 {
    match bytes {
        Some(bytes) if bytes.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            u64::from_be_bytes(buf)
        }
        _ => 0,
    }
}

#[async_trait]
impl Cache for SledStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let updated = self
            .counters
            .update_and_fetch(key, |current| {
                let next = decode_counter(current).saturating_add(1);
                Some(next.to_be_bytes().to_vec())
            })
            .map_err(Self::backend)?;
        Ok(decode_counter(updated.as_deref()))
    }
}
