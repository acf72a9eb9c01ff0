#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-store-core** – Core storage abstractions for whirr.
//!
//! This crate defines the contracts a key-value backend must satisfy to act
//! as whirr's shared memory ([`Store`], [`Cache`]), the three record kinds
//! that live in it, and the [`Memory`] wrapper that implements the race-safe
//! pending-returns protocol on top of compare-and-swap. Concrete drivers
//! (in-memory, sled, remote stores) live in separate crates that depend on
//! this one.
//!
//! The store is the *only* coordination point between workers: every
//! mutation of a `pending_returns` record goes through a CAS loop, and
//! memoized values are written with set-if-absent. Get those two right and
//! the rest of the engine can be eventually consistent and at-least-once.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod records;

pub use memory::{with_cas, Memory, CAS_RETRY_LIMIT};
pub use records::PendingReturns;

//─────────────────────────────
//  Keys
//─────────────────────────────

/// The three record kinds stored per call hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    /// The call definition: task name plus argument payload.
    Call,
    /// The memoized return value, written exactly once.
    Value,
    /// The set of parents awaiting this call, plus scheduling metadata.
    PendingReturns,
}

impl MemKind {
    /// Canonical lowercase name, used in composite storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemKind::Call => "call",
            MemKind::Value => "value",
            MemKind::PendingReturns => "pending_returns",
        }
    }
}

impl fmt::Display for MemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key addressing one record: `(kind, call_hash)`.
///
/// The concrete encoding is backend-specific; [`MemKey::storage_key`] gives
/// the flat `"<kind>/<call_hash>"` form used by drivers without a native
/// two-part key. Hashes only contain printable US-ASCII.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemKey {
    /// Record kind.
    pub kind: MemKind,
    /// Identity of the call this record belongs to.
    pub call_hash: String,
}

impl MemKey {
    /// Key of the call-definition record.
    pub fn call(call_hash: &str) -> Self {
        Self {
            kind: MemKind::Call,
            call_hash: call_hash.to_string(),
        }
    }

    /// Key of the memoized value record.
    pub fn value(call_hash: &str) -> Self {
        Self {
            kind: MemKind::Value,
            call_hash: call_hash.to_string(),
        }
    }

    /// Key of the pending-returns record.
    pub fn pending_returns(call_hash: &str) -> Self {
        Self {
            kind: MemKind::PendingReturns,
            call_hash: call_hash.to_string(),
        }
    }

    /// Flat single-string form for drivers without composite keys.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.kind, self.call_hash)
    }
}

impl fmt::Display for MemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.call_hash)
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by stores and the protocol layered on them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists under the key.
    #[error("not found: {0}")]
    NotFound(MemKey),
    /// A conditional write observed different bytes than expected.
    #[error("compare mismatch")]
    CompareMismatch,
    /// A CAS loop kept losing races past the hard cap. Almost certainly a
    /// broken `compare_and_set` in the underlying driver.
    #[error("exceeded CAS retry limit after {0} attempts")]
    CasRetryExceeded(u32),
    /// A record could not be encoded for storage.
    #[error("record encoding failed: {0}")]
    Encode(String),
    /// Stored bytes could not be decoded into a record.
    #[error("record decoding failed: {0}")]
    Decode(String),
    /// Driver-specific failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

//─────────────────────────────
//  Storage backend traits
//─────────────────────────────

/// A byte key-value store with compare-and-swap.
///
/// Reads MAY be eventually consistent: a successful write is not required
/// to be immediately visible to another node. Callers that know a key was
/// recently written bridge the gap with [`get_with_retry`]. The conditional
/// operations, however, must be genuinely atomic — they are what the whole
/// coordination protocol hangs on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether a record exists. Inherently racy; use with care.
    async fn has(&self, key: &MemKey) -> Result<bool, StoreError>;

    /// Reads a record, failing with [`StoreError::NotFound`] if absent.
    async fn get(&self, key: &MemKey) -> Result<Vec<u8>, StoreError>;

    /// Writes a record unconditionally. Last writer wins.
    async fn set(&self, key: &MemKey, value: &[u8]) -> Result<(), StoreError>;

    /// Deletes a record. Deleting an absent key is not an error.
    async fn delete(&self, key: &MemKey) -> Result<(), StoreError>;

    /// Writes a record only if the key is currently absent; otherwise fails
    /// with [`StoreError::CompareMismatch`].
    async fn set_new_value(&self, key: &MemKey, value: &[u8]) -> Result<(), StoreError>;

    /// Replaces the record iff the current bytes equal `expected`.
    async fn compare_and_set(
        &self,
        key: &MemKey,
        value: &[u8],
        expected: &[u8],
    ) -> Result<(), StoreError>;

    /// Deletes the record iff the current bytes equal `expected`.
    async fn compare_and_delete(&self, key: &MemKey, expected: &[u8]) -> Result<(), StoreError>;
}

/// A best-effort store for lightweight, non-critical counters.
///
/// Values may expire or reset at any time, and no cross-node consistency is
/// required. Nothing correctness-critical may live here: the worst case of
/// lost data is duplicated work or a late spawn-limit trip.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Atomically increments the counter at `key` by one and returns the
    /// new value.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;
}

//─────────────────────────────
//  Eventual-consistency retry
//─────────────────────────────

const GET_RETRY_MAX: u32 = 4;
const GET_RETRY_BASE_MS: u64 = 25;
const GET_RETRY_FACTOR: u64 = 2;
const GET_RETRY_CAP_MS: u64 = 300;

/// Reads a key that is known to have been recently written, retrying
/// `NotFound` with bounded exponential backoff (25 ms base, factor 2,
/// capped at 300 ms, 4 retries).
///
/// This exists for eventually consistent stores where an immediate
/// read-after-write can observe a stale miss. Records here are immutable
/// once written, so a miss on a known-written key is always staleness,
/// never deletion.
pub async fn get_with_retry(store: &dyn Store, key: &MemKey) -> Result<Vec<u8>, StoreError> {
    let mut retries: u32 = 0;
    loop {
        match store.get(key).await {
            Err(StoreError::NotFound(missing)) if retries < GET_RETRY_MAX => {
                retries += 1;
                let delay_ms =
                    (GET_RETRY_BASE_MS * GET_RETRY_FACTOR.pow(retries)).min(GET_RETRY_CAP_MS);
                tracing::warn!(
                    key = %missing,
                    attempt = retries,
                    delay_ms,
                    "read-after-write miss, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            other => return other,
        }
    }
}
