//! Typed wrapper over a [`Store`] implementing whirr's coordination
//! protocol: call persistence, write-once values, and the race-safe
//! pending-returns linkage from a child result back to every waiting
//! parent.
//!
//! Beware race conditions here. Every line of the pending-returns paths
//! runs concurrently with other workers mutating the same record, and the
//! only synchronization primitive available is compare-and-swap against the
//! exact bytes previously observed.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::records::{decode_call_record, encode_call_record};
use crate::{MemKey, PendingReturns, Store, StoreError};
use whirr_types::{Call, ReturnAddress};

/// Hard cap on CAS retries. Exceeding it is a fatal error: it almost
/// certainly indicates a broken `compare_and_set` in the driver, not
/// genuine contention.
pub const CAS_RETRY_LIMIT: u32 = 100;

/// Re-runs `body` for as long as it reports
/// [`StoreError::CompareMismatch`], up to [`CAS_RETRY_LIMIT`] attempts.
///
/// `state` is threaded through by value so a body can accumulate progress
/// across retries (the fan-out path tracks which return addresses it has
/// already dispatched); the final state is handed back alongside the
/// result.
pub async fn with_cas<S, T, F, Fut>(mut state: S, mut body: F) -> Result<(S, T), StoreError>
where
    F: FnMut(S) -> Fut,
    Fut: Future<Output = (S, Result<T, StoreError>)>,
{
    let mut attempts: u32 = 0;
    loop {
        let (next, result) = body(state).await;
        state = next;
        match result {
            Err(StoreError::CompareMismatch) => {
                attempts += 1;
                if attempts >= CAS_RETRY_LIMIT {
                    return Err(StoreError::CasRetryExceeded(attempts));
                }
                debug!(attempts, "CAS mismatch, retrying");
            }
            Err(e) => return Err(e),
            Ok(value) => return Ok((state, value)),
        }
    }
}

async fn attempt_add(
    store: &dyn Store,
    key: &MemKey,
    new_return: &ReturnAddress,
) -> Result<bool, StoreError> {
    let mut should_schedule = false;
    debug!(%key, "looking for existing pending returns");
    let (mut record, observed) = match store.get(key).await {
        Ok(bytes) => (PendingReturns::decode(&bytes)?, bytes),
        Err(StoreError::NotFound(_)) => {
            let fresh = PendingReturns::scheduled_now();
            let bytes = fresh.encode()?;
            debug!(%key, "none found, creating");
            // Note the double CAS: creation itself is the claim to
            // schedule this child, and a lost race restarts the loop.
            store.set_new_value(key, &bytes).await?;
            should_schedule = true;
            (fresh, bytes)
        }
        Err(e) => return Err(e),
    };

    if !should_schedule {
        for existing in &record.returns {
            let addr: ReturnAddress = existing
                .parse()
                .map_err(|e| StoreError::Decode(format!("{e}")))?;
            if new_return.is_repeat_of(&addr) {
                should_schedule = true;
                break;
            }
        }
    }

    record.returns.insert(new_return.to_string());
    store
        .compare_and_set(key, &record.encode()?, &observed)
        .await?;
    Ok(should_schedule)
}

struct RemoveState<S> {
    handled: BTreeSet<String>,
    user: S,
}

/// Typed view of the store holding whirr's three record kinds.
#[derive(Clone)]
pub struct Memory {
    store: Arc<dyn Store>,
}

impl Memory {
    /// Wraps a byte store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The underlying byte store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Persists a call definition.
    ///
    /// Unconditional: overwriting an existing record with the same hash is
    /// safe under all races as long as the bytes decode to the same logical
    /// call, which the codec's determinism contract guarantees.
    pub async fn set_call(&self, call: &Call) -> Result<(), StoreError> {
        let bytes = encode_call_record(call)?;
        self.store.set(&MemKey::call(&call.call_hash), &bytes).await
    }

    /// Loads a call definition, bridging eventually consistent reads with
    /// a bounded backoff — the record is always written before any message
    /// that could cause someone to look for it.
    pub async fn get_call(&self, call_hash: &str) -> Result<Call, StoreError> {
        let key = MemKey::call(call_hash);
        let bytes = crate::get_with_retry(self.store.as_ref(), &key).await?;
        decode_call_record(call_hash, &bytes)
    }

    /// Inherently racy existence check for a memoized value. A `true` is
    /// trustworthy; a `false` may be stale by the time it returns.
    pub async fn has_value(&self, call_hash: &str) -> Result<bool, StoreError> {
        self.store.has(&MemKey::value(call_hash)).await
    }

    /// Reads the memoized value for a call.
    pub async fn get_value(&self, call_hash: &str) -> Result<Vec<u8>, StoreError> {
        self.store.get(&MemKey::value(call_hash)).await
    }

    /// Records a memoized value, failing with
    /// [`StoreError::CompareMismatch`] if one already exists. Workers treat
    /// that failure as success: another worker produced the same bytes
    /// first and the value is memoized exactly once.
    pub async fn set_value_new(&self, call_hash: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.store
            .set_new_value(&MemKey::value(call_hash), payload)
            .await
    }

    /// Registers a pending return address on a child call.
    ///
    /// The returned flag says whether the caller must schedule the child:
    /// `true` when this writer created the record (first known parent), or
    /// when an existing address matches the new one on `(parent, topic)`
    /// but differs on root — a repeated workflow root converging on the
    /// same child, whose in-flight message belongs to the *other* root.
    ///
    /// Note this is inherently racy: the moment this returns, another
    /// worker may read and clear the record. The new address is guaranteed
    /// visible to *some* worker, not necessarily to this one.
    pub async fn add_pending_return(
        &self,
        call_hash: &str,
        new_return: &ReturnAddress,
    ) -> Result<bool, StoreError> {
        let key = MemKey::pending_returns(call_hash);
        let store = self.store.as_ref();
        let key = &key;
        let (_, should_schedule) = with_cas((), move |state| async move {
            (state, attempt_add(store, key, new_return).await)
        })
        .await?;
        Ok(should_schedule)
    }

    /// Atomically drains and deletes the pending returns of a completed
    /// call, handing each batch of not-yet-handled addresses to `dispatch`.
    ///
    /// If the record is gone, a sibling execution raced us and already
    /// dispatched; `dispatch` still sees one empty batch. When the final
    /// `compare_and_delete` loses to a concurrent writer, the loop re-reads
    /// and dispatches only the newly added addresses — at-least-once across
    /// workers, no obvious duplicates within one loop. An error from
    /// `dispatch` aborts without deleting, so the record survives for a
    /// later pass.
    ///
    /// `state` folds through every `dispatch` invocation and is handed
    /// back on success, letting the caller accumulate non-fatal failures
    /// across CAS retries.
    pub async fn with_pending_returns_remove<S, E, F, Fut>(
        &self,
        call_hash: &str,
        state: S,
        dispatch: F,
    ) -> Result<S, E>
    where
        E: From<StoreError>,
        F: Fn(S, Vec<ReturnAddress>) -> Fut,
        Fut: Future<Output = (S, Result<(), E>)>,
    {
        let key = MemKey::pending_returns(call_hash);
        let store = self.store.as_ref();
        let key = &key;
        let dispatch = &dispatch;

        let outcome = with_cas(
            RemoveState {
                handled: BTreeSet::new(),
                user: state,
            },
            move |mut st: RemoveState<S>| async move {
                let observed = match store.get(key).await {
                    Ok(bytes) => bytes,
                    Err(StoreError::NotFound(_)) => {
                        // A sibling worker raced us and already dispatched
                        // the fan-out.
                        let (user, res) = dispatch(st.user, Vec::new()).await;
                        st.user = user;
                        return match res {
                            Ok(()) => (st, Ok(None)),
                            Err(e) => (st, Ok(Some(e))),
                        };
                    }
                    Err(e) => return (st, Err(e)),
                };
                let record = match PendingReturns::decode(&observed) {
                    Ok(record) => record,
                    Err(e) => return (st, Err(e)),
                };

                let mut to_handle = Vec::new();
                for raw in &record.returns {
                    if st.handled.contains(raw) {
                        continue;
                    }
                    match raw.parse::<ReturnAddress>() {
                        Ok(addr) => to_handle.push(addr),
                        Err(e) => return (st, Err(StoreError::Decode(format!("{e}")))),
                    }
                }
                debug!(%key, count = to_handle.len(), "handling pending returns");

                let (user, res) = dispatch(st.user, to_handle).await;
                st.user = user;
                if let Err(e) = res {
                    return (st, Ok(Some(e)));
                }
                st.handled.extend(record.returns.iter().cloned());

                match store.compare_and_delete(key, &observed).await {
                    Ok(()) => (st, Ok(None)),
                    Err(e) => (st, Err(e)),
                }
            },
        )
        .await
        .map_err(E::from)?;

        let (final_state, aborted) = outcome;
        match aborted {
            Some(e) => Err(e),
            None => Ok(final_state.user),
        }
    }
}

