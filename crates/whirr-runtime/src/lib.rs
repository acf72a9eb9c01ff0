#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-runtime** – The re-entrant evaluator at the heart of whirr.
//!
//! A [`Worker`] dequeues jobs from one topic, loads the call, runs the
//! registered handler and reacts to the outcome: a ready value is memoized
//! and every waiting parent is re-enqueued; a deferral schedules the
//! missing children and links this call as a pending return on each of
//! them. Handlers reach back into the engine through an explicit
//! [`ActiveWorker`] context — [`ActiveWorker::call`] either returns the
//! memoized child value or reports the child as missing, and [`gather`]
//! batches any number of missing children into one combined deferral.
//!
//! Deferrals are ordinary values ([`Eval::Deferred`]), not errors or
//! panics: a handler pass that cannot complete simply evaluates to the
//! list of calls it still needs. All work the pass did is discarded; the
//! handler will run again from scratch once a dependency lands, which is
//! why handlers must be idempotent.

use whirr_codec::CodecError;
use whirr_queue::QueueError;
use whirr_store_core::StoreError;
use whirr_types::ProtocolError;

mod eval;
mod task;
mod worker;

pub use eval::{done, gather, Eval};
pub use task::{TaskHandler, TaskRegistry};
pub use worker::{ActiveWorker, LocalRuntime, Worker};

pub use whirr_types::{Call, DeferredCall, TaskInput};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Maximum jobs enqueued per workflow root.
///
/// Hard-coded and not meant to ever be hit: this is a semantic safety net
/// against infinite recursion and non-idempotent call graphs producing
/// ever-new hashes, not a runtime quota.
pub const SPAWN_LIMIT: u64 = 10_000;

/// Tunables for a [`Worker`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Per-root spawn limit. Defaults to [`SPAWN_LIMIT`]; overriding it
    /// downwards is mainly useful for exercising the failure path in
    /// tests.
    pub spawn_limit: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spawn_limit: SPAWN_LIMIT,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A workflow root exceeded its spawn limit. Raised out of
    /// [`Worker::run`] so the operator's fleet monitoring sees it; whether
    /// to crash or swallow and continue is the caller's call.
    #[error("spawn limit {limit} reached for {root_id} at job {call_hash}")]
    SpawnLimit {
        /// The configured limit.
        limit: u64,
        /// Root whose counter tripped.
        root_id: String,
        /// Job that could not be enqueued.
        call_hash: String,
    },
    /// A message referenced a task name with no registered handler.
    #[error("unknown task: {0}")]
    UnknownTask(String),
    /// Two handlers were registered under one name.
    #[error("task {0} is already registered")]
    DuplicateTask(String),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Codec failure; fatal for the message being handled.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Malformed message body or return address.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A handler failed. The message is lost; recovery is re-scheduling
    /// the root.
    #[error("task failed: {0}")]
    Task(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Whether this is a spawn-limit trip.
    pub fn is_spawn_limit(&self) -> bool {
        matches!(self, RuntimeError::SpawnLimit { .. })
    }
}
