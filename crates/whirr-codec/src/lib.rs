#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-codec** – Call encoding and hashing for whirr.
//!
//! A [`Codec`] turns a `(task_name, args, kwargs)` triple into a [`Call`]
//! with a deterministic `call_hash` and an opaque payload, and converts
//! return values to and from bytes. The hash *is* the memoization key, so
//! determinism is a hard contract, not a nicety: two logically equal calls
//! must hash identically on every node, in every language binding.
//!
//! The bundled [`JsonCodec`] is the default implementation; anything
//! implementing [`Codec`] can be plugged in instead, e.g. for
//! inter-language calling with a stricter schema.

use serde_json::Value;

use whirr_types::{Call, TaskInput};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced while encoding or decoding calls and return values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Task arguments could not be serialized into a payload.
    #[error("failed to encode arguments for task {task}: {source}")]
    EncodeArguments {
        /// Task being encoded.
        task: String,
        /// Underlying serializer error.
        #[source]
        source: serde_json::Error,
    },
    /// A stored payload could not be decoded back into arguments.
    #[error("failed to decode arguments for task {task}: {source}")]
    DecodeArguments {
        /// Task being decoded.
        task: String,
        /// Underlying deserializer error.
        #[source]
        source: serde_json::Error,
    },
    /// A return value could not be serialized.
    #[error("failed to encode return value: {0}")]
    EncodeReturn(#[source] serde_json::Error),
    /// Stored return bytes could not be decoded.
    #[error("failed to decode return value for task {task}: {source}")]
    DecodeReturn {
        /// Task whose value was being read.
        task: String,
        /// Underlying deserializer error.
        #[source]
        source: serde_json::Error,
    },
}

//─────────────────────────────
//  Codec trait
//─────────────────────────────

/// Serialization strategy for everything that passes through the store.
///
/// # Determinism contract
///
/// `encode_call` MUST be pure: the `call_hash` changes if and only if the
/// logical call changes, and insertion order of named arguments must not
/// matter. `encode_return` MUST likewise produce identical bytes for equal
/// values — when two workers race to memoize the same call, the loser's
/// write is silently discarded on the assumption that both produced the
/// same bytes. A non-deterministic codec voids memoization entirely.
pub trait Codec: Send + Sync {
    /// Encodes a task invocation into a [`Call`] with its identity hash.
    fn encode_call(&self, task_name: &str, input: &TaskInput) -> Result<Call, CodecError>;

    /// Decodes a call's payload back into its arguments.
    fn decode_input(&self, call: &Call) -> Result<TaskInput, CodecError>;

    /// Serializes a handler's return value.
    fn encode_return(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decodes stored return bytes. `task_name` is advisory, for error
    /// context and schema-aware implementations.
    fn decode_return(&self, task_name: &str, payload: &[u8]) -> Result<Value, CodecError>;
}

//─────────────────────────────
//  Default JSON codec
//─────────────────────────────

/// Canonical-JSON codec.
///
/// Payloads are `serde_json` bytes of [`TaskInput`]; named arguments live
/// in a `BTreeMap`, so key order is canonical by construction and the
/// bytes are deterministic. The call hash is hex blake3 over the
/// length-prefixed task name followed by the payload, which keeps
/// `("ab", "c")` and `("a", "bc")` distinct.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }

    fn hash(task_name: &str, payload: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(task_name.len() as u64).to_le_bytes());
        hasher.update(task_name.as_bytes());
        hasher.update(payload);
        hasher.finalize().to_hex().to_string()
    }
}

impl Codec for JsonCodec {
    fn encode_call(&self, task_name: &str, input: &TaskInput) -> Result<Call, CodecError> {
        let payload = serde_json::to_vec(input).map_err(|source| CodecError::EncodeArguments {
            task: task_name.to_string(),
            source,
        })?;
        let call_hash = Self::hash(task_name, &payload);
        Ok(Call {
            task_name: task_name.to_string(),
            payload,
            call_hash,
        })
    }

    fn decode_input(&self, call: &Call) -> Result<TaskInput, CodecError> {
        serde_json::from_slice(&call.payload).map_err(|source| CodecError::DecodeArguments {
            task: call.task_name.clone(),
            source,
        })
    }

    fn encode_return(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::EncodeReturn)
    }

    fn decode_return(&self, task_name: &str, payload: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::DecodeReturn {
            task: task_name.to_string(),
            source,
        })
    }
}
