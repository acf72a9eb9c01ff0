#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-types** – Shared primitive data structures for whirr.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the identities that travel between workers: the [`Call`] record,
//! the queue message body, and the return address linking a child result back
//! to a waiting parent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced while parsing or building whirr wire primitives.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A return address did not contain at least two `/` separators.
    #[error("malformed return address: {0:?}")]
    MalformedAddress(String),
    /// A queue message body was not of the form `root_id/call_hash`.
    #[error("malformed job message: {0:?}")]
    MalformedMessage(String),
    /// Positional or named arguments could not be converted.
    #[error("bad task arguments: {0}")]
    BadArguments(#[source] serde_json::Error),
    /// A positional argument index or keyword was absent.
    #[error("missing task argument: {0}")]
    MissingArgument(String),
}

//─────────────────────────────
//  Calls
//─────────────────────────────

/// A task invocation, pinned to its codec-assigned identity.
///
/// The `call_hash` is deterministic over the logical `(task_name, args,
/// kwargs)` triple and restricted to printable US-ASCII, because it is
/// embedded verbatim in queue message bodies and return addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Registered handler name this call dispatches to.
    pub task_name: String,
    /// Opaque codec-produced argument bytes.
    pub payload: Vec<u8>,
    /// Deterministic identity of the logical call.
    pub call_hash: String,
}

/// A child call a handler could not complete without.
///
/// `topic` overrides the scheduling topic; `None` means the child runs on
/// the same topic as the deferring worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredCall {
    /// Target topic, or `None` for the worker's own topic.
    pub topic: Option<String>,
    /// The child call itself.
    pub call: Call,
}

impl DeferredCall {
    /// A deferred call on the worker's own topic.
    pub fn local(call: Call) -> Self {
        Self { topic: None, call }
    }

    /// A deferred call pinned to a specific topic.
    pub fn on_topic(topic: impl Into<String>, call: Call) -> Self {
        Self {
            topic: Some(topic.into()),
            call,
        }
    }
}

//─────────────────────────────
//  Task arguments
//─────────────────────────────

/// Language-neutral argument record for a task invocation.
///
/// Named arguments live in a [`BTreeMap`] so their insertion order can never
/// leak into any serialized representation: two logically equal inputs encode
/// to identical bytes, which is what keeps call hashing deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments, canonically ordered.
    pub kwargs: BTreeMap<String, Value>,
}

impl TaskInput {
    /// An empty argument list.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a positional-only input from anything that serializes to a
    /// JSON array (tuples and vectors do).
    pub fn positional<A: Serialize>(args: A) -> Result<Self, ProtocolError> {
        let value = serde_json::to_value(args).map_err(ProtocolError::BadArguments)?;
        let args = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(Self {
            args,
            kwargs: BTreeMap::new(),
        })
    }

    /// Adds a named argument.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Extracts and converts the positional argument at `idx`.
    pub fn arg<T: for<'de> Deserialize<'de>>(&self, idx: usize) -> Result<T, ProtocolError> {
        let value = self
            .args
            .get(idx)
            .ok_or_else(|| ProtocolError::MissingArgument(format!("positional #{idx}")))?;
        serde_json::from_value(value.clone()).map_err(ProtocolError::BadArguments)
    }

    /// Extracts and converts the named argument `name`.
    pub fn kwarg<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<T, ProtocolError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| ProtocolError::MissingArgument(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(ProtocolError::BadArguments)
    }
}

//─────────────────────────────
//  Queue message body
//─────────────────────────────

/// The body of a queue message: `root_id/call_hash`.
///
/// `root_id` never contains `/` (it is unpadded url-safe base64), so the
/// first separator splits unambiguously and the remainder is the hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    /// Workflow root this job belongs to.
    pub root_id: String,
    /// Identity of the call to execute.
    pub call_hash: String,
}

impl fmt::Display for JobMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root_id, self.call_hash)
    }
}

impl FromStr for JobMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (root_id, call_hash) = s
            .split_once('/')
            .ok_or_else(|| ProtocolError::MalformedMessage(s.to_string()))?;
        if root_id.is_empty() || call_hash.is_empty() {
            return Err(ProtocolError::MalformedMessage(s.to_string()));
        }
        Ok(Self {
            root_id: root_id.to_string(),
            call_hash: call_hash.to_string(),
        })
    }
}

//─────────────────────────────
//  Return addresses
//─────────────────────────────

/// Address of a parent awaiting a child result: `root_id/parent_call_hash/topic`.
///
/// The topic is placed last because it is the only field allowed to contain
/// `/`; parsing splits on the first two separators only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReturnAddress {
    /// Workflow root the parent was running under.
    pub root_id: String,
    /// Identity of the awaiting parent call.
    pub parent_hash: String,
    /// Topic the resumption message must be enqueued on.
    pub topic: String,
}

impl ReturnAddress {
    /// Builds a return address.
    pub fn new(
        root_id: impl Into<String>,
        parent_hash: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            root_id: root_id.into(),
            parent_hash: parent_hash.into(),
            topic: topic.into(),
        }
    }

    /// True when `self` retries the same logical wait as `other` under a
    /// different workflow root: same parent, same topic, different root.
    ///
    /// This is the narrow exception that forces a child to be re-scheduled
    /// even though a pending-returns record already exists, so retried
    /// roots do not starve behind a lost in-flight message.
    pub fn is_repeat_of(&self, other: &ReturnAddress) -> bool {
        self.root_id != other.root_id
            && self.parent_hash == other.parent_hash
            && self.topic == other.topic
    }
}

impl fmt::Display for ReturnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.root_id, self.parent_hash, self.topic)
    }
}

impl FromStr for ReturnAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(root), Some(parent), Some(topic)) if !root.is_empty() && !parent.is_empty() => {
                Ok(Self::new(root, parent, topic))
            }
            _ => Err(ProtocolError::MalformedAddress(s.to_string())),
        }
    }
}

//─────────────────────────────
//  Root identifiers
//─────────────────────────────

/// Generates a fresh workflow root identifier.
///
/// Unpadded url-safe base64 of the 16 raw bytes of a v4 UUID: compact,
/// ASCII, and guaranteed free of `/` so it can lead a message body.
pub fn new_root_id() -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_message_round_trip() {
        let msg = JobMessage {
            root_id: "r00t".into(),
            call_hash: "abc123".into(),
        };
        let parsed: JobMessage = msg.to_string().parse().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn job_message_rejects_missing_separator() {
        assert!("justahash".parse::<JobMessage>().is_err());
    }

    #[test]
    fn return_address_three_fields() {
        let addr: ReturnAddress = "a/b/c".parse().unwrap();
        assert_eq!(addr, ReturnAddress::new("a", "b", "c"));
    }

    #[test]
    fn return_address_topic_keeps_extra_separators() {
        let addr: ReturnAddress = "a/b/c/d".parse().unwrap();
        assert_eq!(addr, ReturnAddress::new("a", "b", "c/d"));
    }

    #[test]
    fn return_address_rejects_short_forms() {
        assert!("a/b".parse::<ReturnAddress>().is_err());
        assert!("nope".parse::<ReturnAddress>().is_err());
    }

    #[test]
    fn repeat_detection_requires_same_parent_and_topic() {
        let a = ReturnAddress::new("root1", "parent", "topic");
        let b = ReturnAddress::new("root2", "parent", "topic");
        let c = ReturnAddress::new("root2", "other", "topic");
        let d = ReturnAddress::new("root2", "parent", "elsewhere");
        assert!(b.is_repeat_of(&a));
        assert!(!a.is_repeat_of(&a));
        assert!(!c.is_repeat_of(&a));
        assert!(!d.is_repeat_of(&a));
    }

    #[test]
    fn root_ids_are_fresh_and_slash_free() {
        let a = new_root_id();
        let b = new_root_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
        assert!(!a.contains('/'));
        assert!(!a.contains('='));
    }

    #[test]
    fn task_input_positional_from_tuple() {
        let input = TaskInput::positional((3, "x")).unwrap();
        assert_eq!(input.args.len(), 2);
        assert_eq!(input.arg::<i64>(0).unwrap(), 3);
        assert_eq!(input.arg::<String>(1).unwrap(), "x");
        assert!(input.arg::<i64>(2).is_err());
    }

    #[test]
    fn task_input_kwargs_are_canonically_ordered() {
        let a = TaskInput::empty()
            .with_kwarg("zebra", Value::from(1))
            .with_kwarg("aardvark", Value::from(2));
        let b = TaskInput::empty()
            .with_kwarg("aardvark", Value::from(2))
            .with_kwarg("zebra", Value::from(1));
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }
}
