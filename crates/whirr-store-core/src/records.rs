//! Wire records stored under `(kind, call_hash)` keys.
//!
//! The `call` and `pending_returns` records are bencoded: the dictionary
//! keys come out sorted and the byte representation is fully deterministic,
//! which matters because `pending_returns` bytes are used as the `expected`
//! operand of compare-and-swap. These records are not public whirr API, but
//! they *are* the wire protocol — every language binding has to produce the
//! same bytes.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;

use crate::StoreError;
use whirr_types::Call;

//─────────────────────────────
//  Call record
//─────────────────────────────

// Fields in lexicographic order; bencode dictionaries are key-sorted.
#[derive(Serialize, Deserialize)]
struct CallRecord {
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    #[serde(with = "serde_bytes")]
    task_name: Vec<u8>,
}

pub(crate) fn encode_call_record(call: &Call) -> Result<Vec<u8>, StoreError> {
    let record = CallRecord {
        payload: call.payload.clone(),
        task_name: call.task_name.clone().into_bytes(),
    };
    serde_bencode::to_bytes(&record).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode_call_record(call_hash: &str, bytes: &[u8]) -> Result<Call, StoreError> {
    let record: CallRecord =
        serde_bencode::from_bytes(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
    let task_name = String::from_utf8(record.task_name)
        .map_err(|e| StoreError::Decode(format!("task name is not utf-8: {e}")))?;
    Ok(Call {
        task_name,
        payload: record.payload,
        call_hash: call_hash.to_string(),
    })
}

//─────────────────────────────
//  Pending returns
//─────────────────────────────

/// Set of parents waiting for a child call to complete.
///
/// The record's *existence* signals that somebody has already taken
/// responsibility for scheduling the child; the first writer therefore
/// enqueues the child job. This is the most race-sensitive data in the
/// system and every mutation goes through a CAS loop against the exact
/// observed bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingReturns {
    /// Unix time, in seconds, when the child was first scheduled.
    /// Purposefully coarse: this is for observing staleness, never for
    /// synchronization or ordering. Preserved on round-trip, not consumed.
    pub scheduled_at: Option<i64>,
    /// Return addresses of the awaiting parents.
    pub returns: BTreeSet<String>,
}

impl PendingReturns {
    /// A fresh, empty record stamped with the current time.
    pub fn scheduled_now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            scheduled_at: Some(now),
            returns: BTreeSet::new(),
        }
    }

    /// Encodes to canonical bencode; the return list is sorted.
    ///
    /// Built through the bencode value tree rather than a derived struct:
    /// `scheduled_at` is optional and bencode has no null, so the key is
    /// simply absent when unset.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut dict: HashMap<Vec<u8>, Value> = HashMap::new();
        dict.insert(
            b"returns".to_vec(),
            Value::List(
                self.returns
                    .iter()
                    .map(|addr| Value::Bytes(addr.clone().into_bytes()))
                    .collect(),
            ),
        );
        if let Some(ts) = self.scheduled_at {
            dict.insert(b"scheduled_at".to_vec(), Value::Int(ts));
        }
        serde_bencode::to_bytes(&Value::Dict(dict)).map_err(|e| StoreError::Encode(e.to_string()))
    }

    /// Decodes a stored record.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let decoded: Value =
            serde_bencode::from_bytes(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
        let Value::Dict(dict) = decoded else {
            return Err(StoreError::Decode("pending returns is not a dict".into()));
        };

        let mut returns = BTreeSet::new();
        match dict.get(b"returns".as_slice()) {
            Some(Value::List(items)) => {
                for item in items {
                    let Value::Bytes(raw) = item else {
                        return Err(StoreError::Decode("return address is not a string".into()));
                    };
                    let addr = String::from_utf8(raw.clone())
                        .map_err(|e| StoreError::Decode(format!("return address: {e}")))?;
                    returns.insert(addr);
                }
            }
            _ => return Err(StoreError::Decode("pending returns missing 'returns'".into())),
        }

        let scheduled_at = match dict.get(b"scheduled_at".as_slice()) {
            Some(Value::Int(ts)) => Some(*ts),
            None => None,
            Some(_) => {
                return Err(StoreError::Decode("'scheduled_at' is not an integer".into()));
            }
        };

        Ok(Self {
            scheduled_at,
            returns,
        })
    }
}
