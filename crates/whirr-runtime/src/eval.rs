//! The tagged-sum control flow of a handler pass.
//!
//! Calling a task either yields its memoized value or the list of calls
//! that must complete first. [`gather`] merges any number of such results
//! so one handler pass discovers *all* of its missing children at once,
//! instead of paying one scheduling round trip per child.

use serde::Serialize;
use serde_json::Value;

use crate::RuntimeError;
use whirr_codec::CodecError;
use whirr_types::DeferredCall;

/// Result of evaluating a task call from inside a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Eval<T> {
    /// The value was already memoized (or just computed).
    Ready(T),
    /// The listed calls must complete before this one can; the current
    /// handler pass is abandoned and none of its effects are kept.
    Deferred(Vec<DeferredCall>),
}

impl<T> Eval<T> {
    /// Whether a value is available.
    pub fn is_ready(&self) -> bool {
        matches!(self, Eval::Ready(_))
    }

    /// Transforms a ready value, passing deferrals through.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Eval<U> {
        match self {
            Eval::Ready(value) => Eval::Ready(f(value)),
            Eval::Deferred(calls) => Eval::Deferred(calls),
        }
    }
}

impl<T: Serialize> Eval<T> {
    /// Converts into handler-output form, serializing a ready value.
    pub fn into_output(self) -> Result<Eval<Value>, RuntimeError> {
        match self {
            Eval::Ready(value) => done(value),
            Eval::Deferred(calls) => Ok(Eval::Deferred(calls)),
        }
    }
}

/// A completed handler pass with the given return value.
pub fn done<T: Serialize>(value: T) -> Result<Eval<Value>, RuntimeError> {
    let value = serde_json::to_value(value).map_err(CodecError::EncodeReturn)?;
    Ok(Eval::Ready(value))
}

/// Combines sibling evaluations into one.
///
/// If every sibling is ready, yields their values in positional order.
/// Otherwise yields a single deferral carrying every missing call, in
/// input order. The relative completion order of siblings is not
/// observable from a handler and must not be relied upon.
pub fn gather<T>(evals: impl IntoIterator<Item = Eval<T>>) -> Eval<Vec<T>> {
    let mut values = Vec::new();
    let mut missing = Vec::new();
    for eval in evals {
        match eval {
            Eval::Ready(value) => values.push(value),
            Eval::Deferred(calls) => missing.extend(calls),
        }
    }
    if missing.is_empty() {
        Eval::Ready(values)
    } else {
        Eval::Deferred(missing)
    }
}

/// Unwraps a ready value or returns the deferral from the enclosing
/// function.
///
/// The handler-side analogue of [`std::task::ready!`]: keeps the happy
/// path linear while deferrals short-circuit.
#[macro_export]
macro_rules! ready {
    ($eval:expr) => {
        match $eval {
            $crate::Eval::Ready(value) => value,
            $crate::Eval::Deferred(calls) => return Ok($crate::Eval::Deferred(calls)),
        }
    };
}
