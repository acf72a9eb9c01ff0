//! Handler registration.
//!
//! A worker owns one immutable [`TaskRegistry`] mapping task names to
//! handlers. Handlers receive the [`ActiveWorker`] context explicitly; any
//! decoration sugar for binding plain functions to names belongs to the
//! application layer, not the engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::worker::ActiveWorker;
use crate::{Eval, RuntimeError};
use whirr_types::TaskInput;

/// An asynchronous task handler.
///
/// A handler is re-executed from scratch every time one of its
/// dependencies completes, so it must be idempotent and must not rely on
/// how many times it runs. Returning [`Eval::Deferred`] abandons the pass:
/// nothing the handler did before deferring is kept.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one pass of the handler over the decoded arguments.
    async fn run(
        &self,
        wk: &ActiveWorker<'_>,
        input: TaskInput,
    ) -> Result<Eval<Value>, RuntimeError>;
}

/// Immutable name → handler table.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, rejecting duplicates.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(RuntimeError::DuplicateTask(name));
        }
        self.tasks.insert(name, handler);
        Ok(())
    }

    /// Looks up a handler by task name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.tasks.get(name).cloned()
    }

    /// Registered task names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl TaskHandler for Nop {
        async fn run(
            &self,
            _wk: &ActiveWorker<'_>,
            _input: TaskInput,
        ) -> Result<Eval<Value>, RuntimeError> {
            crate::done(())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register("foo", Arc::new(Nop)).unwrap();
        let err = registry.register("foo", Arc::new(Nop)).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateTask(name) if name == "foo"));
    }

    #[test]
    fn lookup_finds_registered_names_only() {
        let mut registry = TaskRegistry::new();
        registry.register("foo", Arc::new(Nop)).unwrap();
        assert!(registry.get("foo").is_some());
        assert!(registry.get("bar").is_none());
        assert_eq!(registry.len(), 1);
    }
}
