#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **whirr-queue** – Topic-addressed job bus abstraction for whirr.
//!
//! The [`Queue`] trait is the narrow contract whirr consumes from a message
//! broker: per-topic FIFO of short ASCII bodies, blocking receive, and two
//! out-of-band signals — *empty* (nothing arrived within the receiver's
//! block window) and *closed* (the topic will never produce again).
//! There are no receipts or acks; delivery is at-least-once and duplicate
//! deliveries are the worker protocol's problem, not the queue's.
//!
//! [`InMemoryQueue`] is the bundled driver: a closable in-process bus for
//! tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

//─────────────────────────────
//  Contract
//─────────────────────────────

/// A received queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message body, e.g. `root_id/call_hash`.
    pub body: String,
}

/// Observability snapshot of one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Messages currently waiting on the topic.
    pub num_messages: usize,
}

/// Errors and signals surfaced by queue drivers.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No message arrived within the receiver's block window.
    #[error("queue is empty")]
    Empty,
    /// The topic will never return another message.
    #[error("queue is closed")]
    Closed,
    /// Driver-specific failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Per-topic FIFO consumed by whirr workers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues a message body on `topic`.
    async fn put(&self, topic: &str, body: &str) -> Result<(), QueueError>;

    /// Receives the next message on `topic`, blocking up to a
    /// driver-configured interval. Fails with [`QueueError::Empty`] when
    /// the window elapses and [`QueueError::Closed`] when the topic is
    /// finished for good. Drivers without a configured window may block
    /// indefinitely and never report `Empty`.
    async fn get(&self, topic: &str) -> Result<Message, QueueError>;

    /// Reports how many messages are waiting on `topic`.
    async fn info(&self, topic: &str) -> Result<QueueInfo, QueueError>;
}

//─────────────────────────────
//  In-memory driver
//─────────────────────────────

#[derive(Default)]
struct QueueState {
    topics: HashMap<String, VecDeque<String>>,
    closing: bool,
}

/// In-process, closable queue.
///
/// Constructed with [`new`](InMemoryQueue::new), `get` parks until a
/// message arrives rather than signalling [`QueueError::Empty`], which
/// makes single-process tests deterministic;
/// [`with_recv_timeout`](InMemoryQueue::with_recv_timeout) bounds each
/// receive instead, reporting `Empty` once the window elapses. After
/// [`close`](InMemoryQueue::close), messages already enqueued (and any
/// enqueued afterwards, e.g. resumptions fanned out by a final handler)
/// are still delivered; receivers observe [`QueueError::Closed`] only once
/// their topic has drained.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    arrived: Arc<Notify>,
    drained: Arc<Notify>,
    recv_timeout: Option<Duration>,
}

impl InMemoryQueue {
    /// Creates an open queue with no topics whose receivers block until
    /// a message or a close arrives.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue whose receivers block at most `window` per
    /// receive before reporting [`QueueError::Empty`].
    pub fn with_recv_timeout(window: Duration) -> Self {
        Self {
            recv_timeout: Some(window),
            ..Self::default()
        }
    }

    /// Marks the queue as closing and wakes every parked receiver.
    /// Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closing = true;
        drop(state);
        self.arrived.notify_waiters();
        debug!("queue closing");
    }

    /// Whether [`close`](InMemoryQueue::close) has been called.
    pub async fn is_closing(&self) -> bool {
        self.state.lock().await.closing
    }

    /// Parks until a message can be popped from `topic` or the queue is
    /// both closing and drained.
    async fn next_message(&self, topic: &str) -> Result<Message, QueueError> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking state, so a put or
            // close landing in between is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(body) = state
                    .topics
                    .get_mut(topic)
                    .and_then(VecDeque::pop_front)
                {
                    drop(state);
                    self.drained.notify_waiters();
                    return Ok(Message { body });
                }
                if state.closing {
                    return Err(QueueError::Closed);
                }
            }
            notified.await;
        }
    }

    /// Waits until every topic has been fully drained.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if state.topics.values().all(VecDeque::is_empty) {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn put(&self, topic: &str, body: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(body.to_string());
        drop(state);
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Message, QueueError> {
        match self.recv_timeout {
            Some(window) => match tokio::time::timeout(window, self.next_message(topic)).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::Empty),
            },
            None => self.next_message(topic).await,
        }
    }

    async fn info(&self, topic: &str) -> Result<QueueInfo, QueueError> {
        let state = self.state.lock().await;
        let num_messages = state.topics.get(topic).map_or(0, VecDeque::len);
        Ok(QueueInfo { num_messages })
    }
}
