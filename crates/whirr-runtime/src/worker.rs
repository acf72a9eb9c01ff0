//! The worker loop, the scheduler API and the handler-facing facade.
//!
//! A worker is bound to one topic for *receiving*; the handlers it runs
//! may call tasks on any topic. Several loops may share one [`Worker`]
//! handle (and its store, cache and queue) by running [`Worker::run`] in
//! parallel tasks — there is no other shared in-process state.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{Eval, RuntimeConfig, RuntimeError, TaskRegistry};
use whirr_codec::{Codec, CodecError, JsonCodec};
use whirr_queue::{InMemoryQueue, Queue, QueueError};
use whirr_store_core::{Cache, Memory, Store, StoreError};
use whirr_store_memory::MemoryStore;
use whirr_types::{new_root_id, DeferredCall, JobMessage, ReturnAddress, TaskInput};

/// Cache key prefix for per-root spawn counters.
const SPAWN_COUNT_PREFIX: &str = "whirr_count";

//─────────────────────────────
//  Worker
//─────────────────────────────

/// A connection to the whirr fleet: schedules roots, reads memoized
/// values, and serves jobs.
pub struct Worker {
    memory: Memory,
    queue: Arc<dyn Queue>,
    cache: Arc<dyn Cache>,
    codec: Arc<dyn Codec>,
    tasks: TaskRegistry,
    config: RuntimeConfig,
}

impl Worker {
    /// Creates a worker over the given backends with default
    /// configuration.
    pub fn new(
        queue: Arc<dyn Queue>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        codec: Arc<dyn Codec>,
        tasks: TaskRegistry,
    ) -> Self {
        Self::with_config(queue, store, cache, codec, tasks, RuntimeConfig::default())
    }

    /// Creates a worker with explicit configuration.
    pub fn with_config(
        queue: Arc<dyn Queue>,
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        codec: Arc<dyn Codec>,
        tasks: TaskRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            memory: Memory::new(store),
            queue,
            cache,
            codec,
            tasks,
            config,
        }
    }

    /// Schedules a root workflow call on `topic`.
    ///
    /// A fresh root id is minted so retries of the same logical workflow
    /// stay distinguishable. If the call already has a memoized value this
    /// is a no-op.
    pub async fn schedule(
        &self,
        topic: &str,
        task_name: &str,
        input: &TaskInput,
    ) -> Result<(), RuntimeError> {
        let call = self.codec.encode_call(task_name, input)?;
        if self.memory.has_value(&call.call_hash).await? {
            debug!(task_name, call_hash = %call.call_hash, "already memoized, not scheduling");
            return Ok(());
        }
        self.memory.set_call(&call).await?;
        let root_id = new_root_id();
        self.put_job(topic, &call.call_hash, &root_id).await
    }

    /// Reads the memoized value of a call.
    ///
    /// Fails with [`StoreError::NotFound`] (wrapped) if the call has not
    /// completed anywhere yet.
    pub async fn read(&self, task_name: &str, input: &TaskInput) -> Result<Value, RuntimeError> {
        let call = self.codec.encode_call(task_name, input)?;
        let bytes = self.memory.get_value(&call.call_hash).await?;
        Ok(self.codec.decode_return(task_name, &bytes)?)
    }

    /// Reads and converts the memoized value of a call.
    pub async fn read_as<R: DeserializeOwned>(
        &self,
        task_name: &str,
        input: &TaskInput,
    ) -> Result<R, RuntimeError> {
        let value = self.read(task_name, input).await?;
        serde_json::from_value(value)
            .map_err(|source| CodecError::DecodeReturn {
                task: task_name.to_string(),
                source,
            })
            .map_err(RuntimeError::from)
    }

    /// Serves jobs from `topic` until the queue reports closed.
    ///
    /// *Empty* receive windows continue the loop; *closed* returns
    /// cleanly; every other error is fatal for this loop and the message
    /// being handled is lost — there is no ack or retry at this level,
    /// recovery is re-scheduling the root.
    pub async fn run(&self, topic: &str) -> Result<(), RuntimeError> {
        info!(topic, "worker listening");
        loop {
            let message = match self.queue.get(topic).await {
                Ok(message) => message,
                Err(QueueError::Empty) => {
                    debug!(topic, "receive window empty");
                    continue;
                }
                Err(QueueError::Closed) => {
                    info!(topic, "queue closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            debug!(topic, body = %message.body, "got message");
            self.handle_message(topic, &message.body).await?;
        }
    }

    /// Increments the root's spawn counter and enqueues
    /// `root_id/call_hash` on `topic`, aborting with
    /// [`RuntimeError::SpawnLimit`] once the counter passes the limit.
    ///
    /// The counter deliberately ignores the topic: the limit is a semantic
    /// check on the whole workflow, not a per-queue quota.
    async fn put_job(
        &self,
        topic: &str,
        call_hash: &str,
        root_id: &str,
    ) -> Result<(), RuntimeError> {
        let counter_key = format!("{SPAWN_COUNT_PREFIX}/{root_id}");
        if self.cache.incr(&counter_key).await? > self.config.spawn_limit {
            error!(
                root_id,
                call_hash,
                limit = self.config.spawn_limit,
                "spawn limit reached"
            );
            return Err(RuntimeError::SpawnLimit {
                limit: self.config.spawn_limit,
                root_id: root_id.to_string(),
                call_hash: call_hash.to_string(),
            });
        }
        let body = JobMessage {
            root_id: root_id.to_string(),
            call_hash: call_hash.to_string(),
        };
        self.queue.put(topic, &body.to_string()).await?;
        Ok(())
    }

    async fn handle_message(&self, my_topic: &str, body: &str) -> Result<(), RuntimeError> {
        let job: JobMessage = body.parse()?;
        let call = self.memory.get_call(&job.call_hash).await?;
        let handler = self
            .tasks
            .get(&call.task_name)
            .ok_or_else(|| RuntimeError::UnknownTask(call.task_name.clone()))?;
        let input = self.codec.decode_input(&call)?;

        debug!(topic = my_topic, call = %job, task = %call.task_name, "invoking");
        let wk = ActiveWorker {
            worker: self,
            topic: my_topic,
        };
        match handler.run(&wk, input).await? {
            Eval::Deferred(children) => {
                debug!(
                    call = %job,
                    task = %call.task_name,
                    missing = children.len(),
                    "deferring"
                );
                self.schedule_children(my_topic, &job, children).await
            }
            Eval::Ready(value) => {
                info!(topic = my_topic, call = %job, task = %call.task_name, "resolved");
                let encoded = self.codec.encode_return(&value)?;
                // Another worker may have won the race to write this
                // value; their bytes equal ours by codec determinism, so
                // first write wins and the rest are ignored.
                match self.memory.set_value_new(&job.call_hash, &encoded).await {
                    Ok(()) | Err(StoreError::CompareMismatch) => {}
                    Err(e) => return Err(e.into()),
                }
                self.fan_out_returns(&job.call_hash).await
            }
        }
    }

    /// Schedules every missing child of a deferred parent and links the
    /// parent as a pending return on each.
    ///
    /// Spawn-limit trips are collected so the remaining children are still
    /// dispatched (their records must exist for the workflow to ever be
    /// retried); the first one is raised after the batch.
    async fn schedule_children(
        &self,
        my_topic: &str,
        job: &JobMessage,
        children: Vec<DeferredCall>,
    ) -> Result<(), RuntimeError> {
        let mut spawn_err: Option<RuntimeError> = None;
        for child in children {
            match self.schedule_child(my_topic, job, &child).await {
                Ok(()) => {}
                Err(e) if e.is_spawn_limit() => {
                    spawn_err.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match spawn_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn schedule_child(
        &self,
        my_topic: &str,
        job: &JobMessage,
        child: &DeferredCall,
    ) -> Result<(), RuntimeError> {
        // The call record first: it is perennial, merely describes the
        // call, and is safe under all races. It can be read out by a
        // racing completion immediately — that worker will then call this
        // parent back, which is fine because the result does exist.
        self.memory.set_call(&child.call).await?;

        let child_topic = child.topic.as_deref().unwrap_or(my_topic);
        let return_addr = ReturnAddress::new(&job.root_id, &job.call_hash, my_topic);
        let should_schedule = self
            .memory
            .add_pending_return(&child.call.call_hash, &return_addr)
            .await?;
        if should_schedule {
            self.put_job(child_topic, &child.call.call_hash, &job.root_id)
                .await?;
        }
        Ok(())
    }

    /// Re-enqueues every parent linked to a completed call, then deletes
    /// the pending-returns record.
    ///
    /// Each return is retried in its original root context: topic, root
    /// and parent all come from the recorded address. Spawn-limit trips
    /// clear the return and are re-raised after the fan-out.
    async fn fan_out_returns(&self, call_hash: &str) -> Result<(), RuntimeError> {
        struct FanOut {
            spawn_err: Option<RuntimeError>,
        }

        let fan = self
            .memory
            .with_pending_returns_remove::<_, RuntimeError, _, _>(
                call_hash,
                FanOut { spawn_err: None },
                |mut fan, addrs| async move {
                    for addr in addrs {
                        match self
                            .put_job(&addr.topic, &addr.parent_hash, &addr.root_id)
                            .await
                        {
                            Ok(()) => {}
                            Err(e) if e.is_spawn_limit() => {
                                info!(parent = %addr, "spawn limit returning, clearing the return");
                                fan.spawn_err.get_or_insert(e);
                            }
                            Err(e) => return (fan, Err(e)),
                        }
                    }
                    (fan, Ok(()))
                },
            )
            .await?;

        match fan.spawn_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//─────────────────────────────
//  Handler-facing facade
//─────────────────────────────

/// The context a handler uses to call other tasks.
///
/// Passed explicitly into every handler invocation; it carries the worker
/// and the topic the current job arrived on, so nested calls resolve their
/// default topic correctly.
pub struct ActiveWorker<'w> {
    worker: &'w Worker,
    topic: &'w str,
}

impl<'w> ActiveWorker<'w> {
    /// The topic the current job was received on.
    pub fn topic(&self) -> &str {
        self.topic
    }

    /// Calls a task with positional arguments on the worker's own topic.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        task_name: &str,
        args: A,
    ) -> Result<Eval<R>, RuntimeError> {
        let input = TaskInput::positional(args)?;
        self.call_typed(None, task_name, &input).await
    }

    /// Calls a task with positional arguments on a specific topic.
    pub async fn call_on_topic<A: Serialize, R: DeserializeOwned>(
        &self,
        topic: &str,
        task_name: &str,
        args: A,
    ) -> Result<Eval<R>, RuntimeError> {
        let input = TaskInput::positional(args)?;
        self.call_typed(Some(topic), task_name, &input).await
    }

    /// Calls a task with a full argument record.
    ///
    /// Returns the decoded memoized value when it exists, or a deferral
    /// naming this call when it does not. The deferral is a value, not an
    /// error: return it (or feed it to [`gather`](crate::gather)) so the
    /// worker can schedule the child.
    pub async fn call_input(
        &self,
        topic: Option<&str>,
        task_name: &str,
        input: &TaskInput,
    ) -> Result<Eval<Value>, RuntimeError> {
        let worker = self.worker;
        let call = worker.codec.encode_call(task_name, input)?;
        match worker.memory.get_value(&call.call_hash).await {
            Ok(bytes) => {
                let value = worker.codec.decode_return(task_name, &bytes)?;
                Ok(Eval::Ready(value))
            }
            Err(StoreError::NotFound(_)) => Ok(Eval::Deferred(vec![DeferredCall {
                topic: topic.map(str::to_string),
                call,
            }])),
            Err(e) => Err(e.into()),
        }
    }

    async fn call_typed<R: DeserializeOwned>(
        &self,
        topic: Option<&str>,
        task_name: &str,
        input: &TaskInput,
    ) -> Result<Eval<R>, RuntimeError> {
        match self.call_input(topic, task_name, input).await? {
            Eval::Ready(value) => {
                let typed = serde_json::from_value(value).map_err(|source| {
                    CodecError::DecodeReturn {
                        task: task_name.to_string(),
                        source,
                    }
                })?;
                Ok(Eval::Ready(typed))
            }
            Eval::Deferred(calls) => Ok(Eval::Deferred(calls)),
        }
    }
}

//─────────────────────────────
//  Local runtime
//─────────────────────────────

/// Fully in-process wiring: in-memory store, cache and queue plus the
/// JSON codec. The shortest path to running a workflow in a test or on a
/// laptop.
pub struct LocalRuntime {
    topic: String,
    queue: Arc<InMemoryQueue>,
    worker: Worker,
}

impl LocalRuntime {
    /// Builds a local runtime serving `topic` with default configuration.
    pub fn new(topic: impl Into<String>, tasks: TaskRegistry) -> Self {
        Self::with_config(topic, tasks, RuntimeConfig::default())
    }

    /// Builds a local runtime with explicit configuration.
    pub fn with_config(
        topic: impl Into<String>,
        tasks: TaskRegistry,
        config: RuntimeConfig,
    ) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let worker = Worker::with_config(
            queue.clone(),
            store.clone(),
            store,
            Arc::new(JsonCodec::new()),
            tasks,
            config,
        );
        Self {
            topic: topic.into(),
            queue,
            worker,
        }
    }

    /// Handle on the underlying queue, e.g. to close it from a handler.
    pub fn queue(&self) -> Arc<InMemoryQueue> {
        self.queue.clone()
    }

    /// The wrapped worker.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Schedules a root call on the runtime's topic.
    pub async fn schedule(&self, task_name: &str, input: &TaskInput) -> Result<(), RuntimeError> {
        self.worker.schedule(&self.topic, task_name, input).await
    }

    /// Reads a memoized value.
    pub async fn read(&self, task_name: &str, input: &TaskInput) -> Result<Value, RuntimeError> {
        self.worker.read(task_name, input).await
    }

    /// Serves the runtime's topic until the queue closes.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        self.worker.run(&self.topic).await
    }
}
