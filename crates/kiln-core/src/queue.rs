//! In-process task-queue runtime.
//!
//! Named logical queues (conversion, pipeline, probe, video, video_asr,
//! video_vision, meta, llm, vector, es_index, es_search) are each consumed by
//! a pool of tokio workers. Handlers are async functions registered by task
//! name before [`TaskBroker::start`]; the registry is append-only and
//! immutable once the pools are running. Results land in an in-memory result
//! backend keyed by task id, and callers join them with an explicit timeout.
//!
//! A worker may dispatch onto *another* queue and await the result (the
//! pipeline orchestrator waits on probe tasks, the video pipeline waits on
//! ASR and vision tasks); nested waits are ordinary awaits here. Timeouts are
//! reported to the waiter but never revoke the running task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{KilnError, Result};
use crate::metrics;

/// Terminal and non-terminal task states, mirrored by the polling API as
/// `PENDING`, `SUCCESS`, `FAILURE`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Success(Value),
    Failure(String),
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Success(_) => "SUCCESS",
            TaskState::Failure(_) => "FAILURE",
        }
    }
}

struct TaskRequest {
    id: String,
    name: String,
    payload: Value,
}

/// Boxed future returned by task handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'static>>;

/// A task handler: receives a broker handle (for cross-queue dispatch) and
/// the JSON payload.
pub type TaskHandler = Arc<dyn Fn(TaskBroker, Value) -> HandlerFuture + Send + Sync>;

/// Adapt an async fn into a [`TaskHandler`].
pub fn handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(TaskBroker, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |broker, payload| Box::pin(f(broker, payload)))
}

struct QueueChannel {
    sender: mpsc::Sender<TaskRequest>,
}

struct BrokerInner {
    registry: RwLock<HashMap<(String, String), TaskHandler>>,
    queues: RwLock<HashMap<String, QueueChannel>>,
    results: Mutex<HashMap<String, watch::Sender<TaskState>>>,
    started: RwLock<bool>,
    task_time_limit: Duration,
    workers_per_queue: usize,
    prefetch_multiplier: usize,
}

/// Cheaply cloneable handle to the queue runtime.
#[derive(Clone)]
pub struct TaskBroker {
    inner: Arc<BrokerInner>,
}

impl TaskBroker {
    pub fn new(workers_per_queue: usize, prefetch_multiplier: usize, task_time_limit: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
                started: RwLock::new(false),
                task_time_limit,
                workers_per_queue: workers_per_queue.max(1),
                prefetch_multiplier: prefetch_multiplier.max(1),
            }),
        }
    }

    /// Register a task handler on a queue. Fails after [`TaskBroker::start`];
    /// the registry is immutable once workers run.
    pub fn register(&self, queue: &str, task_name: &str, task: TaskHandler) -> Result<()> {
        if *self.inner.started.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(KilnError::Other(
                "Task registration is closed once the broker has started".into(),
            ));
        }
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let key = (queue.to_string(), task_name.to_string());
        if registry.contains_key(&key) {
            return Err(KilnError::Other(format!(
                "Task {task_name} already registered on queue {queue}"
            )));
        }
        registry.insert(key, task);
        Ok(())
    }

    /// Spawn a worker pool for every queue with at least one registered task.
    pub fn start(&self) {
        {
            let mut started = self
                .inner
                .started
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if *started {
                return;
            }
            *started = true;
        }

        let queue_names: Vec<String> = {
            let registry = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
            let mut names: Vec<String> = registry.keys().map(|(q, _)| q.clone()).collect();
            names.sort();
            names.dedup();
            names
        };

        for queue in queue_names {
            let workers = self.inner.workers_per_queue;
            let capacity = workers * self.inner.prefetch_multiplier;
            let (tx, rx) = mpsc::channel::<TaskRequest>(capacity.max(1));
            let rx = Arc::new(tokio::sync::Mutex::new(rx));

            for worker_idx in 0..workers {
                let broker = self.clone();
                let queue = queue.clone();
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let request = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        let Some(request) = request else {
                            break;
                        };
                        broker.publish_depth(&queue);
                        broker.run_one(&queue, request).await;
                    }
                    debug!("Worker {worker_idx} on queue {queue} stopped");
                });
            }

            self.inner
                .queues
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(queue, QueueChannel { sender: tx });
        }
    }

    async fn run_one(&self, queue: &str, request: TaskRequest) {
        let task = {
            let registry = self.inner.registry.read().unwrap_or_else(|e| e.into_inner());
            registry
                .get(&(queue.to_string(), request.name.clone()))
                .cloned()
        };

        let state = match task {
            None => TaskState::Failure(format!(
                "No worker registered for task {} on queue {queue}",
                request.name
            )),
            Some(task) => {
                let broker = self.clone();
                let payload = request.payload.clone();
                // Run inside a spawned task so a panicking handler is
                // contained: workers never raise out to the broker.
                let join = tokio::spawn(async move { task(broker, payload).await });
                match tokio::time::timeout(self.inner.task_time_limit, join).await {
                    Err(_) => {
                        warn!("Task {} ({}) hit the queue time limit", request.id, request.name);
                        TaskState::Failure(format!(
                            "Task exceeded the {}s queue time limit",
                            self.inner.task_time_limit.as_secs()
                        ))
                    }
                    Ok(Err(join_err)) => {
                        error!("Task {} ({}) panicked: {join_err}", request.id, request.name);
                        TaskState::Failure(format!("Task panicked: {join_err}"))
                    }
                    Ok(Ok(Err(err))) => TaskState::Failure(err.to_string()),
                    Ok(Ok(Ok(value))) => TaskState::Success(value),
                }
            }
        };

        self.resolve(&request.id, state);
    }

    fn resolve(&self, task_id: &str, state: TaskState) {
        let results = self.inner.results.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = results.get(task_id) {
            // send_replace stores the terminal state even when nobody is
            // subscribed yet; pollers subscribe later.
            sender.send_replace(state);
        }
    }

    fn publish_depth(&self, queue: &str) {
        let queues = self.inner.queues.read().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = queues.get(queue) {
            let depth = channel.sender.max_capacity() - channel.sender.capacity();
            metrics::set_queue_depth(queue, depth as i64);
        }
    }

    /// Enqueue a task by name and return its task id.
    pub async fn dispatch(&self, queue: &str, task_name: &str, payload: Value) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        self.dispatch_with_id(queue, task_name, payload, task_id.clone())
            .await?;
        Ok(task_id)
    }

    /// Enqueue under a caller-chosen task id, so API consumers can correlate
    /// the queued job with artifacts keyed by the same id.
    pub async fn dispatch_with_id(
        &self,
        queue: &str,
        task_name: &str,
        payload: Value,
        task_id: String,
    ) -> Result<()> {
        let sender = {
            let queues = self.inner.queues.read().unwrap_or_else(|e| e.into_inner());
            queues.get(queue).map(|c| c.sender.clone())
        };
        let Some(sender) = sender else {
            return Err(KilnError::UnknownTask {
                queue: queue.to_string(),
                task_name: task_name.to_string(),
            });
        };

        {
            let (tx, _rx) = watch::channel(TaskState::Pending);
            self.inner
                .results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task_id.clone(), tx);
        }

        sender
            .send(TaskRequest {
                id: task_id.clone(),
                name: task_name.to_string(),
                payload,
            })
            .await
            .map_err(|_| KilnError::Other(format!("Queue {queue} is closed")))?;
        self.publish_depth(queue);
        Ok(())
    }

    /// Current state of a task, or `None` for an unknown id.
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        let results = self.inner.results.lock().unwrap_or_else(|e| e.into_inner());
        results.get(task_id).map(|tx| tx.borrow().clone())
    }

    /// Block on a task's terminal state with an explicit timeout. The task
    /// keeps running if the wait times out.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<Value> {
        let mut rx = {
            let results = self.inner.results.lock().unwrap_or_else(|e| e.into_inner());
            results
                .get(task_id)
                .map(|tx| tx.subscribe())
                .ok_or_else(|| KilnError::TaskNotFound(task_id.to_string()))?
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = rx.borrow().clone();
            match state {
                TaskState::Success(value) => return Ok(value),
                TaskState::Failure(message) => {
                    return Err(KilnError::TaskFailed {
                        task_id: task_id.to_string(),
                        message,
                    })
                }
                TaskState::Pending => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Err(_) => {
                    return Err(KilnError::WaitTimeout {
                        what: format!("task {task_id}"),
                        waited: timeout,
                    })
                }
                Ok(Err(_)) => {
                    return Err(KilnError::TaskFailed {
                        task_id: task_id.to_string(),
                        message: "Result channel closed".into(),
                    })
                }
                Ok(Ok(())) => {}
            }
        }
    }

    /// Dispatch and wait in one step.
    pub async fn call(
        &self,
        queue: &str,
        task_name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let task_id = self.dispatch(queue, task_name, payload).await?;
        self.wait(&task_id, timeout).await
    }

    /// Queues with registered workers, for health reporting.
    pub fn active_queues(&self) -> Vec<String> {
        let queues = self.inner.queues.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}
