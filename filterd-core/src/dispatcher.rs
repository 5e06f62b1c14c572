//! Keyed serial task dispatcher
//!
//! Tasks submitted under the same queue key run one at a time in submission order.
//! Tasks under different keys run concurrently on the shared worker pool. The only
//! shared state is the pair of maps below, guarded by one lock that is never held
//! while a task body executes.

use filterd_config::Dispatcher as DispatcherConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{self, Handle, Runtime};
use tracing::{debug, error, trace};

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Queue used by [`Dispatcher::submit_default`]
pub const DEFAULT_QUEUE: &str = "__DEFAULT__";

/// Error raised by a task body. Logged by the dispatcher and never returned to the
/// submitter.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

type Task = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Builds the worker pool dispatched tasks run on
///
/// Workers are spawned on demand up to `max_workers` and reclaimed after sitting idle
/// for `keep_alive` seconds.
pub struct WorkerPool;

impl WorkerPool {
    pub fn build(config: &DispatcherConfig) -> std::io::Result<Runtime> {
        runtime::Builder::new_multi_thread()
            .thread_name("filterd-worker")
            .max_blocking_threads(config.max_workers)
            .thread_keep_alive(Duration::from_secs(config.keep_alive))
            .enable_all()
            .build()
    }
}

/// Metrics for the dispatcher
struct DispatchMetrics {
    tasks_total: IntCounterVec,
    backlog: IntGauge,
}

impl DispatchMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let tasks_total = IntCounterVec::new(
            Opts::new(
                "filterd_dispatcher_tasks_total",
                "Total dispatched tasks by completion status",
            ),
            &["status"],
        )?;
        let backlog = IntGauge::new(
            "filterd_dispatcher_backlog",
            "Tasks waiting behind a running task of the same queue",
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(backlog.clone()))?;

        Ok(Self {
            tasks_total,
            backlog,
        })
    }
}

#[derive(Default)]
struct QueueState {
    /// Keys with a task on a worker
    running: HashSet<String>,
    /// Tasks waiting for their key, entries exist only while non-empty
    backlogs: HashMap<String, VecDeque<Task>>,
}

struct Shared {
    handle: Handle,
    state: Mutex<QueueState>,
    metrics: Option<DispatchMetrics>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Task bodies run outside the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Serializes tasks per queue key on a shared worker pool
///
/// Cloning is cheap and every clone dispatches into the same queues.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Creates a dispatcher running tasks on the blocking pool of `handle`
    pub fn new(handle: Handle) -> Self {
        Self::build(handle, None)
    }

    pub fn with_metrics(handle: Handle, registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = DispatchMetrics::new(registry)?;
        Ok(Self::build(handle, Some(metrics)))
    }

    fn build(handle: Handle, metrics: Option<DispatchMetrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                handle,
                state: Mutex::new(QueueState::default()),
                metrics,
            }),
        }
    }

    /// Submits a task to the default queue
    pub fn submit_default<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.submit(DEFAULT_QUEUE, task);
    }

    /// Submits a task to the named queue
    ///
    /// The task starts right away if no task of `queue` is running, otherwise it waits
    /// behind the tasks submitted before it.
    pub fn submit<F>(&self, queue: &str, task: F)
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        let task: Task = Box::new(task);
        let mut state = self.shared.state();

        if state.running.contains(queue) {
            state
                .backlogs
                .entry(queue.to_string())
                .or_default()
                .push_back(task);
            trace!(queue, "Task queued behind running task");
            if let Some(ref metrics) = self.shared.metrics {
                metrics.backlog.inc();
            }
            return;
        }

        state.running.insert(queue.to_string());
        self.spawn(queue.to_string(), task);
    }

    /// Discards the tasks waiting in the default queue
    pub fn clear_default_queue(&self) {
        self.clear_queue(DEFAULT_QUEUE);
    }

    /// Discards the tasks waiting in `queue`. A running task is not affected.
    pub fn clear_queue(&self, queue: &str) {
        let removed = self.shared.state().backlogs.remove(queue);
        if let Some(tasks) = removed {
            debug!(queue, discarded = tasks.len(), "Cleared task queue");
            if let Some(ref metrics) = self.shared.metrics {
                metrics.backlog.sub(tasks.len() as i64);
            }
        }
    }

    /// Number of tasks waiting in the default queue
    pub fn default_queue_length(&self) -> usize {
        self.queue_length(DEFAULT_QUEUE)
    }

    /// Number of tasks waiting in `queue`, not counting the running one
    pub fn queue_length(&self, queue: &str) -> usize {
        self.shared
            .state()
            .backlogs
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Whether a task of `queue` is currently on a worker
    pub fn is_running(&self, queue: &str) -> bool {
        self.shared.state().running.contains(queue)
    }

    /// Keys with a running task
    pub fn active_keys(&self) -> Vec<String> {
        self.shared.state().running.iter().cloned().collect()
    }

    /// Hands a task to a worker. The key must already be marked running.
    fn spawn(&self, queue: String, task: Task) {
        let dispatcher = self.clone();
        // Dropping the JoinHandle detaches the task; completion is tracked by on_finished.
        drop(self.shared.handle.spawn_blocking(move || {
            dispatcher.run(&queue, task);
            dispatcher.on_finished(&queue);
        }));
    }

    fn run(&self, queue: &str, task: Task) {
        let status = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => "success",
            Ok(Err(e)) => {
                error!(queue, error = %e, "Error occurred while processing dispatcher task");
                "failure"
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(queue, panic = message, "Dispatcher task panicked");
                "panic"
            }
        };

        if let Some(ref metrics) = self.shared.metrics {
            metrics.tasks_total.with_label_values(&[status]).inc();
        }
    }

    /// Starts the next task of `queue` or releases the key
    fn on_finished(&self, queue: &str) {
        let mut state = self.shared.state();

        let next = match state.backlogs.get_mut(queue) {
            Some(backlog) => {
                let next = backlog.pop_front();
                if backlog.is_empty() {
                    state.backlogs.remove(queue);
                }
                next
            }
            None => None,
        };

        match next {
            Some(task) => {
                if let Some(ref metrics) = self.shared.metrics {
                    metrics.backlog.dec();
                }
                // The key stays running, so a concurrent submit queues behind this task.
                self.spawn(queue.to_string(), task);
            }
            None => {
                state.running.remove(queue);
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Dispatcher")
            .field("running", &state.running.len())
            .field("queued", &state.backlogs.values().map(VecDeque::len).sum::<usize>())
            .finish()
    }
}
