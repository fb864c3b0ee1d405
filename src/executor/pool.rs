//! Adaptive Worker Pool
//!
//! A fixed-purpose thread pool that runs deferred cache commands off the I/O
//! path. The number of threads floats between a low and a high watermark:
//! the pool grows when tasks back up and idle workers above the low
//! watermark retire after `idle_time` without work.
//!
//! ## Lifecycle
//!
//! ```text
//!  NotStarted ──start()──> Running ──stop()──> Stopping ──last worker exits──> Stopped
//!                          │                   │
//!                          │ execute() ok      │ execute() rejected,
//!                          │                   │ queued tasks still drain
//! ```
//!
//! ## Synchronization
//!
//! One mutex guards the queue, the worker registry and the lifecycle. Two
//! condition variables hang off it: `task_available` (a task was queued or
//! the pool is stopping) and `all_exited` (the last worker left the
//! registry). Every worker owns an entry in the registry keyed by its id and
//! removes that entry itself, under the lock, on its way out.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// A unit of deferred work. Dropped after it runs, or when the pool is torn
/// down before it gets the chance.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Sizing and naming of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Used for thread names and log fields
    pub name: String,
    /// Workers kept alive while running, even when idle
    pub low_watermark: usize,
    /// Upper bound on the number of workers
    pub high_watermark: usize,
    /// Pending tasks accepted before `execute` starts rejecting
    pub max_queue_size: usize,
    /// How long an idle worker waits for a task before considering exit
    pub idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            low_watermark: 1,
            high_watermark: 4,
            max_queue_size: 64,
            idle_time: Duration::from_secs(1),
        }
    }
}

/// Where the pool is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    /// No new tasks are accepted; queued tasks still run
    Stopping,
    Stopped,
}

/// Errors reported by the worker pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is not running")]
    NotRunning,

    #[error("task queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("worker pool has already been started")]
    AlreadyStarted,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub lifecycle: Lifecycle,
    pub threads: usize,
    pub idle: usize,
    pub queued: usize,
    pub completed: u64,
    pub panicked: u64,
}

struct State {
    lifecycle: Lifecycle,
    queue: VecDeque<Task>,
    /// Live workers, each entry owned and removed by its worker
    workers: HashMap<usize, JoinHandle<()>>,
    /// Handles of workers that have left the registry
    retired: Vec<JoinHandle<()>>,
    /// Workers currently blocked waiting for a task
    idle: usize,
    next_id: usize,
    /// Live workers beyond which spawning fails
    #[cfg(test)]
    spawn_limit: Option<usize>,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    task_available: Condvar,
    all_exited: Condvar,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// A thread pool with watermark-based sizing and a bounded FIFO queue.
///
/// # Example
///
/// ```
/// use emberkv::executor::{PoolConfig, WorkerPool};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(PoolConfig::default()).unwrap();
/// pool.start().unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// pool.execute(move || tx.send(42).unwrap()).unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// pool.stop(true);
/// assert!(pool.execute(|| {}).is_err());
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool in the `NotStarted` state. No threads are spawned yet.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.high_watermark == 0 {
            return Err(PoolError::InvalidConfig(
                "high watermark must be at least 1".to_string(),
            ));
        }
        if config.low_watermark > config.high_watermark {
            return Err(PoolError::InvalidConfig(format!(
                "low watermark {} exceeds high watermark {}",
                config.low_watermark, config.high_watermark
            )));
        }
        if config.max_queue_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max queue size must be at least 1".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                lifecycle: Lifecycle::NotStarted,
                queue: VecDeque::new(),
                workers: HashMap::new(),
                retired: Vec::new(),
                idle: 0,
                next_id: 0,
                #[cfg(test)]
                spawn_limit: None,
            }),
            task_available: Condvar::new(),
            all_exited: Condvar::new(),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        Ok(Self { shared })
    }

    /// Moves the pool to `Running` and spawns `low_watermark` workers.
    ///
    /// If a worker cannot be spawned the pool is stopped again: workers
    /// already spawned exit and no task is accepted.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.shared.lock();
        if state.lifecycle != Lifecycle::NotStarted {
            return Err(PoolError::AlreadyStarted);
        }
        state.lifecycle = Lifecycle::Running;

        for _ in 0..self.shared.config.low_watermark {
            if let Err(e) = Shared::spawn_worker(&self.shared, &mut state) {
                error!(
                    pool = %self.shared.config.name,
                    spawned = state.workers.len(),
                    error = %e,
                    "Worker pool failed to start"
                );
                drop(state);
                self.stop(false);
                return Err(e);
            }
        }

        info!(
            pool = %self.shared.config.name,
            low = self.shared.config.low_watermark,
            high = self.shared.config.high_watermark,
            max_queue = self.shared.config.max_queue_size,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stops accepting tasks. Queued tasks still run to completion.
    ///
    /// With `await_termination` the call blocks until every worker has exited
    /// and the queue is empty. It must not be called that way from inside a
    /// task running on this pool.
    pub fn stop(&self, await_termination: bool) {
        let mut state = self.shared.lock();
        match state.lifecycle {
            Lifecycle::NotStarted => {
                state.lifecycle = Lifecycle::Stopped;
                return;
            }
            Lifecycle::Stopped => return,
            Lifecycle::Running => {
                state.lifecycle = Lifecycle::Stopping;
                info!(
                    pool = %self.shared.config.name,
                    threads = state.workers.len(),
                    queued = state.queue.len(),
                    "Worker pool stopping"
                );
            }
            Lifecycle::Stopping => {}
        }

        if state.workers.is_empty() {
            // Nobody left to drain the queue
            state.queue.clear();
            state.lifecycle = Lifecycle::Stopped;
        }
        self.shared.task_available.notify_all();

        if !await_termination {
            return;
        }

        while !(state.workers.is_empty() && state.queue.is_empty()) {
            state = self
                .shared
                .all_exited
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.lifecycle = Lifecycle::Stopped;
        let retired = std::mem::take(&mut state.retired);
        drop(state);

        for handle in retired {
            if handle.join().is_err() {
                warn!(pool = %self.shared.config.name, "Worker thread panicked outside a task");
            }
        }
        info!(pool = %self.shared.config.name, "Worker pool stopped");
    }

    /// Queues `task` for execution.
    ///
    /// Fails if the pool is not running or `max_queue_size` tasks are already
    /// pending. When the queue holds more tasks than there are idle workers
    /// and the pool is below its high watermark, one more worker is spawned.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.lifecycle != Lifecycle::Running {
            return Err(PoolError::NotRunning);
        }
        if state.queue.len() >= self.shared.config.max_queue_size {
            return Err(PoolError::QueueFull(state.queue.len()));
        }

        state.queue.push_back(Box::new(task));

        if state.queue.len() > state.idle
            && state.workers.len() < self.shared.config.high_watermark
        {
            // On failure the task stays queued for the existing workers
            if let Err(e) = Shared::spawn_worker(&self.shared, &mut state) {
                warn!(pool = %self.shared.config.name, error = %e, "Could not grow worker pool");
            }
        }
        trace!(
            pool = %self.shared.config.name,
            queued = state.queue.len(),
            threads = state.workers.len(),
            "Task queued"
        );

        drop(state);
        self.shared.task_available.notify_one();
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    /// Number of live worker threads.
    pub fn thread_count(&self) -> usize {
        self.shared.lock().workers.len()
    }

    /// Number of tasks waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            lifecycle: state.lifecycle,
            threads: state.workers.len(),
            idle: state.idle,
            queued: state.queue.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop(false);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a worker and registers its handle. Called with the lock held,
    /// so the new thread cannot look itself up before it is registered.
    fn spawn_worker(shared: &Arc<Shared>, state: &mut State) -> Result<(), PoolError> {
        state.retired.retain(|handle| !handle.is_finished());

        #[cfg(test)]
        if state.spawn_limit.is_some_and(|limit| state.workers.len() >= limit) {
            return Err(PoolError::Spawn("spawn limit reached".to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;

        let worker_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", shared.config.name, id))
            .spawn(move || worker_loop(worker_shared, id))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        state.workers.insert(id, handle);
        debug!(
            pool = %shared.config.name,
            worker = id,
            threads = state.workers.len(),
            "Worker spawned"
        );
        Ok(())
    }

    /// Blocks until a task is available or the worker should exit.
    ///
    /// Returns `None` once the worker has been removed from the registry.
    fn next_task(&self, id: usize) -> Option<Task> {
        let mut state = self.lock();

        loop {
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            if state.lifecycle != Lifecycle::Running {
                // Stopping and drained
                break;
            }

            state.idle += 1;
            let (guard, wait) = self
                .task_available
                .wait_timeout(state, self.config.idle_time)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.idle -= 1;

            if wait.timed_out()
                && state.queue.is_empty()
                && state.lifecycle == Lifecycle::Running
                && state.workers.len() > self.config.low_watermark
            {
                break;
            }
        }

        self.retire(&mut state, id);
        None
    }

    fn retire(&self, state: &mut State, id: usize) {
        if let Some(handle) = state.workers.remove(&id) {
            state.retired.push(handle);
        }
        debug!(
            pool = %self.config.name,
            worker = id,
            threads = state.workers.len(),
            "Worker exiting"
        );

        if state.workers.is_empty() && state.lifecycle == Lifecycle::Stopping {
            state.lifecycle = Lifecycle::Stopped;
            self.all_exited.notify_all();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    while let Some(task) = shared.next_task(id) {
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    pool = %shared.config.name,
                    worker = id,
                    panic = panic_message(payload.as_ref()),
                    "Task panicked"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
