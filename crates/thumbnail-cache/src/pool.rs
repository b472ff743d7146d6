//! Bounded worker pool with a two-level priority queue
//!
//! Jobs are boxed closures executed on a fixed set of named threads.
//! Priority jobs are always taken before normal ones. A counting semaphore
//! caps how many jobs run at once independently of the thread count; a
//! worker that cannot get a permit in time puts its job back instead of
//! blocking. Panicking jobs are caught at the worker boundary so a bad
//! input never shrinks the pool.

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of work accepted by the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue entry tagged with its scheduling class
enum Task {
    Priority(Job),
    Normal(Job),
}

impl Task {
    fn new(job: Job, priority: bool) -> Self {
        if priority {
            Task::Priority(job)
        } else {
            Task::Normal(job)
        }
    }

    fn class(&self) -> &'static str {
        match self {
            Task::Priority(_) => "priority",
            Task::Normal(_) => "normal",
        }
    }

    fn into_job(self) -> Job {
        match self {
            Task::Priority(job) | Task::Normal(job) => job,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix, also used in log output
    pub name: String,
    pub workers: usize,
    /// Semaphore size; how many jobs may execute at the same time
    pub max_in_flight: usize,
    /// Longest an idle worker sleeps before re-checking the queues
    pub poll_interval: Duration,
    /// How long a worker waits for a permit before re-queueing its job
    pub acquire_timeout: Duration,
    /// Upper bound on how long `shutdown` waits for workers to exit
    pub join_timeout: Duration,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            name: name.into(),
            workers,
            max_in_flight: workers * 2,
            poll_interval: Duration::from_millis(50),
            acquire_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new("worker", 4)
    }
}

#[derive(Default)]
struct Queues {
    priority: VecDeque<Job>,
    normal: VecDeque<Job>,
}

impl Queues {
    fn pop(&mut self) -> Option<Task> {
        if let Some(job) = self.priority.pop_front() {
            return Some(Task::Priority(job));
        }
        self.normal.pop_front().map(Task::Normal)
    }

    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }
}

/// Counting semaphore with timed acquisition
struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    fn acquire_timeout(&self, timeout: Duration) -> Option<Permit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.released.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return None;
            }
        }
        *permits -= 1;
        Some(Permit { semaphore: self })
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.semaphore.permits.lock() += 1;
        self.semaphore.released.notify_one();
    }
}

struct Shared {
    config: PoolConfig,
    queues: Mutex<Queues>,
    work_available: Condvar,
    stop: AtomicBool,
    permits: Semaphore,
    in_flight: AtomicUsize,
    live_workers: Mutex<usize>,
    worker_exited: Condvar,
}

impl Shared {
    /// Take the next task, waiting at most one poll interval when idle
    fn next_task(&self) -> Option<Task> {
        let mut queues = self.queues.lock();
        if let Some(task) = queues.pop() {
            return Some(task);
        }
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        self.work_available
            .wait_for(&mut queues, self.config.poll_interval);
        queues.pop()
    }

    /// Put a task back at the front of its own class
    fn requeue(&self, task: Task) {
        let mut queues = self.queues.lock();
        if self.stop.load(Ordering::Acquire) {
            drop(queues);
            tracing::debug!("{}: dropping {} task during shutdown", self.config.name, task.class());
            return;
        }
        match task {
            Task::Priority(job) => queues.priority.push_front(job),
            Task::Normal(job) => queues.normal.push_front(job),
        }
        drop(queues);
        self.work_available.notify_one();
    }

    fn execute(&self, task: Task, _permit: Permit<'_>) {
        let class = task.class();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let outcome = panic::catch_unwind(AssertUnwindSafe(task.into_job()));
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        if let Err(payload) = outcome {
            tracing::error!(
                "{}: {} task panicked: {}",
                self.config.name,
                class,
                panic_message(payload.as_ref())
            );
        }
    }
}

/// Signals worker exit even if the loop itself unwinds
struct ExitGuard<'a>(&'a Shared);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut live = self.0.live_workers.lock();
        *live = live.saturating_sub(1);
        self.0.worker_exited.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let _exit = ExitGuard(&shared);

    while !shared.stop.load(Ordering::Acquire) {
        let Some(task) = shared.next_task() else {
            continue;
        };

        let Some(permit) = shared.permits.acquire_timeout(shared.config.acquire_timeout) else {
            tracing::debug!(
                "{}: no execution slot free, re-queueing {} task",
                shared.config.name,
                task.class()
            );
            shared.requeue(task);
            continue;
        };

        if shared.stop.load(Ordering::Acquire) {
            shared.requeue(task);
            break;
        }

        shared.execute(task, permit);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Fixed-size pool of background workers
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.workers` threads
    pub fn new(config: PoolConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            permits: Semaphore::new(config.max_in_flight.max(1)),
            queues: Mutex::new(Queues::default()),
            work_available: Condvar::new(),
            stop: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            live_workers: Mutex::new(0),
            worker_exited: Condvar::new(),
            config,
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            handles: Mutex::new(Vec::with_capacity(shared.config.workers)),
        };

        for index in 0..shared.config.workers.max(1) {
            let worker_shared = Arc::clone(&shared);
            *shared.live_workers.lock() += 1;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", shared.config.name, index))
                .spawn(move || worker_loop(worker_shared));

            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    *shared.live_workers.lock() -= 1;
                    // Dropping `pool` shuts down the workers already started
                    return Err(e).with_context(|| {
                        format!("Failed to spawn {} worker {}", shared.config.name, index)
                    });
                }
            }
        }

        tracing::debug!(
            "{}: started {} workers, {} execution slots",
            shared.config.name,
            shared.config.workers,
            shared.config.max_in_flight
        );

        Ok(pool)
    }

    /// Queue a job. Returns false, dropping the job, once shutdown has begun.
    pub fn submit<F>(&self, job: F, priority: bool) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::new(Box::new(job), priority);
        let mut queues = self.shared.queues.lock();
        if self.shared.stop.load(Ordering::Acquire) {
            drop(queues);
            return false;
        }
        match task {
            Task::Priority(job) => queues.priority.push_back(job),
            Task::Normal(job) => queues.normal.push_back(job),
        }
        drop(queues);
        self.shared.work_available.notify_one();
        true
    }

    /// Jobs waiting in either queue
    pub fn queued(&self) -> usize {
        self.shared.queues.lock().len()
    }

    /// Jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Stop accepting work, wait up to `join_timeout` for the workers and
    /// discard whatever is still queued. Safe to call repeatedly and from
    /// inside a job.
    pub fn shutdown(&self) {
        {
            let _queues = self.shared.queues.lock();
            if self.shared.stop.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.shared.work_available.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        let called_from_worker = handles.iter().any(|h| h.thread().id() == current);
        let allowed_live = usize::from(called_from_worker);

        let deadline = Instant::now() + self.shared.config.join_timeout;
        {
            let mut live = self.shared.live_workers.lock();
            while *live > allowed_live {
                if self
                    .shared
                    .worker_exited
                    .wait_until(&mut live, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("{}: worker thread panicked", self.shared.config.name);
                }
            } else {
                tracing::warn!(
                    "{}: worker did not stop within {:?}, detaching",
                    self.shared.config.name,
                    self.shared.config.join_timeout
                );
            }
        }

        let drained: Vec<Job> = {
            let mut queues = self.shared.queues.lock();
            let priority = std::mem::take(&mut queues.priority);
            let normal = std::mem::take(&mut queues.normal);
            priority.into_iter().chain(normal).collect()
        };
        tracing::debug!(
            "{}: shut down, discarded {} queued tasks",
            self.shared.config.name,
            drained.len()
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.name)
            .field("workers", &self.shared.config.workers)
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
