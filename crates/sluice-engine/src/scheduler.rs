//! Task schedulers driving the dataflow.
//!
//! Tasks are fire-and-forget closures. The engine never waits on a task
//! handle; completion is observed through fan-in nodes and the pass latch.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sluice_core::{Result, SluiceError};

/// A unit of work submitted to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Ready-queue abstraction. Lower priorities run first.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, priority: u64, task: Task);

    /// Number of worker threads.
    fn workers(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Which scheduler backend a network runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Dedicated worker threads pulling from a priority heap.
    #[default]
    Priority,
    /// A rayon thread pool. Priorities are ignored.
    Rayon,
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "priority" => Ok(Self::Priority),
            "rayon" => Ok(Self::Rayon),
            other => Err(format!("unknown scheduler '{other}' (expected priority or rayon)")),
        }
    }
}

/// Build a scheduler of `kind` with `workers` threads.
pub fn build(kind: SchedulerKind, workers: usize) -> Result<Arc<dyn Scheduler>> {
    if workers == 0 {
        return Err(SluiceError::Config("scheduler needs at least one worker".into()));
    }
    Ok(match kind {
        SchedulerKind::Priority => Arc::new(PriorityPool::new(workers)?),
        SchedulerKind::Rayon => Arc::new(RayonScheduler::new(workers)?),
    })
}

// ============================================================================
// PriorityPool
// ============================================================================

struct Job {
    priority: u64,
    seq: u64,
    task: Task,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Default)]
struct ReadyQueue {
    heap: BinaryHeap<Job>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<ReadyQueue>,
    available: Condvar,
}

/// Fixed set of worker threads serving a min-priority ready queue.
///
/// Ties are served in submission order. Dropping the pool drains queued
/// tasks and joins every worker.
pub struct PriorityPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for PriorityPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityPool")
            .field("workers", &self.handles.len())
            .field("queued", &self.queued())
            .finish()
    }
}

impl PriorityPool {
    pub fn new(workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(ReadyQueue::default()),
            available: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("sluice-worker-{id}"))
                .spawn(move || worker_loop(&shared))?;
            handles.push(handle);
        }

        tracing::debug!(workers, "priority pool started");
        Ok(Self { shared, handles })
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.heap.pop() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        // A panicking task would leave its pass waiting forever on the latch.
        if catch_unwind(AssertUnwindSafe(job.task)).is_err() {
            tracing::error!(priority = job.priority, "task panicked, aborting");
            std::process::abort();
        }
    }
}

impl Scheduler for PriorityPool {
    fn schedule(&self, priority: u64, task: Task) {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Job { priority, seq, task });
        drop(queue);
        self.shared.available.notify_one();
    }

    fn workers(&self) -> usize {
        self.handles.len()
    }

    fn name(&self) -> &'static str {
        "priority"
    }
}

impl Drop for PriorityPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// RayonScheduler
// ============================================================================

/// Runs tasks on a dedicated rayon pool in whatever order rayon chooses.
pub struct RayonScheduler {
    pool: rayon::ThreadPool,
}

impl fmt::Debug for RayonScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonScheduler")
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

impl RayonScheduler {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("sluice-rayon-{i}"))
            .build()
            .map_err(|e| SluiceError::Config(format!("rayon pool: {e}")))?;
        Ok(Self { pool })
    }
}

impl Scheduler for RayonScheduler {
    fn schedule(&self, _priority: u64, task: Task) {
        self.pool.spawn(task);
    }

    fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn name(&self) -> &'static str {
        "rayon"
    }
}
