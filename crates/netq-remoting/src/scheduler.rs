//! Elastic worker pool for processor and callback execution.
//!
//! Core workers start eagerly and block on the wake signal until the pool is
//! disposed. On every enqueue that finds more outstanding tasks than live
//! workers, one auxiliary worker is spawned, up to `max_threads`. Auxiliary
//! workers retire once they have gone `idle_timeout` without dequeuing work.
//!
//! Enqueue and dequeue go through a lock-free `SegQueue`; the wake signal
//! only takes its mutex when a worker is actually parked.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::config::SchedulerConfig;
use crate::error::{RemotingError, Result};

/// A unit of work run by the scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// Enqueue spins while this many wake-ups are outstanding.
const SIGNAL_CEILING: usize = i32::MAX as usize;

/// Counting wake signal with an atomic fast path.
///
/// `permits` is the count; `sleepers` tells `release` whether anyone is
/// parked on the condvar and needs a notify.
struct WakeSignal {
    permits: AtomicUsize,
    sleepers: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        Self {
            permits: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self
            .permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(p.saturating_add(n)));
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock();
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    fn outstanding(&self) -> usize {
        self.permits.load(Ordering::SeqCst)
    }

    fn try_take(&self) -> bool {
        self.permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1))
            .is_ok()
    }

    fn acquire(&self) {
        if self.try_take() {
            return;
        }
        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        while !self.try_take() {
            self.cond.wait(&mut guard);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns false if no signal arrived before `timeout`.
    fn acquire_timeout(&self, timeout: Duration) -> bool {
        if self.try_take() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let taken = loop {
            if self.try_take() {
                break true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                break self.try_take();
            }
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        taken
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Core,
    Auxiliary,
}

struct Shared {
    name: String,
    core_threads: usize,
    max_threads: usize,
    idle_timeout: Duration,
    queue: SegQueue<Job>,
    signal: WakeSignal,
    running: AtomicBool,
    active: AtomicUsize,
    // queued plus executing
    outstanding: AtomicUsize,
    spawned: AtomicUsize,
}

impl Shared {
    fn pop(&self) -> Option<Job> {
        self.queue.pop()
    }

    /// Counts one more worker in `active` if below `max_threads` and below
    /// `outstanding`.
    fn reserve_worker(&self, outstanding: usize) -> bool {
        let max = self.max_threads;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max && active < outstanding).then_some(active + 1)
            })
            .is_ok()
    }

    fn run_job(&self, job: Job) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                scheduler = %self.name,
                panic = %panic_message(panic.as_ref()),
                "scheduled job panicked"
            );
        }
    }
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded, elastic pool of OS threads.
pub struct ElasticScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ElasticScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticScheduler")
            .field("name", &self.shared.name)
            .field("core_threads", &self.shared.core_threads)
            .field("max_threads", &self.shared.max_threads)
            .field("active_threads", &self.active_threads())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

impl ElasticScheduler {
    /// Creates the pool and starts its core workers.
    ///
    /// `max_threads` is raised to `core_threads` if configured lower.
    pub fn new(config: SchedulerConfig) -> Self {
        let name = config
            .thread_name_prefix
            .clone()
            .unwrap_or_else(|| "netq-worker-".to_string());
        let shared = Arc::new(Shared {
            name,
            core_threads: config.core_threads,
            max_threads: config.max_threads.max(config.core_threads),
            idle_timeout: config.idle_timeout(),
            queue: SegQueue::new(),
            signal: WakeSignal::new(),
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
        });

        for _ in 0..shared.core_threads {
            shared.active.fetch_add(1, Ordering::SeqCst);
            spawn_worker(&shared, WorkerKind::Core);
        }

        Self { shared }
    }

    /// Queues `job` for execution.
    ///
    /// Fails only after [`dispose`](Self::dispose).
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job))
            .map_err(|_| RemotingError::SchedulerStopped)
    }

    /// Queues a boxed job, handing it back if the pool has been disposed.
    pub(crate) fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Err(job);
        }

        let outstanding = shared.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        shared.queue.push(job);

        while shared.signal.outstanding() >= SIGNAL_CEILING {
            thread::sleep(Duration::from_millis(1));
        }
        shared.signal.release(1);

        if shared.reserve_worker(outstanding) {
            spawn_worker(shared, WorkerKind::Auxiliary);
        }
        Ok(())
    }

    /// Discards queued jobs without running them; returns how many were dropped.
    ///
    /// Jobs already handed to a worker keep running.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while let Some(job) = self.shared.queue.pop() {
            drop(job);
            count += 1;
        }
        if count > 0 {
            self.shared.outstanding.fetch_sub(count, Ordering::SeqCst);
            debug!(scheduler = %self.shared.name, count, "drained queued jobs");
        }
        count
    }

    /// Stops the pool: queued jobs are dropped and every worker exits after
    /// its current job.
    pub fn dispose(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.drain();
        let active = self.shared.active.load(Ordering::Acquire);
        self.shared.signal.release(active.max(1));
        debug!(scheduler = %self.shared.name, active, "scheduler disposed");
    }

    /// Waits until every worker has exited. Returns false on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_threads() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            // late wake-ups for workers that started waiting after dispose
            self.shared.signal.release(1);
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Returns false once disposed.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Live workers, core and auxiliary.
    pub fn active_threads(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Configured core workers.
    pub fn core_threads(&self) -> usize {
        self.shared.core_threads
    }

    /// Configured worker ceiling.
    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    /// Jobs queued or executing.
    pub fn pending_tasks(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Scheduler name (the thread name prefix).
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for ElasticScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

// The caller has already counted the worker in `active`.
fn spawn_worker(shared: &Arc<Shared>, kind: WorkerKind) {
    let index = shared.spawned.fetch_add(1, Ordering::Relaxed);
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("{}{}", shared.name, index))
        .spawn(move || run_worker(worker, kind));
    if let Err(e) = spawned {
        shared.active.fetch_sub(1, Ordering::SeqCst);
        warn!(scheduler = %shared.name, error = %e, "failed to spawn worker thread");
    }
}

fn run_worker(shared: Arc<Shared>, kind: WorkerKind) {
    debug!(scheduler = %shared.name, ?kind, "worker started");
    let mut last_work = Instant::now();
    while shared.running.load(Ordering::Acquire) {
        if kind == WorkerKind::Auxiliary && last_work.elapsed() >= shared.idle_timeout {
            break;
        }
        match shared.pop() {
            Some(job) => {
                shared.run_job(job);
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                last_work = Instant::now();
            }
            None => match kind {
                WorkerKind::Core => shared.signal.acquire(),
                WorkerKind::Auxiliary => {
                    shared.signal.acquire_timeout(shared.idle_timeout);
                }
            },
        }
    }
    let remaining = shared.active.fetch_sub(1, Ordering::SeqCst) - 1;
    debug!(scheduler = %shared.name, ?kind, remaining, "worker exited");

    // A submit racing the retirement counted this worker as live and spawned
    // nobody; hand its job to a replacement.
    if shared.running.load(Ordering::Acquire) {
        let outstanding = shared.outstanding.load(Ordering::SeqCst);
        if shared.reserve_worker(outstanding) {
            debug!(scheduler = %shared.name, "respawning worker for queued work");
            spawn_worker(&shared, WorkerKind::Auxiliary);
        }
    }
}
