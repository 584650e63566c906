//! # Work-Stealing Task Scheduler
//!
//! Executes fiber drain tasks on a pool of worker threads.
//!
//! ## Design
//!
//! Fibers never run themselves: whenever a fiber has messages to process it
//! hands a task to its [`Scheduler`]. Two implementations exist:
//!
//! - [`WorkStealingScheduler`]: M:N pool with one local deque per worker, a
//!   global injector for overflow, and work-stealing for load balancing.
//! - [`SyncScheduler`]: a FIFO queue flushed on the calling thread, used to
//!   run effects synchronously. Once deactivated it forwards everything to a
//!   fallback scheduler.
//!
//! Tasks scheduled from a worker thread go to that worker's local deque;
//! tasks scheduled from anywhere else go through the injector. Idle workers
//! spin briefly and then park on a condition variable.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::SchedulerConfig;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send>;

/// Something that can run tasks.
pub trait Scheduler: Send + Sync {
    /// Queue `task` for execution. Never runs it inline.
    fn schedule(&self, task: Task);
}

/// Rounds of `yield_now` an idle worker spins before parking.
const SPIN_ROUNDS: usize = 16;

/// Upper bound on a parked worker's sleep; guards against lost wakeups.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// The local deque of the worker running on this thread, tagged with the
    /// owning scheduler's id.
    static LOCAL: RefCell<Option<(usize, Deque<Task>)>> = const { RefCell::new(None) };
}

// ============================================================================
// Work-stealing pool
// ============================================================================

struct Shared {
    id: usize,
    global_queue: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    work_stealing: bool,
    shutdown: AtomicBool,
    active_workers: AtomicUsize,
    sleeping: AtomicUsize,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
}

impl Shared {
    fn push(&self, task: Task) {
        let task = LOCAL.with(|local| match &*local.borrow() {
            Some((id, deque)) if *id == self.id => {
                deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = task {
            self.global_queue.push(task);
        }
        if self.sleeping.load(Ordering::Acquire) > 0 {
            let _guard = self.sleep_lock.lock();
            self.wakeup.notify_one();
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Multi-threaded work-stealing scheduler.
///
/// Worker threads are stopped and joined when the scheduler is dropped.
pub struct WorkStealingScheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkStealingScheduler {
    /// Start a pool with the given configuration.
    pub fn new(config: &SchedulerConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);

        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(Shared {
            id,
            global_queue: Injector::new(),
            stealers,
            work_stealing: config.work_stealing,
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            sleeping: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        let threads = deques
            .into_iter()
            .enumerate()
            .map(|(i, deque)| {
                let worker = Worker {
                    id: i,
                    shared: shared.clone(),
                };
                thread::Builder::new()
                    .name(format!("skein-worker-{}", i))
                    .spawn(move || worker.run_loop(deque))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        debug!(scheduler = id, workers = num_workers, "scheduler started");
        Self { shared, threads }
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Number of workers currently inside their run loop.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// A cheap, clonable handle for scheduling onto this pool.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Request shutdown. Queued tasks that have not started are dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _guard = self.shared.sleep_lock.lock();
        self.shared.wakeup.notify_all();
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }
}

impl Scheduler for WorkStealingScheduler {
    fn schedule(&self, task: Task) {
        self.shared.push(task);
    }
}

impl Drop for WorkStealingScheduler {
    fn drop(&mut self) {
        self.shutdown();
        let on_worker = LOCAL.with(|local| {
            matches!(&*local.borrow(), Some((id, _)) if *id == self.shared.id)
        });
        for handle in self.threads.drain(..) {
            // A worker cannot join itself; its loop exits on the flag.
            if !on_worker {
                let _ = handle.join();
            }
        }
        debug!(scheduler = self.shared.id, "scheduler stopped");
    }
}

impl fmt::Debug for WorkStealingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealingScheduler")
            .field("id", &self.shared.id)
            .field("workers", &self.num_workers())
            .field("shutdown", &self.is_shutting_down())
            .finish()
    }
}

/// Clonable handle scheduling onto a [`WorkStealingScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl Scheduler for SchedulerHandle {
    fn schedule(&self, task: Task) {
        if self.shared.is_shutting_down() {
            trace!(scheduler = self.shared.id, "task dropped after shutdown");
            return;
        }
        self.shared.push(task);
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("id", &self.shared.id)
            .finish()
    }
}

/// A worker thread in the scheduler.
struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, deque: Deque<Task>) {
        LOCAL.with(|local| *local.borrow_mut() = Some((self.shared.id, deque)));
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        trace!(worker = self.id, "worker started");

        let mut idle_rounds = 0;
        loop {
            if self.shared.is_shutting_down() {
                break;
            }

            if let Some(task) = self.find_work() {
                idle_rounds = 0;
                task();
            } else if idle_rounds < SPIN_ROUNDS {
                idle_rounds += 1;
                thread::yield_now();
            } else {
                self.park();
            }
        }

        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        LOCAL.with(|local| local.borrow_mut().take());
        trace!(worker = self.id, "worker stopped");
    }

    fn park(&self) {
        let mut guard = self.shared.sleep_lock.lock();
        self.shared.sleeping.fetch_add(1, Ordering::AcqRel);
        if !self.shared.is_shutting_down() && self.shared.global_queue.is_empty() {
            self.shared.wakeup.wait_for(&mut guard, PARK_TIMEOUT);
        }
        self.shared.sleeping.fetch_sub(1, Ordering::AcqRel);
    }

    /// Find work using work-stealing.
    fn find_work(&self) -> Option<Task> {
        // 1. Try local queue first
        let local = LOCAL.with(|local| local.borrow().as_ref().and_then(|(_, deque)| deque.pop()));
        if local.is_some() {
            return local;
        }

        // 2. Try global queue
        loop {
            match self.shared.global_queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Try stealing from other workers
        if self.shared.work_stealing {
            for (i, stealer) in self.shared.stealers.iter().enumerate() {
                if i == self.id {
                    continue;
                }
                loop {
                    match stealer.steal() {
                        Steal::Success(task) => return Some(task),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
        }

        None
    }
}

// ============================================================================
// Synchronous scheduler
// ============================================================================

struct SyncQueue {
    tasks: VecDeque<Task>,
    active: bool,
}

/// Runs tasks on whichever thread calls [`SyncScheduler::flush`].
pub struct SyncScheduler {
    queue: Mutex<SyncQueue>,
    fallback: Arc<dyn Scheduler>,
}

impl SyncScheduler {
    /// A scheduler that queues locally until deactivated, then forwards to
    /// `fallback`.
    pub fn new(fallback: Arc<dyn Scheduler>) -> Self {
        Self {
            queue: Mutex::new(SyncQueue {
                tasks: VecDeque::new(),
                active: true,
            }),
            fallback,
        }
    }

    /// Run queued tasks, including any they schedule, until the queue is empty.
    pub fn flush(&self) {
        loop {
            let task = self.queue.lock().tasks.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Stop queueing locally and hand leftover tasks to the fallback.
    pub fn deactivate(&self) {
        let leftover = {
            let mut queue = self.queue.lock();
            queue.active = false;
            std::mem::take(&mut queue.tasks)
        };
        for task in leftover {
            self.fallback.schedule(task);
        }
    }

    /// Number of tasks waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }
}

impl Scheduler for SyncScheduler {
    fn schedule(&self, task: Task) {
        let mut queue = self.queue.lock();
        if queue.active {
            queue.tasks.push_back(task);
            return;
        }
        drop(queue);
        self.fallback.schedule(task);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Instant;

    fn wait_for(counter: &AtomicI32, expected: i32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) != expected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let config = SchedulerConfig {
            num_workers: 3,
            ..Default::default()
        };
        let scheduler = WorkStealingScheduler::new(&config);
        assert_eq!(scheduler.num_workers(), 3);
        assert!(!scheduler.is_shutting_down());
    }

    #[test]
    fn test_task_execution() {
        let counter = Arc::new(AtomicI32::new(0));
        let scheduler = WorkStealingScheduler::new(&SchedulerConfig {
            num_workers: 1,
            ..Default::default()
        });

        let c = counter.clone();
        scheduler.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        wait_for(&counter, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_work_stealing() {
        let counter = Arc::new(AtomicI32::new(0));
        let scheduler = WorkStealingScheduler::new(&SchedulerConfig {
            num_workers: 4,
            work_stealing: true,
        });
        let handle = scheduler.handle();

        // A task that fans out onto its own worker's local deque.
        let c = counter.clone();
        let inner = handle.clone();
        scheduler.schedule(Box::new(move || {
            for _ in 0..100 {
                let c = c.clone();
                inner.schedule(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }));

        wait_for(&counter, 100);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_shutdown_on_drop() {
        let scheduler = WorkStealingScheduler::new(&SchedulerConfig {
            num_workers: 2,
            ..Default::default()
        });
        let handle = scheduler.handle();
        drop(scheduler);

        let ran = Arc::new(AtomicI32::new(0));
        let r = ran.clone();
        handle.schedule(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sync_scheduler_flush_runs_nested_tasks_in_order() {
        let pool = WorkStealingScheduler::new(&SchedulerConfig {
            num_workers: 1,
            ..Default::default()
        });
        let sync = Arc::new(SyncScheduler::new(Arc::new(pool.handle())));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (o, s) = (order.clone(), sync.clone());
        sync.schedule(Box::new(move || {
            o.lock().push(1);
            let o2 = o.clone();
            s.schedule(Box::new(move || o2.lock().push(3)));
        }));
        let o = order.clone();
        sync.schedule(Box::new(move || o.lock().push(2)));

        assert_eq!(sync.pending(), 2);
        sync.flush();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn test_sync_scheduler_forwards_after_deactivate() {
        let pool = WorkStealingScheduler::new(&SchedulerConfig {
            num_workers: 1,
            ..Default::default()
        });
        let sync = SyncScheduler::new(Arc::new(pool.handle()));
        let counter = Arc::new(AtomicI32::new(0));

        let c = counter.clone();
        sync.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        sync.deactivate();
        let c = counter.clone();
        sync.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        wait_for(&counter, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(sync.pending(), 0);
    }
}
