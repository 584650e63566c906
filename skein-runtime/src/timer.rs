//! # Timers
//!
//! Sleeping and timeouts for fibers.
//!
//! ## Design
//!
//! One process-wide `skein-timer` thread owns a min-heap of deadlines. A
//! sleeping fiber registers a callback keyed by a fresh id and suspends;
//! interrupting it cancels the registration. The timer thread never runs
//! fiber code: due callbacks only resume fibers through their mailbox, and
//! they run with the heap unlocked.
//!
//! A timeout is a race between the guarded effect and a sleeping fiber. The
//! loser is interrupted.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::effect::{Callback, Canceler, Data, Effect};
use crate::scheduler::Task;

/// An absolute point in time by which something must happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    deadline: Instant,
}

impl Deadline {
    /// A deadline at a specific instant.
    pub fn at(instant: Instant) -> Self {
        Self { deadline: instant }
    }

    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }

    /// Get the underlying instant.
    pub fn instant(&self) -> Instant {
        self.deadline
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::after(duration)
    }
}

// ============================================================================
// Timer thread
// ============================================================================

struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Task>,
}

pub(crate) struct Timer {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    next_key: AtomicU64,
}

impl Timer {
    /// The process-wide timer, started on first use.
    pub(crate) fn global() -> &'static Timer {
        static TIMER: OnceLock<&'static Timer> = OnceLock::new();
        TIMER.get_or_init(|| {
            let timer: &'static Timer = Box::leak(Box::new(Timer {
                state: Mutex::new(TimerState {
                    heap: BinaryHeap::new(),
                    callbacks: HashMap::new(),
                }),
                wakeup: Condvar::new(),
                next_key: AtomicU64::new(1),
            }));
            thread::Builder::new()
                .name("skein-timer".into())
                .spawn(move || timer.run())
                .expect("failed to spawn timer thread");
            timer
        })
    }

    /// Run `task` on the timer thread once `at` has passed.
    pub(crate) fn schedule(&self, at: Instant, task: Task) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.callbacks.insert(key, task);
        state.heap.push(Reverse((at, key)));
        self.wakeup.notify_one();
        key
    }

    /// Forget a scheduled task. Returns `false` if it already ran.
    pub(crate) fn cancel(&self, key: u64) -> bool {
        self.state.lock().callbacks.remove(&key).is_some()
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(&Reverse((at, key))) = state.heap.peek() {
                if at > now {
                    break;
                }
                state.heap.pop();
                if let Some(task) = state.callbacks.remove(&key) {
                    due.push(task);
                }
            }
            if !due.is_empty() {
                trace!(count = due.len(), "timers fired");
                MutexGuard::unlocked(&mut state, || {
                    for task in due {
                        task();
                    }
                });
                continue;
            }
            match state.heap.peek() {
                Some(&Reverse((at, _))) => {
                    self.wakeup.wait_until(&mut state, at);
                }
                None => self.wakeup.wait(&mut state),
            }
        }
    }
}

// ============================================================================
// Effects
// ============================================================================

impl<E: Data> Effect<(), E> {
    /// Suspend the fiber for `duration`.
    pub fn sleep(duration: Duration) -> Self {
        Effect::async_callback(move |cb: Callback<(), E>| {
            register(Instant::now() + duration, cb)
        })
    }

    /// Suspend the fiber until `deadline`.
    pub fn sleep_until(deadline: Deadline) -> Self {
        Effect::async_callback(move |cb: Callback<(), E>| register(deadline.instant(), cb))
    }
}

fn register<E: Data>(at: Instant, cb: Callback<(), E>) -> Option<Canceler> {
    let timer = Timer::global();
    let key = timer.schedule(at, Box::new(move || cb.succeed(())));
    Some(Box::new(move || {
        timer.cancel(key);
    }) as Canceler)
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Give up after `duration`, succeeding with `None`. The effect is
    /// interrupted if it is still running.
    pub fn timeout(&self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race_first(&Effect::<(), E>::sleep(duration).as_value(None))
    }

    /// Give up after `duration`, failing with `on_timeout()`.
    pub fn timeout_fail<F>(&self, duration: Duration, on_timeout: F) -> Effect<A, E>
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.timeout(duration).flat_map(move |value| match value {
            Some(value) => Effect::succeed(value),
            None => Effect::fail(on_timeout()),
        })
    }

    /// Wait `duration` before running the effect.
    pub fn delay(&self, duration: Duration) -> Effect<A, E> {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
