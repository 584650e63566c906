//! # Deferred
//!
//! A single-assignment, multi-waiter future.
//!
//! ## Design
//!
//! ```text
//! Pending { waiters } ──complete(exit)──► Done(exit)
//! ```
//!
//! The transition happens once, under the state lock; the first completion
//! wins and every later attempt reports `false`. Waiters are taken out of the
//! state and called after the lock is released. A waiter only resumes its
//! fiber through the fiber's mailbox, so completing a deferred never runs
//! fiber code inline.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{Callback, Canceler, Data, Effect};
use crate::exit::Exit;

type Waiter<A, E> = Box<dyn FnOnce(Exit<A, E>) + Send>;

enum State<A, E> {
    Pending {
        waiters: Vec<(u64, Waiter<A, E>)>,
        next_key: u64,
    },
    Done(Exit<A, E>),
}

/// A value that is set once and observed by any number of fibers.
pub struct Deferred<A, E = Infallible> {
    state: Arc<Mutex<State<A, E>>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.state.lock(), State::Done(_));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

impl<A: Data, E: Data> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Data, E: Data> Deferred<A, E> {
    /// A pending deferred.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending {
                waiters: Vec::new(),
                next_key: 0,
            })),
        }
    }

    /// Create a pending deferred inside an effect.
    pub fn make() -> Effect<Self, Infallible> {
        Effect::sync(Self::new)
    }

    /// Suspend until the deferred is completed, then continue with its exit.
    ///
    /// Interrupting the waiting fiber removes its waiter.
    pub fn wait(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::suspend(move || {
            if let Some(exit) = this.poll() {
                return Effect::done(exit);
            }
            let this = this.clone();
            Effect::async_callback(move |cb: Callback<A, E>| {
                let exit = {
                    let mut state = this.state.lock();
                    match &mut *state {
                        State::Pending { waiters, next_key } => {
                            let key = *next_key;
                            *next_key += 1;
                            waiters.push((key, Box::new(move |exit| cb.done(exit))));
                            let this = this.clone();
                            return Some(Box::new(move || this.remove_waiter(key)) as Canceler);
                        }
                        State::Done(exit) => exit.clone(),
                    }
                };
                cb.done(exit);
                None
            })
        })
    }

    /// Complete with a value. Succeeds with `true` if this call won.
    pub fn succeed(&self, value: A) -> Effect<bool, Infallible> {
        self.done(Exit::Success(value))
    }

    /// Complete with a typed error.
    pub fn fail(&self, error: E) -> Effect<bool, Infallible> {
        self.done(Exit::fail(error))
    }

    /// Complete with a cause.
    pub fn fail_cause(&self, cause: Cause<E>) -> Effect<bool, Infallible> {
        self.done(Exit::Failure(cause))
    }

    /// Complete with a defect.
    pub fn die(&self, defect: Defect) -> Effect<bool, Infallible> {
        self.done(Exit::die(defect))
    }

    /// Complete with an interruption by the calling fiber.
    pub fn interrupt(&self) -> Effect<bool, Infallible> {
        let this = self.clone();
        Effect::with_fiber(move |ctx| Effect::succeed(this.try_complete(Exit::interrupt(ctx.id()))))
    }

    /// Complete with an exit.
    pub fn done(&self, exit: Exit<A, E>) -> Effect<bool, Infallible> {
        let this = self.clone();
        Effect::sync(move || this.try_complete(exit.clone()))
    }

    /// Run `effect` and complete with its outcome.
    pub fn complete(&self, effect: &Effect<A, E>) -> Effect<bool, Infallible> {
        let this = self.clone();
        effect.exit().flat_map(move |exit| this.done(exit))
    }

    /// Complete from outside the runtime. Returns `true` if this call won.
    pub fn try_complete(&self, exit: Exit<A, E>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            let waiters = match &mut *state {
                State::Done(_) => return false,
                State::Pending { waiters, .. } => std::mem::take(waiters),
            };
            *state = State::Done(exit.clone());
            waiters
        };
        for (_, waiter) in waiters {
            waiter(exit.clone());
        }
        true
    }

    /// The exit, if completed.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        match &*self.state.lock() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending { .. } => None,
        }
    }

    /// True once completed.
    pub fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(_))
    }

    /// Number of fibers currently waiting.
    pub fn waiter_count(&self) -> usize {
        match &*self.state.lock() {
            State::Pending { waiters, .. } => waiters.len(),
            State::Done(_) => 0,
        }
    }

    /// True when both handles refer to the same deferred.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn remove_waiter(&self, key: u64) {
        if let State::Pending { waiters, .. } = &mut *self.state.lock() {
            waiters.retain(|(k, _)| *k != key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    #[test]
    fn test_first_completion_wins() {
        let deferred: Deferred<i32, String> = Deferred::new();
        assert!(deferred.try_complete(Exit::Success(1)));
        assert!(!deferred.try_complete(Exit::fail("late".to_string())));
        assert_eq!(deferred.poll(), Some(Exit::Success(1)));
    }

    #[test]
    fn test_wait_after_completion_is_immediate() {
        let rt = runtime();
        let deferred: Deferred<i32, String> = Deferred::new();
        deferred.try_complete(Exit::Success(5));
        assert_eq!(rt.run_sync(deferred.wait()).unwrap(), 5);
    }

    #[test]
    fn test_waiters_observe_same_exit() {
        let rt = runtime();
        let deferred: Deferred<i32, String> = Deferred::new();
        let waiters: Vec<_> = (0..4).map(|_| rt.fork(deferred.wait())).collect();
        let won = rt.run_sync(deferred.fail("boom".to_string())).unwrap();
        assert!(won);
        for waiter in waiters {
            let exit = waiter.await_blocking();
            assert_eq!(exit, Exit::fail("boom".to_string()));
        }
        assert_eq!(deferred.waiter_count(), 0);
    }

    #[test]
    fn test_concurrent_completion_single_winner() {
        let rt = runtime();
        let deferred: Deferred<usize, Infallible> = Deferred::new();
        let wins = Arc::new(AtomicUsize::new(0));
        let fibers: Vec<_> = (0..16)
            .map(|n| {
                let wins = wins.clone();
                rt.fork(deferred.succeed(n).map(move |won| {
                    if won {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }))
            })
            .collect();
        for fiber in fibers {
            fiber.await_blocking();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(deferred.is_done());
    }

    #[test]
    fn test_interrupted_waiter_is_removed() {
        let rt = runtime();
        let deferred: Deferred<(), Infallible> = Deferred::new();
        let d = deferred.clone();
        let effect = deferred.wait().fork().flat_map(move |fiber| {
            let d = d.clone();
            Effect::yield_now()
                .map(move |_| d.waiter_count())
                .zip_left(&fiber.interrupt())
        });
        assert_eq!(rt.run_sync(effect).unwrap(), 1);
        assert_eq!(deferred.waiter_count(), 0);
    }

    #[test]
    fn test_interrupt_completes_with_interruption() {
        let rt = runtime();
        let deferred: Deferred<(), String> = Deferred::new();
        assert!(rt.run_sync(deferred.interrupt()).unwrap());
        assert!(deferred.poll().unwrap().is_interrupted());
    }
}
