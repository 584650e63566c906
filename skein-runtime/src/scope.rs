//! # Scope
//!
//! Structured ownership of child fibers and finalizers.
//!
//! ## Design
//!
//! ```text
//! Open ──close()──► Closing ──children done, finalizers run──► Closed
//! ```
//!
//! Closing is uninterruptible and happens once. The closer takes the
//! finalizers and children out of the open state, interrupts every child,
//! waits for each to finish, then runs the finalizers last-in first-out.
//! Every finalizer runs even if earlier ones fail; their causes are composed
//! sequentially. Anyone else calling `close` while the scope is closing waits
//! for the first closer and observes the same outcome.
//!
//! A fiber forked into a closing scope (from a finalizer, say) starts out
//! interrupted and is still awaited before the scope reports Closed.
//!
//! Child scopes created with [`Scope::fork`] register their own close as a
//! finalizer of the parent.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cause::Cause;
use crate::deferred::Deferred;
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::fiber::{FiberId, FiberRuntime};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Key identifying a registered finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizerKey(u64);

enum State {
    Open {
        finalizers: Vec<(u64, Effect<(), Infallible>)>,
        next_key: u64,
        children: BTreeMap<FiberId, Arc<FiberRuntime>>,
    },
    Closing {
        late: Vec<Arc<FiberRuntime>>,
    },
    Closed,
}

struct Inner {
    id: u64,
    state: Mutex<State>,
    closed: Deferred<(), Infallible>,
}

/// Owner of finalizers and child fibers, closed exactly once.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// An open, empty scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::Open {
                    finalizers: Vec::new(),
                    next_key: 0,
                    children: BTreeMap::new(),
                }),
                closed: Deferred::new(),
            }),
        }
    }

    /// Create an open scope inside an effect.
    pub fn make() -> Effect<Scope, Infallible> {
        Effect::sync(Scope::new)
    }

    /// True once `close` has started.
    pub fn is_closed(&self) -> bool {
        !matches!(&*self.inner.state.lock(), State::Open { .. })
    }

    /// Number of registered finalizers.
    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Open { finalizers, .. } => finalizers.len(),
            _ => 0,
        }
    }

    /// Number of child fibers still running.
    pub fn child_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Open { children, .. } => children.len(),
            _ => 0,
        }
    }

    /// Register `finalizer` to run when the scope closes.
    ///
    /// If the scope is already closing or closed the finalizer runs right away.
    pub fn add_finalizer(&self, finalizer: &Effect<(), Infallible>) -> Effect<(), Infallible> {
        let scope = self.clone();
        let finalizer = finalizer.clone();
        Effect::suspend(move || match scope.try_add_finalizer(finalizer.clone()) {
            Some(_) => Effect::unit(),
            None => finalizer.clone(),
        })
    }

    /// Register a finalizer and return its key, or `None` if the scope is no
    /// longer open.
    pub fn try_add_finalizer(&self, finalizer: Effect<(), Infallible>) -> Option<FinalizerKey> {
        match &mut *self.inner.state.lock() {
            State::Open {
                finalizers,
                next_key,
                ..
            } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.push((key, finalizer));
                Some(FinalizerKey(key))
            }
            _ => None,
        }
    }

    /// Unregister a finalizer without running it.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
        match &mut *self.inner.state.lock() {
            State::Open { finalizers, .. } => {
                let before = finalizers.len();
                finalizers.retain(|(k, _)| *k != key.0);
                finalizers.len() != before
            }
            _ => false,
        }
    }

    /// A child scope, closed when this one closes.
    ///
    /// The child unregisters itself from the parent when closed first.
    pub fn fork(&self) -> Effect<Scope, Infallible> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::new();
            match parent.try_add_finalizer(child.close()) {
                Some(key) => {
                    let parent = parent.clone();
                    let detach = Effect::sync(move || {
                        parent.remove_finalizer(key);
                    });
                    child.add_finalizer(&detach).as_value(child.clone())
                }
                None => child.close().as_value(child.clone()),
            }
        })
    }

    /// Acquire a resource uninterruptibly and register its release.
    pub fn acquire_release<A, E, F>(&self, acquire: &Effect<A, E>, release: F) -> Effect<A, E>
    where
        A: Data,
        E: Data,
        F: Fn(A) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let scope = self.clone();
        let release = Arc::new(release);
        acquire
            .flat_map(move |resource| {
                let release = release.clone();
                let held = resource.clone();
                let finalizer = Effect::suspend(move || release(held.clone()));
                scope.add_finalizer(&finalizer).widen_error::<E>().as_value(resource)
            })
            .uninterruptible()
    }

    /// Close the scope: interrupt and await children, then run finalizers in
    /// reverse order. Fails with the sequential composition of every
    /// finalizer failure.
    pub fn close(&self) -> Effect<(), Infallible> {
        let scope = self.clone();
        Effect::with_fiber(move |ctx| {
            let taken = {
                let mut state = scope.inner.state.lock();
                match std::mem::replace(&mut *state, State::Closing { late: Vec::new() }) {
                    State::Open {
                        finalizers,
                        children,
                        ..
                    } => Some((finalizers, children)),
                    other => {
                        *state = other;
                        None
                    }
                }
            };
            let (finalizers, children) = match taken {
                Some(taken) => taken,
                None => return scope.inner.closed.wait(),
            };
            trace!(
                scope = scope.inner.id,
                children = children.len(),
                finalizers = finalizers.len(),
                "closing scope"
            );

            let by = ctx.id();
            let children: Vec<Arc<FiberRuntime>> = children.into_values().collect();
            for child in &children {
                child.interrupt_as(Cause::interrupt(by));
            }
            let await_children = Effect::for_each(children, |child| child.await_done());

            let finalizers: Vec<Effect<(), Infallible>> =
                finalizers.into_iter().rev().map(|(_, f)| f).collect();
            let run_finalizers = Effect::for_each(finalizers, |f| f.exit());

            let scope = scope.clone();
            await_children
                .zip_right(&run_finalizers)
                .flat_map(move |exits| {
                    let cause = exits
                        .into_iter()
                        .filter_map(|exit| exit.into_result().err())
                        .fold(Cause::Empty, Cause::then);
                    scope.finish_close(cause)
                })
        })
        .uninterruptible()
    }

    /// Await children forked while closing, then mark the scope Closed.
    fn finish_close(&self, cause: Cause<Infallible>) -> Effect<(), Infallible> {
        let scope = self.clone();
        Effect::suspend(move || {
            let late = {
                let mut state = scope.inner.state.lock();
                match &mut *state {
                    State::Closing { late } if !late.is_empty() => std::mem::take(late),
                    _ => {
                        *state = State::Closed;
                        Vec::new()
                    }
                }
            };
            if late.is_empty() {
                let exit = if cause.is_empty() {
                    Exit::Success(())
                } else {
                    Exit::Failure(cause.clone())
                };
                scope.inner.closed.try_complete(exit.clone());
                return Effect::done(exit);
            }
            trace!(scope = scope.inner.id, late = late.len(), "awaiting late children");
            let scope = scope.clone();
            let cause = cause.clone();
            Effect::for_each(late, |child: Arc<FiberRuntime>| child.await_done())
                .flat_map(move |_| scope.finish_close(cause.clone()))
        })
    }

    /// Close without running anything when there is nothing to run.
    ///
    /// Returns `true` if the scope is now closed.
    pub(crate) fn close_if_empty(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Open {
                    finalizers,
                    children,
                    ..
                } if finalizers.is_empty() && children.is_empty() => *state = State::Closed,
                State::Closed => return true,
                _ => return false,
            }
        }
        self.inner.closed.try_complete(Exit::Success(()));
        true
    }

    /// Register a running child. Returns `false` if the scope no longer
    /// accepts children; a closing scope still awaits it before it reports
    /// Closed.
    pub(crate) fn add_child(&self, child: &Arc<FiberRuntime>) -> bool {
        match &mut *self.inner.state.lock() {
            State::Open { children, .. } => {
                children.insert(child.id(), child.clone());
                true
            }
            State::Closing { late } => {
                late.push(child.clone());
                false
            }
            State::Closed => false,
        }
    }

    pub(crate) fn remove_child(&self, id: FiberId) {
        if let State::Open { children, .. } = &mut *self.inner.state.lock() {
            children.remove(&id);
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Open { .. } => "Open",
            State::Closing { .. } => "Closing",
            State::Closed => "Closed",
        };
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Defect;
    use crate::fiber::FiberHandle;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    fn record(log: &Arc<Mutex<Vec<u32>>>, n: u32) -> Effect<(), Infallible> {
        let log = log.clone();
        Effect::sync(move || log.lock().push(n))
    }

    #[test]
    fn test_finalizers_run_in_reverse_order() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let effect = scope
            .add_finalizer(&record(&log, 1))
            .zip_right(&scope.add_finalizer(&record(&log, 2)))
            .zip_right(&scope.add_finalizer(&record(&log, 3)))
            .zip_right(&scope.close());
        rt.run_sync(effect).unwrap();
        assert_eq!(*log.lock(), vec![3, 2, 1]);
        assert!(scope.is_closed());
    }

    #[test]
    fn test_failing_finalizer_does_not_stop_others() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let boom: Effect<(), Infallible> = Effect::die(Defect::new("first"));
        let bang: Effect<(), Infallible> = Effect::die(Defect::new("second"));
        let effect = scope
            .add_finalizer(&record(&log, 1))
            .zip_right(&scope.add_finalizer(&bang))
            .zip_right(&scope.add_finalizer(&record(&log, 2)))
            .zip_right(&scope.add_finalizer(&boom))
            .zip_right(&scope.close());
        let cause = rt.run_sync_exit(effect).into_result().unwrap_err();
        assert_eq!(*log.lock(), vec![2, 1]);
        assert_eq!(cause, Cause::die_message("first").then(Cause::die_message("second")));
    }

    #[test]
    fn test_close_is_idempotent() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let effect = scope
            .add_finalizer(&record(&log, 7))
            .zip_right(&scope.close())
            .zip_right(&scope.close());
        rt.run_sync(effect).unwrap();
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn test_finalizer_added_after_close_runs_immediately() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        rt.run_sync(scope.close()).unwrap();
        rt.run_sync(scope.add_finalizer(&record(&log, 9))).unwrap();
        assert_eq!(*log.lock(), vec![9]);
    }

    #[test]
    fn test_close_interrupts_children_first() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::new();
        let child_log = log.clone();
        let child: Effect<(), Infallible> = Effect::never().on_interrupt(move |_| {
            let log = child_log.clone();
            Effect::sync(move || log.lock().push(1))
        });
        let effect = scope
            .add_finalizer(&record(&log, 2))
            .zip_right(&child.fork_in(&scope))
            .flat_map({
                let scope = scope.clone();
                move |fiber| {
                    Effect::yield_now()
                        .zip_right(&scope.close())
                        .zip_right(&fiber.await_exit())
                }
            });
        let exit = rt.run_sync(effect).unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn test_fiber_forked_from_finalizer_is_done_before_closed() {
        let rt = runtime();
        let scope = Scope::new();
        let slot: Arc<Mutex<Option<FiberHandle<(), Infallible>>>> = Arc::new(Mutex::new(None));
        let forks = {
            let slot = slot.clone();
            Effect::<(), Infallible>::never()
                .fork_in(&scope)
                .flat_map(move |fiber| {
                    let slot = slot.clone();
                    Effect::sync(move || *slot.lock() = Some(fiber.clone()))
                })
        };
        let effect = scope.add_finalizer(&forks).zip_right(&scope.close());
        assert!(rt.run_blocking(effect).is_success());

        let fiber = slot.lock().take().unwrap();
        assert!(fiber.poll().unwrap().is_interrupted());
        assert!(scope.is_closed());
    }

    #[test]
    fn test_child_scope_closes_with_parent() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = Scope::new();
        let inner_log = log.clone();
        let effect = parent
            .add_finalizer(&record(&log, 1))
            .zip_right(&parent.fork())
            .flat_map(move |child| child.add_finalizer(&record(&inner_log, 2)))
            .zip_right(&parent.close());
        rt.run_sync(effect).unwrap();
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[test]
    fn test_acquire_release() {
        let rt = runtime();
        let log = Arc::new(Mutex::new(Vec::new()));
        let release_log = log.clone();
        let scope = Scope::new();
        let acquire: Effect<u32, String> = Effect::succeed(5);
        let effect = scope
            .acquire_release(&acquire, move |n| {
                let log = release_log.clone();
                Effect::sync(move || log.lock().push(n))
            })
            .zip_left(&scope.close().widen_error::<String>());
        assert_eq!(rt.run_sync(effect).unwrap(), 5);
        assert_eq!(*log.lock(), vec![5]);
    }
}
