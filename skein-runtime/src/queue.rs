//! # Queue
//!
//! A bounded, point-to-point queue: each value is delivered to exactly one
//! taker.
//!
//! ## Design
//!
//! State lives behind one short critical section. Fibers that cannot make
//! progress never block a host thread; they park on a [`Deferred`]:
//!
//! - a taker finding the queue empty parks a `Deferred<A>` in `takers`
//! - a back-pressured publisher parks its surplus in [`Publishers`]
//!
//! After every state change `settle` refills the buffer from parked
//! publishers and hands buffered values to parked takers in FIFO order. The
//! resulting deferreds are completed after the lock is released.
//!
//! A taker interrupted after it was handed a value gives the value back to
//! the front of the queue.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::deferred::Deferred;
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::strategy::{Buffer, Outcome, Publishers, Strategy};

struct Ring<A> {
    items: VecDeque<A>,
    capacity: usize,
}

impl<A> Buffer<A> for Ring<A> {
    fn publish(&mut self, value: A) -> Result<(), A> {
        if self.items.len() >= self.capacity {
            return Err(value);
        }
        self.items.push_back(value);
        Ok(())
    }

    fn slide(&mut self) {
        self.items.pop_front();
    }
}

struct State<A> {
    ring: Ring<A>,
    takers: VecDeque<Deferred<A, Infallible>>,
    publishers: Publishers<A>,
    shutdown: bool,
}

/// Deferreds to complete once the lock is released.
struct Wakeups<A> {
    deliveries: Vec<(Deferred<A, Infallible>, A)>,
    released: Vec<Deferred<bool, Infallible>>,
}

impl<A: Data> Wakeups<A> {
    fn run(self) {
        for (taker, value) in self.deliveries {
            taker.try_complete(Exit::Success(value));
        }
        for publisher in self.released {
            publisher.try_complete(Exit::Success(true));
        }
    }
}

impl<A: Data> State<A> {
    fn settle(&mut self) -> Wakeups<A> {
        let mut wakeups = Wakeups {
            deliveries: Vec::new(),
            released: Vec::new(),
        };
        loop {
            wakeups
                .released
                .extend(self.publishers.drain_into(&mut self.ring));
            if self.takers.is_empty() || self.ring.items.is_empty() {
                break;
            }
            while !self.takers.is_empty() {
                let Some(value) = self.ring.items.pop_front() else {
                    break;
                };
                if let Some(taker) = self.takers.pop_front() {
                    wakeups.deliveries.push((taker, value));
                }
            }
        }
        wakeups
    }
}

struct Inner<A> {
    capacity: usize,
    strategy: Strategy,
    state: Mutex<State<A>>,
    shutdown_hook: Deferred<(), Infallible>,
}

/// A bounded multi-producer, multi-consumer queue.
pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.inner.capacity)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

enum Offered {
    Shutdown,
    Done(bool),
    Parked(Deferred<bool, Infallible>),
}

enum Taken<A> {
    Shutdown,
    Value(A),
    Parked(Deferred<A, Infallible>),
}

impl<A: Data> Queue<A> {
    /// A queue holding at most `capacity` values (at least one).
    pub fn bounded(capacity: usize, strategy: Strategy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                strategy,
                state: Mutex::new(State {
                    ring: Ring {
                        items: VecDeque::with_capacity(capacity),
                        capacity,
                    },
                    takers: VecDeque::new(),
                    publishers: Publishers::new(),
                    shutdown: false,
                }),
                shutdown_hook: Deferred::new(),
            }),
        }
    }

    /// Create a queue inside an effect.
    pub fn make(capacity: usize, strategy: Strategy) -> Effect<Self, Infallible> {
        Effect::sync(move || Self::bounded(capacity, strategy))
    }

    /// Shorthand for a back-pressured queue.
    pub fn back_pressure(capacity: usize) -> Self {
        Self::bounded(capacity, Strategy::BackPressure)
    }

    /// Shorthand for a dropping queue.
    pub fn dropping(capacity: usize) -> Self {
        Self::bounded(capacity, Strategy::Dropping)
    }

    /// Shorthand for a sliding queue.
    pub fn sliding(capacity: usize) -> Self {
        Self::bounded(capacity, Strategy::Sliding)
    }

    /// Maximum number of buffered values.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The overflow strategy.
    pub fn strategy(&self) -> Strategy {
        self.inner.strategy
    }

    /// Number of buffered values.
    pub fn size(&self) -> usize {
        self.inner.state.lock().ring.items.len()
    }

    /// True once [`Queue::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Offer one value. See [`Queue::offer_all`].
    pub fn offer(&self, value: A) -> Effect<bool, Infallible> {
        self.offer_all(vec![value])
    }

    /// Offer values in order.
    ///
    /// Succeeds with `false` if a dropping queue discarded any of them. A
    /// back-pressured offer suspends until every value is accepted.
    pub fn offer_all(&self, values: Vec<A>) -> Effect<bool, Infallible> {
        let queue = self.clone();
        Effect::suspend(move || {
            let (offered, wakeups) = {
                let mut state = queue.inner.state.lock();
                if state.shutdown {
                    (Offered::Shutdown, None)
                } else {
                    let backlog = !state.publishers.is_empty();
                    let offered = match queue.inner.strategy.offer(
                        &mut state.ring,
                        values.clone(),
                        backlog,
                    ) {
                        Outcome::Done(accepted) => Offered::Done(accepted),
                        Outcome::Park(rest) => {
                            let publisher = Deferred::new();
                            state.publishers.park(rest, &publisher);
                            Offered::Parked(publisher)
                        }
                    };
                    (offered, Some(state.settle()))
                }
            };
            if let Some(wakeups) = wakeups {
                wakeups.run();
            }
            match offered {
                Offered::Shutdown => Effect::interrupt(),
                Offered::Done(accepted) => Effect::succeed(accepted),
                Offered::Parked(publisher) => {
                    let queue = queue.clone();
                    let parked = publisher.clone();
                    publisher.wait().on_interrupt(move |_| {
                        let queue = queue.clone();
                        let parked = parked.clone();
                        Effect::sync(move || queue.inner.state.lock().publishers.remove(&parked))
                    })
                }
            }
        })
    }

    /// Take the oldest value, suspending while the queue is empty.
    pub fn take(&self) -> Effect<A, Infallible> {
        let queue = self.clone();
        Effect::suspend(move || {
            let (taken, wakeups) = {
                let mut state = queue.inner.state.lock();
                if state.shutdown {
                    (Taken::Shutdown, None)
                } else if let Some(value) = state.ring.items.pop_front() {
                    (Taken::Value(value), Some(state.settle()))
                } else {
                    let taker = Deferred::new();
                    state.takers.push_back(taker.clone());
                    (Taken::Parked(taker), None)
                }
            };
            if let Some(wakeups) = wakeups {
                wakeups.run();
            }
            match taken {
                Taken::Shutdown => Effect::interrupt(),
                Taken::Value(value) => Effect::succeed(value),
                Taken::Parked(taker) => {
                    let queue = queue.clone();
                    let parked = taker.clone();
                    taker.wait().on_interrupt(move |_| {
                        let queue = queue.clone();
                        let parked = parked.clone();
                        Effect::sync(move || queue.cancel_taker(&parked))
                    })
                }
            }
        })
    }

    /// Take every buffered value without suspending.
    pub fn take_all(&self) -> Effect<Vec<A>, Infallible> {
        self.take_up_to(usize::MAX)
    }

    /// Take up to `max` buffered values without suspending.
    pub fn take_up_to(&self, max: usize) -> Effect<Vec<A>, Infallible> {
        let queue = self.clone();
        Effect::suspend(move || {
            let (taken, wakeups) = {
                let mut state = queue.inner.state.lock();
                if state.shutdown {
                    (None, None)
                } else {
                    let n = max.min(state.ring.items.len());
                    let taken: Vec<A> = state.ring.items.drain(..n).collect();
                    (Some(taken), Some(state.settle()))
                }
            };
            if let Some(wakeups) = wakeups {
                wakeups.run();
            }
            match taken {
                Some(values) => Effect::succeed(values),
                None => Effect::interrupt(),
            }
        })
    }

    /// Take the oldest value if there is one.
    pub fn poll(&self) -> Effect<Option<A>, Infallible> {
        self.take_up_to(1).map(|mut values| values.pop())
    }

    /// Shut the queue down, interrupting every suspended taker and publisher.
    /// Later operations interrupt their caller.
    pub fn shutdown(&self) -> Effect<(), Infallible> {
        let queue = self.clone();
        Effect::<_, Infallible>::fiber_id().flat_map(move |by| {
            let parked = {
                let mut state = queue.inner.state.lock();
                if state.shutdown {
                    None
                } else {
                    state.shutdown = true;
                    state.ring.items.clear();
                    let takers: Vec<_> = state.takers.drain(..).collect();
                    Some((takers, state.publishers.take_all()))
                }
            };
            if let Some((takers, publishers)) = parked {
                for taker in takers {
                    taker.try_complete(Exit::interrupt(by));
                }
                for publisher in publishers {
                    publisher.try_complete(Exit::interrupt(by));
                }
                queue.inner.shutdown_hook.try_complete(Exit::Success(()));
            }
            Effect::unit()
        })
    }

    /// Suspend until the queue is shut down.
    pub fn await_shutdown(&self) -> Effect<(), Infallible> {
        self.inner.shutdown_hook.wait()
    }

    fn cancel_taker(&self, taker: &Deferred<A, Infallible>) {
        let wakeups = {
            let mut state = self.inner.state.lock();
            state.takers.retain(|t| !t.ptr_eq(taker));
            match taker.poll() {
                Some(Exit::Success(value)) if !state.shutdown => {
                    state.ring.items.push_front(value);
                    Some(state.settle())
                }
                _ => None,
            }
        };
        if let Some(wakeups) = wakeups {
            wakeups.run();
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

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    #[test]
    fn test_offer_then_take_fifo() {
        let rt = runtime();
        let queue: Queue<u32> = Queue::back_pressure(4);
        let effect = queue
            .offer_all(vec![1, 2, 3])
            .zip_right(&queue.take())
            .zip(&queue.take_all());
        assert_eq!(rt.run_sync(effect).unwrap(), (1, vec![2, 3]));
    }

    #[test]
    fn test_dropping_rejects_when_full() {
        let rt = runtime();
        let queue: Queue<u32> = Queue::dropping(2);
        let effect = queue
            .offer(1)
            .zip(&queue.offer(2))
            .zip(&queue.offer(3))
            .zip(&queue.take_all());
        let (((a, b), c), values) = rt.run_sync(effect).unwrap();
        assert!(a && b && !c);
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_sliding_evicts_oldest() {
        let rt = runtime();
        let queue: Queue<u32> = Queue::sliding(2);
        let effect = queue.offer_all(vec![1, 2, 3]).zip(&queue.take_all());
        assert_eq!(rt.run_sync(effect).unwrap(), (true, vec![2, 3]));
    }

    #[test]
    fn test_take_suspends_until_offer() {
        let rt = runtime();
        let queue: Queue<&'static str> = Queue::back_pressure(1);
        let q = queue.clone();
        let effect = queue.take().fork().flat_map(move |taker| {
            Effect::yield_now()
                .zip_right(&q.offer("hello"))
                .zip_right(&taker.join())
        });
        assert_eq!(rt.run_sync(effect).unwrap(), "hello");
    }

    #[test]
    fn test_back_pressure_suspends_publisher() {
        let rt = runtime();
        let queue: Queue<u32> = Queue::back_pressure(2);
        let q = queue.clone();
        let effect = queue.offer_all(vec![1, 2, 3]).fork().flat_map(move |publisher| {
            let q = q.clone();
            Effect::yield_now()
                .map({
                    let publisher = publisher.clone();
                    move |_| publisher.status().is_suspended()
                })
                .zip(&q.take())
                .zip(&publisher.join())
                .zip(&q.take_all())
        });
        let (((blocked, first), accepted), rest) = rt.run_sync(effect).unwrap();
        assert!(blocked);
        assert_eq!(first, 1);
        assert!(accepted);
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn test_interrupted_taker_leaves_no_trace() {
        let rt = runtime();
        let queue: Queue<u32> = Queue::back_pressure(2);
        let q = queue.clone();
        let effect = queue.take().fork().flat_map(move |taker| {
            let q = q.clone();
            Effect::yield_now()
                .zip_right(&taker.interrupt())
                .zip_right(&q.offer(7))
                .zip_right(&q.take())
        });
        assert_eq!(rt.run_sync(effect).unwrap(), 7);
    }

    #[test]
    fn test_shutdown_interrupts_takers() {
        let rt = runtime();
        let queue: Queue<u32> = Queue::back_pressure(2);
        let q = queue.clone();
        let effect = queue.take().fork().flat_map(move |taker| {
            Effect::yield_now()
                .zip_right(&q.shutdown())
                .zip_right(&taker.await_exit())
        });
        let exit = rt.run_sync(effect).unwrap();
        assert!(exit.is_interrupted());
        assert!(queue.is_shutdown());
        assert!(rt.run_sync_exit(queue.offer(1)).is_interrupted());
    }
}
