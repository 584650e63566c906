//! # Hub
//!
//! A bounded broadcast queue: every value published is delivered to every
//! subscription that existed when it was published.
//!
//! ## Design
//!
//! Values live in a fixed ring. Each slot records how many subscribers still
//! have to read it; a slot is freed once that count reaches zero. Every
//! subscription keeps its own cursor into the ring plus a FIFO of parked
//! takers.
//!
//! ```text
//!            subscribers_index           publisher_index
//!                   │                          │
//!   ring:  [ .. | v3 (2 left) | v4 (1 left) | _ | .. ]
//!                   ▲              ▲
//!             cursor(sub A)   cursor(sub B)
//! ```
//!
//! Overflow goes through the shared [`Strategy`]. Sliding evicts the oldest
//! slot regardless of who has read it; a lagging cursor then skips ahead.
//! With no subscribers a published value is accepted and discarded.
//!
//! Like the [`Queue`](crate::Queue), every state change ends with `settle`,
//! which refills the ring from parked publishers and feeds parked takers
//! until neither can make progress.

use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::deferred::Deferred;
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::strategy::{Buffer, Outcome, Publishers, Strategy};

// ============================================================================
// Ring
// ============================================================================

struct Ring<A> {
    slots: Vec<Option<A>>,
    remaining: Vec<usize>,
    publisher_index: u64,
    subscribers_index: u64,
    subscriber_count: usize,
}

impl<A: Clone> Ring<A> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            remaining: vec![0; capacity],
            publisher_index: 0,
            subscribers_index: 0,
            subscriber_count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }

    fn len(&self) -> usize {
        (self.publisher_index - self.subscribers_index) as usize
    }

    /// Values still unread by the subscriber at `cursor`.
    fn available(&self, cursor: u64) -> usize {
        (self.publisher_index - cursor.max(self.subscribers_index)) as usize
    }

    fn read(&mut self, cursor: &mut u64) -> Option<A> {
        if *cursor < self.subscribers_index {
            *cursor = self.subscribers_index;
        }
        if *cursor >= self.publisher_index {
            return None;
        }
        let slot = self.slot(*cursor);
        let value = self.slots[slot].clone();
        self.remaining[slot] = self.remaining[slot].saturating_sub(1);
        *cursor += 1;
        self.advance();
        value
    }

    /// Give up every unread slot from `cursor` on.
    fn release(&mut self, cursor: u64) {
        for index in cursor.max(self.subscribers_index)..self.publisher_index {
            let slot = self.slot(index);
            self.remaining[slot] = self.remaining[slot].saturating_sub(1);
        }
        self.advance();
    }

    /// Free fully read slots at the front.
    fn advance(&mut self) {
        while self.subscribers_index < self.publisher_index {
            let slot = self.slot(self.subscribers_index);
            if self.remaining[slot] > 0 {
                break;
            }
            self.slots[slot] = None;
            self.subscribers_index += 1;
        }
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.remaining.iter_mut().for_each(|r| *r = 0);
        self.subscribers_index = self.publisher_index;
    }
}

impl<A: Clone> Buffer<A> for Ring<A> {
    fn publish(&mut self, value: A) -> Result<(), A> {
        if self.subscriber_count == 0 {
            return Ok(());
        }
        if self.len() >= self.capacity() {
            return Err(value);
        }
        let slot = self.slot(self.publisher_index);
        self.slots[slot] = Some(value);
        self.remaining[slot] = self.subscriber_count;
        self.publisher_index += 1;
        Ok(())
    }

    fn slide(&mut self) {
        if self.subscribers_index < self.publisher_index {
            let slot = self.slot(self.subscribers_index);
            self.slots[slot] = None;
            self.remaining[slot] = 0;
            self.subscribers_index += 1;
        }
    }
}

// ============================================================================
// Hub state
// ============================================================================

struct SubscriberState<A> {
    cursor: u64,
    /// Values handed to takers that were interrupted before resuming.
    stash: VecDeque<A>,
    takers: VecDeque<Deferred<A, Infallible>>,
}

struct State<A> {
    ring: Ring<A>,
    subscribers: BTreeMap<u64, SubscriberState<A>>,
    next_subscriber: u64,
    publishers: Publishers<A>,
    shutdown: bool,
}

struct Wakeups<A> {
    deliveries: Vec<(Deferred<A, Infallible>, A)>,
    released: Vec<Deferred<bool, Infallible>>,
}

impl<A: Data> Wakeups<A> {
    fn new() -> Self {
        Self {
            deliveries: Vec::new(),
            released: Vec::new(),
        }
    }

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
    fn take_one(&mut self, id: u64) -> Option<A> {
        let subscriber = self.subscribers.get_mut(&id)?;
        if let Some(value) = subscriber.stash.pop_front() {
            return Some(value);
        }
        self.ring.read(&mut subscriber.cursor)
    }

    fn available(&self, id: u64) -> usize {
        match self.subscribers.get(&id) {
            Some(subscriber) => subscriber.stash.len() + self.ring.available(subscriber.cursor),
            None => 0,
        }
    }

    fn settle(&mut self) -> Wakeups<A> {
        let mut wakeups = Wakeups::new();
        loop {
            wakeups
                .released
                .extend(self.publishers.drain_into(&mut self.ring));
            let mut progressed = false;
            let waiting: Vec<u64> = self
                .subscribers
                .iter()
                .filter(|(_, s)| !s.takers.is_empty())
                .map(|(id, _)| *id)
                .collect();
            for id in waiting {
                loop {
                    let has_taker = self
                        .subscribers
                        .get(&id)
                        .is_some_and(|s| !s.takers.is_empty());
                    if !has_taker {
                        break;
                    }
                    let Some(value) = self.take_one(id) else {
                        break;
                    };
                    if let Some(taker) = self
                        .subscribers
                        .get_mut(&id)
                        .and_then(|s| s.takers.pop_front())
                    {
                        wakeups.deliveries.push((taker, value));
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
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

impl<A: Data> Inner<A> {
    fn subscribe(self: &Arc<Self>) -> Option<Subscription<A>> {
        let id = {
            let mut state = self.state.lock();
            if state.shutdown {
                return None;
            }
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            let cursor = state.ring.publisher_index;
            state.ring.subscriber_count += 1;
            state.subscribers.insert(
                id,
                SubscriberState {
                    cursor,
                    stash: VecDeque::new(),
                    takers: VecDeque::new(),
                },
            );
            id
        };
        trace!(subscriber = id, "hub subscription opened");
        Some(Subscription {
            handle: Arc::new(SubscriptionHandle {
                id,
                hub: self.clone(),
            }),
        })
    }

    /// Remove a subscription, interrupting its parked takers as `by`.
    fn unsubscribe(&self, id: u64, by: FiberId) {
        let (takers, wakeups) = {
            let mut state = self.state.lock();
            let Some(subscriber) = state.subscribers.remove(&id) else {
                return;
            };
            state.ring.subscriber_count -= 1;
            state.ring.release(subscriber.cursor);
            (subscriber.takers, state.settle())
        };
        for taker in takers {
            taker.try_complete(Exit::interrupt(by));
        }
        wakeups.run();
        trace!(subscriber = id, "hub subscription closed");
    }

    fn cancel_taker(&self, id: u64, taker: &Deferred<A, Infallible>) {
        let wakeups = {
            let mut state = self.state.lock();
            let Some(subscriber) = state.subscribers.get_mut(&id) else {
                return;
            };
            subscriber.takers.retain(|t| !t.ptr_eq(taker));
            if let Some(Exit::Success(value)) = taker.poll() {
                subscriber.stash.push_front(value);
            }
            state.settle()
        };
        wakeups.run();
    }
}

/// A bounded broadcast queue.
pub struct Hub<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Hub<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("capacity", &self.inner.capacity)
            .field("strategy", &self.inner.strategy)
            .finish()
    }
}

enum Published {
    Shutdown,
    Done(bool),
    Parked(Deferred<bool, Infallible>),
}

impl<A: Data> Hub<A> {
    /// A hub buffering at most `capacity` values (at least one).
    pub fn bounded(capacity: usize, strategy: Strategy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                strategy,
                state: Mutex::new(State {
                    ring: Ring::new(capacity),
                    subscribers: BTreeMap::new(),
                    next_subscriber: 0,
                    publishers: Publishers::new(),
                    shutdown: false,
                }),
                shutdown_hook: Deferred::new(),
            }),
        }
    }

    /// Create a hub inside an effect.
    pub fn make(capacity: usize, strategy: Strategy) -> Effect<Self, Infallible> {
        Effect::sync(move || Self::bounded(capacity, strategy))
    }

    /// A hub whose publishers wait for the slowest subscriber.
    pub fn back_pressure(capacity: usize) -> Self {
        Self::bounded(capacity, Strategy::BackPressure)
    }

    /// A hub that discards values published while full.
    pub fn dropping(capacity: usize) -> Self {
        Self::bounded(capacity, Strategy::Dropping)
    }

    /// A hub that evicts its oldest value when full.
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

    /// Number of values not yet read by every subscriber.
    pub fn size(&self) -> usize {
        self.inner.state.lock().ring.len()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// True once [`Hub::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Publish one value. See [`Hub::publish_all`].
    pub fn publish(&self, value: A) -> Effect<bool, Infallible> {
        self.publish_all(vec![value])
    }

    /// Alias for [`Hub::publish`].
    pub fn offer(&self, value: A) -> Effect<bool, Infallible> {
        self.publish(value)
    }

    /// Alias for [`Hub::publish_all`].
    pub fn offer_all(&self, values: Vec<A>) -> Effect<bool, Infallible> {
        self.publish_all(values)
    }

    /// Publish values in order.
    ///
    /// Succeeds with `false` if a dropping hub discarded any of them. A
    /// back-pressured publish suspends until every value has a slot.
    pub fn publish_all(&self, values: Vec<A>) -> Effect<bool, Infallible> {
        let hub = self.clone();
        Effect::suspend(move || {
            let (published, wakeups) = {
                let mut state = hub.inner.state.lock();
                if state.shutdown {
                    (Published::Shutdown, None)
                } else {
                    let backlog = !state.publishers.is_empty();
                    let published =
                        match hub.inner.strategy.offer(&mut state.ring, values.clone(), backlog) {
                            Outcome::Done(accepted) => Published::Done(accepted),
                            Outcome::Park(rest) => {
                                let publisher = Deferred::new();
                                state.publishers.park(rest, &publisher);
                                Published::Parked(publisher)
                            }
                        };
                    (published, Some(state.settle()))
                }
            };
            if let Some(wakeups) = wakeups {
                wakeups.run();
            }
            match published {
                Published::Shutdown => Effect::interrupt(),
                Published::Done(accepted) => Effect::succeed(accepted),
                Published::Parked(publisher) => {
                    let hub = hub.clone();
                    let parked = publisher.clone();
                    publisher.wait().on_interrupt(move |_| {
                        let hub = hub.clone();
                        let parked = parked.clone();
                        Effect::sync(move || hub.inner.state.lock().publishers.remove(&parked))
                    })
                }
            }
        })
    }

    /// Open a subscription that receives every value published from now on.
    pub fn subscribe(&self) -> Effect<Subscription<A>, Infallible> {
        let hub = self.clone();
        Effect::suspend(move || match hub.inner.subscribe() {
            Some(subscription) => Effect::succeed(subscription),
            None => Effect::interrupt(),
        })
    }

    /// Shut the hub down, interrupting every suspended publisher and taker.
    /// Later operations interrupt their caller.
    pub fn shutdown(&self) -> Effect<(), Infallible> {
        let hub = self.clone();
        Effect::<_, Infallible>::fiber_id().flat_map(move |by| {
            let parked = {
                let mut state = hub.inner.state.lock();
                if state.shutdown {
                    None
                } else {
                    state.shutdown = true;
                    state.ring.clear();
                    let takers: Vec<_> = state
                        .subscribers
                        .values_mut()
                        .flat_map(|s| s.takers.drain(..))
                        .collect();
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
                hub.inner.shutdown_hook.try_complete(Exit::Success(()));
            }
            Effect::unit()
        })
    }

    /// Suspend until the hub is shut down.
    pub fn await_shutdown(&self) -> Effect<(), Infallible> {
        self.inner.shutdown_hook.wait()
    }
}

// ============================================================================
// Subscription
// ============================================================================

struct SubscriptionHandle<A: Data> {
    id: u64,
    hub: Arc<Inner<A>>,
}

impl<A: Data> Drop for SubscriptionHandle<A> {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id, FiberId::NONE);
    }
}

/// One subscriber's view of a [`Hub`].
///
/// Unsubscribes when the last clone is dropped.
pub struct Subscription<A: Data> {
    handle: Arc<SubscriptionHandle<A>>,
}

impl<A: Data> Clone for Subscription<A> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<A: Data> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.handle.id)
            .finish()
    }
}

enum Taken<A> {
    Shutdown,
    Value(A),
    Parked(Deferred<A, Infallible>),
}

impl<A: Data> Subscription<A> {
    fn hub(&self) -> &Arc<Inner<A>> {
        &self.handle.hub
    }

    /// Values waiting for this subscriber.
    pub fn size(&self) -> usize {
        self.hub().state.lock().available(self.handle.id)
    }

    /// Take the next value, suspending until one is published.
    pub fn take(&self) -> Effect<A, Infallible> {
        let this = self.clone();
        Effect::suspend(move || {
            let id = this.handle.id;
            let (taken, wakeups) = {
                let mut state = this.hub().state.lock();
                if state.shutdown || !state.subscribers.contains_key(&id) {
                    (Taken::Shutdown, None)
                } else if let Some(value) = state.take_one(id) {
                    (Taken::Value(value), Some(state.settle()))
                } else {
                    let taker = Deferred::new();
                    if let Some(subscriber) = state.subscribers.get_mut(&id) {
                        subscriber.takers.push_back(taker.clone());
                    }
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
                    let this = this.clone();
                    let parked = taker.clone();
                    taker.wait().on_interrupt(move |_| {
                        let this = this.clone();
                        let parked = parked.clone();
                        Effect::sync(move || this.hub().cancel_taker(this.handle.id, &parked))
                    })
                }
            }
        })
    }

    /// Take every value waiting for this subscriber without suspending.
    pub fn take_all(&self) -> Effect<Vec<A>, Infallible> {
        self.take_up_to(usize::MAX)
    }

    /// Take up to `max` waiting values without suspending.
    pub fn take_up_to(&self, max: usize) -> Effect<Vec<A>, Infallible> {
        let this = self.clone();
        Effect::suspend(move || {
            let id = this.handle.id;
            let (taken, wakeups) = {
                let mut state = this.hub().state.lock();
                if state.shutdown || !state.subscribers.contains_key(&id) {
                    (None, None)
                } else {
                    let mut values = Vec::new();
                    while values.len() < max {
                        match state.take_one(id) {
                            Some(value) => values.push(value),
                            None => break,
                        }
                    }
                    (Some(values), Some(state.settle()))
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

    /// Take the next value if there is one.
    pub fn poll(&self) -> Effect<Option<A>, Infallible> {
        self.take_up_to(1).map(|mut values| values.pop())
    }

    /// Stop receiving values and free this subscriber's unread slots.
    ///
    /// Suspended takers of this subscription are interrupted.
    pub fn unsubscribe(&self) -> Effect<(), Infallible> {
        let this = self.clone();
        Effect::<_, Infallible>::fiber_id().map(move |by| this.hub().unsubscribe(this.handle.id, by))
    }
}

// ============================================================================
// Tests
// ============================================================================
