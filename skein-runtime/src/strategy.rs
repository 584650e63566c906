//! # Overflow Strategies
//!
//! What a bounded [`Queue`](crate::Queue) or [`Hub`](crate::Hub) does with a
//! value that does not fit.
//!
//! ## Design
//!
//! Both structures expose their storage as a [`Buffer`] and run every offer
//! through [`Strategy::offer`], so the three policies share one code path:
//!
//! | Strategy | Buffer full |
//! |----------|-------------|
//! | `BackPressure` | the rest of the batch is parked with the publisher |
//! | `Dropping` | the rest of the batch is discarded, the offer reports `false` |
//! | `Sliding` | the oldest value is evicted, once per value that does not fit |
//!
//! Parked publishers live in [`Publishers`], a FIFO of values each tagged
//! with the publisher's [`Deferred`]. They are moved into the buffer as room
//! appears; a publisher is released when its last value is accepted.

use std::collections::VecDeque;
use std::convert::Infallible;

use crate::deferred::Deferred;
use crate::effect::Data;

/// Policy applied when a bounded buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Suspend the publisher until there is room. Nothing is lost.
    #[default]
    BackPressure,
    /// Discard the new value.
    Dropping,
    /// Evict the oldest value to make room for the new one.
    Sliding,
}

/// Bounded storage a strategy operates on.
pub(crate) trait Buffer<A> {
    /// Insert `value` if there is room, otherwise hand it back.
    fn publish(&mut self, value: A) -> Result<(), A>;

    /// Evict the oldest value.
    fn slide(&mut self);
}

/// Result of running a batch through a strategy.
#[derive(Debug, PartialEq)]
pub(crate) enum Outcome<A> {
    /// The offer completed; `false` if any value was dropped.
    Done(bool),
    /// The remaining values must wait for room.
    Park(Vec<A>),
}

impl Strategy {
    /// Insert `values` into `buffer` following the strategy.
    ///
    /// `backlog` is true when publishers are already parked; back-pressured
    /// offers then queue behind them to keep publication order.
    pub(crate) fn offer<A, B: Buffer<A>>(
        self,
        buffer: &mut B,
        values: Vec<A>,
        backlog: bool,
    ) -> Outcome<A> {
        if backlog && self == Strategy::BackPressure && !values.is_empty() {
            return Outcome::Park(values);
        }
        let mut values = values.into_iter();
        while let Some(value) = values.next() {
            let rejected = match buffer.publish(value) {
                Ok(()) => continue,
                Err(rejected) => rejected,
            };
            match self {
                Strategy::BackPressure => {
                    let mut rest = Vec::with_capacity(values.len() + 1);
                    rest.push(rejected);
                    rest.extend(values);
                    return Outcome::Park(rest);
                }
                Strategy::Dropping => return Outcome::Done(false),
                Strategy::Sliding => {
                    buffer.slide();
                    if buffer.publish(rejected).is_err() {
                        return Outcome::Done(false);
                    }
                }
            }
        }
        Outcome::Done(true)
    }
}

struct Parked<A> {
    value: A,
    publisher: Deferred<bool, Infallible>,
    last: bool,
}

/// Values of suspended publishers, in arrival order.
pub(crate) struct Publishers<A> {
    parked: VecDeque<Parked<A>>,
}

impl<A: Data> Publishers<A> {
    pub(crate) fn new() -> Self {
        Self {
            parked: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.parked.len()
    }

    /// Park `values` for `publisher`, released once the last one is accepted.
    pub(crate) fn park(&mut self, values: Vec<A>, publisher: &Deferred<bool, Infallible>) {
        let count = values.len();
        for (i, value) in values.into_iter().enumerate() {
            self.parked.push_back(Parked {
                value,
                publisher: publisher.clone(),
                last: i + 1 == count,
            });
        }
    }

    /// Move parked values into `buffer` while it has room.
    ///
    /// Returns the publishers whose batches are now fully accepted; complete
    /// them after releasing any lock.
    pub(crate) fn drain_into<B: Buffer<A>>(
        &mut self,
        buffer: &mut B,
    ) -> Vec<Deferred<bool, Infallible>> {
        let mut released = Vec::new();
        while let Some(parked) = self.parked.pop_front() {
            match buffer.publish(parked.value) {
                Ok(()) => {
                    if parked.last {
                        released.push(parked.publisher);
                    }
                }
                Err(value) => {
                    self.parked.push_front(Parked { value, ..parked });
                    break;
                }
            }
        }
        released
    }

    /// Forget everything `publisher` still has parked.
    pub(crate) fn remove(&mut self, publisher: &Deferred<bool, Infallible>) {
        self.parked.retain(|parked| !parked.publisher.ptr_eq(publisher));
    }

    /// Drop every parked value, returning the distinct publishers.
    pub(crate) fn take_all(&mut self) -> Vec<Deferred<bool, Infallible>> {
        let mut publishers: Vec<Deferred<bool, Infallible>> = Vec::new();
        for parked in self.parked.drain(..) {
            if !publishers.iter().any(|p| p.ptr_eq(&parked.publisher)) {
                publishers.push(parked.publisher);
            }
        }
        publishers
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        items: VecDeque<u32>,
        capacity: usize,
    }

    impl Fixed {
        fn new(capacity: usize) -> Self {
            Self {
                items: VecDeque::new(),
                capacity,
            }
        }
    }

    impl Buffer<u32> for Fixed {
        fn publish(&mut self, value: u32) -> Result<(), u32> {
            if self.items.len() == self.capacity {
                return Err(value);
            }
            self.items.push_back(value);
            Ok(())
        }

        fn slide(&mut self) {
            self.items.pop_front();
        }
    }

    #[test]
    fn test_dropping_keeps_oldest() {
        let mut buffer = Fixed::new(2);
        let outcome = Strategy::Dropping.offer(&mut buffer, vec![1, 2, 3], false);
        assert_eq!(outcome, Outcome::Done(false));
        assert_eq!(buffer.items, vec![1, 2]);
    }

    #[test]
    fn test_sliding_keeps_newest() {
        let mut buffer = Fixed::new(2);
        let outcome = Strategy::Sliding.offer(&mut buffer, vec![1, 2, 3], false);
        assert_eq!(outcome, Outcome::Done(true));
        assert_eq!(buffer.items, vec![2, 3]);
    }

    #[test]
    fn test_sliding_evicts_once_per_surplus_value() {
        let mut buffer = Fixed::new(3);
        buffer.items.push_back(0);
        let outcome = Strategy::Sliding.offer(&mut buffer, vec![1, 2, 3, 4], false);
        assert_eq!(outcome, Outcome::Done(true));
        assert_eq!(buffer.items, vec![2, 3, 4]);
    }

    #[test]
    fn test_back_pressure_parks_remainder() {
        let mut buffer = Fixed::new(2);
        let outcome = Strategy::BackPressure.offer(&mut buffer, vec![1, 2, 3, 4], false);
        assert_eq!(outcome, Outcome::Park(vec![3, 4]));
        assert_eq!(buffer.items, vec![1, 2]);
    }

    #[test]
    fn test_back_pressure_queues_behind_backlog() {
        let mut buffer = Fixed::new(2);
        let outcome = Strategy::BackPressure.offer(&mut buffer, vec![1], true);
        assert_eq!(outcome, Outcome::Park(vec![1]));
        assert!(buffer.items.is_empty());
    }

    #[test]
    fn test_publishers_release_after_last_value() {
        let mut buffer = Fixed::new(1);
        let mut publishers = Publishers::new();
        let first: Deferred<bool, Infallible> = Deferred::new();
        let second: Deferred<bool, Infallible> = Deferred::new();
        publishers.park(vec![1, 2], &first);
        publishers.park(vec![3], &second);

        assert!(publishers.drain_into(&mut buffer).is_empty());
        assert_eq!(publishers.len(), 2);

        buffer.items.clear();
        let released = publishers.drain_into(&mut buffer);
        assert_eq!(released.len(), 1);
        assert!(released[0].ptr_eq(&first));

        publishers.remove(&second);
        assert!(publishers.is_empty());
    }
}
