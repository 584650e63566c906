//! # Continuation Stack
//!
//! The explicit stack of pending handlers a fiber unwinds through.
//!
//! ## Design
//!
//! Composition nodes (`OnSuccess`, `OnFailure`, ...) push a frame and descend
//! into their first instruction instead of recursing on the host stack. A
//! value pops frames until one accepts values; a cause pops frames until one
//! accepts causes. Stack depth therefore tracks composition depth of the
//! *pending* work, never the host call depth.
//!
//! ```text
//! Success(v) ──► pop ──► OnSuccess(k)           ──► k(v)
//!                        OnSuccessAndFailure    ──► on_success(v)
//!                        OnFailure              ──► skipped
//!                        RevertFlags(p)         ──► restore flags, keep v
//!                        While(state, step)     ──► accumulate, loop again
//!
//! Failure(c) ──► pop ──► OnFailure / OnSuccessAndFailure ──► handler(c)
//!                        OnSuccess / While               ──► skipped
//!                        RevertFlags(p)                  ──► restore flags, keep c
//! ```

use std::sync::Arc;

use crate::effect::{AnyValue, CauseHandler, Continuation, LoopStep};
use crate::flags::RuntimeFlagsPatch;

/// A pending handler on a fiber's continuation stack.
pub(crate) enum Frame {
    OnSuccess(Continuation),
    OnFailure(CauseHandler),
    OnSuccessAndFailure {
        on_success: Continuation,
        on_failure: CauseHandler,
    },
    /// Restores the flags that were active before a scoped flag update.
    RevertFlags(RuntimeFlagsPatch),
    While {
        state: AnyValue,
        step: Arc<LoopStep>,
    },
}

impl Frame {
    fn handles_failure(&self) -> bool {
        matches!(
            self,
            Frame::OnFailure(_) | Frame::OnSuccessAndFailure { .. } | Frame::RevertFlags(_)
        )
    }

    fn handles_success(&self) -> bool {
        !matches!(self, Frame::OnFailure(_))
    }
}

/// The fiber's explicit continuation stack.
#[derive(Default)]
pub(crate) struct ContinuationStack {
    frames: Vec<Frame>,
}

impl ContinuationStack {
    pub(crate) fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop frames until one that accepts a success value.
    pub(crate) fn next_success(&mut self) -> Option<Frame> {
        while let Some(frame) = self.frames.pop() {
            if frame.handles_success() {
                return Some(frame);
            }
        }
        None
    }

    /// Pop frames until one that accepts a cause.
    pub(crate) fn next_failure(&mut self) -> Option<Frame> {
        while let Some(frame) = self.frames.pop() {
            if frame.handles_failure() {
                return Some(frame);
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{success_instr, unit_value};
    use crate::flags::RuntimeFlags;

    fn on_success() -> Frame {
        Frame::OnSuccess(Arc::new(success_instr))
    }

    fn on_failure() -> Frame {
        Frame::OnFailure(Arc::new(|_| success_instr(unit_value())))
    }

    #[test]
    fn test_success_skips_failure_handlers() {
        let mut stack = ContinuationStack::new();
        stack.push(on_success());
        stack.push(on_failure());
        stack.push(on_failure());
        assert!(matches!(stack.next_success(), Some(Frame::OnSuccess(_))));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_failure_skips_success_handlers() {
        let mut stack = ContinuationStack::new();
        stack.push(on_failure());
        stack.push(on_success());
        stack.push(on_success());
        assert!(matches!(stack.next_failure(), Some(Frame::OnFailure(_))));
        assert!(stack.next_failure().is_none());
    }

    #[test]
    fn test_revert_flags_seen_by_both_paths() {
        let patch = RuntimeFlagsPatch::enable(RuntimeFlags::INTERRUPTION);
        let mut stack = ContinuationStack::new();
        stack.push(Frame::RevertFlags(patch));
        stack.push(on_success());
        assert!(matches!(stack.next_failure(), Some(Frame::RevertFlags(_))));

        stack.push(Frame::RevertFlags(patch));
        stack.push(on_failure());
        assert!(matches!(stack.next_success(), Some(Frame::RevertFlags(_))));
        assert_eq!(stack.len(), 0);
    }
}
