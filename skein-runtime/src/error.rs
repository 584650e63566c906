//! # Runtime Errors
//!
//! Errors surfaced to host code. Failures inside effects travel as
//! [`Cause`]s; these types only appear at the boundary where an effect is
//! run from outside the runtime.

use std::fmt;

use thiserror::Error;

use crate::cause::Cause;
use crate::config::ConfigError;
use crate::fiber::FiberId;

/// Errors raised by the runtime itself.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// `run_sync` reached an asynchronous suspension.
    #[error("fiber {fiber_id} cannot be resolved synchronously: it suspended on an asynchronous operation")]
    AsyncFiber {
        /// The fiber that suspended.
        fiber_id: FiberId,
    },

    /// The runtime's scheduler has been shut down.
    #[error("runtime is shut down")]
    Shutdown,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A failed effect, carrying its complete cause.
#[derive(Clone, PartialEq)]
pub struct FiberFailure<E> {
    /// Everything that went wrong, in order.
    pub cause: Cause<E>,
}

impl<E> FiberFailure<E> {
    /// Wrap a cause.
    pub fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }

    /// The underlying cause.
    pub fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Unwrap into the cause.
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }

    /// True if the effect was interrupted rather than failed.
    pub fn is_interrupted(&self) -> bool {
        self.cause.is_interrupted()
    }
}

impl<E: fmt::Debug> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberFailure")
            .field("cause", &self.cause)
            .finish()
    }
}

impl<E: fmt::Debug> fmt::Display for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber failed: {}", self.cause.pretty())
    }
}

impl<E: fmt::Debug> std::error::Error for FiberFailure<E> {}

impl<E> From<Cause<E>> for FiberFailure<E> {
    fn from(cause: Cause<E>) -> Self {
        Self::new(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Defect;

    #[test]
    fn test_async_fiber_message() {
        let err = RuntimeError::AsyncFiber {
            fiber_id: FiberId::NONE,
        };
        assert!(err.to_string().contains("synchronously"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: RuntimeError = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_fiber_failure_keeps_whole_cause() {
        let cause = Cause::fail("first".to_string()).then(Cause::die(Defect::new("finalizer")));
        let failure = FiberFailure::new(cause.clone());
        assert_eq!(failure.cause(), &cause);
        let rendered = failure.to_string();
        assert!(rendered.contains("first"));
        assert!(rendered.contains("finalizer"));
    }
}
