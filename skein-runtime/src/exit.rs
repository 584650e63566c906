//! # Exit
//!
//! The single final outcome of a fiber: a value or a [`Cause`].

use crate::cause::{Cause, Defect};
use crate::effect::{erase, erase_cause, unerase, unerase_cause, AnyExit, Data};
use crate::fiber::FiberId;

/// Result of running an effect to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// The effect produced a value.
    Success(A),
    /// The effect did not succeed.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// An exit failed with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// An exit failed with the given cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// An exit failed with a defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An exit interrupted by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(fiber))
    }

    /// True on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True on failure of any kind.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True when the failure cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Failure(cause) => cause.is_interrupted(),
            Exit::Success(_) => false,
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(value) => Some(value),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(value) => Exit::Success(f(value)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the typed errors.
    pub fn map_err<E2>(self, f: impl Fn(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(value) => Exit::Success(value),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Convert into a `Result`, keeping the whole cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(value) => Ok(value),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<A: Data, E: Data> Exit<A, E> {
    pub(crate) fn erase(self) -> AnyExit {
        match self {
            Exit::Success(value) => Exit::Success(erase(value)),
            Exit::Failure(cause) => Exit::Failure(erase_cause(cause)),
        }
    }

    pub(crate) fn unerase(exit: AnyExit) -> Self {
        match exit {
            Exit::Success(value) => Exit::Success(unerase(value)),
            Exit::Failure(cause) => Exit::Failure(unerase_cause(cause)),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Exit::Success(value),
            Err(error) => Exit::fail(error),
        }
    }
}
