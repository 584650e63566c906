//! # Effect
//!
//! Immutable descriptions of deferred, possibly asynchronous computations.
//!
//! ## Design
//!
//! An effect is a tree of [`Primitive`] instructions. Nodes are shared through
//! `Arc` and never mutated after construction; every combinator wraps the
//! instruction it is given in a new node. The typed facade [`Effect<A, E>`]
//! records the success and error types and erases them at the boundary, so
//! the interpreter only ever sees [`AnyValue`]s.
//!
//! ```text
//! Effect<A, E>  --instr-->  Arc<Primitive>  --fiber run loop-->  Exit<A, E>
//! ```
//!
//! Thunks and continuations are `Fn`, so an effect value can be run any number
//! of times.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::deferred::Deferred;
use crate::exit::Exit;
use crate::fiber::{AsyncResume, FiberContext, FiberHandle, FiberId};
use crate::flags::{RuntimeFlags, RuntimeFlagsPatch};
use crate::scope::Scope;

// ============================================================================
// Erased values
// ============================================================================

/// A type-erased value flowing through the interpreter.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

pub(crate) type AnyCause = Cause<AnyValue>;
pub(crate) type AnyExit = Exit<AnyValue, AnyValue>;

/// Values and errors the runtime can carry.
///
/// Clone is needed because every awaiter of a fiber observes the same exit.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + Send + Sync + 'static {}

pub(crate) fn erase<T: Data>(value: T) -> AnyValue {
    Arc::new(value)
}

pub(crate) fn unerase<T: Data>(value: AnyValue) -> T {
    match value.downcast::<T>() {
        Ok(typed) => Arc::try_unwrap(typed).unwrap_or_else(|shared| (*shared).clone()),
        // The typed facade only ever pairs an instruction with its own types.
        Err(_) => panic!(
            "effect value is not a {}",
            std::any::type_name::<T>()
        ),
    }
}

pub(crate) fn erase_cause<E: Data>(cause: Cause<E>) -> AnyCause {
    cause.map(erase)
}

pub(crate) fn unerase_cause<E: Data>(cause: AnyCause) -> Cause<E> {
    cause.map(unerase)
}

pub(crate) fn unit_value() -> AnyValue {
    static UNIT: OnceLock<AnyValue> = OnceLock::new();
    UNIT.get_or_init(|| Arc::new(())).clone()
}

pub(crate) fn absurd<T>(never: Infallible) -> T {
    match never {}
}

// ============================================================================
// Instructions
// ============================================================================

/// A shared, immutable instruction.
pub(crate) type Instr = Arc<Primitive>;

/// Hook run when a suspended fiber is interrupted.
pub type Canceler = Box<dyn FnOnce() + Send>;

pub(crate) type Continuation = Arc<dyn Fn(AnyValue) -> Instr + Send + Sync>;
pub(crate) type CauseHandler = Arc<dyn Fn(AnyCause) -> Instr + Send + Sync>;

/// The loop description carried by `WhileLoop` and its continuation frame.
pub(crate) struct LoopStep {
    pub(crate) check: Box<dyn Fn(&AnyValue) -> bool + Send + Sync>,
    pub(crate) body: Box<dyn Fn(&AnyValue) -> Instr + Send + Sync>,
    pub(crate) accumulate: Box<dyn Fn(AnyValue, AnyValue) -> AnyValue + Send + Sync>,
}

/// The closed instruction set interpreted by the fiber run loop.
pub(crate) enum Primitive {
    Success(AnyValue),
    Failure(AnyCause),
    Sync(Box<dyn Fn() -> Result<AnyValue, AnyCause> + Send + Sync>),
    Async {
        register: Box<dyn Fn(AsyncResume) -> Option<Canceler> + Send + Sync>,
        blocking_on: Option<FiberId>,
    },
    OnSuccess {
        first: Instr,
        k: Continuation,
    },
    OnFailure {
        first: Instr,
        k: CauseHandler,
    },
    OnSuccessAndFailure {
        first: Instr,
        on_success: Continuation,
        on_failure: CauseHandler,
    },
    UpdateFlagsScoped {
        patch: RuntimeFlagsPatch,
        body: Box<dyn Fn(RuntimeFlags) -> Instr + Send + Sync>,
    },
    WhileLoop {
        initial: AnyValue,
        step: Arc<LoopStep>,
    },
    YieldNow,
    WithFiber(Box<dyn Fn(&FiberContext<'_>) -> Instr + Send + Sync>),
}

impl Primitive {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Primitive::Success(_) => "Success",
            Primitive::Failure(_) => "Failure",
            Primitive::Sync(_) => "Sync",
            Primitive::Async { .. } => "Async",
            Primitive::OnSuccess { .. } => "OnSuccess",
            Primitive::OnFailure { .. } => "OnFailure",
            Primitive::OnSuccessAndFailure { .. } => "OnSuccessAndFailure",
            Primitive::UpdateFlagsScoped { .. } => "UpdateFlagsScoped",
            Primitive::WhileLoop { .. } => "WhileLoop",
            Primitive::YieldNow => "YieldNow",
            Primitive::WithFiber(_) => "WithFiber",
        }
    }

    /// Detach the nested instruction, leaving a unit in its place.
    fn take_first(&mut self) -> Option<Instr> {
        match self {
            Primitive::OnSuccess { first, .. }
            | Primitive::OnFailure { first, .. }
            | Primitive::OnSuccessAndFailure { first, .. } => {
                Some(std::mem::replace(first, unit_instr()))
            }
            _ => None,
        }
    }
}

// A long chain nests one `first` per combinator; dropping it recursively
// would use one stack frame per level.
impl Drop for Primitive {
    fn drop(&mut self) {
        let Some(first) = self.take_first() else {
            return;
        };
        let mut pending = vec![first];
        while let Some(instr) = pending.pop() {
            if let Ok(mut primitive) = Arc::try_unwrap(instr) {
                pending.extend(primitive.take_first());
            }
        }
    }
}

pub(crate) fn success_instr(value: AnyValue) -> Instr {
    Arc::new(Primitive::Success(value))
}

pub(crate) fn failure_instr(cause: AnyCause) -> Instr {
    Arc::new(Primitive::Failure(cause))
}

fn unit_instr() -> Instr {
    static UNIT: OnceLock<Instr> = OnceLock::new();
    UNIT.get_or_init(|| success_instr(unit_value())).clone()
}

// ============================================================================
// Typed facade
// ============================================================================

/// A lazy, re-runnable description of a computation that succeeds with `A`
/// or fails with `E`.
pub struct Effect<A, E = Infallible> {
    instr: Instr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            instr: self.instr.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("instr", &self.instr.name())
            .finish()
    }
}

/// Restores the interruptibility that was in effect outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    flags: RuntimeFlags,
}

impl Restore {
    /// Run `effect` with the outer interruptibility.
    pub fn apply<B: Data, E: Data>(&self, effect: &Effect<B, E>) -> Effect<B, E> {
        if self.flags.interruptible() {
            effect.interruptible()
        } else {
            effect.uninterruptible()
        }
    }
}

/// Resumes a fiber suspended in [`Effect::async_callback`].
///
/// Only the first call has any effect; later calls are ignored.
pub struct Callback<A, E> {
    resume: AsyncResume,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> Callback<A, E> {
    /// Resume with a value.
    pub fn succeed(&self, value: A) {
        self.resume.resume(success_instr(erase(value)));
    }

    /// Resume with a typed error.
    pub fn fail(&self, error: E) {
        self.fail_cause(Cause::fail(error));
    }

    /// Resume with a cause.
    pub fn fail_cause(&self, cause: Cause<E>) {
        self.resume.resume(failure_instr(erase_cause(cause)));
    }

    /// Resume with a defect.
    pub fn die(&self, defect: Defect) {
        self.fail_cause(Cause::die(defect));
    }

    /// Resume with an exit.
    pub fn done(&self, exit: Exit<A, E>) {
        match exit {
            Exit::Success(value) => self.succeed(value),
            Exit::Failure(cause) => self.fail_cause(cause),
        }
    }

    /// Resume by running `effect`.
    pub fn resume_with(&self, effect: Effect<A, E>) {
        self.resume.resume(effect.instr);
    }

    /// True once the callback has fired or the fiber was interrupted.
    pub fn is_claimed(&self) -> bool {
        self.resume.is_claimed()
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_instr(instr: Instr) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn instr(&self) -> Instr {
        self.instr.clone()
    }

    fn primitive(primitive: Primitive) -> Self {
        Self::from_instr(Arc::new(primitive))
    }
}

impl<E: Data> Effect<(), E> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::from_instr(unit_instr())
    }

    /// Give other fibers a chance to run.
    pub fn yield_now() -> Self {
        Self::primitive(Primitive::YieldNow)
    }
}

impl<E: Data> Effect<FiberId, E> {
    /// The id of the running fiber.
    pub fn fiber_id() -> Self {
        Self::with_fiber(|ctx| Effect::succeed(ctx.id()))
    }
}

impl<A: Data> Effect<A, Infallible> {
    /// View an effect that cannot fail as one with any error type.
    pub fn widen_error<E: Data>(&self) -> Effect<A, E> {
        Effect::from_instr(self.instr())
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_instr(success_instr(erase(value)))
    }

    /// Fail with a typed error.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// Fail with the given cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instr(failure_instr(erase_cause(cause)))
    }

    /// Fail with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::from_instr(failure_instr(Cause::die(defect)))
    }

    /// Complete with an existing exit.
    pub fn done(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(value) => Self::succeed(value),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// Run a synchronous side effect.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::primitive(Primitive::Sync(Box::new(move || Ok(erase(f())))))
    }

    /// Run a synchronous side effect that may fail.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::primitive(Primitive::Sync(Box::new(move || {
            f().map(erase).map_err(|e| Cause::fail(erase(e)))
        })))
    }

    /// Build the effect lazily, each time it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::primitive(Primitive::OnSuccess {
            first: unit_instr(),
            k: Arc::new(move |_| f().instr),
        })
    }

    /// Suspend until `register` resumes the fiber through its callback.
    ///
    /// `register` may return a canceler, run if the fiber is interrupted while
    /// waiting.
    pub fn async_callback<F>(register: F) -> Self
    where
        F: Fn(Callback<A, E>) -> Option<Canceler> + Send + Sync + 'static,
    {
        Self::async_blocking_on(None, register)
    }

    pub(crate) fn async_blocking_on<F>(blocking_on: Option<FiberId>, register: F) -> Self
    where
        F: Fn(Callback<A, E>) -> Option<Canceler> + Send + Sync + 'static,
    {
        Self::primitive(Primitive::Async {
            register: Box::new(move |resume| {
                register(Callback {
                    resume,
                    _marker: PhantomData,
                })
            }),
            blocking_on,
        })
    }

    /// Never completes; only interruption ends it.
    pub fn never() -> Self {
        Self::async_callback(|_| None)
    }

    /// Interrupt the running fiber.
    pub fn interrupt() -> Self {
        Self::with_fiber(|ctx| Effect::fail_cause(Cause::interrupt(ctx.id())))
    }

    pub(crate) fn with_fiber<F>(f: F) -> Self
    where
        F: Fn(&FiberContext<'_>) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::primitive(Primitive::WithFiber(Box::new(move |ctx| f(ctx).instr)))
    }

    /// Loop while `check` holds on the state, folding each body result into it.
    ///
    /// Runs as a single loop frame, so the continuation stack does not grow
    /// with the number of iterations.
    pub fn while_loop<B, C, F, G>(initial: A, check: C, body: F, accumulate: G) -> Self
    where
        B: Data,
        C: Fn(&A) -> bool + Send + Sync + 'static,
        F: Fn(&A) -> Effect<B, E> + Send + Sync + 'static,
        G: Fn(A, B) -> A + Send + Sync + 'static,
    {
        let step = LoopStep {
            check: Box::new(move |state| check(downcast_ref::<A>(state))),
            body: Box::new(move |state| body(downcast_ref::<A>(state)).instr),
            accumulate: Box::new(move |state, value| {
                erase(accumulate(unerase::<A>(state), unerase::<B>(value)))
            }),
        };
        Self::primitive(Primitive::WhileLoop {
            initial: erase(initial),
            step: Arc::new(step),
        })
    }

    /// Repeatedly replace the state with `body(state)` while `cont` holds.
    pub fn iterate<C, F>(initial: A, cont: C, body: F) -> Self
    where
        C: Fn(&A) -> bool + Send + Sync + 'static,
        F: Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::while_loop(initial, cont, move |state| body(state.clone()), |_, next| next)
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B, F>(&self, f: F) -> Effect<B, E>
    where
        B: Data,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnSuccess {
            first: self.instr(),
            k: Arc::new(move |value| success_instr(erase(f(unerase::<A>(value))))),
        })
    }

    /// Transform the typed error.
    pub fn map_err<E2, F>(&self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnFailure {
            first: self.instr(),
            k: Arc::new(move |cause| {
                failure_instr(erase_cause(unerase_cause::<E>(cause).map(&f)))
            }),
        })
    }

    /// Continue with the effect produced from the success value.
    pub fn flat_map<B, F>(&self, f: F) -> Effect<B, E>
    where
        B: Data,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnSuccess {
            first: self.instr(),
            k: Arc::new(move |value| f(unerase::<A>(value)).instr),
        })
    }

    /// Run both, keeping both values.
    pub fn zip<B: Data>(&self, other: &Effect<B, E>) -> Effect<(A, B), E> {
        let other = other.clone();
        self.flat_map(move |a| other.map(move |b| (a.clone(), b)))
    }

    /// Run both, keeping the first value.
    pub fn zip_left<B: Data>(&self, other: &Effect<B, E>) -> Effect<A, E> {
        let other = other.clone();
        self.flat_map(move |a| other.as_value(a))
    }

    /// Run both, keeping the second value.
    pub fn zip_right<B: Data>(&self, other: &Effect<B, E>) -> Effect<B, E> {
        let other = other.clone();
        self.flat_map(move |_| other.clone())
    }

    /// Replace the success value.
    pub fn as_value<B: Data>(&self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(&self) -> Effect<(), E> {
        self.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Recover from the first typed failure. Defects and interruptions pass
    /// through untouched.
    pub fn catch_all<E2, F>(&self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnFailure {
            first: self.instr(),
            k: Arc::new(move |cause| match cause.first_failure() {
                Some(error) => f(unerase::<E>(error.clone())).instr,
                None => failure_instr(cause),
            }),
        })
    }

    /// Recover from any cause.
    pub fn catch_all_cause<E2, F>(&self, f: F) -> Effect<A, E2>
    where
        E2: Data,
        F: Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnFailure {
            first: self.instr(),
            k: Arc::new(move |cause| f(unerase_cause::<E>(cause)).instr),
        })
    }

    /// Continue with one of two effects depending on the outcome.
    pub fn match_cause_effect<B, E2, F, G>(&self, on_failure: F, on_success: G) -> Effect<B, E2>
    where
        B: Data,
        E2: Data,
        F: Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        G: Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnSuccessAndFailure {
            first: self.instr(),
            on_success: Arc::new(move |value| on_success(unerase::<A>(value)).instr),
            on_failure: Arc::new(move |cause| on_failure(unerase_cause::<E>(cause)).instr),
        })
    }

    /// Fold the success value or the first typed failure into a `B`.
    pub fn fold<B, F, G>(&self, on_failure: F, on_success: G) -> Effect<B, Infallible>
    where
        B: Data,
        F: Fn(E) -> B + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::OnSuccessAndFailure {
            first: self.instr(),
            on_success: Arc::new(move |value| success_instr(erase(on_success(unerase::<A>(value))))),
            on_failure: Arc::new(move |cause| match cause.first_failure() {
                Some(error) => success_instr(erase(on_failure(unerase::<E>(error.clone())))),
                None => failure_instr(cause),
            }),
        })
    }

    /// Capture the outcome as a value.
    pub fn exit(&self) -> Effect<Exit<A, E>, Infallible> {
        Effect::primitive(Primitive::OnSuccessAndFailure {
            first: self.instr(),
            on_success: Arc::new(|value| {
                success_instr(erase(Exit::<A, E>::Success(unerase::<A>(value))))
            }),
            on_failure: Arc::new(|cause| {
                success_instr(erase(Exit::<A, E>::Failure(unerase_cause::<E>(cause))))
            }),
        })
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Run `cleanup` with the outcome, whatever it is.
    ///
    /// The cleanup cannot be interrupted. If it fails, its cause is composed
    /// after the original one.
    pub fn on_exit<X, F>(&self, cleanup: F) -> Effect<A, E>
    where
        X: Data,
        F: Fn(&Exit<A, E>) -> Effect<X, Infallible> + Send + Sync + 'static,
    {
        let this = self.clone();
        let cleanup = Arc::new(cleanup);
        Effect::uninterruptible_mask(move |restore| {
            let on_failure = cleanup.clone();
            let on_success = cleanup.clone();
            restore.apply(&this).match_cause_effect(
                move |cause: Cause<E>| {
                    let exit = Exit::Failure(cause.clone());
                    let first = cause.clone();
                    let original = cause.clone();
                    on_failure(&exit).match_cause_effect(
                        move |second: Cause<Infallible>| {
                            Effect::fail_cause(first.clone().then(second.map(absurd)))
                        },
                        move |_| Effect::fail_cause(original.clone()),
                    )
                },
                move |value: A| {
                    let exit = Exit::Success(value.clone());
                    let first = value.clone();
                    on_success(&exit).match_cause_effect(
                        |second: Cause<Infallible>| Effect::fail_cause(second.map(absurd)),
                        move |_| Effect::succeed(first.clone()),
                    )
                },
            )
        })
    }

    /// Run `finalizer` after this effect, whatever the outcome.
    pub fn ensuring<X: Data>(&self, finalizer: &Effect<X, Infallible>) -> Effect<A, E> {
        let finalizer = finalizer.clone();
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` with the interrupting fibers if this effect is interrupted.
    pub fn on_interrupt<X, F>(&self, cleanup: F) -> Effect<A, E>
    where
        X: Data,
        F: Fn(Vec<FiberId>) -> Effect<X, Infallible> + Send + Sync + 'static,
    {
        self.on_exit(move |exit| match exit.cause() {
            Some(cause) if cause.is_interrupted() => cleanup(cause.interruptors()).as_unit(),
            _ => Effect::unit(),
        })
    }

    // ------------------------------------------------------------------
    // Interruptibility
    // ------------------------------------------------------------------

    /// Run with interruption disabled.
    pub fn uninterruptible(&self) -> Effect<A, E> {
        self.with_patch(RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION))
    }

    /// Run with interruption enabled.
    pub fn interruptible(&self) -> Effect<A, E> {
        self.with_patch(RuntimeFlagsPatch::enable(RuntimeFlags::INTERRUPTION))
    }

    /// Run `f` uninterruptibly, handing it a [`Restore`] that re-enables the
    /// outer interruptibility for selected parts.
    pub fn uninterruptible_mask<F>(f: F) -> Effect<A, E>
    where
        F: Fn(Restore) -> Effect<A, E> + Send + Sync + 'static,
    {
        Effect::primitive(Primitive::UpdateFlagsScoped {
            patch: RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION),
            body: Box::new(move |flags| f(Restore { flags }).instr),
        })
    }

    fn with_patch(&self, patch: RuntimeFlagsPatch) -> Effect<A, E> {
        let instr = self.instr();
        Effect::primitive(Primitive::UpdateFlagsScoped {
            patch,
            body: Box::new(move |_| instr.clone()),
        })
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    /// Start this effect in a child fiber owned by the current fiber's scope.
    pub fn fork(&self) -> Effect<FiberHandle<A, E>, Infallible> {
        let instr = self.instr();
        Effect::with_fiber(move |ctx| {
            let child = ctx.spawn(instr.clone(), Some(ctx.scope().clone()));
            Effect::succeed(FiberHandle::new(child))
        })
    }

    /// Start this effect in a child fiber owned by `scope`.
    pub fn fork_in(&self, scope: &Scope) -> Effect<FiberHandle<A, E>, Infallible> {
        let instr = self.instr();
        let scope = scope.clone();
        Effect::with_fiber(move |ctx| {
            let child = ctx.spawn(instr.clone(), Some(scope.clone()));
            Effect::succeed(FiberHandle::new(child))
        })
    }

    /// Start this effect in a fiber no scope owns.
    pub fn fork_daemon(&self) -> Effect<FiberHandle<A, E>, Infallible> {
        let instr = self.instr();
        Effect::with_fiber(move |ctx| {
            let child = ctx.spawn(instr.clone(), None);
            Effect::succeed(FiberHandle::new(child))
        })
    }

    /// Run both effects concurrently and keep the first success.
    ///
    /// The loser is interrupted and awaited before the race completes. When
    /// both fail, the causes are combined in parallel.
    pub fn race(&self, other: &Effect<A, E>) -> Effect<A, E> {
        let left = self.clone();
        let right = other.clone();
        Effect::suspend(move || {
            let winner: Deferred<A, E> = Deferred::new();
            let first_failure: Arc<Mutex<Option<Cause<E>>>> = Arc::new(Mutex::new(None));
            let arm = |effect: &Effect<A, E>| {
                let winner = winner.clone();
                let first_failure = first_failure.clone();
                effect
                    .on_exit(move |exit| match exit {
                        Exit::Success(value) => winner.succeed(value.clone()).as_unit(),
                        Exit::Failure(cause) => {
                            let mut slot = first_failure.lock();
                            match slot.take() {
                                None => {
                                    *slot = Some(cause.clone());
                                    Effect::unit()
                                }
                                Some(previous) => {
                                    winner.fail_cause(previous.both(cause.clone())).as_unit()
                                }
                            }
                        }
                    })
                    .fork()
            };
            let left_fiber = arm(&left);
            let right_fiber = arm(&right);
            let winner = winner.clone();
            left_fiber.zip(&right_fiber).widen_error::<E>().flat_map(move |(l, r)| {
                winner.wait().on_exit(move |_| l.interrupt().zip(&r.interrupt()))
            })
        })
    }

    /// Run both effects concurrently and keep whichever finishes first,
    /// success or failure. The loser is interrupted.
    pub fn race_first(&self, other: &Effect<A, E>) -> Effect<A, E> {
        self.exit()
            .race(&other.exit())
            .widen_error::<E>()
            .flat_map(Effect::done)
    }

    /// Run every effect in sequence and collect the values.
    pub fn all(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
        Effect::for_each(effects, |effect| effect)
    }

    /// Run every effect concurrently and collect the values in order.
    ///
    /// On the first failure the remaining fibers are interrupted. The failure
    /// causes are combined in parallel; interruptions caused by that cleanup
    /// are left out.
    pub fn all_par(effects: Vec<Effect<A, E>>) -> Effect<Vec<A>, E> {
        Effect::suspend(move || {
            // Completed with `true` by the first failure, `false` once every
            // child has succeeded.
            let settled: Deferred<bool, Infallible> = Deferred::new();
            let remaining = Arc::new(AtomicUsize::new(effects.len()));
            let forks: Vec<_> = effects
                .iter()
                .map(|effect| {
                    let settled = settled.clone();
                    let remaining = remaining.clone();
                    effect
                        .on_exit(move |exit| {
                            let last = remaining.fetch_sub(1, Ordering::AcqRel) == 1;
                            if exit.is_failure() {
                                settled.succeed(true).as_unit()
                            } else if last {
                                settled.succeed(false).as_unit()
                            } else {
                                Effect::unit()
                            }
                        })
                        .fork()
                })
                .collect();
            let settled = if effects.is_empty() {
                Effect::succeed(false)
            } else {
                settled.wait()
            };
            Effect::all(forks).widen_error::<E>().flat_map(move |handles| {
                let stop_all = {
                    let handles = handles.clone();
                    Effect::for_each(handles, |h: FiberHandle<A, E>| h.interrupt_fork()).as_unit()
                };
                let await_all = Effect::for_each(handles.clone(), |h: FiberHandle<A, E>| h.await_exit());
                settled
                    .on_interrupt({
                        let stop_all = stop_all.clone();
                        move |_| stop_all.clone()
                    })
                    .flat_map(move |failed| {
                        if failed {
                            stop_all.clone()
                        } else {
                            Effect::unit()
                        }
                    })
                    .zip_right(&await_all)
                    .widen_error::<E>()
                    .flat_map(|exits: Vec<Exit<A, E>>| collect_parallel(exits))
            })
        })
    }

    /// Run `f` on every item in sequence and collect the results.
    pub fn for_each<T, F>(items: Vec<T>, f: F) -> Effect<Vec<A>, E>
    where
        T: Data,
        F: Fn(T) -> Effect<A, E> + Send + Sync + 'static,
    {
        let items = Arc::new(items);
        let len = items.len();
        let state: (usize, Vec<A>) = (0, Vec::with_capacity(len));
        Effect::while_loop(
            state,
            move |(index, _)| *index < len,
            move |(index, _)| f(items[*index].clone()),
            |(index, mut acc), value| {
                acc.push(value);
                (index + 1, acc)
            },
        )
        .map(|(_, acc)| acc)
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Run `f` with a fresh scope that is closed when the effect completes.
    pub fn scoped<F>(f: F) -> Effect<A, E>
    where
        F: Fn(&Scope) -> Effect<A, E> + Send + Sync + 'static,
    {
        Effect::suspend(move || {
            let scope = Scope::new();
            let closer = scope.clone();
            f(&scope).on_exit(move |_| closer.close())
        })
    }

    /// Acquire a resource uninterruptibly and register `release` with the
    /// current fiber's scope.
    pub fn acquire_release<F>(acquire: &Effect<A, E>, release: F) -> Effect<A, E>
    where
        F: Fn(A) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let acquire = acquire.clone();
        let release = Arc::new(release);
        Effect::with_fiber(move |ctx| {
            let release = release.clone();
            ctx.scope().acquire_release(&acquire, move |a| release(a))
        })
    }
}

fn downcast_ref<T: 'static>(value: &AnyValue) -> &T {
    match value.downcast_ref::<T>() {
        Some(typed) => typed,
        None => panic!("loop state is not a {}", std::any::type_name::<T>()),
    }
}

fn collect_parallel<A: Data, E: Data>(exits: Vec<Exit<A, E>>) -> Effect<Vec<A>, E> {
    let mut values = Vec::with_capacity(exits.len());
    let mut failed = Cause::Empty;
    let mut interrupted = Cause::Empty;
    for exit in exits {
        match exit {
            Exit::Success(value) => values.push(value),
            Exit::Failure(cause) if cause.is_interrupted_only() => {
                interrupted = interrupted.both(cause);
            }
            Exit::Failure(cause) => failed = failed.both(cause),
        }
    }
    if !failed.is_empty() {
        Effect::fail_cause(failed)
    } else if !interrupted.is_empty() {
        Effect::fail_cause(interrupted)
    } else {
        Effect::succeed(values)
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
    fn test_succeed_and_map() {
        let rt = runtime();
        let effect: Effect<i32> = Effect::succeed(20).map(|n| n + 1).map(|n| n * 2);
        assert_eq!(rt.run_sync(effect).unwrap(), 42);
    }

    #[test]
    fn test_flat_map_and_zip() {
        let rt = runtime();
        let a: Effect<i32, String> = Effect::succeed(1);
        let b: Effect<&'static str, String> = Effect::succeed("two");
        let effect = a.zip(&b).flat_map(|(n, s)| Effect::succeed(format!("{n}-{s}")));
        assert_eq!(rt.run_sync(effect).unwrap(), "1-two");
    }

    #[test]
    fn test_fail_and_catch_all() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::fail("boom".to_string());
        let recovered: Effect<i32, String> = effect.catch_all(|e| Effect::succeed(e.len() as i32));
        assert_eq!(rt.run_sync(recovered).unwrap(), 4);
    }

    #[test]
    fn test_catch_all_skips_defects() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::die(Defect::new("bug"));
        let recovered: Effect<i32, String> = effect.catch_all(|_| Effect::succeed(0));
        let exit = rt.run_sync_exit(recovered);
        assert_eq!(exit.cause().unwrap().defects()[0].message(), "bug");
    }

    #[test]
    fn test_map_err() {
        let rt = runtime();
        let effect: Effect<(), i32> = Effect::fail(7);
        let mapped = effect.map_err(|n| format!("code {n}"));
        let exit = rt.run_sync_exit(mapped);
        assert_eq!(exit.cause().unwrap().first_failure(), Some(&"code 7".to_string()));
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let effect: Effect<i32> = Effect::sync(|| panic!("exploded"));
        let exit = rt.run_sync_exit(effect);
        assert!(exit.cause().unwrap().is_die());
        assert_eq!(exit.cause().unwrap().defects()[0].message(), "exploded");
    }

    #[test]
    fn test_deep_flat_map_chain_is_stack_safe() {
        let rt = runtime();
        let mut effect: Effect<u64> = Effect::succeed(0);
        for _ in 0..100_000 {
            effect = effect.flat_map(|n| Effect::succeed(n + 1));
        }
        assert_eq!(rt.run_sync(effect).unwrap(), 100_000);
    }

    #[test]
    fn test_dropping_deep_chain_unrun() {
        let mut effect: Effect<u64, String> = Effect::succeed(0);
        for i in 0..100_000u64 {
            effect = if i % 2 == 0 {
                effect.flat_map(|n| Effect::succeed(n + 1))
            } else {
                effect.catch_all(|_| Effect::succeed(0))
            };
        }
        let shared = effect.clone();
        drop(effect);
        drop(shared);
    }

    #[test]
    fn test_while_loop_accumulates() {
        let rt = runtime();
        let effect: Effect<u64> = Effect::while_loop(
            0u64,
            |n| *n < 10_000,
            |_| Effect::succeed(1u64),
            |acc, step| acc + step,
        );
        assert_eq!(rt.run_sync(effect).unwrap(), 10_000);
    }

    #[test]
    fn test_for_each_preserves_order() {
        let rt = runtime();
        let effect: Effect<Vec<i32>> = Effect::for_each(vec![1, 2, 3], |n| Effect::succeed(n * 10));
        assert_eq!(rt.run_sync(effect).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_for_each_stops_at_first_failure() {
        let rt = runtime();
        let effect: Effect<Vec<i32>, String> = Effect::for_each(vec![1, 2, 3], |n| {
            if n == 2 {
                Effect::fail(format!("bad {n}"))
            } else {
                Effect::succeed(n)
            }
        });
        let exit = rt.run_sync_exit(effect);
        assert_eq!(exit.cause().unwrap().failures(), vec![&"bad 2".to_string()]);
    }

    #[test]
    fn test_ensuring_runs_on_failure() {
        let rt = runtime();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let finalizer: Effect<()> = Effect::sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let effect: Effect<(), String> = Effect::fail("x".to_string()).ensuring(&finalizer);
        assert!(rt.run_sync_exit(effect).is_failure());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_exit_composes_cleanup_failure_sequentially() {
        let rt = runtime();
        let effect: Effect<(), String> = Effect::fail("body".to_string());
        let guarded = effect.on_exit(|_| Effect::<(), Infallible>::die(Defect::new("cleanup")));
        let cause = rt.run_sync_exit(guarded).into_result().unwrap_err();
        let expected = Cause::fail("body".to_string()).then(Cause::die_message("cleanup"));
        assert_eq!(cause, expected);
    }

    #[test]
    fn test_fold_and_exit() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::fail("e".to_string());
        let folded = effect.fold(|_| -1, |n| n);
        assert_eq!(rt.run_sync(folded).unwrap(), -1);

        let exit = rt.run_sync(Effect::<i32, String>::succeed(3).exit()).unwrap();
        assert_eq!(exit, Exit::Success(3));
    }

    #[test]
    fn test_self_interrupt() {
        let rt = runtime();
        let effect: Effect<()> = Effect::interrupt();
        let exit = rt.run_sync_exit(effect);
        assert!(exit.cause().unwrap().is_interrupted_only());
    }

    #[test]
    fn test_suspend_is_lazy() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let effect: Effect<usize> = Effect::suspend(move || {
            Effect::succeed(counter.fetch_add(1, Ordering::SeqCst) + 1)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(rt.run_sync(effect.clone()).unwrap(), 1);
        assert_eq!(rt.run_sync(effect).unwrap(), 2);
    }

    #[test]
    fn test_all_par_collects_in_order() {
        let rt = runtime();
        let effects: Vec<Effect<i32>> = (0..5).map(|n| Effect::yield_now().as_value(n)).collect();
        assert_eq!(rt.run_sync(Effect::all_par(effects)).unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_all_par_succeeds_when_every_child_succeeds() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .max_ops_before_yield(64)
            .build()
            .unwrap();
        let rt = Runtime::new(config);
        let effects: Vec<Effect<Vec<u32>>> = (0..8)
            .map(|_| Effect::for_each((0..200u32).collect(), Effect::succeed))
            .collect();
        let effect = Effect::all_par(effects);
        for _ in 0..200 {
            let values = rt.run_blocking(effect.clone()).into_result().unwrap();
            assert_eq!(values.len(), 8);
            assert!(values.iter().all(|v| v.len() == 200));
        }
    }

    #[test]
    fn test_all_par_interrupts_on_failure() {
        let rt = runtime();
        let effects: Vec<Effect<i32, String>> = vec![
            Effect::never(),
            Effect::fail("first".to_string()),
            Effect::never(),
        ];
        let exit = rt.run_sync_exit(Effect::all_par(effects));
        let cause = exit.into_result().unwrap_err();
        assert_eq!(cause.failures(), vec![&"first".to_string()]);
        assert!(!cause.is_interrupted());
    }

    #[test]
    fn test_race_keeps_first_success() {
        let rt = runtime();
        let fast: Effect<&'static str> = Effect::succeed("fast");
        let slow: Effect<&'static str> = Effect::never();
        assert_eq!(rt.run_sync(slow.race(&fast)).unwrap(), "fast");
    }

    #[test]
    fn test_race_combines_failures() {
        let rt = runtime();
        let a: Effect<(), String> = Effect::fail("a".to_string());
        let b: Effect<(), String> = Effect::fail("b".to_string());
        let cause = rt.run_sync_exit(a.race(&b)).into_result().unwrap_err();
        assert_eq!(cause, Cause::fail("a".to_string()).both(Cause::fail("b".to_string())));
    }
}
