//! # Fiber Implementation
//!
//! Lightweight, cooperatively-scheduled units of execution.
//!
//! ## Design
//!
//! A fiber is a small actor. Everything that happens to it arrives as a
//! message in a lock-free mailbox:
//!
//! - `Resume(instr)`: continue with an instruction (start, async callback)
//! - `Interrupt(cause)`: cooperative cancellation request
//! - `YieldNow`: hand the host thread back to the scheduler
//!
//! Whoever pushes a message and flips `running` from false to true schedules
//! a drain task on the fiber's scheduler. The drain task is the only code that
//! ever touches the interpreter state, so external callbacks never run fiber
//! code inline.
//!
//! The interpreter is a trampoline over an explicit continuation stack.
//! Between steps it drains pending interrupts; after `max_ops_before_yield`
//! steps it yields if cooperative yielding is on.
//!
//! ```text
//!            tell(msg) ──► mailbox ──► drain ──► run loop ──► Suspended / Yielded
//!                                                   │
//!                                                   ▼
//!                                 main exit ──► close own scope ──► Done(Exit)
//! ```
//!
//! ## Technical References
//!
//! - [Tokio Scheduler Design](https://tokio.rs/blog/2019-10-scheduler)
//! - [crossbeam-queue](https://docs.rs/crossbeam-queue) for the mailbox

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::cause::{Cause, Defect};
use crate::continuation::{ContinuationStack, Frame};
use crate::effect::{
    failure_instr, success_instr, unit_value, AnyCause, AnyExit, AnyValue, Callback, Canceler,
    Data, Effect, Instr, Primitive,
};
use crate::exit::Exit;
use crate::flags::RuntimeFlags;
use crate::scheduler::Scheduler;
use crate::scope::Scope;

// ============================================================================
// Identity and status
// ============================================================================

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    id: u64,
    started_at: u64,
}

impl FiberId {
    /// The id used for interruptions that come from outside any fiber.
    pub const NONE: FiberId = FiberId {
        id: 0,
        started_at: 0,
    };

    /// Create a fiber ID.
    pub const fn new(id: u64, started_at: u64) -> Self {
        Self { id, started_at }
    }

    /// Allocate a fresh, process-unique ID.
    pub fn next() -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            started_at,
        }
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.id
    }

    /// Start time in milliseconds since the Unix epoch.
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// True for [`FiberId::NONE`].
    pub fn is_none(&self) -> bool {
        self.id == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Observable state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing or ready to execute.
    Running(RuntimeFlags),
    /// Waiting for an asynchronous callback.
    Suspended {
        /// Flags at the suspension point.
        flags: RuntimeFlags,
        /// The fiber being waited on, if any.
        blocking_on: Option<FiberId>,
    },
    /// Finished; the exit is available.
    Done,
}

impl FiberStatus {
    /// True once the fiber has exited.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }

    /// True while the fiber waits on an async callback.
    pub fn is_suspended(&self) -> bool {
        matches!(self, FiberStatus::Suspended { .. })
    }
}

/// Per-fiber execution settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FiberSettings {
    pub(crate) max_ops_before_yield: usize,
    pub(crate) initial_flags: RuntimeFlags,
}

impl Default for FiberSettings {
    fn default() -> Self {
        Self {
            max_ops_before_yield: 2048,
            initial_flags: RuntimeFlags::DEFAULT,
        }
    }
}

// ============================================================================
// Async resumption
// ============================================================================

enum FiberMessage {
    Resume(Instr),
    Interrupt(AnyCause),
    YieldNow,
}

/// Resumes a fiber suspended on an `Async` instruction, at most once.
#[derive(Clone)]
pub(crate) struct AsyncResume {
    claimed: Arc<AtomicBool>,
    fiber: Arc<FiberRuntime>,
}

impl AsyncResume {
    pub(crate) fn resume(&self, instr: Instr) {
        if !self.claimed.swap(true, Ordering::AcqRel) {
            self.fiber.tell(FiberMessage::Resume(instr));
        }
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

struct PendingAsync {
    claimed: Arc<AtomicBool>,
    canceler: Option<Canceler>,
}

/// Read access to the running fiber, handed to `WithFiber` bodies.
pub(crate) struct FiberContext<'a> {
    fiber: &'a Arc<FiberRuntime>,
    flags: RuntimeFlags,
}

impl FiberContext<'_> {
    pub(crate) fn id(&self) -> FiberId {
        self.fiber.id
    }

    pub(crate) fn flags(&self) -> RuntimeFlags {
        self.flags
    }

    /// The fiber's own scope; children forked here are closed with it.
    pub(crate) fn scope(&self) -> &Scope {
        &self.fiber.scope
    }

    /// Start a child fiber sharing this fiber's scheduler and settings.
    pub(crate) fn spawn(&self, instr: Instr, parent: Option<Scope>) -> Arc<FiberRuntime> {
        FiberRuntime::spawn(
            self.fiber.scheduler.clone(),
            self.fiber.settings,
            parent,
            instr,
        )
    }
}

// ============================================================================
// Fiber runtime
// ============================================================================

type Observer = Box<dyn FnOnce(&AnyExit) + Send>;

enum Phase {
    Main,
    Closing(AnyExit),
    Done,
}

struct FiberCore {
    stack: ContinuationStack,
    flags: RuntimeFlags,
    interrupted: AnyCause,
    pending: Option<PendingAsync>,
    phase: Phase,
}

impl FiberCore {
    fn interruptible_and_interrupted(&self) -> bool {
        self.flags.interruptible() && !self.interrupted.is_empty()
    }

    fn add_interrupt(&mut self, cause: AnyCause) {
        let previous = std::mem::take(&mut self.interrupted);
        self.interrupted = previous.then(cause);
    }
}

struct Shared {
    status: FiberStatus,
    exit: Option<AnyExit>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
    observed: bool,
}

enum Cur {
    Instr(Instr),
    Value(AnyValue),
    Cause(AnyCause),
}

impl Cur {
    fn into_instr(self) -> Instr {
        match self {
            Cur::Instr(instr) => instr,
            Cur::Value(value) => success_instr(value),
            Cur::Cause(cause) => failure_instr(cause),
        }
    }
}

enum Next {
    Continue(Cur),
    Suspend(Option<FiberId>),
    Yield(Instr),
    Exit(AnyExit),
}

enum Step {
    Suspended(Option<FiberId>),
    Yielded(Instr),
    Exited(AnyExit),
}

enum Flow {
    Continue,
    Yield,
}

/// The state machine behind a fiber.
pub(crate) struct FiberRuntime {
    id: FiberId,
    scheduler: Arc<dyn Scheduler>,
    settings: FiberSettings,
    scope: Scope,
    parent_scope: Option<Scope>,
    mailbox: SegQueue<FiberMessage>,
    running: AtomicBool,
    /// Interpreter state, only locked by the drain task.
    core: Mutex<FiberCore>,
    shared: Mutex<Shared>,
}

impl FiberRuntime {
    pub(crate) fn new(
        scheduler: Arc<dyn Scheduler>,
        settings: FiberSettings,
        parent_scope: Option<Scope>,
    ) -> Arc<Self> {
        let flags = settings.initial_flags;
        Arc::new(Self {
            id: FiberId::next(),
            scheduler,
            settings,
            scope: Scope::new(),
            parent_scope,
            mailbox: SegQueue::new(),
            running: AtomicBool::new(false),
            core: Mutex::new(FiberCore {
                stack: ContinuationStack::new(),
                flags,
                interrupted: Cause::Empty,
                pending: None,
                phase: Phase::Main,
            }),
            shared: Mutex::new(Shared {
                status: FiberStatus::Running(flags),
                exit: None,
                observers: Vec::new(),
                next_observer: 0,
                observed: false,
            }),
        })
    }

    /// Create a fiber owned by `parent`, then start it.
    ///
    /// A fiber forked into a scope that is already closing starts out
    /// interrupted.
    pub(crate) fn spawn(
        scheduler: Arc<dyn Scheduler>,
        settings: FiberSettings,
        parent: Option<Scope>,
        instr: Instr,
    ) -> Arc<Self> {
        let fiber = FiberRuntime::new(scheduler, settings, parent.clone());
        if let Some(scope) = &parent {
            if !scope.add_child(&fiber) {
                fiber.interrupt_as(Cause::interrupt(FiberId::NONE));
            }
        }
        fiber.start(instr);
        fiber
    }

    pub(crate) fn start(self: &Arc<Self>, instr: Instr) {
        debug!(fiber = %self.id, "fiber started");
        self.tell(FiberMessage::Resume(instr));
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.shared.lock().status
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status().is_done()
    }

    pub(crate) fn exit(&self) -> Option<AnyExit> {
        self.shared.lock().exit.clone()
    }

    /// Ask the fiber to stop. A no-op once it is done.
    pub(crate) fn interrupt_as(self: &Arc<Self>, cause: AnyCause) {
        if !self.is_done() {
            self.tell(FiberMessage::Interrupt(cause));
        }
    }

    /// Register a callback for the exit. Returns `None` and calls the observer
    /// right away if the fiber is already done.
    pub(crate) fn add_observer(&self, observer: Observer) -> Option<u64> {
        let exit = {
            let mut shared = self.shared.lock();
            shared.observed = true;
            match &shared.exit {
                Some(exit) => exit.clone(),
                None => {
                    let key = shared.next_observer;
                    shared.next_observer += 1;
                    shared.observers.push((key, observer));
                    return Some(key);
                }
            }
        };
        observer(&exit);
        None
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        self.shared.lock().observers.retain(|(k, _)| *k != key);
    }

    /// Suspend until the fiber is done, ignoring its exit.
    pub(crate) fn await_done(self: &Arc<Self>) -> Effect<(), Infallible> {
        let fiber = self.clone();
        Effect::suspend(move || {
            if fiber.is_done() {
                return Effect::unit();
            }
            let fiber = fiber.clone();
            Effect::async_blocking_on(Some(fiber.id), move |cb: Callback<(), Infallible>| {
                let key = fiber.add_observer(Box::new(move |_| cb.succeed(())))?;
                let fiber = fiber.clone();
                Some(Box::new(move || fiber.remove_observer(key)) as Canceler)
            })
        })
    }

    // ------------------------------------------------------------------
    // Mailbox
    // ------------------------------------------------------------------

    fn tell(self: &Arc<Self>, message: FiberMessage) {
        self.mailbox.push(message);
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.schedule_drain();
        }
    }

    fn schedule_drain(self: &Arc<Self>) {
        let fiber = self.clone();
        self.scheduler.schedule(Box::new(move || fiber.drain()));
    }

    fn drain(self: &Arc<Self>) {
        let mut core = self.core.lock();
        loop {
            while let Some(message) = self.mailbox.pop() {
                if let Flow::Yield = self.handle(&mut core, message) {
                    drop(core);
                    self.schedule_drain();
                    return;
                }
            }
            self.running.store(false, Ordering::SeqCst);
            if self.mailbox.is_empty()
                || self
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                return;
            }
        }
    }

    fn handle(self: &Arc<Self>, core: &mut FiberCore, message: FiberMessage) -> Flow {
        match message {
            FiberMessage::YieldNow => return Flow::Yield,
            FiberMessage::Resume(instr) => {
                if !matches!(core.phase, Phase::Done) {
                    core.pending = None;
                    self.evaluate(core, instr);
                }
            }
            FiberMessage::Interrupt(cause) => {
                if matches!(core.phase, Phase::Done) {
                    return Flow::Continue;
                }
                trace!(fiber = %self.id, "interrupt received");
                core.add_interrupt(cause);
                if core.flags.interruptible() {
                    if let Some(pending) = core.pending.take() {
                        // Losing the claim means a resume is already queued;
                        // it will observe the interruption itself.
                        if !pending.claimed.swap(true, Ordering::AcqRel) {
                            if let Some(cancel) = pending.canceler {
                                if catch_unwind(AssertUnwindSafe(cancel)).is_err() {
                                    warn!(fiber = %self.id, "async canceler panicked");
                                }
                            }
                            let interrupted = core.interrupted.clone();
                            self.evaluate(core, failure_instr(interrupted));
                        }
                    }
                }
            }
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    fn evaluate(self: &Arc<Self>, core: &mut FiberCore, instr: Instr) {
        self.set_status(FiberStatus::Running(core.flags));
        let mut next = if core.interruptible_and_interrupted() {
            failure_instr(core.interrupted.clone())
        } else {
            instr
        };
        loop {
            match self.run_loop(core, next) {
                Step::Suspended(blocking_on) => {
                    trace!(fiber = %self.id, "fiber suspended");
                    self.set_status(FiberStatus::Suspended {
                        flags: core.flags,
                        blocking_on,
                    });
                    return;
                }
                Step::Yielded(resume) => {
                    trace!(fiber = %self.id, "fiber yielded");
                    self.tell(FiberMessage::YieldNow);
                    self.tell(FiberMessage::Resume(resume));
                    return;
                }
                Step::Exited(exit) => match std::mem::replace(&mut core.phase, Phase::Done) {
                    Phase::Main => {
                        core.stack.clear();
                        let mut flags = core.flags.disable(RuntimeFlags::INTERRUPTION);
                        if !core.interrupted.is_empty() {
                            flags = flags.enable(RuntimeFlags::WIND_DOWN);
                        }
                        core.flags = flags;
                        if self.scope.close_if_empty() {
                            self.complete(exit);
                            return;
                        }
                        core.phase = Phase::Closing(exit);
                        next = self.scope.close().instr();
                    }
                    Phase::Closing(main) => {
                        let exit = match (main, exit) {
                            (main, Exit::Success(_)) => main,
                            (Exit::Success(_), Exit::Failure(close)) => Exit::Failure(close),
                            (Exit::Failure(cause), Exit::Failure(close)) => {
                                Exit::Failure(cause.then(close))
                            }
                        };
                        self.complete(exit);
                        return;
                    }
                    Phase::Done => return,
                },
            }
        }
    }

    fn run_loop(self: &Arc<Self>, core: &mut FiberCore, start: Instr) -> Step {
        let mut cur = Cur::Instr(start);
        let mut ops = 0usize;
        loop {
            if core.flags.cooperative_yielding() && ops >= self.settings.max_ops_before_yield {
                return Step::Yielded(cur.into_instr());
            }
            ops += 1;
            if !self.mailbox.is_empty() {
                cur = self.drain_while_running(core, cur);
            }
            cur = match catch_unwind(AssertUnwindSafe(|| self.step(core, cur))) {
                Ok(Next::Continue(next)) => next,
                Ok(Next::Suspend(blocking_on)) => return Step::Suspended(blocking_on),
                Ok(Next::Yield(resume)) => return Step::Yielded(resume),
                Ok(Next::Exit(exit)) => return Step::Exited(exit),
                Err(payload) => Cur::Cause(Cause::die(Defect::from_panic(payload))),
            };
        }
    }

    /// Observe interrupts that arrived while the fiber was running.
    fn drain_while_running(&self, core: &mut FiberCore, mut cur: Cur) -> Cur {
        let mut later = Vec::new();
        while let Some(message) = self.mailbox.pop() {
            match message {
                FiberMessage::Interrupt(cause) => {
                    core.add_interrupt(cause.clone());
                    if core.flags.interruptible() {
                        cur = Cur::Cause(cause);
                    }
                }
                other => later.push(other),
            }
        }
        for message in later {
            self.mailbox.push(message);
        }
        cur
    }

    fn step(self: &Arc<Self>, core: &mut FiberCore, cur: Cur) -> Next {
        match cur {
            Cur::Value(value) => self.on_value(core, value),
            Cur::Cause(cause) => self.on_cause(core, cause),
            Cur::Instr(instr) => self.on_instr(core, instr),
        }
    }

    fn on_value(&self, core: &mut FiberCore, value: AnyValue) -> Next {
        let next = match core.stack.next_success() {
            None => return Next::Exit(Exit::Success(value)),
            Some(Frame::OnSuccess(k)) | Some(Frame::OnSuccessAndFailure { on_success: k, .. }) => {
                Cur::Instr(k(value))
            }
            Some(Frame::RevertFlags(patch)) => {
                core.flags = patch.apply(core.flags);
                if core.interruptible_and_interrupted() {
                    Cur::Cause(core.interrupted.clone())
                } else {
                    Cur::Value(value)
                }
            }
            Some(Frame::While { state, step }) => {
                let state = (step.accumulate)(state, value);
                if (step.check)(&state) {
                    let body = (step.body)(&state);
                    core.stack.push(Frame::While { state, step });
                    Cur::Instr(body)
                } else {
                    Cur::Value(state)
                }
            }
            Some(Frame::OnFailure(_)) => Cur::Value(value),
        };
        Next::Continue(next)
    }

    fn on_cause(&self, core: &mut FiberCore, cause: AnyCause) -> Next {
        let next = match core.stack.next_failure() {
            None => return Next::Exit(Exit::Failure(cause)),
            Some(Frame::OnFailure(k)) | Some(Frame::OnSuccessAndFailure { on_failure: k, .. }) => {
                if core.interruptible_and_interrupted() {
                    let stripped = cause.strip_failures();
                    if stripped.is_empty() {
                        Cur::Cause(core.interrupted.clone())
                    } else {
                        Cur::Cause(stripped)
                    }
                } else {
                    Cur::Instr(k(cause))
                }
            }
            Some(Frame::RevertFlags(patch)) => {
                core.flags = patch.apply(core.flags);
                if core.interruptible_and_interrupted() && !cause.is_interrupted() {
                    Cur::Cause(cause.then(core.interrupted.clone()))
                } else {
                    Cur::Cause(cause)
                }
            }
            Some(Frame::OnSuccess(_)) | Some(Frame::While { .. }) => Cur::Cause(cause),
        };
        Next::Continue(next)
    }

    fn on_instr(self: &Arc<Self>, core: &mut FiberCore, instr: Instr) -> Next {
        let next = match &*instr {
            Primitive::Success(value) => Cur::Value(value.clone()),
            Primitive::Failure(cause) => Cur::Cause(cause.clone()),
            Primitive::Sync(thunk) => match thunk() {
                Ok(value) => Cur::Value(value),
                Err(cause) => Cur::Cause(cause),
            },
            Primitive::Async {
                register,
                blocking_on,
            } => {
                let claimed = Arc::new(AtomicBool::new(false));
                let resume = AsyncResume {
                    claimed: claimed.clone(),
                    fiber: self.clone(),
                };
                match catch_unwind(AssertUnwindSafe(|| register(resume))) {
                    Ok(canceler) => {
                        core.pending = Some(PendingAsync { claimed, canceler });
                        return Next::Suspend(*blocking_on);
                    }
                    Err(payload) => {
                        if claimed.swap(true, Ordering::AcqRel) {
                            warn!(fiber = %self.id, "async registration panicked after resuming");
                            return Next::Suspend(*blocking_on);
                        }
                        Cur::Cause(Cause::die(Defect::from_panic(payload)))
                    }
                }
            }
            Primitive::OnSuccess { first, k } => {
                core.stack.push(Frame::OnSuccess(k.clone()));
                Cur::Instr(first.clone())
            }
            Primitive::OnFailure { first, k } => {
                core.stack.push(Frame::OnFailure(k.clone()));
                Cur::Instr(first.clone())
            }
            Primitive::OnSuccessAndFailure {
                first,
                on_success,
                on_failure,
            } => {
                core.stack.push(Frame::OnSuccessAndFailure {
                    on_success: on_success.clone(),
                    on_failure: on_failure.clone(),
                });
                Cur::Instr(first.clone())
            }
            Primitive::UpdateFlagsScoped { patch, body } => {
                let old = core.flags;
                let updated = patch.apply(old);
                if updated.interruptible() && !core.interrupted.is_empty() {
                    Cur::Cause(core.interrupted.clone())
                } else {
                    core.flags = updated;
                    if updated != old {
                        core.stack.push(Frame::RevertFlags(updated.diff(old)));
                    }
                    Cur::Instr(body(old))
                }
            }
            Primitive::WhileLoop { initial, step } => {
                let state = initial.clone();
                if (step.check)(&state) {
                    let body = (step.body)(&state);
                    core.stack.push(Frame::While {
                        state,
                        step: step.clone(),
                    });
                    Cur::Instr(body)
                } else {
                    Cur::Value(state)
                }
            }
            Primitive::YieldNow => return Next::Yield(success_instr(unit_value())),
            Primitive::WithFiber(f) => {
                let ctx = FiberContext {
                    fiber: self,
                    flags: core.flags,
                };
                Cur::Instr(f(&ctx))
            }
        };
        Next::Continue(next)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn set_status(&self, status: FiberStatus) {
        let mut shared = self.shared.lock();
        if !shared.status.is_done() {
            shared.status = status;
        }
    }

    fn complete(self: &Arc<Self>, exit: AnyExit) {
        let (observers, observed) = {
            let mut shared = self.shared.lock();
            shared.status = FiberStatus::Done;
            shared.exit = Some(exit.clone());
            (std::mem::take(&mut shared.observers), shared.observed)
        };
        debug!(fiber = %self.id, success = exit.is_success(), "fiber exited");

        if let Exit::Failure(cause) = &exit {
            if !observed && cause.is_die() {
                let id = self.id;
                let rendered = cause.pretty();
                self.scheduler.schedule(Box::new(move || {
                    error!(fiber = %id, cause = %rendered, "fiber died with an unobserved defect");
                }));
            }
        }

        for (_, observer) in observers {
            observer(&exit);
        }
        if let Some(parent) = &self.parent_scope {
            parent.remove_child(self.id);
        }
    }
}

impl fmt::Debug for FiberRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRuntime")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Handles
// ============================================================================

/// A typed handle to a running fiber.
pub struct FiberHandle<A, E> {
    fiber: Arc<FiberRuntime>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for FiberHandle<A, E> {
    fn clone(&self) -> Self {
        Self {
            fiber: self.fiber.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for FiberHandle<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.fiber.id)
            .finish()
    }
}

impl<A: Data, E: Data> FiberHandle<A, E> {
    pub(crate) fn new(fiber: Arc<FiberRuntime>) -> Self {
        Self {
            fiber,
            _marker: PhantomData,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.fiber.id
    }

    /// Current status.
    pub fn status(&self) -> FiberStatus {
        self.fiber.status()
    }

    /// The exit, if the fiber is done.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.fiber.exit().map(Exit::unerase)
    }

    /// Wait for the fiber's exit.
    ///
    /// Every caller, before or after completion, observes the same exit.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Infallible> {
        let fiber = self.fiber.clone();
        Effect::suspend(move || {
            if let Some(exit) = fiber.exit() {
                return Effect::succeed(Exit::unerase(exit));
            }
            let fiber = fiber.clone();
            Effect::async_blocking_on(Some(fiber.id), move |cb: Callback<Exit<A, E>, Infallible>| {
                let key = fiber.add_observer(Box::new(move |exit| {
                    cb.succeed(Exit::unerase(exit.clone()));
                }))?;
                let fiber = fiber.clone();
                Some(Box::new(move || fiber.remove_observer(key)) as Canceler)
            })
        })
    }

    /// Wait for the fiber and continue with its outcome.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit().widen_error::<E>().flat_map(Effect::done)
    }

    /// Interrupt the fiber and wait for it to finish.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, Infallible> {
        let handle = self.clone();
        Effect::with_fiber(move |ctx| {
            handle.fiber.interrupt_as(Cause::interrupt(ctx.id()));
            handle.await_exit()
        })
    }

    /// Interrupt the fiber without waiting.
    pub fn interrupt_fork(&self) -> Effect<(), Infallible> {
        let fiber = self.fiber.clone();
        Effect::with_fiber(move |ctx| {
            fiber.interrupt_as(Cause::interrupt(ctx.id()));
            Effect::unit()
        })
    }

    /// Block the calling host thread until the fiber is done.
    ///
    /// Must not be called from inside a fiber.
    pub fn await_blocking(&self) -> Exit<A, E> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.fiber.add_observer(Box::new(move |exit| {
            let _ = tx.send(exit.clone());
        }));
        match rx.recv() {
            Ok(exit) => Exit::unerase(exit),
            Err(_) => Exit::die(Defect::new("fiber dropped before exiting")),
        }
    }

    /// Interrupt the fiber from outside the runtime and block until it is done.
    pub fn interrupt_blocking(&self) -> Exit<A, E> {
        self.fiber.interrupt_as(Cause::interrupt(FiberId::NONE));
        self.await_blocking()
    }

    /// A future resolving to the fiber's exit.
    pub fn into_future(self) -> ExitFuture<A, E> {
        ExitFuture::new(&self.fiber)
    }
}

struct FutureState {
    exit: Option<AnyExit>,
    waker: Option<Waker>,
}

/// Future bridging a fiber's exit to host async code.
pub struct ExitFuture<A, E> {
    state: Arc<Mutex<FutureState>>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> ExitFuture<A, E> {
    pub(crate) fn new(fiber: &Arc<FiberRuntime>) -> Self {
        let state = Arc::new(Mutex::new(FutureState {
            exit: None,
            waker: None,
        }));
        let shared = state.clone();
        fiber.add_observer(Box::new(move |exit| {
            let waker = {
                let mut state = shared.lock();
                state.exit = Some(exit.clone());
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        Self {
            state,
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> Future for ExitFuture<A, E> {
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match state.exit.take() {
            Some(exit) => Poll::Ready(Exit::unerase(exit)),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        struct ThreadWaker(std::thread::Thread);
        impl std::task::Wake for ThreadWaker {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }
        }
        let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut future = std::pin::pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(output) => return output,
                Poll::Pending => std::thread::park(),
            }
        }
    }

    #[test]
    fn test_fiber_id_unique() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert!(FiberId::NONE.is_none());
        assert_eq!(format!("{}", FiberId::new(9, 0)), "#9");
    }

    #[test]
    fn test_fork_and_join() {
        let rt = runtime();
        let effect: Effect<i32> = Effect::succeed(21)
            .map(|n| n * 2)
            .fork()
            .flat_map(|fiber| fiber.join());
        assert_eq!(rt.run_sync(effect).unwrap(), 42);
    }

    #[test]
    fn test_await_before_and_after_completion_identical() {
        let rt = runtime();
        let gate: Deferred<(), Infallible> = Deferred::new();
        let child_gate = gate.clone();
        let effect = child_gate
            .wait()
            .zip_right(&Effect::<i32, String>::fail("late".to_string()).exit())
            .widen_error::<String>()
            .flat_map(Effect::done)
            .fork()
            .flat_map(move |fiber| {
                let early = fiber.await_exit();
                let late = fiber.await_exit();
                let gate = gate.clone();
                early
                    .fork()
                    .zip_left(&gate.succeed(()))
                    .flat_map(move |waiter| waiter.join().zip(&late))
            });
        let (early, late) = rt.run_sync(effect).unwrap();
        assert_eq!(early, late);
        assert_eq!(early.cause().unwrap().first_failure(), Some(&"late".to_string()));
    }

    #[test]
    fn test_interrupt_suspended_fiber_runs_canceler() {
        let rt = runtime();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let waiting: Effect<()> = Effect::async_callback(move |_cb| {
            let counter = counter.clone();
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as Canceler)
        });
        let effect = waiting
            .fork()
            .flat_map(|fiber| Effect::yield_now().zip_right(&fiber.interrupt()));
        let exit = rt.run_sync(effect).unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_uninterruptible_region_defers_interrupt() {
        let rt = runtime();
        let gate: Deferred<(), Infallible> = Deferred::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let body = gate
            .wait()
            .zip_right(&Effect::sync(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .uninterruptible();
        let opener = gate.clone();
        let effect = body.fork().flat_map(move |fiber| {
            let opener = opener.clone();
            Effect::yield_now()
                .zip_right(&fiber.interrupt_fork())
                .zip_right(&opener.succeed(()))
                .zip_right(&fiber.await_exit())
        });
        let exit = rt.run_sync(effect).unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_status_done_after_exit() {
        let rt = runtime();
        let fiber = rt.fork(Effect::<i32>::succeed(1));
        let exit = fiber.await_blocking();
        assert_eq!(exit, Exit::Success(1));
        assert!(fiber.status().is_done());
        assert_eq!(fiber.poll(), Some(Exit::Success(1)));
    }

    #[test]
    fn test_cooperative_yield_lets_others_run() {
        let config = RuntimeConfig::builder().max_ops_before_yield(16).build().unwrap();
        let rt = Runtime::new(config);
        let effect: Effect<u64> = Effect::while_loop(0u64, |n| *n < 1_000, |_| Effect::succeed(1u64), |a, b| a + b);
        let other: Effect<u64> = Effect::succeed(7);
        let both = effect.fork().zip(&other.fork()).flat_map(|(a, b)| a.join().zip(&b.join()));
        assert_eq!(rt.run_sync(both).unwrap(), (1_000, 7));
    }

    #[test]
    fn test_handle_future() {
        let rt = runtime();
        let fiber = rt.fork(Effect::<&'static str>::succeed("done"));
        let exit = block_on(fiber.into_future());
        assert_eq!(exit, Exit::Success("done"));
    }
}
