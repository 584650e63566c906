//! # Runtime
//!
//! Entry points for running effects from host code.
//!
//! ## Design
//!
//! A [`Runtime`] owns a [`WorkStealingScheduler`] and the fiber settings
//! derived from its [`RuntimeConfig`]. Every entry point creates a root
//! fiber (no parent scope) and differs only in how the caller learns about
//! the exit:
//!
//! | Entry point      | Exit delivered by                                   |
//! |------------------|-----------------------------------------------------|
//! | `fork`           | the returned [`FiberHandle`]                        |
//! | `run_sync`       | return value; the fiber runs on the calling thread  |
//! | `run_callback`   | a host callback, called exactly once                |
//! | `run_future`     | an [`ExitFuture`] for host async code               |
//! | `run_blocking`   | return value; the calling thread parks until done   |
//!
//! `run_sync` drives the fiber with a [`SyncScheduler`]. If the queue runs
//! dry before the fiber is done, the fiber is suspended on something
//! asynchronous; the scheduler is handed over to the pool, the fiber keeps
//! running there, and the caller gets [`RuntimeError::AsyncFiber`] as a
//! defect.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cause::Defect;
use crate::config::RuntimeConfig;
use crate::effect::{AnyExit, Data, Effect};
use crate::error::{FiberFailure, RuntimeError};
use crate::exit::Exit;
use crate::fiber::{ExitFuture, FiberHandle, FiberRuntime, FiberSettings};
use crate::scheduler::{Scheduler, SyncScheduler, WorkStealingScheduler};
use crate::scope::Scope;

struct Inner {
    config: RuntimeConfig,
    settings: FiberSettings,
    scheduler: Arc<dyn Scheduler>,
    pool: WorkStealingScheduler,
}

/// A pool of worker threads running fibers.
///
/// Cloning is cheap; the workers stop when the last clone is dropped.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Start a runtime.
    ///
    /// Zero workers or a zero yield budget are raised to one.
    pub fn new(config: RuntimeConfig) -> Self {
        let pool = WorkStealingScheduler::new(&config.scheduler);
        let mut settings = config.fiber.settings();
        settings.max_ops_before_yield = settings.max_ops_before_yield.max(1);
        debug!(
            workers = pool.num_workers(),
            max_ops_before_yield = settings.max_ops_before_yield,
            "runtime started"
        );
        Self {
            inner: Arc::new(Inner {
                scheduler: Arc::new(pool.handle()),
                pool,
                settings,
                config,
            }),
        }
    }

    /// Start a runtime after validating `config`.
    pub fn try_new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    /// The process-wide runtime, configured from `SKEIN_*` variables on first
    /// use.
    pub fn default_runtime() -> &'static Runtime {
        static DEFAULT: OnceLock<Runtime> = OnceLock::new();
        DEFAULT.get_or_init(|| Runtime::new(RuntimeConfig::from_env()))
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The scheduler root fibers run on.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.inner.scheduler.clone()
    }

    /// Stop the worker threads. Fibers still running never resume.
    pub fn shutdown(&self) {
        debug!("runtime shutting down");
        self.inner.pool.shutdown();
    }

    /// True once [`Runtime::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.pool.is_shutting_down()
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Start `effect` in a root fiber and return its handle.
    pub fn fork<A: Data, E: Data>(&self, effect: Effect<A, E>) -> FiberHandle<A, E> {
        match self.root_fiber() {
            Ok(fiber) => {
                fiber.start(effect.instr());
                FiberHandle::new(fiber)
            }
            Err(rejected) => self.fork_rejected(rejected),
        }
    }

    /// Start `effect` in a fiber owned by `scope`. Closing the scope
    /// interrupts the fiber.
    pub fn fork_in<A: Data, E: Data>(&self, effect: Effect<A, E>, scope: &Scope) -> FiberHandle<A, E> {
        if self.is_shutdown() {
            return self.fork_rejected(RuntimeError::Shutdown);
        }
        let fiber = FiberRuntime::spawn(
            self.inner.scheduler.clone(),
            self.inner.settings,
            Some(scope.clone()),
            effect.instr(),
        );
        FiberHandle::new(fiber)
    }

    /// Run `effect` to completion on the calling thread.
    ///
    /// If the effect suspends on an asynchronous operation the result is a
    /// [`RuntimeError::AsyncFiber`] defect; the fiber itself carries on in
    /// the pool.
    pub fn run_sync_exit<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let sync = Arc::new(SyncScheduler::new(self.inner.scheduler.clone()));
        let fiber = FiberRuntime::new(sync.clone(), self.inner.settings, None);
        let slot: Arc<Mutex<Option<AnyExit>>> = Arc::new(Mutex::new(None));
        let observed = slot.clone();
        fiber.add_observer(Box::new(move |exit| {
            *observed.lock() = Some(exit.clone());
        }));
        fiber.start(effect.instr());
        sync.flush();
        sync.deactivate();

        let exit = slot.lock().take();
        match exit {
            Some(exit) => Exit::unerase(exit),
            None => {
                warn!(fiber = %fiber.id(), "run_sync reached an asynchronous suspension");
                Exit::die(Defect::from_error(RuntimeError::AsyncFiber {
                    fiber_id: fiber.id(),
                }))
            }
        }
    }

    /// Run `effect` on the calling thread and return its value, or the full
    /// cause on failure.
    pub fn run_sync<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Result<A, FiberFailure<E>> {
        self.run_sync_exit(effect)
            .into_result()
            .map_err(FiberFailure::new)
    }

    /// Start `effect` and call `on_exit` with its exit, exactly once.
    pub fn run_callback<A, E, F>(&self, effect: Effect<A, E>, on_exit: F) -> FiberHandle<A, E>
    where
        A: Data,
        E: Data,
        F: FnOnce(Exit<A, E>) + Send + 'static,
    {
        let fiber = match self.root_fiber() {
            Ok(fiber) => fiber,
            Err(rejected) => {
                let handle = self.fork_rejected(rejected);
                if let Some(exit) = handle.poll() {
                    on_exit(exit);
                }
                return handle;
            }
        };
        fiber.add_observer(Box::new(move |exit| on_exit(Exit::unerase(exit.clone()))));
        fiber.start(effect.instr());
        FiberHandle::new(fiber)
    }

    /// Start `effect` and return a future resolving to its exit.
    pub fn run_future<A: Data, E: Data>(&self, effect: Effect<A, E>) -> ExitFuture<A, E> {
        match self.root_fiber() {
            Ok(fiber) => {
                let future = ExitFuture::new(&fiber);
                fiber.start(effect.instr());
                future
            }
            Err(rejected) => self.fork_rejected::<A, E>(rejected).into_future(),
        }
    }

    /// Start `effect` and park the calling thread until it is done.
    ///
    /// Must not be called from inside a fiber.
    pub fn run_blocking<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        self.fork(effect).await_blocking()
    }

    fn root_fiber(&self) -> Result<Arc<FiberRuntime>, RuntimeError> {
        if self.is_shutdown() {
            return Err(RuntimeError::Shutdown);
        }
        Ok(FiberRuntime::new(
            self.inner.scheduler.clone(),
            self.inner.settings,
            None,
        ))
    }

    /// A fiber that has already died with `error`. Runs on the calling thread
    /// since the pool may be gone.
    fn fork_rejected<A: Data, E: Data>(&self, error: RuntimeError) -> FiberHandle<A, E> {
        warn!(%error, "fiber rejected");
        let sync = Arc::new(SyncScheduler::new(self.inner.scheduler.clone()));
        let fiber = FiberRuntime::new(sync.clone(), self.inner.settings, None);
        let handle = FiberHandle::new(fiber.clone());
        fiber.start(Effect::<A, E>::die(Defect::from_error(error)).instr());
        sync.flush();
        sync.deactivate();
        handle
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.inner.pool)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use std::convert::Infallible;
    use std::future::Future;
    use std::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll, Wake, Waker};
    use std::thread::{self, Thread};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default())
    }

    struct ThreadWaker(Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(output) => return output,
                Poll::Pending => thread::park_timeout(Duration::from_millis(50)),
            }
        }
    }

    #[test]
    fn test_run_sync_value() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::succeed(20).map(|n| n + 1);
        assert_eq!(rt.run_sync(effect).unwrap(), 21);
    }

    #[test]
    fn test_run_sync_failure_keeps_cause() {
        let rt = runtime();
        let effect: Effect<i32, String> = Effect::fail("nope".to_string());
        let failure = rt.run_sync(effect).unwrap_err();
        assert_eq!(failure.cause().first_failure(), Some(&"nope".to_string()));
    }

    #[test]
    fn test_run_sync_rejects_async() {
        let rt = runtime();
        let deferred: Deferred<i32> = Deferred::new();
        let exit = rt.run_sync_exit(deferred.wait());
        let cause = exit.cause().unwrap();
        let defect = cause.defects()[0];
        assert!(matches!(
            defect.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::AsyncFiber { .. })
        ));
    }

    #[test]
    fn test_run_sync_with_forks() {
        let rt = runtime();
        let effect: Effect<i32> = Effect::<i32>::succeed(2)
            .fork()
            .flat_map(|fiber| fiber.join().map(|n| n * 10));
        assert_eq!(rt.run_sync(effect).unwrap(), 20);
    }

    #[test]
    fn test_run_callback_called_once() {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let counter = calls.clone();
        rt.run_callback(Effect::<i32>::succeed(7), move |exit| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(exit);
        });
        let exit = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(exit.value(), Some(&7));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_future() {
        let rt = runtime();
        let deferred: Deferred<&'static str> = Deferred::new();
        let future = rt.run_future(deferred.wait());
        let completer = deferred.clone();
        rt.fork(completer.succeed("later"));
        assert_eq!(block_on(future).value(), Some(&"later"));
    }

    #[test]
    fn test_fork_in_scope_interrupted_on_close() {
        let rt = runtime();
        let scope = Scope::new();
        let fiber = rt.fork_in(Effect::<(), Infallible>::never(), &scope);
        rt.run_blocking(scope.close());
        assert!(fiber.await_blocking().is_interrupted());
    }

    #[test]
    fn test_shutdown_rejects_new_fibers() {
        let rt = runtime();
        rt.shutdown();
        assert!(rt.is_shutdown());
        let exit = rt.run_blocking(Effect::<i32>::succeed(1));
        let cause = exit.cause().unwrap();
        assert!(matches!(
            cause.defects()[0].downcast_ref::<RuntimeError>(),
            Some(RuntimeError::Shutdown)
        ));
    }

    #[test]
    fn test_try_new_validates() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert!(matches!(Runtime::try_new(config), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_default_runtime_is_shared() {
        let a = Runtime::default_runtime();
        let b = Runtime::default_runtime();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(a.run_sync(Effect::<u8>::succeed(1)).unwrap(), 1);
    }
}
