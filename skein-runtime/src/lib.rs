//! # Skein Runtime Library
//!
//! Skein runs effects: immutable descriptions of computations that may
//! suspend, fail, fork, or be interrupted. The runtime provides:
//!
//! - **Effect interpreter**: a trampolined run loop over an explicit
//!   continuation stack, one per fiber
//! - **Fibers**: lightweight actors with a lock-free mailbox, scheduled M:N
//!   on a work-stealing pool
//! - **Structured concurrency**: scopes own child fibers and finalizers;
//!   closing a scope interrupts and awaits everything it owns
//! - **Causes**: failures keep every error, defect and interruption, in
//!   sequence or in parallel
//! - **Coordination**: `Deferred`, bounded `Queue` and broadcast `Hub` with
//!   back-pressure, dropping and sliding strategies
//! - **STM**: optimistic transactions over `TRef`s with retry-on-change
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Chase-Lev deques per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Mailboxes**: lock-free MPMC queues per
//!   [crossbeam-queue](https://docs.rs/crossbeam-queue)
//! - **Logging**: [tracing](https://docs.rs/tracing) events, installed with
//!   [tracing-subscriber](https://docs.rs/tracing-subscriber)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SKEIN RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │    Fiber     │  │  Scheduler   │          │
//! │  │ (effect.rs)  │─▶│  (fiber.rs)  │─▶│(scheduler.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                                     │
//! │         ▼                 ▼                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Queue / Hub  │  │    Scope     │  │     STM      │          │
//! │  │  (hub.rs)    │  │  (scope.rs)  │  │   (stm.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use skein_runtime::{Effect, Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let effect: Effect<i32, String> = Effect::succeed(20).map(|n| n + 1);
//! assert_eq!(rt.run_sync(effect).unwrap(), 21);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod continuation;
pub mod deferred;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod flags;
pub mod hub;
pub mod log;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod stm;
pub mod strategy;
pub mod timer;

// Re-exports
pub use cause::{Cause, Defect};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use deferred::Deferred;
pub use effect::{AnyValue, Callback, Canceler, Data, Effect, Restore};
pub use error::{FiberFailure, RuntimeError};
pub use exit::Exit;
pub use fiber::{ExitFuture, FiberHandle, FiberId, FiberStatus};
pub use flags::{RuntimeFlags, RuntimeFlagsPatch};
pub use hub::{Hub, Subscription};
pub use queue::Queue;
pub use runtime::Runtime;
pub use scheduler::{Scheduler, SyncScheduler, WorkStealingScheduler};
pub use scope::{FinalizerKey, Scope};
pub use stm::{Journal, Stm, StmError, TRef};
pub use strategy::Strategy;
pub use timer::Deadline;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install logging and start a runtime with the default configuration.
pub fn init() -> Runtime {
    init_with(RuntimeConfig::default())
}

/// Install logging and start a runtime with `config`.
///
/// # Example
///
/// ```rust,ignore
/// use skein_runtime::{init_with, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .num_workers(4)
///     .max_ops_before_yield(512)
///     .build()
///     .unwrap();
///
/// let rt = init_with(config);
/// ```
pub fn init_with(config: RuntimeConfig) -> Runtime {
    log::init(&config.log);
    Runtime::new(config)
}

/// Install logging and start a runtime configured from `SKEIN_*`
/// environment variables.
///
/// See [`RuntimeConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Runtime {
    init_with(RuntimeConfig::from_env())
}
