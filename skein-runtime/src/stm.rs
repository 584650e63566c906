//! # Software Transactional Memory
//!
//! Optimistic, journal-and-validate transactions over [`TRef`]s.
//!
//! ## Design
//!
//! A transaction body runs against a private [`Journal`]. The first read of a
//! reference records the version it saw; writes only touch the journal.
//! Committing validates every recorded version and, if they all still match,
//! applies the writes and bumps the versions inside one short critical
//! section. A stale journal is discarded and the body re-runs from scratch.
//!
//! ```text
//!   run body ──► Ok ──► validate+apply ──► wake parked transactions
//!      │                     │ stale
//!      │                     └──────────► run body again
//!      └──► Retry ──► park on every ref read ──► any commit to them ──► run body again
//! ```
//!
//! A failure or panic raised from a stale journal is treated like a stale
//! commit: the body may have seen an inconsistent snapshot, so it is re-run
//! rather than reported.
//!
//! ## Technical References
//!
//! - Harris et al., [Composable Memory Transactions](https://doi.org/10.1145/1065944.1065952)

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::cause::Defect;
use crate::effect::{erase, unerase, AnyValue, Callback, Canceler, Data, Effect};

static NEXT_TREF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TODO_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes validation and write-back of commits.
static COMMIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

type Todo = Box<dyn FnOnce() + Send>;

struct Versioned {
    version: u64,
    value: AnyValue,
}

struct Cell {
    id: u64,
    versioned: RwLock<Versioned>,
    /// Wakeups of transactions parked on this reference.
    todos: Mutex<BTreeMap<u64, Todo>>,
}

impl Cell {
    fn snapshot(&self) -> (u64, AnyValue) {
        let versioned = self.versioned.read();
        (versioned.version, versioned.value.clone())
    }

    fn version(&self) -> u64 {
        self.versioned.read().version
    }
}

// ============================================================================
// TRef
// ============================================================================

/// A transactional reference.
pub struct TRef<A> {
    cell: Arc<Cell>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef")
            .field("id", &self.cell.id)
            .field("version", &self.cell.version())
            .finish()
    }
}

impl<A: Data> TRef<A> {
    /// A reference holding `value`.
    pub fn new(value: A) -> Self {
        Self {
            cell: Arc::new(Cell {
                id: NEXT_TREF_ID.fetch_add(1, Ordering::Relaxed),
                versioned: RwLock::new(Versioned {
                    version: 0,
                    value: erase(value),
                }),
                todos: Mutex::new(BTreeMap::new()),
            }),
            _marker: PhantomData,
        }
    }

    /// Create a reference inside an effect.
    pub fn make(value: A) -> Effect<Self, Infallible> {
        Effect::sync(move || Self::new(value.clone()))
    }

    /// Read the last committed value outside any transaction.
    pub fn get_direct(&self) -> A {
        unerase(self.cell.snapshot().1)
    }

    /// Read the value.
    pub fn get<E: Data>(&self) -> Stm<A, E> {
        let tref = self.clone();
        Stm::new(move |journal| Ok(journal.get(&tref)))
    }

    /// Replace the value.
    pub fn set<E: Data>(&self, value: A) -> Stm<(), E> {
        let tref = self.clone();
        Stm::new(move |journal| {
            journal.set(&tref, value.clone());
            Ok(())
        })
    }

    /// Transform the value.
    pub fn update<E: Data, F>(&self, f: F) -> Stm<(), E>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        let tref = self.clone();
        Stm::new(move |journal| {
            let next = f(journal.get(&tref));
            journal.set(&tref, next);
            Ok(())
        })
    }

    /// Transform the value and return a result computed from the old one.
    pub fn modify<B: Data, E: Data, F>(&self, f: F) -> Stm<B, E>
    where
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let tref = self.clone();
        Stm::new(move |journal| {
            let (result, next) = f(journal.get(&tref));
            journal.set(&tref, next);
            Ok(result)
        })
    }
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Clone)]
struct Entry {
    cell: Arc<Cell>,
    expected: u64,
    read: AnyValue,
    value: AnyValue,
    dirty: bool,
}

/// The private log of reads and writes of one transaction attempt.
#[derive(Clone, Default)]
pub struct Journal {
    entries: BTreeMap<u64, Entry>,
}

impl Journal {
    fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, cell: &Arc<Cell>) -> &mut Entry {
        self.entries.entry(cell.id).or_insert_with(|| {
            let (expected, value) = cell.snapshot();
            Entry {
                cell: cell.clone(),
                expected,
                read: value.clone(),
                value,
                dirty: false,
            }
        })
    }

    /// Read `tref` as seen by this transaction.
    pub fn get<A: Data>(&mut self, tref: &TRef<A>) -> A {
        unerase(self.entry(&tref.cell).value.clone())
    }

    /// Write `tref` within this transaction.
    pub fn set<A: Data>(&mut self, tref: &TRef<A>, value: A) {
        let entry = self.entry(&tref.cell);
        entry.value = erase(value);
        entry.dirty = true;
    }

    /// Number of references touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was touched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True while every reference read still has the version first seen.
    pub fn is_valid(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.cell.version() == entry.expected)
    }

    /// Validate and apply. Returns the wakeups to run once the commit lock is
    /// released, or `None` if the journal is stale.
    fn try_commit(&self) -> Option<Vec<Todo>> {
        let _guard = COMMIT_LOCK.lock();
        if !self.is_valid() {
            return None;
        }
        let mut todos = Vec::new();
        for entry in self.entries.values().filter(|entry| entry.dirty) {
            {
                let mut versioned = entry.cell.versioned.write();
                versioned.value = entry.value.clone();
                versioned.version += 1;
            }
            let mut parked = entry.cell.todos.lock();
            todos.extend(std::mem::take(&mut *parked).into_values());
        }
        Some(todos)
    }

    /// Roll back to `snapshot`, keeping the reads made since as read-only
    /// entries so a later retry still parks on them.
    fn restore(&mut self, snapshot: Journal) {
        let attempted = std::mem::replace(self, snapshot);
        for (id, entry) in attempted.entries {
            self.entries.entry(id).or_insert(Entry {
                value: entry.read.clone(),
                dirty: false,
                ..entry
            });
        }
    }

    fn park(&self, key: u64, wake: impl Fn() + Send + Sync + 'static) {
        let wake = Arc::new(wake);
        for entry in self.entries.values() {
            let wake = wake.clone();
            entry.cell.todos.lock().insert(key, Box::new(move || wake()));
        }
    }

    fn unpark(&self, key: u64) {
        for entry in self.entries.values() {
            entry.cell.todos.lock().remove(&key);
        }
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ============================================================================
// Stm
// ============================================================================

/// Why a transaction body did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum StmError<E> {
    /// A typed failure; aborts the transaction.
    Fail(E),
    /// Wait until a reference read so far changes, then run again.
    Retry,
}

type Body<A, E> = dyn Fn(&mut Journal) -> Result<A, StmError<E>> + Send + Sync;

/// A transaction producing `A` or failing with `E`.
pub struct Stm<A, E = Infallible> {
    run: Arc<Body<A, E>>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm").finish_non_exhaustive()
    }
}

enum Attempt<A, E> {
    Committed(A, Vec<Todo>),
    Failed(E),
    Died(Defect),
    Retry(Journal),
}

impl<A: Data, E: Data> Stm<A, E> {
    /// A transaction from a body working on the journal directly.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut Journal) -> Result<A, StmError<E>> + Send + Sync + 'static,
    {
        Self {
            run: Arc::new(body),
        }
    }

    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::new(move |_| Ok(value.clone()))
    }

    /// Abort with `error`.
    pub fn fail(error: E) -> Self {
        Self::new(move |_| Err(StmError::Fail(error.clone())))
    }

    /// Abandon this attempt and wait for a change to anything read so far.
    pub fn retry() -> Self {
        Self::new(|_| Err(StmError::Retry))
    }

    /// Transform the result.
    pub fn map<B: Data, F>(&self, f: F) -> Stm<B, E>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let run = self.run.clone();
        Stm::new(move |journal| run(journal).map(&f))
    }

    /// Continue with the transaction produced from the result.
    pub fn flat_map<B: Data, F>(&self, f: F) -> Stm<B, E>
    where
        F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    {
        let run = self.run.clone();
        Stm::new(move |journal| {
            let value = run(journal)?;
            (f(value).run)(journal)
        })
    }

    /// Run both, keeping both results.
    pub fn zip<B: Data>(&self, other: &Stm<B, E>) -> Stm<(A, B), E> {
        let (first, second) = (self.run.clone(), other.run.clone());
        Stm::new(move |journal| Ok((first(journal)?, second(journal)?)))
    }

    /// Run `other` if this transaction retries. Writes made by the retrying
    /// branch are rolled back.
    pub fn or_try(&self, other: &Stm<A, E>) -> Stm<A, E> {
        let (first, second) = (self.run.clone(), other.run.clone());
        Stm::new(move |journal| {
            let snapshot = journal.clone();
            match first(journal) {
                Err(StmError::Retry) => {
                    journal.restore(snapshot);
                    second(journal)
                }
                other => other,
            }
        })
    }

    /// Recover from a typed failure.
    pub fn catch_all<E2: Data, F>(&self, f: F) -> Stm<A, E2>
    where
        F: Fn(E) -> Stm<A, E2> + Send + Sync + 'static,
    {
        let run = self.run.clone();
        Stm::new(move |journal| match run(journal) {
            Ok(value) => Ok(value),
            Err(StmError::Retry) => Err(StmError::Retry),
            Err(StmError::Fail(error)) => (f(error).run)(journal),
        })
    }

    /// Run the transaction atomically.
    pub fn commit(&self) -> Effect<A, E> {
        let stm = self.clone();
        Effect::suspend(move || stm.attempt())
    }

    fn run_once(&self) -> Attempt<A, E> {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let mut journal = Journal::new();
            let outcome = catch_unwind(AssertUnwindSafe(|| (self.run)(&mut journal)));
            match outcome {
                Ok(Ok(value)) => {
                    if let Some(todos) = journal.try_commit() {
                        return Attempt::Committed(value, todos);
                    }
                }
                Ok(Err(StmError::Retry)) if journal.is_valid() => {
                    return Attempt::Retry(journal);
                }
                Ok(Err(StmError::Fail(error))) if journal.is_valid() => {
                    return Attempt::Failed(error);
                }
                Err(payload) if journal.is_valid() => {
                    return Attempt::Died(Defect::from_panic(payload));
                }
                _ => {}
            }
            trace!(attempts, "stale transaction, re-running");
        }
    }

    fn attempt(&self) -> Effect<A, E> {
        match self.run_once() {
            Attempt::Committed(value, todos) => {
                for todo in todos {
                    todo();
                }
                Effect::succeed(value)
            }
            Attempt::Failed(error) => Effect::fail(error),
            Attempt::Died(defect) => Effect::die(defect),
            Attempt::Retry(journal) => {
                let stm = self.clone();
                park(journal).widen_error::<E>().flat_map(move |_| stm.attempt())
            }
        }
    }
}

impl<E: Data> Stm<(), E> {
    /// Retry unless `condition` holds.
    pub fn check(condition: bool) -> Self {
        if condition {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }
}

/// Suspend until one of the references in `journal` is committed to.
fn park(journal: Journal) -> Effect<(), Infallible> {
    let key = NEXT_TODO_ID.fetch_add(1, Ordering::Relaxed);
    let journal = Arc::new(journal);
    let waiting = journal.clone();
    let cleanup = Effect::sync(move || journal.unpark(key));
    Effect::async_callback(move |cb: Callback<(), Infallible>| {
        let wake = cb.clone();
        waiting.park(key, move || wake.succeed(()));
        // A commit between the failed attempt and parking is not lost.
        if !waiting.is_valid() {
            cb.succeed(());
        }
        None::<Canceler>
    })
    .ensuring(&cleanup)
}

// ============================================================================
// Tests
// ============================================================================
