//! Component F: deferred results — a one-shot producer/consumer cell wired
//! into the retry/wake-up protocol.
//!
//! Grounded on `WDeferredValue<Type_t>`/`WDeferredResult<Type_t>` as used in
//! `examples/original_source/STM/Test/DeferredResultTests.cpp` (the source
//! header itself was not part of the retrieved pack, so this module is
//! built directly from the test suite's observed contract): a producer
//! (`DeferredValue`) transitions a shared cell from pending to done/failed
//! exactly once; any number of consumer handles (`DeferredResult`) can read
//! it, wait on it outside a transaction, or retry on it inside one.
//!
//! `done`/`fail` run every registered `on_done` callback synchronously, in
//! registration order, on the thread that made the transition — late
//! registrations on an already-resolved cell run immediately instead of
//! queuing. A producer dropped while still pending resolves the cell to a
//! `BrokenPromise` failure, matching `WDeferredValue`'s destructor behavior
//! exercised by the `BrokenPromise` test case.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::result::RetryTimeout;
use crate::transaction::Transaction;
use crate::var::Var;
use crate::{atomically, StmResult};

/// Why a [`DeferredResult`] accessor could not produce the value the caller
/// asked for.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeferredError<E> {
    /// The result was never bound to a [`DeferredValue`] (a default-
    /// constructed, "null" result).
    #[error("deferred result is not bound to a value")]
    Unbound,
    /// The deferred has not transitioned out of `pending` yet.
    #[error("deferred result is not yet done")]
    NotDone,
    /// The producer side was dropped before calling `done` or `fail`.
    #[error("producer was dropped before resolving the deferred value")]
    BrokenPromise,
    /// The producer called `fail` with this error.
    #[error("{0}")]
    User(E),
}

enum DeferredState<T, E> {
    Pending,
    Done(T),
    Failed(DeferredError<E>),
}

type Waiter = Box<dyn FnOnce() + Send>;

struct Inner<T, E> {
    state: DeferredState<T, E>,
    waiters: Vec<Waiter>,
}

struct DeferredCore<T, E> {
    inner: Mutex<Inner<T, E>>,
    wait_cond: Condvar,
    /// Mirrors this cell's "is it resolved" bit into the transactional
    /// world so [`DeferredResult::retry_if_not_done`] can block on it with
    /// the ordinary `retry` machinery instead of its own ad hoc wake path.
    done_var: Var<bool>,
    readers: AtomicUsize,
    producers: AtomicUsize,
}

impl<T, E> DeferredCore<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn new() -> Arc<Self> {
        Arc::new(DeferredCore {
            inner: Mutex::new(Inner {
                state: DeferredState::Pending,
                waiters: Vec::new(),
            }),
            wait_cond: Condvar::new(),
            done_var: Var::new(false),
            readers: AtomicUsize::new(0),
            producers: AtomicUsize::new(1),
        })
    }

    fn resolve(&self, state: DeferredState<T, E>) {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, DeferredState::Pending) {
                return;
            }
            inner.state = state;
            std::mem::take(&mut inner.waiters)
        };
        atomically(|tx| self.done_var.set(tx, true));
        self.wait_cond.notify_all();
        for waiter in waiters {
            waiter();
        }
    }

    fn resolve_in(&self, tx: &mut Transaction, state: DeferredState<T, E>) {
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, DeferredState::Pending) {
                return;
            }
            inner.state = state;
            std::mem::take(&mut inner.waiters)
        };
        let _ = self.done_var.set(tx, true);
        self.wait_cond.notify_all();
        for waiter in waiters {
            waiter();
        }
    }

    fn on_done(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, DeferredState::Pending) {
            inner.waiters.push(Box::new(f));
        } else {
            drop(inner);
            f();
        }
    }

    fn snapshot(&self) -> Result<(bool, bool), ()> {
        let inner = self.inner.lock().unwrap();
        match &inner.state {
            DeferredState::Pending => Ok((false, false)),
            DeferredState::Done(_) => Ok((true, false)),
            DeferredState::Failed(_) => Ok((true, true)),
        }
    }

    fn get(&self) -> Result<T, DeferredError<E>> {
        let inner = self.inner.lock().unwrap();
        match &inner.state {
            DeferredState::Pending => Err(DeferredError::NotDone),
            DeferredState::Done(value) => Ok(value.clone()),
            DeferredState::Failed(err) => Err(err.clone()),
        }
    }

    fn throw(&self) -> Result<(), DeferredError<E>> {
        let inner = self.inner.lock().unwrap();
        match &inner.state {
            DeferredState::Pending => Err(DeferredError::NotDone),
            DeferredState::Done(_) => Ok(()),
            DeferredState::Failed(err) => Err(err.clone()),
        }
    }
}

/// The producer side of a deferred result. Move it into whatever thread or
/// transaction will eventually know the answer.
pub struct DeferredValue<T, E> {
    core: Arc<DeferredCore<T, E>>,
}

impl<T, E> Clone for DeferredValue<T, E> {
    fn clone(&self) -> Self {
        self.core.producers.fetch_add(1, Ordering::SeqCst);
        DeferredValue {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, E> Drop for DeferredValue<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.core.producers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.core.resolve(DeferredState::Failed(DeferredError::BrokenPromise));
        }
    }
}

impl<T, E> Default for DeferredValue<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> DeferredValue<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        DeferredValue { core: DeferredCore::new() }
    }

    /// Resolves the deferred with `value`. A no-op if it was already
    /// resolved (by this or another producer handle sharing the same
    /// core) — only the first transition sticks.
    pub fn done(&self, value: T) {
        self.core.resolve(DeferredState::Done(value));
    }

    /// Transactional form of [`Self::done`]: the `done_var` write (and so
    /// visibility to anyone blocked in `retry_if_not_done`) only takes
    /// effect when `tx`'s root transaction actually commits.
    pub fn done_in(&self, tx: &mut Transaction, value: T) {
        self.core.resolve_in(tx, DeferredState::Done(value));
    }

    pub fn fail(&self, err: E) {
        self.core.resolve(DeferredState::Failed(DeferredError::User(err)));
    }

    pub fn fail_in(&self, tx: &mut Transaction, err: E) {
        self.core.resolve_in(tx, DeferredState::Failed(DeferredError::User(err)));
    }

    pub fn is_done(&self) -> bool {
        self.core.snapshot().map(|(done, _)| done).unwrap_or(false)
    }

    /// True while at least one [`DeferredResult`] handle bound to this
    /// value is still alive. Lets a producer skip computing a result
    /// nobody is waiting for.
    pub fn has_readers(&self) -> bool {
        self.core.readers.load(Ordering::SeqCst) > 0
    }
}

/// A consumer handle on a deferred result. The default value is "unbound" —
/// every accessor on it fails with [`DeferredError::Unbound`] rather than
/// panicking, mirroring `WDeferredResult`'s default-constructed "null"
/// state.
pub struct DeferredResult<T, E> {
    core: Option<Arc<DeferredCore<T, E>>>,
}

impl<T, E> Default for DeferredResult<T, E> {
    fn default() -> Self {
        DeferredResult { core: None }
    }
}

impl<T, E> Clone for DeferredResult<T, E> {
    fn clone(&self) -> Self {
        if let Some(core) = &self.core {
            core.readers.fetch_add(1, Ordering::SeqCst);
        }
        DeferredResult {
            core: self.core.clone(),
        }
    }
}

impl<T, E> Drop for DeferredResult<T, E> {
    fn drop(&mut self) {
        if let Some(core) = &self.core {
            core.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<T, E> From<&DeferredValue<T, E>> for DeferredResult<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn from(value: &DeferredValue<T, E>) -> Self {
        DeferredResult::new(value)
    }
}

impl<T, E> DeferredResult<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Binds a new result to `value`, outside any transaction.
    pub fn new(value: &DeferredValue<T, E>) -> Self {
        value.core.readers.fetch_add(1, Ordering::SeqCst);
        DeferredResult {
            core: Some(Arc::clone(&value.core)),
        }
    }

    /// Binds a new result to `value` from inside a transaction. The reader
    /// count only increments once the enclosing root transaction commits
    /// (registered via [`Transaction::after`]), so an attempt that conflicts
    /// or retries before committing never leaves a phantom reader behind.
    pub fn bind(value: &DeferredValue<T, E>, tx: &mut Transaction) -> Self {
        let core = Arc::clone(&value.core);
        let for_after = Arc::clone(&core);
        tx.after(move || {
            for_after.readers.fetch_add(1, Ordering::SeqCst);
        });
        DeferredResult { core: Some(core) }
    }

    pub fn is_bound(&self) -> bool {
        self.core.is_some()
    }

    /// Detaches this handle from its core without resolving it. A no-op on
    /// an already-unbound result.
    pub fn release(&mut self) {
        if let Some(core) = self.core.take() {
            core.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_done(&self) -> Result<bool, DeferredError<E>> {
        match &self.core {
            None => Err(DeferredError::Unbound),
            Some(core) => Ok(core.snapshot().map(|(done, _)| done).unwrap_or(false)),
        }
    }

    pub fn failed(&self) -> Result<bool, DeferredError<E>> {
        match &self.core {
            None => Err(DeferredError::Unbound),
            Some(core) => {
                let (done, failed) = core.snapshot().unwrap_or((false, false));
                if !done {
                    Err(DeferredError::NotDone)
                } else {
                    Ok(failed)
                }
            }
        }
    }

    pub fn get_result(&self) -> Result<T, DeferredError<E>> {
        match &self.core {
            None => Err(DeferredError::Unbound),
            Some(core) => core.get(),
        }
    }

    pub fn throw_error(&self) -> Result<(), DeferredError<E>> {
        match &self.core {
            None => Err(DeferredError::Unbound),
            Some(core) => core.throw(),
        }
    }

    /// Runs `f` once this result resolves — immediately, inline, if it
    /// already has.
    pub fn on_done(&self, f: impl FnOnce() + Send + 'static) -> Result<(), DeferredError<E>> {
        match &self.core {
            None => Err(DeferredError::Unbound),
            Some(core) => {
                core.on_done(f);
                Ok(())
            }
        }
    }

    /// Blocks the calling thread (no transaction involved) until this
    /// result resolves or `timeout` elapses. Returns whether it resolved
    /// before the deadline.
    pub fn wait(&self, timeout: RetryTimeout) -> bool {
        let Some(core) = &self.core else { return false };
        let mut inner = core.inner.lock().unwrap();
        match timeout {
            RetryTimeout::Unlimited => {
                while matches!(inner.state, DeferredState::Pending) {
                    inner = core.wait_cond.wait(inner).unwrap();
                }
                true
            }
            RetryTimeout::After(duration) => {
                let deadline = std::time::Instant::now() + duration;
                while matches!(inner.state, DeferredState::Pending) {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) = core.wait_cond.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                    if result.timed_out() && matches!(inner.state, DeferredState::Pending) {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Retries (per §4.D) until this result is done. The only coupling
    /// point between deferred results and the transaction runtime.
    ///
    /// # Panics
    /// Panics if called on an unbound result — unlike every other accessor
    /// here, there is no sensible typed error to return through `StmResult`
    /// (whose error type is the internal retry signal, not
    /// [`DeferredError`]); calling it on a "null" result is a programming
    /// error, not a recoverable runtime condition.
    pub fn retry_if_not_done(&self, tx: &mut Transaction, timeout: RetryTimeout) -> StmResult<()> {
        let core = self
            .core
            .as_ref()
            .expect("wstm: retry_if_not_done called on an unbound DeferredResult");
        if core.done_var.get(tx)? {
            Ok(())
        } else {
            crate::transaction::retry(tx, timeout)
        }
    }
}
