//! The global arbiter: one reader/upgrade/writer lock shared by every
//! [`crate::Var`], plus the single commit-signal condition variable that the
//! retry/wake-up protocol waits on.
//!
//! Grounded on `boost::upgrade_mutex` as used by `s_readMutex` in the
//! original implementation's `src/stm.cpp`: many readers, at most one
//! "upgrade" holder (which may promote itself to the exclusive writer once
//! all plain readers have drained), at most one writer. Unlike a per-`Var`
//! lock, this single lock is what lets commit + validate treat the whole
//! variable universe as one atomic unit, and lets `retry` block on exactly
//! one condition variable instead of a per-variable wait list.

use std::cell::Cell;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::result::RetryTimeout;

#[derive(Default)]
struct ArbiterState {
    readers: u32,
    upgrade_held: bool,
    writer_held: bool,
    // Bumped every time a writer hold is released. Lets a thread about to
    // block in `wait_for_commit` check, under the same lock the condvar
    // uses, whether a commit already happened since it last looked —
    // otherwise a commit's `notify_all` landing between that look and the
    // `wait` call is lost and the thread blocks forever. Mirrors the
    // teacher's `blocked: AtomicBool` / `set_changed` pair in
    // `control_block.rs`, generalized to a counter since this arbiter is
    // shared by every variable rather than one flag per variable.
    generation: u64,
}

pub(crate) struct Arbiter {
    state: Mutex<ArbiterState>,
    commit_signal: Condvar,
}

/// RAII guard for a plain read hold. Dropping it releases the hold.
pub(crate) struct ReadGuard<'a> {
    arbiter: &'a Arbiter,
    released: bool,
}

/// RAII guard for an upgrade hold. Can be promoted to a [`WriteGuard`].
pub(crate) struct UpgradeGuard<'a> {
    arbiter: &'a Arbiter,
    released: bool,
}

/// RAII guard for the exclusive writer hold. Produced only via
/// [`UpgradeGuard::promote`]. Dropping it releases the writer hold and
/// broadcasts the commit signal, waking every thread blocked in `retry`.
pub(crate) struct WriteGuard<'a> {
    arbiter: &'a Arbiter,
}

thread_local! {
    // Debug-only re-entrance counter: the original asserts (in `_DEBUG`
    // builds) that a thread never tries to acquire a second, incompatible
    // hold on `s_readMutex` while already holding one. `debug_assertions`
    // is the idiomatic Rust equivalent of that build flag.
    static LOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

fn enter_debug() {
    if cfg!(debug_assertions) {
        LOCK_DEPTH.with(|d| d.set(d.get() + 1));
    }
}

fn exit_debug() {
    if cfg!(debug_assertions) {
        LOCK_DEPTH.with(|d| {
            debug_assert!(d.get() > 0, "STM: arbiter lock depth underflow");
            d.set(d.get() - 1);
        });
    }
}

impl Arbiter {
    pub(crate) const fn new() -> Self {
        Arbiter {
            state: Mutex::new(ArbiterState {
                readers: 0,
                upgrade_held: false,
                writer_held: false,
                generation: 0,
            }),
            commit_signal: Condvar::new(),
        }
    }

    /// The current commit generation. A caller intending to block in
    /// [`Arbiter::wait_for_commit`] should capture this before it starts
    /// reading, so any commit that lands before the wait call — not just
    /// one that lands during it — is detected rather than missed.
    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub(crate) fn read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        while state.writer_held {
            // readers never block on a pending upgrade, only on the writer
            self.commit_signal.wait(&mut state);
        }
        state.readers += 1;
        enter_debug();
        ReadGuard {
            arbiter: self,
            released: false,
        }
    }

    pub(crate) fn upgrade(&self) -> UpgradeGuard<'_> {
        let mut state = self.state.lock();
        while state.upgrade_held || state.writer_held {
            self.commit_signal.wait(&mut state);
        }
        state.upgrade_held = true;
        enter_debug();
        UpgradeGuard {
            arbiter: self,
            released: false,
        }
    }

    /// Blocks until a commit has landed since `since_generation` (as
    /// returned by an earlier [`Arbiter::generation`] call), or the
    /// timeout passes. Returns `true` if a commit was observed, `false` on
    /// timeout. Used by the retry protocol; takes (and releases) its own
    /// read hold internally so callers never need to be holding one.
    ///
    /// Checks the generation under the same lock the condvar waits on
    /// before blocking at all: if a commit already landed between the
    /// caller capturing `since_generation` and this call, that commit's
    /// `notify_all` may have already fired with nobody waiting, so a bare
    /// `wait` here would hang forever. The `Unlimited` case additionally
    /// loops on a bounded `wait_for` as a deadlock net, in case a commit
    /// instead lands in the small window between this check and actually
    /// registering as a waiter.
    pub(crate) fn wait_for_commit(&self, since_generation: u64, timeout: RetryTimeout) -> bool {
        const SAFETY_NET: Duration = Duration::from_millis(1000);

        let mut state = self.state.lock();
        if state.generation != since_generation {
            return true;
        }
        match timeout {
            RetryTimeout::Unlimited => loop {
                self.commit_signal.wait_for(&mut state, SAFETY_NET);
                if state.generation != since_generation {
                    return true;
                }
            },
            RetryTimeout::After(duration) => {
                let deadline = Instant::now() + duration;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let remaining = (deadline - now).min(SAFETY_NET);
                    self.commit_signal.wait_for(&mut state, remaining);
                    if state.generation != since_generation {
                        return true;
                    }
                    if Instant::now() >= deadline {
                        return false;
                    }
                }
            }
        }
    }
}

impl<'a> ReadGuard<'a> {
    pub(crate) fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.arbiter.state.lock();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        if state.readers == 0 {
            self.arbiter.commit_signal.notify_all();
        }
        exit_debug();
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<'a> UpgradeGuard<'a> {
    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.arbiter.state.lock();
        debug_assert!(state.upgrade_held);
        state.upgrade_held = false;
        self.arbiter.commit_signal.notify_all();
        exit_debug();
    }

    pub(crate) fn release(mut self) {
        self.release_inner();
    }

    /// Blocks until every plain reader has drained, then promotes this hold
    /// to the exclusive writer. Mirrors
    /// `upgrade_to_unique_lock(upgradeLock)` in `WWriteLock`'s constructor.
    pub(crate) fn promote(mut self) -> WriteGuard<'a> {
        let arbiter = self.arbiter;
        {
            let mut state = arbiter.state.lock();
            while state.readers > 0 {
                arbiter.commit_signal.wait(&mut state);
            }
            state.writer_held = true;
        }
        // the writer hold subsumes the upgrade hold; skip releasing it
        // through the normal path so we don't notify readers in between.
        self.released = true;
        WriteGuard { arbiter }
    }
}

impl Drop for UpgradeGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.arbiter.state.lock();
        debug_assert!(state.writer_held);
        state.writer_held = false;
        state.generation = state.generation.wrapping_add(1);
        exit_debug();
        drop(state);
        // Every variable this writer touched just became visible at a new
        // version: broadcast so every thread blocked in `retry` re-validates.
        self.arbiter.commit_signal.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn multiple_readers_do_not_block_each_other() {
        let arbiter = Arc::new(Arbiter::new());
        let _g1 = arbiter.read();
        let _g2 = arbiter.read();
        // no deadlock: reaching here is the assertion
    }

    #[test]
    fn writer_excludes_readers() {
        let arbiter = Arc::new(Arbiter::new());
        let a = Arc::clone(&arbiter);
        let upgrade = arbiter.upgrade();
        let write = upgrade.promote();

        let handle = thread::spawn(move || {
            let _r = a.read();
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        drop(write);
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_commit_times_out() {
        let arbiter = Arbiter::new();
        let generation = arbiter.generation();
        let woke =
            arbiter.wait_for_commit(generation, RetryTimeout::After(Duration::from_millis(20)));
        assert!(!woke);
    }

    #[test]
    fn wait_for_commit_wakes_on_writer_release() {
        let arbiter = Arc::new(Arbiter::new());
        let a = Arc::clone(&arbiter);
        let generation = arbiter.generation();
        let handle = thread::spawn(move || a.wait_for_commit(generation, RetryTimeout::Unlimited));
        thread::sleep(Duration::from_millis(30));
        let upgrade = arbiter.upgrade();
        let write = upgrade.promote();
        drop(write);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_for_commit_does_not_block_if_already_stale() {
        let arbiter = Arbiter::new();
        let generation = arbiter.generation();
        let upgrade = arbiter.upgrade();
        let write = upgrade.promote();
        drop(write);

        // a commit already landed since `generation` was captured; this
        // must return immediately rather than waiting for a future one.
        let woke = arbiter.wait_for_commit(generation, RetryTimeout::After(Duration::from_secs(30)));
        assert!(woke);
    }
}
