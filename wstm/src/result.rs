//! Errors and result aliases used across the crate.
//!
//! The internal control-flow signals (`Retry`, failed validation) never
//! reach user code: they are resolved inside [`crate::atomically`] before it
//! returns. What a user's transaction body sees is [`StmResult`]; what
//! `atomically_with_args` itself can fail with (after exhausting its
//! conflict/retry budget, or being misused) is [`Error`].

use std::fmt;
use std::time::Duration;

/// A signal raised by a transaction body to request a restart once one of
/// the variables it read has changed.
///
/// Produced only by [`crate::retry`]; not constructible by user code, so it
/// cannot be stored, matched on or otherwise treated as an ordinary error by
/// a transaction body. `?` is the only way to propagate it, exactly like any
/// other entry in [`StmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySignal {
    pub(crate) reason: SignalReason,
    pub(crate) timeout: RetryTimeout,
}

impl RetrySignal {
    pub(crate) fn explicit(timeout: RetryTimeout) -> Self {
        RetrySignal {
            reason: SignalReason::Explicit,
            timeout,
        }
    }

    pub(crate) fn failed_validation() -> Self {
        RetrySignal {
            reason: SignalReason::FailedValidation,
            timeout: RetryTimeout::Unlimited,
        }
    }
}

impl fmt::Display for RetrySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            SignalReason::Explicit => write!(f, "explicit retry"),
            SignalReason::FailedValidation => write!(f, "failed validation"),
        }
    }
}

/// Why a [`RetrySignal`] was raised. Not exported: failed validation is an
/// internal restart-without-waiting signal (it counts against
/// `max_conflicts`, not `max_retries`, and never blocks), distinct from a
/// user's explicit `retry()` only in how the runtime reacts to it, not in
/// its public shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalReason {
    Explicit,
    FailedValidation,
}

/// How long a transaction is willing to block waiting for a variable it
/// read to change, before giving up with [`Error::RetryTimeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTimeout {
    Unlimited,
    After(Duration),
}

impl RetryTimeout {
    pub(crate) fn min(self, other: RetryTimeout) -> RetryTimeout {
        use RetryTimeout::{After, Unlimited};
        match (self, other) {
            (Unlimited, x) | (x, Unlimited) => x,
            (After(a), After(b)) => After(a.min(b)),
        }
    }
}

impl Default for RetryTimeout {
    fn default() -> Self {
        RetryTimeout::Unlimited
    }
}

/// Error raised by a single step of a transaction body (the part visible to
/// `?` inside an `op: Fn(&mut Transaction) -> StmResult<T>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StmError {
    /// `retry()` was called; the runtime will block until a read variable
    /// changes (or the configured timeout elapses) and rerun the body.
    #[error("explicit retry")]
    Retry(#[from] RetrySignal),
}

/// Return type of a transaction body that cannot itself fail with a custom
/// error, only retry.
pub type StmResult<T> = Result<T, StmError>;

/// Return type of a transaction body that may also abort with a
/// caller-supplied error `E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError<E> {
    #[error(transparent)]
    Stm(#[from] StmError),
    #[error("transaction aborted")]
    Abort(E),
}

pub type TransactionClosureResult<T, E> = Result<T, TransactionError<E>>;

/// Errors that can escape [`crate::atomically_with_args`] (and the handful
/// of other entry points that can fail instead of retrying forever).
///
/// `FailedValidation` and the `Retry` control signal are deliberately absent
/// here: they are resolved internally by the commit/retry loop and never
/// escape to a caller. See `src/transaction/mod.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The configured `max_conflicts` budget was exceeded without a
    /// successful commit.
    #[error("maximum number of conflicts ({0}) exceeded")]
    MaxConflicts(u32),

    /// The configured `max_retries` budget was exceeded.
    #[error("maximum number of retries ({0}) exceeded")]
    MaxRetries(u32),

    /// A `retry()` wait exceeded its configured timeout without any read
    /// variable changing.
    #[error("retry timed out")]
    RetryTimeout,

    /// An operation that requires being outside any active transaction
    /// (e.g. [`crate::inconsistently`]) was called from within one.
    #[error("operation not allowed inside an active transaction")]
    InAtomic,

    /// A [`crate::DeferredResult`] was used without ever being bound to a
    /// [`crate::DeferredValue`].
    #[error("deferred result is not bound to a value")]
    InvalidDeferredResult,

    /// A [`crate::DeferredResult`] was read synchronously while still
    /// pending.
    #[error("deferred result is not yet done")]
    NotDone,

    /// The [`crate::DeferredValue`] producing a result was dropped before
    /// calling `done` or `fail`.
    #[error("producer was dropped before resolving the deferred value")]
    BrokenPromise,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_timeout_min_takes_the_shorter_bound() {
        let a = RetryTimeout::After(Duration::from_millis(50));
        let b = RetryTimeout::After(Duration::from_millis(10));
        assert_eq!(a.min(b), RetryTimeout::After(Duration::from_millis(10)));
    }

    #[test]
    fn retry_timeout_min_with_unlimited_keeps_the_bounded_side() {
        let bounded = RetryTimeout::After(Duration::from_millis(50));
        assert_eq!(RetryTimeout::Unlimited.min(bounded), bounded);
        assert_eq!(bounded.min(RetryTimeout::Unlimited), bounded);
    }
}
