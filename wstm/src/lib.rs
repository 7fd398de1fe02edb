//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated STM.
//!
//! Reads and writes against [`Var`] happen inside an [`atomically`] block.
//! Each attempt keeps its reads and writes in a private log; if every
//! variable it touched is still at the version it read when the attempt
//! finishes, the log is published as one atomic commit. Otherwise the
//! attempt is thrown away and retried from scratch, with nothing from the
//! failed attempt ever becoming visible to anyone else.
//!
//! Unlike locks, STM composes: two transactional operations sequenced one
//! after another are still one atomic unit, with no window in which another
//! thread can observe a partial result. Applying STM correctly does not by
//! itself avoid starvation under heavy contention, but it avoids deadlock
//! entirely — a transaction never blocks on another's lock, it only retries.
//!
//! Panicking inside a transaction is safe: the attempt's log is dropped, no
//! partial write is ever published, and no `Var` is left poisoned.
//!
//! # Usage
//!
//! Only run transaction-safe code inside an [`atomically`] block:
//! no I/O, no locks, nothing with a side effect other than [`Var`] reads and
//! writes. An attempt can run more than once before it commits, so any other
//! side effect would run more than once too.
//!
//! ```
//! # use wstm::atomically;
//! let answer = atomically(|_tx| Ok(42));
//! assert_eq!(answer, 42);
//! ```
//!
//! ```
//! # use wstm::{atomically, Var};
//! let var = Var::new(0);
//!
//! let x = atomically(|tx| {
//!     var.set(tx, 42)?;
//!     var.get(tx)
//! });
//!
//! assert_eq!(x, 42);
//! ```
//!
//! Nested calls to [`atomically`] are allowed: an inner `atomically` simply
//! joins the outer attempt's log rather than running its own independent
//! commit. Code meant to be composed into a larger transaction should prefer
//! taking `&mut Transaction` and returning [`StmResult`] over calling
//! `atomically` itself, so callers decide where the attempt boundary is.
//!
//! Use `?` on a [`StmResult`] to let a failed read propagate; never match on
//! it and discard the error, since the `Retry` it carries must reach the
//! attempt loop to be acted on.
//!
//! # Speed
//!
//! Keep attempts short: the longer one runs, the likelier it collides with
//! a concurrent writer and has to restart. Touching fewer variables lowers
//! both the chance of a collision and the cost of validating the log.

// Extra linting with exceptions
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::should_panic_without_expect)]

pub mod config;
pub mod deferred;
pub mod local;
mod profiling;
mod result;
pub(crate) mod transaction;
pub mod var;

#[cfg(test)]
mod test_support;

pub use config::{AtomicallyArgs, ConflictResolution};
pub use deferred::{DeferredError, DeferredValue, DeferredResult};
pub use local::{TransactionLocalFlag, TransactionLocalValue};
#[cfg(feature = "profiling")]
pub use profiling::{flush_current_thread, flush_to_file};
pub use result::{
    Error, RetrySignal, RetryTimeout, StmError, StmResult, TransactionClosureResult, TransactionError,
};
pub use transaction::{atomically, atomically_with_args, atomically_with_err, inconsistently, retry, Inconsistent, Transaction};
pub use var::Var;

/// Converts a `TransactionClosureResult<T, E_A>` into `TransactionClosureResult<T, E_B>`.
///
/// Useful when composing transactions whose closures return different error
/// types, as long as the target error `$to` implements `From<E>` for
/// whatever error `$op` can produce. Expands to:
///
/// ```ignore
/// $op.map_err(|e| match e {
///     wstm::TransactionError::Abort(e) => wstm::TransactionError::Abort($to::from(e)),
///     wstm::TransactionError::Stm(e) => wstm::TransactionError::Stm(e),
/// })?
/// ```
///
/// # Example
///
/// ```rust
/// # use wstm::{abort, atomically_with_err, try_or_coerce, Transaction, TransactionClosureResult};
/// struct Error1;
/// struct Error2;
///
/// impl From<Error1> for Error2 {
///     fn from(_: Error1) -> Self {
///         Error2
///     }
/// }
///
/// fn op1(_trans: &mut Transaction) -> TransactionClosureResult<(), Error1> {
///     Ok(())
/// }
///
/// fn op2(_trans: &mut Transaction) -> TransactionClosureResult<(), Error2> {
///     Ok(())
/// }
///
/// let res: Result<(), Error2> = atomically_with_err(|trans| {
///     try_or_coerce!(op1(trans), Error2);
///     op2(trans)?;
///     Ok(())
/// });
/// # let _ = res;
/// ```
#[macro_export]
macro_rules! try_or_coerce {
    ($op: expr, $to: ident) => {
        $op.map_err(|e| match e {
            $crate::TransactionError::Abort(e) => $crate::TransactionError::Abort($to::from(e)),
            $crate::TransactionError::Stm(e) => $crate::TransactionError::Stm(e),
        })?
    };
}

/// Aborts the enclosing transaction, passing `e` through as the closure's
/// error.
///
/// # Examples
///
/// ```
/// # use wstm::*;
/// struct MyError;
///
/// let result: Result<u32, _> = atomically_with_err(|_| abort(MyError));
/// assert!(result.is_err());
/// ```
#[inline]
pub fn abort<T, E>(e: E) -> TransactionClosureResult<T, E> {
    Err(TransactionError::Abort(e))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn infinite_retry_never_terminates() {
        let terminated = test_support::terminates(300, || {
            let _: i32 = atomically(|tx| retry(tx, RetryTimeout::Unlimited));
        });
        assert!(!terminated);
    }

    #[test]
    fn nested_atomically_joins_the_outer_log() {
        let var = Var::new(0);
        let x = atomically(|tx| {
            var.set(tx, 42)?;
            atomically(|tx2| var.get(tx2))
        });
        assert_eq!(42, x);
    }

    #[test]
    fn threaded_retry_wakes_once_the_writer_commits() {
        let var = Arc::new(Var::new(0));
        let reader = Arc::clone(&var);

        let x = test_support::async_test(
            800,
            move || {
                atomically(|tx| {
                    let x = reader.get(tx)?;
                    if x == 0 {
                        retry(tx, RetryTimeout::Unlimited)
                    } else {
                        Ok(x)
                    }
                })
            },
            || {
                thread::sleep(Duration::from_millis(100));
                atomically(|tx| var.set(tx, 42));
            },
        )
        .unwrap();

        assert_eq!(42, x);
    }

    #[test]
    fn try_or_coerce_forwards_the_coerced_abort() {
        #[derive(Debug)]
        struct Error1;
        #[derive(Debug, PartialEq)]
        struct Error2;

        impl From<Error1> for Error2 {
            fn from(_: Error1) -> Self {
                Error2
            }
        }

        fn op1(_tx: &mut Transaction) -> TransactionClosureResult<(), Error1> {
            abort(Error1)
        }

        let result: Result<(), Error2> = atomically_with_err(|tx| {
            try_or_coerce!(op1(tx), Error2);
            Ok(())
        });

        assert_eq!(result, Err(Error2));
    }

    #[test]
    fn abort_short_circuits_with_the_caller_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let result: Result<(), &'static str> = atomically_with_err(move |_tx| {
            c.fetch_add(1, Ordering::SeqCst);
            abort("nope")
        });
        assert_eq!(result, Err("nope"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
