//! Component E: transaction-local values and flags.
//!
//! Grounded on `WTransactionLocalValue<Type_t>`/`WTransactionLocalFlag` in
//! `examples/original_source/STM/stm.h`: a value that lives only for the
//! duration of a transaction attempt, visible to child frames (inherited
//! from the parent if not overridden), and discarded with the frame on
//! commit or abort.
//!
//! Keyed by a process-global monotonically increasing `u64`, not by the
//! value's own address: `Internal::GetTransactionLocalKey()` in the
//! original picks the same strategy specifically to avoid two
//! transaction-local values at different times reusing the same freed
//! memory address and colliding in the frame's local map.
//!
//! `get`/`set` work with owned, `Clone`-able values rather than the
//! original's references into frame storage: a reference borrowed out of
//! the thread-local frame stack cannot outlive the accessor call that
//! produced it, so cloning is the straightforward safe-Rust substitute.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::transaction::Transaction;

static NEXT_LOCAL_KEY: AtomicU64 = AtomicU64::new(0);

fn next_key() -> u64 {
    NEXT_LOCAL_KEY.fetch_add(1, Ordering::Relaxed)
}

/// A value scoped to the lifetime of a single transaction attempt.
///
/// `get` walks up the frame stack to the nearest ancestor that has set a
/// value (a child frame inherits its parent's transaction-local values
/// until it sets its own); `set` always writes into the *current* frame
/// only, per `WTransactionLocalValue::Set`.
pub struct TransactionLocalValue<T> {
    key: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for TransactionLocalValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> TransactionLocalValue<T> {
    pub fn new() -> Self {
        TransactionLocalValue {
            key: next_key(),
            _marker: PhantomData,
        }
    }

    /// `None` if neither this frame nor any ancestor has set a value yet.
    pub fn get(&self, tx: &mut Transaction) -> Option<T> {
        tx.get_local::<T>(self.key)
    }

    /// Sets the value in the *current* frame. A parent frame's value (if
    /// any) is left untouched, so it reappears once this frame merges away
    /// or a sibling looks it up again.
    pub fn set(&self, tx: &mut Transaction, value: T) {
        tx.set_local::<T>(self.key, value);
    }
}

/// A transaction-local boolean with an atomic-ish test-and-set, matching
/// `WTransactionLocalFlag`. Typically used to make some piece of per-commit
/// bookkeeping ("have I already registered an `after` hook for this?")
/// idempotent within one attempt.
#[derive(Default)]
pub struct TransactionLocalFlag(TransactionLocalValue<bool>);

impl TransactionLocalFlag {
    pub fn new() -> Self {
        TransactionLocalFlag(TransactionLocalValue::new())
    }

    /// Returns the flag's previous value (`false` the first time this is
    /// called within a given transaction attempt) and sets it to `true`.
    pub fn test_and_set(&self, tx: &mut Transaction) -> bool {
        let was_set = self.0.get(tx).unwrap_or(false);
        self.0.set(tx, true);
        was_set
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::atomically;

    #[test]
    fn unset_local_reads_as_none() {
        let local = TransactionLocalValue::<u32>::new();
        atomically(|tx| {
            assert_eq!(local.get(tx), None);
            Ok(())
        });
    }

    #[test]
    fn set_then_get_in_same_attempt() {
        let local = TransactionLocalValue::<u32>::new();
        atomically(|tx| {
            local.set(tx, 7);
            assert_eq!(local.get(tx), Some(7));
            Ok(())
        });
    }

    #[test]
    fn flag_test_and_set_is_idempotent_within_an_attempt() {
        let flag = TransactionLocalFlag::new();
        atomically(|tx| {
            assert!(!flag.test_and_set(tx));
            assert!(flag.test_and_set(tx));
            assert!(flag.test_and_set(tx));
            Ok(())
        });
    }

    #[test]
    fn child_commit_moves_local_value_into_parent() {
        let local = TransactionLocalValue::<u32>::new();
        atomically(|tx| {
            atomically(|tx2| {
                local.set(tx2, 99);
                Ok(())
            });
            assert_eq!(local.get(tx), Some(99));
            Ok(())
        });
    }
}
