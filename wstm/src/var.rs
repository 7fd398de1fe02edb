//! Component A: versioned values and transactional variables.
//!
//! Grounded on `WValue<Type_t>`/`WVarCore<Type_t>` in
//! `examples/original_source/STM/stm.h`, adapted to the teacher's
//! type-erased-control-block shape (`fast-stm`'s `VarControlBlock` holding a
//! `parking_lot::RwLock<Arc<dyn Any + Send + Sync>>`): each `Var<T>` wraps a
//! non-generic control block so a transaction's read/write registers can
//! hold many different `Var<T>`s in one map, keyed by control-block
//! identity, without a heterogeneous trait object per variable.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::transaction::Transaction;
use crate::result::StmResult;

pub(crate) type ErasedPayload = Arc<dyn Any + Send + Sync>;

/// A published, immutable snapshot of a variable's value together with the
/// version it was committed at. Never mutated in place: a commit swings the
/// control block's slot to point at a brand new `VersionedValue`, and the
/// old one stays alive for as long as something still references it.
#[derive(Clone)]
pub(crate) struct VersionedValue {
    pub(crate) version: u64,
    pub(crate) payload: ErasedPayload,
}

pub(crate) struct VarControlBlock {
    pub(crate) slot: RwLock<VersionedValue>,
}

impl VarControlBlock {
    fn new(payload: ErasedPayload) -> Arc<Self> {
        Arc::new(VarControlBlock {
            slot: RwLock::new(VersionedValue { version: 0, payload }),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Reads the currently published snapshot without going through any
    /// transaction. Used by `get_read_only` and as the baseline a
    /// transaction's first read of a variable starts from.
    pub(crate) fn snapshot(&self) -> VersionedValue {
        self.slot.read().clone()
    }

    /// Swings the slot to `payload` with a new version, returning the
    /// displaced value so the committing transaction can keep it alive
    /// until after its `after` hooks run (see `transaction/mod.rs`).
    pub(crate) fn publish(&self, payload: ErasedPayload) -> VersionedValue {
        let mut slot = self.slot.write();
        let old = std::mem::replace(
            &mut *slot,
            VersionedValue {
                version: slot.version + 1,
                payload,
            },
        );
        old
    }
}

/// A transactional variable. Not `Clone`/`Copy`: the original's `WVar` has a
/// private copy constructor, and this implementation reflects that directly
/// rather than offering the teacher's "cloneable handle sharing one control
/// block" convenience. Code that needs to share a variable between threads
/// wraps it the same way any other non-`Clone` value is shared: `Arc<Var<T>>`.
pub struct Var<T> {
    pub(crate) control: Arc<VarControlBlock>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

// Safety: `VarControlBlock` only stores `T` behind `Arc<dyn Any + Send +
// Sync>`, and access is always through the control block's own
// synchronization (the `RwLock` and, for commits, the arbiter).
unsafe impl<T: Send> Send for Var<T> {}
unsafe impl<T: Send + Sync> Sync for Var<T> {}

pub(crate) fn downcast<T: Clone + 'static>(payload: &ErasedPayload) -> T {
    payload
        .downcast_ref::<T>()
        .expect("Var<T>: control block payload type mismatch (internal invariant violated)")
        .clone()
}

static NEXT_VAR_DEBUG_ID: AtomicU64 = AtomicU64::new(0);

impl<T: Send + Sync + Clone + 'static> Var<T> {
    pub fn new(initial: T) -> Self {
        let _ = NEXT_VAR_DEBUG_ID.fetch_add(1, Ordering::Relaxed);
        Var {
            control: VarControlBlock::new(Arc::new(initial)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Reads the value as seen by `tx`: from the transaction's own write or
    /// read register if already touched this attempt, otherwise a fresh
    /// snapshot that gets recorded into the read register.
    pub fn get(&self, tx: &mut Transaction) -> StmResult<T> {
        Ok(tx.read::<T>(&self.control))
    }

    /// Records `value` into the transaction's write register. Not visible
    /// to other transactions until this one commits.
    pub fn set(&self, tx: &mut Transaction, value: T) -> StmResult<()> {
        tx.write::<T>(&self.control, value);
        Ok(())
    }

    /// Convenience: `get` followed by `f`, then `set` with the result.
    pub fn modify(&self, tx: &mut Transaction, f: impl FnOnce(T) -> T) -> StmResult<()> {
        let value = self.get(tx)?;
        self.set(tx, f(value))
    }

    /// Reads the variable's current published value with no transaction at
    /// all and no retry semantics: a plain atomic snapshot read, matching
    /// `WVar::GetReadOnly`.
    pub fn get_read_only(&self) -> T {
        downcast::<T>(&self.control.snapshot().payload)
    }

    /// Reads the variable's value inside an [`crate::Inconsistent`] view:
    /// consistent with itself, but not necessarily with other variables
    /// read in the same view if a writer commits concurrently between two
    /// such reads (see `WInconsistent`).
    pub fn get_inconsistent(&self, ins: &mut crate::transaction::Inconsistent) -> T {
        downcast::<T>(&ins.read(&self.control).payload)
    }

    /// Re-validates this single variable against `tx`'s recorded read
    /// version, without waiting for commit. Fails the same way a stale read
    /// would at commit time, just earlier.
    pub fn validate(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.validate_one(&self.control)
    }

    #[cfg(feature = "profiling")]
    pub fn name_for_profiling(&self, name: &'static str) {
        crate::profiling::name_var(self.control.id(), name);
    }
}

impl<T> std::fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.control.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::atomically;

    #[test]
    fn new_and_get_read_only_round_trip() {
        let var = Var::new(42);
        assert_eq!(var.get_read_only(), 42);
    }

    #[test]
    fn set_is_not_visible_until_commit() {
        let var = Var::new(0);
        atomically(|tx| var.set(tx, 42));
        assert_eq!(var.get_read_only(), 42);
    }

    #[test]
    fn modify_reads_then_writes() {
        let var = Var::new(10);
        atomically(|tx| var.modify(tx, |v| v + 1));
        assert_eq!(var.get_read_only(), 11);
    }

    #[test]
    fn versions_increase_monotonically_across_commits() {
        let var = Var::new(0);
        let v0 = var.control.snapshot().version;
        atomically(|tx| var.set(tx, 1));
        let v1 = var.control.snapshot().version;
        atomically(|tx| var.set(tx, 2));
        let v2 = var.control.snapshot().version;
        assert!(v1 > v0);
        assert!(v2 > v1);
    }
}
