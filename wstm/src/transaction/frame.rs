//! Component B: the per-attempt transaction frame.
//!
//! Grounded on `Internal::WTransactionData` in
//! `examples/original_source/src/stm.cpp`: one frame per nesting level,
//! holding the read/write register, transaction-local values and the three
//! hook lists (`before_commit`, `after`, `on_fail`).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use cfg_if::cfg_if;

use crate::result::StmResult;
use crate::transaction::Transaction;
use crate::var::{ErasedPayload, VarControlBlock};

pub(crate) enum LogEntry {
    /// Read only so far; `version`/`value` are the snapshot taken at the
    /// time of the first read.
    Read { version: u64, value: ErasedPayload },
    /// Written, never read first. No version to validate: a pure write
    /// always wins as long as the commit itself succeeds.
    Write { value: ErasedPayload },
    /// Read, then written. Validated like `Read`; committed like `Write`.
    ReadWrite { version: u64, value: ErasedPayload },
}

impl LogEntry {
    fn current_value(&self) -> &ErasedPayload {
        match self {
            LogEntry::Read { value, .. }
            | LogEntry::Write { value }
            | LogEntry::ReadWrite { value, .. } => value,
        }
    }

    fn read_version(&self) -> Option<u64> {
        match self {
            LogEntry::Read { version, .. } | LogEntry::ReadWrite { version, .. } => Some(*version),
            LogEntry::Write { .. } => None,
        }
    }

    fn into_write(self, value: ErasedPayload) -> LogEntry {
        match self {
            LogEntry::Read { version, .. } | LogEntry::ReadWrite { version, .. } => {
                LogEntry::ReadWrite { version, value }
            }
            LogEntry::Write { .. } => LogEntry::Write { value },
        }
    }
}

cfg_if! {
    if #[cfg(feature = "hash-registers")] {
        pub(crate) type RegisterType = rustc_hash::FxHashMap<usize, (Arc<VarControlBlock>, LogEntry)>;
    } else {
        pub(crate) type RegisterType = std::collections::BTreeMap<usize, (Arc<VarControlBlock>, LogEntry)>;
    }
}

pub(crate) type BeforeCommitHook = Box<dyn FnMut(&mut Transaction) -> StmResult<()> + Send>;
pub(crate) type AfterHook = Box<dyn FnOnce() + Send>;
pub(crate) type OnFailHook = Box<dyn FnOnce() + Send>;

pub(crate) struct Frame {
    pub(crate) level: u32,
    pub(crate) vars: RegisterType,
    pub(crate) locals: HashMap<u64, Box<dyn Any + Send>>,
    pub(crate) before_commit: Vec<BeforeCommitHook>,
    pub(crate) after: Vec<AfterHook>,
    pub(crate) on_fail: Vec<OnFailHook>,
}

impl Frame {
    pub(crate) fn new(level: u32) -> Self {
        Frame {
            level,
            vars: RegisterType::default(),
            locals: HashMap::new(),
            before_commit: Vec::new(),
            after: Vec::new(),
            on_fail: Vec::new(),
        }
    }

    pub(crate) fn read(&mut self, control: &Arc<VarControlBlock>) -> ErasedPayload {
        let id = control.id();
        if let Some((_, entry)) = self.vars.get(&id) {
            return entry.current_value().clone();
        }
        // A committer holds the writer hold across its whole publish loop
        // but publishes each variable's slot individually, so without this
        // hold a read here could land between two of that loop's
        // publishes and observe a torn, half-committed batch. Taking (and
        // immediately releasing) a read hold serializes this snapshot
        // against the entire batch.
        let snapshot = {
            let _hold = crate::transaction::ARBITER.read();
            control.snapshot()
        };
        let value = snapshot.payload.clone();
        self.vars.insert(
            id,
            (
                Arc::clone(control),
                LogEntry::Read {
                    version: snapshot.version,
                    value: snapshot.payload,
                },
            ),
        );
        value
    }

    pub(crate) fn write(&mut self, control: &Arc<VarControlBlock>, value: ErasedPayload) {
        let id = control.id();
        if let Some((_, entry)) = self.vars.remove(&id) {
            self.vars
                .insert(id, (Arc::clone(control), entry.into_write(value)));
        } else {
            self.vars
                .insert(id, (Arc::clone(control), LogEntry::Write { value }));
        }
    }

    /// Validates every entry that carries a read version against the
    /// variable's live version. Returns the id of the first mismatch, if
    /// any.
    pub(crate) fn validate(&self) -> bool {
        self.vars.values().all(|(control, entry)| match entry.read_version() {
            None => true,
            Some(version) => control.snapshot().version == version,
        })
    }

    pub(crate) fn validate_one(&self, control: &Arc<VarControlBlock>) -> bool {
        match self.vars.get(&control.id()) {
            None => true,
            Some((_, entry)) => match entry.read_version() {
                None => true,
                Some(version) => control.snapshot().version == version,
            },
        }
    }

    /// True iff at least one variable in this frame has a pending write.
    /// An empty write map is what makes a commit a read-only commit
    /// (§4.D step 6: read hold, validate, release — no pointer swing).
    pub(crate) fn has_writes(&self) -> bool {
        self.vars
            .values()
            .any(|(_, entry)| matches!(entry, LogEntry::Write { .. } | LogEntry::ReadWrite { .. }))
    }

    /// Pending writes to publish at commit time.
    pub(crate) fn write_entries(&self) -> impl Iterator<Item = (&Arc<VarControlBlock>, &ErasedPayload)> {
        self.vars.values().filter_map(|(control, entry)| match entry {
            LogEntry::Write { value } | LogEntry::ReadWrite { value, .. } => Some((control, value)),
            LogEntry::Read { .. } => None,
        })
    }

    /// Control-block identities of every variable with a pending write in
    /// this frame. Used only by the conflict-profiling capture path (§4.G)
    /// to record a commit's `set_ids`.
    pub(crate) fn write_ids(&self) -> Vec<usize> {
        self.vars
            .iter()
            .filter(|(_, (_, entry))| matches!(entry, LogEntry::Write { .. } | LogEntry::ReadWrite { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Control-block identities of every variable this frame has read
    /// (with or without also writing it). Used only by the
    /// conflict-profiling capture path to record a conflict's `got_ids`.
    pub(crate) fn read_ids(&self) -> Vec<usize> {
        self.vars
            .iter()
            .filter(|(_, (_, entry))| entry.read_version().is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Discards this attempt's reads, writes, locals and not-yet-run
    /// `before_commit`/`after` hooks so the same frame (same level) can be
    /// reused for the next attempt. `on_fail` hooks must already have been
    /// drained and run by the caller before calling this.
    pub(crate) fn reset_for_retry(&mut self) {
        self.vars.clear();
        self.locals.clear();
        self.before_commit.clear();
        self.after.clear();
    }

    /// Folds this (child) frame's reads, writes and hooks into `parent`
    /// after a successful nested commit. Mirrors
    /// `WTransactionData::MergeToParent`.
    pub(crate) fn merge_into_parent(self, parent: &mut Frame) {
        for (id, (control, entry)) in self.vars {
            match parent.vars.remove(&id) {
                None => {
                    parent.vars.insert(id, (control, entry));
                }
                Some((_, parent_entry)) => {
                    // Parent's own record of this var (if older) loses to
                    // the child's, since the child ran strictly after it
                    // within this same attempt; but a read version recorded
                    // by the parent before the child touched the var must
                    // be preserved for validation, so keep the parent's
                    // read_version when the child only performed a plain
                    // write on top of a var the parent had already read.
                    let merged = match (parent_entry.read_version(), &entry) {
                        (Some(v), LogEntry::Write { value }) => LogEntry::ReadWrite {
                            version: v,
                            value: value.clone(),
                        },
                        _ => entry,
                    };
                    parent.vars.insert(id, (control, merged));
                }
            }
        }
        for (key, value) in self.locals {
            parent.locals.insert(key, value);
        }
        parent.before_commit.extend(self.before_commit);
        parent.after.extend(self.after);
        parent.on_fail.extend(self.on_fail);
    }

    /// On a child's `Retry`, only its reads are visible to the ancestors
    /// (its writes must not survive an attempt that didn't commit). Mirrors
    /// `WTransactionData::MergeGetsToRoot`.
    pub(crate) fn merge_gets_into(&mut self, parent: &mut Frame) {
        for (id, (control, entry)) in &self.vars {
            if let Some(version) = entry.read_version() {
                parent
                    .vars
                    .entry(*id)
                    .or_insert_with(|| (Arc::clone(control), LogEntry::Read {
                        version,
                        value: entry.current_value().clone(),
                    }));
            }
        }
    }
}
