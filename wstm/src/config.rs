//! Per-call configuration for [`crate::atomically_with_args`].
//!
//! Mirrors the original library's `WMaxConflicts`/`WConRes`/`WMaxRetries`/
//! `WMaxRetryWait` combinator arguments as a single record with builder
//! setters, per the design note on replacing variadic named-argument
//! configuration with one config struct.

use crate::result::RetryTimeout;

/// What to do when a transaction has conflicted (failed validation on
/// commit) `max_conflicts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// Give up and return [`crate::Error::MaxConflicts`].
    #[default]
    Throw,
    /// Take the arbiter's upgrade lock for the entire next attempt,
    /// serializing it against every other commit. Guarantees the next
    /// attempt validates, at the cost of blocking all other writers for its
    /// duration.
    RunLocked,
}

/// Configuration accepted by [`crate::atomically_with_args`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicallyArgs {
    pub(crate) max_conflicts: Option<u32>,
    pub(crate) conflict_resolution: ConflictResolution,
    pub(crate) max_retries: Option<u32>,
    pub(crate) max_retry_wait: RetryTimeout,
}

impl Default for AtomicallyArgs {
    fn default() -> Self {
        AtomicallyArgs {
            max_conflicts: None,
            conflict_resolution: ConflictResolution::Throw,
            max_retries: None,
            max_retry_wait: RetryTimeout::Unlimited,
        }
    }
}

impl AtomicallyArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up with [`crate::Error::MaxConflicts`] (or switch to
    /// `RunLocked` serialization, see [`Self::with_conflict_resolution`])
    /// after this many failed-validation conflicts.
    #[must_use]
    pub fn with_max_conflicts(mut self, max_conflicts: u32) -> Self {
        self.max_conflicts = Some(max_conflicts);
        self
    }

    #[must_use]
    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    /// Give up with [`crate::Error::MaxRetries`] after this many explicit
    /// `retry()` calls.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Bound on how long any single retry wait may block, regardless of the
    /// timeout passed to `retry_for`. The effective wait is
    /// `min(call_timeout, max_retry_wait)`.
    #[must_use]
    pub fn with_max_retry_wait(mut self, max_retry_wait: RetryTimeout) -> Self {
        self.max_retry_wait = max_retry_wait;
        self
    }
}
