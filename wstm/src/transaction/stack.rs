//! The per-thread frame stack and its "push aside" mechanism.
//!
//! Grounded on `Internal::WTransactionDataList`/`WPushGuard` in
//! `examples/original_source/src/stm.cpp`. A thread only ever has one
//! *active* chain of frames, since a child frame always resolves (commits
//! to its parent, or unwinds) before its parent resumes. But code that runs
//! during restart/on-fail handling (destructors of values dropped after a
//! commit, or an `on_fail` hook) may itself start a brand new, unrelated
//! transaction — and that transaction must not see, or corrupt, the frames
//! currently being torn down. `push_aside` swaps the live stack out for an
//! empty one for the duration of such code, restoring it afterwards.

use std::cell::RefCell;

use crate::transaction::frame::Frame;

thread_local! {
    static STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard returned by [`push_aside`]. Restores the displaced stack when
/// dropped, even if the code that ran while it was aside panicked.
pub(crate) struct PushGuard {
    displaced: Option<Vec<Frame>>,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        if let Some(displaced) = self.displaced.take() {
            STACK.with(|s| *s.borrow_mut() = displaced);
        }
    }
}

pub(crate) fn push_aside() -> PushGuard {
    let displaced = STACK.with(|s| std::mem::take(&mut *s.borrow_mut()));
    PushGuard {
        displaced: Some(displaced),
    }
}

pub(crate) fn depth() -> u32 {
    STACK.with(|s| s.borrow().len() as u32)
}

pub(crate) fn push(frame: Frame) {
    STACK.with(|s| s.borrow_mut().push(frame));
}

/// Pops and returns the current top frame. Panics if there is none — every
/// caller only pops a frame it is certain it pushed.
pub(crate) fn pop() -> Frame {
    STACK.with(|s| {
        s.borrow_mut()
            .pop()
            .expect("wstm: frame stack underflow (internal invariant violated)")
    })
}

pub(crate) fn with_chain<R>(f: impl FnOnce(&[Frame]) -> R) -> R {
    STACK.with(|s| f(&s.borrow()))
}

pub(crate) fn with_current<R>(f: impl FnOnce(&mut Frame) -> R) -> R {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let frame = stack
            .last_mut()
            .expect("wstm: no active transaction on this thread");
        f(frame)
    })
}

/// Gives mutable access to both the current frame and, if there is one, its
/// parent — needed to merge a child's reads/writes/hooks up a level.
pub(crate) fn with_current_and_parent<R>(f: impl FnOnce(&mut Frame, Option<&mut Frame>) -> R) -> R {
    STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let len = stack.len();
        assert!(len > 0, "wstm: no active transaction on this thread");
        let (rest, cur) = stack.split_at_mut(len - 1);
        f(&mut cur[0], rest.last_mut())
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_aside_hides_frames_and_restores_them() {
        push(Frame::new(1));
        assert_eq!(depth(), 1);
        {
            let _guard = push_aside();
            assert_eq!(depth(), 0);
            push(Frame::new(1));
            assert_eq!(depth(), 1);
            pop();
        }
        assert_eq!(depth(), 1);
        pop();
        assert_eq!(depth(), 0);
    }

    #[test]
    fn push_aside_restores_even_on_panic() {
        push(Frame::new(1));
        let result = std::panic::catch_unwind(|| {
            let _guard = push_aside();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(depth(), 1);
        pop();
    }
}
