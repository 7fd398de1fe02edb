//! A fixed-size append-only buffer of encoded profile frames.
//!
//! Grounded on `ConflictProfilingInternal::WPage` in
//! `examples/original_source/src/conflict_profiling_internal.h`: a
//! `4096`-byte buffer that frames are packed into until it fills, at which
//! point a new page is started. The original links pages with an intrusive
//! `m_next_p` so a whole chain can be handed off with one pointer swap; a
//! plain `Vec<ProfilePage>` gives the same "own until handed off, then
//! transfer in one move" behavior without the manual pointer bookkeeping.

pub(crate) const PAGE_SIZE: usize = 4096;

pub(crate) struct ProfilePage {
    data: Vec<u8>,
}

impl ProfilePage {
    pub(crate) fn new() -> Self {
        ProfilePage {
            data: Vec::with_capacity(PAGE_SIZE),
        }
    }

    pub(crate) fn left(&self) -> usize {
        PAGE_SIZE.saturating_sub(self.data.len())
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }
}
