//! Component G: per-thread conflict-profiling capture.
//!
//! Grounded on `ConflictProfilingInternal::WThreadData`/`WMainData` in
//! `examples/original_source/src/conflict_profiling_internal.h`: every
//! top-level transaction attempt records a `Commit` or `Conflict` frame
//! into the current thread's page chain; `Var::name_for_profiling` records
//! a `VarName` frame binding a variable's identity to a human name; at
//! thread exit the chain is handed off to a process-wide list, and
//! [`flush_to_file`] walks that list and writes a `wstm_<unix_seconds>.profile`
//! file, matching spec §6's binary format byte-for-byte.
//!
//! Gated behind the `profiling` cargo feature (same name as the teacher's
//! own feature). When the feature is off, every entry point below compiles
//! to nothing: `transaction/mod.rs`'s call sites cost zero extra
//! instructions, matching spec §4.G's "zero runtime cost when disabled"
//! contract.

#[cfg(feature = "profiling")]
mod frame;
#[cfg(feature = "profiling")]
mod page;

#[cfg(feature = "profiling")]
mod imp {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, OnceLock};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::frame;
    use super::page::ProfilePage;

    static NEXT_NAME_KEY: AtomicU64 = AtomicU64::new(1);
    static NAMES: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();
    static GLOBAL: OnceLock<Mutex<Vec<ProfilePage>>> = OnceLock::new();

    fn names() -> &'static Mutex<HashMap<String, u64>> {
        NAMES.get_or_init(|| Mutex::new(HashMap::new()))
    }

    fn global_pages() -> &'static Mutex<Vec<ProfilePage>> {
        GLOBAL.get_or_init(|| Mutex::new(Vec::new()))
    }

    fn intern(name: &str) -> u64 {
        let mut table = names().lock().unwrap();
        if let Some(&key) = table.get(name) {
            return key;
        }
        let key = NEXT_NAME_KEY.fetch_add(1, Ordering::Relaxed);
        table.insert(name.to_owned(), key);
        key
    }

    fn now_ns() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }

    struct CurrentTransaction {
        file_key: u64,
        line: u16,
        attempt_start_ns: i64,
    }

    struct ThreadProfiler {
        pages: Vec<ProfilePage>,
        thread_name_key: u64,
        current: Option<CurrentTransaction>,
        in_child: u32,
    }

    impl ThreadProfiler {
        fn new() -> Self {
            let label = std::thread::current()
                .name()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{:?}", std::thread::current().id()));
            ThreadProfiler {
                pages: vec![ProfilePage::new()],
                thread_name_key: intern(&label),
                current: None,
                in_child: 0,
            }
        }

        fn append(&mut self, bytes: &[u8]) {
            if bytes.len() > super::page::PAGE_SIZE {
                // A pathologically large single frame (huge id list or var
                // name) gets a dedicated oversized page rather than being
                // silently truncated; spec's "spill onto a new page" is
                // honored, its "split at an array boundary" is not, since
                // that would require re-entrant frame encoding for no
                // benefit here.
                let mut page = ProfilePage::new();
                page.write(bytes);
                self.pages.push(page);
                return;
            }
            if self.pages.last().map(ProfilePage::left).unwrap_or(0) < bytes.len() {
                self.pages.push(ProfilePage::new());
            }
            self.pages.last_mut().unwrap().write(bytes);
        }

        fn start_transaction(&mut self, file: &'static str, line: u32) {
            if crate::transaction::stack::depth() > 0 {
                self.in_child += 1;
                return;
            }
            self.in_child = 0;
            self.current = Some(CurrentTransaction {
                file_key: intern(file),
                line: line.min(u16::MAX as u32) as u16,
                attempt_start_ns: now_ns(),
            });
        }

        fn start_attempt(&mut self) {
            if let Some(current) = &mut self.current {
                current.attempt_start_ns = now_ns();
            }
        }

        fn commit(&mut self) {
            let ids = crate::transaction::stack::with_current(|f| f.write_ids());
            self.record(true, &ids);
        }

        fn conflict(&mut self) {
            let ids = crate::transaction::stack::with_current(|f| f.read_ids());
            self.record(false, &ids);
        }

        fn record(&mut self, is_commit: bool, ids: &[usize]) {
            let Some(current) = &self.current else { return };
            let ids: Vec<u64> = ids.iter().map(|id| *id as u64).collect();
            let end_ns = now_ns();
            let bytes = if is_commit {
                frame::encode_commit(
                    0,
                    self.thread_name_key,
                    current.attempt_start_ns,
                    end_ns,
                    current.file_key,
                    current.line,
                    &ids,
                )
            } else {
                frame::encode_conflict(
                    0,
                    self.thread_name_key,
                    current.attempt_start_ns,
                    end_ns,
                    current.file_key,
                    current.line,
                    &ids,
                )
            };
            self.append(&bytes);
        }

        fn name_var(&mut self, var_id: usize, name: &'static str) {
            let name_id = intern(name);
            let bytes = frame::encode_var_name(name_id, var_id as u64);
            self.append(&bytes);
        }
    }

    impl Drop for ThreadProfiler {
        fn drop(&mut self) {
            let pages = std::mem::take(&mut self.pages);
            global_pages().lock().unwrap().extend(pages);
        }
    }

    thread_local! {
        static PROFILER: RefCell<ThreadProfiler> = RefCell::new(ThreadProfiler::new());
    }

    pub(crate) fn start_transaction(file: &'static str, line: u32) {
        PROFILER.with(|p| p.borrow_mut().start_transaction(file, line));
    }

    pub(crate) fn start_attempt() {
        PROFILER.with(|p| p.borrow_mut().start_attempt());
    }

    pub(crate) fn commit() {
        PROFILER.with(|p| p.borrow_mut().commit());
    }

    pub(crate) fn conflict() {
        PROFILER.with(|p| p.borrow_mut().conflict());
    }

    pub(crate) fn name_var(var_id: usize, name: &'static str) {
        PROFILER.with(|p| p.borrow_mut().name_var(var_id, name));
    }

    /// Hands this thread's not-yet-flushed pages to the global list without
    /// waiting for the thread to exit. Exposed mainly for tests; production
    /// callers normally rely on [`flush_to_file`] running after every
    /// profiled thread has already joined.
    pub fn flush_current_thread() {
        PROFILER.with(|p| {
            let mut profiler = p.borrow_mut();
            let pages = std::mem::take(&mut profiler.pages);
            profiler.pages.push(ProfilePage::new());
            global_pages().lock().unwrap().extend(pages);
        });
    }

    /// Walks every page handed off by every thread (live or exited) plus
    /// the calling thread's own pages, emits one `NameData` frame per
    /// unique interned string, and writes the whole stream to
    /// `wstm_<unix_seconds>.profile` in `dir`. Returns the path written.
    ///
    /// There is no portable equivalent of the original's process-exit
    /// static destructor in Rust, so this is an explicit API the host
    /// application calls at shutdown (see DESIGN.md).
    pub fn flush_to_file(dir: impl AsRef<std::path::Path>) -> std::io::Result<PathBuf> {
        flush_current_thread();

        let mut out = Vec::new();
        {
            let pages = global_pages().lock().unwrap();
            for page in pages.iter() {
                out.extend_from_slice(page.bytes());
            }
        }
        {
            let table = names().lock().unwrap();
            for (name, key) in table.iter() {
                out.extend_from_slice(&frame::encode_name_data(*key, name.as_bytes()));
            }
        }

        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = dir.as_ref().join(format!("wstm_{unix_seconds}.profile"));
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&out)?;
        Ok(path)
    }

}

#[cfg(feature = "profiling")]
pub(crate) use imp::{commit, conflict, name_var, start_attempt, start_transaction};
#[cfg(feature = "profiling")]
pub use imp::{flush_current_thread, flush_to_file};

#[cfg(not(feature = "profiling"))]
mod noop {
    #[inline(always)]
    pub(crate) fn start_transaction(_file: &'static str, _line: u32) {}
    #[inline(always)]
    pub(crate) fn start_attempt() {}
    #[inline(always)]
    pub(crate) fn commit() {}
    #[inline(always)]
    pub(crate) fn conflict() {}
    #[inline(always)]
    pub(crate) fn name_var(_var_id: usize, _name: &'static str) {}
}

#[cfg(not(feature = "profiling"))]
pub(crate) use noop::{commit, conflict, name_var, start_attempt, start_transaction};
