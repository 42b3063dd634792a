//! Process-wide, path-keyed reader/writer lock table (component C1).
//!
//! Two primitives underpin every lock a blob or store ever takes:
//!
//! * a thread-level reader/writer counter, so concurrent threads of this
//!   process never fight over the same OS lock state, and
//! * an OS advisory `flock(2)` on the path's own file descriptor, which is
//!   the only primitive that is visible across processes and which the
//!   kernel releases automatically if the holding process dies.
//!
//! Closing any open file description on a path releases that description's
//! `flock`, so a thread-level guard is mandatory: without it, two threads of
//! the same process opening the same path as "writers" would each think
//! they own the lock, and whichever closes its descriptor first silently
//! drops the other's OS lock out from under it.
//!
//! The registry is process-global by necessity — the OS lock is a
//! per-process resource — and is initialized lazily on first use. It is
//! never torn down: the kernel reclaims all `flock` state when the process
//! exits, so there is nothing to clean up at shutdown.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use once_cell::sync::Lazy;

use crate::error::BlobError;

/// Maximum outstanding handles this process may hold on a single path at
/// once. Matches the fixed-capacity descriptor table of the original design.
pub const MAX_HANDLES: usize = 99;

/// Poll interval used while waiting for a contested lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(99);

/// The mode a handle is taken in. `Create`/`CreateExcl` only make sense for
/// `ReadWrite*` variants; all writer variants share one [`RecordMode`] so
/// they cannot be mixed with readers on the same path within this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    ReadWriteCreate,
    ReadWriteCreateExcl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordMode {
    Reader,
    Writer,
}

impl AccessMode {
    fn record_mode(self) -> RecordMode {
        match self {
            AccessMode::ReadOnly => RecordMode::Reader,
            _ => RecordMode::Writer,
        }
    }

    fn open_options(self, perm: u32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            AccessMode::ReadOnly => {
                opts.read(true);
            }
            AccessMode::ReadWrite => {
                opts.read(true).write(true);
            }
            AccessMode::ReadWriteCreate => {
                opts.read(true).write(true).create(true).mode(perm);
            }
            AccessMode::ReadWriteCreateExcl => {
                opts.read(true)
                    .write(true)
                    .create_new(true)
                    .mode(perm);
            }
        }
        opts
    }
}

struct RecordState {
    mode: Option<RecordMode>,
    readers: usize,
    writer: bool,
    refs: usize,
    slots: Vec<Option<File>>,
}

impl RecordState {
    fn new() -> Self {
        RecordState {
            mode: None,
            readers: 0,
            writer: false,
            refs: 0,
            slots: Vec::new(),
        }
    }

    fn try_thread_lock(&mut self, mode: RecordMode) -> bool {
        match mode {
            RecordMode::Reader => {
                if self.writer {
                    false
                } else {
                    self.readers += 1;
                    true
                }
            }
            RecordMode::Writer => {
                if self.writer || self.readers > 0 {
                    false
                } else {
                    self.writer = true;
                    true
                }
            }
        }
    }

    fn release_thread_lock(&mut self, mode: RecordMode) {
        match mode {
            RecordMode::Reader => self.readers = self.readers.saturating_sub(1),
            RecordMode::Writer => self.writer = false,
        }
    }

    fn insert_slot(&mut self, file: File) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(file);
            idx
        } else {
            self.slots.push(Some(file));
            self.slots.len() - 1
        }
    }
}

struct LockRecord {
    state: Mutex<RecordState>,
}

impl LockRecord {
    fn new() -> Self {
        LockRecord {
            state: Mutex::new(RecordState::new()),
        }
    }
}

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<LockRecord>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A held path lock. Dropping this without calling [`release`] leaks the
/// registry reference count (the slot and OS lock are only freed by
/// `release`) — callers must always pair `acquire` with `release`, exactly
/// as every `Blob`/`BlobStore` operation in this crate does via RAII guards
/// built on top of this primitive.
pub struct LockHandle {
    path: PathBuf,
    mode: RecordMode,
    slot: usize,
    record: Arc<LockRecord>,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writer(&self) -> bool {
        self.mode == RecordMode::Writer
    }
}

fn registry_get_or_insert(path: &Path) -> Arc<LockRecord> {
    let mut registry = REGISTRY.lock().unwrap();
    registry
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(LockRecord::new()))
        .clone()
}

/// Decrement the reference count for `path`'s record and drop it from the
/// registry once nothing references it anymore.
fn unregister_ref(path: &Path, record: &Arc<LockRecord>) {
    let mut registry = REGISTRY.lock().unwrap();
    let mut state = record.state.lock().unwrap();
    state.refs = state.refs.saturating_sub(1);
    let refs = state.refs;
    if refs == 0 {
        state.mode = None;
    }
    drop(state);
    if refs == 0 {
        if let Some(entry) = registry.get(path) {
            if Arc::ptr_eq(entry, record) {
                registry.remove(path);
            }
        }
    }
}

/// Acquire a path lock.
///
/// `perm` is only consulted when `mode` creates the file. `timeout` of
/// `None` polls forever; `Some(Duration::ZERO)` makes exactly one attempt.
pub fn acquire(
    path: &Path,
    mode: AccessMode,
    timeout: Option<Duration>,
    perm: u32,
) -> Result<LockHandle, BlobError> {
    let record_mode = mode.record_mode();
    let record = registry_get_or_insert(path);

    {
        let mut state = record.state.lock().unwrap();
        match state.mode {
            Some(existing) if existing != record_mode => {
                drop(state);
                unregister_ref(path, &record);
                return Err(BlobError::inval(format!(
                    "lock mode mismatch on {:?}: path is already held in the other mode",
                    path
                )));
            }
            _ => {}
        }
        if state.refs >= MAX_HANDLES {
            drop(state);
            // refs was never bumped for this attempt; nothing to unregister.
            return Err(BlobError::MFile(format!(
                "more than {} outstanding lock handles on {:?}",
                MAX_HANDLES, path
            )));
        }
        state.mode = Some(record_mode);
        state.refs += 1;
    }

    match acquire_locked(path, mode, record_mode, timeout, perm, &record) {
        Ok(handle) => Ok(handle),
        Err(err) => {
            unregister_ref(path, &record);
            Err(err)
        }
    }
}

fn acquire_locked(
    path: &Path,
    mode: AccessMode,
    record_mode: RecordMode,
    timeout: Option<Duration>,
    perm: u32,
    record: &Arc<LockRecord>,
) -> Result<LockHandle, BlobError> {
    let file = mode
        .open_options(perm)
        .open(path)
        .map_err(BlobError::from)?;
    let fd = file.as_raw_fd();

    let flock_arg = match record_mode {
        RecordMode::Reader => FlockArg::LockSharedNonblock,
        RecordMode::Writer => FlockArg::LockExclusiveNonblock,
    };

    let start = Instant::now();
    loop {
        let mut state = record.state.lock().unwrap();
        let got_thread_lock = state.try_thread_lock(record_mode);
        if got_thread_lock {
            match flock(fd, flock_arg) {
                Ok(()) => {
                    let slot = state.insert_slot(file);
                    return Ok(LockHandle {
                        path: path.to_path_buf(),
                        mode: record_mode,
                        slot,
                        record: record.clone(),
                    });
                }
                Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) => {
                    state.release_thread_lock(record_mode);
                }
                Err(err) => {
                    state.release_thread_lock(record_mode);
                    return Err(BlobError::from(err));
                }
            }
        }
        drop(state);

        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return Err(BlobError::again(format!(
                    "timed out acquiring lock on {:?}",
                    path
                )));
            }
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
        if timeout == Some(Duration::ZERO) {
            // a zero timeout means "exactly one attempt"; the sleep above was
            // skipped-equivalent since we already checked elapsed() >= 0.
            return Err(BlobError::again(format!(
                "lock on {:?} is currently held",
                path
            )));
        }
    }
}

/// Release a previously acquired lock handle.
pub fn release(handle: LockHandle) -> Result<(), BlobError> {
    let LockHandle {
        path,
        mode,
        slot,
        record,
    } = handle;

    {
        let mut state = record.state.lock().unwrap();
        match state.slots.get_mut(slot) {
            Some(entry @ Some(_)) => {
                *entry = None; // dropping the File closes fd, releasing the OS lock
            }
            _ => return Err(BlobError::BadF(format!("unknown lock handle for {:?}", path))),
        }
        state.release_thread_lock(mode);
    }

    unregister_ref(&path, &record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reentry_up_to_cap_then_mfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        std::fs::write(&path, b"").unwrap();

        let mut handles = Vec::new();
        for _ in 0..MAX_HANDLES {
            handles.push(acquire(&path, AccessMode::ReadOnly, Some(Duration::ZERO), 0o600).unwrap());
        }
        let err = acquire(&path, AccessMode::ReadOnly, Some(Duration::ZERO), 0o600).unwrap_err();
        assert_eq!(err.kind(), "MFILE");

        let err = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap_err();
        assert_eq!(err.kind(), "INVAL");

        for h in handles {
            release(h).unwrap();
        }

        let writer = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap();
        release(writer).unwrap();
    }

    #[test]
    fn writer_excludes_writer_same_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        std::fs::write(&path, b"").unwrap();

        let w1 = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap();
        let err = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap_err();
        assert_eq!(err.kind(), "AGAIN");
        release(w1).unwrap();

        let w2 = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap();
        release(w2).unwrap();
    }

    #[test]
    fn release_of_unknown_handle_is_badf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        std::fs::write(&path, b"").unwrap();
        let h = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap();
        release(h).unwrap();
        // registry entry is gone now; re-acquire and verify it is independent
        let h2 = acquire(&path, AccessMode::ReadWrite, Some(Duration::ZERO), 0o600).unwrap();
        release(h2).unwrap();
    }
}
