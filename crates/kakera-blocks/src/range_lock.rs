//! Non-blocking byte-range locks over the container file.
//!
//! Two layers:
//!
//! - an in-process table that rejects any overlap with a range already held
//!   by some thread of this process (POSIX record locks never conflict within
//!   one process, so this table is what keeps threads apart);
//! - optional OS advisory locks (`fcntl(F_SETLK)`) on the same ranges, which
//!   keep other processes out. Only available on Unix.
//!
//! Nothing here ever waits: a conflicting request returns `None` and the
//! caller decides whether to retry.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::BlockResult;

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// Table of byte ranges currently held by this process.
#[derive(Debug)]
pub struct RangeLocks {
    held: Mutex<Vec<(u64, Range<u64>)>>,
    next_id: AtomicU64,
    #[cfg(unix)]
    fd: Option<RawFd>,
}

impl RangeLocks {
    /// Create a table that only coordinates threads of this process.
    pub fn in_process() -> Self {
        Self {
            held: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            #[cfg(unix)]
            fd: None,
        }
    }

    /// Create a table that also takes OS advisory locks on `fd`.
    ///
    /// The descriptor must stay open for as long as the table is used.
    #[cfg(unix)]
    pub fn with_os_locks(fd: RawFd) -> Self {
        Self {
            fd: Some(fd),
            ..Self::in_process()
        }
    }

    /// Try to lock `len` bytes starting at `start`.
    ///
    /// Returns `Ok(None)` when the range overlaps a range held by this process
    /// or by another process.
    pub fn try_lock(&self, start: u64, len: u64) -> BlockResult<Option<RangeGuard<'_>>> {
        let range = start..start + len;
        let mut held = self.held.lock();
        if held.iter().any(|(_, r)| overlaps(r, &range)) {
            return Ok(None);
        }

        #[cfg(unix)]
        if let Some(fd) = self.fd {
            if !os::set_lock(fd, start, len, true)? {
                return Ok(None);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        held.push((id, range));
        Ok(Some(RangeGuard {
            table: self,
            id,
            start,
            len,
        }))
    }

    /// Number of ranges currently held (diagnostics and tests).
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, id: u64, start: u64, len: u64) {
        let mut held = self.held.lock();
        held.retain(|(held_id, _)| *held_id != id);

        #[cfg(unix)]
        if let Some(fd) = self.fd {
            if let Err(e) = os::set_lock(fd, start, len, false) {
                tracing::warn!("failed to release OS lock on {}..{}: {}", start, start + len, e);
            }
        }
        #[cfg(not(unix))]
        let _ = (start, len);
    }
}

fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

/// A held byte range. Released on drop.
#[derive(Debug)]
pub struct RangeGuard<'a> {
    table: &'a RangeLocks,
    id: u64,
    start: u64,
    len: u64,
}

impl RangeGuard<'_> {
    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.len
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.id, self.start, self.len);
    }
}

#[cfg(unix)]
mod os {
    use std::io;
    use std::os::unix::io::RawFd;

    /// Take or drop a write record lock without waiting.
    ///
    /// Returns `Ok(false)` if another process holds a conflicting lock.
    pub(super) fn set_lock(fd: RawFd, start: u64, len: u64, lock: bool) -> io::Result<bool> {
        // SAFETY: flock is a plain C struct, all-zero is a valid value.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        let kind = if lock { libc::F_WRLCK } else { libc::F_UNLCK };
        fl.l_type = kind as _;
        fl.l_whence = libc::SEEK_SET as _;
        fl.l_start = start as libc::off_t;
        fl.l_len = len as libc::off_t;

        // SAFETY: fd is owned by the block store for the table's lifetime and
        // fl is a valid, initialised flock.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl as *const libc::flock) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::EACCES => Ok(false),
                _ => Err(err),
            };
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_ranges_conflict() {
        let locks = RangeLocks::in_process();
        let a = locks.try_lock(0, 16).unwrap();
        assert!(a.is_some());
        assert!(locks.try_lock(8, 16).unwrap().is_none());
        assert!(locks.try_lock(15, 1).unwrap().is_none());
        // Adjacent ranges do not overlap
        assert!(locks.try_lock(16, 16).unwrap().is_some());
    }

    #[test]
    fn test_release_on_drop() {
        let locks = RangeLocks::in_process();
        {
            let _guard = locks.try_lock(100, 10).unwrap().unwrap();
            assert_eq!(locks.held_count(), 1);
        }
        assert_eq!(locks.held_count(), 0);
        assert!(locks.try_lock(100, 10).unwrap().is_some());
    }

    #[test]
    fn test_conflict_across_threads() {
        let locks = std::sync::Arc::new(RangeLocks::in_process());
        let _guard = locks.try_lock(0, 64).unwrap().unwrap();

        let other = locks.clone();
        let got = std::thread::spawn(move || {
            let acquired = other.try_lock(32, 8).unwrap().is_some();
            acquired
        })
        .join()
        .unwrap();
        assert!(!got);
    }

    #[cfg(unix)]
    #[test]
    fn test_os_locks_in_same_process() {
        use std::os::unix::io::AsRawFd;

        let file = tempfile::tempfile().unwrap();
        file.set_len(128).unwrap();
        let locks = RangeLocks::with_os_locks(file.as_raw_fd());

        let guard = locks.try_lock(0, 64).unwrap();
        assert!(guard.is_some());
        assert!(locks.try_lock(0, 8).unwrap().is_none());
        drop(guard);
        assert!(locks.try_lock(0, 8).unwrap().is_some());
    }
}
