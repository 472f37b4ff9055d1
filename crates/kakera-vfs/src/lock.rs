//! Non-blocking reader/writer locks for tree nodes.
//!
//! Every attempt either succeeds immediately or fails; nothing waits. A thread
//! asking for a write lock it already holds is refused like any other
//! conflict. Read locks may be taken again by the same thread.
//!
//! Guards own a reference to the lock state, so a guard can outlive the borrow
//! of the node it came from and move between threads (file handles keep their
//! content lock this way).

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: Option<ThreadId>,
}

/// A try-only reader/writer lock.
#[derive(Debug, Default)]
pub struct NodeLock {
    state: Arc<Mutex<LockState>>,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock in `mode`. `None` on any conflict.
    pub fn try_acquire(&self, mode: LockMode) -> Option<LockGuard> {
        let mut state = self.state.lock();
        if state.writer.is_some() {
            // Includes a writer asking again: write reentrancy is a conflict.
            return None;
        }
        match mode {
            LockMode::Read => state.readers += 1,
            LockMode::Write => {
                if state.readers > 0 {
                    return None;
                }
                state.writer = Some(thread::current().id());
            }
        }
        Some(LockGuard {
            state: self.state.clone(),
            mode,
        })
    }

    pub fn try_read(&self) -> Option<LockGuard> {
        self.try_acquire(LockMode::Read)
    }

    pub fn try_write(&self) -> Option<LockGuard> {
        self.try_acquire(LockMode::Write)
    }

    /// Whether any thread holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Whether the calling thread holds the write lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Number of read locks currently held.
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }
}

/// A held node lock, released on drop.
#[derive(Debug)]
pub struct LockGuard {
    state: Arc<Mutex<LockState>>,
    mode: LockMode,
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        match self.mode {
            LockMode::Read => state.readers = state.readers.saturating_sub(1),
            LockMode::Write => state.writer = None,
        }
    }
}

/// Locks gathered by one multi-node operation.
///
/// Dropping the set releases everything it holds, which is how a failed
/// lock-down rolls back.
#[derive(Debug, Default)]
pub struct LockSet {
    guards: Vec<LockGuard>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guard: LockGuard) {
        self.guards.push(guard);
    }

    /// Take over every guard of `other`.
    pub fn absorb(&mut self, mut other: LockSet) {
        self.guards.append(&mut other.guards);
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share() {
        let lock = NodeLock::new();
        let a = lock.try_read();
        let b = lock.try_read();
        assert!(a.is_some() && b.is_some());
        assert_eq!(lock.readers(), 2);
        assert!(lock.try_write().is_none());
        drop((a, b));
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_write_reentrancy_rejected() {
        let lock = NodeLock::new();
        let guard = lock.try_write().unwrap();
        assert!(lock.is_held_by_current_thread());
        assert!(lock.try_write().is_none());
        assert!(lock.try_read().is_none());
        drop(guard);
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_writer_excludes_other_threads() {
        let lock = Arc::new(NodeLock::new());
        let _guard = lock.try_write().unwrap();

        let other = lock.clone();
        let (read, write) = thread::spawn(move || {
            let read = other.try_read().is_some();
            let write = other.try_write().is_some();
            (read, write)
        })
        .join()
        .unwrap();
        assert!(!read);
        assert!(!write);
        assert!(lock.is_held_by_current_thread());
    }

    #[test]
    fn test_guard_released_on_other_thread() {
        let lock = NodeLock::new();
        let guard = lock.try_write().unwrap();
        thread::spawn(move || drop(guard)).join().unwrap();
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_lock_set_rolls_back_on_drop() {
        let a = NodeLock::new();
        let b = NodeLock::new();
        {
            let mut set = LockSet::new();
            set.push(a.try_write().unwrap());
            set.push(b.try_read().unwrap());
            assert_eq!(set.len(), 2);
        }
        assert!(!a.is_write_locked());
        assert_eq!(b.readers(), 0);
    }
}
