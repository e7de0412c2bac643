// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine-level lock whose strategy is chosen once at construction.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

/// Thread synchronization mode requested by the owning agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadSync {
    /// Caller guarantees single-threaded use; locking is a no-op.
    None,

    /// Every lock, shared or not, is exclusive.
    #[default]
    Strict,

    /// Shared locks may be held concurrently; exclusive locks are writers.
    ReaderWriter,
}

#[derive(Debug)]
enum LockImpl {
    Noop,
    Exclusive(Mutex<()>),
    ReaderWriter(RwLock<()>),
}

/// Lock with a fixed dispatch selected from [`ThreadSync`].
#[derive(Debug)]
pub struct SyncLock {
    inner: LockImpl,
}

/// Guard returned by [`SyncLock`]; unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub enum SyncGuard<'a> {
    Noop,
    Exclusive(MutexGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
    Read(RwLockReadGuard<'a, ()>),
}

impl SyncLock {
    pub fn new(mode: ThreadSync) -> Self {
        let inner = match mode {
            ThreadSync::None => LockImpl::Noop,
            ThreadSync::Strict => LockImpl::Exclusive(Mutex::new(())),
            ThreadSync::ReaderWriter => LockImpl::ReaderWriter(RwLock::new(())),
        };
        Self { inner }
    }

    pub fn mode(&self) -> ThreadSync {
        match self.inner {
            LockImpl::Noop => ThreadSync::None,
            LockImpl::Exclusive(_) => ThreadSync::Strict,
            LockImpl::ReaderWriter(_) => ThreadSync::ReaderWriter,
        }
    }

    /// Acquire the lock exclusively.
    pub fn lock(&self) -> SyncGuard<'_> {
        match &self.inner {
            LockImpl::Noop => SyncGuard::Noop,
            LockImpl::Exclusive(m) => SyncGuard::Exclusive(m.lock()),
            LockImpl::ReaderWriter(rw) => SyncGuard::Write(rw.write()),
        }
    }

    /// Acquire the lock for shared access.
    pub fn lock_shared(&self) -> SyncGuard<'_> {
        match &self.inner {
            LockImpl::Noop => SyncGuard::Noop,
            LockImpl::Exclusive(m) => SyncGuard::Exclusive(m.lock()),
            LockImpl::ReaderWriter(rw) => SyncGuard::Read(rw.read()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_mode_round_trip() {
        for mode in [ThreadSync::None, ThreadSync::Strict, ThreadSync::ReaderWriter] {
            assert_eq!(SyncLock::new(mode).mode(), mode);
        }
    }

    #[test]
    fn test_reader_writer_allows_concurrent_readers() {
        let lock = SyncLock::new(ThreadSync::ReaderWriter);
        let first = lock.lock_shared();
        let second = lock.lock_shared();
        assert!(matches!(first, SyncGuard::Read(_)));
        assert!(matches!(second, SyncGuard::Read(_)));
    }

    #[test]
    fn test_strict_shared_is_exclusive() {
        let lock = SyncLock::new(ThreadSync::Strict);
        let guard = lock.lock_shared();
        assert!(matches!(guard, SyncGuard::Exclusive(_)));
    }

    #[test]
    fn test_noop_never_blocks() {
        let lock = SyncLock::new(ThreadSync::None);
        let _a = lock.lock();
        let _b = lock.lock();
        let _c = lock.lock_shared();
    }

    #[test]
    fn test_exclusive_serializes_writers() {
        let lock = Arc::new(SyncLock::new(ThreadSync::Strict));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.lock();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
