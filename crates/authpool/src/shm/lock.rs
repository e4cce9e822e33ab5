// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crash-tolerant futex mutex for shared memory.
//!
//! # Lock Word Encoding
//!
//! ```text
//! bit 31      CONTENDED (someone may be sleeping on the word)
//! bits 0..30  pid of the holder, 0 = unlocked
//! ```
//!
//! Storing the holder pid makes a crashed holder detectable: a waiter whose
//! timed sleep expires checks the pid and, if the process is gone, swaps its
//! own pid into the word. Threads of one process share a pid, so a live
//! process is never robbed by its own threads.

use super::futex::{futex_wait, futex_wake_one};
use super::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Set when at least one waiter may be blocked in `futex_wait`
const CONTENDED: u32 = 1 << 31;

/// Period after which a blocked locker re-checks the holder's liveness
const HOLDER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Table-wide lock, one cache line.
#[repr(C, align(64))]
pub struct ShmLock {
    word: AtomicU32,
    _pad: [u8; 60],
}

impl ShmLock {
    /// Create an unlocked lock (all-zero, matches a fresh mapping)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            _pad: [0u8; 60],
        }
    }

    /// Acquire the lock for the calling process.
    pub fn lock(&self) -> ShmLockGuard<'_> {
        let me = process::current_pid();
        debug_assert!(me & CONTENDED == 0);

        if self
            .word
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return ShmLockGuard { lock: self };
        }

        self.lock_contended(me);
        ShmLockGuard { lock: self }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<ShmLockGuard<'_>> {
        self.word
            .compare_exchange(0, process::current_pid(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmLockGuard { lock: self })
    }

    /// Pid currently holding the lock, 0 when unlocked.
    #[must_use]
    pub fn holder(&self) -> u32 {
        self.word.load(Ordering::Relaxed) & !CONTENDED
    }

    #[cold]
    fn lock_contended(&self, me: u32) {
        loop {
            let current = self.word.load(Ordering::Relaxed);

            if current == 0 {
                // Keep CONTENDED: we cannot know whether others still sleep.
                if self
                    .word
                    .compare_exchange(0, me | CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            let holder = current & !CONTENDED;
            if !process::is_alive(holder) {
                if self
                    .word
                    .compare_exchange(current, me | CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    log::warn!(
                        "[SLOTS] Recovered table lock from dead process {}",
                        holder
                    );
                    return;
                }
                continue;
            }

            if current & CONTENDED == 0
                && self
                    .word
                    .compare_exchange(current, current | CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }

            futex_wait(&self.word, current | CONTENDED, Some(HOLDER_CHECK_INTERVAL));
        }
    }

    fn unlock(&self) {
        if self.word.swap(0, Ordering::Release) & CONTENDED != 0 {
            futex_wake_one(&self.word);
        }
    }
}

impl Default for ShmLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard, releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ShmLockGuard<'a> {
    lock: &'a ShmLock,
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
