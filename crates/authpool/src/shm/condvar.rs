// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Condition variable for shared memory, built on a futex sequence counter.
//!
//! # Design
//!
//! ```text
//! ShmCondvar (64 bytes, cache-line aligned)
//! +----------------------------------------+
//! | seq: AtomicU32  (bumped on every wake) |
//! | padding                                |
//! +----------------------------------------+
//! ```
//!
//! Waiters snapshot `seq` *before* checking their condition under the table
//! lock, then sleep only while `seq` still equals the snapshot. Signallers bump
//! `seq` and wake. A signal that races with the check therefore makes the
//! futex wait return at once instead of being lost.
//!
//! There is no association with a particular lock: the table lock is always
//! released before sleeping, and every wakeup is only a hint.

use super::futex::{futex_wait, futex_wake_all, futex_wake_one};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Snapshot taken by [`ShmCondvar::prepare_to_sleep`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "a ticket is only useful when passed to sleep()"]
pub struct SleepTicket(u32);

/// Condition variable (cache-line aligned to prevent false sharing).
#[repr(C, align(64))]
pub struct ShmCondvar {
    seq: AtomicU32,
    _pad: [u8; 60],
}

impl ShmCondvar {
    /// Create a new condvar (all-zero, matches a fresh mapping)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            _pad: [0u8; 60],
        }
    }

    /// Register intent to sleep. Call before re-checking the condition.
    #[inline]
    pub fn prepare_to_sleep(&self) -> SleepTicket {
        SleepTicket(self.seq.load(Ordering::Acquire))
    }

    /// Sleep until signalled after `ticket` was taken, or until `timeout`.
    ///
    /// Returns immediately if a signal already happened since the ticket.
    #[inline]
    pub fn sleep(&self, ticket: SleepTicket, timeout: Option<Duration>) {
        futex_wait(&self.seq, ticket.0, timeout);
    }

    /// Wake one sleeper.
    #[inline]
    pub fn signal(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake_one(&self.seq);
    }

    /// Wake every sleeper.
    #[inline]
    pub fn broadcast(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.seq);
    }
}

impl Default for ShmCondvar {
    fn default() -> Self {
        Self::new()
    }
}
