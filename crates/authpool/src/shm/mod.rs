// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process synchronization primitives living in shared memory.
//!
//! The slot table is shared between every connecting process and every
//! worker process on the host, so nothing here may rely on per-process state:
//! no heap pointers, no `std::sync` primitives. Everything is built from
//! `repr(C)` atomics and the Linux futex syscall.
//!
//! # Building Blocks
//!
//! ```text
//! ShmSegment   shm_open/mmap wrapper (named or anonymous)
//! ShmLock      futex mutex, lock word = holder pid (dead holders are taken over)
//! ShmCondvar   sequence counter + futex (prepare -> check -> sleep)
//! process      kill(pid, 0) liveness check
//! ```
//!
//! # Wakeup Discipline
//!
//! Every waiter follows the same three steps:
//! 1. `prepare_to_sleep()` snapshots the condvar sequence
//! 2. the condition is re-checked under the table lock
//! 3. `sleep(ticket, timeout)` blocks only if nobody signalled since step 1
//!
//! A signal that lands between steps 1 and 3 bumps the sequence, so the futex
//! wait returns immediately and no wakeup is lost.

mod condvar;
mod futex;
mod lock;
pub mod process;
mod segment;

pub use condvar::{ShmCondvar, SleepTicket};
pub use futex::{futex_wait, futex_wake, futex_wake_all, futex_wake_one};
pub use lock::{ShmLock, ShmLockGuard};
pub use segment::ShmSegment;

use std::fmt;
use std::io;

/// Errors that can occur while mapping or initializing shared memory
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Invalid segment name
    InvalidName(String),

    /// Segment not found
    NotFound(String),

    /// Existing segment has a different size than expected
    SizeMismatch { expected: usize, actual: usize },

    /// Another process started initializing the segment and never finished
    InitTimeout(String),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::SizeMismatch { expected, actual } => write!(
                f,
                "Segment size mismatch: expected {expected} bytes, found {actual}"
            ),
            Self::InitTimeout(name) => {
                write!(f, "Timed out waiting for segment {name} to be initialized")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}
