// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper for inter-process synchronization.
//!
//! # CRITICAL: SHARED vs PRIVATE
//!
//! The slot table lives in memory mapped by unrelated processes, so this
//! module uses `FUTEX_WAIT` and `FUTEX_WAKE`, never the `_PRIVATE` variants.
//! A private futex only matches waiters of the calling process and would
//! silently fail to wake a worker sleeping in another process.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Futex operation codes (SHARED, not PRIVATE!)
#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0; // NOT 128 (FUTEX_WAIT_PRIVATE)
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1; // NOT 129 (FUTEX_WAKE_PRIVATE)

/// How a futex wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutexWait {
    /// Woken by `futex_wake` (or spuriously)
    Woken,
    /// The word no longer held the expected value when the wait started
    ValueChanged,
    /// The timeout elapsed
    TimedOut,
    /// Interrupted by a signal handler
    Interrupted,
}

/// Wait on a futex until woken, the value differs from `expected`, or the
/// timeout expires.
///
/// Callers must always re-check their condition afterwards: every outcome,
/// including [`FutexWait::Woken`], is only a hint.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });

    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the call, so the
    // kernel reads a valid, aligned u32. FUTEX_WAIT (0) keys on the physical
    // page, which is what makes cross-process wakeups work.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(), // uaddr2 (unused)
            0i32,               // val3 (unused)
        )
    };

    if ret == 0 {
        return FutexWait::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => FutexWait::ValueChanged,
        Some(libc::ETIMEDOUT) => FutexWait::TimedOut,
        Some(libc::EINTR) => FutexWait::Interrupted,
        _ => FutexWait::Woken,
    }
}

/// Wake up to `count` threads waiting on a futex.
///
/// Returns the number of waiters woken, or -1 on error.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: addr is a live reference; FUTEX_WAKE (1) only reads the address
    // to locate the wait queue.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(), // timeout (unused for wake)
            ptr::null::<u32>(),            // uaddr2 (unused)
            0i32,                          // val3 (unused)
        ) as i32
    }
}

// Non-Linux fallback: bounded sleep, callers re-check their condition anyway.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    use std::sync::atomic::Ordering;

    if addr.load(Ordering::Acquire) != expected {
        return FutexWait::ValueChanged;
    }
    let sleep_time = timeout.unwrap_or(Duration::from_millis(1));
    std::thread::sleep(sleep_time.min(Duration::from_millis(1)));
    FutexWait::Woken
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

/// Wake a single waiter
#[inline]
pub fn futex_wake_one(addr: &AtomicU32) -> i32 {
    futex_wake(addr, 1)
}

/// Wake all waiters
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}
