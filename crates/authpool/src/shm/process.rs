// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process identity and liveness checks.
//!
//! Ownership recorded in shared memory is a bare pid. A pid whose process no
//! longer exists marks state abandoned by a crash, which the slot protocol
//! and the table lock both reclaim.
//!
//! Note: a zombie still answers `kill(pid, 0)`. The host process manager is
//! expected to reap its children, as a database postmaster does.

use std::io;

/// Pid of the calling process.
#[inline]
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Check whether a process with the given pid exists.
///
/// Pid 0 is the "never owned" marker and is never alive.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    // SAFETY: signal 0 performs only the existence and permission check; no
    // signal is delivered. pid is a positive value, so this never targets a
    // process group.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }

    // EPERM: the process exists but belongs to someone else
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
