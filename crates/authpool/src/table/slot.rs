// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request slot structures stored in the shared table.
//!
//! Everything in this file is `repr(C)` plain data with fixed capacity, so the
//! same bytes mean the same thing in every process that maps the table.
//! Strings are [`FixedString`]s truncated on write at a UTF-8 boundary.
//!
//! # Slot Layout
//!
//! ```text
//! SlotCell (cache-line aligned)
//! +-------------------------------------------------+
//! | client_cv     ShmCondvar  wakes the waiting client |
//! | available_cv  ShmCondvar  wakes slot claimers       |
//! | data          SlotData    guarded by the table lock |
//! +-------------------------------------------------+
//! ```
//!
//! The worker condvar is not stored here: `SlotData::worker` holds the index
//! of the owning worker, whose condvar lives in the table header area.

use crate::shm::ShmCondvar;
use std::cell::UnsafeCell;
use std::fmt;

/// Maximum bytes of any connection descriptor string
pub const PORT_FIELD_CAPACITY: usize = 255;

/// Maximum bytes of a rejection message
pub const ERROR_MSG_CAPACITY: usize = 255;

/// Fixed-capacity UTF-8 string, safe to place in shared memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FixedString<const N: usize> {
    len: u16,
    bytes: [u8; N],
}

impl<const N: usize> FixedString<N> {
    /// Empty string (all-zero, matches a fresh mapping)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            bytes: [0u8; N],
        }
    }

    /// Build from `s`, truncating to capacity.
    #[must_use]
    pub fn truncating(s: &str) -> Self {
        let mut out = Self::new();
        out.set(s);
        out
    }

    /// Overwrite with `s`, truncating at the last char boundary that fits.
    ///
    /// Returns `true` if the value was truncated.
    pub fn set(&mut self, s: &str) -> bool {
        let mut end = s.len().min(N).min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        self.len = end as u16;
        end < s.len()
    }

    /// Empty the string
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// View as `&str`.
    ///
    /// Bytes left behind by a writer that crashed mid-copy are cut at the
    /// first invalid sequence instead of being trusted.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let len = (self.len as usize).min(N);
        match std::str::from_utf8(&self.bytes[..len]) {
            Ok(s) => s,
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: from_utf8 just validated bytes[..valid]
                unsafe { std::str::from_utf8_unchecked(&self.bytes[..valid]) }
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn capacity() -> usize {
        N
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// Descriptor of a connecting client, as handed to registered procedures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Client asked for a non-blocking connection
    pub noblock: bool,
    /// Remote address as text
    pub remote_host: String,
    /// Reverse-resolved host name, empty if unknown
    pub remote_hostname: String,
    /// Resolution state of `remote_hostname` (host-defined codes)
    pub remote_hostname_resolv: i32,
    /// Resolver error code when resolution failed
    pub remote_hostname_errcode: i32,
    pub database_name: String,
    pub user_name: String,
}

impl ConnectionInfo {
    /// Descriptor for `user` connecting to `database` with no address info.
    #[must_use]
    pub fn new(user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            user_name: user.into(),
            database_name: database.into(),
            ..Self::default()
        }
    }

    /// Set the remote address.
    #[must_use]
    pub fn with_remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = host.into();
        self
    }

    /// Set the resolved host name and its status codes.
    #[must_use]
    pub fn with_remote_hostname(mut self, hostname: impl Into<String>, resolv: i32, errcode: i32) -> Self {
        self.remote_hostname = hostname.into();
        self.remote_hostname_resolv = resolv;
        self.remote_hostname_errcode = errcode;
        self
    }

    /// Render as a composite literal:
    /// `(noblock,"host","hostname",resolv,errcode,"database","user")`.
    ///
    /// Text fields are always double-quoted, with `"` and `\` doubled.
    #[must_use]
    pub fn to_record_literal(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push('(');
        out.push(if self.noblock { 't' } else { 'f' });
        out.push(',');
        push_quoted(&mut out, &self.remote_host);
        out.push(',');
        push_quoted(&mut out, &self.remote_hostname);
        out.push_str(&format!(
            ",{},{},",
            self.remote_hostname_resolv, self.remote_hostname_errcode
        ));
        push_quoted(&mut out, &self.database_name);
        out.push(',');
        push_quoted(&mut out, &self.user_name);
        out.push(')');
        out
    }
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('"');
}

/// Shared-memory form of [`ConnectionInfo`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SharedPort {
    noblock: u8,
    remote_hostname_resolv: i32,
    remote_hostname_errcode: i32,
    remote_host: FixedString<PORT_FIELD_CAPACITY>,
    remote_hostname: FixedString<PORT_FIELD_CAPACITY>,
    database_name: FixedString<PORT_FIELD_CAPACITY>,
    user_name: FixedString<PORT_FIELD_CAPACITY>,
}

impl SharedPort {
    /// Copy `info` in, truncating each string to capacity.
    pub fn store(&mut self, info: &ConnectionInfo) {
        self.noblock = u8::from(info.noblock);
        self.remote_hostname_resolv = info.remote_hostname_resolv;
        self.remote_hostname_errcode = info.remote_hostname_errcode;
        self.remote_host.set(&info.remote_host);
        self.remote_hostname.set(&info.remote_hostname);
        self.database_name.set(&info.database_name);
        self.user_name.set(&info.user_name);
    }

    /// Copy out into owned memory.
    #[must_use]
    pub fn load(&self) -> ConnectionInfo {
        ConnectionInfo {
            noblock: self.noblock != 0,
            remote_host: self.remote_host.as_str().to_string(),
            remote_hostname: self.remote_hostname.as_str().to_string(),
            remote_hostname_resolv: self.remote_hostname_resolv,
            remote_hostname_errcode: self.remote_hostname_errcode,
            database_name: self.database_name.as_str().to_string(),
            user_name: self.user_name.as_str().to_string(),
        }
    }

    #[must_use]
    pub fn user_name(&self) -> &str {
        self.user_name.as_str()
    }

    #[must_use]
    pub fn database_name(&self) -> &str {
        self.database_name.as_str()
    }
}

/// Mutable part of a slot. Only touched while holding the table lock.
#[repr(C)]
#[derive(Debug)]
pub struct SlotData {
    /// Connection being authenticated
    pub port: SharedPort,
    /// Authentication status reached so far by the host
    pub status: i32,
    /// Pid of the client that last claimed the slot, 0 if never claimed
    pub owner_pid: u32,
    /// Index of the worker serving this slot
    pub worker: u32,
    /// Bumped by every claim; a worker publishes only into the request it copied
    pub generation: u32,
    /// No client owns the slot
    pub available: bool,
    /// The worker finished and the result fields are valid
    pub done_processing: bool,
    /// The request was rejected
    pub error: bool,
    /// Rejection message
    pub error_msg: FixedString<ERROR_MSG_CAPACITY>,
}

impl SlotData {
    /// Store a verdict; an empty message means the request was accepted.
    pub fn set_result(&mut self, rejection: Option<&str>) {
        match rejection {
            Some(msg) => {
                self.error = true;
                self.error_msg.set(msg);
            }
            None => {
                self.error = false;
                self.error_msg.clear();
            }
        }
    }

    /// Read the stored verdict.
    #[must_use]
    pub fn result(&self) -> Option<String> {
        self.error.then(|| self.error_msg.as_str().to_string())
    }
}

/// One slot of the table, cache-line aligned.
#[repr(C, align(64))]
pub struct SlotCell {
    pub(crate) client_cv: ShmCondvar,
    pub(crate) available_cv: ShmCondvar,
    pub(crate) data: UnsafeCell<SlotData>,
}

// SAFETY: `data` is only accessed through a TableGuard, i.e. while holding
// the table-wide ShmLock; the condvars are atomics.
unsafe impl Sync for SlotCell {}
