// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The shared slot table.
//!
//! # Memory Layout
//!
//! ```text
//! Offset        Content
//! 0             TableHeader (64 bytes): magic, version, init state, counts
//! 64            ShmLock     (64 bytes): table-wide lock
//! 128           ShmCondvar x MAX_SLOTS: one per worker
//! ...           SlotCell   x MAX_SLOTS
//! ```
//!
//! Arrays are sized for [`MAX_SLOTS`] whatever the configured counts, so the
//! segment size never depends on settings and a stale segment from a run with
//! different counts is caught by the header check rather than by a size
//! mismatch.
//!
//! # Sharding
//!
//! - slot of a client: `pid % slot_count`
//! - worker of a slot: `slot % worker_count`
//!
//! Both sides compute these independently, hence the layout check on attach.
//!
//! # Initialization
//!
//! The header `state` word goes `EMPTY -> BUSY -> READY`. The attacher that
//! wins the `EMPTY -> BUSY` exchange fills in the slots and publishes `READY`
//! with a futex wake; everyone else waits (bounded) for `READY`.

pub mod slot;

use crate::error::{AuthPoolError, Result};
use crate::shm::{futex_wait, futex_wake_all, process, ShmCondvar, ShmError, ShmLock, ShmLockGuard, ShmSegment};
use slot::{SlotCell, SlotData};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub use slot::{ConnectionInfo, FixedString, SharedPort, ERROR_MSG_CAPACITY, PORT_FIELD_CAPACITY};

/// Capacity of the table, and upper bound of the slot setting
pub const MAX_SLOTS: usize = 256;

const INIT_EMPTY: u32 = 0;
const INIT_BUSY: u32 = 1;
const INIT_READY: u32 = 2;

/// How long an attacher waits for another process to finish initialization
const INIT_WAIT: Duration = Duration::from_secs(5);

/// Slot and worker counts agreed on by every attacher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableLayout {
    pub slots: usize,
    pub workers: usize,
}

impl TableLayout {
    /// Validate counts: `1 <= workers <= slots <= MAX_SLOTS`.
    pub fn new(slots: usize, workers: usize) -> Result<Self> {
        if slots == 0 || slots > MAX_SLOTS {
            return Err(crate::config::ConfigError::OutOfRange {
                setting: "slots",
                value: slots as u64,
                min: 1,
                max: MAX_SLOTS as u64,
            }
            .into());
        }
        if workers == 0 || workers > slots {
            return Err(crate::config::ConfigError::OutOfRange {
                setting: "workers",
                value: workers as u64,
                min: 1,
                max: slots as u64,
            }
            .into());
        }
        Ok(Self { slots, workers })
    }
}

#[repr(C, align(64))]
struct TableHeader {
    magic: AtomicU32,
    version: AtomicU32,
    state: AtomicU32,
    slot_count: AtomicU32,
    worker_count: AtomicU32,
    /// Pid of the process running the worker pool, 0 if none
    pool_owner: AtomicU32,
    _pad: [u8; 40],
}

impl TableHeader {
    /// "APLT"
    const MAGIC: u32 = 0x4150_4C54;
    const VERSION: u32 = 2;
}

#[repr(C)]
struct SharedState {
    header: TableHeader,
    lock: ShmLock,
    worker_cvs: [ShmCondvar; MAX_SLOTS],
    slots: [SlotCell; MAX_SLOTS],
}

/// Point-in-time copy of one slot, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub index: usize,
    pub worker: usize,
    pub owner_pid: u32,
    pub owner_alive: bool,
    pub available: bool,
    pub done_processing: bool,
    pub generation: u32,
    pub error: bool,
    pub error_msg: String,
    pub user_name: String,
    pub database_name: String,
    pub status: i32,
}

impl SlotSnapshot {
    /// Never claimed, or claimed and fully consumed
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.available && self.done_processing
    }
}

/// Handle on a mapped slot table.
pub struct SlotTable {
    segment: ShmSegment,
    layout: TableLayout,
}

impl SlotTable {
    /// Bytes needed for the table mapping
    #[must_use]
    pub const fn segment_size() -> usize {
        size_of::<SharedState>()
    }

    /// Attach to the table named `name`, initializing it if this is the first
    /// attacher. An empty name maps an anonymous table.
    pub fn attach(name: &str, layout: TableLayout) -> Result<Self> {
        if name.is_empty() {
            Self::anonymous(layout)
        } else {
            Self::open_or_create(name, layout)
        }
    }

    /// Map (creating if needed) the named table segment.
    pub fn open_or_create(name: &str, layout: TableLayout) -> Result<Self> {
        let (segment, created) = ShmSegment::open_or_create(name, Self::segment_size())?;
        if created {
            log::debug!("[SLOTS] Created table segment {} ({} bytes)", name, segment.size());
        }
        Self::init_or_wait(segment, layout)
    }

    /// Map a fresh anonymous table, shared with threads and forked children.
    pub fn anonymous(layout: TableLayout) -> Result<Self> {
        let segment = ShmSegment::anonymous(Self::segment_size())?;
        Self::init_or_wait(segment, layout)
    }

    /// Attach to an already initialized table, taking its layout from the
    /// header. Used by diagnostic tools.
    pub fn open_existing(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name, Self::segment_size())?;
        // SAFETY: the mapping is exactly segment_size() bytes
        let state = unsafe { &*(segment.as_ptr() as *const SharedState) };
        wait_ready(&state.header, name)?;
        check_identity(&state.header)?;
        let layout = TableLayout::new(
            state.header.slot_count.load(Ordering::Acquire) as usize,
            state.header.worker_count.load(Ordering::Acquire) as usize,
        )?;
        Ok(Self { segment, layout })
    }

    /// Remove a named table from the shm namespace.
    pub fn unlink(name: &str) -> Result<()> {
        ShmSegment::unlink(name)?;
        Ok(())
    }

    fn init_or_wait(segment: ShmSegment, layout: TableLayout) -> Result<Self> {
        // SAFETY: the mapping is page aligned, segment_size() bytes long, and
        // an all-zero SharedState is valid (atomics, bools, integers).
        let state = unsafe { &*(segment.as_ptr() as *const SharedState) };
        let header = &state.header;

        match header
            .state
            .compare_exchange(INIT_EMPTY, INIT_BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                for (index, cell) in state.slots.iter().enumerate().take(layout.slots) {
                    // SAFETY: nobody reads slot data before READY is published
                    let data = unsafe { &mut *cell.data.get() };
                    data.available = true;
                    data.done_processing = true;
                    data.error = false;
                    data.owner_pid = 0;
                    data.generation = 0;
                    data.worker = (index % layout.workers) as u32;
                }
                header.pool_owner.store(0, Ordering::Relaxed);
                header.magic.store(TableHeader::MAGIC, Ordering::Relaxed);
                header.version.store(TableHeader::VERSION, Ordering::Relaxed);
                header.slot_count.store(layout.slots as u32, Ordering::Relaxed);
                header.worker_count.store(layout.workers as u32, Ordering::Relaxed);
                header.state.store(INIT_READY, Ordering::Release);
                futex_wake_all(&header.state);
                log::debug!(
                    "[SLOTS] Initialized table: {} slots, {} workers",
                    layout.slots,
                    layout.workers
                );
            }
            Err(_) => wait_ready(header, segment.name())?,
        }

        check_identity(header)?;
        let found = TableLayout {
            slots: header.slot_count.load(Ordering::Acquire) as usize,
            workers: header.worker_count.load(Ordering::Acquire) as usize,
        };
        if found != layout {
            return Err(AuthPoolError::LayoutMismatch {
                expected: layout,
                found,
            });
        }

        Ok(Self { segment, layout })
    }

    fn state(&self) -> &SharedState {
        // SAFETY: validated on construction; the mapping lives as long as self
        unsafe { &*(self.segment.as_ptr() as *const SharedState) }
    }

    #[must_use]
    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    /// Segment name, empty for an anonymous table
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Slot used by the process `pid`
    #[inline]
    #[must_use]
    pub fn slot_for_pid(&self, pid: u32) -> usize {
        self.slot_for_key(u64::from(pid))
    }

    /// Slot used by the connection keyed `key`
    #[inline]
    #[must_use]
    pub fn slot_for_key(&self, key: u64) -> usize {
        (key % self.layout.slots as u64) as usize
    }

    /// Worker serving `slot`
    #[inline]
    #[must_use]
    pub fn worker_for_slot(&self, slot: usize) -> usize {
        slot % self.layout.workers
    }

    /// Slots served by `worker`, in index order
    pub fn slots_of_worker(&self, worker: usize) -> impl Iterator<Item = usize> {
        (worker..self.layout.slots).step_by(self.layout.workers)
    }

    /// Take the table-wide lock.
    pub fn lock(&self) -> TableGuard<'_> {
        let state = self.state();
        TableGuard {
            _guard: state.lock.lock(),
            state,
            slots: self.layout.slots,
        }
    }

    /// Pid holding the table lock, 0 if free
    #[must_use]
    pub fn lock_holder(&self) -> u32 {
        self.state().lock.holder()
    }

    /// Pid of the process running this table's worker pool, 0 if none
    #[must_use]
    pub fn pool_owner(&self) -> u32 {
        self.state().header.pool_owner.load(Ordering::Acquire)
    }

    /// Record the calling process as the pool owner.
    ///
    /// Fails with the current owner's pid while that process is alive. An
    /// owner that died without releasing is replaced.
    pub fn claim_pool(&self) -> std::result::Result<(), u32> {
        let me = process::current_pid();
        let owner = &self.state().header.pool_owner;
        loop {
            let current = owner.load(Ordering::Acquire);
            if current != 0 && process::is_alive(current) {
                return Err(current);
            }
            if owner
                .compare_exchange(current, me, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if current != 0 {
                    log::warn!("[SLOTS] Took over pool ownership from dead process {}", current);
                }
                return Ok(());
            }
        }
    }

    /// Give up pool ownership if the calling process holds it.
    pub fn release_pool(&self) {
        let me = process::current_pid();
        let _ = self.state().header.pool_owner.compare_exchange(
            me,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Condvar the client of `slot` sleeps on
    #[must_use]
    pub fn client_cv(&self, slot: usize) -> &ShmCondvar {
        &self.state().slots[slot].client_cv
    }

    /// Condvar signalled when `slot` may have become claimable
    #[must_use]
    pub fn available_cv(&self, slot: usize) -> &ShmCondvar {
        &self.state().slots[slot].available_cv
    }

    /// Condvar `worker` sleeps on
    #[must_use]
    pub fn worker_cv(&self, worker: usize) -> &ShmCondvar {
        &self.state().worker_cvs[worker]
    }

    /// Copy every slot under the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let guard = self.lock();
        (0..self.layout.slots)
            .map(|index| {
                let data = guard.slot(index);
                SlotSnapshot {
                    index,
                    worker: data.worker as usize,
                    owner_pid: data.owner_pid,
                    owner_alive: process::is_alive(data.owner_pid),
                    available: data.available,
                    done_processing: data.done_processing,
                    generation: data.generation,
                    error: data.error,
                    error_msg: data.error_msg.as_str().to_string(),
                    user_name: data.port.user_name().to_string(),
                    database_name: data.port.database_name().to_string(),
                    status: data.status,
                }
            })
            .collect()
    }
}

fn wait_ready(header: &TableHeader, name: &str) -> Result<()> {
    let deadline = Instant::now() + INIT_WAIT;
    loop {
        let state = header.state.load(Ordering::Acquire);
        if state == INIT_READY {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ShmError::InitTimeout(name.to_string()).into());
        }
        futex_wait(&header.state, state, Some(deadline - now));
    }
}

fn check_identity(header: &TableHeader) -> Result<()> {
    let magic = header.magic.load(Ordering::Acquire);
    let version = header.version.load(Ordering::Acquire);
    if magic != TableHeader::MAGIC || version != TableHeader::VERSION {
        return Err(AuthPoolError::IncompatibleTable(format!(
            "magic {magic:#010x} version {version}"
        )));
    }
    Ok(())
}

/// Holds the table lock; slot data is reachable only through it.
pub struct TableGuard<'a> {
    _guard: ShmLockGuard<'a>,
    state: &'a SharedState,
    slots: usize,
}

impl TableGuard<'_> {
    /// Read `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the configured slot count.
    #[must_use]
    pub fn slot(&self, index: usize) -> &SlotData {
        assert!(index < self.slots, "slot index {index} out of range");
        // SAFETY: the table lock is held for the guard's lifetime
        unsafe { &*self.state.slots[index].data.get() }
    }

    /// Mutate `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the configured slot count.
    pub fn slot_mut(&mut self, index: usize) -> &mut SlotData {
        assert!(index < self.slots, "slot index {index} out of range");
        // SAFETY: the table lock is held, and &mut self prevents a second
        // reference through this guard
        unsafe { &mut *self.state.slots[index].data.get() }
    }
}
