// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connecting-process side of the slot protocol.
//!
//! # Protocol
//!
//! ```text
//! claim:   lock; reclaim if owner dead; if available && done -> signal worker,
//!          write request, owner = me, generation += 1, available = false,
//!          done = false; unlock
//!          else unlock, sleep on available_cv, retry
//! await:   lock; if done -> read result, available = true; unlock,
//!          broadcast available_cv
//!          else unlock, sleep on client_cv, retry
//! ```
//!
//! Every sleep follows prepare -> check under lock -> sleep, and is timed at
//! the liveness interval so the dead-owner check runs even without a signal.
//!
//! The worker is signalled before the request is written, within the same
//! lock hold. A worker woken early blocks on the lock and then sees the
//! finished request; a client dying mid-write leaves `done_processing` set,
//! so the worker finds nothing and goes back to sleep.

use crate::error::Verdict;
use crate::metrics::PoolMetrics;
use crate::shm::{process, ShmCondvar, SleepTicket};
use crate::table::{ConnectionInfo, SlotTable};
use std::fmt;
use std::time::{Duration, Instant};

/// Message returned when no slot could be claimed in time
pub const CLAIM_TIMEOUT_MSG: &str = "timed out waiting for an authentication slot";

/// Message returned when the worker did not answer in time
pub const WORKER_TIMEOUT_MSG: &str = "timed out waiting for the authentication worker";

/// A bounded wait expired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeout;

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("wait timed out")
    }
}

impl std::error::Error for Timeout {}

/// Proof of a published request; redeem with [`Client::await_verdict`].
#[derive(Debug)]
#[must_use = "a published request must be awaited or abandoned"]
pub struct Ticket {
    slot: usize,
}

impl Ticket {
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Client handle for one process.
pub struct Client<'a> {
    table: &'a SlotTable,
    metrics: &'a PoolMetrics,
    pid: u32,
    slot: usize,
    liveness_interval: Duration,
}

impl<'a> Client<'a> {
    /// Client for the calling process.
    pub fn new(table: &'a SlotTable, metrics: &'a PoolMetrics, liveness_interval: Duration) -> Self {
        Self::for_pid(table, metrics, liveness_interval, process::current_pid())
    }

    /// Client acting on behalf of process `pid`.
    ///
    /// Used by hosts that authenticate connections from a dispatcher
    /// process; ownership and slot choice follow `pid`.
    pub fn for_pid(table: &'a SlotTable, metrics: &'a PoolMetrics, liveness_interval: Duration, pid: u32) -> Self {
        Self::for_connection(table, metrics, liveness_interval, pid, u64::from(pid))
    }

    /// Client for one of several connections served by process `pid`.
    ///
    /// The slot follows `key`, so connections multiplexed in one process
    /// spread over the table instead of queueing on the pid's slot.
    /// Ownership still follows `pid`.
    pub fn for_connection(
        table: &'a SlotTable,
        metrics: &'a PoolMetrics,
        liveness_interval: Duration,
        pid: u32,
        key: u64,
    ) -> Self {
        Self {
            table,
            metrics,
            pid,
            slot: table.slot_for_key(key),
            liveness_interval,
        }
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Publish a request and wait for its verdict.
    ///
    /// With a `timeout`, expiry is reported as an `Abort` and an already
    /// published request is abandoned.
    pub fn round_trip(&self, conn: &ConnectionInfo, status: i32, timeout: Option<Duration>) -> Verdict {
        let deadline = timeout.map(|t| Instant::now() + t);

        let ticket = match self.claim_and_publish(conn, status, deadline) {
            Ok(ticket) => ticket,
            Err(Timeout) => {
                self.metrics.inc_timeouts();
                log::warn!("[CLIENT] No free slot {} within the request timeout", self.slot);
                return Verdict::abort(CLAIM_TIMEOUT_MSG);
            }
        };

        match self.await_verdict(&ticket, deadline) {
            Ok(verdict) => verdict,
            Err(Timeout) => {
                self.metrics.inc_timeouts();
                log::warn!("[CLIENT] Worker did not answer slot {} in time", self.slot);
                self.abandon(ticket);
                Verdict::abort(WORKER_TIMEOUT_MSG)
            }
        }
    }

    /// Claim the slot and publish the request.
    pub fn claim_and_publish(
        &self,
        conn: &ConnectionInfo,
        status: i32,
        deadline: Option<Instant>,
    ) -> Result<Ticket, Timeout> {
        let available_cv = self.table.available_cv(self.slot);
        let worker_cv = self.table.worker_cv(self.table.worker_for_slot(self.slot));

        loop {
            let ticket = available_cv.prepare_to_sleep();
            {
                let mut guard = self.table.lock();
                let data = guard.slot_mut(self.slot);

                if !data.available && !process::is_alive(data.owner_pid) {
                    log::warn!(
                        "[CLIENT] Reclaiming slot {} from dead process {}",
                        self.slot,
                        data.owner_pid
                    );
                    data.available = true;
                    self.metrics.inc_slot_reclaims();
                }

                if data.available && data.done_processing {
                    worker_cv.signal();

                    data.port.store(conn);
                    data.status = status;
                    data.owner_pid = self.pid;
                    data.generation = data.generation.wrapping_add(1);
                    data.set_result(None);
                    data.available = false;
                    data.done_processing = false;
                    return Ok(Ticket { slot: self.slot });
                }
            }
            self.sleep(available_cv, ticket, deadline)?;
        }
    }

    /// Wait for the worker's verdict and release the slot.
    pub fn await_verdict(&self, ticket: &Ticket, deadline: Option<Instant>) -> Result<Verdict, Timeout> {
        let client_cv = self.table.client_cv(ticket.slot);

        loop {
            let sleep_ticket = client_cv.prepare_to_sleep();
            let result = {
                let mut guard = self.table.lock();
                let data = guard.slot_mut(ticket.slot);
                if data.done_processing {
                    let result = data.result();
                    data.available = true;
                    Some(result)
                } else {
                    None
                }
            };

            if let Some(result) = result {
                self.table.available_cv(ticket.slot).broadcast();
                return Ok(Verdict::from(result));
            }
            self.sleep(client_cv, sleep_ticket, deadline)?;
        }
    }

    /// Give up on a published request.
    ///
    /// Ownership is released; the next claimer still waits for the worker
    /// to finish before writing, and is woken by the worker's publish.
    pub fn abandon(&self, ticket: Ticket) {
        {
            let mut guard = self.table.lock();
            let data = guard.slot_mut(ticket.slot);
            if data.owner_pid == self.pid {
                data.available = true;
            }
        }
        self.table.available_cv(ticket.slot).broadcast();
    }

    fn sleep(&self, cv: &ShmCondvar, ticket: SleepTicket, deadline: Option<Instant>) -> Result<(), Timeout> {
        let wait = match deadline {
            None => self.liveness_interval,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Timeout);
                }
                remaining.min(self.liveness_interval)
            }
        };
        cv.sleep(ticket, Some(wait));
        Ok(())
    }
}
