// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pool Metrics
//!
//! Atomic counters describing what the pool did. All counters are
//! process-local (they live in the host process, not in the slot table).
//!
//! # Tracked Metrics
//!
//! - `requests`: calls to the interception point
//! - `proceeded` / `aborted`: final verdicts
//! - `skipped`: skip-list or mode-off short circuits on the client side
//! - `worker_bypassed`: requests the worker accepted without running
//!   procedures
//! - `policy_rejections`: requests the worker rejected because `require`
//!   mode found no usable catalog or procedure list
//! - `slot_reclaims`: slots taken back from dead owners
//! - `procedure_errors`: procedures that raised or panicked
//! - `worker_restarts`: crashed workers respawned
//! - `timeouts`: bounded waits that expired

use std::sync::atomic::{AtomicU64, Ordering};

/// Pool metrics with atomic counters.
///
/// All counters use `Relaxed` ordering; values are eventually consistent.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub requests: AtomicU64,
    pub proceeded: AtomicU64,
    pub aborted: AtomicU64,
    pub skipped: AtomicU64,
    pub worker_bypassed: AtomicU64,
    pub policy_rejections: AtomicU64,
    pub slot_reclaims: AtomicU64,
    pub procedure_errors: AtomicU64,
    pub worker_restarts: AtomicU64,
    pub timeouts: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        #[inline]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[inline]
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl PoolMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            proceeded: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            worker_bypassed: AtomicU64::new(0),
            policy_rejections: AtomicU64::new(0),
            slot_reclaims: AtomicU64::new(0),
            procedure_errors: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    counter!(inc_requests, requests, requests);
    counter!(inc_proceeded, proceeded, proceeded);
    counter!(inc_aborted, aborted, aborted);
    counter!(inc_skipped, skipped, skipped);
    counter!(inc_worker_bypassed, worker_bypassed, worker_bypassed);
    counter!(inc_policy_rejections, policy_rejections, policy_rejections);
    counter!(inc_slot_reclaims, slot_reclaims, slot_reclaims);
    counter!(inc_procedure_errors, procedure_errors, procedure_errors);
    counter!(inc_worker_restarts, worker_restarts, worker_restarts);
    counter!(inc_timeouts, timeouts, timeouts);

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.proceeded,
            &self.aborted,
            &self.skipped,
            &self.worker_bypassed,
            &self.policy_rejections,
            &self.slot_reclaims,
            &self.procedure_errors,
            &self.worker_restarts,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests(),
            proceeded: self.proceeded(),
            aborted: self.aborted(),
            skipped: self.skipped(),
            worker_bypassed: self.worker_bypassed(),
            policy_rejections: self.policy_rejections(),
            slot_reclaims: self.slot_reclaims(),
            procedure_errors: self.procedure_errors(),
            worker_restarts: self.worker_restarts(),
            timeouts: self.timeouts(),
        }
    }
}

/// Point-in-time snapshot of pool metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub proceeded: u64,
    pub aborted: u64,
    pub skipped: u64,
    pub worker_bypassed: u64,
    pub policy_rejections: u64,
    pub slot_reclaims: u64,
    pub procedure_errors: u64,
    pub worker_restarts: u64,
    pub timeouts: u64,
}

impl MetricsSnapshot {
    /// Share of requests that never reached a worker.
    #[must_use]
    pub fn skip_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.skipped as f64 / self.requests as f64
        }
    }
}
