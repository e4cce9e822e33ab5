// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker side of the slot protocol.
//!
//! # State Machine
//!
//! ```text
//! WaitingForWork --(pending slot found)--> CopyingRequest
//! CopyingRequest --(request copied, lock released)--> Executing
//! Executing --(verdict decided)--> PublishingResult
//! PublishingResult --(client signalled)--> WaitingForWork
//! ```
//!
//! The table lock is held only while scanning, copying and publishing, never
//! while procedures run. A verdict is published only if the slot still holds
//! the request that was copied: same generation, not yet answered. Anything
//! else means the request was answered elsewhere or the slot moved on, and
//! the verdict is dropped. Every publish signals the client condvar and also
//! broadcasts the availability condvar, which wakes claimers that reclaimed
//! the slot from a dead owner and are waiting for this worker to let go.
//!
//! # Scan Order
//!
//! Each scan starts one position further along the worker's own slots, so a
//! busy slot cannot keep the others waiting.

use crate::bypass::{self, CatalogCheck, Precheck};
use crate::config::{FeatureMode, SettingsHandle};
use crate::metrics::PoolMetrics;
use crate::procedure::{
    run_isolated, single_line, BackendError, Connector, Feature, HookArgs, Outcome, Session, Transaction,
};
use crate::table::{ConnectionInfo, SlotTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request copied out of the table
struct PendingRequest {
    slot: usize,
    generation: u32,
    port: ConnectionInfo,
    status: i32,
}

/// One member of the pool.
pub struct Worker<C: Connector> {
    index: usize,
    slots: Vec<usize>,
    scan_offset: usize,
    table: Arc<SlotTable>,
    connector: Arc<C>,
    settings: SettingsHandle,
    metrics: Arc<PoolMetrics>,
    session: Option<C::Session>,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        index: usize,
        table: Arc<SlotTable>,
        connector: Arc<C>,
        settings: SettingsHandle,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        let slots = table.slots_of_worker(index).collect();
        Self {
            index,
            slots,
            scan_offset: 0,
            table,
            connector,
            settings,
            metrics,
            session: None,
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Serve requests until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        log::info!(
            "[WORKER] Worker {} started, serving {} slots",
            self.index,
            self.slots.len()
        );
        while !stop.load(Ordering::Acquire) {
            let wait = self.settings.current().clientauth.liveness_interval;
            self.poll_once(Some(wait));
        }
        log::info!("[WORKER] Worker {} stopped", self.index);
    }

    /// Serve one pending request, or sleep up to `wait` for one.
    ///
    /// Returns `true` if a request was served.
    pub fn poll_once(&mut self, wait: Option<Duration>) -> bool {
        let table = Arc::clone(&self.table);
        let cv = table.worker_cv(self.index);
        let ticket = cv.prepare_to_sleep();

        match self.take_pending() {
            Some(request) => {
                let rejection = self.decide(&request).map(|msg| single_line(&msg));
                self.publish(&request, rejection.as_deref());
                true
            }
            None => {
                cv.sleep(ticket, wait);
                false
            }
        }
    }

    /// Scan this worker's slots and copy out the first pending request.
    fn take_pending(&mut self) -> Option<PendingRequest> {
        let count = self.slots.len();
        let start = self.scan_offset % count;
        self.scan_offset = self.scan_offset.wrapping_add(1);

        let guard = self.table.lock();
        (0..count)
            .map(|i| self.slots[(start + i) % count])
            .find(|&slot| !guard.slot(slot).done_processing)
            .map(|slot| {
                let data = guard.slot(slot);
                PendingRequest {
                    slot,
                    generation: data.generation,
                    port: data.port.load(),
                    status: data.status,
                }
            })
    }

    fn decide(&mut self, request: &PendingRequest) -> Option<String> {
        let settings = self.settings.current();

        // Settings may have been reloaded since the client checked
        match bypass::precheck(&settings.clientauth, &request.port) {
            Precheck::Skip(_) | Precheck::Disabled => {
                self.metrics.inc_worker_bypassed();
                return None;
            }
            Precheck::Queue => {}
        }

        let database = &settings.clientauth.database;
        let mut session = match self.session.take() {
            Some(session) => session,
            None => match self.connector.connect(database) {
                Ok(session) => {
                    log::debug!("[WORKER] Worker {} connected to \"{}\"", self.index, database);
                    session
                }
                Err(err) => {
                    log::error!(
                        "[WORKER] Worker {} cannot connect to \"{}\": {}",
                        self.index,
                        database,
                        err
                    );
                    return Some(format!(
                        "\"{}\" feature was not able to connect to the database \"{}\": {}",
                        Feature::ClientAuth,
                        database,
                        err
                    ));
                }
            },
        };

        match execute(&mut session, settings.clientauth.mode, request, &self.metrics) {
            Ok(rejection) => {
                self.session = Some(session);
                rejection
            }
            Err(err) => {
                // Reconnect on the next request
                log::warn!(
                    "[WORKER] Worker {} dropping its session after error: {}",
                    self.index,
                    err
                );
                Some(err.message().to_string())
            }
        }
    }

    fn publish(&self, request: &PendingRequest, rejection: Option<&str>) {
        let slot = request.slot;
        {
            let mut guard = self.table.lock();
            let data = guard.slot_mut(slot);
            if data.generation != request.generation || data.done_processing {
                log::debug!(
                    "[WORKER] Worker {} dropping stale result for slot {}",
                    self.index,
                    slot
                );
                return;
            }
            data.set_result(rejection);
            data.done_processing = true;
        }
        self.table.client_cv(slot).signal();
        self.table.available_cv(slot).broadcast();
    }
}

/// Run the catalog check and the procedures in one transaction.
fn execute<S: Session + ?Sized>(
    session: &mut S,
    mode: FeatureMode,
    request: &PendingRequest,
    metrics: &PoolMetrics,
) -> Result<Option<String>, BackendError> {
    let mut txn = Transaction::begin(session)?;

    let rejection = match bypass::evaluate(txn.session(), Feature::ClientAuth, mode)? {
        CatalogCheck::Accept(_) => {
            metrics.inc_worker_bypassed();
            None
        }
        CatalogCheck::Reject(failure) => {
            metrics.inc_policy_rejections();
            Some(failure.message(Feature::ClientAuth))
        }
        CatalogCheck::Run(procedures) => {
            let args = HookArgs::ClientAuth {
                port: &request.port,
                status: request.status,
            };
            let outcome = run_isolated(txn.session(), &procedures, &args)?;
            if let Outcome::Raised(err) = &outcome {
                metrics.inc_procedure_errors();
                log::debug!(
                    "[WORKER] Procedure raised for user \"{}\": {}",
                    request.port.user_name,
                    err
                );
            }
            outcome.into_rejection()
        }
    };

    txn.commit()?;
    Ok(rejection)
}
