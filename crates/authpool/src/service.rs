// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The authentication service owned by the host.
//!
//! # Lifecycle
//!
//! ```text
//! AuthService::start(settings, connector)
//!   mode off        -> Disabled: no table, every request proceeds
//!   pool owned by a
//!   live process    -> Attached: table mapped, no workers of our own
//!   pool too large  -> Exhausted: table mapped, requests abort
//!   otherwise       -> Running: table mapped, one supervisor thread per worker
//! AuthService::attach(settings, connector)
//!   mode off        -> Disabled
//!   otherwise       -> Attached to an existing named table
//! authenticate(conn, status)                  -> Verdict  (one connection per process)
//! authenticate_connection(id, conn, status)   -> Verdict  (many connections per process)
//! reload(settings)            -> ReloadReport
//! shutdown() / drop           -> Stopped: stop workers, release the pool,
//!                                requests abort
//! ```
//!
//! At most one live process runs the pool of a named table; its pid is
//! recorded in the table header. Every other service on the segment only
//! publishes requests.
//!
//! A supervisor runs its worker and, if the worker panics, respawns a fresh
//! one (new session, same slots) after `restart_delay`.

use crate::bypass::{self, Precheck};
use crate::client::Client;
use crate::config::{ConfigError, FeatureMode, ReloadReport, Settings, SettingsHandle};
use crate::error::{AuthPoolError, Result, Verdict};
use crate::metrics::PoolMetrics;
use crate::passcheck::{self, PasswordCheck};
use crate::procedure::{BackendError, Connector, Session};
use crate::shm::process;
use crate::table::{ConnectionInfo, SlotTable, TableLayout};
use crate::worker::Worker;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Rejection used while the pool could not be started
pub const POOL_EXHAUSTED_MSG: &str =
    "\"clientauth\" feature failed to start its background workers; consider increasing max_worker_processes or reducing other background workers";

/// Rejection used once the service has been shut down
pub const POOL_STOPPED_MSG: &str = "\"clientauth\" feature is shutting down";

/// State of the worker pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// Hook off at startup, no pool
    Disabled,
    /// Workers serving requests
    Running,
    /// Client only; another process runs the pool for this table
    Attached,
    /// Workers could not be started
    Exhausted,
    /// Shut down
    Stopped,
}

/// Dependency-injected hook service.
pub struct AuthService<C: Connector> {
    settings: SettingsHandle,
    connector: Arc<C>,
    metrics: Arc<PoolMetrics>,
    table: Option<Arc<SlotTable>>,
    state: PoolState,
    owns_pool: bool,
    stop: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    supervisors: Vec<JoinHandle<()>>,
}

impl<C: Connector> AuthService<C> {
    /// Validate settings, map the table and spawn the pool.
    ///
    /// A pool that cannot be spawned does not fail startup; requests are
    /// rejected with [`POOL_EXHAUSTED_MSG`] instead.
    ///
    /// If a live process already runs the pool for the named table, no
    /// workers are spawned and the service is [`PoolState::Attached`].
    pub fn start(settings: Settings, connector: C) -> Result<Self> {
        let mut service = Self::idle(settings, connector)?;

        let startup = service.settings.startup().clone();
        let ca = &startup.clientauth;
        if ca.mode == FeatureMode::Off {
            log::info!("[POOL] clientauth is off, not starting workers");
            return Ok(service);
        }

        let layout = TableLayout::new(ca.slots, ca.workers)?;
        let table = Arc::new(SlotTable::attach(&ca.segment, layout)?);
        service.table = Some(Arc::clone(&table));

        if let Err(owner) = table.claim_pool() {
            log::info!(
                "[POOL] Segment {} is served by process {}, attaching as client only",
                ca.segment,
                owner
            );
            service.state = PoolState::Attached;
            return Ok(service);
        }
        service.owns_pool = true;

        if ca.workers > startup.host.max_worker_processes {
            log::error!(
                "[POOL] {} workers requested but max_worker_processes is {}",
                ca.workers,
                startup.host.max_worker_processes
            );
            service.release_pool();
            service.state = PoolState::Exhausted;
            return Ok(service);
        }

        match service.spawn_supervisors(&table, ca.workers) {
            Ok(()) => {
                service.state = PoolState::Running;
                log::info!(
                    "[POOL] Started {} workers over {} slots (segment {})",
                    ca.workers,
                    ca.slots,
                    if ca.segment.is_empty() { "<anonymous>" } else { &ca.segment }
                );
            }
            Err(err) => {
                log::error!("[POOL] {}", err);
                service.stop_workers();
                service.state = PoolState::Exhausted;
            }
        }
        Ok(service)
    }

    /// Attach to the named table another process serves, without workers.
    ///
    /// The table must already exist with the configured layout. Requests go
    /// through the same precheck and slot round trip as [`start`](Self::start).
    pub fn attach(settings: Settings, connector: C) -> Result<Self> {
        let mut service = Self::idle(settings, connector)?;

        let startup = service.settings.startup().clone();
        let ca = &startup.clientauth;
        if ca.mode == FeatureMode::Off {
            log::info!("[POOL] clientauth is off, not attaching");
            return Ok(service);
        }
        if ca.segment.is_empty() {
            return Err(AuthPoolError::NoSegment);
        }

        let expected = TableLayout::new(ca.slots, ca.workers)?;
        let table = SlotTable::open_existing(&ca.segment)?;
        if table.layout() != expected {
            return Err(AuthPoolError::LayoutMismatch {
                expected,
                found: table.layout(),
            });
        }
        if table.pool_owner() == 0 {
            log::warn!("[POOL] Segment {} has no running pool yet", ca.segment);
        }

        log::info!("[POOL] Attached to segment {} as client only", ca.segment);
        service.table = Some(Arc::new(table));
        service.state = PoolState::Attached;
        Ok(service)
    }

    fn idle(settings: Settings, connector: C) -> Result<Self> {
        Ok(Self {
            settings: SettingsHandle::new(settings)?,
            connector: Arc::new(connector),
            metrics: Arc::new(PoolMetrics::new()),
            table: None,
            state: PoolState::Disabled,
            owns_pool: false,
            stop: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            supervisors: Vec::new(),
        })
    }

    fn spawn_supervisors(&mut self, table: &Arc<SlotTable>, workers: usize) -> Result<()> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        self.stop_tx = Some(stop_tx);

        for index in 0..workers {
            let ctx = SupervisorContext {
                index,
                table: Arc::clone(table),
                connector: Arc::clone(&self.connector),
                settings: self.settings.clone(),
                metrics: Arc::clone(&self.metrics),
                stop: Arc::clone(&self.stop),
                stop_rx: stop_rx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("authpool-worker-{index}"))
                .spawn(move || ctx.supervise())
                .map_err(AuthPoolError::Spawn)?;
            self.supervisors.push(handle);
        }
        Ok(())
    }

    /// Interception-point call for the calling process.
    ///
    /// The slot follows the pid, so concurrent calls from one process queue
    /// on a single slot. Hosts serving many connections per process use
    /// [`authenticate_connection`](Self::authenticate_connection).
    pub fn authenticate(&self, conn: &ConnectionInfo, status: i32) -> Verdict {
        self.authenticate_as(process::current_pid(), conn, status)
    }

    /// Interception-point call on behalf of process `pid`.
    pub fn authenticate_as(&self, pid: u32, conn: &ConnectionInfo, status: i32) -> Verdict {
        self.dispatch(pid, u64::from(pid), conn, status)
    }

    /// Interception-point call for one of many connections in this process.
    ///
    /// The slot follows `connection_id`; distinct ids spread concurrent
    /// requests over the table. The calling process owns the slot.
    pub fn authenticate_connection(&self, connection_id: u64, conn: &ConnectionInfo, status: i32) -> Verdict {
        self.dispatch(process::current_pid(), connection_id, conn, status)
    }

    fn dispatch(&self, pid: u32, key: u64, conn: &ConnectionInfo, status: i32) -> Verdict {
        self.metrics.inc_requests();
        let settings = self.settings.current();
        let ca = &settings.clientauth;

        match bypass::precheck(ca, conn) {
            Precheck::Skip(reason) => {
                log::info!("[CLIENT] Skipping clientauth: {}", reason);
                self.metrics.inc_skipped();
                self.metrics.inc_proceeded();
                return Verdict::Proceed;
            }
            Precheck::Disabled => {
                self.metrics.inc_skipped();
                self.metrics.inc_proceeded();
                return Verdict::Proceed;
            }
            Precheck::Queue => {}
        }

        let verdict = match (self.state, &self.table) {
            (PoolState::Running | PoolState::Attached, Some(table)) => {
                Client::for_connection(table, &self.metrics, ca.liveness_interval, pid, key).round_trip(
                    conn,
                    status,
                    ca.request_timeout,
                )
            }
            (PoolState::Exhausted, _) => Verdict::abort(POOL_EXHAUSTED_MSG),
            (PoolState::Stopped, _) | (PoolState::Running | PoolState::Attached, None) => {
                Verdict::abort(POOL_STOPPED_MSG)
            }
            // Off at startup and reloaded on: there is no pool to ask
            (PoolState::Disabled, _) => Verdict::Proceed,
        };

        match &verdict {
            Verdict::Proceed => self.metrics.inc_proceeded(),
            Verdict::Abort(reason) => {
                self.metrics.inc_aborted();
                log::debug!(
                    "[CLIENT] Rejected user \"{}\" on database \"{}\": {}",
                    conn.user_name,
                    conn.database_name,
                    reason
                );
            }
        }
        verdict
    }

    /// Password-check hook in the caller's session, or in the configured
    /// passcheck database when one is set.
    pub fn check_password<S: Session + ?Sized>(
        &self,
        caller: &mut S,
        request: &PasswordCheck<'_>,
    ) -> std::result::Result<(), BackendError> {
        let settings = self.settings.current();
        if settings.passcheck.database.is_empty() {
            passcheck::check(caller, &settings.passcheck, request)
        } else {
            passcheck::check_via(self.connector.as_ref(), &settings.passcheck, request)
        }
    }

    /// Apply new settings; see [`SettingsHandle::reload`].
    pub fn reload(&self, settings: Settings) -> std::result::Result<ReloadReport, ConfigError> {
        self.settings.reload(settings)
    }

    #[must_use]
    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        self.state
    }

    /// The slot table, when the hook was enabled at startup
    #[must_use]
    pub fn table(&self) -> Option<&SlotTable> {
        self.table.as_deref()
    }

    /// Stop and join every worker. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == PoolState::Stopped {
            return;
        }
        self.stop_workers();
        self.state = PoolState::Stopped;
        log::info!("[POOL] Shut down");
    }

    fn stop_workers(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Disconnecting wakes supervisors waiting out a restart delay
        self.stop_tx = None;
        if let Some(table) = &self.table {
            if !self.supervisors.is_empty() {
                for worker in 0..table.layout().workers {
                    table.worker_cv(worker).broadcast();
                }
            }
        }
        for handle in self.supervisors.drain(..) {
            if handle.join().is_err() {
                log::error!("[POOL] Supervisor thread panicked");
            }
        }
        self.release_pool();
    }

    fn release_pool(&mut self) {
        if !self.owns_pool {
            return;
        }
        if let Some(table) = &self.table {
            table.release_pool();
        }
        self.owns_pool = false;
    }
}

impl<C: Connector> Drop for AuthService<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SupervisorContext<C: Connector> {
    index: usize,
    table: Arc<SlotTable>,
    connector: Arc<C>,
    settings: SettingsHandle,
    metrics: Arc<PoolMetrics>,
    stop: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
}

impl<C: Connector> SupervisorContext<C> {
    fn supervise(self) {
        loop {
            let mut worker = Worker::new(
                self.index,
                Arc::clone(&self.table),
                Arc::clone(&self.connector),
                self.settings.clone(),
                Arc::clone(&self.metrics),
            );

            if panic::catch_unwind(AssertUnwindSafe(|| worker.run(&self.stop))).is_ok() {
                return;
            }

            let delay = self.settings.current().clientauth.restart_delay;
            log::error!(
                "[WORKER] Worker {} crashed, restarting in {:?}",
                self.index,
                delay
            );
            self.metrics.inc_worker_restarts();

            match self.stop_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            if self.stop.load(Ordering::Acquire) {
                return;
            }
        }
    }
}
