// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # authpool - Pooled connection-authentication hooks
//!
//! Lets a database server consult user-registered procedures before it
//! accepts a connection, without opening a database session in every
//! connecting process. Connecting processes publish a request into a slot of
//! a shared-memory table; a small pool of workers, each holding one
//! long-lived session, runs the registered procedures and publishes a
//! verdict back.
//!
//! A second, pool-less hook checks passwords when they are set.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authpool::{AuthService, ConnectionInfo, FeatureMode, MemoryCatalog, Settings};
//!
//! fn main() -> authpool::Result<()> {
//!     let catalog = MemoryCatalog::new();
//!     catalog.create_database("postgres");
//!
//!     let mut settings = Settings::default();
//!     settings.clientauth.mode = FeatureMode::On;
//!
//!     let service = AuthService::start(settings, catalog)?;
//!     let verdict = service.authenticate(&ConnectionInfo::new("alice", "app"), 0);
//!     assert!(verdict.is_proceed());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  connecting process: AuthService::authenticate                       |
//! |    precheck (skip lists, mode) -> Client::round_trip                 |
//! +---------------------------------------------------------------------+
//! |  SlotTable (shared memory)                                           |
//! |    header | ShmLock | worker condvars | slots (request, verdict)     |
//! +---------------------------------------------------------------------+
//! |  worker pool: Worker::poll_once                                      |
//! |    catalog checks -> registered procedures -> publish verdict        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`service`] - lifecycle and the interception point (start here)
//! - [`client`] / [`worker`] - the two sides of the slot protocol
//! - [`table`] - shared slot table layout
//! - [`shm`] - cross-process lock, condvar and segment primitives
//! - [`procedure`] - procedure catalog contract and isolated execution
//! - [`passcheck`] - password-check hook
//! - [`config`] - settings, skip lists and runtime reload

pub mod bypass;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod passcheck;
pub mod procedure;
pub mod service;
pub mod shm;
pub mod table;
pub mod worker;

pub use client::{Client, Ticket, CLAIM_TIMEOUT_MSG, WORKER_TIMEOUT_MSG};
pub use config::{
    ClientAuthSettings, ConfigError, FeatureMode, HostSettings, PasscheckSettings, ReloadReport,
    Settings, SettingsHandle, SkipList,
};
pub use error::{AuthPoolError, Result, Verdict};
pub use memory::{MemoryCatalog, MemorySession, Tx};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use passcheck::PasswordCheck;
pub use procedure::{
    single_line, BackendError, Connector, Feature, HookArgs, PasswordType, ProcedureOutput,
    QualifiedName, Session, EMPTY_REJECTION_MSG,
};
pub use service::{AuthService, PoolState, POOL_EXHAUSTED_MSG, POOL_STOPPED_MSG};
pub use table::{ConnectionInfo, SlotSnapshot, SlotTable, TableLayout, MAX_SLOTS};
pub use worker::Worker;
