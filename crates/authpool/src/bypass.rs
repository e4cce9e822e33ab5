// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fast-path decisions that avoid the full round trip.
//!
//! # Checks, in order
//!
//! - [`precheck`] (settings only, run by the client and again by the worker):
//!   - user or database on a skip list: proceed, before anything else
//!   - mode `off`: proceed
//! - [`evaluate`] (needs a session, run by the worker and by passcheck):
//!   - catalog missing: proceed, or reject in `require` mode
//!   - no registered procedures: proceed, or reject in `require` mode
//!   - otherwise the procedures run
//!
//! A skip-list match therefore wins over the `require` rejection.

use crate::config::{ClientAuthSettings, FeatureMode};
use crate::procedure::{registered_procedures, BackendError, Feature, QualifiedName, Session};
use crate::table::ConnectionInfo;
use std::fmt;

/// Why a request skipped the hook entirely
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    User(String),
    Database(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(name) => write!(f, "user \"{name}\" is in clientauth.users_to_skip"),
            Self::Database(name) => {
                write!(f, "database \"{name}\" is in clientauth.databases_to_skip")
            }
        }
    }
}

/// Decision reachable from settings alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Precheck {
    /// On a skip list
    Skip(SkipReason),
    /// Hook is off
    Disabled,
    /// Needs the worker
    Queue,
}

/// Skip lists first, then the mode.
#[must_use]
pub fn precheck(settings: &ClientAuthSettings, conn: &ConnectionInfo) -> Precheck {
    if settings.users_to_skip.contains(&conn.user_name) {
        return Precheck::Skip(SkipReason::User(conn.user_name.clone()));
    }
    if settings.databases_to_skip.contains(&conn.database_name) {
        return Precheck::Skip(SkipReason::Database(conn.database_name.clone()));
    }
    if settings.mode == FeatureMode::Off {
        return Precheck::Disabled;
    }
    Precheck::Queue
}

/// Why the catalog check accepted without running anything
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptReason {
    Disabled,
    CatalogMissing,
    NoProcedures,
}

/// What `require` mode found missing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequireFailure {
    CatalogMissing,
    NoProcedures,
}

impl RequireFailure {
    /// User-facing rejection message
    #[must_use]
    pub fn message(self, feature: Feature) -> String {
        match self {
            Self::CatalogMissing => format!(
                "\"{feature}\" feature is set to require, but the procedure catalog is not installed"
            ),
            Self::NoProcedures => format!(
                "\"{feature}\" feature is set to require, but no procedures are registered for it"
            ),
        }
    }
}

/// Decision after looking at the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogCheck {
    Accept(AcceptReason),
    Reject(RequireFailure),
    Run(Vec<QualifiedName>),
}

/// Look at the catalog and decide whether procedures need to run.
///
/// Must be called inside a transaction; catalog errors propagate.
pub fn evaluate<S: Session + ?Sized>(
    session: &mut S,
    feature: Feature,
    mode: FeatureMode,
) -> Result<CatalogCheck, BackendError> {
    let reject_or = |failure, reason| match mode {
        FeatureMode::Require => CatalogCheck::Reject(failure),
        _ => CatalogCheck::Accept(reason),
    };

    if mode == FeatureMode::Off {
        return Ok(CatalogCheck::Accept(AcceptReason::Disabled));
    }
    if !session.catalog_installed()? {
        return Ok(reject_or(RequireFailure::CatalogMissing, AcceptReason::CatalogMissing));
    }
    let procedures = registered_procedures(session, feature)?;
    if procedures.is_empty() {
        return Ok(reject_or(RequireFailure::NoProcedures, AcceptReason::NoProcedures));
    }
    Ok(CatalogCheck::Run(procedures))
}
