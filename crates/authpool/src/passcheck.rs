// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Password-check hook.
//!
//! Runs in the process setting the password, without the pool: either in the
//! caller's own session ([`check`]) or in a session opened on the configured
//! passcheck database ([`check_via`]).
//!
//! A rejection is returned as a [`BackendError`] so the host can surface both
//! the message and the hint. The password itself is never logged.

use crate::bypass::{self, CatalogCheck};
use crate::config::{FeatureMode, PasscheckSettings};
use crate::procedure::{
    run_isolated, single_line, BackendError, Connector, Feature, HookArgs, Outcome, PasswordType, Session,
    Transaction,
};
use std::fmt;

/// A password being set.
#[derive(Clone, Copy)]
pub struct PasswordCheck<'a> {
    pub user: &'a str,
    /// As stored: plaintext, or an MD5/SCRAM verifier
    pub password: &'a str,
    pub password_type: PasswordType,
    /// Account expiry as text, if any
    pub valid_until: Option<&'a str>,
}

impl fmt::Debug for PasswordCheck<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCheck")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("password_type", &self.password_type)
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

impl<'a> PasswordCheck<'a> {
    fn args(&self) -> HookArgs<'a> {
        HookArgs::PasswordCheck {
            user: self.user,
            password: self.password,
            password_type: self.password_type,
            valid_until: self.valid_until,
        }
    }
}

fn database_suffix(settings: &PasscheckSettings) -> String {
    if settings.database.is_empty() {
        String::new()
    } else {
        format!(" in the passcheck database \"{}\"", settings.database)
    }
}

/// Run the check inside the caller's open transaction.
pub fn check<S: Session + ?Sized>(
    session: &mut S,
    settings: &PasscheckSettings,
    request: &PasswordCheck<'_>,
) -> Result<(), BackendError> {
    let procedures = match bypass::evaluate(session, Feature::Passcheck, settings.mode)? {
        CatalogCheck::Accept(_) => return Ok(()),
        CatalogCheck::Reject(failure) => {
            return Err(BackendError::new(format!(
                "{}{}",
                failure.message(Feature::Passcheck),
                database_suffix(settings)
            )));
        }
        CatalogCheck::Run(procedures) => procedures,
    };

    match run_isolated(session, &procedures, &request.args())? {
        Outcome::Accepted => Ok(()),
        Outcome::Rejected(reason) => {
            log::debug!("[PASSCHECK] Password rejected for user \"{}\"", request.user);
            Err(BackendError::new(single_line(&reason)))
        }
        Outcome::Raised(err) => {
            log::debug!(
                "[PASSCHECK] Password check raised for user \"{}\": {}",
                request.user,
                err
            );
            Err(err.into_single_line())
        }
    }
}

/// Run the check in a fresh session on `settings.database`.
///
/// With an empty database name there is nothing to connect to and the
/// caller must use [`check`] with its own session.
pub fn check_via<C: Connector + ?Sized>(
    connector: &C,
    settings: &PasscheckSettings,
    request: &PasswordCheck<'_>,
) -> Result<(), BackendError> {
    if settings.mode == FeatureMode::Off {
        return Ok(());
    }
    if settings.database.is_empty() {
        return Err(BackendError::new("no passcheck database is configured")
            .with_hint("Set passcheck.database, or run the check in the calling session"));
    }
    if !connector.database_exists(&settings.database)? {
        return Err(BackendError::new(format!(
            "The passcheck database \"{}\" does not exist",
            settings.database
        ))
        .with_hint("Check the value of passcheck.database"));
    }

    let mut session = connector.connect(&settings.database).map_err(|err| {
        BackendError::new(format!(
            "\"{}\" feature was not able to connect to the database \"{}\": {}",
            Feature::Passcheck,
            settings.database,
            err
        ))
    })?;

    let mut txn = Transaction::begin(&mut session)?;
    let result = check(txn.session(), settings, request);
    txn.commit()?;
    result
}
