// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registered procedures and the database session they run in.
//!
//! The pool never talks to a database directly. It drives a [`Session`]
//! obtained from a [`Connector`]; the host supplies both (a SQL client, or
//! [`crate::memory::MemoryCatalog`] for embedding and tests).
//!
//! # Result Contract
//!
//! | Procedure outcome                       | Meaning                        |
//! |-----------------------------------------|--------------------------------|
//! | returns void                            | no opinion                     |
//! | returns `""` or NULL                    | no opinion                     |
//! | returns rows, first column of first row | as above, on that value        |
//! | returns no rows                         | no opinion                     |
//! | returns a non-empty string              | reject with that string        |
//! | raises an error or panics               | reject with the error message  |
//!
//! The first rejection stops the list; later procedures are not called.

use crate::table::ConnectionInfo;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Version of the argument shape passed to client-authentication procedures
pub const CLIENTAUTH_ARGS_VERSION: u32 = 1;

/// Interception point a procedure is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    /// A client is authenticating
    ClientAuth,
    /// A password is being set
    Passcheck,
}

impl Feature {
    /// Name used in the catalog
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ClientAuth => "clientauth",
            Self::Passcheck => "passcheck",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error raised inside a database session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    message: String,
    hint: Option<String>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Same error with its message folded by [`single_line`]
    #[must_use]
    pub fn into_single_line(mut self) -> Self {
        self.message = single_line(&self.message);
        self
    }
}

/// Message used when a rejection carries no text
pub const EMPTY_REJECTION_MSG: &str = "rejected by a registered procedure";

/// Fold a rejection message onto one line.
///
/// Lines are trimmed and joined with a single space; blank lines are
/// dropped. A message with no text left becomes [`EMPTY_REJECTION_MSG`].
#[must_use]
pub fn single_line(raw: &str) -> String {
    let folded = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if folded.is_empty() {
        EMPTY_REJECTION_MSG.to_string()
    } else {
        folded
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendError {}

/// Schema-qualified procedure name read from the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    schema: String,
    name: String,
}

impl QualifiedName {
    /// Validate a catalog entry for `feature`.
    ///
    /// Both parts must be non-empty and free of `;`.
    pub fn new(feature: Feature, schema: &str, name: &str) -> Result<Self, BackendError> {
        for part in [schema, name] {
            if part.is_empty() {
                return Err(BackendError::new(format!(
                    "schema and procedure names must be present in every \"{feature}\" catalog entry"
                )));
            }
            if part.contains(';') {
                return Err(BackendError::new(format!(
                    "\"{feature}\" feature does not support calling out to procedures or schemas that contain \";\""
                ))
                .with_hint(format!(
                    "Check that the \"{feature}\" catalog entries do not contain ';'."
                )));
            }
        }
        Ok(Self {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `schema.name` with each part quoted when it is not a plain
    /// lower-case identifier.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted())
    }
}

fn quote_ident(ident: &str) -> Cow<'_, str> {
    let mut chars = ident.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$');
    if plain {
        Cow::Borrowed(ident)
    } else {
        Cow::Owned(format!("\"{}\"", ident.replace('"', "\"\"")))
    }
}

/// How a password reached the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordType {
    Plaintext,
    Md5,
    ScramSha256,
}

impl PasswordType {
    /// Name passed to procedures
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "PASSWORD_TYPE_PLAINTEXT",
            Self::Md5 => "PASSWORD_TYPE_MD5",
            Self::ScramSha256 => "PASSWORD_TYPE_SCRAM_SHA_256",
        }
    }
}

/// Arguments handed to a registered procedure.
#[derive(Clone, Copy, Debug)]
pub enum HookArgs<'a> {
    /// Connection record plus authentication status so far
    ClientAuth { port: &'a ConnectionInfo, status: i32 },
    /// Password being set
    PasswordCheck {
        user: &'a str,
        password: &'a str,
        password_type: PasswordType,
        valid_until: Option<&'a str>,
    },
}

/// Value returned by a procedure call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcedureOutput {
    Void,
    /// Single text value, `None` for NULL
    Text(Option<String>),
    /// Row set; only the first column of the first row is consulted
    Rows(Vec<Vec<Option<String>>>),
}

impl ProcedureOutput {
    /// Text result
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(Some(value.into()))
    }

    /// Rejection reason carried by this result, if any.
    #[must_use]
    pub fn rejection(self) -> Option<String> {
        let value = match self {
            Self::Void => None,
            Self::Text(value) => value,
            Self::Rows(rows) => rows
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next())
                .flatten(),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// A database session able to run registered procedures.
///
/// Transactions are flat with nested sub-transactions, like savepoints.
pub trait Session {
    fn begin(&mut self) -> Result<(), BackendError>;
    fn commit(&mut self) -> Result<(), BackendError>;
    fn rollback(&mut self);

    fn begin_subtransaction(&mut self) -> Result<(), BackendError>;
    /// Keep the sub-transaction's writes in the enclosing transaction
    fn release_subtransaction(&mut self) -> Result<(), BackendError>;
    /// Discard the sub-transaction's writes
    fn rollback_subtransaction(&mut self);

    /// Whether the procedure catalog exists in this database
    fn catalog_installed(&mut self) -> Result<bool, BackendError>;

    /// `(schema, procedure)` entries registered for `feature`, in
    /// registration order
    fn feature_entries(&mut self, feature: Feature) -> Result<Vec<(String, String)>, BackendError>;

    fn call(&mut self, procedure: &QualifiedName, args: &HookArgs<'_>) -> Result<ProcedureOutput, BackendError>;
}

/// Opens sessions against a named database.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn connect(&self, database: &str) -> Result<Self::Session, BackendError>;

    fn database_exists(&self, database: &str) -> Result<bool, BackendError>;
}

/// Read and validate the procedures registered for `feature`.
pub fn registered_procedures<S: Session + ?Sized>(
    session: &mut S,
    feature: Feature,
) -> Result<Vec<QualifiedName>, BackendError> {
    session
        .feature_entries(feature)?
        .iter()
        .map(|(schema, name)| QualifiedName::new(feature, schema, name))
        .collect()
}

/// Result of running a procedure list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No procedure objected
    Accepted,
    /// A procedure returned a non-empty string
    Rejected(String),
    /// A procedure raised an error or panicked; its writes were rolled back
    Raised(BackendError),
}

impl Outcome {
    /// Rejection message folded onto one line, `None` when accepted
    #[must_use]
    pub fn into_rejection(self) -> Option<String> {
        match self {
            Self::Accepted => None,
            Self::Rejected(msg) => Some(single_line(&msg)),
            Self::Raised(err) => Some(single_line(&err.message)),
        }
    }
}

fn call_in_order<S: Session + ?Sized>(
    session: &mut S,
    procedures: &[QualifiedName],
    args: &HookArgs<'_>,
) -> Result<Option<String>, BackendError> {
    for procedure in procedures {
        if let Some(reason) = session.call(procedure, args)?.rejection() {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("registered procedure panicked: {detail}")
}

/// Run `procedures` inside a sub-transaction of the current transaction.
///
/// An error or panic rolls the sub-transaction back and becomes
/// [`Outcome::Raised`]. Otherwise the sub-transaction is released, keeping
/// the procedures' writes. Only failures of the sub-transaction itself are
/// returned as `Err`.
pub fn run_isolated<S: Session + ?Sized>(
    session: &mut S,
    procedures: &[QualifiedName],
    args: &HookArgs<'_>,
) -> Result<Outcome, BackendError> {
    session.begin_subtransaction()?;

    let result = panic::catch_unwind(AssertUnwindSafe(|| call_in_order(session, procedures, args)));

    match result {
        Ok(Ok(rejection)) => {
            session.release_subtransaction()?;
            Ok(rejection.map_or(Outcome::Accepted, Outcome::Rejected))
        }
        Ok(Err(err)) => {
            session.rollback_subtransaction();
            Ok(Outcome::Raised(err))
        }
        Err(payload) => {
            session.rollback_subtransaction();
            Ok(Outcome::Raised(BackendError::new(panic_message(payload.as_ref()))))
        }
    }
}

/// Open transaction, rolled back on drop unless committed.
pub(crate) struct Transaction<'s, S: Session + ?Sized> {
    session: &'s mut S,
    open: bool,
}

impl<'s, S: Session + ?Sized> Transaction<'s, S> {
    pub(crate) fn begin(session: &'s mut S) -> Result<Self, BackendError> {
        session.begin()?;
        Ok(Self { session, open: true })
    }

    pub(crate) fn session(&mut self) -> &mut S {
        self.session
    }

    pub(crate) fn commit(mut self) -> Result<(), BackendError> {
        self.open = false;
        self.session.commit()
    }
}

impl<S: Session + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.open {
            self.session.rollback();
        }
    }
}
