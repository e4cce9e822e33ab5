// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type and the verdict returned to the host.

use crate::config::ConfigError;
use crate::shm::ShmError;
use crate::table::TableLayout;
use std::fmt;
use std::io;

/// Errors raised while building or running the pool.
///
/// None of these reach a connecting client directly: request handling always
/// ends in a [`Verdict`].
#[derive(Debug)]
pub enum AuthPoolError {
    /// Shared memory failure
    Shm(ShmError),

    /// Invalid settings
    Config(ConfigError),

    /// The table was initialized with different slot or worker counts
    LayoutMismatch {
        expected: TableLayout,
        found: TableLayout,
    },

    /// The segment does not hold a table this build understands
    IncompatibleTable(String),

    /// A worker thread could not be spawned
    Spawn(io::Error),

    /// Client-only attach needs a named segment to find the pool
    NoSegment,
}

impl fmt::Display for AuthPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shm(e) => write!(f, "Shared memory error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::LayoutMismatch { expected, found } => write!(
                f,
                "Slot table layout mismatch: expected {} slots / {} workers, found {} / {}",
                expected.slots, expected.workers, found.slots, found.workers
            ),
            Self::IncompatibleTable(detail) => write!(f, "Incompatible slot table: {detail}"),
            Self::Spawn(e) => write!(f, "Failed to spawn worker: {e}"),
            Self::NoSegment => f.write_str("Client-only attach requires clientauth.segment to be set"),
        }
    }
}

impl std::error::Error for AuthPoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shm(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for AuthPoolError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

impl From<ConfigError> for AuthPoolError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

pub type Result<T> = std::result::Result<T, AuthPoolError>;

/// Outcome of an authentication or password check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Let the connection (or password change) go ahead
    Proceed,
    /// Refuse it with the given reason
    Abort(String),
}

impl Verdict {
    /// Rejection with `reason`
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort(reason.into())
    }

    #[must_use]
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }

    /// The rejection reason, if any
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Proceed => None,
            Self::Abort(msg) => Some(msg),
        }
    }
}

impl From<Option<String>> for Verdict {
    /// `None` proceeds, `Some(reason)` aborts.
    fn from(rejection: Option<String>) -> Self {
        rejection.map_or(Self::Proceed, Self::Abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_layout_mismatch_display() {
        let err = AuthPoolError::LayoutMismatch {
            expected: TableLayout { slots: 8, workers: 2 },
            found: TableLayout { slots: 8, workers: 4 },
        };
        assert_eq!(
            err.to_string(),
            "Slot table layout mismatch: expected 8 slots / 2 workers, found 8 / 4"
        );
        assert!(err.source().is_none());
    }

    #[test]
    fn test_shm_error_has_source() {
        let err: AuthPoolError = ShmError::NotFound("/x".into()).into();
        assert!(err.source().is_some());
    }

    #[test]
    fn test_verdict_from_option() {
        assert_eq!(Verdict::from(None), Verdict::Proceed);
        let v = Verdict::from(Some("no".to_string()));
        assert_eq!(v.message(), Some("no"));
        assert!(!v.is_proceed());
    }
}
