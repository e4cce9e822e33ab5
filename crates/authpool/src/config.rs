// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Settings for the authentication pool and the password-check hook.
//!
//! # Architecture
//!
//! - **Typed settings**: [`Settings`] with defaults, validated as a whole
//! - **YAML loading**: [`Settings::from_yaml_str`] / [`Settings::from_yaml_file`]
//!   (feature `config-loaders`)
//! - **Live reload**: [`SettingsHandle`] swaps settings atomically (`ArcSwap`);
//!   readers never block
//!
//! # Example YAML
//!
//! ```yaml
//! clientauth:
//!   mode: require
//!   database: postgres
//!   workers: 2
//!   users_to_skip: 'admin, "Ops,Team"'
//!   request_timeout_ms: 5000
//! passcheck:
//!   mode: on
//! host:
//!   max_worker_processes: 8
//! ```
//!
//! # Restart-only Settings
//!
//! Clients and workers must agree on the table layout, and the pool is only
//! spawned when the hook is enabled at startup. A reload therefore keeps the
//! startup values of `clientauth.database`, `workers`, `slots`, `segment`,
//! `host.max_worker_processes`, and of `clientauth.mode` when it was `off`.

use crate::table::MAX_SLOTS;
use arc_swap::ArcSwap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// =======================================================================
// Defaults
// =======================================================================

/// Database hosting the procedure catalog
pub const DEFAULT_DATABASE: &str = "postgres";

/// Worker processes in the pool
pub const DEFAULT_WORKERS: usize = 2;

/// Period of liveness re-checks while sleeping
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(1000);

/// Delay before a crashed worker is respawned
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(1000);

/// Background-process budget of the host
pub const DEFAULT_MAX_WORKER_PROCESSES: usize = 8;

// =======================================================================
// Errors
// =======================================================================

/// Invalid or unreadable settings
#[derive(Debug)]
pub enum ConfigError {
    /// Unknown feature mode
    InvalidMode { setting: &'static str, value: String },

    /// Skip list could not be parsed
    InvalidSkipList { setting: &'static str, reason: String },

    /// Numeric setting outside its range
    OutOfRange {
        setting: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    /// Required setting left empty
    Missing(&'static str),

    /// Settings file could not be read
    Io(io::Error),

    /// Settings file is not valid YAML for this schema
    #[cfg(feature = "config-loaders")]
    Yaml(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMode { setting, value } => write!(
                f,
                "invalid value for {setting}: \"{value}\" (expected off, on or require)"
            ),
            Self::InvalidSkipList { setting, reason } => {
                write!(f, "could not parse {setting}: {reason}")
            }
            Self::OutOfRange {
                setting,
                value,
                min,
                max,
            } => write!(f, "{value} is outside the valid range for {setting} ({min} .. {max})"),
            Self::Missing(setting) => write!(f, "{setting} must not be empty"),
            Self::Io(e) => write!(f, "failed to read settings: {e}"),
            #[cfg(feature = "config-loaders")]
            Self::Yaml(e) => write!(f, "invalid settings file: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            #[cfg(feature = "config-loaders")]
            Self::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

// =======================================================================
// Feature mode
// =======================================================================

/// Whether a hook runs, and whether it must find procedures to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FeatureMode {
    /// Hook disabled, everything proceeds
    #[default]
    Off,
    /// Run registered procedures if there are any
    On,
    /// Run registered procedures; having none is itself a rejection
    Require,
}

impl FeatureMode {
    fn parse(setting: &'static str, value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::On),
            "require" | "required" => Ok(Self::Require),
            _ => Err(ConfigError::InvalidMode {
                setting,
                value: value.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Require => "require",
        }
    }
}

impl FromStr for FeatureMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse("mode", s)
    }
}

impl fmt::Display for FeatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =======================================================================
// Skip lists
// =======================================================================

/// Names exempted from a hook.
///
/// Parsed from a comma-separated list. Entries are matched exactly and
/// case-sensitively; double quotes allow commas and surrounding spaces, with
/// `""` standing for a literal quote.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SkipList {
    entries: Vec<String>,
}

impl SkipList {
    /// Parse `raw`; `setting` names the source in error messages.
    pub fn parse(setting: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSkipList {
            setting,
            reason: reason.to_string(),
        };

        let mut entries = Vec::new();
        if raw.trim().is_empty() {
            return Ok(Self { entries });
        }

        let mut chars = raw.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut entry = String::new();
            if chars.next_if_eq(&'"').is_some() {
                loop {
                    match chars.next() {
                        None => return Err(invalid("unterminated quoted name")),
                        Some('"') if chars.next_if_eq(&'"').is_some() => entry.push('"'),
                        Some('"') => break,
                        Some(c) => entry.push(c),
                    }
                }
                while chars.next_if(|c| c.is_whitespace()).is_some() {}
            } else {
                while let Some(c) = chars.next_if(|c| *c != ',') {
                    if c == '"' {
                        return Err(invalid("quote inside an unquoted name"));
                    }
                    entry.push(c);
                }
                entry.truncate(entry.trim_end().len());
            }

            if entry.is_empty() {
                return Err(invalid("empty name in list"));
            }
            entries.push(entry);

            match chars.next() {
                None => break,
                Some(',') => {}
                Some(_) => return Err(invalid("expected ',' after quoted name")),
            }
        }

        Ok(Self { entries })
    }

    /// Exact match against any entry
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

// =======================================================================
// Settings
// =======================================================================

/// Connection-authentication hook settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientAuthSettings {
    pub mode: FeatureMode,
    /// Database the workers connect to (restart-only)
    pub database: String,
    /// Worker pool size (restart-only)
    pub workers: usize,
    /// Slot table size (restart-only)
    pub slots: usize,
    /// Shared-memory name; empty maps an anonymous table (restart-only)
    pub segment: String,
    pub users_to_skip: SkipList,
    pub databases_to_skip: SkipList,
    /// Timed-sleep period for liveness re-checks
    pub liveness_interval: Duration,
    /// Bound on the whole client round trip, `None` waits forever
    pub request_timeout: Option<Duration>,
    /// Delay before respawning a crashed worker
    pub restart_delay: Duration,
}

impl Default for ClientAuthSettings {
    fn default() -> Self {
        Self {
            mode: FeatureMode::Off,
            database: DEFAULT_DATABASE.to_string(),
            workers: DEFAULT_WORKERS,
            slots: MAX_SLOTS,
            segment: String::new(),
            users_to_skip: SkipList::default(),
            databases_to_skip: SkipList::default(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            request_timeout: None,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Password-check hook settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PasscheckSettings {
    pub mode: FeatureMode,
    /// Database holding the catalog; empty runs in the caller's session
    pub database: String,
}

/// Limits imposed by the hosting server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSettings {
    /// Background workers the host can run (restart-only)
    pub max_worker_processes: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            max_worker_processes: DEFAULT_MAX_WORKER_PROCESSES,
        }
    }
}

/// All settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    pub clientauth: ClientAuthSettings,
    pub passcheck: PasscheckSettings,
    pub host: HostSettings,
}

fn check_range(setting: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            setting,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl Settings {
    /// Check ranges and required values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ca = &self.clientauth;
        check_range("clientauth.slots", ca.slots as u64, 1, MAX_SLOTS as u64)?;
        check_range("clientauth.workers", ca.workers as u64, 1, ca.slots as u64)?;
        check_range(
            "clientauth.liveness_interval_ms",
            ca.liveness_interval.as_millis() as u64,
            1,
            3_600_000,
        )?;
        if let Some(timeout) = ca.request_timeout {
            check_range(
                "clientauth.request_timeout_ms",
                timeout.as_millis() as u64,
                1,
                u32::MAX as u64,
            )?;
        }
        if ca.database.is_empty() {
            return Err(ConfigError::Missing("clientauth.database"));
        }
        Ok(())
    }

    /// Copy of `self` with the restart-only fields taken from `startup`.
    ///
    /// Returns the adjusted settings and the names of the fields that were
    /// held back.
    fn pin_restart_only(mut self, startup: &Settings) -> (Self, Vec<&'static str>) {
        let mut held = Vec::new();
        let (ca, started) = (&mut self.clientauth, &startup.clientauth);

        if ca.database != started.database {
            ca.database.clone_from(&started.database);
            held.push("clientauth.database");
        }
        if ca.workers != started.workers {
            ca.workers = started.workers;
            held.push("clientauth.workers");
        }
        if ca.slots != started.slots {
            ca.slots = started.slots;
            held.push("clientauth.slots");
        }
        if ca.segment != started.segment {
            ca.segment.clone_from(&started.segment);
            held.push("clientauth.segment");
        }
        if started.mode == FeatureMode::Off && ca.mode != FeatureMode::Off {
            ca.mode = FeatureMode::Off;
            held.push("clientauth.mode");
        }
        if self.host.max_worker_processes != startup.host.max_worker_processes {
            self.host.max_worker_processes = startup.host.max_worker_processes;
            held.push("host.max_worker_processes");
        }

        (self, held)
    }
}

// =======================================================================
// YAML loading
// =======================================================================

#[cfg(feature = "config-loaders")]
mod yaml {
    use super::{ConfigError, FeatureMode, Settings, SkipList};
    use serde::Deserialize;
    use std::time::Duration;

    /// Root YAML document structure.
    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub(super) struct YamlSettingsDocument {
        pub clientauth: YamlClientAuth,
        pub passcheck: YamlPasscheck,
        pub host: YamlHost,
    }

    /// `clientauth` section; absent keys keep their defaults.
    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub(super) struct YamlClientAuth {
        /// off, on or require
        pub mode: Option<String>,
        pub database: Option<String>,
        pub workers: Option<usize>,
        pub slots: Option<usize>,
        pub segment: Option<String>,
        /// Comma-separated, quoted names allowed
        pub users_to_skip: Option<String>,
        pub databases_to_skip: Option<String>,
        pub liveness_interval_ms: Option<u64>,
        pub request_timeout_ms: Option<u64>,
        pub restart_delay_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub(super) struct YamlPasscheck {
        pub mode: Option<String>,
        pub database: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub(super) struct YamlHost {
        pub max_worker_processes: Option<usize>,
    }

    impl YamlSettingsDocument {
        pub(super) fn into_settings(self) -> Result<Settings, ConfigError> {
            let mut settings = Settings::default();
            let ca = &mut settings.clientauth;
            let doc = self.clientauth;

            if let Some(mode) = doc.mode {
                ca.mode = FeatureMode::parse("clientauth.mode", &mode)?;
            }
            if let Some(database) = doc.database {
                ca.database = database;
            }
            if let Some(workers) = doc.workers {
                ca.workers = workers;
            }
            if let Some(slots) = doc.slots {
                ca.slots = slots;
            }
            if let Some(segment) = doc.segment {
                ca.segment = segment;
            }
            if let Some(users) = doc.users_to_skip {
                ca.users_to_skip = SkipList::parse("clientauth.users_to_skip", &users)?;
            }
            if let Some(databases) = doc.databases_to_skip {
                ca.databases_to_skip = SkipList::parse("clientauth.databases_to_skip", &databases)?;
            }
            if let Some(ms) = doc.liveness_interval_ms {
                ca.liveness_interval = Duration::from_millis(ms);
            }
            // 0 disables the bound, like leaving it out
            if let Some(ms) = doc.request_timeout_ms {
                ca.request_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            if let Some(ms) = doc.restart_delay_ms {
                ca.restart_delay = Duration::from_millis(ms);
            }

            if let Some(mode) = self.passcheck.mode {
                settings.passcheck.mode = FeatureMode::parse("passcheck.mode", &mode)?;
            }
            if let Some(database) = self.passcheck.database {
                settings.passcheck.database = database;
            }
            if let Some(max) = self.host.max_worker_processes {
                settings.host.max_worker_processes = max;
            }

            settings.validate()?;
            Ok(settings)
        }
    }
}

#[cfg(feature = "config-loaders")]
impl Settings {
    /// Parse and validate settings from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let doc: yaml::YamlSettingsDocument =
            serde_yaml::from_str(content).map_err(ConfigError::Yaml)?;
        doc.into_settings()
    }

    /// Parse and validate settings from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_yaml_str(&content)
    }
}

// =======================================================================
// Live settings
// =======================================================================

/// Fields a reload could not apply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Restart-only settings that changed and were kept at startup values
    pub held_back: Vec<&'static str>,
}

impl ReloadReport {
    /// Every change took effect
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.held_back.is_empty()
    }
}

/// Current settings, swappable at runtime.
///
/// Cheap to clone; all clones observe the same reloads.
#[derive(Clone)]
pub struct SettingsHandle {
    current: Arc<ArcSwap<Settings>>,
    startup: Arc<Settings>,
}

impl SettingsHandle {
    /// Validate and install the startup settings.
    pub fn new(settings: Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let startup = Arc::new(settings);
        Ok(Self {
            current: Arc::new(ArcSwap::new(Arc::clone(&startup))),
            startup,
        })
    }

    /// Lock-free snapshot of the current settings
    #[inline]
    #[must_use]
    pub fn current(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Settings the process started with
    #[must_use]
    pub fn startup(&self) -> &Settings {
        &self.startup
    }

    /// Install `next`. Invalid settings leave the current ones in place.
    pub fn reload(&self, next: Settings) -> Result<ReloadReport, ConfigError> {
        next.validate()?;
        let (next, held_back) = next.pin_restart_only(&self.startup);
        for field in &held_back {
            log::warn!("[CONFIG] {} changed but requires a restart; keeping startup value", field);
        }
        self.current.store(Arc::new(next));
        log::info!("[CONFIG] Settings reloaded");
        Ok(ReloadReport { held_back })
    }
}

impl fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsHandle")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
