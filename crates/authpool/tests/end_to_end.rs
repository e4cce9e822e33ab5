// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::items_after_statements)] // Test helpers
#![allow(clippy::too_many_lines)] // Scenario tests
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end scenarios through `AuthService`.
//!
//! Every test runs a real pool (threads over an anonymous slot table) against
//! an in-memory procedure catalog:
//! - procedures decide, in registration order, first rejection wins
//! - skip lists and mode short circuits
//! - sub-transaction isolation of procedure writes
//! - YAML settings and runtime reload

use authpool::{
    AuthService, BackendError, ConnectionInfo, Feature, FeatureMode, HookArgs, MemoryCatalog,
    PasswordCheck, PasswordType, ProcedureOutput, Settings, SkipList, Verdict,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DB: &str = "postgres";

fn settings(mode: FeatureMode) -> Settings {
    let mut settings = Settings::default();
    settings.clientauth.mode = mode;
    settings.clientauth.slots = 16;
    settings.clientauth.workers = 2;
    settings.clientauth.liveness_interval = Duration::from_millis(20);
    settings.clientauth.request_timeout = Some(Duration::from_secs(10));
    settings
}

fn catalog() -> MemoryCatalog {
    let catalog = MemoryCatalog::new();
    catalog.create_database(DB);
    catalog.install_catalog(DB).expect("install catalog");
    catalog
}

/// Register `schema.name` for clientauth, defined by `f`.
fn register<F>(catalog: &MemoryCatalog, schema: &str, name: &str, f: F)
where
    F: Fn(&HookArgs<'_>, &mut authpool::Tx<'_>) -> Result<ProcedureOutput, BackendError> + Send + Sync + 'static,
{
    catalog.define_procedure(DB, schema, name, f).expect("define");
    catalog
        .register(DB, Feature::ClientAuth, schema, name)
        .expect("register");
}

fn user_of<'a>(args: &'a HookArgs<'_>) -> &'a str {
    match args {
        HookArgs::ClientAuth { port, .. } => port.user_name.as_str(),
        HookArgs::PasswordCheck { user, .. } => *user,
    }
}

#[test]
fn test_reject_accept_then_unregister() {
    let catalog = catalog();
    register(&catalog, "public", "no_alice", |args, _| {
        if user_of(args) == "alice" {
            Ok(ProcedureOutput::text("alice is not welcome"))
        } else {
            Ok(ProcedureOutput::Void)
        }
    });

    let service = AuthService::start(settings(FeatureMode::On), catalog.clone()).expect("start");

    let alice = ConnectionInfo::new("alice", "app");
    let bob = ConnectionInfo::new("bob", "app");
    assert_eq!(service.authenticate(&alice, 0), Verdict::abort("alice is not welcome"));
    assert_eq!(service.authenticate(&bob, 0), Verdict::Proceed);

    catalog
        .unregister(DB, Feature::ClientAuth, "public", "no_alice")
        .expect("unregister");
    assert_eq!(service.authenticate(&alice, 0), Verdict::Proceed);

    let snap = service.metrics().snapshot();
    assert_eq!(snap.requests, 3);
    assert_eq!(snap.aborted, 1);
    assert_eq!(snap.proceeded, 2);
}

#[test]
fn test_first_rejection_stops_the_list() {
    let catalog = catalog();
    let calls = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);

    let c = Arc::clone(&calls);
    register(&catalog, "auth", "p1", move |_, _| {
        c[0].fetch_add(1, Ordering::SeqCst);
        Ok(ProcedureOutput::Text(None))
    });
    let c = Arc::clone(&calls);
    register(&catalog, "auth", "p2", move |_, _| {
        c[1].fetch_add(1, Ordering::SeqCst);
        Ok(ProcedureOutput::Rows(vec![vec![Some("p2 says no".to_string())]]))
    });
    let c = Arc::clone(&calls);
    register(&catalog, "auth", "p3", move |_, _| {
        c[2].fetch_add(1, Ordering::SeqCst);
        Ok(ProcedureOutput::Void)
    });

    let service = AuthService::start(settings(FeatureMode::On), catalog).expect("start");
    let verdict = service.authenticate(&ConnectionInfo::new("carol", "app"), 0);

    assert_eq!(verdict, Verdict::abort("p2 says no"));
    assert_eq!(calls[0].load(Ordering::SeqCst), 1);
    assert_eq!(calls[1].load(Ordering::SeqCst), 1);
    assert_eq!(calls[2].load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_results_are_no_opinion() {
    let catalog = catalog();
    register(&catalog, "auth", "empty_text", |_, _| Ok(ProcedureOutput::text("")));
    register(&catalog, "auth", "no_rows", |_, _| Ok(ProcedureOutput::Rows(Vec::new())));
    register(&catalog, "auth", "null_row", |_, _| Ok(ProcedureOutput::Rows(vec![vec![None]])));

    let service = AuthService::start(settings(FeatureMode::On), catalog).expect("start");
    assert!(service.authenticate(&ConnectionInfo::new("dave", "app"), 0).is_proceed());
}

#[test]
fn test_skip_lists_take_precedence() {
    let catalog = catalog();
    register(&catalog, "auth", "deny_all", |_, _| Ok(ProcedureOutput::text("denied")));

    let mut s = settings(FeatureMode::Require);
    s.clientauth.users_to_skip = SkipList::parse("clientauth.users_to_skip", "admin, \"Ops, Team\"").expect("users");
    s.clientauth.databases_to_skip = SkipList::parse("clientauth.databases_to_skip", "template1").expect("dbs");
    let service = AuthService::start(s, catalog).expect("start");

    assert!(service.authenticate(&ConnectionInfo::new("admin", "app"), 0).is_proceed());
    assert!(service.authenticate(&ConnectionInfo::new("Ops, Team", "app"), 0).is_proceed());
    assert!(service.authenticate(&ConnectionInfo::new("eve", "template1"), 0).is_proceed());

    // Matching is exact
    assert_eq!(service.authenticate(&ConnectionInfo::new("Admin", "app"), 0), Verdict::abort("denied"));

    let snap = service.metrics().snapshot();
    assert_eq!(snap.skipped, 3);
    assert_eq!(snap.aborted, 1);
}

#[test]
fn test_mode_off_never_consults_procedures() {
    let catalog = catalog();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    register(&catalog, "auth", "count", move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(ProcedureOutput::text("denied"))
    });

    let service = AuthService::start(settings(FeatureMode::Off), catalog).expect("start");
    for user in ["a", "b", "c"] {
        assert!(service.authenticate(&ConnectionInfo::new(user, "app"), 0).is_proceed());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(service.table().is_none());
}

#[test]
fn test_require_mode_rejects_without_procedures() {
    let catalog = catalog();
    let service = AuthService::start(settings(FeatureMode::Require), catalog.clone()).expect("start");
    let verdict = service.authenticate(&ConnectionInfo::new("frank", "app"), 0);
    assert_eq!(
        verdict.message(),
        Some("\"clientauth\" feature is set to require, but no procedures are registered for it")
    );

    catalog.uninstall_catalog(DB).expect("uninstall");
    let verdict = service.authenticate(&ConnectionInfo::new("frank", "app"), 0);
    assert_eq!(
        verdict.message(),
        Some("\"clientauth\" feature is set to require, but the procedure catalog is not installed")
    );
    assert_eq!(service.metrics().policy_rejections(), 2);
    assert_eq!(service.metrics().worker_bypassed(), 0);
}

#[test]
fn test_on_mode_accepts_without_catalog() {
    let catalog = MemoryCatalog::new();
    catalog.create_database(DB);
    let service = AuthService::start(settings(FeatureMode::On), catalog).expect("start");
    assert!(service.authenticate(&ConnectionInfo::new("gina", "app"), 0).is_proceed());
    assert!(service.metrics().worker_bypassed() >= 1);
    assert_eq!(service.metrics().policy_rejections(), 0);
}

#[test]
fn test_raised_error_rolls_back_its_writes() {
    let catalog = catalog();
    register(&catalog, "audit", "log_attempt", |args, tx| {
        tx.put(format!("seen:{}", user_of(args)), "1");
        Ok(ProcedureOutput::Void)
    });
    register(&catalog, "audit", "explode", |args, tx| {
        tx.put(format!("exploded:{}", user_of(args)), "1");
        if user_of(args) == "mallory" {
            return Err(BackendError::new("mallory tripped the wire"));
        }
        Ok(ProcedureOutput::Void)
    });

    let service = AuthService::start(settings(FeatureMode::On), catalog.clone()).expect("start");

    let verdict = service.authenticate(&ConnectionInfo::new("mallory", "app"), 0);
    assert_eq!(verdict, Verdict::abort("mallory tripped the wire"));
    assert_eq!(catalog.committed_value(DB, "seen:mallory"), None);
    assert_eq!(catalog.committed_value(DB, "exploded:mallory"), None);

    assert!(service.authenticate(&ConnectionInfo::new("trent", "app"), 0).is_proceed());
    assert_eq!(catalog.committed_value(DB, "seen:trent").as_deref(), Some("1"));
    assert_eq!(catalog.committed_value(DB, "exploded:trent").as_deref(), Some("1"));
    assert_eq!(service.metrics().procedure_errors(), 1);
}

#[test]
fn test_panicking_procedure_rejects() {
    let catalog = catalog();
    register(&catalog, "auth", "buggy", |_, _| panic!("index out of range"));

    let service = AuthService::start(settings(FeatureMode::On), catalog).expect("start");
    let verdict = service.authenticate(&ConnectionInfo::new("henry", "app"), 0);
    assert_eq!(
        verdict.message(),
        Some("registered procedure panicked: index out of range")
    );

    // The worker survives and keeps serving
    let verdict = service.authenticate(&ConnectionInfo::new("henry", "app"), 0);
    assert!(verdict.message().is_some());
    assert_eq!(service.metrics().worker_restarts(), 0);
}

#[test]
fn test_status_and_connection_fields_reach_procedures() {
    let catalog = catalog();
    register(&catalog, "auth", "inspect", |args, _| match args {
        HookArgs::ClientAuth { port, status } => {
            if *status != 0 {
                return Ok(ProcedureOutput::text(format!("status {status}")));
            }
            if port.remote_host != "10.0.0.7" {
                return Ok(ProcedureOutput::text("unexpected host"));
            }
            Ok(ProcedureOutput::Void)
        }
        HookArgs::PasswordCheck { .. } => Ok(ProcedureOutput::Void),
    });

    let service = AuthService::start(settings(FeatureMode::On), catalog).expect("start");
    let conn = ConnectionInfo::new("ivan", "app").with_remote_host("10.0.0.7");
    assert!(service.authenticate(&conn, 0).is_proceed());
    assert_eq!(service.authenticate(&conn, -1), Verdict::abort("status -1"));
}

#[test]
fn test_reload_skip_list_applies_immediately() {
    let catalog = catalog();
    register(&catalog, "auth", "deny_all", |_, _| Ok(ProcedureOutput::text("denied")));

    let service = AuthService::start(settings(FeatureMode::On), catalog).expect("start");
    let judy = ConnectionInfo::new("judy", "app");
    assert_eq!(service.authenticate(&judy, 0), Verdict::abort("denied"));

    let mut next = settings(FeatureMode::On);
    next.clientauth.users_to_skip = SkipList::parse("clientauth.users_to_skip", "judy").expect("users");
    next.clientauth.workers = 4;
    let report = service.reload(next).expect("reload");
    assert_eq!(report.held_back, vec!["clientauth.workers"]);

    assert!(service.authenticate(&judy, 0).is_proceed());
    assert_eq!(service.settings().current().clientauth.workers, 2);
}

#[test]
fn test_yaml_settings_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(
        file,
        "clientauth:\n  mode: require\n  workers: 1\n  slots: 4\n  users_to_skip: \"postgres, \\\"Back, Office\\\"\"\n  liveness_interval_ms: 25\n  request_timeout_ms: 0\npasscheck:\n  mode: on\n  database: auth"
    )
    .expect("write");

    let settings = Settings::from_yaml_file(file.path()).expect("parse");
    assert_eq!(settings.clientauth.mode, FeatureMode::Require);
    assert_eq!(settings.clientauth.workers, 1);
    assert_eq!(settings.clientauth.slots, 4);
    assert!(settings.clientauth.users_to_skip.contains("Back, Office"));
    assert_eq!(settings.clientauth.liveness_interval, Duration::from_millis(25));
    assert!(settings.clientauth.request_timeout.is_none());
    assert_eq!(settings.passcheck.mode, FeatureMode::On);
    assert_eq!(settings.passcheck.database, "auth");

    let service = AuthService::start(settings, catalog()).expect("start");
    assert!(service.authenticate(&ConnectionInfo::new("postgres", "app"), 0).is_proceed());
}

#[test]
fn test_password_check_through_service() {
    let catalog = catalog();
    catalog.create_database("auth");
    catalog.install_catalog("auth").expect("install");
    catalog
        .define_procedure("auth", "rules", "min_length", |args, _| match args {
            HookArgs::PasswordCheck { password, password_type, .. } => {
                if *password_type == PasswordType::Plaintext && password.len() < 8 {
                    Ok(ProcedureOutput::text("password is too short"))
                } else {
                    Ok(ProcedureOutput::Void)
                }
            }
            HookArgs::ClientAuth { .. } => Ok(ProcedureOutput::Void),
        })
        .expect("define");
    catalog
        .register("auth", Feature::Passcheck, "rules", "min_length")
        .expect("register");

    let mut s = settings(FeatureMode::Off);
    s.passcheck.mode = FeatureMode::On;
    s.passcheck.database = "auth".to_string();
    let service = AuthService::start(s, catalog.clone()).expect("start");

    let mut caller = catalog.session(DB).expect("session");
    let short = PasswordCheck {
        user: "kim",
        password: "abc",
        password_type: PasswordType::Plaintext,
        valid_until: None,
    };
    let err = service.check_password(&mut caller, &short).expect_err("rejected");
    assert_eq!(err.message(), "password is too short");

    let hashed = PasswordCheck {
        password: "SCRAM-SHA-256$4096:abc",
        password_type: PasswordType::ScramSha256,
        ..short
    };
    assert!(service.check_password(&mut caller, &hashed).is_ok());
}
