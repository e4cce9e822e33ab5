// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Named slot tables in the POSIX shm namespace.

use authpool::{
    AuthPoolError, AuthService, ConnectionInfo, Feature, FeatureMode, HookArgs, MemoryCatalog, PoolState,
    ProcedureOutput, Settings, SlotTable, TableLayout, Verdict,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn unique_name() -> String {
    format!("/authpool_it_{}_{}", std::process::id(), fastrand::u32(..))
}

/// Unlinks the segment when the test ends, pass or fail.
struct Unlink(String);

impl Drop for Unlink {
    fn drop(&mut self) {
        let _ = SlotTable::unlink(&self.0);
    }
}

#[test]
fn test_second_attacher_sees_first_layout() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());

    let layout = TableLayout::new(8, 2).expect("layout");
    let first = SlotTable::attach(&name, layout).expect("create");
    let second = SlotTable::attach(&name, layout).expect("attach");
    assert_eq!(second.layout(), first.layout());

    let viewer = SlotTable::open_existing(&name).expect("open existing");
    assert_eq!(viewer.layout(), layout);
    assert_eq!(viewer.snapshot().len(), 8);
}

#[test]
fn test_layout_mismatch_is_rejected() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());

    let _table = SlotTable::attach(&name, TableLayout::new(8, 2).expect("layout")).expect("create");
    match SlotTable::attach(&name, TableLayout::new(8, 4).expect("layout")) {
        Err(AuthPoolError::LayoutMismatch { expected, found }) => {
            assert_eq!(expected.workers, 4);
            assert_eq!(found.workers, 2);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("mismatched layout attached"),
    }
}

#[test]
fn test_open_existing_missing_segment() {
    assert!(SlotTable::open_existing(&unique_name()).is_err());
}

#[test]
fn test_service_on_named_segment_is_inspectable() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());

    let catalog = MemoryCatalog::new();
    catalog.create_database("postgres");

    let mut settings = Settings::default();
    settings.clientauth.mode = FeatureMode::On;
    settings.clientauth.slots = 4;
    settings.clientauth.workers = 1;
    settings.clientauth.segment = name.clone();
    settings.clientauth.liveness_interval = Duration::from_millis(20);

    let service = AuthService::start(settings, catalog).expect("start");
    assert!(service
        .authenticate(&ConnectionInfo::new("olga", "reports"), 0)
        .is_proceed());

    let viewer = SlotTable::open_existing(&name).expect("open existing");
    let used: Vec<_> = viewer
        .snapshot()
        .into_iter()
        .filter(|slot| slot.user_name == "olga")
        .collect();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].database_name, "reports");
    assert!(used[0].is_idle());
    assert!(used[0].owner_alive);
}

/// Catalog whose procedure takes a while and rejects `deny-*` users.
fn slow_catalog(calls: &Arc<AtomicUsize>) -> MemoryCatalog {
    let catalog = MemoryCatalog::new();
    catalog.create_database("postgres");
    catalog.install_catalog("postgres").expect("install");
    let calls = Arc::clone(calls);
    catalog
        .define_procedure("postgres", "public", "slow_policy", move |args, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            match args {
                HookArgs::ClientAuth { port, .. } if port.user_name.starts_with("deny-") => {
                    Ok(ProcedureOutput::text(format!("{} denied", port.user_name)))
                }
                _ => Ok(ProcedureOutput::Void),
            }
        })
        .expect("define");
    catalog
        .register("postgres", Feature::ClientAuth, "public", "slow_policy")
        .expect("register");
    catalog
}

fn named_settings(name: &str) -> Settings {
    let mut settings = Settings::default();
    settings.clientauth.mode = FeatureMode::On;
    settings.clientauth.slots = 1;
    settings.clientauth.workers = 1;
    settings.clientauth.segment = name.to_string();
    settings.clientauth.liveness_interval = Duration::from_millis(20);
    settings
}

#[test]
fn test_second_service_on_segment_runs_no_pool() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let catalog = slow_catalog(&calls);

    let first = AuthService::start(named_settings(&name), catalog.clone()).expect("start first");
    let second = AuthService::start(named_settings(&name), catalog).expect("start second");
    assert_eq!(first.state(), PoolState::Running);
    assert_eq!(second.state(), PoolState::Attached);
    assert_eq!(
        second.table().expect("table").pool_owner(),
        std::process::id()
    );

    assert!(second
        .authenticate(&ConnectionInfo::new("user-1", "app"), 0)
        .is_proceed());
    assert_eq!(
        second.authenticate(&ConnectionInfo::new("deny-2", "app"), 0),
        Verdict::abort("deny-2 denied")
    );
    assert!(first
        .authenticate(&ConnectionInfo::new("user-3", "app"), 0)
        .is_proceed());

    // One procedure call per request: nobody else served the slot
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_services_sharing_segment_keep_verdicts_apart() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let catalog = slow_catalog(&calls);

    let services = [
        Arc::new(AuthService::start(named_settings(&name), catalog.clone()).expect("start first")),
        Arc::new(AuthService::start(named_settings(&name), catalog).expect("start second")),
    ];

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let service = Arc::clone(&services[t % 2]);
            thread::spawn(move || {
                for round in 0..3 {
                    let user = if (t + round) % 2 == 0 {
                        format!("deny-{t}-{round}")
                    } else {
                        format!("user-{t}-{round}")
                    };
                    let expected = if user.starts_with("deny-") {
                        Verdict::abort(format!("{user} denied"))
                    } else {
                        Verdict::Proceed
                    };
                    let verdict = service.authenticate_connection(t as u64, &ConnectionInfo::new(&user, "app"), 0);
                    assert_eq!(verdict, expected, "thread {t} round {round}");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("client thread panicked");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 12);
}

#[test]
fn test_client_only_attach_round_trips() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let catalog = slow_catalog(&calls);

    let pool = AuthService::start(named_settings(&name), catalog.clone()).expect("start");
    let client = AuthService::attach(named_settings(&name), catalog).expect("attach");
    assert_eq!(pool.state(), PoolState::Running);
    assert_eq!(client.state(), PoolState::Attached);

    assert_eq!(
        client.authenticate(&ConnectionInfo::new("deny-olga", "app"), 0),
        Verdict::abort("deny-olga denied")
    );
    assert!(client
        .authenticate(&ConnectionInfo::new("olga", "app"), 0)
        .is_proceed());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.metrics().requests(), 2);
    assert_eq!(pool.metrics().requests(), 0);
}

#[test]
fn test_client_only_attach_needs_existing_table() {
    let name = unique_name();
    assert!(AuthService::attach(named_settings(&name), MemoryCatalog::new()).is_err());

    let _cleanup = Unlink(name.clone());
    let _table = SlotTable::attach(&name, TableLayout::new(2, 1).expect("layout")).expect("create");
    match AuthService::attach(named_settings(&name), MemoryCatalog::new()) {
        Err(AuthPoolError::LayoutMismatch { expected, found }) => {
            assert_eq!(expected.slots, 1);
            assert_eq!(found.slots, 2);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("mismatched layout attached"),
    }
}

#[test]
fn test_pool_ownership_handed_over_after_shutdown() {
    let name = unique_name();
    let _cleanup = Unlink(name.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let catalog = slow_catalog(&calls);

    let mut first = AuthService::start(named_settings(&name), catalog.clone()).expect("start first");
    first.shutdown();

    let second = AuthService::start(named_settings(&name), catalog).expect("start second");
    assert_eq!(second.state(), PoolState::Running);
    assert!(second
        .authenticate(&ConnectionInfo::new("user-9", "app"), 0)
        .is_proceed());
}
