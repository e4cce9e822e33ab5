// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Concurrency and failure scenarios.
//!
//! - many clients sharing few slots always get their own verdict
//! - connections of one process spread over the table by connection id
//! - no wakeup is lost (long liveness interval, fast round trips)
//! - slots held by dead processes are reclaimed
//! - bounded waits expire and the slot stays usable

use authpool::client::Client;
use authpool::{
    AuthService, ConnectionInfo, Feature, FeatureMode, HookArgs, MemoryCatalog, PoolState,
    ProcedureOutput, Settings, Verdict, POOL_EXHAUSTED_MSG, WORKER_TIMEOUT_MSG,
};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DB: &str = "postgres";

fn settings(slots: usize, workers: usize, liveness: Duration) -> Settings {
    let mut settings = Settings::default();
    settings.clientauth.mode = FeatureMode::On;
    settings.clientauth.slots = slots;
    settings.clientauth.workers = workers;
    settings.clientauth.liveness_interval = liveness;
    settings
}

/// Catalog rejecting every user whose name starts with `deny-`, naming them.
/// Users named `slow-*` take `delay` to decide.
fn catalog(delay: Duration) -> MemoryCatalog {
    let catalog = MemoryCatalog::new();
    catalog.create_database(DB);
    catalog.install_catalog(DB).expect("install");
    catalog
        .define_procedure(DB, "auth", "policy", move |args, _| {
            let HookArgs::ClientAuth { port, .. } = args else {
                return Ok(ProcedureOutput::Void);
            };
            if port.user_name.starts_with("slow-") {
                thread::sleep(delay);
            }
            if port.user_name.starts_with("deny-") {
                return Ok(ProcedureOutput::text(format!("{} denied", port.user_name)));
            }
            Ok(ProcedureOutput::Void)
        })
        .expect("define");
    catalog
        .register(DB, Feature::ClientAuth, "auth", "policy")
        .expect("register");
    catalog
}

fn expected(user: &str) -> Verdict {
    if user.starts_with("deny-") {
        Verdict::abort(format!("{user} denied"))
    } else {
        Verdict::Proceed
    }
}

fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait for child");
    pid
}

/// Live processes to act on behalf of, killed on drop.
struct Sleepers(Vec<Child>);

impl Sleepers {
    fn spawn(count: usize) -> Self {
        Self(
            (0..count)
                .map(|_| Command::new("sleep").arg("30").spawn().expect("spawn sleep"))
                .collect(),
        )
    }

    fn pids(&self) -> Vec<u32> {
        self.0.iter().map(Child::id).collect()
    }
}

impl Drop for Sleepers {
    fn drop(&mut self) {
        for child in &mut self.0 {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[test]
fn test_every_client_gets_its_own_verdict() {
    const THREADS: usize = 12;
    const ROUNDS: usize = 25;

    let service = Arc::new(
        AuthService::start(settings(4, 2, Duration::from_millis(50)), catalog(Duration::from_millis(1)))
            .expect("start"),
    );
    let sleepers = Sleepers::spawn(THREADS);

    let handles: Vec<_> = sleepers
        .pids()
        .into_iter()
        .enumerate()
        .map(|(t, pid)| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(t as u64);
                for round in 0..ROUNDS {
                    let prefix = match rng.u8(0..3) {
                        0 => "deny",
                        1 => "slow",
                        _ => "user",
                    };
                    let user = format!("{prefix}-{t}-{round}");
                    let verdict = service.authenticate_as(pid, &ConnectionInfo::new(&user, "app"), 0);
                    assert_eq!(verdict, expected(&user), "thread {t} round {round}");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread panicked");
    }

    let snap = service.metrics().snapshot();
    assert_eq!(snap.requests, (THREADS * ROUNDS) as u64);
    assert_eq!(snap.proceeded + snap.aborted, snap.requests);
    assert_eq!(snap.slot_reclaims, 0);

    let table = service.table().expect("table");
    assert!(table.snapshot().iter().all(|slot| slot.is_idle()));
}

#[test]
fn test_same_process_connections_get_their_own_verdict() {
    let service = Arc::new(
        AuthService::start(settings(8, 2, Duration::from_millis(50)), catalog(Duration::ZERO)).expect("start"),
    );

    let handles: Vec<_> = (0..6u64)
        .map(|t| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for round in 0..20u64 {
                    let user = if (t + round) % 2 == 0 {
                        format!("deny-{t}-{round}")
                    } else {
                        format!("user-{t}-{round}")
                    };
                    let verdict = service.authenticate_connection(t, &ConnectionInfo::new(&user, "app"), 0);
                    assert_eq!(verdict, expected(&user));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("client thread panicked");
    }
    assert_eq!(service.metrics().requests(), 120);
}

#[test]
fn test_same_process_connections_spread_over_slots() {
    const CONNECTIONS: u64 = 4;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let catalog = MemoryCatalog::new();
    catalog.create_database(DB);
    catalog.install_catalog(DB).expect("install");
    {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        catalog
            .define_procedure(DB, "auth", "tracked", move |_, _| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(ProcedureOutput::Void)
            })
            .expect("define");
    }
    catalog
        .register(DB, Feature::ClientAuth, "auth", "tracked")
        .expect("register");

    let service = Arc::new(
        AuthService::start(settings(4, 4, Duration::from_millis(50)), catalog).expect("start"),
    );

    let handles: Vec<_> = (0..CONNECTIONS)
        .map(|id| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let user = format!("conn-{id}");
                service.authenticate_connection(id, &ConnectionInfo::new(&user, "app"), 0)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().expect("client thread panicked").is_proceed());
    }

    // One process, yet the procedures ran side by side in different workers
    assert!(peak.load(Ordering::SeqCst) >= 2, "peak {}", peak.load(Ordering::SeqCst));
    let table = service.table().expect("table");
    for slot in table.snapshot() {
        assert_eq!(slot.user_name, format!("conn-{}", slot.index));
        assert!(slot.is_idle());
    }
}

#[test]
fn test_no_lost_wakeups() {
    // Any lost wakeup would stall a round trip for the whole interval
    let liveness = Duration::from_secs(5);
    let service = AuthService::start(settings(2, 1, liveness), catalog(Duration::ZERO)).expect("start");

    let start = Instant::now();
    for i in 0..200 {
        let user = format!("user-{i}");
        assert!(service.authenticate(&ConnectionInfo::new(&user, "app"), 0).is_proceed());
    }
    assert!(start.elapsed() < liveness, "round trips took {:?}", start.elapsed());
}

#[test]
fn test_dead_owner_slot_is_reclaimed() {
    let liveness = Duration::from_secs(5);
    let service = AuthService::start(settings(1, 1, liveness), catalog(Duration::from_millis(200)))
        .expect("start");
    let table = service.table().expect("table");

    // A process published a slow request, then died without waiting for it
    let crashed = Client::for_pid(table, service.metrics(), liveness, dead_pid());
    let stale = crashed
        .claim_and_publish(&ConnectionInfo::new("slow-ghost", "app"), 0, None)
        .expect("claim");
    drop(stale);

    // Ownership is taken back at once; the worker's publish wakes us well
    // before the liveness interval
    let start = Instant::now();
    let verdict = service.authenticate(&ConnectionInfo::new("next", "app"), 0);
    assert_eq!(verdict, Verdict::Proceed);
    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    assert_eq!(service.metrics().slot_reclaims(), 1);

    let slot = &table.snapshot()[0];
    assert!(slot.is_idle());
    assert_eq!(slot.user_name, "next");
}

#[test]
fn test_worker_timeout_then_slot_reused() {
    let mut s = settings(1, 1, Duration::from_millis(20));
    s.clientauth.request_timeout = Some(Duration::from_millis(100));
    let service = AuthService::start(s.clone(), catalog(Duration::from_millis(400))).expect("start");

    let verdict = service.authenticate(&ConnectionInfo::new("slow-sam", "app"), 0);
    assert_eq!(verdict, Verdict::abort(WORKER_TIMEOUT_MSG));
    assert_eq!(service.metrics().timeouts(), 1);

    // The next claimer waits for the worker to drop the abandoned request
    s.clientauth.request_timeout = Some(Duration::from_secs(5));
    assert!(service.reload(s).expect("reload").is_clean());
    let verdict = service.authenticate(&ConnectionInfo::new("deny-tom", "app"), 0);
    assert_eq!(verdict, Verdict::abort("deny-tom denied"));
}

#[test]
fn test_pool_exhausted_rejects_every_request() {
    let mut s = settings(8, 4, Duration::from_millis(20));
    s.host.max_worker_processes = 2;
    let service = AuthService::start(s, catalog(Duration::ZERO)).expect("start");

    assert_eq!(service.state(), PoolState::Exhausted);
    for user in ["amy", "ben"] {
        assert_eq!(
            service.authenticate(&ConnectionInfo::new(user, "app"), 0),
            Verdict::abort(POOL_EXHAUSTED_MSG)
        );
    }
    assert_eq!(service.metrics().aborted(), 2);
}
