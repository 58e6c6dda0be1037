//! Lease protocol tests: exclusive creation across passes, lazy expiry and
//! owner-scoped release.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use vm_ports::port::{Clock, HostIp, LeaseStore, ReleaseRegistry};

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Utc::now())))
    }

    fn advance(&self, secs: i64) {
        *self.0.lock() += chrono::Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

fn marker_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0)
}

#[test]
fn test_interleaved_passes_never_both_acquire() {
    let dir = tempfile::tempdir().unwrap();
    let a = LeaseStore::new(dir.path(), "pass-a");
    let b = LeaseStore::new(dir.path(), "pass-b");

    // Both check before either acquires
    assert!(!a.check(HostIp::Wildcard, 2200).unwrap());
    assert!(!b.check(HostIp::Wildcard, 2200).unwrap());

    assert!(a.acquire(HostIp::Wildcard, 2200).unwrap());
    assert!(!b.acquire(HostIp::Wildcard, 2200).unwrap());
    assert!(b.check(HostIp::Wildcard, 2200).unwrap());
}

#[test]
fn test_racing_threads_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let dir = dir.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                let store = LeaseStore::new(dir, format!("pass-{}", i));
                barrier.wait();
                if !store.claim(HostIp::Wildcard, 2222).unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Keep the store alive until everyone has tried
                store
            })
        })
        .collect();

    let stores: Vec<LeaseStore> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(marker_count(dir.path()), 1);

    let released: usize = stores.iter().map(|s| s.release_all().unwrap()).sum();
    assert_eq!(released, 1);
    assert_eq!(marker_count(dir.path()), 0);
}

#[test]
fn test_expired_lease_does_not_block_and_is_purged() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let crashed = LeaseStore::new(dir.path(), "pass-crashed").with_clock(clock.clone());
    let next = LeaseStore::new(dir.path(), "pass-next").with_clock(clock.clone());

    assert!(crashed.acquire(HostIp::Wildcard, 2200).unwrap());
    assert!(next.check(HostIp::Wildcard, 2200).unwrap());

    clock.advance(61);
    assert!(!next.check(HostIp::Wildcard, 2200).unwrap());
    assert_eq!(marker_count(dir.path()), 0);
}

#[test]
fn test_custom_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let a = LeaseStore::new(dir.path(), "pass-a")
        .with_clock(clock.clone())
        .with_ttl(std::time::Duration::from_secs(5));

    assert!(a.acquire(HostIp::Wildcard, 2200).unwrap());
    clock.advance(6);
    assert_eq!(a.prune().unwrap(), 1);
}

#[test]
fn test_release_is_idempotent_and_owner_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let a = LeaseStore::new(dir.path(), "pass-a");
    let b = LeaseStore::new(dir.path(), "pass-b");

    assert!(a.acquire(HostIp::Wildcard, 2200).unwrap());
    assert!(b.acquire(HostIp::Wildcard, 2201).unwrap());

    assert_eq!(a.release_all().unwrap(), 1);
    assert_eq!(a.release_all().unwrap(), 0);
    assert!(b.check(HostIp::Wildcard, 2201).unwrap());
    assert_eq!(marker_count(dir.path()), 1);
}

#[test]
fn test_registry_releases_in_flight_passes() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ReleaseRegistry::new();
    let a = LeaseStore::new(dir.path(), "pass-a");
    let b = LeaseStore::new(dir.path(), "pass-b");
    registry.register(a.releaser());
    registry.register(b.releaser());

    assert!(a.acquire(HostIp::Wildcard, 2200).unwrap());
    assert!(b.acquire("127.0.0.1".parse().unwrap(), 2200).unwrap());

    assert_eq!(registry.release_all().unwrap(), 2);
    assert!(registry.is_empty());
    assert_eq!(marker_count(dir.path()), 0);
}

#[test]
fn test_list_reports_owner_and_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let a = LeaseStore::new(dir.path(), "pass-a").with_clock(clock.clone());
    assert!(a.acquire(HostIp::Wildcard, 2200).unwrap());
    clock.advance(30);
    assert!(a.acquire(HostIp::Wildcard, 2201).unwrap());
    clock.advance(40);

    let entries = a.list().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].key, "2200");
    assert_eq!(entries[0].owner.as_deref(), Some("pass-a"));
    assert!(entries[0].expired);
    assert!(!entries[1].expired);
}
