//! Process lock tests using real advisory file locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use vm_ports::lock::{self, Locker, ProcessLock, RetryPolicy, COLLISION_LOCK_LABEL};
use vm_ports::Error;

#[test]
fn test_waiter_acquires_after_holder_releases() {
    let dir = tempfile::tempdir().unwrap();
    let scope = dir.path().to_path_buf();
    let barrier = Arc::new(Barrier::new(2));
    let holder_done = Arc::new(AtomicBool::new(false));

    let holder = {
        let scope = scope.clone();
        let barrier = Arc::clone(&barrier);
        let holder_done = Arc::clone(&holder_done);
        thread::spawn(move || {
            let guard = ProcessLock
                .try_acquire(&scope, COLLISION_LOCK_LABEL)
                .unwrap()
                .expect("lock should be free");
            barrier.wait();
            thread::sleep(Duration::from_millis(200));
            holder_done.store(true, Ordering::SeqCst);
            drop(guard);
        })
    };

    barrier.wait();
    let policy = RetryPolicy::bounded(Duration::from_millis(20), 200);
    let result = lock::with_lock(&ProcessLock, &scope, COLLISION_LOCK_LABEL, policy, || {
        Ok(holder_done.load(Ordering::SeqCst))
    });

    holder.join().unwrap();
    // The body only ran once the holder had let go
    assert!(result.unwrap());
}

#[test]
fn test_bounded_retry_times_out_while_held() {
    let dir = tempfile::tempdir().unwrap();
    let _guard = ProcessLock
        .try_acquire(dir.path(), COLLISION_LOCK_LABEL)
        .unwrap()
        .unwrap();

    let start = Instant::now();
    let policy = RetryPolicy::bounded(Duration::from_millis(10), 3);
    let err = lock::acquire(&ProcessLock, dir.path(), COLLISION_LOCK_LABEL, policy).unwrap_err();

    match err {
        Error::LockTimeout { label, attempts } => {
            assert_eq!(label, COLLISION_LOCK_LABEL);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected lock timeout, got {other}"),
    }
    // Two backoffs between three attempts
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_lock_is_scoped_per_directory() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("machines/a");
    let b = dir.path().join("machines/b");

    let _held = ProcessLock.try_acquire(&a, COLLISION_LOCK_LABEL).unwrap().unwrap();
    assert!(ProcessLock
        .try_acquire(&b, COLLISION_LOCK_LABEL)
        .unwrap()
        .is_some());
    assert!(a.join("fpcollision.lock").exists());
}

#[test]
fn test_lock_released_when_body_panics() {
    let dir = tempfile::tempdir().unwrap();
    let scope = dir.path().to_path_buf();

    let panicked = std::panic::catch_unwind(|| {
        let _: vm_ports::Result<()> = lock::with_lock(
            &ProcessLock,
            &scope,
            COLLISION_LOCK_LABEL,
            RetryPolicy::default(),
            || panic!("backend exploded"),
        );
    });
    assert!(panicked.is_err());

    assert!(ProcessLock
        .try_acquire(dir.path(), COLLISION_LOCK_LABEL)
        .unwrap()
        .is_some());
}
