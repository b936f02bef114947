use crate::chdir::{locking_fchdir, shared_serializer_for_test, DirFd};
use crate::common::str2wcstring;
use crate::fds::{wopen_dir, BEST_O_SEARCH};
use crate::tests::prelude::*;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn open_dir_handle(path: &Path) -> DirFd {
    let wide = str2wcstring(path.as_os_str().as_bytes());
    Arc::new(wopen_dir(&wide, BEST_O_SEARCH).unwrap())
}

fn assert_cwd_is(path: &Path) {
    assert_eq!(
        std::env::current_dir().unwrap().canonicalize().unwrap(),
        path.canonicalize().unwrap()
    );
}

#[test]
#[serial]
fn test_shared_holds_when_agreeing() {
    test_init();
    let saved_cwd = std::env::current_dir().unwrap();
    let dir = make_test_dir("agree");
    let handle = open_dir_handle(&dir);

    // First acquire goes through the ticket machinery and performs the fchdir.
    let lock = locking_fchdir(&handle).unwrap();
    assert_cwd_is(&dir);
    drop(lock);

    // With the directory cached and no waiters, agreeing callers share the hold.
    let l1 = locking_fchdir(&handle).unwrap();
    let l2 = locking_fchdir(&handle).unwrap();
    let (serving, next) = shared_serializer_for_test().tickets();
    assert_eq!(serving, next, "shared holds should not consume tickets");
    assert_cwd_is(&dir);
    drop(l1);
    drop(l2);

    std::env::set_current_dir(saved_cwd).unwrap();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
#[serial]
fn test_disagreeing_caller_waits_for_release() {
    test_init();
    let saved_cwd = std::env::current_dir().unwrap();
    let dir_a = make_test_dir("turns_a");
    let dir_b = make_test_dir("turns_b");
    let handle_a = open_dir_handle(&dir_a);
    let handle_b = open_dir_handle(&dir_b);

    // Prime the cache so the next acquire of dir_a is a shared hold.
    drop(locking_fchdir(&handle_a).unwrap());
    let lock_a = locking_fchdir(&handle_a).unwrap();

    // A thread wanting dir_b must take a ticket and wait until the hold is released.
    let (tx, rx) = mpsc::channel();
    let waiter = std::thread::spawn(move || {
        let lock_b = locking_fchdir(&handle_b).unwrap();
        tx.send(()).unwrap();
        drop(lock_b);
    });

    // The waiter must not get through while we hold dir_a.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    let (serving, next) = shared_serializer_for_test().tickets();
    assert!(serving < next, "the waiter should have taken a ticket");

    drop(lock_a);
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    waiter.join().unwrap();
    assert_cwd_is(&dir_b);

    std::env::set_current_dir(saved_cwd).unwrap();
    let _ = std::fs::remove_dir_all(dir_a);
    let _ = std::fs::remove_dir_all(dir_b);
}

#[test]
#[serial]
fn test_ticket_monotonicity_under_contention() {
    test_init();
    let saved_cwd = std::env::current_dir().unwrap();
    let dirs: Vec<_> = (0..4).map(|i| make_test_dir(&format!("mono_{i}"))).collect();
    let handles: Vec<DirFd> = dirs.iter().map(|d| open_dir_handle(d)).collect();

    let mut workers = vec![];
    for handle in handles {
        workers.push(std::thread::spawn(move || {
            for _ in 0..25 {
                let lock = locking_fchdir(&handle).unwrap();
                drop(lock);
            }
        }));
    }
    // Sample the tickets while the workers fight over the cwd.
    let mut last_serving = 0;
    for _ in 0..200 {
        let (serving, next) = shared_serializer_for_test().tickets();
        assert!(serving <= next);
        assert!(serving >= last_serving, "now_serving went backwards");
        last_serving = serving;
        std::thread::sleep(Duration::from_micros(500));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    std::env::set_current_dir(saved_cwd).unwrap();
    for dir in dirs {
        let _ = std::fs::remove_dir_all(dir);
    }
}
