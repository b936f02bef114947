use crate::gil::{gil, yield_point, ExecTld, GilThread};
use crate::parser::{spawn_script_thread, Parser};
use crate::proc::ProcStatus;
use crate::tests::prelude::*;
use crate::wchar::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn root_parser() -> crate::parser::ParserRef {
    Parser::new(Arc::new(crate::env::EnvStack::new()))
}

/// Poll until `predicate` holds, panicking after a few seconds.
fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..2000 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("Timed out waiting for condition");
}

#[test]
#[serial]
fn test_mutual_exclusion() {
    test_init();
    // Several execution threads each repeatedly enter a "critical section" which asserts that no
    // other execution thread is inside it, then yield. Any overlap means two threads observed
    // themselves scheduled at once.
    let busy = Arc::new(AtomicBool::new(false));
    let mut joins = vec![];
    for _ in 0..4 {
        let busy = Arc::clone(&busy);
        let (tx, rx) = mpsc::channel();
        joins.push(rx);
        let thread = GilThread::new();
        gil().spawn(&thread);
        std::thread::spawn(move || {
            gil().run(&thread);
            for _ in 0..50 {
                assert!(!busy.swap(true, Ordering::Relaxed), "overlapping schedule");
                std::thread::yield_now();
                assert!(busy.swap(false, Ordering::Relaxed), "overlapping schedule");
                gil().yield_thread(&thread);
            }
            gil().release(&thread);
            gil().destroy(&thread);
            tx.send(()).unwrap();
        });
    }
    for rx in joins {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
}

#[test]
#[serial]
fn test_fifo_fairness() {
    test_init();
    // One thread holds the lock while two more enqueue, in a known order. On release, the earlier
    // enqueuer must be scheduled first.
    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = GilThread::new();
    gil().spawn(&holder);
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder_join = {
        let holder = Arc::clone(&holder);
        std::thread::spawn(move || {
            gil().run(&holder);
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            gil().release(&holder);
            gil().destroy(&holder);
        })
    };
    held_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let spawn_waiter = |name: &'static str| {
        let order = Arc::clone(&order);
        let thread = GilThread::new();
        gil().spawn(&thread);
        std::thread::spawn(move || {
            gil().run(&thread);
            order.lock().unwrap().push(name);
            gil().release(&thread);
            gil().destroy(&thread);
        })
    };

    let baseline = gil().waitqueue_len();
    let first = spawn_waiter("first");
    wait_until(|| gil().waitqueue_len() == baseline + 1);
    let second = spawn_waiter("second");
    wait_until(|| gil().waitqueue_len() == baseline + 2);

    release_tx.send(()).unwrap();
    holder_join.join().unwrap();
    first.join().unwrap();
    second.join().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
#[serial]
fn test_exec_tld_per_thread_values() {
    test_init();
    // A per-thread variable holder: each execution thread sees the value it wrote, across yields,
    // and the published value reverts once no thread is scheduled.
    let tld = Arc::new(ExecTld::new(0_i32));
    let mut handles = vec![];
    for i in 1..=4_i32 {
        let tld = Arc::clone(&tld);
        let handle = spawn_script_thread(root_parser(), move |_parser| {
            tld.set(i * 10);
            for _ in 0..10 {
                yield_point();
                assert_eq!(tld.get(), i * 10);
            }
            ProcStatus::from_exit_code(0)
        });
        handles.push(handle);
    }
    for handle in handles {
        assert!(handle.wait_for_completion().unwrap().is_success());
    }
    // All threads are destroyed; the published value belongs to no thread again.
    assert_eq!(tld.get(), 0);
}

#[test]
#[serial]
fn test_cwd_restored_across_switches() {
    test_init();
    // Two execution threads chdir to different directories. Across arbitrary interleavings, each
    // observes its own working directory whenever it is scheduled.
    let saved_cwd = std::env::current_dir().unwrap();
    let dirs = [make_test_dir("cwd_a"), make_test_dir("cwd_b")];

    let mut handles = vec![];
    for dir in &dirs {
        let dir = dir.clone();
        let handle = spawn_script_thread(root_parser(), move |_parser| {
            std::env::set_current_dir(&dir).unwrap();
            for _ in 0..20 {
                yield_point();
                assert_eq!(
                    std::env::current_dir().unwrap().canonicalize().unwrap(),
                    dir.canonicalize().unwrap()
                );
            }
            ProcStatus::from_exit_code(0)
        });
        handles.push(handle);
    }
    for handle in handles {
        assert!(handle.wait_for_completion().unwrap().is_success());
    }

    std::env::set_current_dir(saved_cwd).unwrap();
    for dir in dirs {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
#[serial]
fn test_status_is_per_thread() {
    test_init();
    // $status is logically per execution thread: each thread starts at zero, sets its own value,
    // and never observes another thread's.
    let mut handles = vec![];
    for i in 1..=3_i32 {
        let handle = spawn_script_thread(root_parser(), move |parser| {
            assert_eq!(parser.get_last_status(), 0);
            parser.set_last_status(i);
            for _ in 0..10 {
                yield_point();
                assert_eq!(parser.get_last_status(), i);
            }
            ProcStatus::from_exit_code(0)
        });
        handles.push(handle);
    }
    for handle in handles {
        assert!(handle.wait_for_completion().unwrap().is_success());
    }
}

#[test]
#[serial]
fn test_branch_seeds_and_shares() {
    test_init();
    // Branched children see copies of parent locals and share globals by reference.
    let parser = root_parser();
    let vars = parser.vars();
    vars.set_one(
        L!("seed"),
        crate::env::EnvMode::LOCAL,
        L!("from-parent").to_owned(),
    );

    let child = parser.branch();
    let handle = spawn_script_thread(child, |prs| {
        assert_eq!(
            prs.vars().get(L!("seed")).unwrap().as_string(),
            "from-parent"
        );
        // Mutating the seed creates a child-local binding.
        prs.vars().set_one(
            L!("seed"),
            crate::env::EnvMode::LOCAL,
            L!("from-child").to_owned(),
        );
        // Globals escape to the parent.
        prs.vars().set_one(
            L!("g"),
            crate::env::EnvMode::GLOBAL,
            L!("escapes").to_owned(),
        );
        ProcStatus::from_exit_code(0)
    });
    assert!(handle.wait_for_completion().unwrap().is_success());

    assert_eq!(vars.get(L!("seed")).unwrap().as_string(), "from-parent");
    assert_eq!(vars.get(L!("g")).unwrap().as_string(), "escapes");
}
