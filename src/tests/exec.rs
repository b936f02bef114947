use crate::common::str2wcstring;
use crate::env::{EnvMode, EnvStack};
use crate::exec::{exec_job, job_wait, output_stream_for_chain};
use crate::future_feature_flags::{scoped_test, FeatureFlag};
use crate::gil::yield_point;
use crate::io::{IoBufferfill, IoChain, SeparationType};
use crate::parser::{Parser, ParserRef};
use crate::proc::{
    Job, JobProperties, ProcStatus, Process, ProcessType, InternalProcBody,
};
use crate::tests::prelude::*;
use crate::wchar::prelude::*;
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Mutex};

fn root_parser() -> ParserRef {
    Parser::new(Arc::new(EnvStack::new()))
}

fn external_process(argv: &[&str]) -> Box<Process> {
    let mut p = Process::new();
    p.typ = ProcessType::external;
    p.set_argv(argv.iter().map(|&s| WString::from(s)).collect());
    Box::new(p)
}

fn internal_process(body: impl FnOnce(&Parser, &IoChain) -> ProcStatus + Send + 'static) -> Box<Process> {
    let mut p = Process::new();
    p.typ = ProcessType::block_node;
    p.body.replace(Some(Box::new(body) as InternalProcBody));
    Box::new(p)
}

fn make_job(background: bool, command: &wstr, processes: Vec<Box<Process>>) -> Job {
    let mut job = Job::new(
        JobProperties {
            initial_background: background,
            ..Default::default()
        },
        command.to_owned(),
    );
    job.processes = processes;
    let count = job.processes.len();
    for (i, p) in job.processes.iter_mut().enumerate() {
        p.is_first_in_job = i == 0;
        p.is_last_in_job = i + 1 == count;
    }
    job
}

#[test]
#[serial]
fn test_external_pipeline_into_buffer() {
    test_init();
    let parser = root_parser();

    let bufferfill = IoBufferfill::create().unwrap();
    let mut block_io = IoChain::new();
    block_io.push(bufferfill.clone());

    let job = make_job(
        false,
        L!("echo hello | cat"),
        vec![
            external_process(&["echo", "hello"]),
            external_process(&["cat"]),
        ],
    );
    let job = exec_job(&parser, job, None, &block_io);
    assert!(job.is_completed());
    assert_eq!(parser.get_last_status(), 0);
    assert_eq!(parser.get_last_statuses().pipestatus, vec![0, 0]);

    drop(block_io);
    let buffer = IoBufferfill::finish(bufferfill);
    assert_eq!(buffer.newline_serialized(), b"hello\n");
}

#[test]
#[serial]
fn test_pipestatus_reports_every_stage() {
    test_init();
    let parser = root_parser();
    let job = make_job(
        false,
        L!("sh -c 'exit 3' | sh -c 'exit 5'"),
        vec![
            external_process(&["sh", "-c", "exit 3"]),
            external_process(&["sh", "-c", "exit 5"]),
        ],
    );
    exec_job(&parser, job, None, &IoChain::new());
    let statuses = parser.get_last_statuses();
    assert_eq!(statuses.pipestatus, vec![3, 5]);
    assert_eq!(statuses.status, 5);
}

#[test]
#[serial]
fn test_globals_escape_a_pipeline_stage() {
    test_init();
    // begin; set -g foo bar; end | cat
    // The block runs as a script thread, not a forked subshell, so the global it sets must be
    // visible to the enclosing shell once the pipeline completes.
    scoped_test(FeatureFlag::Concurrent, true, || {
        let parser = root_parser();

        let bufferfill = IoBufferfill::create().unwrap();
        let mut block_io = IoChain::new();
        block_io.push(bufferfill.clone());

        let job = make_job(
            false,
            L!("begin; set -g foo bar; end | cat"),
            vec![
                internal_process(|prs, chain| {
                    prs.vars().set_one(
                        L!("foo"),
                        EnvMode::GLOBAL,
                        L!("bar").to_owned(),
                    );
                    let mut out = output_stream_for_chain(chain);
                    out.append_with_separation(L!("block output"), SeparationType::explicitly, true);
                    ProcStatus::from_exit_code(0)
                }),
                external_process(&["cat"]),
            ],
        );
        exec_job(&parser, job, None, &block_io);

        assert_eq!(parser.vars().get(L!("foo")).unwrap().as_string(), "bar");
        assert_eq!(parser.get_last_status(), 0);

        drop(block_io);
        let buffer = IoBufferfill::finish(bufferfill);
        assert_eq!(buffer.newline_serialized(), b"block output\n");
    });
}

#[test]
#[serial]
fn test_backgrounded_block_and_wait() {
    test_init();
    scoped_test(FeatureFlag::Concurrent, true, || {
        let parser = root_parser();

        let job = make_job(
            true,
            L!("begin; set -g side effect; end &"),
            vec![internal_process(|prs, _chain| {
                yield_point();
                prs.vars()
                    .set_one(L!("side"), EnvMode::GLOBAL, L!("effect").to_owned());
                ProcStatus::from_exit_code(7)
            })],
        );
        let job = exec_job(&parser, job, None, &IoChain::new());

        // Backgrounded: exec_job returns without waiting, and the job is visible in `jobs`.
        assert!(job.is_initially_background());
        assert!(job.group().has_job_id());
        assert!(parser.job_get(job.job_id()).is_some());

        // `wait` blocks until the script thread reaches its terminal state; its exit status
        // becomes observable.
        let status = job_wait(&parser, &job);
        assert_eq!(status, 7);
        assert!(job.is_completed());
        assert_eq!(parser.vars().get(L!("side")).unwrap().as_string(), "effect");
    });
}

#[test]
#[serial]
fn test_concurrent_cd_isolation() {
    test_init();
    // Several backgrounded blocks each cd into their own directory, write two files with yields
    // in between, and count the entries. Every block sees its own working directory, and the
    // parent's $PWD is untouched.
    scoped_test(FeatureFlag::Concurrent, true, || {
        let saved_cwd = std::env::current_dir().unwrap();
        let parser = root_parser();
        let parent_pwd = parser.vars().get_pwd().clone();

        let dirs: Vec<_> = (0..3).map(|i| make_test_dir(&format!("cd_iso_{i}"))).collect();
        let counts = Arc::new(Mutex::new(Vec::new()));

        let mut jobs = vec![];
        for dir in &dirs {
            let dir = dir.clone();
            let counts = Arc::clone(&counts);
            let job = make_job(
                true,
                L!("cd $dir; touch one two; count * &"),
                vec![internal_process(move |prs, _chain| {
                    let wide = str2wcstring(dir.as_os_str().as_bytes());
                    prs.change_directory(&wide).unwrap();
                    yield_point();
                    std::fs::File::create("one.txt").unwrap();
                    yield_point();
                    std::fs::File::create("two.txt").unwrap();
                    yield_point();
                    let count = std::fs::read_dir(".").unwrap().count();
                    counts.lock().unwrap().push(count);
                    ProcStatus::from_exit_code(0)
                })],
            );
            jobs.push(exec_job(&parser, job, None, &IoChain::new()));
        }

        for job in &jobs {
            assert_eq!(job_wait(&parser, job), 0);
        }

        let counts = counts.lock().unwrap();
        assert_eq!(counts.len(), 3);
        assert!(counts.iter().all(|&c| c == 2), "each dir has exactly 2 files");
        for dir in &dirs {
            assert_eq!(std::fs::read_dir(dir).unwrap().count(), 2);
        }

        // The parent's $PWD never moved.
        assert_eq!(*parser.vars().get_pwd(), parent_pwd);

        std::env::set_current_dir(saved_cwd).unwrap();
        for dir in dirs {
            let _ = std::fs::remove_dir_all(dir);
        }
    });
}

#[test]
#[serial]
fn test_signal_exit_reported_in_status() {
    test_init();
    // A stage killed by a signal reports 128 + signo, and the kill signal is recorded.
    let parser = root_parser();
    let job = make_job(
        false,
        L!("sh -c 'kill -TERM $$'"),
        vec![external_process(&["sh", "-c", "kill -TERM $$"])],
    );
    exec_job(&parser, job, None, &IoChain::new());
    let statuses = parser.get_last_statuses();
    assert_eq!(statuses.status, 128 + libc::SIGTERM);
    assert_eq!(
        statuses.kill_signal.map(|s| s.code()),
        Some(libc::SIGTERM)
    );
}

#[test]
#[serial]
fn test_single_threaded_runs_stages_inline(){
    test_init();
    // With the concurrent feature off, internal stages run inline on the calling thread; no
    // script threads are created.
    scoped_test(FeatureFlag::Concurrent, false, || {
        let parser = root_parser();
        let ran = Arc::new(Mutex::new(false));
        let job = make_job(
            false,
            L!("begin; true; end"),
            vec![internal_process({
                let ran = Arc::clone(&ran);
                move |_prs, _chain| {
                    *ran.lock().unwrap() = true;
                    ProcStatus::from_exit_code(0)
                }
            })],
        );
        let job = exec_job(&parser, job, None, &IoChain::new());
        assert!(*ran.lock().unwrap());
        assert!(job.script_threads.borrow().is_empty());
        assert!(job.is_completed());
    });
}
