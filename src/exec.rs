//! Launching jobs: assembling the pipe chain, deciding process groups, running internal stages as
//! script threads and external stages as forked children, and reaping everything with the GIL
//! released around the blocking syscalls.

use crate::common::wcs2zstring;
use crate::fds::make_autoclose_pipes;
use crate::flog::{FLOG, FLOGF};
use crate::fork_exec::blocked_signals_for_job;
use crate::fork_exec::postfork::{
    child_setup_process, execute_fork, execute_setpgid, report_setpgid_error,
    safe_report_exec_error,
};
use crate::future_feature_flags::{feature_test, FeatureFlag};
use crate::gil::{current_thread, gil};
use crate::io::{
    dup2_list_resolve_chain, BufferedOutputStream, FdOutputStream, IoChain, IoMode, IoPipe,
    OutputStream,
};
use crate::job_group::populate_group_for_job;
use crate::parser::{spawn_script_thread, Parser, ParserRef};
use crate::proc::{
    Job, JobGroupRef, JobRef, Pid, ProcStatus, Statuses, STATUS_CMD_ERROR, STATUS_CMD_UNKNOWN,
    STATUS_NOT_EXECUTABLE, STATUS_WAIT_INTERRUPTED,
};
use crate::signal::Signal;
use crate::wchar::prelude::*;
use libc::{EINTR, STDIN_FILENO, STDOUT_FILENO};
use std::sync::Arc;

/// Different ways to assign a pgroup for a process.
#[derive(Clone, Copy, Eq, PartialEq)]
enum PgroupPolicy {
    /// Inherit fish's pgroup.
    Inherit,
    /// Join a specific pgroup.
    Join(libc::pid_t),
    /// The new process is the leader of a new pgroup.
    Lead,
}

/// Execute a job.
///
/// The job's group is decided here (inherited from `proposed_group` or newly created, see the
/// decision table in [`populate_group_for_job`]), its processes are connected by pipes and
/// launched, and the job is added to the parser's job list. If the job is a foreground job, this
/// blocks until it completes - releasing the GIL around every blocking syscall - and then applies
/// its statuses to `$status` and `$pipestatus`.
///
/// If the caller is a script thread, its GIL is released around blocking waits. Internal stages
/// run as branched script threads when the `concurrent` feature is on; with the feature off the
/// shell behaves as a single-threaded shell and runs them inline.
pub fn exec_job(
    parser: &ParserRef,
    mut job: Job,
    proposed_group: Option<&JobGroupRef>,
    block_io: &IoChain,
) -> JobRef {
    assert!(!job.processes.is_empty(), "Job has no processes");

    populate_group_for_job(&mut job, proposed_group);

    // If our group is awaiting a pgid, the first external process will become its leader.
    if job.group().needs_pgid_assignment() {
        if let Some(first_external) = job.processes.iter_mut().find(|p| !p.is_internal()) {
            first_external.leads_pgrp = true;
        }
    }

    // Build the io chain for each process: the block io, plus the pipe from the previous process
    // and the pipe to the next.
    let proc_count = job.processes.len();
    let mut chains: Vec<IoChain> = Vec::with_capacity(proc_count);
    let mut next_stdin: Option<std::os::fd::OwnedFd> = None;
    for i in 0..proc_count {
        let mut chain = block_io.clone();
        if let Some(read_end) = next_stdin.take() {
            chain.push(Arc::new(IoPipe::new(STDIN_FILENO, true, read_end)));
        }
        if i + 1 < proc_count {
            let Ok(pipes) = make_autoclose_pipes() else {
                // We already logged. The job will run with stages unconnected.
                chains.push(chain);
                continue;
            };
            next_stdin = Some(pipes.read);
            chain.push(Arc::new(IoPipe::new(STDOUT_FILENO, false, pipes.write)));
        }
        chains.push(chain);
    }

    let use_script_threads = feature_test(FeatureFlag::Concurrent)
        && (proc_count > 1 || job.is_initially_background());

    let job = Arc::new(job);
    parser.job_add(Arc::clone(&job));

    for (i, p) in job.processes.iter().enumerate() {
        let io_chain = std::mem::take(&mut chains[i]);
        if p.is_internal() {
            exec_internal_process(parser, &job, i, io_chain, use_script_threads);
        } else {
            exec_external_process(&job, p, &io_chain);
        }
        // The pipes owned by this chain close here, in the parent. The child (or the internal
        // stage) keeps its own ends.
    }

    job.mark_constructed();
    FLOGF!(
        exec_job_status,
        "Job '%ls' created, job id %d",
        job.command(),
        job.job_id().as_num()
    );

    if !job.is_initially_background() {
        if let Some(statuses) = wait_for_job(parser, &job) {
            parser.set_last_statuses(statuses);
        } else {
            parser.set_last_status(STATUS_WAIT_INTERRUPTED);
        }
        parser.remove_completed_jobs();
    }
    job
}

/// Launch one internal process: a function, block or builtin stage.
fn exec_internal_process(
    parser: &ParserRef,
    job: &JobRef,
    proc_idx: usize,
    io_chain: IoChain,
    use_script_threads: bool,
) {
    let p = &job.processes[proc_idx];
    let internal = Arc::new(crate::proc::InternalProc::new());
    p.internal_proc.replace(Some(Arc::clone(&internal)));
    let body = p
        .body
        .borrow_mut()
        .take()
        .expect("Internal process has no body");

    FLOGF!(
        proc_internal_proc,
        "Created internal proc %llu for '%ls'",
        internal.get_id(),
        job.command()
    );

    if use_script_threads {
        // Branch the parser: the stage runs concurrently against its own shell state.
        let child = parser.branch();
        let group = Arc::clone(job.group.as_ref().unwrap());
        let handle = spawn_script_thread(child, move |prs| {
            let status = body(prs, &io_chain);
            // If our group was cancelled by a signal, report that instead.
            let status = match group.get_cancel_signal() {
                Some(sig) => ProcStatus::from_signal(sig),
                None => status,
            };
            internal.mark_exited(&status);
            status
        });
        job.script_threads.borrow_mut().push(handle);
    } else {
        // Single threaded: run the stage inline, to completion, on the calling thread.
        let status = body(parser, &io_chain);
        internal.mark_exited(&status);
    }
}

/// Fork a child for one external process. The pgroup and tty assignment happen on both sides of
/// the fork to close the race between them.
fn exec_external_process(job: &JobRef, p: &crate::proc::Process, io_chain: &IoChain) -> bool {
    // Everything the child touches must be allocated before the fork.
    let argv_cstrs: Vec<std::ffi::CString> = p.argv().iter().map(|a| wcs2zstring(a)).collect();
    let actual_cmd = argv_cstrs.first().cloned().unwrap_or_default();
    let argv = crate::null_terminated_array::OwningNullTerminatedArray::new(argv_cstrs);
    let dup2s = dup2_list_resolve_chain(io_chain);

    // Decide on pgroups: either we stay in fish's pgroup, we join a specific one, or we lead a
    // new one.
    let pgroup_policy = if p.leads_pgrp {
        PgroupPolicy::Lead
    } else if let Some(pgid) = job.group().get_pgid() {
        PgroupPolicy::Join(pgid.as_pid_t())
    } else {
        PgroupPolicy::Inherit
    };

    let mut sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut sigmask) };
    let blocked_signals = blocked_signals_for_job(job, &mut sigmask);

    // Claim the tty from the shell, if the job wants it and we are the pgroup leader.
    let claim_tty_from = if p.leads_pgrp && job.group().wants_terminal() {
        Pid::new(unsafe { libc::getpgrp() })
    } else {
        None
    };

    let pid = execute_fork();
    if pid == 0 {
        // We are the child.
        child_setup_process(
            claim_tty_from,
            blocked_signals.then_some(&sigmask),
            true, /* is_forked */
            &dup2s,
        );
        let child_pgid = match pgroup_policy {
            PgroupPolicy::Inherit => None,
            PgroupPolicy::Join(pgid) => Some(pgid),
            PgroupPolicy::Lead => Some(0), // setpgid(0, 0) makes us the leader
        };
        if let Some(pgid) = child_pgid {
            execute_setpgid(0, pgid, false /* is_parent */);
        }
        unsafe {
            libc::execvp(actual_cmd.as_ptr(), argv.get().cast());
        }
        let err = errno::errno().0;
        safe_report_exec_error(err, &actual_cmd, &argv);
        crate::common::exit_without_destructors(if err == libc::ENOENT {
            STATUS_CMD_UNKNOWN
        } else {
            STATUS_NOT_EXECUTABLE
        });
    }

    // We are the parent.
    let pid = Pid::new(pid).expect("execute_fork returned an invalid pid to the parent");
    FLOGF!(
        exec_fork,
        "Fork, pid %d: external command '%ls'",
        pid.get(),
        job.command()
    );
    p.set_pid(pid);

    // Put the child in the right pgroup from our side too.
    let desired_pgid = match pgroup_policy {
        PgroupPolicy::Inherit => None,
        PgroupPolicy::Join(pgid) => Some(pgid),
        PgroupPolicy::Lead => Some(pid.as_pid_t()),
    };
    if let Some(pgid) = desired_pgid {
        let err = execute_setpgid(pid.as_pid_t(), pgid, true /* is_parent */);
        if err == 0 {
            if pgroup_policy == PgroupPolicy::Lead {
                job.group().set_pgid(pid.as_pid_t());
            }
        } else {
            // Do not stop the job; it runs with weakened signal semantics.
            report_setpgid_error(
                err,
                true, /* is_parent */
                pid.as_pid_t(),
                pgid,
                &wcs2zstring(job.command()),
            );
            return false;
        }
    }
    true
}

/// Block until the given job reaches its terminal state: join its script threads, then reap its
/// external processes with waitpid(). If the caller is a script thread, its GIL is released
/// around every blocking call. On success the job's statuses are returned; `None` means we were
/// interrupted by a cancellation signal before the job completed.
pub fn wait_for_job(parser: &Parser, job: &JobRef) -> Option<Statuses> {
    let waiter = current_thread();
    let waiter = waiter.as_ref();

    // Join the script threads running internal stages.
    let handles: Vec<_> = job.script_threads.borrow().clone();
    for handle in handles {
        let finished = match waiter {
            Some(w) => handle.join(w),
            None => handle.wait_for_completion(),
        };
        if finished.is_none() {
            return None;
        }
    }

    for p in &job.processes {
        if p.is_completed() {
            continue;
        }
        if p.is_internal() {
            let internal = p.internal_proc.borrow().clone();
            let internal = internal.expect("Internal process was never launched");
            assert!(internal.exited(), "Internal process has not exited after join");
            p.status.update(&internal.get_status());
            p.completed.store(true);
            continue;
        }

        let Some(pid) = p.pid() else {
            // Never launched (e.g. fork failure); treat as completed with an error.
            p.status.update(&ProcStatus::from_exit_code(STATUS_CMD_ERROR));
            p.completed.store(true);
            continue;
        };

        // Release the GIL across the blocking waitpid; another script thread may freely execute
        // and mutate globals in the meantime.
        if let Some(w) = waiter {
            gil().release(w);
        }
        let mut status: libc::c_int = 0;
        let ret = loop {
            let ret = unsafe { libc::waitpid(pid.as_pid_t(), &mut status, libc::WUNTRACED) };
            if ret < 0 && errno::errno().0 == EINTR {
                continue;
            }
            break ret;
        };
        if let Some(w) = waiter {
            gil().run(w);
        }

        if ret == pid.as_pid_t() {
            let proc_status = ProcStatus::from_waitpid(status);
            if proc_status.stopped() {
                p.stopped.store(true);
                FLOGF!(
                    proc_reap_external,
                    "Process %d stopped by signal %d",
                    pid.get(),
                    proc_status.stop_code()
                );
                continue;
            }
            if proc_status.signal_exited() {
                job.group()
                    .cancel_with_signal(Signal::new(proc_status.signal_code()));
            }
            p.status.update(&proc_status);
            p.completed.store(true);
            FLOGF!(
                proc_reap_external,
                "Reaped external process %d, status %d",
                pid.get(),
                proc_status.status_value()
            );

            // Record a wait handle so the process can still be waited on after the job is gone.
            if let Some(wh) = p.make_wait_handle(job.internal_job_id) {
                if !wh.is_completed() {
                    wh.set_status_and_complete(proc_status.status_value());
                }
                parser.mut_wait_handles().add(wh);
            }
        } else {
            FLOG!(warning, "waitpid failed for pid", pid.get());
            p.status.update(&ProcStatus::from_exit_code(STATUS_CMD_ERROR));
            p.completed.store(true);
        }
    }

    Some(statuses_for_job(job))
}

/// Compute the Statuses ($status / $pipestatus / kill signal) for a completed job.
fn statuses_for_job(job: &JobRef) -> Statuses {
    let mut st = Statuses {
        status: 0,
        kill_signal: None,
        pipestatus: Vec::with_capacity(job.processes.len()),
    };
    for p in &job.processes {
        st.pipestatus.push(p.status.status_value());
        if p.status.signal_exited() {
            st.kill_signal = Some(Signal::new(p.status.signal_code()));
        }
    }
    st.status = st.pipestatus.last().copied().unwrap_or(0);
    st
}

/// The core of the `wait` builtin: block the calling script thread (with the GIL released) until
/// the named background job reaches its terminal state. Returns the job's $status value, or
/// STATUS_WAIT_INTERRUPTED if we were interrupted by a signal.
pub fn job_wait(parser: &Parser, job: &JobRef) -> i32 {
    match wait_for_job(parser, job) {
        Some(statuses) => statuses.status,
        None => STATUS_WAIT_INTERRUPTED,
    }
}

/// Create the output stream for an internal process, based on its io chain.
pub fn output_stream_for_chain(chain: &IoChain) -> OutputStream {
    match chain.io_for_fd(STDOUT_FILENO) {
        None => OutputStream::Fd(FdOutputStream::new(STDOUT_FILENO)),
        Some(io) => match io.io_mode() {
            IoMode::bufferfill => OutputStream::Buffered(BufferedOutputStream::new(Arc::clone(
                io.as_bufferfill().unwrap().buffer_ref(),
            ))),
            IoMode::pipe => OutputStream::Fd(FdOutputStream::new(io.source_fd())),
        },
    }
}
