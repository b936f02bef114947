use crate::common::{exit_without_destructors, perror};
use crate::flog::FLOGF;
use crate::fork_exec::execute_fork;
use crate::future_feature_flags::{feature_test, FeatureFlag};
use crate::global_safety::RelaxedAtomicBool;
use crate::proc::{job_wants_job_control, Job, JobGroupRef, Pid};
use crate::signal::Signal;
use crate::wchar::prelude::*;
use std::cell::RefCell;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// A job id, corresponding to what is printed by `jobs`. 1 is the first valid job id.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct JobId(NonZeroU32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MaybeJobId(pub Option<JobId>);

impl std::ops::Deref for MaybeJobId {
    type Target = Option<JobId>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MaybeJobId {
    pub fn as_num(&self) -> i64 {
        self.0.map(|j| i64::from(u32::from(j.0))).unwrap_or(-1)
    }
}

impl std::fmt::Display for MaybeJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_num().fmt(f)
    }
}

/// `JobGroup` is conceptually similar to the idea of a process group. It represents data which
/// is shared among all of the "subjobs" that may be spawned by a single job.
/// For example, two fish functions in a pipeline may themselves spawn multiple jobs, but all will
/// share the same job group.
/// There is also a notion of a "internal" job group. Internal groups are used when executing a
/// foreground function or block with no pipeline. These are not jobs as the user understands them -
/// they do not consume a job id, they do not show up in job lists, and they do not have a pgid
/// because they contain no external procs. Note that `JobGroup` is shared between execution
/// threads, and so must be thread safe.
#[derive(Debug)]
pub struct JobGroup {
    /// Whether job control is enabled in this `JobGroup` or not.
    job_control: bool,
    /// Whether we should tcsetpgrp the job when it runs in the foreground. Should be checked
    /// via [`Self::wants_terminal()`] only.
    wants_term: bool,
    /// Whether we are an internal job group.
    is_internal: bool,
    /// Whether we are in the foreground, meaning the user is waiting for this job to complete.
    pub is_foreground: RelaxedAtomicBool,
    /// The pgid leading our group. This may be fish's own pgid, if the group contains no external
    /// process which leads it. We ensure the value (when set) is always non-negative.
    pgid: RefCell<Option<Pid>>,
    /// Whether fish forked a placeholder process solely to own our pgid. If so that process must
    /// be reaped exactly once when we are dropped.
    owns_pgid: RelaxedAtomicBool,
    /// The original command which produced this job tree.
    pub command: WString,
    /// Our job id, if any. "Simple block" groups like function calls do not have a job id.
    pub job_id: MaybeJobId,
    /// The signal causing the group to cancel or `0` if none.
    /// Not using an `Option<Signal>` to be able to atomically load/store to this field.
    signal: AtomicI32,
}

// safety: all fields without interior mutability are only written to once, during construction.
unsafe impl Send for JobGroup {}
unsafe impl Sync for JobGroup {}

impl JobGroup {
    /// Whether this job wants job control.
    pub fn wants_job_control(&self) -> bool {
        self.job_control
    }

    /// Whether this is an internal group.
    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    /// If this job should own the terminal when it runs. True only if both [`Self::wants_term`] and
    /// [`Self::is_foreground`] are true.
    pub fn wants_terminal(&self) -> bool {
        self.wants_term && self.is_foreground()
    }

    /// Whether we are the currently the foreground group. Should never be true for more than one
    /// `JobGroup` at any given moment.
    pub fn is_foreground(&self) -> bool {
        self.is_foreground.load()
    }

    /// Mark whether we are in the foreground.
    pub fn set_is_foreground(&self, in_foreground: bool) {
        self.is_foreground.store(in_foreground);
    }

    /// Returns whether we have valid job id. "Simple block" groups like function calls do not.
    pub fn has_job_id(&self) -> bool {
        self.job_id.is_some()
    }

    /// Returns whether this group is awaiting a pgid.
    /// This is true for non-internal groups that don't already have a pgid.
    pub fn needs_pgid_assignment(&self) -> bool {
        !self.is_internal && self.pgid.borrow().is_none()
    }

    /// Returns whether fish forked a placeholder to own our pgid.
    pub fn owns_pgid(&self) -> bool {
        self.owns_pgid.load()
    }

    /// Gets the cancellation signal, if any.
    pub fn get_cancel_signal(&self) -> Option<Signal> {
        match self.signal.load(Ordering::Relaxed) {
            0 => None,
            s => Some(Signal::new(s)),
        }
    }

    /// Mark that a process in this group got a signal and should cancel.
    pub fn cancel_with_signal(&self, signal: Signal) {
        // We only assign the signal if one hasn't yet been assigned. This means the first signal to
        // register wins over any that come later.
        self.signal
            .compare_exchange(0, signal.code(), Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    /// Set the pgid for this job group, latching it to this value.
    /// The pgid should not already have been set.
    /// Of course this does not keep the pgid alive by itself.
    /// An internal job group does not have a pgid and it is an error to set one.
    ///
    /// We need not be concerned about thread safety. JobGroups are shared between threads, but
    /// their pgid is set at most once, before the group is visible to other execution threads.
    pub fn set_pgid(&self, pgid: libc::pid_t) {
        assert!(
            self.needs_pgid_assignment(),
            "We should not be setting a pgid"
        );
        assert!(pgid >= 0, "Invalid pgid");
        self.pgid.replace(Pid::new(pgid));
    }

    /// Returns the value of the pgid, or `None` if it has not been set.
    pub fn get_pgid(&self) -> Option<Pid> {
        *self.pgid.borrow()
    }
}

/// Basic thread-safe sorted vector of job ids currently in use.
///
/// In the C++ codebase, this was deliberately leaked to avoid destructor ordering issues. Rust
/// automatically "leaks" all `static` variables (does not call their `Drop` impls) because of the
/// inherent difficulty in doing that correctly.
static CONSUMED_JOB_IDS: Mutex<Vec<JobId>> = Mutex::new(Vec::new());

impl JobId {
    pub const NONE: MaybeJobId = MaybeJobId(None);

    /// Return a `JobId` that is greater than all extant job ids stored in [`CONSUMED_JOB_IDS`].
    /// The `JobId` should be freed with [`JobId::release()`] when it is no longer in use.
    fn acquire() -> JobId {
        let mut consumed_job_ids = CONSUMED_JOB_IDS.lock().expect("Poisoned mutex!");

        // The new job id should be greater than the largest currently used id. The job ids
        // in CONSUMED_JOB_IDS are sorted in ascending order, so we just have to check the last.
        let job_id = consumed_job_ids
            .last()
            .map(JobId::next)
            .unwrap_or(JobId(1.try_into().unwrap()));
        consumed_job_ids.push(job_id);
        job_id
    }

    /// Remove the provided `JobId` from [`CONSUMED_JOB_IDS`].
    fn release(id: JobId) {
        let mut consumed_job_ids = CONSUMED_JOB_IDS.lock().expect("Poisoned mutex!");

        let pos = consumed_job_ids
            .binary_search(&id)
            .expect("Job id was not in use!");
        consumed_job_ids.remove(pos);
    }

    /// Increments the internal id and returns it wrapped in a new `JobId`.
    fn next(&self) -> JobId {
        JobId(self.0.checked_add(1).expect("Job id overflow!"))
    }
}

impl JobGroup {
    fn new(command: WString, id: MaybeJobId, job_control: bool, wants_term: bool, is_internal: bool) -> Self {
        // We *can* have a job id without job control, but not the reverse.
        if job_control {
            assert!(id.is_some(), "Cannot have job control without a job id!");
        }
        if is_internal {
            assert!(id.is_none(), "Internal groups do not have job ids!");
        }

        Self {
            job_id: id,
            job_control,
            wants_term,
            is_internal,
            command,
            signal: 0.into(),
            is_foreground: RelaxedAtomicBool::new(false),
            pgid: RefCell::default(),
            owns_pgid: RelaxedAtomicBool::new(false),
        }
    }
}

impl Drop for JobGroup {
    fn drop(&mut self) {
        if self.owns_pgid() {
            // We own the pgid; waitpid() on its placeholder holder.
            let pgid = self.get_pgid().expect("owns_pgid but no pgid").as_pid_t();
            let mut status = -1;
            if unsafe { libc::waitpid(pgid, &mut status, 0) } < 0 {
                perror("waitpid");
            }
        }
        if let Some(job_id) = *self.job_id {
            JobId::release(job_id);
        }
    }
}

/// Return a new pid which can serve as a pgroup owner.
/// The child process exits immediately.
fn create_owned_pgid(cmd: &wstr) -> libc::pid_t {
    let pid = execute_fork();
    assert!(pid >= 0, "execute_fork should never return an invalid pid");
    if pid == 0 {
        // The child can just exit directly; all we need is a pid whose reaping we can defer.
        exit_without_destructors(0);
    }
    if unsafe { libc::setpgid(pid, pid) } != 0 {
        perror("setpgid");
    }
    FLOGF!(
        exec_fork,
        "Fork %d to act as pgroup owner for '%ls'",
        pid,
        cmd
    );
    pid
}

/// Given a job and a proposed job group (possibly none), populate the job's group field.
/// The proposed group is the group from the parent job, or none if this is a root.
pub fn populate_group_for_job(job: &mut Job, proposed: Option<&JobGroupRef>) {
    assert!(job.group.is_none(), "Job already has a group");
    // Note there's three cases to consider:
    //  None            -> this is a root job, there is no inherited job group
    //  internal        -> the parent is running as part of a simple function execution
    //                      We may need to create a new job group if we are going to fork.
    //  non-internal    -> we are running as part of a real pipeline
    // Decide if this job can use an internal group.
    // This is true if it's a simple foreground execution of an internal proc.
    let initial_bg = job.is_initially_background();
    let first_proc_internal = job.processes.first().is_some_and(|p| p.is_internal());
    let can_use_internal = !initial_bg && job.processes.len() == 1 && first_proc_internal;

    let needs_new_group = match proposed {
        // We don't have a group yet.
        None => true,
        // Background jobs always get a new group.
        _ if initial_bg => true,
        // We cannot use the internal group for this job.
        Some(group) if group.is_internal() && !can_use_internal => true,
        Some(_) => false,
    };

    job.mut_flags().is_group_root = needs_new_group;

    if !needs_new_group {
        job.group = proposed.cloned();
        return;
    }

    let job_control = job_wants_job_control() && !can_use_internal;
    let wants_term = job_control && !job.from_event_handler();
    let id = if can_use_internal {
        JobId::NONE
    } else {
        MaybeJobId(Some(JobId::acquire()))
    };
    let group = JobGroup::new(
        job.command().to_owned(),
        id,
        job_control,
        wants_term,
        can_use_internal,
    );

    // Mark if it's foreground.
    group.set_is_foreground(!initial_bg);

    // Perhaps this job should immediately live in fish's pgroup.
    // There's two reasons why it may be so:
    //  1. The job doesn't need job control.
    //  2. The first process in the job is internal to fish; this needs to own the tty.
    if !can_use_internal && (!job_control || first_proc_internal) {
        group.set_pgid(unsafe { libc::getpgrp() });
    }

    // Perhaps we should fork a process for this job immediately.
    // This happens if concurrent execution is enabled, and our job contains at least one
    // internal process. It's important that all processes end up in the same process group
    // so that signal delivery works.
    // TODO: in principle this could be deferred until it is needed. Certain pipelines may never
    // even need a pgroup.
    if feature_test(FeatureFlag::Concurrent)
        && group.get_pgid().is_none()
        && job.processes.len() > 1
        && job.has_internal_proc()
    {
        group.set_pgid(create_owned_pgid(job.command()));
        group.owns_pgid.store(true);
    }

    job.group = Some(Arc::new(group));
}
