//! The process and job model: everything the execution core knows about a pipeline of processes,
//! internal or external, and its status.

use crate::flog::{FLOG, FLOGF};
use crate::gil::ExecTld;
use crate::global_safety::RelaxedAtomicBool;
use crate::job_group::JobGroup;
use crate::signal::Signal;
use crate::wait_handle::{InternalJobId, WaitHandleRef};
use crate::wchar::prelude::*;
use libc::{SIG_IGN, SIGTTOU, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WTERMSIG, WSTOPSIG};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::num::NonZeroI32;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit status of a successful command.
pub const STATUS_CMD_OK: i32 = 0;
/// Generic exit status of a failed command.
pub const STATUS_CMD_ERROR: i32 = 1;
/// Exit status when a command substitution buffered more output than the limit allows.
pub const STATUS_READ_TOO_MUCH: i32 = 122;
/// Exit status of `wait` when it is interrupted by a signal.
pub const STATUS_WAIT_INTERRUPTED: i32 = 124;
/// Exit status when a command was found but could not be executed.
pub const STATUS_NOT_EXECUTABLE: i32 = 126;
/// Exit status when a command could not be found.
pub const STATUS_CMD_UNKNOWN: i32 = 127;

/// Types of processes.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub enum ProcessType {
    /// A regular external command.
    #[default]
    external,
    /// A builtin command.
    builtin,
    /// A shellscript function.
    function,
    /// A block of commands, represented as a node.
    block_node,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    all,
    interactive,
    none,
}

impl TryFrom<&wstr> for JobControl {
    type Error = ();

    fn try_from(value: &wstr) -> Result<Self, Self::Error> {
        if value == "full" {
            Ok(JobControl::all)
        } else if value == "interactive" {
            Ok(JobControl::interactive)
        } else if value == "none" {
            Ok(JobControl::none)
        } else {
            Err(())
        }
    }
}

/// The current job control mode.
///
/// Must be one of JobControl::all, JobControl::interactive and JobControl::none.
pub fn get_job_control_mode() -> JobControl {
    unsafe { std::mem::transmute(JOB_CONTROL_MODE.load(Ordering::Relaxed)) }
}

pub fn set_job_control_mode(mode: JobControl) {
    JOB_CONTROL_MODE.store(mode as u8, Ordering::Relaxed);

    // HACK: when fish (or any shell) launches a job with job control, it will put the job into its
    // own pgroup and call tcsetpgrp() to allow that pgroup to own the terminal (making fish a
    // background process). When the job finishes, fish will try to reclaim the terminal via
    // tcsetpgrp(), but as fish is now a background process it will receive SIGTTOU and stop! Ensure
    // that doesn't happen by ignoring SIGTTOU.
    if mode == JobControl::all {
        unsafe {
            libc::signal(SIGTTOU, SIG_IGN);
        }
    }
}
static JOB_CONTROL_MODE: AtomicU8 = AtomicU8::new(JobControl::interactive as u8);

/// Whether we are an interactive session, e.g. reading commands from a tty.
static IS_INTERACTIVE_SESSION: AtomicBool = AtomicBool::new(false);

pub fn is_interactive_session() -> bool {
    IS_INTERACTIVE_SESSION.load(Ordering::Relaxed)
}

pub fn set_interactive_session(flag: bool) {
    IS_INTERACTIVE_SESSION.store(flag, Ordering::Relaxed);
}

/// Return whether a job launched now should use job control, per the current mode.
pub fn job_wants_job_control() -> bool {
    match get_job_control_mode() {
        JobControl::all => true,
        JobControl::interactive => is_interactive_session(),
        JobControl::none => false,
    }
}

pub type JobGroupRef = Arc<JobGroup>;

/// A ProcStatus is a value type that encapsulates logic around exited vs stopped vs signaled,
/// etc.
///
/// It contains two fields packed into an AtomicU64 to allow interior mutability, `status: i32` and
/// `empty: bool`.
#[derive(Default)]
pub struct ProcStatus {
    value: AtomicU64,
}

impl Clone for ProcStatus {
    fn clone(&self) -> Self {
        Self {
            value: AtomicU64::new(self.value.load(Ordering::Relaxed)),
        }
    }
}

impl ProcStatus {
    fn new(status: i32, empty: bool) -> Self {
        ProcStatus {
            value: Self::to_u64(status, empty).into(),
        }
    }

    /// Returns the raw `i32` status value.
    fn status(&self) -> i32 {
        Self::from_u64(self.value.load(Ordering::Relaxed)).0
    }

    /// Returns the `empty` field.
    ///
    /// If `empty` is `true` then there is no actual status to report (e.g. background or variable
    /// assignment).
    pub fn is_empty(&self) -> bool {
        Self::from_u64(self.value.load(Ordering::Relaxed)).1
    }

    /// Replace the current `ProcStatus` with that of `other`.
    pub fn update(&self, other: &ProcStatus) {
        self.value
            .store(other.value.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn to_u64(status: i32, empty: bool) -> u64 {
        (u64::from(empty) << 32) | u64::from(status as u32)
    }

    fn from_u64(bits: u64) -> (i32, bool) {
        let status = bits as u32 as i32;
        let empty = (bits >> 32) != 0;
        (status, empty)
    }

    /// Encode a return value `ret` and signal `sig` into a status value like waitpid() does.
    const fn w_exitcode(ret: i32, sig: i32) -> i32 {
        #[cfg(HAVE_WAITSTATUS_SIGNAL_RET)]
        // It's encoded signal and then status
        // The return status is in the lower byte.
        return (sig << 8) | ret;
        #[cfg(not(HAVE_WAITSTATUS_SIGNAL_RET))]
        // The status is encoded in the upper byte.
        // This should be W_EXITCODE(ret, sig) but that's not available everywhere.
        return (ret << 8) | sig;
    }

    /// Construct from a status returned from a waitpid call.
    pub fn from_waitpid(status: i32) -> ProcStatus {
        ProcStatus::new(status, false)
    }

    /// Construct directly from an exit code.
    pub fn from_exit_code(ret: i32) -> ProcStatus {
        assert!(
            ret >= 0,
            "trying to create ProcStatus from failed waitpid() call or invalid exit code!"
        );

        // Some paranoia.
        const _zerocode: i32 = ProcStatus::w_exitcode(0, 0);
        const _: () = assert!(
            WIFEXITED(_zerocode),
            "Synthetic exit status not reported as exited"
        );

        assert!(ret < 256);
        ProcStatus::new(Self::w_exitcode(ret, 0 /* sig */), false)
    }

    /// Construct directly from a signal.
    pub fn from_signal(signal: Signal) -> ProcStatus {
        ProcStatus::new(Self::w_exitcode(0 /* ret */, signal.code()), false)
    }

    /// Construct an empty status_t (e.g. `set foo bar`).
    pub fn empty() -> ProcStatus {
        let empty = true;
        ProcStatus::new(0, empty)
    }

    /// Return if we are stopped (as in SIGSTOP).
    pub fn stopped(&self) -> bool {
        WIFSTOPPED(self.status())
    }

    /// Return if we exited normally (not a signal).
    pub fn normal_exited(&self) -> bool {
        WIFEXITED(self.status())
    }

    /// Return if we exited because of a signal.
    pub fn signal_exited(&self) -> bool {
        WIFSIGNALED(self.status())
    }

    /// Return the signal code, given that we signal exited.
    pub fn signal_code(&self) -> libc::c_int {
        assert!(self.signal_exited(), "Process is not signal exited");
        WTERMSIG(self.status())
    }

    /// Return the stop signal code, given that we are stopped.
    pub fn stop_code(&self) -> libc::c_int {
        assert!(self.stopped(), "Process is not stopped");
        WSTOPSIG(self.status())
    }

    /// Return the exit code, given that we normal exited.
    pub fn exit_code(&self) -> libc::c_int {
        assert!(self.normal_exited(), "Process is not normal exited");
        WEXITSTATUS(self.status())
    }

    /// Return if this status represents success.
    pub fn is_success(&self) -> bool {
        self.normal_exited() && self.exit_code() == 0
    }

    /// Return the value appropriate to populate $status.
    pub fn status_value(&self) -> i32 {
        if self.signal_exited() {
            128 + self.signal_code()
        } else if self.normal_exited() {
            self.exit_code()
        } else {
            panic!("Process is not exited")
        }
    }
}

/// The last job's statuses: the values for $status and $pipestatus, and the signal which killed
/// the job, if any.
#[derive(Clone, Debug, Default)]
pub struct Statuses {
    /// Status of the last job to exit.
    pub status: i32,

    /// Signal from the most recent process in the last job that was terminated by a signal.
    /// None if all processes exited normally.
    pub kill_signal: Option<Signal>,

    /// Pipestatus value.
    pub pipestatus: Vec<i32>,
}

impl Statuses {
    /// Return a Statuses for a single process with the given status value.
    pub fn just(status: i32) -> Statuses {
        Statuses {
            status,
            kill_signal: None,
            pipestatus: vec![status],
        }
    }
}

/// The statuses of the last job, logically per execution thread. The accessors read and write the
/// published value; the scheduler swaps it as execution threads are dispatched.
static LAST_STATUSES: Lazy<ExecTld<Statuses>> = Lazy::new(|| ExecTld::new(Statuses::just(0)));

pub fn proc_get_last_statuses() -> Statuses {
    LAST_STATUSES.get()
}

pub fn proc_set_last_statuses(statuses: Statuses) {
    LAST_STATUSES.set(statuses);
}

/// Initialize the process subsystem. Must run before any execution thread is spawned, so that the
/// per-thread status holder is registered with the scheduler in time to see every spawn.
pub fn proc_init() {
    Lazy::force(&LAST_STATUSES);
}

/// A pid. Always positive.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pid(NonZeroI32);

impl Pid {
    pub fn new(pid: i32) -> Option<Pid> {
        if pid > 0 {
            Some(Pid(NonZeroI32::new(pid).unwrap()))
        } else {
            None
        }
    }
    pub fn get(&self) -> i32 {
        self.0.get()
    }
    pub fn as_pid_t(&self) -> libc::pid_t {
        self.get()
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A structure representing a "process" internal to fish. This is backed by an execution thread
/// instead of a separate process.
pub struct InternalProc {
    /// An identifier for internal processes.
    /// This is used for logging purposes only.
    internal_proc_id: u64,

    /// Whether the process has exited.
    exited: AtomicBool,

    /// If the process has exited, its status code.
    status: ProcStatus,
}

impl InternalProc {
    pub fn new() -> Self {
        static NEXT_PROC_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            internal_proc_id: NEXT_PROC_ID.fetch_add(1, Ordering::SeqCst),
            exited: AtomicBool::new(false),
            status: ProcStatus::default(),
        }
    }

    /// Return if this process has exited.
    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Mark this process as exited with the given status.
    pub fn mark_exited(&self, status: &ProcStatus) {
        assert!(!self.exited(), "Process already exited");
        self.status.update(status);
        self.exited.store(true, Ordering::Release);
        FLOGF!(
            proc_internal_proc,
            "Internal proc %llu exited with status %d",
            self.internal_proc_id,
            status.status_value()
        );
    }

    pub fn get_status(&self) -> ProcStatus {
        assert!(self.exited(), "Process has not exited");
        self.status.clone()
    }

    pub fn get_id(&self) -> u64 {
        self.internal_proc_id
    }
}

/// The body of an internal process: the code a function, block or builtin stage runs. The parser
/// and AST live outside this crate; they hand us the body as a callable.
pub type InternalProcBody =
    Box<dyn FnOnce(&crate::parser::Parser, &crate::io::IoChain) -> ProcStatus + Send>;

/// A structure representing a single process in a job.
///
/// If the process is of type external, argv is the argument array and argv[0] the command to
/// execute. If it is a function or block, the body is run by an execution thread branched from
/// the spawning parser.
#[derive(Default)]
pub struct Process {
    /// Note whether we are the first and/or last in the job
    pub is_first_in_job: bool,
    pub is_last_in_job: bool,

    /// Type of process.
    pub typ: ProcessType,

    /// Process ID, represented as an AtomicI32. This is actually an Option<AtomicNonZeroI32> with a
    /// value of zero representing `None`.
    pid: AtomicI32,

    /// If we are an "internal process," that process.
    pub internal_proc: RefCell<Option<Arc<InternalProc>>>,

    /// For internal processes, the body to execute. Taken when the process launches.
    pub body: RefCell<Option<InternalProcBody>>,

    /// File descriptor that pipe output should bind to.
    pub pipe_write_fd: RawFd,

    /// True if process has completed.
    pub completed: RelaxedAtomicBool,

    /// True if process has stopped.
    pub stopped: RelaxedAtomicBool,

    /// If set, this process is (or will become) the pgroup leader.
    /// This is only meaningful for external processes.
    pub leads_pgrp: bool,

    /// Reported status value.
    pub status: ProcStatus,

    argv: Vec<WString>,

    // The wait handle. This is constructed lazily, and cached.
    wait_handle: RefCell<Option<WaitHandleRef>>,
}

impl Process {
    pub fn new() -> Self {
        Default::default()
    }

    /// Retrieves the associated [`libc::pid_t`], `None` if unset.
    pub fn pid(&self) -> Option<Pid> {
        Pid::new(self.pid.load(Ordering::Relaxed))
    }

    pub fn has_pid(&self) -> bool {
        self.pid().is_some()
    }

    /// Sets the process' pid. Panics if a pid has already been set.
    pub fn set_pid(&self, pid: Pid) {
        let old = self.pid.swap(pid.get(), Ordering::Relaxed);
        assert!(old == 0, "Process::set_pid() called more than once!");
    }

    pub fn set_argv(&mut self, argv: Vec<WString>) {
        self.argv = argv;
    }

    pub fn argv(&self) -> &Vec<WString> {
        &self.argv
    }

    pub fn argv0(&self) -> Option<&wstr> {
        self.argv.first().map(|s| s.as_utfstr())
    }

    /// Return whether this process type is internal (block, function, or builtin).
    pub fn is_internal(&self) -> bool {
        match self.typ {
            ProcessType::builtin | ProcessType::function | ProcessType::block_node => true,
            ProcessType::external => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load()
    }

    /// Return the wait handle for the process, if it exists.
    pub fn get_wait_handle(&self) -> Option<WaitHandleRef> {
        self.wait_handle.borrow().clone()
    }

    /// Create a wait handle for the process. As a process may only have one wait handle, this may
    /// return the existing one.
    pub fn make_wait_handle(&self, jid: InternalJobId) -> Option<WaitHandleRef> {
        if self.typ != ProcessType::external {
            return None;
        }
        let pid = self.pid()?;
        let mut wh = self.wait_handle.borrow_mut();
        if wh.is_none() {
            let base_name = self
                .argv0()
                .map(|argv0| match argv0.as_char_slice().iter().rposition(|&c| c == '/') {
                    Some(pos) => argv0[pos + 1..].to_owned(),
                    None => argv0.to_owned(),
                })
                .unwrap_or_default();
            *wh = Some(crate::wait_handle::WaitHandle::new(pid, jid, base_name));
        }
        wh.clone()
    }
}

pub type ProcessPtr = Box<Process>;
pub type ProcessList = Vec<ProcessPtr>;

/// A set of jobs properties. These are immutable: they do not change for the lifetime of the
/// job.
#[derive(Default, Clone, Copy)]
pub struct JobProperties {
    /// Whether the specified job is a part of a subshell, event handler or some other form of
    /// special job that should not be reported.
    pub skip_notification: bool,

    /// Whether the job had the background ampersand when constructed, e.g. /bin/echo foo &
    /// Note that a job may move between foreground and background; this just describes what the
    /// initial state should be.
    pub initial_background: bool,

    /// Whether this job was created as part of an event handler.
    pub from_event_handler: bool,
}

/// Flags associated with the job.
#[derive(Default)]
pub struct JobFlags {
    /// Whether the specified job is completely constructed: every process in the job has been
    /// forked, etc.
    pub constructed: bool,

    /// Whether the user has been notified that this job is stopped (if it is).
    pub notified_of_stop: bool,

    /// This job is disowned, and should be removed from the active jobs list.
    pub disown_requested: bool,

    // Indicates that we are the "group root." Any other jobs using this tree are nested.
    pub is_group_root: bool,
}

/// A struct representing a job. A job is a pipeline of one or more processes.
#[derive(Default)]
pub struct Job {
    /// Set of immutable job properties.
    properties: JobProperties,

    /// The original command which led to the creation of this job. It is used for displaying
    /// messages about job status on the terminal.
    command_str: WString,

    /// All the processes in this job.
    pub processes: ProcessList,

    // The group containing this job.
    // This is never cleared.
    pub group: Option<JobGroupRef>,

    /// A non-user-visible, never-recycled job ID.
    pub internal_job_id: InternalJobId,

    /// The script threads running this job's internal processes concurrently, if any.
    /// These are what `wait` joins for jobs with no external process.
    pub script_threads: RefCell<Vec<crate::parser::ScriptThreadRef>>,

    /// Flags associated with the job.
    pub job_flags: RefCell<JobFlags>,
}

// Safety: a Job is only read or mutated by its owning execution thread while that thread holds
// the GIL; the fields with interior mutability are never touched off-thread.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    pub fn new(properties: JobProperties, command_str: WString) -> Self {
        static NEXT_INTERNAL_JOB_ID: AtomicU64 = AtomicU64::new(0);
        Job {
            properties,
            command_str,
            internal_job_id: 1 + NEXT_INTERNAL_JOB_ID.fetch_add(1, Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Returns the job group.
    pub fn group(&self) -> &JobGroup {
        self.group.as_ref().unwrap()
    }

    /// Return our job group if we have one.
    pub fn get_job_group(&self) -> Option<&JobGroupRef> {
        self.group.as_ref()
    }

    /// Returns the command.
    pub fn command(&self) -> &wstr {
        &self.command_str
    }

    /// Returns the pgid for the job, based on the job group.
    /// This may be none if the job consists of just internal fish functions or builtins.
    pub fn get_pgid(&self) -> Option<Pid> {
        self.group().get_pgid()
    }

    /// Returns the job id, or none.
    pub fn job_id(&self) -> crate::job_group::MaybeJobId {
        self.group().job_id
    }

    pub fn flags(&self) -> std::cell::Ref<'_, JobFlags> {
        self.job_flags.borrow()
    }

    pub fn mut_flags(&self) -> std::cell::RefMut<'_, JobFlags> {
        self.job_flags.borrow_mut()
    }

    /// Return whether this job wants job control, according to its group.
    pub fn wants_job_control(&self) -> bool {
        self.group().wants_job_control()
    }

    /// Return whether this job is initially going to run in the background, because & was
    /// specified.
    pub fn is_initially_background(&self) -> bool {
        self.properties.initial_background
    }

    pub fn from_event_handler(&self) -> bool {
        self.properties.from_event_handler
    }

    pub fn skip_notification(&self) -> bool {
        self.properties.skip_notification
    }

    /// Mark this job as constructed. The job must not have previously been marked constructed.
    pub fn mark_constructed(&self) {
        assert!(!self.is_constructed(), "Job was already constructed");
        self.mut_flags().constructed = true;
    }

    pub fn is_constructed(&self) -> bool {
        self.flags().constructed
    }

    /// Return whether this job has at least one internal process.
    pub fn has_internal_proc(&self) -> bool {
        self.processes.iter().any(|p| p.is_internal())
    }

    /// Return whether this job has at least one external process.
    pub fn has_external_proc(&self) -> bool {
        self.processes.iter().any(|p| !p.is_internal())
    }

    /// The job is complete if all its processes are complete.
    pub fn is_completed(&self) -> bool {
        assert!(!self.processes.is_empty());
        self.processes.iter().all(|p| p.is_completed())
    }

    /// The job is stopped if it is not completed and every non-completed process is stopped.
    pub fn is_stopped(&self) -> bool {
        !self.is_completed()
            && self
                .processes
                .iter()
                .all(|p| p.is_completed() || p.is_stopped())
    }

    /// Return whether this job is in the foreground.
    pub fn is_foreground(&self) -> bool {
        self.group().is_foreground()
    }

    /// Return true if we should report process exit events.
    pub fn is_visible(&self) -> bool {
        !self.is_completed() && self.is_constructed() && !self.flags().disown_requested
    }

    /// Send the specified signal to all processes in this job.
    /// Return true on success, false on failure.
    pub fn signal(&self, signal: i32) -> bool {
        if let Some(pgid) = self.get_pgid() {
            if unsafe { libc::killpg(pgid.as_pid_t(), signal) } == -1 {
                let strsignal = unsafe { libc::strsignal(signal) };
                let strsignal = if strsignal.is_null() {
                    "(nil)".to_string()
                } else {
                    unsafe { std::ffi::CStr::from_ptr(strsignal) }
                        .to_string_lossy()
                        .to_string()
                };
                FLOG!(error, "killpg", pgid, strsignal, "returned -1");
                return false;
            }
        } else {
            // This job lives in fish's pgroup and we need to signal procs individually.
            for p in &self.processes {
                if !p.is_completed() {
                    if let Some(pid) = p.pid() {
                        if unsafe { libc::kill(pid.as_pid_t(), signal) } == -1 {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Yield the pids of the job's processes, in order.
    pub fn pids(&self) -> Vec<Pid> {
        self.processes.iter().filter_map(|p| p.pid()).collect()
    }
}

pub type JobRef = Arc<Job>;

// List of jobs.
pub type JobList = Vec<JobRef>;
