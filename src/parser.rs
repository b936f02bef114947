//! The Parser: the state container for one unit of script execution.
//!
//! Each Parser is owned by exactly one execution thread at a time, and its state is only read or
//! mutated by that thread while it holds the GIL. Branching a parser produces a child seeded from
//! a defined subset of the parent's state; this is the mechanism underlying subshells and
//! concurrently executing pipeline stages.

use crate::chdir::{locking_fchdir, DirFd};
use crate::common::perror;
use crate::env::{EnvMode, EnvStack};
use crate::fds::{open_dir, wopen_dir, BEST_O_SEARCH};
use crate::flog::FLOG;
use crate::gil::{gil, GilThread, GilThreadRef};
use crate::proc::{
    proc_get_last_statuses, proc_set_last_statuses, JobList, JobRef, ProcStatus, Statuses,
};
use crate::threads;
use crate::wait_handle::WaitHandleStore;
use crate::wchar::prelude::*;
use std::cell::{Ref, RefCell, RefMut};
use std::ffi::CStr;
use std::sync::{Arc, Condvar, Mutex};

/// Types of blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockType {
    /// Outermost block.
    top,
    /// Block created by the . (source) builtin.
    source,
    /// Block created by a function call.
    function_call,
    /// Block created by a begin...end statement, or an if/while/for body.
    begin,
    /// Block running as a subshell on its own execution thread.
    subshell,
}

/// Block represents a block of commands. The block list is our backtrace: the description of the
/// innermost blocks, newest last, is what a fish_trace or error message would print.
pub struct Block {
    /// The type of block.
    block_type: BlockType,

    /// Name of the function this block is executing, if any.
    pub function_name: WString,
}

impl Block {
    pub fn new(block_type: BlockType) -> Self {
        Self {
            block_type,
            function_name: WString::new(),
        }
    }

    pub fn typ(&self) -> BlockType {
        self.block_type
    }

    pub fn is_function_call(&self) -> bool {
        self.block_type == BlockType::function_call
    }

    /// Whether the block pushed a variable scope that must be popped with it.
    pub fn wants_pop_env(&self) -> bool {
        !matches!(self.block_type, BlockType::top)
    }

    pub fn description(&self) -> WString {
        match self.block_type {
            BlockType::top => L!("top").to_owned(),
            BlockType::source => L!("source").to_owned(),
            BlockType::function_call => {
                let mut result = L!("function ").to_owned();
                result.push_utfstr(&self.function_name);
                result
            }
            BlockType::begin => L!("begin").to_owned(),
            BlockType::subshell => L!("subshell").to_owned(),
        }
    }
}

/// Miscellaneous data used to avoid recursion and others.
pub struct LibraryData {
    /// The current working directory of this parser, as an opened directory handle.
    /// This is what fork and fchdir use; $PWD is derived from it.
    pub cwd_fd: Option<DirFd>,

    /// The depth of recursion of nested blocks.
    pub eval_level: isize,
}

impl LibraryData {
    pub fn new() -> Self {
        Self {
            cwd_fd: None,
            eval_level: -1,
        }
    }
}

pub struct Parser {
    /// The jobs associated with this parser.
    job_list: RefCell<JobList>,

    /// Our store of recorded wait-handles. These are jobs that finished in the background,
    /// and have been reaped, but may still be wait'ed on.
    wait_handles: RefCell<WaitHandleStore>,

    /// The list of blocks.
    /// This is a stack; the topmost block is at the end. This is to avoid invalidating block
    /// indexes during recursive evaluation.
    block_list: RefCell<Vec<Block>>,

    /// Set of variables for the parser.
    pub variables: Arc<EnvStack>,

    /// Miscellaneous library data.
    library_data: RefCell<LibraryData>,
}

// Safety: Parser state is only read or mutated by its owning execution thread while that thread
// holds the GIL. The handle may be cloned across kernel threads, but access never overlaps.
unsafe impl Send for Parser {}
unsafe impl Sync for Parser {}

pub type ParserRef = Arc<Parser>;

impl Parser {
    /// Create a new root parser.
    pub fn new(variables: Arc<EnvStack>) -> ParserRef {
        let result = Parser {
            job_list: RefCell::default(),
            wait_handles: RefCell::new(WaitHandleStore::new()),
            block_list: RefCell::default(),
            variables,
            library_data: RefCell::new(LibraryData::new()),
        };

        match open_dir(CStr::from_bytes_with_nul(b".\0").unwrap(), BEST_O_SEARCH) {
            Ok(fd) => {
                result.library_data.borrow_mut().cwd_fd = Some(Arc::new(fd));
            }
            Err(_) => {
                perror("Unable to open the current working directory");
            }
        }

        Arc::new(result)
    }

    /// Branch off a child parser, seeded from our state:
    ///   - our local and function-scoped variables are copied; later mutation in the child
    ///     creates child-local bindings and the parent is unaffected,
    ///   - globals, universals and the rest of the shared tables are shared by reference,
    ///   - the current working directory handle is inherited, but a later cd in the child is
    ///     not visible in the parent,
    ///   - the child's $status starts at zero.
    /// The child gets an empty job list and an empty block stack.
    pub fn branch(&self) -> ParserRef {
        let child = Parser {
            job_list: RefCell::default(),
            wait_handles: RefCell::new(WaitHandleStore::new()),
            block_list: RefCell::default(),
            variables: Arc::new(self.variables.branch()),
            library_data: RefCell::new(LibraryData::new()),
        };
        child.library_data.borrow_mut().cwd_fd = self.library_data.borrow().cwd_fd.clone();
        Arc::new(child)
    }

    /// Adds a job to the beginning of the job list.
    pub fn job_add(&self, job: JobRef) {
        assert!(!job.processes.is_empty());
        self.jobs_mut().insert(0, job);
    }

    /// Return whether we are currently evaluating a function.
    pub fn is_function(&self) -> bool {
        self.block_list
            .borrow()
            .iter()
            .rev()
            .any(|b| b.is_function_call())
    }

    pub fn jobs(&self) -> Ref<'_, JobList> {
        self.job_list.borrow()
    }

    pub fn jobs_mut(&self) -> RefMut<'_, JobList> {
        self.job_list.borrow_mut()
    }

    /// Return the job with the given (user-visible) job id, if any.
    pub fn job_get(&self, id: crate::job_group::MaybeJobId) -> Option<JobRef> {
        self.jobs().iter().find(|j| j.job_id() == id).cloned()
    }

    /// Return the job containing the process with the given pid, if any.
    pub fn job_get_from_pid(&self, pid: crate::proc::Pid) -> Option<JobRef> {
        self.jobs()
            .iter()
            .find(|j| j.pids().contains(&pid))
            .cloned()
    }

    /// Remove completed jobs from the job list.
    pub fn remove_completed_jobs(&self) {
        self.jobs_mut()
            .retain(|j| !j.is_completed() || !j.is_constructed());
    }

    pub fn vars(&self) -> &EnvStack {
        &self.variables
    }

    pub fn libdata(&self) -> Ref<'_, LibraryData> {
        self.library_data.borrow()
    }

    pub fn libdata_mut(&self) -> RefMut<'_, LibraryData> {
        self.library_data.borrow_mut()
    }

    pub fn get_wait_handles(&self) -> Ref<'_, WaitHandleStore> {
        self.wait_handles.borrow()
    }

    pub fn mut_wait_handles(&self) -> RefMut<'_, WaitHandleStore> {
        self.wait_handles.borrow_mut()
    }

    /// Push a block onto the block stack, pushing a variable scope if the block wants one.
    /// Returns the index of the block.
    pub fn push_block(&self, block: Block) -> usize {
        if block.wants_pop_env() {
            self.variables.push(block.is_function_call());
        }
        self.library_data.borrow_mut().eval_level += 1;
        let mut blocks = self.block_list.borrow_mut();
        blocks.push(block);
        blocks.len() - 1
    }

    /// Pop the topmost block, which must be at the given index.
    pub fn pop_block(&self, expected_idx: usize) {
        let block = {
            let mut blocks = self.block_list.borrow_mut();
            assert!(blocks.len() == expected_idx + 1, "Unbalanced pop_block");
            blocks.pop().unwrap()
        };
        self.library_data.borrow_mut().eval_level -= 1;
        if block.wants_pop_env() {
            self.variables.pop();
        }
    }

    pub fn blocks_size(&self) -> usize {
        self.block_list.borrow().len()
    }

    /// Return the backtrace: descriptions of the block stack, innermost last.
    pub fn backtrace(&self) -> Vec<WString> {
        self.block_list
            .borrow()
            .iter()
            .map(|b| b.description())
            .collect()
    }

    /// Get the statuses of the last job. These are logically per execution thread; the accessors
    /// are unchanged and the scheduler swaps the values on dispatch.
    pub fn get_last_statuses(&self) -> Statuses {
        proc_get_last_statuses()
    }

    pub fn set_last_statuses(&self, s: Statuses) {
        proc_set_last_statuses(s);
    }

    /// Get the value of $status.
    pub fn get_last_status(&self) -> i32 {
        self.get_last_statuses().status
    }

    pub fn set_last_status(&self, s: i32) {
        self.set_last_statuses(Statuses::just(s));
    }

    /// Change this parser's working directory to `path`. On success the process-wide cwd is
    /// updated (serialized against other execution threads), our directory handle is replaced,
    /// and $PWD is set. On failure an errno value is returned, the cwd is unchanged and the
    /// script continues.
    pub fn change_directory(&self, path: &wstr) -> Result<(), errno::Errno> {
        let fd = wopen_dir(path, BEST_O_SEARCH).map_err(|e| errno::Errno(e as i32))?;
        let dir_fd: DirFd = Arc::new(fd);
        let _lock = locking_fchdir(&dir_fd).map_err(|e| errno::Errno(e as i32))?;
        self.library_data.borrow_mut().cwd_fd = Some(dir_fd);
        self.variables
            .set_one(L!("PWD"), EnvMode::GLOBAL | EnvMode::EXPORT, path.to_owned());
        Ok(())
    }
}

/// A handle to a script thread: one cooperatively scheduled thread of fish script, executing a
/// body against its own parser. The handle is shared between the spawner (for joining) and the
/// thread itself.
pub struct ScriptThread {
    thread: GilThreadRef,
    parser: ParserRef,
    /// Fulfilled with the body's status when the script body has returned and the thread has been
    /// destroyed through the GIL.
    completion: Arc<(Mutex<Option<ProcStatus>>, Condvar)>,
}

pub type ScriptThreadRef = Arc<ScriptThread>;

/// How long a joiner sleeps between checks for cancellation, while the GIL is released.
const JOIN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

impl ScriptThread {
    pub fn parser(&self) -> &ParserRef {
        &self.parser
    }

    pub fn thread(&self) -> &GilThreadRef {
        &self.thread
    }

    /// Return the thread's status if it has reached its terminal state.
    pub fn finished_status(&self) -> Option<ProcStatus> {
        self.completion.0.lock().unwrap().clone()
    }

    /// Block until this script thread reaches its terminal state. The waiter must currently be
    /// scheduled; the GIL is released while blocked and reacquired before returning.
    /// Returns None if interrupted by a cancellation signal, in which case $status should become
    /// STATUS_WAIT_INTERRUPTED.
    pub fn join(&self, waiter: &GilThreadRef) -> Option<ProcStatus> {
        assert!(
            gil().is_scheduled(waiter),
            "join requires the waiter to be scheduled"
        );
        gil().release(waiter);
        let result = self.wait_for_completion();
        gil().run(waiter);
        result
    }

    /// Block until completion without touching the GIL. For callers which are not script threads.
    pub fn wait_for_completion(&self) -> Option<ProcStatus> {
        let (mutex, condvar) = &*self.completion;
        let mut guard = mutex.lock().unwrap();
        loop {
            if let Some(status) = guard.clone() {
                return Some(status);
            }
            if crate::signal::signal_check_cancel() != 0 {
                return None;
            }
            guard = condvar.wait_timeout(guard, JOIN_POLL_INTERVAL).unwrap().0;
        }
    }
}

/// Spawn a script thread executing `body` against the given parser. The body runs with the GIL
/// held, starting with $status zero; it may release the GIL around blocking syscalls through the
/// usual suspension points. When the body returns, the parser's jobs are dropped, the thread is
/// destroyed through the GIL and the completion is fulfilled.
pub fn spawn_script_thread(
    parser: ParserRef,
    body: impl FnOnce(&Parser) -> ProcStatus + Send + 'static,
) -> ScriptThreadRef {
    let thread = GilThread::new();
    gil().spawn(&thread);

    let completion = Arc::new((Mutex::new(None), Condvar::new()));
    let script_thread = Arc::new(ScriptThread {
        thread: Arc::clone(&thread),
        parser: Arc::clone(&parser),
        completion: Arc::clone(&completion),
    });

    let spawned = {
        let thread = Arc::clone(&thread);
        let completion = Arc::clone(&completion);
        threads::spawn(move || {
            crate::gil::set_current_thread(&thread);
            gil().run(&thread);
            // A branched child starts with $status zero, not the parent's value at branch time.
            proc_set_last_statuses(Statuses::just(0));
            let status = body(&parser);
            // The body has returned: tear down this thread of script. Any fds owned by the parser
            // are closed as its jobs drop.
            parser.jobs_mut().clear();
            gil().release(&thread);
            gil().destroy(&thread);
            let (mutex, condvar) = &*completion;
            *mutex.lock().unwrap() = Some(status);
            condvar.notify_all();
        })
    };
    if !spawned {
        // The body will never run. Destroy the thread and complete with an error status so that
        // joiners do not hang.
        FLOG!(error, "Unable to spawn a kernel thread for a script thread");
        gil().destroy(&thread);
        let (mutex, condvar) = &*completion;
        *mutex.lock().unwrap() = Some(ProcStatus::from_exit_code(crate::proc::STATUS_CMD_ERROR));
        condvar.notify_all();
    }
    script_thread
}
