//! fish's Global Interpreter Lock, the fishgil.
//!
//! The GIL serializes "execution threads": cooperatively scheduled threads of fish script, such as
//! concurrently running functions, pipeline stages and backgrounded blocks. At most one execution
//! thread runs script at any instant. IO threads (see [`crate::threads`]) are not execution
//! threads; they never take the GIL.
//!
//! The GIL also owns the list of scheduler observers. An observer is notified as execution threads
//! are spawned, scheduled, unscheduled and destroyed; this is the mechanism by which logically
//! thread-local state - like the process-wide working directory - is swapped in and out around
//! each context switch.

use crate::flog::FLOG;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Identifies one execution thread. Monotonically assigned, never recycled.
pub type ThreadId = u64;

/// An observer of scheduling events. The default implementations do nothing, so concrete
/// observers override only the hooks they care about.
///
/// All hooks are invoked with the GIL's internal lock held, and must be infallible: they perform
/// only swaps of already-allocated state, and chdir, whose failure is logged and ignored.
/// For any context switch from thread A to thread B, `will_unschedule(A)` completes before
/// `did_schedule(B)` begins.
pub trait ScheduleObserver: Send {
    fn did_spawn(&mut self, tid: ThreadId) {
        let _ = tid;
    }
    fn will_destroy(&mut self, tid: ThreadId) {
        let _ = tid;
    }
    fn did_schedule(&mut self, tid: ThreadId) {
        let _ = tid;
    }
    fn will_unschedule(&mut self, tid: ThreadId) {
        let _ = tid;
    }
}

/// One execution thread, as known to the GIL. This is a handle: it is shared between the kernel
/// thread running the script body, the GIL's run queue, and whoever wishes to wait for the thread.
pub struct GilThread {
    tid: ThreadId,
    /// Our private monitor. We sleep on this in run() until we are scheduled.
    /// It is always used with the GIL's own mutex.
    monitor: Condvar,
}

pub type GilThreadRef = Arc<GilThread>;

static LAST_TID: AtomicU64 = AtomicU64::new(0);

impl GilThread {
    pub fn new() -> GilThreadRef {
        Arc::new(GilThread {
            tid: 1 + LAST_TID.fetch_add(1, Ordering::Relaxed),
            monitor: Condvar::new(),
        })
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }
}

#[derive(Default)]
struct GilImpl {
    /// Scheduling observers.
    observers: Vec<Box<dyn ScheduleObserver>>,

    /// List of threads blocked in run(), waiting to be scheduled.
    waitqueue: VecDeque<GilThreadRef>,

    /// The currently running thread.
    owner: Option<GilThreadRef>,
}

impl GilImpl {
    /// Schedule the next thread if nothing is scheduled.
    fn schedule_if_needed(&mut self) {
        // Do nothing if we're already scheduled, or if we have nothing to schedule.
        if self.owner.is_some() || self.waitqueue.is_empty() {
            return;
        }
        let thread = self.waitqueue.pop_front().unwrap();
        self.owner = Some(thread);
        self.owner.as_ref().unwrap().monitor.notify_one();
    }
}

pub struct Gil {
    impl_: Mutex<GilImpl>,
}

impl Gil {
    /// Construct a GIL with no observers. Most callers want the shared [`gil()`] instead.
    pub fn new() -> Self {
        Gil {
            impl_: Mutex::new(GilImpl::default()),
        }
    }

    /// Register a new execution thread. Fires `did_spawn` on every observer, with the GIL held.
    /// This does not schedule the thread; it must still call [`run()`](Self::run).
    pub fn spawn(&self, thread: &GilThreadRef) {
        let mut imp = self.impl_.lock().unwrap();
        FLOG!(gil, "spawn tid", thread.tid);
        for obs in &mut imp.observers {
            obs.did_spawn(thread.tid);
        }
    }

    /// Acquire the run lock. Upon return, the thread will be scheduled and `did_schedule` will
    /// have fired.
    pub fn run(&self, thread: &GilThreadRef) {
        let mut imp = self.impl_.lock().unwrap();
        debug_assert!(
            !imp.waitqueue.iter().any(|t| Arc::ptr_eq(t, thread)),
            "Thread is already enqueued"
        );

        // Put ourselves onto the waitqueue and wait until we are scheduled.
        imp.waitqueue.push_back(Arc::clone(thread));
        imp.schedule_if_needed();
        while !is_owner(&imp, thread) {
            imp = thread.monitor.wait(imp).unwrap();
        }
        // Note that we are now scheduled.
        FLOG!(gil, "schedule tid", thread.tid);
        for obs in &mut imp.observers {
            obs.did_schedule(thread.tid);
        }
    }

    /// Release the given thread, which must own the lock. Fires `will_unschedule`, then hands the
    /// lock to the next waiter (if any). The thread must call run() again to be rescheduled.
    pub fn release(&self, thread: &GilThreadRef) {
        let mut imp = self.impl_.lock().unwrap();
        assert!(is_owner(&imp, thread), "Thread to release was not running");
        FLOG!(gil, "unschedule tid", thread.tid);
        for obs in &mut imp.observers {
            obs.will_unschedule(thread.tid);
        }
        imp.owner = None;
        imp.schedule_if_needed();
    }

    /// Yield the given thread, which must own the lock. Upon return, the thread reacquires the
    /// lock. This goes to the back of the queue: it is not a no-op if the queue is nonempty.
    pub fn yield_thread(&self, thread: &GilThreadRef) {
        self.release(thread);
        self.run(thread);
    }

    /// Unregister an execution thread, which must be neither running nor enqueued. Fires
    /// `will_destroy` on every observer, with the GIL held.
    pub fn destroy(&self, thread: &GilThreadRef) {
        let mut imp = self.impl_.lock().unwrap();
        assert!(
            !is_owner(&imp, thread),
            "Cannot destroy a scheduled thread"
        );
        assert!(
            !imp.waitqueue.iter().any(|t| Arc::ptr_eq(t, thread)),
            "Cannot destroy an enqueued thread"
        );
        FLOG!(gil, "destroy tid", thread.tid);
        for obs in &mut imp.observers {
            obs.will_destroy(thread.tid);
        }
    }

    /// Return true if the given thread is scheduled. This is racey unless called from that
    /// thread.
    pub fn is_scheduled(&self, thread: &GilThreadRef) -> bool {
        let imp = self.impl_.lock().unwrap();
        is_owner(&imp, thread)
    }

    /// Add an observer. Observers should be registered before scheduling begins: an observer
    /// never hears `did_spawn` for threads spawned before it was added.
    pub fn add_observer(&self, obs: Box<dyn ScheduleObserver>) {
        let mut imp = self.impl_.lock().unwrap();
        imp.observers.push(obs);
    }

    /// Test hook: the number of threads blocked in run(), waiting to be scheduled.
    #[cfg(test)]
    pub(crate) fn waitqueue_len(&self) -> usize {
        self.impl_.lock().unwrap().waitqueue.len()
    }
}

fn is_owner(imp: &GilImpl, thread: &GilThreadRef) -> bool {
    imp.owner
        .as_ref()
        .is_some_and(|owner| Arc::ptr_eq(owner, thread))
}

thread_local! {
    /// The execution thread owned by this kernel thread, if any. Each execution thread runs on
    /// its own kernel thread, so plain thread local storage suffices.
    static CURRENT_THREAD: std::cell::RefCell<Option<GilThreadRef>> =
        const { std::cell::RefCell::new(None) };
}

/// Mark the given execution thread as owned by the calling kernel thread.
pub fn set_current_thread(thread: &GilThreadRef) {
    CURRENT_THREAD.with(|t| *t.borrow_mut() = Some(Arc::clone(thread)));
}

/// Return the execution thread owned by the calling kernel thread, if any. Code running outside
/// any script thread (e.g. on the main thread before scheduling begins) gets None.
pub fn current_thread() -> Option<GilThreadRef> {
    CURRENT_THREAD.with(|t| t.borrow().clone())
}

/// An explicit cooperative yield point, for long-running script loops: atomically release the GIL
/// and reacquire it, letting queued execution threads take a turn. A no-op when the caller is not
/// a script thread.
pub fn yield_point() {
    if let Some(thread) = current_thread() {
        gil().yield_thread(&thread);
    }
}

/// The shared GIL. This comes with the cwd observer installed, so each execution thread sees its
/// own working directory.
pub fn gil() -> &'static Gil {
    static GIL: once_cell::sync::Lazy<Gil> = once_cell::sync::Lazy::new(|| {
        let gil = Gil::new();
        gil.add_observer(Box::new(CwdObserver::default()));
        gil
    });
    &GIL
}

/// An observer which saves and restores the current working directory of each execution thread.
/// The cwd is process-wide state in the OS sense, but logically per execution thread.
#[derive(Default)]
struct CwdObserver {
    tid_to_pwd: HashMap<ThreadId, PathBuf>,
}

impl CwdObserver {
    fn get_current_directory() -> PathBuf {
        match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(_) => PathBuf::from("/"),
        }
    }
}

impl ScheduleObserver for CwdObserver {
    fn did_spawn(&mut self, tid: ThreadId) {
        self.tid_to_pwd.insert(tid, Self::get_current_directory());
    }

    fn will_destroy(&mut self, tid: ThreadId) {
        let erased = self.tid_to_pwd.remove(&tid);
        assert!(erased.is_some(), "tid not found in CwdObserver");
    }

    fn will_unschedule(&mut self, tid: ThreadId) {
        // Save the cwd.
        let slot = self
            .tid_to_pwd
            .get_mut(&tid)
            .expect("tid not found in CwdObserver");
        *slot = Self::get_current_directory();
    }

    fn did_schedule(&mut self, tid: ThreadId) {
        let pwd = self
            .tid_to_pwd
            .get(&tid)
            .expect("tid not found in CwdObserver");
        if let Err(err) = std::env::set_current_dir(pwd) {
            // Observer hooks are infallible; a chdir failure here leaves us in the previous
            // thread's directory until the script next calls cd.
            FLOG!(gil_observer, "chdir failed on schedule:", err);
        }
        // The fchdir serializer caches the last directory set through it; we just changed the
        // cwd behind its back.
        crate::chdir::invalidate_cached_cwd();
    }
}

/// A per-execution-thread variable holder, in the manner of thread local storage. It manages
/// copies of the variable keyed by tid, swapping the per-tid slot with the published value as
/// threads are scheduled and unscheduled. The accessors are unchanged: readers always see the
/// value belonging to the currently scheduled thread.
struct PerThreadVar<T> {
    /// Map from thread id to the (suspended) value for that thread.
    tid_to_vals: HashMap<ThreadId, T>,

    /// The published variable, shared with the owning [`ExecTld`].
    published: Arc<Mutex<T>>,
}

impl<T: Clone + Send> ScheduleObserver for PerThreadVar<T> {
    fn did_spawn(&mut self, tid: ThreadId) {
        let snapshot = self.published.lock().unwrap().clone();
        let prev = self.tid_to_vals.insert(tid, snapshot);
        assert!(
            prev.is_none(),
            "PerThreadVar should always freshly insert in did_spawn"
        );
    }

    fn will_destroy(&mut self, tid: ThreadId) {
        let erased = self.tid_to_vals.remove(&tid);
        assert!(erased.is_some(), "PerThreadVar should always have erased");
    }

    fn will_unschedule(&mut self, tid: ThreadId) {
        let slot = self
            .tid_to_vals
            .get_mut(&tid)
            .expect("tid not found in PerThreadVar::will_unschedule");
        std::mem::swap(slot, &mut *self.published.lock().unwrap());
    }

    fn did_schedule(&mut self, tid: ThreadId) {
        let slot = self
            .tid_to_vals
            .get_mut(&tid)
            .expect("tid not found in PerThreadVar::did_schedule");
        std::mem::swap(slot, &mut *self.published.lock().unwrap());
    }
}

/// A holder for a value of type T, with one logical copy per execution thread. Declaring one
/// registers a [`PerThreadVar`] observer with the shared GIL; thereafter the published value
/// tracks whichever execution thread is scheduled.
///
/// A freshly spawned thread starts with a snapshot of the value published at spawn time.
pub struct ExecTld<T> {
    published: Arc<Mutex<T>>,
}

impl<T: Clone + Send + 'static> ExecTld<T> {
    pub fn new(value: T) -> Self {
        let published = Arc::new(Mutex::new(value));
        gil().add_observer(Box::new(PerThreadVar {
            tid_to_vals: HashMap::new(),
            published: Arc::clone(&published),
        }));
        ExecTld { published }
    }

    /// Get a copy of the live value.
    pub fn get(&self) -> T {
        self.published.lock().unwrap().clone()
    }

    /// Replace the live value.
    pub fn set(&self, value: T) {
        *self.published.lock().unwrap() = value;
    }

    /// Run `f` with a reference to the live value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.published.lock().unwrap())
    }

    /// Run `f` with a mutable reference to the live value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.published.lock().unwrap())
    }
}
