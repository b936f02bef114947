//! Serializing calls to fchdir().
//!
//! The working directory is process-wide, and it must be correct at the moment we call fork() -
//! there is no 'fork_at'. Multiple execution threads may want different working directories, so
//! each caller takes a turn: callers queue up with tickets, and the current directory is cached so
//! that callers which agree on the directory can share a single hold on it.

use crate::flog::FLOG;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Condvar, Mutex};

/// A directory handle, as opened by [`crate::fds::open_dir`] with [`crate::fds::BEST_O_SEARCH`].
/// Handles are compared by identity: two opens of the same path are different directories as far
/// as the serializer is concerned.
pub type DirFd = Arc<OwnedFd>;

/// A lock holding the process-wide cwd at a particular directory.
/// The cwd may not change until every lock is dropped, so a fork() performed while holding one is
/// guaranteed to see the locked directory.
pub struct FchdirLock {
    // Not constructible outside this module.
    _priv: (),
}

impl Drop for FchdirLock {
    fn drop(&mut self) {
        shared_serializer().release_cwd_lock();
    }
}

#[derive(Default)]
struct ChdirData {
    /// The current working directory. This corresponds to the most recent *successful* call to
    /// fchdir().
    current: Option<DirFd>,

    /// Total number of locks on 'current'.
    /// The cwd is only permitted to change if lock_count is 0.
    lock_count: u32,

    /// A pair of counters for use in serializing threads.
    /// Each thread "takes a ticket" by postincrementing next_available, and only runs when it
    /// equals now_serving. The purpose of the tickets is to ensure the lock is fair: if two
    /// threads disagree on the cwd they should take turns. Note that the difference 'next_available
    /// - now_serving' is the current number of waiters.
    next_available: u64,
    now_serving: u64,
}

/// ChdirSerializer is responsible for serializing calls to fchdir().
pub struct ChdirSerializer {
    /// Data protected by the lock.
    data: Mutex<ChdirData>,

    /// A condition variable for waiting for the cwd to be released.
    /// The associated mutex is the one protecting 'data'.
    condition: Condvar,
}

impl ChdirSerializer {
    fn new() -> Self {
        ChdirSerializer {
            data: Mutex::new(ChdirData::default()),
            condition: Condvar::new(),
        }
    }

    /// Advance the now_serving ticket, if there are no locks on it.
    fn try_advance_ticket(&self, data: &mut ChdirData) {
        assert!(
            data.now_serving <= data.next_available,
            "tickets should be monotone increasing"
        );
        // Only need to post if someone is waiting.
        if data.lock_count == 0 && data.now_serving < data.next_available {
            data.now_serving += 1;
            self.condition.notify_all();
        }
    }

    /// Set the cwd to a given value, waiting until it's our turn to do so, and take a (shared)
    /// lock on it. Return an errno value if fchdir() fails, in which case no lock is taken.
    fn lock_cwd(&self, dir_fd: &DirFd) -> nix::Result<FchdirLock> {
        let mut data = self.data.lock().unwrap();

        // Very common fast path: if nobody is waiting and the current cwd already agrees, we can
        // simply bump the lock count. This way multiple users can share the lock if they agree on
        // the cwd.
        if data.current.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, dir_fd))
            && data.now_serving == data.next_available
        {
            data.lock_count += 1;
            return Ok(FchdirLock { _priv: () });
        }

        // Take a ticket and wait until it's our turn.
        assert!(
            data.now_serving <= data.next_available,
            "tickets should be monotone increasing"
        );
        let ticket = data.next_available;
        data.next_available += 1;
        while data.now_serving != ticket {
            data = self.condition.wait(data).unwrap();
        }

        // It's our turn. Invoke fchdir() if we are not already in the right directory.
        // We may want to change the lock count, it has to be zero!
        assert!(data.lock_count == 0, "Should be no locks");
        let mut result = Ok(());
        if !data.current.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, dir_fd)) {
            // Loop on EINTR.
            loop {
                result = nix::unistd::fchdir(dir_fd.as_ref());
                if result != Err(nix::Error::EINTR) {
                    break;
                }
            }

            // Save the directory if fchdir succeeded.
            if result.is_ok() {
                FLOG!(chdir_lock, "fchdir to fd", dir_fd.as_raw_fd());
                data.current = Some(Arc::clone(dir_fd));
            }
        }

        // Bump the lock count if there was no error.
        if result.is_ok() {
            data.lock_count += 1;
        }
        self.try_advance_ticket(&mut data);
        result.map(|()| FchdirLock { _priv: () })
    }

    /// Mark that a user of the cwd is finished.
    fn release_cwd_lock(&self) {
        let mut data = self.data.lock().unwrap();
        assert!(data.lock_count > 0, "Lock count should be > 0");
        data.lock_count -= 1;
        self.try_advance_ticket(&mut data);
    }

    /// Forget the cached current directory. The scheduler's cwd observer calls this when it
    /// restores a different thread's working directory with a plain chdir, which happens behind
    /// our back; without this the fast path would elide a needed fchdir. If a lock is held the
    /// cache is left alone: the lock holder's directory is still the process cwd, since holding a
    /// lock across an unschedule is not permitted.
    fn invalidate_current(&self) {
        let mut data = self.data.lock().unwrap();
        if data.lock_count == 0 {
            data.current = None;
        }
    }

    /// Test hooks: the pair (now_serving, next_available).
    #[cfg(test)]
    pub(crate) fn tickets(&self) -> (u64, u64) {
        let data = self.data.lock().unwrap();
        (data.now_serving, data.next_available)
    }
}

/// The shared chdir serializer.
fn shared_serializer() -> &'static ChdirSerializer {
    static SHARED: once_cell::sync::Lazy<ChdirSerializer> =
        once_cell::sync::Lazy::new(ChdirSerializer::new);
    &SHARED
}

/// Forget the shared serializer's cached directory. See [`ChdirSerializer::invalidate_current`].
pub(crate) fn invalidate_cached_cwd() {
    shared_serializer().invalidate_current();
}

/// Change the cwd to the given directory, serialized against other execution threads, and return
/// a lock which holds the cwd at that directory until dropped. This caches dir_fd and elides the
/// fchdir call if the cwd does not change. A caller that intends to fork must hold the lock over
/// the fork.
pub fn locking_fchdir(dir_fd: &DirFd) -> nix::Result<FchdirLock> {
    shared_serializer().lock_cwd(dir_fd)
}

#[cfg(test)]
pub(crate) fn shared_serializer_for_test() -> &'static ChdirSerializer {
    shared_serializer()
}
