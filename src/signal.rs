//! Signal handling for the execution core. Only SIGINT is a cancellation signal; the handler sets
//! a process-wide flag which cooperatively scheduled execution threads observe at their
//! suspension points.

use crate::wchar::prelude::*;
use errno::{errno, set_errno};
use std::num::NonZeroI32;
use std::sync::atomic::{AtomicI32, Ordering};

/// Store the "main" pid. This allows us to reliably determine if we are in a forked child.
static MAIN_PID: AtomicI32 = AtomicI32::new(0);

/// It's possible that we receive a signal after we have forked, but before we have reset the signal
/// handlers (or even run the pthread_atfork calls). In that event we will do something dumb like
/// swallow SIGINT. Ensure that doesn't happen. Check if we are the main fish process; if not, reset
/// and re-raise the signal. Return whether we re-raised the signal.
fn reraise_if_forked_child(sig: i32) -> bool {
    // Don't use is_forked_child: it relies on atfork handlers which may have not yet run.
    if unsafe { libc::getpid() } == MAIN_PID.load(Ordering::Relaxed) {
        return false;
    }

    // Safety: signal() and raise() are async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
    true
}

/// The cancellation signal we have received.
/// Of course this is modified from a signal handler.
static CANCELLATION_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Set the cancellation signal to zero.
pub fn signal_clear_cancel() {
    CANCELLATION_SIGNAL.store(0, Ordering::Relaxed);
}

/// Return the most recent cancellation signal received by the process.
/// Currently only SIGINT is considered a cancellation signal.
/// This is thread safe.
pub fn signal_check_cancel() -> i32 {
    CANCELLATION_SIGNAL.load(Ordering::Relaxed)
}

/// The single signal handler. By centralizing signal handling we ensure that we can never install
/// the "wrong" signal handler.
extern "C" fn fish_signal_handler(
    sig: i32,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // Ensure we preserve errno.
    let saved_errno = errno();

    // Check if we are a forked child.
    if reraise_if_forked_child(sig) {
        set_errno(saved_errno);
        return;
    }

    if sig == libc::SIGINT {
        CANCELLATION_SIGNAL.store(libc::SIGINT, Ordering::Relaxed);
    }

    set_errno(saved_errno);
}

// Wrapper around sigaction.
fn sigaction(sig: i32, act: &libc::sigaction, oact: *mut libc::sigaction) -> libc::c_int {
    // Note: historically many call sites have ignored return value of sigaction here.
    unsafe { libc::sigaction(sig, act, oact) }
}

/// Install our signal handlers. Must be called once at startup from the main process.
pub fn signal_set_handlers() {
    MAIN_PID.store(unsafe { libc::getpid() }, Ordering::Relaxed);

    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut act.sa_mask) };

    // Ignore SIGPIPE; we'll detect failed writes and deal with them appropriately.
    act.sa_flags = 0;
    act.sa_sigaction = libc::SIG_IGN;
    sigaction(libc::SIGPIPE, &act, std::ptr::null_mut());

    // Cancellation on SIGINT.
    act.sa_flags = libc::SA_SIGINFO;
    act.sa_sigaction = fish_signal_handler as usize;
    sigaction(libc::SIGINT, &act, std::ptr::null_mut());
}

/// Set all our signal handlers to SIG_DFL.
/// This is called after fork - it should be async signal safe.
pub fn signal_reset_handlers() {
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    act.sa_flags = 0;
    act.sa_sigaction = libc::SIG_DFL;

    for entry in SIGNAL_TABLE.iter() {
        unsafe {
            libc::sigaction(entry.signal.code(), &act, std::ptr::null_mut());
        };
    }
}

struct LookupEntry {
    signal: Signal,
    name: &'static wstr,
}

impl LookupEntry {
    const fn new(code: i32, name: &'static wstr) -> Self {
        Self {
            signal: Signal::new(code),
            name,
        }
    }
}

// The signals we know the names of; this is the set relevant to job control.
#[rustfmt::skip]
static SIGNAL_TABLE: &[LookupEntry] = &[
    LookupEntry::new(libc::SIGHUP, L!("SIGHUP")),
    LookupEntry::new(libc::SIGINT, L!("SIGINT")),
    LookupEntry::new(libc::SIGQUIT, L!("SIGQUIT")),
    LookupEntry::new(libc::SIGILL, L!("SIGILL")),
    LookupEntry::new(libc::SIGABRT, L!("SIGABRT")),
    LookupEntry::new(libc::SIGFPE, L!("SIGFPE")),
    LookupEntry::new(libc::SIGKILL, L!("SIGKILL")),
    LookupEntry::new(libc::SIGSEGV, L!("SIGSEGV")),
    LookupEntry::new(libc::SIGPIPE, L!("SIGPIPE")),
    LookupEntry::new(libc::SIGALRM, L!("SIGALRM")),
    LookupEntry::new(libc::SIGTERM, L!("SIGTERM")),
    LookupEntry::new(libc::SIGCHLD, L!("SIGCHLD")),
    LookupEntry::new(libc::SIGCONT, L!("SIGCONT")),
    LookupEntry::new(libc::SIGSTOP, L!("SIGSTOP")),
    LookupEntry::new(libc::SIGTSTP, L!("SIGTSTP")),
    LookupEntry::new(libc::SIGTTIN, L!("SIGTTIN")),
    LookupEntry::new(libc::SIGTTOU, L!("SIGTTOU")),
    LookupEntry::new(libc::SIGUSR1, L!("SIGUSR1")),
    LookupEntry::new(libc::SIGUSR2, L!("SIGUSR2")),
    LookupEntry::new(libc::SIGWINCH, L!("SIGWINCH")),
];

// Return true if two strings are equal, ignoring ASCII case.
fn equals_ascii_icase(left: &wstr, right: &wstr) -> bool {
    if left.len() != right.len() {
        return false;
    }
    for (lc, rc) in left.chars().zip(right.chars()) {
        if !lc.eq_ignore_ascii_case(&rc) {
            return false;
        }
    }
    true
}

/// Test if `name` is a string describing the signal named `canonical`.
fn match_signal_name(canonical: &wstr, mut name: &wstr) -> bool {
    // Skip the "SIG" prefix if it exists.
    if name.len() >= 3 && equals_ascii_icase(&name[..3], L!("sig")) {
        name = &name[3..];
    }
    equals_ascii_icase(&canonical[3..], name)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
/// A wrapper around the system signal code.
pub struct Signal(NonZeroI32);

impl Signal {
    /// Creates a new `Signal` to represent the passed system signal code `sig`.
    /// Panics if `sig` is zero.
    pub const fn new(sig: i32) -> Self {
        match NonZeroI32::new(sig) {
            None => panic!("Invalid zero signal value!"),
            Some(result) => Signal(result),
        }
    }

    /// Return the LookupEntry for ourself.
    fn get_lookup_entry(&self) -> Option<&'static LookupEntry> {
        SIGNAL_TABLE.iter().find(|entry| entry.signal == *self)
    }

    /// Get string representation of a signal.
    pub fn name(&self) -> &'static wstr {
        match self.get_lookup_entry() {
            Some(entry) => entry.name,
            None => L!("Unknown"),
        }
    }

    pub fn code(&self) -> i32 {
        self.0.into()
    }

    /// Parses a string into the equivalent [`Signal`] sharing the same name.
    /// Accepts both `SIGABC` and `ABC` to match against `Signal::SIGABC`. If the signal name is
    /// not recognized, `None` is returned. This also accepts positive integer codes.
    pub fn parse(name: &wstr) -> Option<Signal> {
        for entry in SIGNAL_TABLE.iter() {
            if match_signal_name(entry.name, name) {
                return Some(entry.signal);
            }
        }

        if let Ok(num) = name.to_string().parse::<i32>() {
            if num > 0 {
                return Some(Signal::new(num));
            }
        }
        None
    }
}

// Allow signals to be compared against i32.
impl PartialEq<i32> for Signal {
    fn eq(&self, other: &i32) -> bool {
        self.code() == *other
    }
}

impl From<Signal> for i32 {
    fn from(value: Signal) -> Self {
        value.code()
    }
}

impl From<Signal> for NonZeroI32 {
    fn from(value: Signal) -> Self {
        value.0
    }
}

#[test]
fn test_signal_name() {
    let sig = Signal::new(libc::SIGINT);
    assert_eq!(sig.name(), "SIGINT");
}

#[rustfmt::skip]
#[test]
fn test_signal_parse() {
    assert_eq!(Signal::parse(L!("SIGHUP")), Some(Signal::new(libc::SIGHUP)));
    assert_eq!(Signal::parse(L!("sigwinch")), Some(Signal::new(libc::SIGWINCH)));
    assert_eq!(Signal::parse(L!("TSTP")), Some(Signal::new(libc::SIGTSTP)));
    assert_eq!(Signal::parse(L!("TstP")), Some(Signal::new(libc::SIGTSTP)));
    assert_eq!(Signal::parse(L!("sigCONT")), Some(Signal::new(libc::SIGCONT)));
    assert_eq!(Signal::parse(L!("SIGFOO")), None);
    assert_eq!(Signal::parse(L!("")), None);
    assert_eq!(Signal::parse(L!("SIG")), None);
    assert_eq!(Signal::parse(L!("9")), Some(Signal::new(9)));
    assert_eq!(Signal::parse(L!("0")), None);
    assert_eq!(Signal::parse(L!("-1")), None);
}
