use crate::common::wcs2string;
use crate::fds::{make_autoclose_pipes, make_fd_nonblocking, PIPE_ERROR};
use crate::flog::FLOG;
use crate::global_safety::RelaxedAtomicBool;
use crate::proc::{STATUS_CMD_ERROR, STATUS_CMD_OK, STATUS_READ_TOO_MUCH};
use crate::signal::signal_check_cancel;
use crate::threads::iothread_perform_cant_wait;
use crate::wchar::prelude::*;
use errno::Errno;
use libc::{EAGAIN, EINTR, EPIPE, EWOULDBLOCK, STDOUT_FILENO};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// How long the fill thread will poll for between checks of the shutdown flag, in milliseconds.
/// This is only latency on teardown in the exotic case where the write end of our pipe was
/// inherited by a process which will never exit.
const FILLTHREAD_POLL_TIMEOUT_MS: libc::c_int = 100;

/// A SeparatedBuffer represents a buffer of output from commands, prepared to be turned into a
/// variable. For example, command substitutions output into one of these. Most commands just
/// produce a stream of bytes, and those get stored directly. However other commands produce
/// explicitly separated output, in particular `string` like `string collect` and `string split0`.
/// The buffer tracks a sequence of elements. Some elements are explicitly separated and should not
/// be further split; other elements have inferred separation and may be split by IFS (or not,
/// depending on its value).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SeparationType {
    /// this element should be further separated by IFS
    inferred,
    /// this element is explicitly separated and should not be further split
    explicitly,
}

pub struct BufferElement {
    pub contents: Vec<u8>,
    pub separation: SeparationType,
}

impl BufferElement {
    pub fn new(contents: Vec<u8>, separation: SeparationType) -> Self {
        BufferElement {
            contents,
            separation,
        }
    }
    pub fn is_explicitly_separated(&self) -> bool {
        self.separation == SeparationType::explicitly
    }
}

/// A SeparatedBuffer contains a list of elements, some of which may be separated explicitly and
/// others which must be separated further by the user (e.g. via IFS).
pub struct SeparatedBuffer {
    /// Limit on how much data we'll buffer. Zero means no limit.
    buffer_limit: usize,
    /// Current size of all contents.
    contents_size: usize,
    /// List of buffer elements.
    elements: Vec<BufferElement>,
    /// True if we're discarding input because our buffer_limit has been exceeded.
    discard: bool,
}

impl SeparatedBuffer {
    pub fn new(limit: usize) -> Self {
        SeparatedBuffer {
            buffer_limit: limit,
            contents_size: 0,
            elements: vec![],
            discard: false,
        }
    }

    /// Return the buffer limit size, or 0 for no limit.
    pub fn limit(&self) -> usize {
        self.buffer_limit
    }

    /// Return the contents size.
    pub fn len(&self) -> usize {
        self.contents_size
    }

    /// Return whether the output has been discarded.
    pub fn discarded(&self) -> bool {
        self.discard
    }

    /// Serialize the contents to a single string, where explicitly separated elements have a
    /// newline appended.
    pub fn newline_serialized(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len());
        for elem in &self.elements {
            result.extend_from_slice(&elem.contents);
            if elem.is_explicitly_separated() {
                result.push(b'\n');
            }
        }
        result
    }

    /// Return the list of elements.
    pub fn elements(&self) -> &[BufferElement] {
        &self.elements
    }

    /// Append the given data with separation type `sep`.
    pub fn append(&mut self, data: &[u8], sep: SeparationType) -> bool {
        if !self.try_add_size(data.len()) {
            return false;
        }
        // Try merging with the last element.
        if sep == SeparationType::inferred && self.last_inferred() {
            self.elements
                .last_mut()
                .unwrap()
                .contents
                .extend_from_slice(data);
        } else {
            self.elements.push(BufferElement::new(data.to_vec(), sep));
        }
        true
    }

    /// Remove all elements and unset the discard flag.
    pub fn clear(&mut self) {
        self.elements.clear();
        self.contents_size = 0;
        self.discard = false;
    }

    /// Return true if our last element has an inferred separation type.
    fn last_inferred(&self) -> bool {
        !self.elements.is_empty() && !self.elements.last().unwrap().is_explicitly_separated()
    }

    /// Mark that we are about to add the given size `delta` to the buffer. Return true if we
    /// succeed, false if we exceed buffer_limit.
    fn try_add_size(&mut self, delta: usize) -> bool {
        if self.discard {
            return false;
        }
        let proposed_size = self.contents_size.wrapping_add(delta);
        if proposed_size < delta || (self.buffer_limit > 0 && proposed_size > self.buffer_limit) {
            self.clear();
            self.discard = true;
            return false;
        }
        self.contents_size = proposed_size;
        true
    }
}

/// Describes what type of IO operation an IoData represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoMode {
    pipe,
    bufferfill,
}

/// Represents a FD redirection.
pub trait IoData {
    /// Type of redirect.
    fn io_mode(&self) -> IoMode;
    /// FD to redirect.
    fn fd(&self) -> RawFd;
    /// Source fd. This is dup2'd to fd, or if it is -1, then fd is closed.
    /// That is, we call dup2(source_fd, fd).
    fn source_fd(&self) -> RawFd;
    // The address of the object, for comparison.
    fn as_ptr(&self) -> *const ();
    fn as_bufferfill(&self) -> Option<&IoBufferfill> {
        None
    }
}

// The IoData implementations hold only fds (and for bufferfill, an Arc of a Sync buffer); they are
// shared between execution threads but only the owning thread manipulates them while scheduled.
pub trait IoDataSync: IoData + Send + Sync {}
unsafe impl Send for IoPipe {}
unsafe impl Send for IoBufferfill {}
unsafe impl Sync for IoPipe {}
unsafe impl Sync for IoBufferfill {}
impl IoDataSync for IoPipe {}
impl IoDataSync for IoBufferfill {}

/// Represents (one end) of a pipe.
pub struct IoPipe {
    fd: RawFd,
    // The pipe's fd. Conceptually this is dup2'd to fd.
    pipe_fd: OwnedFd,
    /// Whether this is an input pipe. This is used only for informational purposes.
    #[allow(dead_code)]
    is_input: bool,
}
impl IoPipe {
    pub fn new(fd: RawFd, is_input: bool, pipe_fd: OwnedFd) -> Self {
        IoPipe {
            fd,
            pipe_fd,
            is_input,
        }
    }
}
impl IoData for IoPipe {
    fn io_mode(&self) -> IoMode {
        IoMode::pipe
    }
    fn fd(&self) -> RawFd {
        self.fd
    }
    fn source_fd(&self) -> RawFd {
        self.pipe_fd.as_raw_fd()
    }
    fn as_ptr(&self) -> *const () {
        (self as *const Self).cast()
    }
}

/// Represents filling an IoBuffer. Very similar to IoPipe.
pub struct IoBufferfill {
    target: RawFd,

    /// Write end. The other end is connected to an IoBuffer.
    write_fd: OwnedFd,

    /// The receiving buffer.
    buffer: Arc<IoBuffer>,
}
impl IoBufferfill {
    /// Create an IoBufferfill which, when written from, fills a buffer with the contents.
    /// Returns an error on failure, e.g. too many open fds.
    pub fn create() -> io::Result<Arc<IoBufferfill>> {
        Self::create_opts(0, STDOUT_FILENO)
    }
    /// Create an IoBufferfill which, when written from, fills a buffer with the contents.
    /// Returns an error on failure, e.g. too many open fds.
    ///
    /// `target` is the fd which this will be dup2'd to - typically stdout.
    pub fn create_opts(buffer_limit: usize, target: RawFd) -> io::Result<Arc<IoBufferfill>> {
        assert!(target >= 0, "Invalid target fd");

        // Construct our pipes.
        let pipes = make_autoclose_pipes().map_err(io::Error::from)?;
        // Our buffer will read from the read end of the pipe. This end must be non-blocking so the
        // fill thread can periodically check the shutdown flag even if some process holds the
        // write end open forever.
        match make_fd_nonblocking(pipes.read.as_raw_fd()) {
            Ok(_) => (),
            Err(e) => {
                FLOG!(warning, PIPE_ERROR);
                FLOG!(warning, "fcntl:", e);
                return Err(e);
            }
        }
        // Our fill thread gets the read end of the pipe; out_pipe gets the write end.
        let buffer = Arc::new(IoBuffer::new(buffer_limit));
        begin_filling(&buffer, pipes.read);
        Ok(Arc::new(IoBufferfill {
            target,
            write_fd: pipes.write,
            buffer,
        }))
    }

    pub fn buffer_ref(&self) -> &Arc<IoBuffer> {
        &self.buffer
    }

    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    /// Reset the receiver (possibly closing the write end of the pipe), and complete the fill
    /// thread of the buffer. Return the buffer.
    pub fn finish(filler: Arc<IoBufferfill>) -> SeparatedBuffer {
        // The io filler is passed in. This typically holds the only instance of the write side of
        // the pipe used by the buffer's fill thread (except for that side held by other
        // processes). Dropping it will widow the pipe, breaking the fill thread out of its read
        // loop; then allow the buffer to finish.
        let buffer = Arc::clone(&filler.buffer);
        drop(filler);
        buffer.complete_background_fillthread_and_take_buffer()
    }
}
impl IoData for IoBufferfill {
    fn io_mode(&self) -> IoMode {
        IoMode::bufferfill
    }
    fn fd(&self) -> RawFd {
        self.target
    }
    fn source_fd(&self) -> RawFd {
        self.write_fd.as_raw_fd()
    }
    fn as_ptr(&self) -> *const () {
        (self as *const Self).cast()
    }
    fn as_bufferfill(&self) -> Option<&IoBufferfill> {
        Some(self)
    }
}

/// An IoBuffer is a buffer which can populate itself by reading from an fd.
/// It is not an IoData.
pub struct IoBuffer {
    /// Buffer storing what we have read.
    buffer: Mutex<SeparatedBuffer>,

    /// Atomic flag indicating our fill thread should shut down.
    shutdown_fillthread: RelaxedAtomicBool,

    /// A promise, allowing synchronization with the background fill operation.
    /// The fill thread has a reference to this as well, and fulfills it when it exits.
    /// The flag is true once the fill thread has completed.
    fill_waiter: Mutex<Option<Arc<(Mutex<bool>, Condvar)>>>,
}

impl IoBuffer {
    pub fn new(limit: usize) -> Self {
        IoBuffer {
            buffer: Mutex::new(SeparatedBuffer::new(limit)),
            shutdown_fillthread: RelaxedAtomicBool::new(false),
            fill_waiter: Mutex::new(None),
        }
    }

    /// Append a string to the buffer.
    pub fn append(&self, data: &[u8], typ: SeparationType) -> bool {
        self.buffer.lock().unwrap().append(data, typ)
    }

    /// Return true if output was discarded due to exceeding the read limit.
    pub fn discarded(&self) -> bool {
        self.buffer.lock().unwrap().discarded()
    }

    /// Read some, filling the buffer. The buffer is passed in to enforce that the append lock is
    /// held. Return positive on success, 0 if closed, -1 on error (in which case errno will be
    /// set).
    pub fn read_once(fd: RawFd, buffer: &mut MutexGuard<'_, SeparatedBuffer>) -> isize {
        assert!(fd >= 0, "Invalid fd");
        errno::set_errno(Errno(0));
        let mut bytes = [b'\0'; 4096 * 4];

        // We want to swallow EINTR only; in particular EAGAIN needs to be returned back to the
        // caller.
        let amt = loop {
            let amt = unsafe {
                libc::read(
                    fd,
                    std::ptr::addr_of_mut!(bytes).cast(),
                    std::mem::size_of_val(&bytes),
                )
            };
            if amt < 0 && errno::errno().0 == EINTR {
                continue;
            }
            break amt;
        };
        if amt > 0 {
            buffer.append(
                &bytes[0..usize::try_from(amt).unwrap()],
                SeparationType::inferred,
            );
        }
        amt
    }

    /// End the background fill operation, and return the buffer, transferring ownership.
    pub fn complete_background_fillthread_and_take_buffer(&self) -> SeparatedBuffer {
        // Mark that our fill thread is done, then wait for it to fulfill its promise.
        let promise = self
            .fill_waiter
            .lock()
            .unwrap()
            .take()
            .expect("Should have a fill thread");
        self.shutdown_fillthread.store(true);
        {
            let (mutex, condvar) = &*promise;
            let done_guard = mutex.lock().unwrap();
            let _done_guard = condvar.wait_while(done_guard, |done| !*done).unwrap();
        }

        // Return our buffer, transferring ownership.
        let mut locked_buff = self.buffer.lock().unwrap();
        let mut result = SeparatedBuffer::new(locked_buff.limit());
        std::mem::swap(&mut result, &mut locked_buff);
        locked_buff.clear();
        result
    }

    /// Helper to return whether the fill thread is running.
    pub fn fillthread_running(&self) -> bool {
        self.fill_waiter.lock().unwrap().is_some()
    }
}

/// Begin the fill operation, reading from the given fd in the background.
fn begin_filling(iobuffer: &Arc<IoBuffer>, fd: OwnedFd) {
    assert!(!iobuffer.fillthread_running(), "Already have a fill thread");

    // We want to fill the buffer by reading from fd. fd is the read end of a pipe; the write end
    // is owned by another process, or something else writing in fish. The usual path is that we
    // poll the fd, read a bit, and append it to the buffer. Eventually the write end of the pipe
    // will be closed - probably the other process exited - and fd will be widowed; read() will
    // then return 0 and we will stop reading.
    // In exotic circumstances the write end of the pipe will not be closed; this may happen in
    // e.g.:
    //   cmd ( background & ; echo hi )
    // Here the background process will inherit the write end of the pipe and hold onto it forever.
    // In this case, when complete_background_fillthread() is called, the shutdown flag is set (this
    // indicates that the command substitution is done); the poll timeout notices it, we read until
    // we get EAGAIN and then give up.
    let promise = Arc::new((Mutex::new(false), Condvar::new()));
    *iobuffer.fill_waiter.lock().unwrap() = Some(Arc::clone(&promise));

    let iobuffer = Arc::clone(iobuffer);
    iothread_perform_cant_wait(move || {
        let raw_fd = fd.as_raw_fd();
        loop {
            let mut pollfd = libc::pollfd {
                fd: raw_fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pollfd, 1, FILLTHREAD_POLL_TIMEOUT_MS) };
            if ret < 0 && errno::errno().0 != EINTR {
                break;
            }

            if iobuffer.shutdown_fillthread.load() {
                // Our caller asked us to shut down; read while we keep getting data.
                // This will stop when the fd is closed or if we get EAGAIN.
                let mut buf = iobuffer.buffer.lock().unwrap();
                loop {
                    let ret = IoBuffer::read_once(raw_fd, &mut buf);
                    if ret <= 0 {
                        break;
                    }
                }
                break;
            }

            if ret > 0 {
                // The fd is readable; read a bit.
                let mut buf = iobuffer.buffer.lock().unwrap();
                let ret = IoBuffer::read_once(raw_fd, &mut buf);
                if ret == 0 || (ret < 0 && ![EAGAIN, EWOULDBLOCK].contains(&errno::errno().0)) {
                    break;
                }
            }
        }
        // fd is closed when dropped here. Fulfill the promise; after this no further mutations of
        // the buffer occur.
        drop(fd);
        let (mutex, condvar) = &*promise;
        {
            let mut done = mutex.lock().unwrap();
            *done = true;
        }
        condvar.notify_one();
    });
}

pub type IoDataRef = Arc<dyn IoDataSync>;

#[derive(Clone, Default)]
pub struct IoChain(pub Vec<IoDataRef>);

impl IoChain {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn clear(&mut self) {
        self.0.clear()
    }
    pub fn push(&mut self, element: IoDataRef) {
        self.0.push(element);
    }
    pub fn append(&mut self, chain: &IoChain) -> bool {
        self.0.extend_from_slice(&chain.0);
        true
    }

    /// Return the last io redirection in the chain for the specified file descriptor, or None
    /// if none.
    pub fn io_for_fd(&self, fd: RawFd) -> Option<IoDataRef> {
        self.0.iter().rev().find(|data| data.fd() == fd).cloned()
    }
}

pub struct Dup2Action {
    pub src: i32,
    pub target: i32,
}

/// A sequence of basic redirections, to be applied in a forked child via dup2().
#[derive(Default)]
pub struct Dup2List {
    /// The list of actions.
    pub actions: Vec<Dup2Action>,
}

/// Produce a dup_fd_list_t from an io_chain. This may not be called before fork.
/// The result contains the list of fd actions (dup2 and close), as well as the list
/// of fds opened.
pub fn dup2_list_resolve_chain(io_chain: &IoChain) -> Dup2List {
    let mut result = Dup2List { actions: vec![] };
    for io in &io_chain.0 {
        if io.source_fd() < 0 {
            result.add_close(io.fd())
        } else {
            result.add_dup2(io.source_fd(), io.fd())
        }
    }
    result
}

impl Dup2List {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append a dup2 action.
    pub fn add_dup2(&mut self, src: RawFd, target: RawFd) {
        assert!(src >= 0 && target >= 0, "Invalid fd in add_dup2");
        // Note: record these even if src and target is the same.
        // This is a note that we must clear the CLO_EXEC bit.
        self.actions.push(Dup2Action { src, target });
    }

    /// Append a close action.
    pub fn add_close(&mut self, fd: RawFd) {
        assert!(fd >= 0, "Invalid fd in add_close");
        self.actions.push(Dup2Action {
            src: fd,
            target: -1,
        })
    }
}

/// Base type representing the output that an internal process can generate.
/// Pipeline stages write either to an fd (the pipe to the next stage, or stdout) or into a
/// separated buffer.
pub enum OutputStream {
    Fd(FdOutputStream),
    Buffered(BufferedOutputStream),
}

impl OutputStream {
    /// Flush any unwritten data to the underlying device, and return an error code.
    /// A 0 code indicates success.
    pub fn flush_and_check_error(&mut self) -> libc::c_int {
        match self {
            OutputStream::Fd(stream) => stream.flush_and_check_error(),
            OutputStream::Buffered(stream) => stream.flush_and_check_error(),
        }
    }

    /// Append a &wstr or WString.
    pub fn append<Str: AsRef<wstr>>(&mut self, s: Str) -> bool {
        let s = &s.as_ref();
        match self {
            OutputStream::Fd(stream) => stream.append(s),
            OutputStream::Buffered(stream) => stream.append(s),
        }
    }

    /// An optional override point. This is for explicit separation.
    /// `want_newline` is true if the output item should be ended with a newline. This
    /// is only relevant if we are printing the output to a stream.
    pub fn append_with_separation(
        &mut self,
        s: &wstr,
        typ: SeparationType,
        want_newline: bool,
    ) -> bool {
        match self {
            OutputStream::Buffered(stream) => stream.append_with_separation(s, typ, want_newline),
            OutputStream::Fd(_) => {
                if typ == SeparationType::explicitly && want_newline {
                    // Try calling "append" less - it might write() to an fd
                    let mut buf = s.to_owned();
                    buf.push('\n');
                    self.append(buf)
                } else {
                    self.append(s)
                }
            }
        }
    }
}

/// An output stream which outputs to an fd.
/// Note the fd may be something like stdout; there is no ownership implied here.
pub struct FdOutputStream {
    /// The file descriptor to write to.
    fd: RawFd,

    /// Whether we have received an error.
    errored: bool,
}
impl FdOutputStream {
    /// Construct from a file descriptor, which must be nonnegative.
    pub fn new(fd: RawFd) -> Self {
        assert!(fd >= 0, "Invalid fd");
        FdOutputStream { fd, errored: false }
    }

    fn append(&mut self, s: &wstr) -> bool {
        if self.errored {
            return false;
        }
        let narrow = wcs2string(s);

        // A write to a pipe may block until a reader drains it, and the reader may itself be a
        // cooperatively scheduled execution thread. Writing is a suspension point: give up the
        // GIL for the duration if we hold it.
        let exec_thread = crate::gil::current_thread();
        if let Some(thread) = &exec_thread {
            crate::gil::gil().release(thread);
        }

        let mut written = 0;
        while written < narrow.len() {
            let amt = unsafe {
                libc::write(
                    self.fd,
                    narrow[written..].as_ptr().cast(),
                    narrow.len() - written,
                )
            };
            if amt < 0 {
                let err = errno::errno().0;
                if err == EINTR {
                    if signal_check_cancel() != 0 {
                        // Receiving SIGINT is considered normal and non-exceptional (user request
                        // to abort), meaning we shouldn't print an error.
                        self.errored = true;
                        break;
                    }
                    continue;
                }
                if err != EPIPE {
                    crate::common::perror("write");
                }
                self.errored = true;
                break;
            }
            written += amt as usize;
        }

        if let Some(thread) = &exec_thread {
            crate::gil::gil().run(thread);
        }
        !self.errored
    }

    fn flush_and_check_error(&mut self) -> libc::c_int {
        // Return a generic 1 on any write failure.
        if self.errored {
            STATUS_CMD_ERROR
        } else {
            STATUS_CMD_OK
        }
    }
}

/// An output stream which writes into a separated buffer.
pub struct BufferedOutputStream {
    /// The buffer we are filling.
    buffer: Arc<IoBuffer>,
}
impl BufferedOutputStream {
    pub fn new(buffer: Arc<IoBuffer>) -> Self {
        Self { buffer }
    }
    fn append(&mut self, s: &wstr) -> bool {
        self.buffer.append(&wcs2string(s), SeparationType::inferred)
    }
    fn append_with_separation(
        &mut self,
        s: &wstr,
        typ: SeparationType,
        _want_newline: bool,
    ) -> bool {
        self.buffer.append(&wcs2string(s), typ)
    }
    fn flush_and_check_error(&mut self) -> libc::c_int {
        if self.buffer.discarded() {
            return STATUS_READ_TOO_MUCH;
        }
        0
    }
}
