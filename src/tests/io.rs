use crate::io::{IoBufferfill, IoData, SeparatedBuffer, SeparationType};
use crate::tests::prelude::*;
use std::time::Duration;

#[test]
fn test_separated_buffer_coalescing() {
    let mut buffer = SeparatedBuffer::new(0);
    // Adjacent inferred elements coalesce into one.
    assert!(buffer.append(b"abc", SeparationType::inferred));
    assert!(buffer.append(b"def", SeparationType::inferred));
    assert_eq!(buffer.elements().len(), 1);
    assert_eq!(buffer.elements()[0].contents, b"abcdef");

    // An explicit element ends the run; the next inferred element starts a new one.
    assert!(buffer.append(b"x", SeparationType::explicitly));
    assert!(buffer.append(b"tail", SeparationType::inferred));
    assert_eq!(buffer.elements().len(), 3);
    assert_eq!(buffer.len(), 11);

    // Explicitly separated elements get a newline in the serialized form.
    assert_eq!(buffer.newline_serialized(), b"abcdefx\ntail");
}

#[test]
fn test_separated_buffer_limit() {
    let mut buffer = SeparatedBuffer::new(8);
    assert!(buffer.append(b"12345", SeparationType::inferred));
    // This append would exceed the limit: everything is discarded, and the flag sticks.
    assert!(!buffer.append(b"6789", SeparationType::inferred));
    assert!(buffer.discarded());
    assert_eq!(buffer.len(), 0);
    assert!(buffer.elements().is_empty());
    assert!(!buffer.append(b"a", SeparationType::explicitly));

    // clear() resets the discard flag.
    buffer.clear();
    assert!(!buffer.discarded());
    assert!(buffer.append(b"a", SeparationType::explicitly));
}

fn write_all_to_fd(fd: i32, data: &[u8]) {
    let mut written = 0;
    while written < data.len() {
        let amt =
            unsafe { libc::write(fd, data[written..].as_ptr().cast(), data.len() - written) };
        assert!(amt > 0, "write to pipe failed");
        written += amt as usize;
    }
}

#[test]
#[serial]
fn test_bufferfill_reads_pipe_to_eof() {
    test_init();
    let bufferfill = IoBufferfill::create().unwrap();

    // Write into the pipe, then finish: dropping the only reference to the write end widows the
    // pipe and the fill thread drains it to EOF.
    let data = b"hello from the pipe";
    write_all_to_fd(bufferfill.source_fd(), data);

    let buffer = IoBufferfill::finish(bufferfill);
    assert_eq!(buffer.newline_serialized(), data);
    assert!(!buffer.discarded());
}

#[test]
#[serial]
fn test_bufferfill_discards_past_limit() {
    test_init();
    let bufferfill = IoBufferfill::create_opts(16, libc::STDOUT_FILENO).unwrap();
    write_all_to_fd(bufferfill.source_fd(), &[b'x'; 64]);

    // Give the fill thread a moment to drain the pipe before completing it.
    std::thread::sleep(Duration::from_millis(100));
    let buffer = IoBufferfill::finish(bufferfill);
    assert!(buffer.discarded());
    assert_eq!(buffer.len(), 0);
}
