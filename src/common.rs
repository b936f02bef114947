//! Miscellaneous utilities shared by the execution core.

use crate::wchar::prelude::*;
use std::ffi::CString;
use std::mem;
use std::ops::{Deref, DerefMut};

// Re-export sprintf macro.
pub use fish_printf::sprintf;

/// Converts the narrow character string `inp` into its wide equivalent, and return it.
///
/// The string may contain embedded nulls. Invalid sequences are replaced with U+FFFD.
pub fn str2wcstring(inp: &[u8]) -> WString {
    if inp.is_empty() {
        return WString::new();
    }
    let mut result = WString::new();
    result.reserve(inp.len());
    let mut pos = 0;
    while pos < inp.len() {
        match std::str::from_utf8(&inp[pos..]) {
            Ok(valid) => {
                result.push_str(valid);
                break;
            }
            Err(err) => {
                let valid_len = err.valid_up_to();
                result.push_str(std::str::from_utf8(&inp[pos..pos + valid_len]).unwrap());
                result.push(char::REPLACEMENT_CHARACTER);
                pos += valid_len + err.error_len().unwrap_or(1).max(1);
            }
        }
    }
    result
}

/// Returns a newly allocated multibyte character string equivalent of the specified wide character
/// string.
pub fn wcs2string(input: &wstr) -> Vec<u8> {
    if input.is_empty() {
        return vec![];
    }
    let mut result = Vec::with_capacity(input.len());
    let mut buf = [0_u8; 4];
    for c in input.chars() {
        result.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
    result
}

/// Same as [`wcs2string`]. Meant to be used when we need a zero-terminated string to feed legacy
/// APIs. Note: if `input` contains any interior NUL bytes, the result will be truncated at the
/// first!
pub fn wcs2zstring(input: &wstr) -> CString {
    let mut vec = wcs2string(input);
    if let Some(pos) = vec.iter().position(|&b| b == b'\0') {
        vec.truncate(pos);
    }
    vec.push(b'\0');
    CString::from_vec_with_nul(vec).unwrap()
}

/// Exits without invoking destructors (via _exit), useful for code after fork.
pub fn exit_without_destructors(code: libc::c_int) -> ! {
    unsafe { libc::_exit(code) };
}

pub const fn assert_send<T: Send>() {}
pub const fn assert_sync<T: Sync>() {}

pub struct ScopeGuard<T, F: FnOnce(&mut T)>(Option<(T, F)>);

impl<T, F: FnOnce(&mut T)> ScopeGuard<T, F> {
    /// Creates a new `ScopeGuard` wrapping `value`. The `on_drop` callback is executed when the
    /// ScopeGuard's lifetime expires or when it is manually dropped.
    pub fn new(value: T, on_drop: F) -> Self {
        Self(Some((value, on_drop)))
    }

    /// Invokes the callback and returns the wrapped value, consuming the ScopeGuard.
    pub fn commit(mut guard: Self) -> T {
        let (mut value, on_drop) = guard.0.take().expect("Should always have Some value");
        on_drop(&mut value);
        value
    }

    /// Cancels the invocation of the callback, returning the original wrapped value.
    pub fn cancel(mut guard: Self) -> T {
        let (value, _) = guard.0.take().expect("Should always have Some value");
        value
    }
}

impl<T, F: FnOnce(&mut T)> Deref for ScopeGuard<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0.as_ref().unwrap().0
    }
}

impl<T, F: FnOnce(&mut T)> DerefMut for ScopeGuard<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0.as_mut().unwrap().0
    }
}

impl<T, F: FnOnce(&mut T)> Drop for ScopeGuard<T, F> {
    fn drop(&mut self) {
        if let Some((mut value, on_drop)) = self.0.take() {
            on_drop(&mut value);
        }
    }
}

/// A trait expressing what ScopeGuard can do. This is necessary because scoped_push returns an
/// `impl Trait` object and therefore methods on ScopeGuard which take a self parameter cannot be
/// used.
pub trait ScopeGuarding: DerefMut {
    /// Invokes the callback and returns the wrapped value, consuming the ScopeGuard.
    fn commit(guard: Self) -> Self::Target;
}

impl<T, F: FnOnce(&mut T)> ScopeGuarding for ScopeGuard<T, F> {
    fn commit(guard: Self) -> T {
        ScopeGuard::commit(guard)
    }
}

/// A scoped manager to save the current value of some variable, and set it to a new value. When
/// dropped, it restores the variable to its old value.
pub fn scoped_push<Context, Accessor, T>(
    mut ctx: Context,
    accessor: Accessor,
    new_value: T,
) -> impl ScopeGuarding<Target = Context>
where
    Accessor: Fn(&mut Context) -> &mut T,
{
    let saved = mem::replace(accessor(&mut ctx), new_value);
    let restore_saved = move |ctx: &mut Context| {
        *accessor(ctx) = saved;
    };
    ScopeGuard::new(ctx, restore_saved)
}

/// Print a message to stderr in the manner of perror(3), using the calling thread's errno.
pub fn perror(s: &str) {
    let e = errno::errno().0;
    let mut stderr = std::io::stderr().lock();
    use std::io::Write;
    if !s.is_empty() {
        let _ = write!(stderr, "{s}: ");
    }
    let slice = unsafe {
        let msg = libc::strerror(e);
        std::ffi::CStr::from_ptr(msg).to_bytes()
    };
    let _ = stderr.write_all(slice);
    let _ = stderr.write_all(b"\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wchar::L;

    #[test]
    fn test_string_conversions() {
        assert_eq!(str2wcstring(b"hello"), L!("hello"));
        assert_eq!(wcs2string(L!("hello")), b"hello");
        // Invalid UTF-8 does not panic.
        let s = str2wcstring(b"a\xffb");
        assert_eq!(s.chars().count(), 3);
    }

    #[test]
    fn test_scope_guard() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(&mut cleaned, |c| **c = true);
            assert!(!**guard);
        }
        assert!(cleaned);
    }
}
