use crate::common::{assert_send, assert_sync};
use std::ffi::{c_char, CStr, CString};
use std::marker::PhantomData;
use std::pin::Pin;
use std::ptr;

/// This supports the null-terminated array of NUL-terminated strings consumed by exec.
/// Given a list of strings, construct a vector of pointers to those strings contents.
pub struct NullTerminatedArray<'p> {
    pointers: Box<[*const c_char]>,
    _phantom: PhantomData<&'p CStr>,
}

impl<'p> NullTerminatedArray<'p> {
    /// Construct from a list of strings.
    /// This holds pointers into the strings.
    pub fn new<S: AsRef<CStr>>(strs: &'p [S]) -> Self {
        let mut pointers = Vec::new();
        pointers.reserve_exact(1 + strs.len());
        for s in strs {
            pointers.push(s.as_ref().as_ptr());
        }
        pointers.push(ptr::null());
        NullTerminatedArray {
            pointers: pointers.into_boxed_slice(),
            _phantom: PhantomData,
        }
    }

    /// Return the list of pointers, appropriate for envp or argv.
    /// Note this returns a mutable array of const strings. The caller may rearrange the strings
    /// but not modify their contents. Most of the uses expect the array to be mutable even though
    /// nothing mutates it, so it's either this or cast away the const at the call site.
    pub fn get(&self) -> *mut *const c_char {
        assert!(
            !self.pointers.is_empty() && self.pointers.last().unwrap().is_null(),
            "Should have null terminator"
        );
        self.pointers.as_ptr() as *mut *const c_char
    }
}

/// Safety: NullTerminatedArray is Send and Sync because it's immutable.
unsafe impl Send for NullTerminatedArray<'_> {}
unsafe impl Sync for NullTerminatedArray<'_> {}

/// A container which exposes a null-terminated array of pointers to strings that it owns.
/// This is useful for persisted null-terminated arrays, e.g. the argv of a process about to be
/// exec'd, which must be built before fork() since building it allocates.
pub struct OwningNullTerminatedArray {
    // Note that null_terminated_array holds pointers into our boxed strings.
    // The 'static is a lie.
    strings: Pin<Box<[CString]>>,
    null_terminated_array: NullTerminatedArray<'static>,
}

const _: () = assert_send::<OwningNullTerminatedArray>();
const _: () = assert_sync::<OwningNullTerminatedArray>();

impl OwningNullTerminatedArray {
    /// Construct, taking ownership of a list of strings.
    pub fn new(strs: Vec<CString>) -> Self {
        let strings = strs.into_boxed_slice();
        // Safety: we're pinning the strings, so they won't move.
        let string_slice: &'static [CString] = unsafe { std::mem::transmute(&*strings) };
        OwningNullTerminatedArray {
            strings: Pin::from(strings),
            null_terminated_array: NullTerminatedArray::new(string_slice),
        }
    }

    /// Cover over NullTerminatedArray::get().
    pub fn get(&self) -> *mut *const c_char {
        self.null_terminated_array.get()
    }

    pub fn get_mut(&self) -> *mut *mut c_char {
        self.get().cast()
    }

    /// Iterate over the strings.
    pub fn iter(&self) -> impl Iterator<Item = &CStr> {
        self.strings.iter().map(|s| s.as_c_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_terminated_array() {
        let owned = OwningNullTerminatedArray::new(vec![
            CString::new("foo").unwrap(),
            CString::new("bar").unwrap(),
        ]);
        let ptr = owned.get();
        unsafe {
            assert_eq!(CStr::from_ptr(*ptr).to_bytes(), b"foo");
            assert_eq!(CStr::from_ptr(*ptr.offset(1)).to_bytes(), b"bar");
            assert!(ptr.offset(2).read().is_null());
        }
        assert_eq!(owned.iter().count(), 2);
    }
}
