//! Exclusive ownership of one native-allocated diagnostic string.

use std::ffi::{c_char, CStr};
use std::fmt;
use std::ptr::NonNull;

use crate::NativeVerifier;

/// A diagnostic returned by a [`NativeVerifier`], released through that
/// verifier when dropped.
///
/// Contents must be copied out before the owner goes away; nothing borrowed
/// from it outlives the native allocation.
pub struct NativeDiagnostic<'n, N: NativeVerifier + ?Sized> {
    ptr: NonNull<c_char>,
    native: &'n N,
}

impl<'n, N: NativeVerifier + ?Sized> NativeDiagnostic<'n, N> {
    /// Takes ownership of a verify result. Null means the module was valid.
    ///
    /// # Safety
    ///
    /// `raw` must be a result of `native.verify_string` or `native.verify_file`
    /// that nobody else owns or releases.
    pub unsafe fn from_raw(native: &'n N, raw: *mut c_char) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self { ptr, native })
    }

    /// Diagnostic text without the terminating NUL.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the verifier contract guarantees a NUL-terminated string
        // that stays alive until `drop`.
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }.to_bytes()
    }

    /// Copies the text into an owned string and releases the allocation.
    pub fn to_string_lossy(self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl<N: NativeVerifier + ?Sized> Drop for NativeDiagnostic<'_, N> {
    fn drop(&mut self) {
        // SAFETY: `from_raw` made this value the sole owner; drop runs once.
        unsafe { self.native.release(self.ptr.as_ptr()) }
    }
}

impl<N: NativeVerifier + ?Sized> fmt::Debug for NativeDiagnostic<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeDiagnostic")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}
