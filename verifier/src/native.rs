//! Native verification capability.
//!
//! The C ABI below is what a foreign host links against:
//! - `wasmstore_verify_string(data, len)`: validates an in-memory module.
//! - `wasmstore_verify_file(path)`: reads and validates a module from disk.
//! - `wasmstore_error_free(diag)`: releases a diagnostic returned by either call.
//!
//! Both verify calls return null for a valid module, otherwise a freshly
//! allocated NUL-terminated diagnostic owned by the caller. Malformed binaries,
//! validation failures and unreadable files are not distinguished.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::{fs, ptr, slice};

use wasmparser::Validator;

use crate::NativeVerifier;

/// Validates a complete module held in memory.
pub fn validate_bytes(data: &[u8]) -> Result<(), String> {
    let mut validator = Validator::new();
    validator
        .validate_all(data)
        .map(drop)
        .map_err(|e| format!("{} (at offset 0x{:x})", e.message(), e.offset()))
}

/// Reads the whole file at `path` and validates it.
pub fn validate_file(path: &Path) -> Result<(), String> {
    let data = fs::read(path).map_err(|_| open_failure(&path.to_string_lossy()))?;
    validate_bytes(&data)
}

pub(crate) fn open_failure(path: &str) -> String {
    format!("unable to open file {path}")
}

#[cfg(unix)]
pub(crate) fn path_to_cstring(path: &Path) -> Option<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).ok()
}

#[cfg(not(unix))]
pub(crate) fn path_to_cstring(path: &Path) -> Option<CString> {
    path.to_str().and_then(|p| CString::new(p).ok())
}

#[cfg(unix)]
fn cstr_to_path(path: &CStr) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStrExt;
    Some(PathBuf::from(std::ffi::OsStr::from_bytes(path.to_bytes())))
}

#[cfg(not(unix))]
fn cstr_to_path(path: &CStr) -> Option<PathBuf> {
    path.to_str().ok().map(PathBuf::from)
}

/// Hands a diagnostic to the caller as an owned C string.
fn into_raw_diagnostic(message: String) -> *mut c_char {
    log::debug!("native diagnostic: {message}");
    let mut bytes = message.into_bytes();
    bytes.retain(|&b| b != 0);
    // SAFETY: interior NULs were removed above.
    unsafe { CString::from_vec_unchecked(bytes) }.into_raw()
}

fn outcome(result: Result<(), String>) -> *mut c_char {
    match result {
        Ok(()) => ptr::null_mut(),
        Err(message) => into_raw_diagnostic(message),
    }
}

fn guarded(f: impl FnOnce() -> Result<(), String>) -> *mut c_char {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => outcome(result),
        Err(_) => into_raw_diagnostic("verifier panicked".to_string()),
    }
}

/// Validates `len` bytes starting at `data`.
///
/// # Safety
///
/// When `len` is non-zero, `data` must point to `len` readable bytes that stay
/// unchanged for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn wasmstore_verify_string(data: *const u8, len: usize) -> *mut c_char {
    let bytes: &[u8] = if len == 0 {
        &[]
    } else if data.is_null() {
        return into_raw_diagnostic("null module buffer".to_string());
    } else {
        slice::from_raw_parts(data, len)
    };
    guarded(|| validate_bytes(bytes))
}

/// Reads and validates the module at `path`.
///
/// # Safety
///
/// `path` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn wasmstore_verify_file(path: *const c_char) -> *mut c_char {
    if path.is_null() {
        return into_raw_diagnostic(open_failure("(null)"));
    }
    let raw = CStr::from_ptr(path);
    let Some(path) = cstr_to_path(raw) else {
        return into_raw_diagnostic(open_failure(&raw.to_string_lossy()));
    };
    guarded(|| validate_file(&path))
}

/// Releases a diagnostic returned by `wasmstore_verify_string` or
/// `wasmstore_verify_file`. Null is ignored.
///
/// # Safety
///
/// `diagnostic` must be null or come from one of the verify calls, and must not
/// have been released before.
#[no_mangle]
pub unsafe extern "C" fn wasmstore_error_free(diagnostic: *mut c_char) {
    if !diagnostic.is_null() {
        drop(CString::from_raw(diagnostic));
    }
}

/// The capability linked into this library, called through its C ABI.
#[derive(Debug, Default, Clone, Copy)]
pub struct Linked;

// SAFETY: the C ABI returns null or a `CString::into_raw` pointer, and
// `wasmstore_error_free` reclaims exactly that allocation.
unsafe impl NativeVerifier for Linked {
    fn verify_string(&self, data: &[u8]) -> *mut c_char {
        unsafe { wasmstore_verify_string(data.as_ptr(), data.len()) }
    }

    fn verify_file(&self, path: &CStr) -> *mut c_char {
        unsafe { wasmstore_verify_file(path.as_ptr()) }
    }

    unsafe fn release(&self, diagnostic: *mut c_char) {
        wasmstore_error_free(diagnostic);
    }
}

/// Instrumented capability that keeps a ledger of diagnostic allocations.
///
/// Releases of pointers it does not currently own are counted as rejected and
/// never forwarded to the inner capability.
#[derive(Debug, Default)]
pub struct Counting<N> {
    inner: N,
    allocated: Cell<usize>,
    released: Cell<usize>,
    rejected: Cell<usize>,
    live: RefCell<HashSet<usize>>,
}

impl<N: NativeVerifier> Counting<N> {
    pub fn new(inner: N) -> Self {
        Self {
            inner,
            allocated: Cell::new(0),
            released: Cell::new(0),
            rejected: Cell::new(0),
            live: RefCell::new(HashSet::new()),
        }
    }

    /// Number of diagnostics handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Number of diagnostics released.
    pub fn released(&self) -> usize {
        self.released.get()
    }

    /// Releases of unknown or already released pointers.
    pub fn rejected(&self) -> usize {
        self.rejected.get()
    }

    /// Diagnostics handed out but not yet released.
    pub fn outstanding(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn into_inner(self) -> N {
        self.inner
    }

    fn track(&self, diagnostic: *mut c_char) -> *mut c_char {
        if !diagnostic.is_null() {
            self.allocated.set(self.allocated.get() + 1);
            self.live.borrow_mut().insert(diagnostic as usize);
        }
        diagnostic
    }
}

// SAFETY: forwards to `N` and only releases pointers that `N` handed out.
unsafe impl<N: NativeVerifier> NativeVerifier for Counting<N> {
    fn verify_string(&self, data: &[u8]) -> *mut c_char {
        self.track(self.inner.verify_string(data))
    }

    fn verify_file(&self, path: &CStr) -> *mut c_char {
        self.track(self.inner.verify_file(path))
    }

    unsafe fn release(&self, diagnostic: *mut c_char) {
        if self.live.borrow_mut().remove(&(diagnostic as usize)) {
            self.released.set(self.released.get() + 1);
            self.inner.release(diagnostic);
        } else {
            self.rejected.set(self.rejected.get() + 1);
        }
    }
}
