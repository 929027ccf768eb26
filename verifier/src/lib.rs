// Boundary between a garbage-collected host runtime and the native
// WebAssembly verifier.

use core::fmt;
use std::ffi::{c_char, CStr};
use std::path::Path;

pub mod adapter;
pub mod diagnostic;
pub mod frame;
pub mod heap;
pub mod native;

pub use adapter::{verify_file, verify_string};
pub use diagnostic::NativeDiagnostic;
pub use frame::{Local, RootFrame};
pub use heap::{GcPolicy, Heap, HeapStats, Value};
pub use native::{Counting, Linked};

/// Result alias used by the adapter and host primitives.
pub type Result<T> = core::result::Result<T, Error>;

/// Faults raised by host primitives.
///
/// Verification failures never show up here: they are carried as
/// diagnostics inside the `Ok` side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The handle was created before the latest collection and was not rooted.
    #[error("stale host value from heap epoch {epoch}")]
    StaleValue { epoch: u64 },
    /// A string was expected.
    #[error("host value is not a string")]
    NotAString,
    /// A block was expected.
    #[error("host value is not a block")]
    NotABlock,
    /// Field index past the end of a block.
    #[error("field {index} out of range for block of size {size}")]
    FieldOutOfRange { index: usize, size: usize },
    /// The heap is still full after a collection.
    #[error("host heap exhausted ({limit} objects)")]
    HeapExhausted { limit: usize },
}

/// Primitives a garbage-collected host runtime exposes to foreign code.
///
/// Any allocation may run a collection that moves objects. Handles that must
/// survive an allocation have to be kept on the value stack (see
/// [`RootFrame`]).
pub trait Host {
    /// Handle to a host value. Only valid until the next collection unless rooted.
    type Value: Copy + fmt::Debug;

    /// The immediate unit value, also used as the absent optional.
    fn unit(&self) -> Self::Value;

    /// Borrows the contents of a host string without copying.
    fn string_bytes(&self, value: Self::Value) -> Result<&[u8]>;

    /// Allocates a host string holding a copy of `bytes`.
    fn alloc_string(&mut self, bytes: &[u8]) -> Result<Self::Value>;

    /// Allocates a block of `size` fields, all initialised to unit.
    fn alloc_block(&mut self, tag: u8, size: usize) -> Result<Self::Value>;

    /// Writes one field of a block.
    fn store_field(&mut self, block: Self::Value, index: usize, value: Self::Value) -> Result<()>;

    /// Current depth of the root stack.
    fn roots_len(&self) -> usize;

    /// Registers `value` as a root on top of the stack.
    fn push_root(&mut self, value: Self::Value);

    /// Reads a root slot; collections keep slots up to date.
    fn root(&self, slot: usize) -> Self::Value;

    /// Overwrites a root slot.
    fn set_root(&mut self, slot: usize, value: Self::Value);

    /// Pops roots until the stack is `len` deep.
    fn truncate_roots(&mut self, len: usize);
}

/// Contract of the native verification capability.
///
/// # Safety
///
/// Implementors must return either a null pointer (the module is valid) or a
/// pointer to a NUL-terminated string that the caller now owns and must hand
/// back to [`NativeVerifier::release`] exactly once. Inputs are read
/// synchronously and never retained past the call.
pub unsafe trait NativeVerifier {
    /// Verifies an in-memory module.
    fn verify_string(&self, data: &[u8]) -> *mut c_char;

    /// Verifies the module stored at `path`; the file is read by the native side.
    fn verify_file(&self, path: &CStr) -> *mut c_char;

    /// Releases a diagnostic returned by one of the verify calls.
    ///
    /// # Safety
    ///
    /// `diagnostic` must come from this verifier and must not be used afterwards.
    unsafe fn release(&self, diagnostic: *mut c_char);
}

/// Owned copy of a verification failure message.
///
/// The text is opaque: binary format errors, validation errors and I/O errors
/// all arrive through the same channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic(String);

impl Diagnostic {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Diagnostic {}

/// Verifies an in-memory module through the native capability.
pub fn verify_bytes(data: &[u8]) -> Option<Diagnostic> {
    let native = Linked;
    // SAFETY: `Linked` honours the `NativeVerifier` ownership contract.
    unsafe { NativeDiagnostic::from_raw(&native, native.verify_string(data)) }
        .map(|diag| Diagnostic(diag.to_string_lossy()))
}

/// Verifies the module stored at `path` through the native capability.
pub fn verify_path(path: impl AsRef<Path>) -> Option<Diagnostic> {
    let path = path.as_ref();
    let Some(c_path) = native::path_to_cstring(path) else {
        return Some(Diagnostic(native::open_failure(&path.to_string_lossy())));
    };
    let native = Linked;
    // SAFETY: as above.
    unsafe { NativeDiagnostic::from_raw(&native, native.verify_file(&c_path)) }
        .map(|diag| Diagnostic(diag.to_string_lossy()))
}
