//! Verification call adapter.
//!
//! Each call crosses into the native verifier once and hands back a host
//! optional: unit when the module is valid, otherwise a one-field block (tag 0)
//! holding a host copy of the diagnostic. The native allocation is released
//! right after the copy, before anything else is allocated, on every path.
//!
//! `Err` is only returned for host faults (stale handles, wrong value kinds,
//! heap exhaustion). Verification failures always come back as `Ok`.

use std::ffi::{c_char, CString};

use crate::native::open_failure;
use crate::{Host, NativeDiagnostic, NativeVerifier, Result, RootFrame};

/// Block tag of the present optional.
pub const SOME_TAG: u8 = 0;

/// Verifies the module held in the host string `data`.
///
/// The native side reads the host bytes in place; no collection can run while
/// it does.
pub fn verify_string<H, N>(host: &mut H, native: &N, data: H::Value) -> Result<H::Value>
where
    H: Host + ?Sized,
    N: NativeVerifier + ?Sized,
{
    cross(host, native, data, |native, bytes| Ok(native.verify_string(bytes)))
}

/// Verifies the module stored at the path named by the host string `path`.
///
/// A path with an interior NUL cannot name a file and is reported like any
/// other unreadable file, without calling the native side.
pub fn verify_file<H, N>(host: &mut H, native: &N, path: H::Value) -> Result<H::Value>
where
    H: Host + ?Sized,
    N: NativeVerifier + ?Sized,
{
    cross(host, native, path, |native, bytes| match CString::new(bytes) {
        Ok(path) => Ok(native.verify_file(&path)),
        Err(_) => Err(open_failure(&String::from_utf8_lossy(bytes))),
    })
}

/// Wraps `value` in a present optional.
pub fn some<H: Host + ?Sized>(host: &mut H, value: H::Value) -> Result<H::Value> {
    let mut frame = RootFrame::new(host);
    let value = frame.root(value);
    let block = frame.host_mut().alloc_block(SOME_TAG, 1)?;
    let value = frame.get(value);
    frame.host_mut().store_field(block, 0, value)?;
    Ok(block)
}

fn cross<H, N, F>(host: &mut H, native: &N, input: H::Value, call: F) -> Result<H::Value>
where
    H: Host + ?Sized,
    N: NativeVerifier + ?Sized,
    F: FnOnce(&N, &[u8]) -> core::result::Result<*mut c_char, String>,
{
    let mut frame = RootFrame::new(host);
    let input = frame.root(input);
    let unit = frame.host().unit();
    let result = frame.root(unit);

    let crossed = call(native, frame.host().string_bytes(frame.get(input))?);

    let copied = match crossed {
        // SAFETY: `raw` was just returned by `native` and nothing else holds it.
        Ok(raw) => match unsafe { NativeDiagnostic::from_raw(native, raw) } {
            None => return Ok(frame.finish(result)),
            Some(diag) => {
                log::debug!("diagnostic crossed the boundary ({} bytes)", diag.as_bytes().len());
                let copied = frame.host_mut().alloc_string(diag.as_bytes());
                drop(diag);
                copied?
            }
        },
        Err(message) => frame.host_mut().alloc_string(message.as_bytes())?,
    };

    let text = frame.root(copied);
    let text = frame.get(text);
    let wrapped = some(frame.host_mut(), text)?;
    frame.set(result, wrapped);
    Ok(frame.finish(result))
}
