//! Provide interoperability with libfabric's C return-value convention.
//!
//! Unlike verbs-style calls (which return `0`/`-1` and set `errno`), `fi_*`
//! calls return `0` on success and a *negative* `errno` value directly on
//! failure. `from_c_ret`/`from_c_err` flip the sign before handing the code
//! to [`std::io::Error::from_raw_os_error`].

use std::io::{self, Error as IoError};

use crate::bindings::fi_strerror;

/// Converts a libfabric C return value to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => from_c_err(ret),
    }
}

/// Converts a non-zero libfabric C return value to a Rust `Result`.
///
/// `code` is expected to be negative, following libfabric's `-FI_Exxx`
/// convention; `ibv`-style positive `errno` values are also accepted so that
/// call sites do not need to special-case the (rare) provider that returns
/// a positive code.
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    let errno = code.unsigned_abs() as i32;
    Err(IoError::from_raw_os_error(errno))
}

/// Renders a libfabric return code the way the provider itself would
/// describe it, falling back to the plain `errno` string when `fi_strerror`
/// is unavailable for the code.
pub(crate) fn fi_error_string(code: i32) -> String {
    let errno = code.unsigned_abs() as i32;
    // SAFETY: `fi_strerror` returns a pointer to a static, NUL-terminated
    // string table owned by libfabric; it never returns null.
    unsafe {
        let ptr = fi_strerror(errno);
        if ptr.is_null() {
            IoError::from_raw_os_error(errno).to_string()
        } else {
            std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}
