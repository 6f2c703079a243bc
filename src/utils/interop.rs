use std::io;
use std::ptr::NonNull;

/// Converts a C return value to a Rust `Result`.
///
/// Most verbs return the error code itself, positive or negated; `-1` means
/// the code is in `errno`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        -1 => Err(io::Error::last_os_error()),
        ret => Err(io::Error::from_raw_os_error(ret.abs())),
    }
}

/// Converts a nullable C pointer to a Rust `Result`, reading `errno` on null.
#[inline(always)]
pub(crate) fn from_c_ptr<T>(ptr: *mut T) -> io::Result<NonNull<T>> {
    NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
}
