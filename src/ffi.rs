//! C-ABI exports for runtimes that generate thunks from C.
//!
//! Gated behind `features = ["ffi"]`. All entry points share one
//! process-wide allocator backed by the host OS.

use crate::allocator::{ThunkAllocator, ThunkRequest};
use crate::platform::Os;
use crate::registry::OwnerToken;
use crate::wx;
use core::ffi::c_void;
use core::ptr::{self, NonNull};

static THUNKS: ThunkAllocator = ThunkAllocator::new(Os);

/// Allocate `size` bytes of thunk memory owned by `owner`. Returns null on
/// failure or when `size` is 0.
#[unsafe(no_mangle)]
pub extern "C" fn thunkmem_allocate(size: usize, owner: *const c_void) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    THUNKS
        .allocate(ThunkRequest::new(size, OwnerToken::from_ptr(owner)))
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Finish a thunk whose first `size` bytes have been written.
///
/// # Safety
/// `thunk` must be null or a live pointer returned by `thunkmem_allocate`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thunkmem_done(thunk: *const u8, size: usize) {
    unsafe { THUNKS.finalize(thunk, size) }
}

/// Free a thunk, returning its owner, or null if `thunk` is not live.
///
/// # Safety
/// No native code may still be executing inside `thunk`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn thunkmem_free(thunk: *mut u8) -> *const c_void {
    NonNull::new(thunk)
        .and_then(|thunk| THUNKS.release(thunk))
        .map_or(ptr::null(), OwnerToken::as_ptr)
}

/// Make the thunk region writable for the calling thread until
/// `thunkmem_protect` is called. Calls to `thunkmem_allocate` in between
/// keep it writable when built with `std`.
#[unsafe(no_mangle)]
pub extern "C" fn thunkmem_unprotect() {
    wx::lift(&Os)
}

/// Restore write protection after `thunkmem_unprotect`.
#[unsafe(no_mangle)]
pub extern "C" fn thunkmem_protect() {
    wx::restore(&Os)
}

/// Free every thunk and unmap the region. Returns how many were live.
#[unsafe(no_mangle)]
pub extern "C" fn thunkmem_teardown() -> usize {
    THUNKS.teardown()
}
