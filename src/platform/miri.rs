//! Miri-compatible platform shim using std::alloc as backing store.
//!
//! Miri can't execute real OS syscalls (mmap/VirtualAlloc), so we use the
//! system allocator to provide page-aligned memory. Nothing is ever executed
//! under Miri, so the W^X toggle and cache flush have no counterpart here.

extern crate alloc;

use core::alloc::Layout;

const PAGE_SIZE: usize = 4096;

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    match Layout::from_size_align(size, PAGE_SIZE) {
        Ok(layout) if size > 0 => unsafe { alloc::alloc::alloc_zeroed(layout) },
        _ => core::ptr::null_mut(),
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    if let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) {
        unsafe { alloc::alloc::dealloc(ptr, layout) };
    }
}

pub fn page_size() -> usize {
    PAGE_SIZE
}
