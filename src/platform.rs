//! OS platform abstraction for executable thunk memory.
//!
//! Provides free functions that wrap the platform virtual memory APIs
//! (VirtualAlloc on Windows, mmap on Unix), the hardware W^X toggle and the
//! instruction cache flush. Under Miri, uses std::alloc as a backing store.
//!
//! The [`Platform`] trait bundles these into a capability that the rest of the
//! crate is generic over. [`Os`] is the real implementation; tests supply their
//! own to inject failures.

use core::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
    } else if #[cfg(windows)] {
        mod windows;
    } else if #[cfg(unix)] {
        mod unix;
    }
}

/// Allocate `size` bytes of readable, writable and executable memory,
/// page-aligned. Returns null on failure.
///
/// On macOS the mapping is created with `MAP_JIT`, so on Apple silicon writes
/// only succeed while [`jit_write_protect`] is disabled for the calling thread.
///
/// # Safety
/// Caller must eventually call `page_dealloc` with the returned pointer and the
/// same `size`.
#[inline]
pub unsafe fn code_alloc(size: usize) -> *mut u8 {
    cfg_if::cfg_if! {
        if #[cfg(miri)] {
            unsafe { miri::page_alloc(size) }
        } else if #[cfg(windows)] {
            unsafe { windows::page_alloc(size, true) }
        } else if #[cfg(unix)] {
            unsafe { unix::page_alloc(size, true) }
        }
    }
}

/// Allocate `size` bytes of readable and writable (never executable) memory,
/// page-aligned and zero-initialized. Returns null on failure.
///
/// # Safety
/// Caller must eventually call `page_dealloc` with the returned pointer and the
/// same `size`.
#[inline]
pub unsafe fn data_alloc(size: usize) -> *mut u8 {
    cfg_if::cfg_if! {
        if #[cfg(miri)] {
            unsafe { miri::page_alloc(size) }
        } else if #[cfg(windows)] {
            unsafe { windows::page_alloc(size, false) }
        } else if #[cfg(unix)] {
            unsafe { unix::page_alloc(size, false) }
        }
    }
}

/// Free memory previously returned by `code_alloc` or `data_alloc`.
///
/// # Safety
/// `ptr` must have been returned by one of the allocation functions above, and
/// `size` must match the original allocation size.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    cfg_if::cfg_if! {
        if #[cfg(miri)] {
            unsafe { miri::page_dealloc(ptr, size) }
        } else if #[cfg(windows)] {
            let _ = size;
            unsafe { windows::page_dealloc(ptr) }
        } else if #[cfg(unix)] {
            unsafe { unix::page_dealloc(ptr, size) }
        }
    }
}

/// The smallest page size the OS hands out.
#[inline]
pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(miri)] {
            miri::page_size()
        } else if #[cfg(windows)] {
            windows::page_size()
        } else if #[cfg(unix)] {
            unix::page_size()
        }
    }
}

/// Enable (`true`) or disable (`false`) hardware write protection of JIT pages.
///
/// Only Apple silicon enforces W^X on `MAP_JIT` pages; the setting is per
/// thread there. Everywhere else this is a no-op.
#[inline]
pub fn jit_write_protect(enabled: bool) {
    cfg_if::cfg_if! {
        if #[cfg(all(unix, not(miri)))] {
            unix::jit_write_protect(enabled)
        } else {
            let _ = enabled;
        }
    }
}

/// Make instruction fetch observe the bytes just written to
/// `[ptr, ptr + size)`.
///
/// # Safety
/// The range must lie inside a live `code_alloc` allocation.
#[inline]
pub unsafe fn flush_icache(ptr: *const u8, size: usize) {
    cfg_if::cfg_if! {
        if #[cfg(miri)] {
            let _ = (ptr, size);
        } else if #[cfg(windows)] {
            unsafe { windows::flush_icache(ptr, size) }
        } else if #[cfg(unix)] {
            unsafe { unix::flush_icache(ptr, size) }
        }
    }
}

/// Memory and CPU services the thunk allocator depends on.
///
/// Implementations must be cheap to clone: every region component keeps its
/// own handle so that it can release what it owns on drop. Stateful test
/// platforms implement this for `&'static T`.
pub trait Platform: Clone + Send + Sync {
    /// Smallest page size handed out by `reserve_code`.
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes of executable memory, aligned to at least 16 bytes.
    fn reserve_code(&self, size: usize) -> Option<NonNull<u8>>;

    /// Reserve `size` bytes of zeroed, writable, non-executable memory,
    /// aligned to at least 16 bytes.
    fn reserve_data(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a block obtained from `reserve_code` or `reserve_data`.
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one live reservation.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);

    /// Toggle hardware write protection for JIT pages on the current thread.
    fn set_write_protect(&self, enabled: bool);

    /// Synchronize instruction fetch with `[ptr, ptr + size)`.
    ///
    /// # Safety
    /// The range must lie inside a live `reserve_code` block.
    unsafe fn flush_icache(&self, ptr: NonNull<u8>, size: usize);
}

/// The host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct Os;

impl Platform for Os {
    #[inline]
    fn page_size(&self) -> usize {
        page_size()
    }

    #[inline]
    fn reserve_code(&self, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { code_alloc(size) })
    }

    #[inline]
    fn reserve_data(&self, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { data_alloc(size) })
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { page_dealloc(ptr.as_ptr(), size) }
    }

    #[inline]
    fn set_write_protect(&self, enabled: bool) {
        jit_write_protect(enabled)
    }

    #[inline]
    unsafe fn flush_icache(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { flush_icache(ptr.as_ptr(), size) }
    }
}
