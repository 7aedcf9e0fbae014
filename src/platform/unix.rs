//! Unix virtual memory implementation using mmap/munmap.

use core::ffi::{c_long, c_void};

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const PROT_EXEC: i32 = 0x4;
const MAP_PRIVATE: i32 = 0x02;
#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_ANONYMOUS: i32 = 0x20;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_ANONYMOUS: i32 = 0x1000;
#[cfg(target_os = "macos")]
const MAP_JIT: i32 = 0x800;
#[cfg(not(target_os = "macos"))]
const MAP_JIT: i32 = 0;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SC_PAGESIZE: i32 = 30;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SC_PAGESIZE: i32 = 29;

const FALLBACK_PAGE_SIZE: usize = 4096;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    ))]
    fn sysconf(name: i32) -> c_long;
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe extern "C" {
    fn pthread_jit_write_protect_np(enabled: i32);
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut c_void, len: usize);
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64")
))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut c_void, end: *mut c_void);
}

pub unsafe fn page_alloc(size: usize, executable: bool) -> *mut u8 {
    let (prot, flags) = if executable {
        (
            PROT_READ | PROT_WRITE | PROT_EXEC,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_JIT,
        )
    } else {
        (PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS)
    };
    let ptr = unsafe { mmap(core::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

pub fn page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios"
        ))] {
            let size = unsafe { sysconf(SC_PAGESIZE) };
            if size > 0 {
                size as usize
            } else {
                FALLBACK_PAGE_SIZE
            }
        } else {
            FALLBACK_PAGE_SIZE
        }
    }
}

pub fn jit_write_protect(enabled: bool) {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
            unsafe { pthread_jit_write_protect_np(enabled as i32) };
        } else {
            let _ = enabled;
        }
    }
}

pub unsafe fn flush_icache(ptr: *const u8, size: usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            unsafe { sys_icache_invalidate(ptr as *mut c_void, size) };
        } else if #[cfg(all(
            any(target_os = "linux", target_os = "android"),
            any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64")
        ))] {
            let begin = ptr as *mut c_void;
            let end = unsafe { ptr.add(size) } as *mut c_void;
            unsafe { __clear_cache(begin, end) };
        } else {
            // x86 keeps instruction fetch coherent with stores.
            let _ = (ptr, size);
        }
    }
}
