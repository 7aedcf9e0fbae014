//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;

// VirtualAlloc commits in 4 KiB pages; reservations are 64 KiB granular.
const PAGE_SIZE: usize = 4096;

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "GetCurrentProcess"]
    fn get_current_process() -> *mut c_void;

    #[link_name = "FlushInstructionCache"]
    fn flush_instruction_cache(
        h_process: *mut c_void,
        lp_base_address: *const c_void,
        dw_size: usize,
    ) -> i32;
}

pub unsafe fn page_alloc(size: usize, executable: bool) -> *mut u8 {
    let protect = if executable {
        PAGE_EXECUTE_READWRITE
    } else {
        PAGE_READWRITE
    };
    let ptr = unsafe {
        virtual_alloc(
            core::ptr::null_mut(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            protect,
        )
    };
    ptr as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8) {
    // MEM_RELEASE requires dwSize = 0 (releases entire allocation)
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

pub fn page_size() -> usize {
    PAGE_SIZE
}

pub unsafe fn flush_icache(ptr: *const u8, size: usize) {
    unsafe { flush_instruction_cache(get_current_process(), ptr as *const c_void, size) };
}
