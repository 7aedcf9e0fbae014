//! Top-level thunk allocator: owns the region and serializes access to it.
//!
//! One `ThunkAllocator` belongs to one runtime instance. It holds at most one
//! [`ThunkRegion`], created lazily by the first allocation under the same
//! lock that guards every later mutation, so concurrent first callers can
//! never create two.
//!
//! Flow for a caller:
//!
//! ```ignore
//! let thunk = thunks.allocate(ThunkRequest::new(len, owner))?;
//! {
//!     let _w = thunks.write_window();
//!     unsafe { core::ptr::copy_nonoverlapping(code.as_ptr(), thunk.as_ptr(), len) };
//! }
//! unsafe { thunks.finalize(thunk.as_ptr(), len) };
//! // ... native code may now call through `thunk` ...
//! thunks.release(thunk);
//! ```

use crate::config::{REGION_SIZE, REGISTRY_CAPACITY};
use crate::error::ThunkError;
use crate::platform::{Os, Platform};
use crate::region::ThunkRegion;
use crate::registry::OwnerToken;
use crate::sync::SpinMutex;
use crate::wx::WriteWindow;
use crate::{debug_log, stat_add, stat_inc};
use core::ptr::NonNull;

/// What a code generator asks for: `size` bytes of thunk memory on behalf
/// of `owner`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThunkRequest {
    pub size: usize,
    pub owner: OwnerToken,
}

impl ThunkRequest {
    #[inline]
    pub const fn new(size: usize, owner: OwnerToken) -> Self {
        Self { size, owner }
    }
}

pub struct ThunkAllocator<P: Platform = Os> {
    platform: P,
    /// Bytes per region; 0 means one OS page.
    region_size: usize,
    registry_capacity: usize,
    region: SpinMutex<Option<ThunkRegion<P>>>,
}

impl<P: Platform> ThunkAllocator<P> {
    /// An allocator using the build-time configuration. No memory is
    /// reserved until the first `allocate`.
    pub const fn new(platform: P) -> Self {
        Self::with_region_size(platform, REGION_SIZE)
    }

    /// An allocator whose region spans `region_size` bytes (0 = one OS page).
    pub const fn with_region_size(platform: P, region_size: usize) -> Self {
        Self {
            platform,
            region_size,
            registry_capacity: REGISTRY_CAPACITY,
            region: SpinMutex::new(None),
        }
    }

    /// Hand out a block of at least `request.size` bytes of executable
    /// memory and record `request.owner` for it.
    ///
    /// On failure nothing acquired by this call survives: the region keeps
    /// its free space and the registry its size, or, if the region itself
    /// could not be created, the allocator stays without one so a later call
    /// can retry.
    ///
    /// # Panics
    ///
    /// Panics if `request.size` is 0, before any lock or memory is touched.
    pub fn allocate(&self, request: ThunkRequest) -> Result<NonNull<u8>, ThunkError> {
        assert!(request.size > 0, "thunk size must be > 0");
        let size = request.size;

        let mut guard = self.region.lock();
        let region = match &mut *guard {
            slot @ None => slot.insert(self.create_region()?),
            Some(region) => region,
        };

        let thunk = {
            let _window = WriteWindow::open(&self.platform);
            unsafe { region.heap.allocate(size) }
        };
        let Some(thunk) = thunk else {
            debug_log!("[alloc] no room size={} free={}", size, region.heap.free_bytes());
            stat_inc!(alloc_failures);
            return Err(ThunkError::AllocationFailed { size });
        };

        if let Err(err) = region.registry.insert(thunk, request.owner) {
            debug_log!("[alloc] register failed thunk={:p} size={}", thunk, size);
            let _window = WriteWindow::open(&self.platform);
            unsafe { region.heap.free(thunk) };
            stat_inc!(registration_failures);
            return Err(err);
        }

        stat_inc!(thunk_allocs);
        stat_add!(alloc_bytes, size);
        Ok(thunk)
    }

    /// Make the bytes just generated into `[thunk, thunk + size)` visible to
    /// instruction fetch. Must be called once per thunk, after all code is
    /// written and before the thunk is first called. A null `thunk` is
    /// ignored.
    ///
    /// Does not take the lock.
    ///
    /// # Safety
    ///
    /// A non-null `thunk` must come from `allocate` on this allocator, not
    /// yet released, with `size` no larger than the requested size.
    pub unsafe fn finalize(&self, thunk: *const u8, size: usize) {
        let Some(thunk) = NonNull::new(thunk as *mut u8) else {
            return;
        };
        stat_inc!(icache_flushes);
        unsafe { self.platform.flush_icache(thunk, size) };
    }

    /// Open a write window for a code generator filling in a thunk.
    ///
    /// With `std` the window may stay open across further `allocate` calls
    /// on the same thread. Without `std` windows do not nest, so close it
    /// before allocating again.
    #[inline]
    pub fn write_window(&self) -> WriteWindow<'_, P> {
        WriteWindow::open(&self.platform)
    }

    /// Owner recorded for the live thunk at `thunk`.
    pub fn lookup(&self, thunk: NonNull<u8>) -> Option<OwnerToken> {
        self.region.lock().as_ref()?.registry.get(thunk)
    }

    /// Payload bytes behind the live thunk at `thunk`; at least the size
    /// that was requested.
    pub fn usable_size(&self, thunk: NonNull<u8>) -> Option<usize> {
        let guard = self.region.lock();
        let region = guard.as_ref()?;
        region.registry.get(thunk)?;
        region.heap.usable_size(thunk)
    }

    /// Free one thunk, returning the owner it was allocated for. Unknown
    /// addresses are ignored and yield `None`.
    pub fn release(&self, thunk: NonNull<u8>) -> Option<OwnerToken> {
        let mut guard = self.region.lock();
        let region = guard.as_mut()?;
        let owner = region.registry.remove(thunk)?;

        let _window = WriteWindow::open(&self.platform);
        let freed = unsafe { region.heap.free(thunk) };
        debug_assert!(freed.is_some(), "registered thunk {thunk:p} not in heap");
        stat_inc!(thunk_releases);
        Some(owner)
    }

    /// Free every thunk allocated for `owner`, e.g. when the native scope
    /// it belongs to ends. Returns how many were freed.
    pub fn release_owner(&self, owner: OwnerToken) -> usize {
        let mut guard = self.region.lock();
        let Some(region) = guard.as_mut() else {
            return 0;
        };

        let _window = WriteWindow::open(&self.platform);
        let heap = &mut region.heap;
        let released = region.registry.remove_owned_by(owner, |thunk| {
            unsafe { heap.free(thunk) };
        });
        stat_add!(thunk_releases, released);
        debug_log!("[release] owner={:#x} released={}", owner.value(), released);
        released
    }

    /// Free every live thunk and give the region back to the OS. Returns how
    /// many thunks were still live. The next `allocate` starts a new region.
    pub fn teardown(&self) -> usize {
        let region = self.region.lock().take();
        region.map_or(0, |region| self.reclaim(region))
    }

    /// Whether the region has been created.
    pub fn has_region(&self) -> bool {
        self.region.lock().is_some()
    }

    /// Number of live thunks.
    pub fn live_count(&self) -> usize {
        self.region
            .lock()
            .as_ref()
            .map_or(0, |region| region.registry.len())
    }

    /// Free bytes left in the region, or `None` before it exists.
    pub fn free_bytes(&self) -> Option<usize> {
        self.region
            .lock()
            .as_ref()
            .map(|region| region.heap.free_bytes())
    }

    /// Base address and size of the region, or `None` before it exists.
    pub fn region_bounds(&self) -> Option<(NonNull<u8>, usize)> {
        self.region
            .lock()
            .as_ref()
            .map(|region| (region.base(), region.size()))
    }

    fn reclaim(&self, mut region: ThunkRegion<P>) -> usize {
        let released = {
            let _window = WriteWindow::open(&self.platform);
            let heap = &mut region.heap;
            region.registry.drain(|thunk, _| {
                unsafe { heap.free(thunk) };
            })
        };
        debug_assert_eq!(region.heap.live(), 0);
        stat_add!(thunk_releases, released);
        released
    }

    fn create_region(&self) -> Result<ThunkRegion<P>, ThunkError> {
        let size = match self.region_size {
            0 => self.platform.page_size(),
            n => n,
        };
        ThunkRegion::create(&self.platform, size, self.registry_capacity).inspect_err(|_err| {
            debug_log!("[alloc] region create failed: {}", _err);
            stat_inc!(region_create_failures);
        })
    }
}

impl<P: Platform> Drop for ThunkAllocator<P> {
    fn drop(&mut self) {
        if let Some(region) = self.region.get_mut().take() {
            self.reclaim(region);
        }
    }
}

impl Default for ThunkAllocator<Os> {
    fn default() -> Self {
        Self::new(Os)
    }
}
