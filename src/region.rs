//! The executable region behind a thunk allocator.
//!
//! A region is three resources acquired in order: the OS reservation, the
//! heap laid over it, and the address registry. Each is owned by a value
//! whose drop releases it, so a failure part-way through creation unwinds
//! exactly what was acquired, and a live region tears down in reverse order.

use crate::error::ThunkError;
use crate::heap::ThunkHeap;
use crate::platform::Platform;
use crate::registry::Registry;
use crate::wx::WriteWindow;
use crate::{debug_log, stat_inc};
use core::ptr::NonNull;

/// An OS block of executable memory, released on drop.
pub struct Reservation<P: Platform> {
    base: NonNull<u8>,
    size: usize,
    platform: P,
}

// SAFETY: the reservation is owned exclusively; the memory has no thread
// affinity.
unsafe impl<P: Platform> Send for Reservation<P> {}

impl<P: Platform> Reservation<P> {
    pub fn new(platform: P, size: usize) -> Option<Self> {
        let base = platform.reserve_code(size)?;
        Some(Self {
            base,
            size,
            platform,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<P: Platform> Drop for Reservation<P> {
    fn drop(&mut self) {
        debug_log!("[region] release base={:p} size={}", self.base, self.size);
        unsafe { self.platform.release(self.base, self.size) };
    }
}

pub struct ThunkRegion<P: Platform> {
    // Field order is drop order: registry, heap, then the OS block.
    pub(crate) registry: Registry<P>,
    pub(crate) heap: ThunkHeap,
    reservation: Reservation<P>,
}

impl<P: Platform> ThunkRegion<P> {
    /// Reserve `size` bytes, lay a heap over them and attach an empty
    /// registry with `registry_capacity` slots.
    pub fn create(
        platform: &P,
        size: usize,
        registry_capacity: usize,
    ) -> Result<Self, ThunkError> {
        let reservation = Reservation::new(platform.clone(), size).ok_or_else(|| {
            debug_log!("[region] reserve failed size={}", size);
            ThunkError::ResourceExhausted { size }
        })?;

        let heap = {
            let _window = WriteWindow::open(platform);
            unsafe { ThunkHeap::create(reservation.base(), size) }
        };
        let heap = heap.ok_or_else(|| {
            debug_log!("[region] heap create failed base={:p}", reservation.base());
            ThunkError::HeapCreationFailed { size }
        })?;

        let registry = Registry::new(platform.clone(), registry_capacity).ok_or_else(|| {
            debug_log!("[region] registry create failed");
            ThunkError::RegistryCreationFailed
        })?;

        debug_log!(
            "[region] created base={:p} size={}",
            reservation.base(),
            size
        );
        stat_inc!(regions_created);
        Ok(Self {
            registry,
            heap,
            reservation,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.reservation.base()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.reservation.size()
    }
}

impl<P: Platform> Drop for ThunkRegion<P> {
    fn drop(&mut self) {
        debug_log!("[region] teardown live={}", self.registry.len());
        stat_inc!(regions_destroyed);
    }
}
