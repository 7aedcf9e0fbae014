//! Thunk heap: a first-fit suballocator laid over one executable region.
//!
//! Block headers live in-band, directly in front of each payload:
//!
//! ```text
//! base                                                      base + capacity
//! | hdr | payload ... | hdr | payload ........ | hdr | payload |
//! ```
//!
//! A header's `size` covers header plus payload, with bit 0 marking the block
//! in use. `prev_size` is the size of the physically preceding block (0 for
//! the first block), so both neighbours are reachable in O(1) when a freed
//! block is coalesced.
//!
//! The headers sit inside the executable region. On W^X targets every
//! mutating call must therefore run inside a `WriteWindow`.

use crate::config::MIN_SPLIT;
use core::mem::size_of;
use core::ptr::{self, NonNull};

/// Payload granularity and alignment.
pub const GRANULE: usize = 16;

const IN_USE: usize = 1;

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct BlockHeader {
    size: usize,
    prev_size: usize,
}

/// Bytes of bookkeeping in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest region a heap can be created over: one header and one granule.
pub const MIN_HEAP_SIZE: usize = HEADER_SIZE + GRANULE;

#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

pub struct ThunkHeap {
    base: NonNull<u8>,
    /// Usable bytes, rounded down to `GRANULE`.
    capacity: usize,
    /// Bytes held by in-use blocks, headers included.
    allocated: usize,
    /// Number of in-use blocks.
    live: usize,
}

// SAFETY: ThunkHeap is only accessed under the region lock. The buffer it
// points into is owned by the enclosing region.
unsafe impl Send for ThunkHeap {}

impl ThunkHeap {
    /// Lay out a heap over `[base, base + size)` as a single free block.
    /// Returns `None` if the buffer is misaligned or too small.
    ///
    /// # Safety
    ///
    /// The buffer must stay valid and writable for the heap's lifetime, and
    /// the call must happen inside a write window.
    pub unsafe fn create(base: NonNull<u8>, size: usize) -> Option<Self> {
        if (base.as_ptr() as usize) % GRANULE != 0 {
            return None;
        }
        let capacity = size & !(GRANULE - 1);
        if capacity < MIN_HEAP_SIZE {
            return None;
        }

        let heap = Self {
            base,
            capacity,
            allocated: 0,
            live: 0,
        };
        unsafe {
            heap.write_header(
                0,
                BlockHeader {
                    size: capacity,
                    prev_size: 0,
                },
            )
        };
        Some(heap)
    }

    /// Carve a block with room for `size` payload bytes out of the first free
    /// block that fits. Returns the 16-byte aligned payload address.
    ///
    /// # Safety
    ///
    /// Caller must hold the region lock and an open write window.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > self.capacity - HEADER_SIZE {
            return None;
        }
        let need = HEADER_SIZE + round_up(size, GRANULE);

        let mut off = 0;
        while off < self.capacity {
            let hdr = unsafe { self.header(off) };
            let block = hdr.size & !IN_USE;
            if hdr.size & IN_USE == 0 && block >= need {
                unsafe { self.carve(off, hdr, need) };
                return NonNull::new(unsafe { self.base.as_ptr().add(off + HEADER_SIZE) });
            }
            off += block;
        }
        None
    }

    /// Return a block to the heap, merging it with free neighbours.
    /// Returns the payload size that was released, or `None` if `ptr` does
    /// not name an in-use block of this heap.
    ///
    /// # Safety
    ///
    /// Caller must hold the region lock and an open write window. `ptr` must
    /// not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        let off = self.block_offset(ptr)?;
        let hdr = unsafe { self.header(off) };
        if hdr.size & IN_USE == 0 {
            return None;
        }

        let freed = hdr.size & !IN_USE;
        self.allocated -= freed;
        self.live -= 1;

        let mut start = off;
        let mut size = freed;
        let mut prev_size = hdr.prev_size;

        let next = start + size;
        if next < self.capacity {
            let right = unsafe { self.header(next) };
            if right.size & IN_USE == 0 {
                size += right.size;
            }
        }

        if prev_size != 0 {
            let left_off = start - prev_size;
            let left = unsafe { self.header(left_off) };
            if left.size & IN_USE == 0 {
                start = left_off;
                size += left.size;
                prev_size = left.prev_size;
            }
        }

        unsafe {
            self.write_header(start, BlockHeader { size, prev_size });
            self.link_next(start, size);
        }
        Some(freed - HEADER_SIZE)
    }

    /// Payload bytes available behind an in-use block. May exceed the size
    /// that was requested.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let off = self.block_offset(ptr)?;
        let hdr = unsafe { self.header(off) };
        if hdr.size & IN_USE == 0 {
            return None;
        }
        Some((hdr.size & !IN_USE) - HEADER_SIZE)
    }

    /// Whether `ptr` lies inside the heap's buffer.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Bytes not held by in-use blocks (headers of free blocks included).
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity - self.allocated
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of in-use blocks.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Use the first `need` bytes of the free block at `off`; split off the
    /// remainder when it is big enough to be useful on its own.
    unsafe fn carve(&mut self, off: usize, hdr: BlockHeader, need: usize) {
        let block = hdr.size;
        let rest = block - need;
        let used = if rest >= HEADER_SIZE + MIN_SPLIT {
            unsafe {
                self.write_header(
                    off + need,
                    BlockHeader {
                        size: rest,
                        prev_size: need,
                    },
                );
                self.link_next(off + need, rest);
            }
            need
        } else {
            block
        };

        unsafe {
            self.write_header(
                off,
                BlockHeader {
                    size: used | IN_USE,
                    prev_size: hdr.prev_size,
                },
            )
        };
        self.allocated += used;
        self.live += 1;
    }

    /// Point the block following `[off, off + size)` back at it.
    unsafe fn link_next(&mut self, off: usize, size: usize) {
        let next = off + size;
        if next < self.capacity {
            let mut hdr = unsafe { self.header(next) };
            hdr.prev_size = size;
            unsafe { self.write_header(next, hdr) };
        }
    }

    /// Header offset for a payload pointer, if it is plausibly one of ours.
    fn block_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        let payload = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        if payload < HEADER_SIZE || payload % GRANULE != 0 {
            return None;
        }
        Some(payload - HEADER_SIZE)
    }

    #[inline]
    unsafe fn header(&self, off: usize) -> BlockHeader {
        unsafe { ptr::read(self.base.as_ptr().add(off) as *const BlockHeader) }
    }

    #[inline]
    unsafe fn write_header(&self, off: usize, hdr: BlockHeader) {
        unsafe { ptr::write(self.base.as_ptr().add(off) as *mut BlockHeader, hdr) };
    }

    /// Walk every block and check the header chain is consistent.
    #[cfg(test)]
    pub(crate) fn check(&self) {
        let mut off = 0;
        let mut prev = 0;
        let mut allocated = 0;
        let mut live = 0;
        let mut prev_free = false;
        while off < self.capacity {
            let hdr = unsafe { self.header(off) };
            let size = hdr.size & !IN_USE;
            let free = hdr.size & IN_USE == 0;
            assert!(size >= HEADER_SIZE, "block at {off} too small: {size}");
            assert_eq!(size % GRANULE, 0, "block at {off} misaligned");
            assert_eq!(hdr.prev_size, prev, "bad back link at {off}");
            assert!(!(free && prev_free), "uncoalesced free blocks at {off}");
            if !free {
                allocated += size;
                live += 1;
            }
            prev_free = free;
            prev = size;
            off += size;
        }
        assert_eq!(off, self.capacity);
        assert_eq!(allocated, self.allocated);
        assert_eq!(live, self.live);
    }
}
