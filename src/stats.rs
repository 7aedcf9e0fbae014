//! Thunk memory statistics counters.
//!
//! All counters use `Relaxed` ordering; they are observational only. The
//! region lock provides the ordering guarantees for correctness.
//!
//! # Usage
//!
//! ```ignore
//! let snap = thunkmem::stats::snapshot();
//! println!("live thunks: {}", snap.thunk_allocs - snap.thunk_releases);
//! ```
//!
//! Counters are process-wide and shared by every `ThunkAllocator`. Individual
//! loads are atomic, the snapshot as a whole is not.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Successful `allocate` calls.
    pub thunk_allocs: AtomicU64,
    /// Sum of requested thunk sizes for successful allocations.
    pub alloc_bytes: AtomicU64,
    /// `allocate` calls that found no room in the region.
    pub alloc_failures: AtomicU64,
    /// Allocations rolled back because the registry rejected the entry.
    pub registration_failures: AtomicU64,
    /// Thunks returned to the heap (single release, owner release or teardown).
    pub thunk_releases: AtomicU64,
    /// Regions created.
    pub regions_created: AtomicU64,
    /// Region creations that failed and were unwound.
    pub region_create_failures: AtomicU64,
    /// Regions torn down.
    pub regions_destroyed: AtomicU64,
    /// Instruction cache flushes issued by `finalize`.
    pub icache_flushes: AtomicU64,
    /// Write windows opened (W^X toggles off/on pairs).
    pub write_windows: AtomicU64,
    /// Times a thread found the region lock held and had to spin.
    pub lock_contended: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            thunk_allocs: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            registration_failures: AtomicU64::new(0),
            thunk_releases: AtomicU64::new(0),
            regions_created: AtomicU64::new(0),
            region_create_failures: AtomicU64::new(0),
            regions_destroyed: AtomicU64::new(0),
            icache_flushes: AtomicU64::new(0),
            write_windows: AtomicU64::new(0),
            lock_contended: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all thunk memory statistics.
///
/// Obtain a snapshot with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub thunk_allocs: u64,
    pub alloc_bytes: u64,
    pub alloc_failures: u64,
    pub registration_failures: u64,
    pub thunk_releases: u64,
    pub regions_created: u64,
    pub region_create_failures: u64,
    pub regions_destroyed: u64,
    pub icache_flushes: u64,
    pub write_windows: u64,
    pub lock_contended: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        thunk_allocs: s.thunk_allocs.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        alloc_failures: s.alloc_failures.load(Ordering::Relaxed),
        registration_failures: s.registration_failures.load(Ordering::Relaxed),
        thunk_releases: s.thunk_releases.load(Ordering::Relaxed),
        regions_created: s.regions_created.load(Ordering::Relaxed),
        region_create_failures: s.region_create_failures.load(Ordering::Relaxed),
        regions_destroyed: s.regions_destroyed.load(Ordering::Relaxed),
        icache_flushes: s.icache_flushes.load(Ordering::Relaxed),
        write_windows: s.write_windows.load(Ordering::Relaxed),
        lock_contended: s.lock_contended.load(Ordering::Relaxed),
    }
}
