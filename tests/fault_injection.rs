//! Failure at every step of region creation and allocation.
//!
//! `Faulty` forwards to the host OS but can refuse executable or data
//! reservations on demand, and keeps count of live reservations and of the
//! write-protection toggles it sees. Every failed call must leave no
//! reservation behind, leave the region and registry as they were, and
//! leave write protection on.

use std::ptr::NonNull;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::thread;
use thunkmem::config::REGISTRY_CAPACITY;
use thunkmem::{Os, OwnerToken, Platform, ThunkAllocator, ThunkError, ThunkRequest};

struct Faulty {
    fail_code: AtomicBool,
    /// Data reservations still allowed to succeed.
    data_budget: AtomicUsize,
    live: AtomicUsize,
    code_reserves: AtomicUsize,
    /// Open write windows; must be 0 between calls.
    unprotected: AtomicIsize,
    toggles: AtomicUsize,
}

impl Platform for &'static Faulty {
    fn page_size(&self) -> usize {
        Os.page_size()
    }

    fn reserve_code(&self, size: usize) -> Option<NonNull<u8>> {
        if self.fail_code.load(Ordering::SeqCst) {
            return None;
        }
        let ptr = Os.reserve_code(size)?;
        self.code_reserves.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    fn reserve_data(&self, size: usize) -> Option<NonNull<u8>> {
        self.data_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        let ptr = Os.reserve_data(size)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        unsafe { Os.release(ptr, size) }
    }

    fn set_write_protect(&self, enabled: bool) {
        self.toggles.fetch_add(1, Ordering::SeqCst);
        let delta = if enabled { -1 } else { 1 };
        self.unprotected.fetch_add(delta, Ordering::SeqCst);
        Os.set_write_protect(enabled);
    }

    unsafe fn flush_icache(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { Os.flush_icache(ptr, size) }
    }
}

fn faulty() -> &'static Faulty {
    Box::leak(Box::new(Faulty {
        fail_code: AtomicBool::new(false),
        data_budget: AtomicUsize::new(usize::MAX),
        live: AtomicUsize::new(0),
        code_reserves: AtomicUsize::new(0),
        unprotected: AtomicIsize::new(0),
        toggles: AtomicUsize::new(0),
    }))
}

fn req(size: usize, owner: usize) -> ThunkRequest {
    ThunkRequest::new(size, OwnerToken::new(owner))
}

fn assert_protected(p: &Faulty) {
    assert_eq!(p.unprotected.load(Ordering::SeqCst), 0);
}

#[test]
fn reservation_failure_leaves_no_region() {
    let p = faulty();
    p.fail_code.store(true, Ordering::SeqCst);
    let thunks = ThunkAllocator::with_region_size(p, 4096);

    let err = thunks.allocate(req(64, 1)).unwrap_err();
    assert_eq!(err, ThunkError::ResourceExhausted { size: 4096 });
    assert!(err.is_creation_failure());
    assert!(!thunks.has_region());
    assert_eq!(p.live.load(Ordering::SeqCst), 0);
    assert_protected(p);

    p.fail_code.store(false, Ordering::SeqCst);
    thunks.allocate(req(64, 1)).unwrap();
    assert!(thunks.has_region());
    assert_eq!(p.live.load(Ordering::SeqCst), 2);
}

#[test]
fn heap_creation_failure_releases_reservation() {
    let p = faulty();
    let thunks = ThunkAllocator::with_region_size(p, 16);

    let err = thunks.allocate(req(8, 1)).unwrap_err();
    assert_eq!(err, ThunkError::HeapCreationFailed { size: 16 });
    assert!(!thunks.has_region());
    assert_eq!(p.code_reserves.load(Ordering::SeqCst), 1);
    assert_eq!(p.live.load(Ordering::SeqCst), 0);
    assert_protected(p);
}

#[test]
fn registry_creation_failure_releases_heap_and_reservation() {
    let p = faulty();
    p.data_budget.store(0, Ordering::SeqCst);
    let thunks = ThunkAllocator::with_region_size(p, 4096);

    let err = thunks.allocate(req(64, 1)).unwrap_err();
    assert_eq!(err, ThunkError::RegistryCreationFailed);
    assert!(!thunks.has_region());
    assert_eq!(p.code_reserves.load(Ordering::SeqCst), 1);
    assert_eq!(p.live.load(Ordering::SeqCst), 0);
    assert_protected(p);

    p.data_budget.store(usize::MAX, Ordering::SeqCst);
    thunks.allocate(req(64, 1)).unwrap();
    assert_eq!(p.code_reserves.load(Ordering::SeqCst), 2);
    assert_eq!(thunks.live_count(), 1);
}

#[test]
fn allocation_failure_keeps_region_intact() {
    let p = faulty();
    let thunks = ThunkAllocator::with_region_size(p, 4096);
    thunks.allocate(req(4000, 1)).unwrap();
    let free = thunks.free_bytes();
    let live = p.live.load(Ordering::SeqCst);

    let err = thunks.allocate(req(200, 2)).unwrap_err();
    assert_eq!(err, ThunkError::AllocationFailed { size: 200 });
    assert_eq!(thunks.free_bytes(), free);
    assert_eq!(thunks.live_count(), 1);
    assert_eq!(p.live.load(Ordering::SeqCst), live);
    assert_protected(p);

    thunks.allocate(req(48, 3)).unwrap();
}

#[test]
fn registration_failure_frees_the_block() {
    let p = faulty();
    // The registry's initial table is the only data reservation allowed,
    // so the first insert that needs a bigger table fails.
    p.data_budget.store(1, Ordering::SeqCst);
    let thunks = ThunkAllocator::with_region_size(p, 64 * 1024);

    let fits = REGISTRY_CAPACITY * 3 / 4;
    for i in 0..fits {
        thunks.allocate(req(32, i)).unwrap();
    }
    let free = thunks.free_bytes();

    let err = thunks.allocate(req(32, fits)).unwrap_err();
    assert!(matches!(err, ThunkError::RegistrationFailed { .. }));
    assert_eq!(thunks.live_count(), fits);
    assert_eq!(thunks.free_bytes(), free);
    assert_protected(p);

    p.data_budget.store(usize::MAX, Ordering::SeqCst);
    let t = thunks.allocate(req(32, fits)).unwrap();
    assert_eq!(thunks.lookup(t), Some(OwnerToken::new(fits)));
    assert_eq!(thunks.live_count(), fits + 1);
}

#[test]
fn write_protection_restored_after_every_call() {
    let p = faulty();
    let thunks = ThunkAllocator::with_region_size(p, 4096);

    let a = thunks.allocate(req(64, 1)).unwrap();
    assert_protected(p);
    {
        let _w = thunks.write_window();
        assert_eq!(p.unprotected.load(Ordering::SeqCst), 1);
        unsafe { a.as_ptr().write_bytes(0xCC, 64) };
    }
    assert_protected(p);
    unsafe { thunks.finalize(a.as_ptr(), 64) };

    thunks.allocate(req(8000, 2)).unwrap_err();
    assert_protected(p);
    thunks.release(a).unwrap();
    assert_protected(p);
    thunks.allocate(req(64, 3)).unwrap();
    assert_eq!(thunks.teardown(), 1);
    assert_protected(p);

    assert!(p.toggles.load(Ordering::SeqCst) > 0);
    assert_eq!(p.toggles.load(Ordering::SeqCst) % 2, 0);
}

#[test]
fn concurrent_creation_reserves_once() {
    const THREADS: usize = 8;
    let p = faulty();
    let thunks = ThunkAllocator::with_region_size(p, 16 * 1024);
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for i in 0..THREADS {
            let thunks = &thunks;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                thunks.allocate(req(64, i)).unwrap();
            });
        }
    });

    assert_eq!(p.code_reserves.load(Ordering::SeqCst), 1);
    assert_eq!(thunks.live_count(), THREADS);
    assert_eq!(p.unprotected.load(Ordering::SeqCst), 0);
}

#[test]
fn teardown_returns_every_reservation() {
    let p = faulty();
    let thunks = ThunkAllocator::with_region_size(p, 64 * 1024);
    for i in 0..100 {
        thunks.allocate(req(16 + i, i)).unwrap();
    }
    assert!(p.live.load(Ordering::SeqCst) >= 2);

    assert_eq!(thunks.teardown(), 100);
    assert_eq!(p.live.load(Ordering::SeqCst), 0);
    assert!(!thunks.has_region());

    thunks.allocate(req(16, 0)).unwrap();
    assert_eq!(p.code_reserves.load(Ordering::SeqCst), 2);
    drop(thunks);
    assert_eq!(p.live.load(Ordering::SeqCst), 0);
}
