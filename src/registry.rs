//! Address-indexed metadata for live thunks.
//!
//! An open-addressing hash table mapping a thunk's address to the token of
//! the object that owns it. The hash is the address itself; the bucket index
//! spreads it with a Fibonacci multiplier since heap addresses share their
//! low bits. Collisions probe linearly and deletion shifts the following run
//! back, so there are no tombstones.
//!
//! Slot storage comes from the platform as plain data pages, not from the
//! executable region. It doubles at 3/4 load; if the platform cannot supply
//! the bigger table the insert fails and the table is left untouched.

use crate::debug_log;
use crate::error::ThunkError;
use crate::platform::Platform;
use core::mem::size_of;
use core::ptr::{self, NonNull};

/// Opaque identity of the object that owns a thunk.
///
/// The registry stores and returns it verbatim and never dereferences it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OwnerToken(usize);

impl OwnerToken {
    #[inline]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn value(self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    /// Thunk address; 0 marks an empty slot.
    addr: usize,
    owner: OwnerToken,
}

const EMPTY: Slot = Slot {
    addr: 0,
    owner: OwnerToken(0),
};

const FIBONACCI: usize = 0x9E37_79B9_7F4A_7C15_u64 as usize;

pub struct Registry<P: Platform> {
    slots: NonNull<Slot>,
    /// Always a power of two.
    capacity: usize,
    len: usize,
    platform: P,
}

// SAFETY: the slot table is owned exclusively and only touched under the
// region lock.
unsafe impl<P: Platform> Send for Registry<P> {}

impl<P: Platform> Registry<P> {
    /// Create an empty registry with room for `capacity` slots (rounded up to
    /// a power of two). Returns `None` if the platform has no memory.
    pub fn new(platform: P, capacity: usize) -> Option<Self> {
        let capacity = capacity.max(4).next_power_of_two();
        let slots = Self::alloc_slots(&platform, capacity)?;
        Some(Self {
            slots,
            capacity,
            len: 0,
            platform,
        })
    }

    /// Record `owner` for the thunk at `addr`.
    ///
    /// Addresses come from the thunk heap and are unique among live thunks;
    /// inserting one that is already present replaces its owner.
    pub fn insert(&mut self, addr: NonNull<u8>, owner: OwnerToken) -> Result<(), ThunkError> {
        let key = addr.as_ptr() as usize;
        if (self.len + 1) * 4 > self.capacity * 3 {
            self.grow()
                .ok_or(ThunkError::RegistrationFailed { address: key })?;
        }

        let mask = self.capacity - 1;
        let mut idx = self.bucket(key);
        loop {
            let slot = unsafe { self.slot(idx) };
            if slot.addr == 0 {
                unsafe { self.set_slot(idx, Slot { addr: key, owner }) };
                self.len += 1;
                return Ok(());
            }
            if slot.addr == key {
                debug_assert!(false, "thunk {key:#x} registered twice");
                unsafe { self.set_slot(idx, Slot { addr: key, owner }) };
                return Ok(());
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Owner of the thunk at `addr`, if it is registered.
    pub fn get(&self, addr: NonNull<u8>) -> Option<OwnerToken> {
        self.find_index(addr.as_ptr() as usize)
            .map(|idx| unsafe { self.slot(idx) }.owner)
    }

    /// Forget the thunk at `addr`, returning its owner.
    pub fn remove(&mut self, addr: NonNull<u8>) -> Option<OwnerToken> {
        let idx = self.find_index(addr.as_ptr() as usize)?;
        let owner = unsafe { self.slot(idx) }.owner;
        self.remove_at(idx);
        Some(owner)
    }

    /// Forget every thunk owned by `owner` in a single pass over the table,
    /// handing each address to `on_remove`. Returns how many were removed.
    pub fn remove_owned_by(
        &mut self,
        owner: OwnerToken,
        mut on_remove: impl FnMut(NonNull<u8>),
    ) -> usize {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.capacity {
            let slot = unsafe { self.slot(idx) };
            if slot.owner == owner {
                if let Some(addr) = NonNull::new(slot.addr as *mut u8) {
                    // The backward shift may have pulled an unvisited entry
                    // into `idx`, so look at it again.
                    self.remove_at(idx);
                    on_remove(addr);
                    removed += 1;
                    continue;
                }
            }
            idx += 1;
        }
        removed
    }

    /// Empty the table in one pass, handing every address to `on_remove`.
    /// Returns how many entries there were.
    pub fn drain(&mut self, mut on_remove: impl FnMut(NonNull<u8>, OwnerToken)) -> usize {
        let drained = self.len;
        for idx in 0..self.capacity {
            let slot = unsafe { self.slot(idx) };
            if let Some(addr) = NonNull::new(slot.addr as *mut u8) {
                unsafe { self.set_slot(idx, EMPTY) };
                on_remove(addr, slot.owner);
            }
        }
        self.len = 0;
        drained
    }

    /// Empty the occupied slot `idx`.
    fn remove_at(&mut self, idx: usize) {
        // Backward shift: pull later members of the probe run into the hole
        // unless that would move them in front of their home bucket.
        let mask = self.capacity - 1;
        let mut hole = idx;
        let mut j = idx;
        loop {
            j = (j + 1) & mask;
            let slot = unsafe { self.slot(j) };
            if slot.addr == 0 {
                break;
            }
            let home = self.bucket(slot.addr);
            if (j.wrapping_sub(home) & mask) >= (j.wrapping_sub(hole) & mask) {
                unsafe { self.set_slot(hole, slot) };
                hole = j;
            }
        }
        unsafe { self.set_slot(hole, EMPTY) };
        self.len -= 1;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn find_index(&self, key: usize) -> Option<usize> {
        if key == 0 {
            return None;
        }
        let mask = self.capacity - 1;
        let mut idx = self.bucket(key);
        loop {
            let slot = unsafe { self.slot(idx) };
            if slot.addr == key {
                return Some(idx);
            }
            if slot.addr == 0 {
                return None;
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Double the table. Leaves it untouched and returns `None` when the
    /// platform cannot supply the larger one.
    fn grow(&mut self) -> Option<()> {
        let new_capacity = self.capacity.checked_mul(2)?;
        let new_slots = Self::alloc_slots(&self.platform, new_capacity)?;
        debug_log!("[registry] grow {} -> {}", self.capacity, new_capacity);

        let old_slots = self.slots;
        let old_capacity = self.capacity;
        self.slots = new_slots;
        self.capacity = new_capacity;

        let mask = new_capacity - 1;
        for idx in 0..old_capacity {
            let slot = unsafe { ptr::read(old_slots.as_ptr().add(idx)) };
            if slot.addr == 0 {
                continue;
            }
            let mut j = self.bucket(slot.addr);
            while unsafe { self.slot(j) }.addr != 0 {
                j = (j + 1) & mask;
            }
            unsafe { self.set_slot(j, slot) };
        }

        unsafe { Self::free_slots(&self.platform, old_slots, old_capacity) };
        Some(())
    }

    #[inline]
    fn bucket(&self, key: usize) -> usize {
        let bits = self.capacity.trailing_zeros();
        key.wrapping_mul(FIBONACCI) >> (usize::BITS - bits)
    }

    #[inline]
    unsafe fn slot(&self, idx: usize) -> Slot {
        debug_assert!(idx < self.capacity);
        unsafe { ptr::read(self.slots.as_ptr().add(idx)) }
    }

    #[inline]
    unsafe fn set_slot(&mut self, idx: usize, slot: Slot) {
        debug_assert!(idx < self.capacity);
        unsafe { ptr::write(self.slots.as_ptr().add(idx), slot) };
    }

    fn alloc_slots(platform: &P, capacity: usize) -> Option<NonNull<Slot>> {
        let bytes = capacity.checked_mul(size_of::<Slot>())?;
        let raw = platform.reserve_data(bytes)?;
        let slots = raw.cast::<Slot>();
        for idx in 0..capacity {
            unsafe { ptr::write(slots.as_ptr().add(idx), EMPTY) };
        }
        Some(slots)
    }

    unsafe fn free_slots(platform: &P, slots: NonNull<Slot>, capacity: usize) {
        unsafe { platform.release(slots.cast(), capacity * size_of::<Slot>()) };
    }
}

impl<P: Platform> Drop for Registry<P> {
    fn drop(&mut self) {
        unsafe { Self::free_slots(&self.platform, self.slots, self.capacity) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Os;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn addr(n: usize) -> NonNull<u8> {
        NonNull::new((0x7000_0000 + n * 16) as *mut u8).unwrap()
    }

    #[test]
    fn test_insert_get_remove() {
        let mut reg = Registry::new(Os, 8).unwrap();
        reg.insert(addr(1), OwnerToken::new(11)).unwrap();
        reg.insert(addr(2), OwnerToken::new(22)).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(addr(1)), Some(OwnerToken::new(11)));
        assert_eq!(reg.get(addr(3)), None);
        assert_eq!(reg.remove(addr(1)), Some(OwnerToken::new(11)));
        assert_eq!(reg.get(addr(1)), None);
        assert_eq!(reg.remove(addr(1)), None);
        assert_eq!(reg.get(addr(2)), Some(OwnerToken::new(22)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_grows_and_keeps_entries() {
        let mut reg = Registry::new(Os, 4).unwrap();
        for n in 1..=200 {
            reg.insert(addr(n), OwnerToken::new(n)).unwrap();
        }
        assert!(reg.capacity() >= 256);
        assert_eq!(reg.len(), 200);
        for n in 1..=200 {
            assert_eq!(reg.get(addr(n)), Some(OwnerToken::new(n)));
        }
        let mut seen = 0;
        assert_eq!(reg.drain(|_, _| seen += 1), 200);
        assert_eq!(seen, 200);
        assert!(reg.is_empty());
        assert_eq!(reg.get(addr(1)), None);
    }

    #[test]
    fn test_remove_keeps_probe_runs_intact() {
        let mut reg = Registry::new(Os, 64).unwrap();
        let keys: Vec<usize> = (1..=40).collect();
        for &n in &keys {
            reg.insert(addr(n), OwnerToken::new(n)).unwrap();
        }
        // Remove every third entry, then check all survivors are reachable.
        for &n in keys.iter().filter(|n| *n % 3 == 0) {
            assert_eq!(reg.remove(addr(n)), Some(OwnerToken::new(n)));
        }
        for &n in &keys {
            let expected = (n % 3 != 0).then(|| OwnerToken::new(n));
            assert_eq!(reg.get(addr(n)), expected, "key {n}");
        }
        assert_eq!(reg.len(), keys.len() - keys.len() / 3);
    }

    #[test]
    fn test_remove_owned_by() {
        let mut reg = Registry::new(Os, 16).unwrap();
        let scope = OwnerToken::new(0xABC);
        reg.insert(addr(1), scope).unwrap();
        reg.insert(addr(2), OwnerToken::new(1)).unwrap();
        reg.insert(addr(3), scope).unwrap();
        let mut freed = Vec::new();
        assert_eq!(reg.remove_owned_by(scope, |a| freed.push(a)), 2);
        freed.sort_unstable();
        assert_eq!(freed, [addr(1), addr(3)]);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(addr(2)), Some(OwnerToken::new(1)));
        assert_eq!(reg.remove_owned_by(scope, |_| panic!("nothing left")), 0);
    }

    #[test]
    fn test_remove_owned_by_across_wrapped_run() {
        let mut reg = Registry::new(Os, 16).unwrap();
        // Keys whose home is the last bucket probe into slots 0, 1, ...
        let last = reg.capacity() - 1;
        let wrapped: Vec<usize> = (1..10_000)
            .filter(|&n| reg.bucket(addr(n).as_ptr() as usize) == last)
            .take(4)
            .collect();
        assert_eq!(wrapped.len(), 4);
        let scope = OwnerToken::new(7);
        for (i, &n) in wrapped.iter().enumerate() {
            let owner = if i % 2 == 0 { scope } else { OwnerToken::new(n) };
            reg.insert(addr(n), owner).unwrap();
        }

        assert_eq!(reg.remove_owned_by(scope, |_| {}), 2);
        assert_eq!(reg.len(), 2);
        for (i, &n) in wrapped.iter().enumerate() {
            let expected = (i % 2 == 1).then(|| OwnerToken::new(n));
            assert_eq!(reg.get(addr(n)), expected, "key {n}");
        }
    }

    #[test]
    fn test_remove_owned_by_large_table() {
        let mut reg = Registry::new(Os, 4).unwrap();
        let scope = OwnerToken::new(1);
        for n in 1..=20_000 {
            let owner = if n % 4 == 0 { OwnerToken::new(2) } else { scope };
            reg.insert(addr(n), owner).unwrap();
        }
        assert_eq!(reg.remove_owned_by(scope, |_| {}), 15_000);
        assert_eq!(reg.len(), 5_000);
        for n in (4..=20_000).step_by(4) {
            assert_eq!(reg.get(addr(n)), Some(OwnerToken::new(2)));
        }
        assert_eq!(reg.get(addr(1)), None);
    }

    struct Budget {
        allowed: AtomicUsize,
        live: AtomicUsize,
    }

    impl Platform for &'static Budget {
        fn page_size(&self) -> usize {
            4096
        }
        fn reserve_code(&self, size: usize) -> Option<NonNull<u8>> {
            self.reserve_data(size)
        }
        fn reserve_data(&self, size: usize) -> Option<NonNull<u8>> {
            let left = self.allowed.load(Ordering::SeqCst);
            if left == 0 {
                return None;
            }
            self.allowed.store(left - 1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Os.reserve_data(size)
        }
        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            unsafe { Os.release(ptr, size) }
        }
        fn set_write_protect(&self, _enabled: bool) {}
        unsafe fn flush_icache(&self, _ptr: NonNull<u8>, _size: usize) {}
    }

    #[test]
    fn test_failed_growth_leaves_table_intact() {
        let budget: &'static Budget = alloc::boxed::Box::leak(alloc::boxed::Box::new(Budget {
            allowed: AtomicUsize::new(1),
            live: AtomicUsize::new(0),
        }));
        let mut reg = Registry::new(budget, 4).unwrap();
        for n in 1..=3 {
            reg.insert(addr(n), OwnerToken::new(n)).unwrap();
        }
        // The fourth entry needs a bigger table, which the budget refuses.
        assert_eq!(
            reg.insert(addr(4), OwnerToken::new(4)),
            Err(ThunkError::RegistrationFailed {
                address: addr(4).as_ptr() as usize
            })
        );
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.capacity(), 4);
        for n in 1..=3 {
            assert_eq!(reg.get(addr(n)), Some(OwnerToken::new(n)));
        }
        drop(reg);
        assert_eq!(budget.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_creation_fails_without_memory() {
        let budget: &'static Budget = alloc::boxed::Box::leak(alloc::boxed::Box::new(Budget {
            allowed: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }));
        assert!(Registry::new(budget, 8).is_none());
    }
}
