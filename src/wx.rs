//! Scoped write access to executable memory.
//!
//! On hardware-enforced W^X targets a JIT page is either writable or
//! executable for a given thread, never both. A [`WriteWindow`] lifts write
//! protection when it is opened and restores it when it is dropped, on every
//! exit path of the bracketed code.
//!
//! With `std`, windows nest per thread: only the outermost one toggles the
//! hardware, so a code generator may call `allocate` (which opens its own
//! window) while it still holds one. Without `std` there is no thread-local
//! depth to consult and every drop re-protects, so `allocate` must not be
//! called from inside a window.

use crate::platform::Platform;
use crate::stat_inc;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        use core::cell::Cell;

        std::thread_local! {
            static DEPTH: Cell<usize> = const { Cell::new(0) };
        }

        /// Enter a window on this thread; true for the outermost one.
        fn enter() -> bool {
            DEPTH.with(|depth| {
                let n = depth.get();
                depth.set(n + 1);
                n == 0
            })
        }

        /// Leave a window on this thread; true when none is left open.
        fn leave() -> bool {
            DEPTH.with(|depth| {
                let n = depth.get().saturating_sub(1);
                depth.set(n);
                n == 0
            })
        }
    } else {
        #[inline]
        fn enter() -> bool {
            true
        }

        #[inline]
        fn leave() -> bool {
            true
        }
    }
}

/// Lift write protection for the calling thread unless a window is already
/// open on it. Pair every call with [`restore`].
pub(crate) fn lift<P: Platform>(platform: &P) {
    if enter() {
        stat_inc!(write_windows);
        platform.set_write_protect(false);
    }
}

/// Close the window opened by the matching [`lift`]; the outermost one
/// re-protects.
pub(crate) fn restore<P: Platform>(platform: &P) {
    if leave() {
        platform.set_write_protect(true);
    }
}

/// While alive, the current thread may write to JIT pages.
#[must_use = "write protection is restored as soon as the window is dropped"]
pub struct WriteWindow<'a, P: Platform> {
    platform: &'a P,
}

impl<'a, P: Platform> WriteWindow<'a, P> {
    pub fn open(platform: &'a P) -> Self {
        lift(platform);
        Self { platform }
    }
}

impl<P: Platform> Drop for WriteWindow<'_, P> {
    #[inline]
    fn drop(&mut self) {
        restore(self.platform);
    }
}
