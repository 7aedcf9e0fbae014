#![no_std]

//! thunkmem: executable memory for runtime-generated upcall thunks.
//!
//! A code generator asks for a small block of executable memory, writes
//! machine code into it, finalizes it and hands its address to native code
//! as a callable entry point. The crate provides:
//! - a lazily created executable region per allocator, carved up by a
//!   first-fit heap
//! - an address-indexed registry recording which object owns each thunk
//! - scoped W^X write windows and instruction cache maintenance
//!
//! # Usage
//!
//! ```ignore
//! use thunkmem::{Os, OwnerToken, ThunkAllocator, ThunkRequest};
//!
//! static THUNKS: ThunkAllocator = ThunkAllocator::new(Os);
//!
//! let thunk = THUNKS.allocate(ThunkRequest::new(code.len(), OwnerToken::from_ptr(owner)))?;
//! {
//!     let _w = THUNKS.write_window();
//!     unsafe { core::ptr::copy_nonoverlapping(code.as_ptr(), thunk.as_ptr(), code.len()) };
//! }
//! unsafe { THUNKS.finalize(thunk.as_ptr(), code.len()) };
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

mod macros;

/// Build-time configuration, generated from `thunkmem.toml`.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
}

pub mod allocator;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod heap;
pub mod platform;
pub mod region;
pub mod registry;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod wx;

pub use allocator::{ThunkAllocator, ThunkRequest};
pub use error::ThunkError;
pub use platform::{Os, Platform};
pub use registry::OwnerToken;
pub use wx::WriteWindow;
