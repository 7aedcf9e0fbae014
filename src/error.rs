//! Failure reasons for thunk allocation.

/// Why an `allocate` call returned no memory.
///
/// Every variant is unwound locally before it is returned: the region's free
/// space and the registry are exactly as they were before the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ThunkError {
    /// The OS could not supply an executable region of `size` bytes.
    #[error("cannot reserve {size} bytes of executable memory")]
    ResourceExhausted { size: usize },
    /// The suballocator could not be laid out over a region of `size` bytes.
    #[error("cannot create a thunk heap over {size} bytes")]
    HeapCreationFailed { size: usize },
    /// The address registry could not obtain its initial storage.
    #[error("cannot create the thunk metadata registry")]
    RegistryCreationFailed,
    /// The region has no free block large enough for `size` bytes.
    #[error("thunk heap has no room for {size} bytes")]
    AllocationFailed { size: usize },
    /// The registry rejected the entry for `address`; the block was freed.
    #[error("cannot register thunk at {address:#x}")]
    RegistrationFailed { address: usize },
}

impl ThunkError {
    /// Whether the region itself failed to come up, as opposed to a request
    /// that an existing region could not satisfy.
    pub fn is_creation_failure(&self) -> bool {
        matches!(
            self,
            ThunkError::ResourceExhausted { .. }
                | ThunkError::HeapCreationFailed { .. }
                | ThunkError::RegistryCreationFailed
        )
    }

    /// All variants mean the same thing to the caller: no memory was returned.
    pub fn is_out_of_memory(&self) -> bool {
        true
    }
}
