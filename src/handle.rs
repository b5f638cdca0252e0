//! Opaque identifiers for live shared memory blocks

use std::fmt;

/// Opaque handle to a shared memory block
///
/// A handle packs the index of the registry slot that describes the block
/// with the generation counter that slot had when the block was registered.
/// Slots are recycled, generations are not, so a handle whose block was
/// freed stops resolving even once its slot describes another block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Handle value which never names a block
    pub const INVALID: Self = Self(0);

    /// Build a handle from a registry slot index and a nonzero generation
    pub(crate) fn from_parts(slot_idx: u32, generation: u32) -> Self {
        debug_assert_ne!(generation, 0, "Generation zero is reserved");
        Self((u64::from(generation) << 32) | (u64::from(slot_idx) + 1))
    }

    /// Registry slot index, if this could be a valid handle at all
    pub(crate) fn slot_idx(self) -> Option<usize> {
        let low = (self.0 & u64::from(u32::MAX)) as usize;
        low.checked_sub(1)
    }

    /// Generation of the registry slot when the block was registered
    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Truth that this is not the invalid sentinel
    ///
    /// This says nothing about whether the block is still alive.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Raw value of the handle, for printing and debugging
    pub fn to_u64(self) -> u64 {
        self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
