//! Static limits and optional features of a shared region

use bitflags::bitflags;

bitflags! {
    /// Optional features which may be requested when reserving a block
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ShmFlags: u32 {
        /// Back the block with huge pages only
        const HP = 1 << 0;

        /// Back the block with default-size pages only
        const NO_HP = 1 << 1;

        /// Share the block with processes forked from the region's creator
        const PROC = 1 << 2;

        /// Map the block at the same virtual address in every context
        const SINGLE_VA = 1 << 3;

        /// Make the block importable by unrelated processes
        const EXPORT = 1 << 4;

        /// Populate and lock the block's pages so that hardware can reach them
        const HW_ACCESS = 1 << 5;
    }
}

/// Limits and supported features of a shared region
///
/// This is computed once, when the region is built, and never changes
/// afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capability {
    /// Maximal number of simultaneously live blocks (0 means unbounded)
    pub max_blocks: u32,

    /// Largest block that can be reserved, in bytes (0 means unbounded)
    pub max_size: usize,

    /// Largest block alignment that can be requested, in bytes (0 means
    /// unbounded)
    pub max_align: usize,

    /// Optional features which reservations may request
    pub flags: ShmFlags,
}

impl Capability {
    /// Truth that a reservation of this size fits the capability
    pub fn accepts_size(&self, size: usize) -> bool {
        self.max_size == 0 || size <= self.max_size
    }

    /// Truth that a reservation with this alignment fits the capability
    ///
    /// An alignment of 0 requests the default alignment and is always fine.
    pub fn accepts_align(&self, align: usize) -> bool {
        align == 0 || (align.is_power_of_two() && (self.max_align == 0 || align <= self.max_align))
    }
}
