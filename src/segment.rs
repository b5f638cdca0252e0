//! Descriptions of blocks and of their physical layout

use crate::{div_round_up, ShmFlags};

use std::fmt;

/// Summary of a live block
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    /// Name given at reservation time, or generated for anonymous blocks
    pub name: String,

    /// Virtual address of the first byte, identical in every context
    pub addr: usize,

    /// Size requested at reservation time, in bytes
    pub size: usize,

    /// Size of the pages backing the block
    pub page_size: usize,

    /// Flags requested at reservation time
    pub flags: ShmFlags,

    /// Number of physically contiguous segments
    pub num_segments: usize,
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" @ {:#x}: {} bytes on {} byte pages in {} segment(s), flags {:?}",
            self.name, self.addr, self.size, self.page_size, self.num_segments, self.flags
        )
    }
}

/// Physically contiguous piece of a block
///
/// Physical and IO virtual addresses are either known for every segment of a
/// block, or for none of them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SegmentInfo {
    /// Virtual address of the first byte
    pub addr: usize,

    /// Address which devices should use to reach the segment
    pub iova: Option<u64>,

    /// Physical address of the first byte
    pub pa: Option<u64>,

    /// Length in bytes
    pub len: usize,
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "va {:#x}, len {:#x}", self.addr, self.len)?;
        match (self.pa, self.iova) {
            (Some(pa), Some(iova)) => write!(f, ", pa {:#x}, iova {:#x}", pa, iova),
            _ => write!(f, ", pa/iova unknown"),
        }
    }
}

/// Segment layout of a block, one segment per backing page
#[derive(Clone, Copy, Debug)]
pub struct SegmentLayout {
    addr: usize,
    size: usize,
    page_size: usize,
}

impl SegmentLayout {
    pub fn new(addr: usize, size: usize, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two(), "Bad page size");
        Self {
            addr,
            size,
            page_size,
        }
    }

    /// Number of segments (at least one, even for empty blocks)
    pub fn len(&self) -> usize {
        div_round_up(self.size, self.page_size).max(1)
    }

    /// Virtual address and length of a segment
    pub fn segment(&self, idx: usize) -> (usize, usize) {
        debug_assert!(idx < self.len(), "Segment index out of range");
        let offset = idx * self.page_size;
        let len = self.size.saturating_sub(offset).min(self.page_size);
        (self.addr + offset, len)
    }

    /// Describe a range of segments, given the physical addresses of the
    /// block's pages if they are known
    pub fn describe(&self, start: usize, out: &mut [SegmentInfo], phys: Option<&[u64]>) -> usize {
        let count = out.len().min(self.len().saturating_sub(start));
        for (idx, info) in (start..start + count).zip(out.iter_mut()) {
            let (addr, len) = self.segment(idx);
            let pa = phys.map(|phys| phys[idx]);
            *info = SegmentInfo {
                addr,
                iova: pa,
                pa,
                len,
            };
        }
        count
    }
}
