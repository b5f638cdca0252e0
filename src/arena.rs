//! Page-granular backing stores which blocks are carved from
//!
//! An arena is one shared mapping, split into pages of a single size, whose
//! usage is tracked by a bitmap that lives in the region's control mapping.
//! Since both the arena and its bitmap are mapped before any `fork()`, every
//! process of the family sees the same pages at the same addresses and agrees
//! on which of them are in use.

use crate::{
    allocation,
    bitmap::{AtomicChunkBitmap, ChunkBitmap, PAGES_PER_CHUNK},
    div_round_up,
    shared::{Backing, SharedMapping},
};

use log::warn;

use std::{
    io,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicU64, Ordering},
};

/// Which arena a block lives in
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ArenaKind {
    /// Default-size pages
    Normal = 0,

    /// Huge pages
    Huge = 1,
}

/// Shared page store with lock-free page bookkeeping
#[derive(Debug)]
pub struct Arena {
    kind: ArenaKind,
    mapping: SharedMapping,
    page_size: usize,
    num_pages: usize,
    bitmap: NonNull<AtomicChunkBitmap>,
    num_chunks: usize,

    // Physical address of each page, recorded by the context which reserved it
    phys: NonNull<AtomicU64>,
}

impl Arena {
    /// Number of bitmap chunks needed to track an arena of `num_pages` pages
    pub fn bitmap_len(num_pages: usize) -> usize {
        div_round_up(num_pages, PAGES_PER_CHUNK)
    }

    /// Initial value of a bitmap chunk
    ///
    /// Pages past the end of the arena are marked as permanently allocated,
    /// so that the allocator never needs to special-case the last chunk.
    pub fn initial_chunk(chunk_idx: usize, num_pages: usize) -> ChunkBitmap {
        let chunk_start = chunk_idx * PAGES_PER_CHUNK;
        let valid_pages = num_pages.saturating_sub(chunk_start).min(PAGES_PER_CHUNK);
        if valid_pages == PAGES_PER_CHUNK {
            ChunkBitmap::EMPTY
        } else {
            ChunkBitmap::new_mask(valid_pages, PAGES_PER_CHUNK - valid_pages)
        }
    }

    /// Map a new arena of `num_pages` pages of `page_size` bytes, starting at
    /// an address which is a multiple of `base_align`
    ///
    /// For alignments up to `base_align`, every page index which is a
    /// multiple of the alignment in pages is then a valid block start.
    ///
    /// # Safety
    ///
    /// `bitmap` must point to `bitmap_len(num_pages)` chunks initialized with
    /// `initial_chunk()`, and `phys` to `num_pages` initialized atomics. Both
    /// must outlive the arena and must not be used for anything else.
    pub unsafe fn new(
        kind: ArenaKind,
        page_size: usize,
        num_pages: usize,
        base_align: usize,
        bitmap: NonNull<AtomicChunkBitmap>,
        phys: NonNull<AtomicU64>,
    ) -> io::Result<Self> {
        // Check interface preconditions in debug builds
        debug_assert!(page_size.is_power_of_two(), "Page size must be a power of 2");
        debug_assert_ne!(num_pages, 0, "Empty arenas are not supported");

        let backing = match kind {
            ArenaKind::Normal => Backing::Normal,
            ArenaKind::Huge => Backing::Huge,
        };
        let mapping = SharedMapping::new(num_pages * page_size, backing, base_align.max(page_size))?;
        Ok(Self {
            kind,
            mapping,
            page_size,
            num_pages,
            bitmap,
            num_chunks: Self::bitmap_len(num_pages),
            phys,
        })
    }

    /// Kind of pages this arena is made of
    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    /// Size of this arena's pages
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Arena capacity in bytes
    pub fn capacity(&self) -> usize {
        self.mapping.len()
    }

    /// Number of pages which are currently in use
    pub fn used_pages(&self) -> usize {
        let tail_pages = self.num_chunks * PAGES_PER_CHUNK - self.num_pages;
        let used: usize = self
            .bitmap()
            .iter()
            .map(|chunk| chunk.load(Ordering::Relaxed).count())
            .sum();
        used - tail_pages
    }

    /// Number of pages needed to back `size` bytes (at least one)
    pub fn pages_for(&self, size: usize) -> usize {
        div_round_up(size, self.page_size).max(1)
    }

    /// Try to allocate `num_pages` contiguous pages, the first of which has
    /// an address that is a multiple of `align`
    ///
    /// Returns the index of the first page on success.
    pub fn alloc(&self, num_pages: usize, align: usize) -> Option<usize> {
        debug_assert!(align == 0 || align.is_power_of_two(), "Bad alignment");
        if num_pages > self.num_pages {
            return None;
        }

        // Pages are already aligned on the page size, larger alignments mean
        // that only some page indices are suitable. The base address of the
        // mapping does not need to be aligned on them.
        let align_period = (align / self.page_size).max(1);
        let base_page = self.mapping.as_ptr() as usize / self.page_size;
        let align_phase = (align_period - base_page % align_period) % align_period;
        allocation::alloc_pages(self.bitmap(), self.num_pages, num_pages, align_period, align_phase)
    }

    /// Give back pages previously obtained from `alloc()`
    ///
    /// The contents of the pages are discarded first, so that the next block
    /// placed there starts zeroed and no memory stays committed in between.
    pub fn release(&self, first_page: usize, num_pages: usize) {
        if let Err(e) = self
            .mapping
            .discard(first_page * self.page_size, num_pages * self.page_size)
        {
            warn!(
                "Failed to discard {} {:?} pages at index {}: {}",
                num_pages, self.kind, first_page, e
            );
        }
        allocation::dealloc_pages(self.bitmap(), first_page, num_pages);
    }

    /// Back a run of allocated pages with physical memory right away
    pub fn populate(&self, first_page: usize, num_pages: usize) -> io::Result<()> {
        self.mapping.populate(
            first_page * self.page_size,
            num_pages * self.page_size,
            self.page_size,
        )
    }

    /// Address of a page
    pub fn page_addr(&self, page: usize) -> NonNull<u8> {
        debug_assert!(page < self.num_pages, "Page index out of range");

        // This is safe because the page lies within our mapping
        unsafe { NonNull::new_unchecked(self.mapping.as_ptr().add(page * self.page_size)) }
    }

    /// Remember the physical addresses of a run of allocated pages
    pub fn set_phys_addrs(&self, first_page: usize, addrs: &[u64]) {
        for (slot, &addr) in self.phys_table()[first_page..].iter().zip(addrs) {
            slot.store(addr, Ordering::Relaxed);
        }
    }

    /// Physical addresses previously recorded with `set_phys_addrs()`
    pub fn phys_addrs(&self, first_page: usize, num_pages: usize) -> Vec<u64> {
        self.phys_table()[first_page..first_page + num_pages]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    fn bitmap(&self) -> &[AtomicChunkBitmap] {
        // This is safe per the contract of `Arena::new()`
        unsafe { slice::from_raw_parts(self.bitmap.as_ptr(), self.num_chunks) }
    }

    fn phys_table(&self) -> &[AtomicU64] {
        // This is safe per the contract of `Arena::new()`
        unsafe { slice::from_raw_parts(self.phys.as_ptr(), self.num_pages) }
    }
}

// The bitmap only contains atomics, and page contents are owned by blocks
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    // Arena together with the bitmap it tracks its pages with
    struct TestArena {
        arena: Arena,
        _bitmap: Box<[AtomicChunkBitmap]>,
        _phys: Box<[AtomicU64]>,
    }

    fn arena(num_pages: usize) -> TestArena {
        let bitmap = (0..Arena::bitmap_len(num_pages))
            .map(|chunk_idx| AtomicChunkBitmap::new(Arena::initial_chunk(chunk_idx, num_pages)))
            .collect::<Box<[_]>>();
        let phys = (0..num_pages).map(|_| AtomicU64::new(0)).collect::<Box<[_]>>();
        let arena = unsafe {
            Arena::new(
                ArenaKind::Normal,
                region::page::size(),
                num_pages,
                16 * region::page::size(),
                NonNull::from(&bitmap[0]),
                NonNull::from(&phys[0]),
            )
        }
        .unwrap();
        TestArena {
            arena,
            _bitmap: bitmap,
            _phys: phys,
        }
    }

    #[test]
    fn initial_chunks() {
        assert_eq!(Arena::initial_chunk(0, PAGES_PER_CHUNK), ChunkBitmap::EMPTY);
        assert_eq!(Arena::initial_chunk(1, PAGES_PER_CHUNK + 3).count(), PAGES_PER_CHUNK - 3);
        assert_eq!(Arena::initial_chunk(2, PAGES_PER_CHUNK), ChunkBitmap::FULL);
    }

    #[test]
    fn alloc_release() {
        let test = arena(100);
        let arena = &test.arena;
        assert_eq!(arena.used_pages(), 0);
        assert_eq!(arena.pages_for(0), 1);
        assert_eq!(arena.pages_for(arena.page_size() + 1), 2);

        let first = arena.alloc(10, 0).unwrap();
        let second = arena.alloc(90, 0).unwrap();
        assert_eq!(arena.used_pages(), 100);
        assert_eq!(arena.alloc(1, 0), None);
        assert!(first + 10 <= second || second + 90 <= first);

        arena.release(first, 10);
        arena.release(second, 90);
        assert_eq!(arena.used_pages(), 0);
        assert_eq!(arena.alloc(101, 0), None);
    }

    #[test]
    fn alignment_is_absolute() {
        let test = arena(256);
        let arena = &test.arena;
        let _skew = arena.alloc(1, 0).unwrap();
        for &align in &[arena.page_size() * 2, arena.page_size() * 8, arena.page_size() * 32] {
            let page = arena.alloc(3, align).unwrap();
            assert_eq!(arena.page_addr(page).as_ptr() as usize % align, 0);
        }
    }

    #[test]
    fn aligned_base() {
        let test = arena(64);
        let arena = &test.arena;
        let align = 16 * arena.page_size();
        assert_eq!(arena.page_addr(0).as_ptr() as usize % align, 0);

        // The whole arena is one block at the largest alignment
        assert_eq!(arena.alloc(64, align), Some(0));
        arena.release(0, 64);
    }

    #[test]
    fn physical_address_table() {
        let test = arena(8);
        let arena = &test.arena;
        let page = arena.alloc(3, 0).unwrap();
        arena.set_phys_addrs(page, &[0x1000, 0x5000, 0x2000]);
        assert_eq!(arena.phys_addrs(page, 3), vec![0x1000, 0x5000, 0x2000]);
        assert_eq!(arena.phys_addrs(page + 1, 1), vec![0x5000]);
    }

    #[test]
    fn released_pages_read_back_zeroed() {
        let test = arena(4);
        let arena = &test.arena;
        let page = arena.alloc(1, 0).unwrap();
        unsafe { *arena.page_addr(page).as_ptr() = 0x5a };
        arena.release(page, 1);
        let again = arena.alloc(1, 0).unwrap();
        assert_eq!(again, page);
        assert_eq!(unsafe { *arena.page_addr(again).as_ptr() }, 0);
    }
}
