//! Mechanisms for tracking page usage within an arena chunk
//!
//! Arenas are managed at page granularity, and page usage is tracked with one
//! bit per page. Since modern CPUs are not bit-addressable, the bits must be
//! manipulated in bunches, via unsigned integers. We call the group of pages
//! tracked by one such integer a **chunk**. This module provides the
//! abstractions used to manipulate chunk bitmaps correctly, both as plain
//! values and as atomics shared between threads and processes.

use std::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Number of pages tracked by a single chunk bitmap
pub const PAGES_PER_CHUNK: usize = usize::BITS as usize;

/// Page allocation pattern within a chunk
///
/// This bitmap can be used for two purposes: to specify a sequence of pages
/// that we _want_ to allocate within a chunk (an allocation mask), and to
/// describe which pages are _currently_ allocated in a chunk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct ChunkBitmap(usize);

impl ChunkBitmap {
    /// The empty (fully unallocated) chunk bitmap
    pub const EMPTY: Self = Self(0);

    /// The fully allocated chunk bitmap
    pub const FULL: Self = Self(usize::MAX);

    /// Mask of `len` pages starting at page `start` of the chunk
    pub fn new_mask(start: usize, len: usize) -> Self {
        // Check interface preconditions in debug builds
        debug_assert!(start < PAGES_PER_CHUNK, "Allocation start is out of chunk range");
        debug_assert!(len <= PAGES_PER_CHUNK - start, "Allocation end is out of chunk range");

        // Handle the "full chunk" edge case without overflowing
        if len == PAGES_PER_CHUNK {
            return Self::FULL;
        }

        // Otherwise, use a general bit pattern computation
        Self(((1 << len) - 1) << start)
    }

    /// Compute the allocation mask covering a page range within a chunk
    pub fn from_range(pages: Range<usize>) -> Self {
        Self::new_mask(pages.start, pages.end - pages.start)
    }

    /// Truth that no page is marked
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Truth that every page is marked
    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }

    /// Truth that the marked pages form a single contiguous run
    pub fn is_mask(&self) -> bool {
        self.0.count_zeros() == self.0.leading_zeros() + self.0.trailing_zeros()
    }

    /// Number of allocated pages in the bitmap
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Index of the highest allocated page, if any
    pub fn last_allocated(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(PAGES_PER_CHUNK - 1 - self.0.leading_zeros() as usize)
        }
    }

    /// Compute the inverse of a bitmap (every page which is marked allocated
    /// in this bitmap is deallocated in the other, and vice versa)
    pub fn inverse(&self) -> Self {
        Self(!self.0)
    }

    /// Intersect two bitmaps to get the set of pages which are allocated in
    /// both of them
    pub fn intersection(&self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Unite two bitmaps to get the set of pages which are allocated in either
    /// of them
    #[cfg(test)]
    pub fn union(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Atomic variant of ChunkBitmap
///
/// This wrapper lives in shared memory, so it must remain a plain atomic
/// integer with no process-local state.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicChunkBitmap(AtomicUsize);

impl AtomicChunkBitmap {
    /// Create a new atomic chunk bitmap
    pub const fn new(v: ChunkBitmap) -> Self {
        Self(AtomicUsize::new(v.0))
    }

    /// Read the current page usage
    pub fn load(&self, order: Ordering) -> ChunkBitmap {
        ChunkBitmap(self.0.load(order))
    }

    /// Overwrite the page usage
    fn store(&self, val: ChunkBitmap, order: Ordering) {
        self.0.store(val.0, order)
    }

    /// Overwrite the page usage, returning its former value
    fn swap(&self, val: ChunkBitmap, order: Ordering) -> ChunkBitmap {
        ChunkBitmap(self.0.swap(val.0, order))
    }

    /// Overwrite the page usage if it still has the expected value
    fn compare_exchange(
        &self,
        current: ChunkBitmap,
        new: ChunkBitmap,
        success: Ordering,
        failure: Ordering,
    ) -> Result<ChunkBitmap, ChunkBitmap> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(ChunkBitmap)
            .map_err(ChunkBitmap)
    }

    /// Unmark every page which is not in `val`, returning the former usage
    fn fetch_intersect(&self, val: ChunkBitmap, order: Ordering) -> ChunkBitmap {
        ChunkBitmap(self.0.fetch_and(val.0, order))
    }

    /// Mark every page of `val`, returning the former usage
    fn fetch_unite(&self, val: ChunkBitmap, order: Ordering) -> ChunkBitmap {
        ChunkBitmap(self.0.fetch_or(val.0, order))
    }

    /// Try to fully allocate a chunk.
    ///
    /// On failure, return the former bitmap value so that one can check which
    /// pages were already allocated.
    pub fn try_alloc_all(&self, success: Ordering, failure: Ordering) -> Result<(), ChunkBitmap> {
        self.compare_exchange(ChunkBitmap::EMPTY, ChunkBitmap::FULL, success, failure)
            .map(std::mem::drop)
    }

    /// Try to allocate a subset of a chunk, designated by a mask.
    ///
    /// On failure, return the pages of the mask which were already allocated.
    pub fn try_alloc_mask(
        &self,
        mask: ChunkBitmap,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), ChunkBitmap> {
        // Check for suspicious requests in debug builds
        debug_assert!(mask.is_mask(), "Attempted to allocate non-contiguous pages");
        debug_assert!(!mask.is_empty(), "Useless call to try_alloc_mask with empty mask");

        // Full masks go through compare-exchange, so that a failed attempt
        // does not briefly mark a partially used chunk as full
        if mask.is_full() {
            return self
                .try_alloc_all(success, failure)
                .map_err(|observed| observed.intersection(mask));
        }

        // Mark the pages, then see whether someone else had some of them
        let old_bitmap = self.fetch_unite(mask, success);

        // Make sure that none of the target pages were previously allocated
        let previously_allocated = old_bitmap.intersection(mask);
        if previously_allocated.is_empty() {
            Ok(())
        } else {
            // Revert our own part of the allocation before exiting:
            // - Every page which was allocated in old_bitmap must stay as-is.
            // - Every page outside of "mask" must stay as-is.
            // - All other pages must be deallocated.
            let clear_mask = mask.intersection(previously_allocated.inverse());
            self.fetch_intersect(clear_mask.inverse(), failure);
            Err(previously_allocated)
        }
    }

    /// Assuming a chunk is fully allocated, fully deallocate it
    pub fn dealloc_all(&self, order: Ordering) {
        if cfg!(debug_assertions) {
            // In debug builds, we make sure that the chunk was indeed marked as
            // fully allocated in order to detect bookkeeping errors.
            assert_eq!(
                self.swap(ChunkBitmap::EMPTY, order),
                ChunkBitmap::FULL,
                "Tried to deallocate chunk which wasn't fully allocated"
            );
        } else {
            // Release builds trust the caller and skip the read-modify-write
            self.store(ChunkBitmap::EMPTY, order);
        }
    }

    /// Deallocate a subset of a chunk, designated by a mask
    pub fn dealloc_mask(&self, mask: ChunkBitmap, order: Ordering) {
        // Check for suspicious requests in debug builds
        debug_assert!(mask.is_mask(), "Attempted to deallocate non-contiguous pages");
        debug_assert!(!mask.is_empty(), "Useless call to dealloc_mask with empty mask");

        // Clear the requested allocation bits
        let old_bitmap = self.fetch_intersect(mask.inverse(), order);

        // Freeing pages that were not in use means the bookkeeping is broken
        debug_assert_eq!(
            old_bitmap.intersection(mask),
            mask,
            "Tried to deallocate pages which weren't allocated"
        );
    }
}
