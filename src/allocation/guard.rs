//! RAII mechanism to automatically rollback partially committed page
//! allocations if subsequent steps of the allocation process fail.

use crate::bitmap::{AtomicChunkBitmap, ChunkBitmap, PAGES_PER_CHUNK};

use std::sync::atomic::Ordering;

/// RAII guard for iterative page allocation, with automatic rollback
///
/// In this lock-free page allocator, the process of allocating pages which
/// span more than one chunk isn't atomic, and may therefore fail _after_ some
/// pages have already been allocated. In that case, the previous partial
/// allocation must be reverted.
///
/// The guard allocates the requested range chunk by chunk, from left to
/// right, so that the allocated part is always the prefix
/// `start_page..end_page` of the requested range:
///
/// `|0011|1111|1111|1000|`
/// ` head <-body->  tail`
///
pub struct AllocGuard<'bitmap> {
    /// Bitmap which the pages are allocated from
    bitmap: &'bitmap [AtomicChunkBitmap],

    /// First page of the allocation
    start_page: usize,

    /// End of the successfully allocated prefix
    end_page: usize,
}

impl<'bitmap> AllocGuard<'bitmap> {
    /// Start an empty allocation at a certain page
    pub fn new(bitmap: &'bitmap [AtomicChunkBitmap], start_page: usize) -> Self {
        debug_assert!(
            start_page < bitmap.len() * PAGES_PER_CHUNK,
            "Allocation starts after end of the bitmap"
        );
        Self {
            bitmap,
            start_page,
            end_page: start_page,
        }
    }

    /// Try to extend the allocation up to a certain page (excluded)
    ///
    /// On failure, returns the index of the last page which was observed to
    /// be already allocated in the chunk where things went wrong. Pages
    /// which were allocated before the failure stay in the guard, and will be
    /// liberated when the guard is dropped.
    pub fn try_extend_to(&mut self, target_end: usize) -> Result<(), usize> {
        debug_assert!(target_end >= self.end_page, "Allocations may only grow");
        debug_assert!(
            target_end <= self.bitmap.len() * PAGES_PER_CHUNK,
            "Allocation ends after end of the bitmap"
        );

        while self.end_page < target_end {
            // Allocate the part of the range which falls in the current chunk
            let chunk_idx = self.end_page / PAGES_PER_CHUNK;
            let chunk_start = chunk_idx * PAGES_PER_CHUNK;
            let chunk_end = target_end.min(chunk_start + PAGES_PER_CHUNK);
            let mask =
                ChunkBitmap::from_range((self.end_page - chunk_start)..(chunk_end - chunk_start));
            self.bitmap[chunk_idx]
                .try_alloc_mask(mask, Ordering::Relaxed, Ordering::Relaxed)
                .map_err(|conflict| {
                    // A failed allocation always reports at least one page
                    chunk_start + conflict.last_allocated().unwrap_or(PAGES_PER_CHUNK - 1)
                })?;

            // Track the pages which we now own
            self.end_page = chunk_end;
        }
        Ok(())
    }

    /// Number of pages which were allocated so far
    pub fn num_pages(&self) -> usize {
        self.end_page - self.start_page
    }

    /// Accept the allocation, return the index of its first page
    pub fn commit(self) -> usize {
        let start_page = self.start_page;

        // Forget the guard so that the allocation is not rolled back
        std::mem::forget(self);
        start_page
    }
}

impl Drop for AllocGuard<'_> {
    fn drop(&mut self) {
        // This is correct because the guard only ever tracks pages which it
        // managed to allocate itself.
        super::dealloc_pages(self.bitmap, self.start_page, self.num_pages());
    }
}
