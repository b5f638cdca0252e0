//! Multi-chunk page allocation and deallocation functions

mod guard;

use crate::{
    bitmap::{AtomicChunkBitmap, ChunkBitmap, PAGES_PER_CHUNK},
    hole::HoleSearch,
};

use guard::AllocGuard;

use std::sync::atomic::{self, Ordering};

/// Allocate an aligned run of free pages from a page bitmap
///
/// Holes are searched from the beginning of the bitmap, and every failed
/// allocation attempt moves the search forward, so this terminates in a
/// bounded number of steps even under heavy contention. Returns the index of
/// the first allocated page, or `None` if no suitable hole was found.
pub fn alloc_pages(
    bitmap: &[AtomicChunkBitmap],
    num_pages: usize,
    requested_pages: usize,
    align_period: usize,
    align_phase: usize,
) -> Option<usize> {
    let mut search = HoleSearch::new(bitmap, num_pages, requested_pages, align_period, align_phase);
    let mut hole = search.next_hole();
    while let Some(start_page) = hole {
        let mut guard = AllocGuard::new(bitmap, start_page);
        match guard.try_extend_to(start_page + requested_pages) {
            Ok(()) => {
                let first_page = guard.commit();

                // Make sure that the previous reads from the page bitmap are
                // ordered before any subsequent access to the pages by the
                // current thread, to avoid data races with the thread that
                // liberated the pages that we are in the process of allocating.
                atomic::fence(Ordering::Acquire);
                return Some(first_page);
            }

            // Someone else got there first, look further away. The guard is
            // dropped at the end of this iteration, releasing what we took.
            Err(bad_page) => hole = search.retry(bad_page),
        }
    }
    None
}

/// Liberate a run of pages previously obtained from `alloc_pages`
///
/// Every page of the run must be currently allocated by the caller.
pub fn dealloc_pages(bitmap: &[AtomicChunkBitmap], start_page: usize, num_pages: usize) {
    if num_pages == 0 {
        return;
    }

    // Make sure that the subsequent writes to the page bitmap are ordered
    // after any previous access to the pages by the current thread, to avoid
    // data races with other threads concurrently reallocating them.
    atomic::fence(Ordering::Release);

    let end_page = start_page + num_pages;
    let mut page = start_page;
    while page < end_page {
        let chunk_idx = page / PAGES_PER_CHUNK;
        let chunk_start = chunk_idx * PAGES_PER_CHUNK;
        let chunk_end = end_page.min(chunk_start + PAGES_PER_CHUNK);
        let mask = ChunkBitmap::from_range((page - chunk_start)..(chunk_end - chunk_start));
        if mask.is_full() {
            bitmap[chunk_idx].dealloc_all(Ordering::Relaxed);
        } else {
            bitmap[chunk_idx].dealloc_mask(mask, Ordering::Relaxed);
        }
        page = chunk_end;
    }
}
