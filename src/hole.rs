//! Mechanism for searching holes in an arena's page bitmap

use crate::bitmap::{AtomicChunkBitmap, PAGES_PER_CHUNK};

use std::sync::atomic::Ordering;

/// Ongoing search for aligned holes of free pages in a page bitmap
///
/// The search behaves like an iterator of candidate holes, but can
/// additionally be informed with updated information about the contents of
/// the bitmap, which is obtained through unsuccessful allocation attempts.
///
/// The search must move forward through the bitmap at every step. It is not
/// allowed to go back to a prior page, nor is it allowed to stand still at a
/// given place. This guarantees that a reservation attempt completes in a
/// bounded number of steps, however contended the arena is.
pub struct HoleSearch<'bitmap> {
    // Bitmap being searched, read with relaxed loads
    bitmap: &'bitmap [AtomicChunkBitmap],

    // Total number of pages tracked by the bitmap
    num_pages: usize,

    // Requested hole size, in pages
    requested_pages: usize,

    // Holes may only start at page indices congruent to `align_phase` modulo
    // `align_period`. The period is a power of two.
    align_period: usize,
    align_phase: usize,

    // Page index from which the next hole will be searched
    cursor: usize,
}

impl<'bitmap> HoleSearch<'bitmap> {
    /// Start searching for holes
    ///
    /// `align_period` and `align_phase` describe which page indices are
    /// suitable hole starts. Use a period of 1 if any page will do.
    pub fn new(
        bitmap: &'bitmap [AtomicChunkBitmap],
        num_pages: usize,
        requested_pages: usize,
        align_period: usize,
        align_phase: usize,
    ) -> Self {
        // Check interface preconditions in debug builds
        debug_assert!(num_pages <= bitmap.len() * PAGES_PER_CHUNK, "Bitmap is too small");
        debug_assert_ne!(requested_pages, 0, "No need to search for an empty hole");
        debug_assert!(align_period.is_power_of_two(), "Bad alignment period");
        debug_assert!(align_phase < align_period, "Bad alignment phase");

        Self {
            bitmap,
            num_pages,
            requested_pages,
            align_period,
            align_phase,
            cursor: 0,
        }
    }

    /// Find the first page of the next candidate hole, if any
    ///
    /// The bitmap is read without synchronization, so the hole may already be
    /// gone by the time the caller tries to allocate it. In that case, the
    /// caller should report where things went wrong via `retry()`.
    pub fn next_hole(&mut self) -> Option<usize> {
        loop {
            // Move to the next suitably aligned start position
            let start = self.align_up(self.cursor)?;
            let end = start.checked_add(self.requested_pages)?;
            if end > self.num_pages {
                self.cursor = self.num_pages;
                return None;
            }

            // Check if that position is free, otherwise skip past the last
            // allocated page that we observed within the candidate hole
            match self.last_allocated_in(start, end) {
                None => {
                    self.cursor = start;
                    return Some(start);
                }
                Some(bad_page) => self.cursor = bad_page + 1,
            }
        }
    }

    /// Search the next hole, given the page on which allocating the previous
    /// hole failed
    ///
    /// The bad page must lie within the previously emitted hole, so that the
    /// search keeps moving forward.
    pub fn retry(&mut self, bad_page: usize) -> Option<usize> {
        debug_assert!(
            bad_page >= self.cursor && bad_page < self.cursor + self.requested_pages,
            "Allocation failure reported outside of the emitted hole"
        );
        self.cursor = bad_page + 1;
        self.next_hole()
    }

    /// Round a page index up to the next suitable hole start
    fn align_up(&self, page: usize) -> Option<usize> {
        let mask = self.align_period - 1;
        let offset = (self.align_phase.wrapping_sub(page)) & mask;
        page.checked_add(offset)
    }

    /// Find the last allocated page within a page range, if any
    fn last_allocated_in(&self, start: usize, end: usize) -> Option<usize> {
        // Scan chunks backwards, so that we can skip as far as possible
        let first_chunk = start / PAGES_PER_CHUNK;
        let last_chunk = (end - 1) / PAGES_PER_CHUNK;
        for chunk_idx in (first_chunk..=last_chunk).rev() {
            let chunk_start = chunk_idx * PAGES_PER_CHUNK;
            let lo = start.max(chunk_start) - chunk_start;
            let hi = end.min(chunk_start + PAGES_PER_CHUNK) - chunk_start;
            let mask = crate::bitmap::ChunkBitmap::from_range(lo..hi);
            let observed = self.bitmap[chunk_idx].load(Ordering::Relaxed);
            if let Some(subidx) = observed.intersection(mask).last_allocated() {
                return Some(chunk_start + subidx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::ChunkBitmap;

    use rand::Rng;

    // Build a bitmap from a per-page oracle
    fn make_bitmap(num_pages: usize, used: impl Fn(usize) -> bool) -> Vec<AtomicChunkBitmap> {
        let num_chunks = (num_pages + PAGES_PER_CHUNK - 1) / PAGES_PER_CHUNK;
        (0..num_chunks)
            .map(|chunk_idx| {
                let mut bits = ChunkBitmap::EMPTY;
                for subidx in 0..PAGES_PER_CHUNK {
                    let page = chunk_idx * PAGES_PER_CHUNK + subidx;
                    if page >= num_pages || used(page) {
                        bits = bits.union(ChunkBitmap::new_mask(subidx, 1));
                    }
                }
                AtomicChunkBitmap::new(bits)
            })
            .collect()
    }

    // Reference answer: first aligned run of free pages
    fn oracle(
        used: &[bool],
        requested_pages: usize,
        align_period: usize,
        align_phase: usize,
    ) -> Option<usize> {
        (0..used.len())
            .filter(|start| start % align_period == align_phase)
            .find(|&start| {
                start + requested_pages <= used.len()
                    && used[start..start + requested_pages].iter().all(|u| !u)
            })
    }

    #[test]
    fn empty_bitmap() {
        let bitmap = make_bitmap(3 * PAGES_PER_CHUNK, |_| false);
        let mut search = HoleSearch::new(&bitmap, 3 * PAGES_PER_CHUNK, 5, 1, 0);
        assert_eq!(search.next_hole(), Some(0));

        let mut search = HoleSearch::new(&bitmap, 3 * PAGES_PER_CHUNK, 5, 16, 3);
        assert_eq!(search.next_hole(), Some(3));

        let mut search = HoleSearch::new(&bitmap, 3 * PAGES_PER_CHUNK, 3 * PAGES_PER_CHUNK, 1, 0);
        assert_eq!(search.next_hole(), Some(0));

        let mut search =
            HoleSearch::new(&bitmap, 3 * PAGES_PER_CHUNK, 3 * PAGES_PER_CHUNK + 1, 1, 0);
        assert_eq!(search.next_hole(), None);
    }

    #[test]
    fn full_bitmap() {
        let bitmap = make_bitmap(2 * PAGES_PER_CHUNK, |_| true);
        let mut search = HoleSearch::new(&bitmap, 2 * PAGES_PER_CHUNK, 1, 1, 0);
        assert_eq!(search.next_hole(), None);
    }

    #[test]
    fn partial_last_chunk() {
        // Pages past the end of the arena must never be emitted
        let num_pages = PAGES_PER_CHUNK + 10;
        let bitmap = make_bitmap(num_pages, |page| page < PAGES_PER_CHUNK);
        let mut search = HoleSearch::new(&bitmap, num_pages, 10, 1, 0);
        assert_eq!(search.next_hole(), Some(PAGES_PER_CHUNK));
        let mut search = HoleSearch::new(&bitmap, num_pages, 11, 1, 0);
        assert_eq!(search.next_hole(), None);
    }

    #[test]
    fn hole_spanning_chunks() {
        let num_pages = 4 * PAGES_PER_CHUNK;
        let hole = (PAGES_PER_CHUNK - 3)..(3 * PAGES_PER_CHUNK + 2);
        let bitmap = make_bitmap(num_pages, |page| !hole.contains(&page));
        let mut search = HoleSearch::new(&bitmap, num_pages, hole.len(), 1, 0);
        assert_eq!(search.next_hole(), Some(hole.start));
        let mut search = HoleSearch::new(&bitmap, num_pages, hole.len() + 1, 1, 0);
        assert_eq!(search.next_hole(), None);
    }

    #[test]
    fn retry_moves_forward() {
        let num_pages = 2 * PAGES_PER_CHUNK;
        let bitmap = make_bitmap(num_pages, |_| false);
        let mut search = HoleSearch::new(&bitmap, num_pages, 4, 1, 0);
        assert_eq!(search.next_hole(), Some(0));

        // Pretend that someone grabbed page 2 behind our back
        bitmap[0].try_alloc_mask(ChunkBitmap::new_mask(2, 1), Ordering::Relaxed, Ordering::Relaxed)
            .unwrap();
        assert_eq!(search.retry(2), Some(3));
        assert_eq!(search.retry(5), Some(6));
    }

    #[test]
    fn random_bitmaps() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let num_pages = rng.gen_range(1..5 * PAGES_PER_CHUNK);
            let density = rng.gen_range(0.0..0.5);
            let used = (0..num_pages).map(|_| rng.gen_bool(density)).collect::<Vec<_>>();
            let bitmap = make_bitmap(num_pages, |page| used[page]);
            let requested_pages = rng.gen_range(1..=num_pages.min(2 * PAGES_PER_CHUNK));
            let align_period = 1 << rng.gen_range(0..6);
            let align_phase = rng.gen_range(0..align_period);

            let mut search =
                HoleSearch::new(&bitmap, num_pages, requested_pages, align_period, align_phase);
            assert_eq!(
                search.next_hole(),
                oracle(&used, requested_pages, align_period, align_phase),
                "num_pages={} requested={} period={} phase={}",
                num_pages,
                requested_pages,
                align_period,
                align_phase
            );
        }
    }
}
