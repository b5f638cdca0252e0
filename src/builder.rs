//! Mechanism for building a `Region`, with proper invariant checking

use crate::{
    error::{Error, Result},
    sys, Region,
};

use log::info;

/// Default normal arena capacity
const DEFAULT_CAPACITY: usize = 1 << 30;

/// Upper bound on the automatically sized huge arena
const MAX_AUTO_HUGE_CAPACITY: usize = 1 << 30;

/// Default number of simultaneously live blocks
const DEFAULT_MAX_BLOCKS: usize = 128;

/// Default largest block alignment
const DEFAULT_MAX_ALIGN: usize = 64 << 20;

/// Builder for a shared region
//
// NOTE: The main purpose of this builder is to ensure that a certain number of
//       preconditions are upheld upon constructing the region. These are
//       listed as "must" bullet points in the struct members' doc comments.
#[derive(Debug, Default)]
pub struct Builder {
    /// Capacity of the normal page arena in bytes
    /// - Will be set to 1 GiB if unspecified
    /// - Must be nonzero
    /// - Will be rounded to the next multiple of the system page size
    capacity: Option<usize>,

    /// Capacity of the huge page arena in bytes
    /// - Will be derived from the free huge page pool if unspecified
    /// - Must be nonzero
    /// - Will be rounded to the next multiple of the huge page size
    huge_capacity: Option<usize>,

    /// Truth that huge pages should be used at all
    /// - Will be set to true if unspecified
    huge_pages: Option<bool>,

    /// Number of simultaneously live blocks
    /// - Will be set to 128 if unspecified
    /// - Must be nonzero, and fit in a 32-bit handle
    max_blocks: Option<usize>,

    /// Largest block alignment in bytes
    /// - Will be set to 64 MiB if unspecified
    /// - Must be a power of 2
    max_align: Option<usize>,
}

/// Validated region configuration
#[derive(Clone, Copy, Debug)]
pub(crate) struct Config {
    pub page_size: usize,
    pub capacity: usize,
    pub huge: Option<HugeConfig>,
    pub max_blocks: usize,
    pub max_align: usize,
}

/// Huge page arena configuration
#[derive(Clone, Copy, Debug)]
pub(crate) struct HugeConfig {
    pub page_size: usize,
    pub capacity: usize,
}

impl Builder {
    /// Start building a region
    pub const fn new() -> Self {
        Self {
            capacity: None,
            huge_capacity: None,
            huge_pages: None,
            max_blocks: None,
            max_align: None,
        }
    }

    /// Set the capacity of the normal page arena (in bytes)
    ///
    /// The arena is a virtual memory reservation: pages only consume memory
    /// once a block that covers them is touched.
    pub fn capacity(&mut self, capacity: usize) -> &mut Self {
        assert!(capacity != 0, "Arena capacity must not be zero");
        assert!(self.capacity.replace(capacity).is_none(), "Capacity must only be set once");
        self
    }

    /// Set the capacity of the huge page arena (in bytes)
    ///
    /// Huge pages are reserved when the region is built, so by default the
    /// arena only takes what the free huge page pool offers.
    pub fn huge_capacity(&mut self, capacity: usize) -> &mut Self {
        assert!(capacity != 0, "Huge arena capacity must not be zero");
        assert!(
            self.huge_capacity.replace(capacity).is_none(),
            "Huge capacity must only be set once"
        );
        self
    }

    /// Enable or disable huge page support
    pub fn huge_pages(&mut self, enabled: bool) -> &mut Self {
        assert!(
            self.huge_pages.replace(enabled).is_none(),
            "Huge page support must only be configured once"
        );
        self
    }

    /// Set the maximal number of simultaneously live blocks
    pub fn max_blocks(&mut self, max_blocks: usize) -> &mut Self {
        assert!(max_blocks != 0, "There must be room for at least one block");
        assert!(max_blocks < u32::MAX as usize, "Too many blocks for 32-bit handles");
        assert!(
            self.max_blocks.replace(max_blocks).is_none(),
            "Block count must only be set once"
        );
        self
    }

    /// Set the largest alignment that reservations may request (in bytes)
    pub fn max_align(&mut self, max_align: usize) -> &mut Self {
        assert!(max_align.is_power_of_two(), "Alignment must be a power of 2");
        assert!(
            self.max_align.replace(max_align).is_none(),
            "Maximal alignment must only be set once"
        );
        self
    }

    /// Build the previously configured region
    ///
    /// This maps all the memory the region will ever use, so it must happen
    /// before any worker thread or process is started.
    pub fn build(&self) -> Result<Region> {
        let page_size = sys::page_size();
        let capacity = round_up(self.capacity.unwrap_or(DEFAULT_CAPACITY), page_size)?;
        let huge = if self.huge_pages.unwrap_or(true) {
            self.huge_config()?
        } else {
            info!("Huge pages disabled by configuration");
            None
        };
        Region::create(Config {
            page_size,
            capacity,
            huge,
            max_blocks: self.max_blocks.unwrap_or(DEFAULT_MAX_BLOCKS),
            max_align: self.max_align.unwrap_or(DEFAULT_MAX_ALIGN),
        })
    }

    /// Size the huge page arena
    fn huge_config(&self) -> Result<Option<HugeConfig>> {
        let page_size = match sys::huge_page_size() {
            Some(size) => size,
            None => {
                info!("No huge page support detected");
                return Ok(None);
            }
        };
        let capacity = match self.huge_capacity {
            Some(capacity) => round_up(capacity, page_size)?,
            None => {
                let free_pages = sys::free_huge_pages();
                let capacity = free_pages.saturating_mul(page_size).min(MAX_AUTO_HUGE_CAPACITY);
                capacity - capacity % page_size
            }
        };
        if capacity == 0 {
            info!("No free {} byte huge pages", page_size);
            return Ok(None);
        }
        Ok(Some(HugeConfig {
            page_size,
            capacity,
        }))
    }
}

/// Round a capacity to the next multiple of a page size
fn round_up(capacity: usize, page_size: usize) -> Result<usize> {
    let extra_bytes = capacity % page_size;
    if extra_bytes == 0 {
        Ok(capacity)
    } else {
        capacity.checked_add(page_size - extra_bytes).ok_or_else(|| {
            Error::InvalidArgument(format!("capacity {} is too large", capacity))
        })
    }
}
