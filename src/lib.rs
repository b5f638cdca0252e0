//! This crate manages named blocks of shared memory which can be reserved,
//! looked up and freed concurrently by many threads, and by the processes
//! which are forked from the one that set things up.
//!
//! Blocks come with layout guarantees which hardware-facing code cares about:
//! the size of the pages backing them (huge or default-size pages), the
//! promise that they sit at the same virtual address in every process, and
//! a description of their physically contiguous segments, including physical
//! addresses when the system lets us see them.
//!
//! # Region primer
//!
//! All bookkeeping lives in a [`Region`], which must be built before any
//! worker thread or process is started:
//!
//! - A **control mapping** holds the block registry and the page usage
//!   bitmaps. It is shared memory, so every process of the family sees the
//!   same registry, and its lock is a spin lock rather than an OS mutex.
//! - A **normal arena** of default-size pages, which is merely a virtual
//!   memory reservation until blocks carved from it get touched.
//! - An optional **huge arena** of huge pages, which the kernel reserves when
//!   the region is built.
//!
//! Since every mapping exists before the first `fork()`, the address of a
//! block is the same in every context, and no per-process mapping step is
//! ever needed. Reserving a block means finding a run of free pages in one of
//! the arenas, which is done without locking in the same way as a concurrent
//! bitmap allocator, and then publishing it in the registry under the
//! registry lock.
//!
//! # Example
//!
//! ```
//! use shmblock::{Region, ShmFlags};
//!
//! let region = Region::new().capacity(16 << 20).huge_pages(false).build()?;
//! let handle = region.reserve(Some("frames"), 4096, 64, ShmFlags::SINGLE_VA)?;
//! assert_eq!(region.lookup("frames"), Some(handle));
//! let info = region.info(handle)?;
//! assert_eq!(info.size, 4096);
//! region.free(handle)?;
//! assert_eq!(region.lookup("frames"), None);
//! # Ok::<(), shmblock::Error>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod allocation;
mod arena;
mod bitmap;
mod builder;
mod capability;
mod error;
mod handle;
mod hole;
pub mod lock;
mod registry;
mod segment;
mod shared;
pub mod stress;
pub mod sys;

use crate::{
    arena::{Arena, ArenaKind},
    bitmap::AtomicChunkBitmap,
    builder::Config,
    registry::{BlockName, BlockRecord, EntryCell, Header, Registry},
    segment::SegmentLayout,
    shared::{Backing, SharedMapping},
};

use log::{debug, info, warn};

use std::{
    alloc::Layout,
    io,
    ptr::{self, NonNull},
    sync::atomic::AtomicU64,
};

// Re-export the public API at the crate root
pub use crate::{
    builder::Builder,
    capability::{Capability, ShmFlags},
    error::{Error, Result},
    handle::Handle,
    registry::MAX_NAME_LEN,
    segment::{BlockInfo, SegmentInfo},
};

/// Shared memory region which blocks are reserved from
///
/// Share it between threads by reference or `Arc`, and between processes by
/// building it before forking them.
#[derive(Debug)]
pub struct Region {
    /// Table of live blocks, in the control mapping
    registry: Registry,

    /// Default-size page arena
    normal: Arena,

    /// Huge page arena, if the system had huge pages to spare
    huge: Option<Arena>,

    /// Limits and features advertised to callers
    capability: Capability,

    /// Truth that this process family can see physical addresses
    pagemap_readable: bool,

    /// Registry and page bitmaps, must outlive everything that points into it
    _control: SharedMapping,
}

/// Placement of the registry and page bitmaps in the control mapping
struct ControlLayout {
    layout: Layout,
    entries: usize,
    normal_bitmap: usize,
    normal_phys: usize,
    huge_bitmap: usize,
    huge_phys: usize,
}

impl ControlLayout {
    fn new(max_blocks: usize, normal_pages: usize, huge_pages: usize) -> Result<Self> {
        let fatal = |e: std::alloc::LayoutError| Error::Fatal(io::Error::other(e));
        let layout = Layout::new::<Header>();
        let (layout, entries) = layout
            .extend(Layout::array::<EntryCell>(max_blocks).map_err(fatal)?)
            .map_err(fatal)?;
        let (layout, normal_bitmap) = layout
            .extend(
                Layout::array::<AtomicChunkBitmap>(Arena::bitmap_len(normal_pages))
                    .map_err(fatal)?,
            )
            .map_err(fatal)?;
        let (layout, normal_phys) = layout
            .extend(Layout::array::<AtomicU64>(normal_pages).map_err(fatal)?)
            .map_err(fatal)?;
        let (layout, huge_bitmap) = layout
            .extend(
                Layout::array::<AtomicChunkBitmap>(Arena::bitmap_len(huge_pages))
                    .map_err(fatal)?,
            )
            .map_err(fatal)?;
        let (layout, huge_phys) = layout
            .extend(Layout::array::<AtomicU64>(huge_pages).map_err(fatal)?)
            .map_err(fatal)?;
        Ok(Self {
            layout: layout.pad_to_align(),
            entries,
            normal_bitmap,
            normal_phys,
            huge_bitmap,
            huge_phys,
        })
    }
}

impl Region {
    /// Start building a region
    ///
    /// See the `Builder` documentation for more details on the subsequent
    /// region configuration process.
    pub const fn new() -> Builder {
        Builder::new()
    }

    /// Region constructor proper, called by `Builder` once the configuration
    /// has been validated
    pub(crate) fn create(config: Config) -> Result<Self> {
        let normal_pages = config.capacity / config.page_size;
        let huge_pages = config
            .huge
            .map_or(0, |huge| huge.capacity / huge.page_size);
        let control_layout = ControlLayout::new(config.max_blocks, normal_pages, huge_pages)?;

        // Map and initialize the control mapping. Physical address tables
        // are left alone: zeroed memory is a valid array of atomics, and
        // touching it would commit memory for every page of the arenas.
        let control_len = div_round_up(control_layout.layout.size(), config.page_size)
            * config.page_size;
        let control = SharedMapping::new(control_len, Backing::Normal, config.page_size)
            .map_err(Error::Fatal)?;
        debug_assert!(control_layout.layout.align() <= config.page_size);
        let base = control.as_ptr();
        let at = |offset: usize| {
            // This is safe because all offsets come from a layout which fits
            // in the control mapping
            unsafe { base.add(offset) }
        };
        let header = at(0).cast::<Header>();
        let entries = at(control_layout.entries).cast::<EntryCell>();
        let normal_bitmap = at(control_layout.normal_bitmap).cast::<AtomicChunkBitmap>();
        let huge_bitmap = at(control_layout.huge_bitmap).cast::<AtomicChunkBitmap>();
        // This is safe because the target memory is ours, suitably aligned and
        // not yet visible to anyone else
        unsafe {
            ptr::write(header, Header::new());
            for idx in 0..config.max_blocks {
                ptr::write(entries.add(idx), EntryCell::new());
            }
            for chunk_idx in 0..Arena::bitmap_len(normal_pages) {
                ptr::write(
                    normal_bitmap.add(chunk_idx),
                    AtomicChunkBitmap::new(Arena::initial_chunk(chunk_idx, normal_pages)),
                );
            }
            for chunk_idx in 0..Arena::bitmap_len(huge_pages) {
                ptr::write(
                    huge_bitmap.add(chunk_idx),
                    AtomicChunkBitmap::new(Arena::initial_chunk(chunk_idx, huge_pages)),
                );
            }
        }
        let nonnull = |ptr: *mut u8| {
            NonNull::new(ptr).ok_or_else(|| Error::Fatal(io::Error::other("null control mapping")))
        };

        // Set up the registry and arenas, which is safe because the control
        // mapping was just initialized accordingly and outlives them
        let registry = unsafe {
            Registry::new(nonnull(header.cast())?.cast(), nonnull(entries.cast())?.cast(), config.max_blocks)
        };
        let normal = unsafe {
            Arena::new(
                ArenaKind::Normal,
                config.page_size,
                normal_pages,
                config.max_align,
                nonnull(normal_bitmap.cast())?.cast(),
                nonnull(at(control_layout.normal_phys))?.cast(),
            )
        }
        .map_err(Error::Fatal)?;
        let huge = match config.huge {
            Some(huge_config) => {
                let result = unsafe {
                    Arena::new(
                        ArenaKind::Huge,
                        huge_config.page_size,
                        huge_pages,
                        config.max_align,
                        nonnull(huge_bitmap.cast())?.cast(),
                        nonnull(at(control_layout.huge_phys))?.cast(),
                    )
                };
                match result {
                    Ok(arena) => {
                        info!(
                            "Using {} bytes of {} byte huge pages",
                            huge_config.capacity, huge_config.page_size
                        );
                        Some(arena)
                    }
                    Err(e) => {
                        info!("Huge pages unavailable: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let pagemap_readable = sys::pagemap_readable();
        if pagemap_readable {
            info!("Physical addresses are visible, hardware access blocks will report them");
        } else {
            info!("Physical addresses are hidden, segments will not report them");
        }

        let mut flags = ShmFlags::NO_HP | ShmFlags::PROC | ShmFlags::SINGLE_VA | ShmFlags::HW_ACCESS;
        if huge.is_some() {
            flags |= ShmFlags::HP;
        }
        let capability = Capability {
            max_blocks: config.max_blocks as u32,
            max_size: huge
                .as_ref()
                .map_or(0, Arena::capacity)
                .max(normal.capacity()),
            max_align: config.max_align,
            flags,
        };
        Ok(Self {
            registry,
            normal,
            huge,
            capability,
            pagemap_readable,
            _control: control,
        })
    }

    /// Limits and optional features of this region
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Reserve a new block
    ///
    /// An absent or empty `name` makes an anonymous block, which `lookup()`
    /// never returns. An `align` of 0 requests page alignment, which every
    /// block has anyway. A `size` of 0 is accepted and still yields a block
    /// with a valid address.
    ///
    /// Failures with `Error::is_soft()` set (exhaustion, missing feature) are
    /// expected outcomes which callers should handle by skipping or retrying.
    pub fn reserve(
        &self,
        name: Option<&str>,
        size: usize,
        align: usize,
        flags: ShmFlags,
    ) -> Result<Handle> {
        let result = self.try_reserve(name, size, align, flags);
        match &result {
            Ok(handle) => debug!(
                "Reserved block {:?} ({}) of {} bytes, align {}, flags {:?}",
                name, handle, size, align, flags
            ),
            Err(e) if e.is_soft() => debug!("Could not reserve block {:?}: {}", name, e),
            Err(e) => warn!("Rejected reservation of block {:?}: {}", name, e),
        }
        result
    }

    fn try_reserve(
        &self,
        name: Option<&str>,
        size: usize,
        align: usize,
        flags: ShmFlags,
    ) -> Result<Handle> {
        self.check_request(size, align, flags)?;
        let name = BlockName::parse(name)?;

        // Claim a registry entry first, so that a full registry does not cost
        // us a page allocation round trip
        let slot = self.registry.claim()?;
        let (arena, first_page, num_pages) = self.alloc_pages(size, align, flags)?;
        let mut record = BlockRecord {
            name: name.unwrap_or_default(),
            anonymous: name.is_none(),
            flags,
            size,
            align,
            arena: arena.kind(),
            first_page,
            num_pages,
            phys: false,
        };

        if flags.contains(ShmFlags::HW_ACCESS) {
            let addr = arena.page_addr(first_page);
            if let Err(e) = arena.populate(first_page, num_pages) {
                arena.release(first_page, num_pages);
                return Err(Error::ResourceExhausted(format!(
                    "cannot back {} bytes with physical memory: {}",
                    num_pages * arena.page_size(),
                    e
                )));
            }
            if self.pagemap_readable {
                match sys::phys_addrs(addr.as_ptr() as usize, num_pages, arena.page_size()) {
                    Ok(Some(addrs)) => {
                        arena.set_phys_addrs(first_page, &addrs);
                        record.phys = true;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to query physical addresses: {}", e),
                }
            }
        }
        Ok(self.registry.publish(slot, record))
    }

    /// Check a reservation request against the region's capability
    fn check_request(&self, size: usize, align: usize, flags: ShmFlags) -> Result<()> {
        if ShmFlags::from_bits(flags.bits()).is_none() {
            return Err(Error::InvalidArgument(format!("unknown flags {:#x}", flags.bits())));
        }
        if flags.contains(ShmFlags::HP | ShmFlags::NO_HP) {
            return Err(Error::InvalidArgument(
                "huge pages cannot be both required and forbidden".into(),
            ));
        }
        let unsupported = flags - self.capability.flags;
        if !unsupported.is_empty() {
            return Err(Error::FeatureUnavailable(unsupported));
        }
        if !self.capability.accepts_size(size) {
            return Err(Error::InvalidArgument(format!(
                "size {} exceeds the limit of {} bytes",
                size, self.capability.max_size
            )));
        }
        if !self.capability.accepts_align(align) {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is not a power of 2 up to {}",
                align, self.capability.max_align
            )));
        }
        Ok(())
    }

    /// Pick an arena and allocate pages from it
    fn alloc_pages(&self, size: usize, align: usize, flags: ShmFlags) -> Result<(&Arena, usize, usize)> {
        fn try_alloc(arena: &Arena, size: usize, align: usize) -> Option<(&Arena, usize, usize)> {
            let num_pages = arena.pages_for(size);
            arena
                .alloc(num_pages, align)
                .map(|first_page| (arena, first_page, num_pages))
        }
        let exhausted = |arena: &Arena| {
            Error::ResourceExhausted(format!(
                "no room for {} bytes aligned to {} in the {:?} arena",
                size,
                align,
                arena.kind()
            ))
        };

        if flags.contains(ShmFlags::HP) {
            let huge = self
                .huge
                .as_ref()
                .ok_or(Error::FeatureUnavailable(ShmFlags::HP))?;
            return try_alloc(huge, size, align).ok_or_else(|| exhausted(huge));
        }

        // Without constraints, blocks of at least one huge page go to the
        // huge arena while it has room
        if !flags.contains(ShmFlags::NO_HP) {
            if let Some(huge) = self.huge.as_ref().filter(|huge| size >= huge.page_size()) {
                if let Some(allocation) = try_alloc(huge, size, align) {
                    return Ok(allocation);
                }
            }
        }
        try_alloc(&self.normal, size, align).ok_or_else(|| exhausted(&self.normal))
    }

    /// Free a live block
    ///
    /// Freeing a block twice, or freeing a handle that was never issued, is
    /// detected and reported as `Error::UnknownHandle`.
    pub fn free(&self, handle: Handle) -> Result<()> {
        let record = self.registry.begin_release(handle).map_err(|e| {
            warn!("Refused to free block {}: {}", handle, e);
            e
        })?;
        let arena = self.arena(record.arena);
        arena.release(record.first_page, record.num_pages);
        self.registry.finish_release(handle);
        debug!("Freed block {:?} ({})", record.name, handle);
        Ok(())
    }

    /// Find a live block by name
    ///
    /// Anonymous blocks are never found. When several live blocks share a
    /// name, which of them is returned is unspecified: callers which reuse
    /// names must keep track of their own handles.
    pub fn lookup(&self, name: &str) -> Option<Handle> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return None;
        }
        self.registry.lookup(name)
    }

    /// Address of a live block's first byte
    pub fn addr(&self, handle: Handle) -> Result<NonNull<u8>> {
        let record = self.registry.get(handle)?;
        Ok(self.arena(record.arena).page_addr(record.first_page))
    }

    /// Summary of a live block
    pub fn info(&self, handle: Handle) -> Result<BlockInfo> {
        let record = self.registry.get(handle)?;
        Ok(self.block_info(&record))
    }

    /// Describe a live block's segments, starting from segment `start`
    ///
    /// Fills as many entries of `out` as there are segments left and returns
    /// how many were filled. A `start` past the last segment is an error.
    pub fn segment_info(&self, handle: Handle, start: usize, out: &mut [SegmentInfo]) -> Result<usize> {
        let record = self.registry.get(handle)?;
        let arena = self.arena(record.arena);
        let layout = self.segment_layout(&record);
        if start > layout.len() {
            return Err(Error::InvalidArgument(format!(
                "block {} has {} segments, cannot start at {}",
                handle,
                layout.len(),
                start
            )));
        }
        let phys = record
            .phys
            .then(|| arena.phys_addrs(record.first_page, record.num_pages));
        Ok(layout.describe(start, out, phys.as_deref()))
    }

    /// Describe all of a live block's segments
    pub fn segments(&self, handle: Handle) -> Result<Vec<SegmentInfo>> {
        let record = self.registry.get(handle)?;
        let mut segments = vec![SegmentInfo::default(); self.segment_layout(&record).len()];
        let filled = self.segment_info(handle, 0, &mut segments)?;
        segments.truncate(filled);
        Ok(segments)
    }

    /// Number of live blocks
    pub fn live_blocks(&self) -> usize {
        self.registry.live_count()
    }

    /// Summary of every live block
    pub fn blocks(&self) -> Vec<(Handle, BlockInfo)> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|(handle, record)| (handle, self.block_info(&record)))
            .collect()
    }

    /// Log the state of the region and of every live block
    pub fn print_all(&self) {
        let blocks = self.blocks();
        info!(
            "Shared region: {} of {} blocks live, flags {:?}",
            blocks.len(),
            self.registry.capacity(),
            self.capability.flags
        );
        for arena in std::iter::once(&self.normal).chain(self.huge.as_ref()) {
            info!(
                "  {:?} arena: {} of {} pages of {} bytes in use",
                arena.kind(),
                arena.used_pages(),
                arena.capacity() / arena.page_size(),
                arena.page_size()
            );
        }
        for (handle, info) in blocks {
            info!("  {}: {}", handle, info);
        }
    }

    /// Log the description of a live block and of its segments
    pub fn print(&self, handle: Handle) -> Result<()> {
        let info = self.info(handle)?;
        info!("Block {}: {}", handle, info);
        for (idx, segment) in self.segments(handle)?.iter().enumerate() {
            info!("  segment {}: {}", idx, segment);
        }
        Ok(())
    }

    fn arena(&self, kind: ArenaKind) -> &Arena {
        match (kind, &self.huge) {
            (ArenaKind::Huge, Some(huge)) => huge,
            _ => &self.normal,
        }
    }

    fn segment_layout(&self, record: &BlockRecord) -> SegmentLayout {
        let arena = self.arena(record.arena);
        let addr = arena.page_addr(record.first_page).as_ptr() as usize;
        SegmentLayout::new(addr, record.size, arena.page_size())
    }

    fn block_info(&self, record: &BlockRecord) -> BlockInfo {
        let arena = self.arena(record.arena);
        let layout = self.segment_layout(record);
        BlockInfo {
            name: record.name.as_str().to_owned(),
            addr: arena.page_addr(record.first_page).as_ptr() as usize,
            size: record.size,
            page_size: arena.page_size(),
            flags: record.flags,
            num_segments: layout.len(),
        }
    }
}

/// Small utility to divide two integers, rounding the result up
pub(crate) fn div_round_up(x: usize, y: usize) -> usize {
    // Check interface preconditions in debug builds
    debug_assert!(y != 0, "Attempted to divide by zero");

    // Return rounded division result
    (x / y) + (x % y != 0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{mem, sync::Arc};

    fn test_region() -> Region {
        Region::new()
            .capacity(64 << 20)
            .huge_pages(false)
            .build()
            .unwrap()
    }

    #[test]
    fn rounded_division() {
        assert_eq!(div_round_up(0, 4), 0);
        assert_eq!(div_round_up(1, 4), 1);
        assert_eq!(div_round_up(4, 4), 1);
        assert_eq!(div_round_up(5, 4), 2);
    }

    #[test]
    fn capability() {
        let region = test_region();
        let capa = region.capability();
        assert!(capa.max_blocks >= 1);
        assert!(capa.flags.contains(ShmFlags::PROC | ShmFlags::SINGLE_VA | ShmFlags::NO_HP));
        assert!(!capa.flags.contains(ShmFlags::EXPORT));
        assert!(!capa.flags.contains(ShmFlags::HP));
        assert!(capa.accepts_align(capa.max_align));
    }

    #[test]
    fn reserve_lookup_free() {
        let region = test_region();
        let size = mem::size_of::<[u64; 32]>();
        let handle = region.reserve(Some("test_1"), size, 0, ShmFlags::empty()).unwrap();
        assert!(handle.is_valid());
        let addr = region.addr(handle).unwrap();
        assert_eq!(region.lookup("test_1"), Some(handle));
        assert_eq!(region.addr(region.lookup("test_1").unwrap()).unwrap(), addr);

        // Write and read back the whole block
        let data = unsafe { std::slice::from_raw_parts_mut(addr.as_ptr(), size) };
        for (idx, byte) in data.iter_mut().enumerate() {
            *byte = idx as u8;
        }
        assert!(data.iter().enumerate().all(|(idx, &byte)| byte == idx as u8));

        assert_eq!(region.live_blocks(), 1);
        region.free(handle).unwrap();
        assert_eq!(region.lookup("test_1"), None);
        assert_eq!(region.live_blocks(), 0);
        assert!(matches!(region.addr(handle), Err(Error::UnknownHandle(_))));
    }

    #[test]
    fn info_test() {
        let region = test_region();
        let size = 4 << 20;
        let handle = region.reserve(Some("info_test"), size, 64, ShmFlags::empty()).unwrap();
        let info = region.info(handle).unwrap();
        assert_eq!(info.name, "info_test");
        assert_eq!(info.size, size);
        assert_eq!(info.addr, region.addr(handle).unwrap().as_ptr() as usize);
        assert_eq!(info.addr % 64, 0);
        assert!(info.num_segments >= 1);

        // Read the segment table in uneven pieces
        let mut segments = vec![SegmentInfo::default(); info.num_segments];
        let mut start = 0;
        while start < info.num_segments {
            let end = (start + 7).min(info.num_segments);
            let filled = region
                .segment_info(handle, start, &mut segments[start..end])
                .unwrap();
            assert_eq!(filled, end - start);
            start = end;
        }
        assert_eq!(segments.iter().map(|seg| seg.len).sum::<usize>(), size);
        assert_eq!(segments[0].addr, info.addr);
        assert!(segments
            .windows(2)
            .all(|pair| pair[0].addr + pair[0].len == pair[1].addr));
        assert_eq!(segments, region.segments(handle).unwrap());

        // Out of range and oversized requests
        let mut buffer = [SegmentInfo::default(); 4];
        assert_eq!(
            region.segment_info(handle, info.num_segments - 1, &mut buffer).unwrap(),
            1
        );
        assert_eq!(region.segment_info(handle, info.num_segments, &mut buffer).unwrap(), 0);
        assert!(matches!(
            region.segment_info(handle, info.num_segments + 1, &mut buffer),
            Err(Error::InvalidArgument(_))
        ));

        region.print(handle).unwrap();
        region.free(handle).unwrap();
    }

    #[test]
    fn normal_pages_only() {
        let region = test_region();
        let handle = region.reserve(Some("no_hp"), 3 << 20, 0, ShmFlags::NO_HP).unwrap();
        assert_eq!(region.info(handle).unwrap().page_size, sys::page_size());
        region.free(handle).unwrap();
    }

    #[test]
    fn huge_pages_unavailable() {
        let region = test_region();
        assert!(matches!(
            region.reserve(Some("hp"), 1 << 21, 0, ShmFlags::HP),
            Err(Error::FeatureUnavailable(flags)) if flags == ShmFlags::HP
        ));
    }

    #[test]
    fn huge_pages_if_available() {
        let region = Region::new()
            .capacity(16 << 20)
            .huge_capacity(sys::huge_page_size().unwrap_or(1 << 21))
            .build()
            .unwrap();
        let huge_page_size = match sys::huge_page_size() {
            Some(size) if region.capability().flags.contains(ShmFlags::HP) => size,
            _ => {
                assert!(matches!(
                    region.reserve(None, 1 << 21, 0, ShmFlags::HP),
                    Err(Error::FeatureUnavailable(_))
                ));
                return;
            }
        };
        let handle = region.reserve(Some("hp"), huge_page_size, 0, ShmFlags::HP).unwrap();
        let info = region.info(handle).unwrap();
        assert_eq!(info.page_size, huge_page_size);
        assert_eq!(info.addr % huge_page_size, 0);
        assert!(matches!(
            region.reserve(Some("hp2"), huge_page_size, 0, ShmFlags::HP),
            Err(Error::ResourceExhausted(_))
        ));
        region.free(handle).unwrap();
    }

    #[test]
    fn anonymous_blocks() {
        let region = test_region();
        let size = 10 * mem::size_of::<i32>();
        let handle = region.reserve(None, size, 0, ShmFlags::empty()).unwrap();
        let other = region.reserve(Some(""), size, 0, ShmFlags::empty()).unwrap();
        let info = region.info(handle).unwrap();
        assert!(!info.name.is_empty());
        assert_eq!(region.lookup(&info.name), None);
        assert_eq!(region.lookup(""), None);
        assert_ne!(region.addr(handle).unwrap(), region.addr(other).unwrap());
        region.free(handle).unwrap();
        region.free(other).unwrap();
    }

    #[test]
    fn name_length_limit() {
        let region = test_region();
        let longest = "n".repeat(MAX_NAME_LEN);
        let handle = region.reserve(Some(&longest), 64, 0, ShmFlags::empty()).unwrap();
        assert_eq!(region.lookup(&longest), Some(handle));
        assert_eq!(region.info(handle).unwrap().name, longest);

        let too_long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            region.reserve(Some(&too_long), 64, 0, ShmFlags::empty()),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(region.lookup(&too_long), None);
        region.free(handle).unwrap();
    }

    #[test]
    fn duplicate_names() {
        let region = test_region();
        let first = region.reserve(Some("twin"), 4096, 0, ShmFlags::empty()).unwrap();
        let second = region.reserve(Some("twin"), 4096, 0, ShmFlags::empty()).unwrap();
        assert_ne!(first, second);
        let (addr1, addr2) = (region.addr(first).unwrap(), region.addr(second).unwrap());
        assert_ne!(addr1, addr2);

        // The blocks do not alias
        unsafe {
            ptr::write_bytes(addr1.as_ptr(), 0x11, 4096);
            ptr::write_bytes(addr2.as_ptr(), 0x22, 4096);
            assert_eq!(*addr1.as_ptr().add(4095), 0x11);
            assert_eq!(*addr2.as_ptr(), 0x22);
        }

        let found = region.lookup("twin").unwrap();
        assert!(found == first || found == second);
        region.free(first).unwrap();
        assert_eq!(region.lookup("twin"), Some(second));
        region.free(second).unwrap();
        assert_eq!(region.lookup("twin"), None);
    }

    #[test]
    fn bad_frees() {
        let region = test_region();
        let handle = region.reserve(Some("once"), 100, 0, ShmFlags::empty()).unwrap();
        region.free(handle).unwrap();
        assert!(matches!(region.free(handle), Err(Error::UnknownHandle(h)) if h == handle));
        assert!(matches!(region.free(Handle::INVALID), Err(Error::UnknownHandle(_))));

        // A recycled registry entry does not revive the old handle
        let again = region.reserve(Some("twice"), 100, 0, ShmFlags::empty()).unwrap();
        assert_ne!(again, handle);
        assert!(matches!(region.info(handle), Err(Error::UnknownHandle(_))));
        region.free(again).unwrap();
    }

    #[test]
    fn zero_sized_blocks() {
        let region = test_region();
        let handle = region.reserve(Some("empty"), 0, 0, ShmFlags::empty()).unwrap();
        let other = region.reserve(Some("empty2"), 0, 0, ShmFlags::empty()).unwrap();
        assert_ne!(region.addr(handle).unwrap(), region.addr(other).unwrap());
        let info = region.info(handle).unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.num_segments, 1);
        let segments = region.segments(handle).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len, 0);
        region.free(handle).unwrap();
        region.free(other).unwrap();
    }

    #[test]
    fn alignment() {
        let region = test_region();
        let mut handles = Vec::new();
        for shift in 0..=20 {
            let align = 1 << shift;
            let handle = region.reserve(None, 100, align, ShmFlags::empty()).unwrap();
            assert_eq!(region.addr(handle).unwrap().as_ptr() as usize % align, 0);
            handles.push(handle);
        }
        for handle in handles {
            region.free(handle).unwrap();
        }
    }

    #[test]
    fn invalid_requests() {
        let region = test_region();
        let capa = region.capability();
        let invalid = |result: Result<Handle>| matches!(result, Err(Error::InvalidArgument(_)));
        assert!(invalid(region.reserve(None, 100, 3, ShmFlags::empty())));
        assert!(invalid(region.reserve(None, 100, capa.max_align * 2, ShmFlags::empty())));
        assert!(invalid(region.reserve(None, capa.max_size + 1, 0, ShmFlags::empty())));
        assert!(invalid(region.reserve(None, 100, 0, ShmFlags::HP | ShmFlags::NO_HP)));
        assert!(invalid(region.reserve(Some("a\0b"), 100, 0, ShmFlags::empty())));
        assert!(matches!(
            region.reserve(None, 100, 0, ShmFlags::EXPORT),
            Err(Error::FeatureUnavailable(flags)) if flags == ShmFlags::EXPORT
        ));
        assert_eq!(region.live_blocks(), 0);
    }

    #[test]
    fn exhaustion() {
        let region = Region::new()
            .capacity(16 * sys::page_size())
            .max_blocks(2)
            .huge_pages(false)
            .build()
            .unwrap();
        let page_size = sys::page_size();
        let big = region.reserve(None, 12 * page_size, 0, ShmFlags::empty()).unwrap();
        let err = region.reserve(None, 5 * page_size, 0, ShmFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert!(err.is_soft());

        let small = region.reserve(None, page_size, 0, ShmFlags::empty()).unwrap();
        assert!(matches!(
            region.reserve(None, 1, 0, ShmFlags::empty()),
            Err(Error::ResourceExhausted(_))
        ));

        // Failed reservations leave nothing behind
        region.free(big).unwrap();
        region.free(small).unwrap();
        let whole = region.reserve(None, 16 * page_size, 0, ShmFlags::empty()).unwrap();
        region.free(whole).unwrap();
    }

    #[test]
    fn hardware_access() {
        let region = test_region();
        let page_size = sys::page_size();
        let handle = region
            .reserve(Some("dma"), 3 * page_size + 5, 0, ShmFlags::HW_ACCESS)
            .unwrap();
        let addr = region.addr(handle).unwrap();
        let mut residency = [0u8; 4];
        let res = unsafe {
            libc::mincore(addr.as_ptr().cast(), 4 * page_size, residency.as_mut_ptr())
        };
        assert_eq!(res, 0);
        assert!(residency.iter().all(|page| page & 1 == 1));

        let segments = region.segments(handle).unwrap();
        assert_eq!(segments.len(), 4);
        let known = segments.iter().filter(|seg| seg.pa.is_some()).count();
        assert!(known == 0 || known == segments.len());
        assert!(segments.iter().all(|seg| seg.pa == seg.iova));

        // Pages are discarded on free, so they come back zeroed
        unsafe { ptr::write_bytes(addr.as_ptr(), 0xee, 3 * page_size + 5) };
        region.free(handle).unwrap();
        let again = region
            .reserve(Some("dma"), 3 * page_size + 5, 0, ShmFlags::HW_ACCESS)
            .unwrap();
        assert_eq!(region.addr(again).unwrap(), addr);
        assert_eq!(unsafe { *addr.as_ptr().add(3 * page_size) }, 0);
        region.free(again).unwrap();
    }

    #[test]
    fn max_reserve() {
        let page_size = sys::page_size();
        let mut neighbours = Vec::new();
        for round in 1..=4 {
            // Unaligned neighbours shift where the kernel places the arenas
            neighbours.push(
                SharedMapping::new(round * 3 * page_size, Backing::Normal, page_size).unwrap(),
            );
            let region = Region::new()
                .capacity(16 << 20)
                .max_align(8 << 20)
                .huge_pages(false)
                .build()
                .unwrap();
            let capa = region.capability();
            let handle = region
                .reserve(Some("max_reserve"), capa.max_size, capa.max_align, ShmFlags::empty())
                .unwrap();
            let addr = region.addr(handle).unwrap();
            assert_eq!(addr.as_ptr() as usize % capa.max_align, 0);
            let bytes = unsafe {
                ptr::write_bytes(addr.as_ptr(), 0x77, capa.max_size);
                std::slice::from_raw_parts(addr.as_ptr(), capa.max_size)
            };
            assert!(bytes.iter().all(|&byte| byte == 0x77));
            region.free(handle).unwrap();
        }
    }

    #[test]
    fn introspection() {
        let region = test_region();
        let first = region.reserve(Some("first"), 10, 0, ShmFlags::empty()).unwrap();
        let second = region.reserve(None, 20, 0, ShmFlags::SINGLE_VA).unwrap();
        let blocks = region.blocks();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().any(|(handle, info)| *handle == first && info.size == 10));
        assert!(blocks
            .iter()
            .any(|(handle, info)| *handle == second && info.flags == ShmFlags::SINGLE_VA));
        region.print_all();
        region.free(first).unwrap();
        region.free(second).unwrap();
        assert!(region.blocks().is_empty());
        assert!(matches!(region.print(first), Err(Error::UnknownHandle(_))));
    }

    #[test]
    fn same_address_in_every_thread() {
        let region = Arc::new(test_region());
        let handle = region
            .reserve(Some("single_va"), 4096, 0, ShmFlags::SINGLE_VA)
            .unwrap();
        let addr = region.addr(handle).unwrap().as_ptr() as usize;
        unsafe { *region.addr(handle).unwrap().as_ptr() = 42 };

        let check = |region: Arc<Region>| {
            move || {
                let handle = region.lookup("single_va").unwrap();
                let found = region.addr(handle).unwrap();
                assert_eq!(found.as_ptr() as usize, addr);
                assert_eq!(unsafe { *found.as_ptr() }, 42);
            }
        };
        testbench::concurrent_test_3(
            check(region.clone()),
            check(region.clone()),
            check(region.clone()),
        );
        region.free(handle).unwrap();
    }

    #[test]
    fn reserve_from_many_threads() {
        const ROUNDS: usize = 200;
        let region = Arc::new(test_region());
        let worker = |region: Arc<Region>, name: &'static str| {
            move || {
                for round in 0..ROUNDS {
                    let size = 4096 * (1 + round % 5);
                    let handle = region.reserve(Some(name), size, 0, ShmFlags::empty()).unwrap();
                    assert_eq!(region.lookup(name), Some(handle));
                    let addr = region.addr(handle).unwrap();
                    unsafe {
                        ptr::write_bytes(addr.as_ptr(), round as u8, size);
                        assert_eq!(*addr.as_ptr().add(size - 1), round as u8);
                    }
                    region.free(handle).unwrap();
                }
            }
        };
        testbench::concurrent_test_3(
            worker(region.clone(), "worker_a"),
            worker(region.clone(), "worker_b"),
            worker(region.clone(), "worker_c"),
        );
        assert_eq!(region.live_blocks(), 0);
    }
}
