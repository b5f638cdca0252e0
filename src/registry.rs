//! Table of live blocks, shared by every context of a region
//!
//! The registry lives in the region's control mapping, next to the page
//! bitmaps. It is a fixed-size array of entries guarded by a single spin
//! lock, which is only ever held for short bookkeeping steps: page
//! allocation, page locking and physical address queries all happen outside
//! of it.
//!
//! Each entry goes through the following states:
//!
//! `FREE -> PENDING -> LIVE -> RELEASING -> FREE`
//!
//! A `PENDING` entry is reserved for a block under construction, which keeps
//! the registry capacity check and the block's publication consistent. A
//! `RELEASING` entry belongs to the one `free()` call that won the race for
//! it, which is how double frees are told apart from legitimate ones.

use crate::{
    arena::ArenaKind,
    error::{Error, Result},
    lock::SpinLock,
    Handle, ShmFlags,
};

use std::{cell::UnsafeCell, fmt::Write, ptr::NonNull, slice};

/// Longest block name, in bytes
pub const MAX_NAME_LEN: usize = 31;

/// Registry entry state: unused
const FREE: u32 = 0;

/// Registry entry state: reserved for a block under construction
const PENDING: u32 = 1;

/// Registry entry state: describes a live block
const LIVE: u32 = 2;

/// Registry entry state: its block is being freed
const RELEASING: u32 = 3;

/// Fixed-capacity block name
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(C)]
pub struct BlockName {
    bytes: [u8; MAX_NAME_LEN + 1],
    len: u8,
}

impl BlockName {
    /// Validate a user-provided name
    ///
    /// Returns `None` for anonymous blocks (no name, or an empty one).
    pub fn parse(name: Option<&str>) -> Result<Option<Self>> {
        let name = match name {
            None | Some("") => return Ok(None),
            Some(name) => name,
        };
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "block name is {} bytes long, the limit is {}",
                name.len(),
                MAX_NAME_LEN
            )));
        }
        if name.contains('\0') {
            return Err(Error::InvalidArgument("block name contains a NUL byte".into()));
        }
        Ok(Some(Self::new_unchecked(name)))
    }

    fn new_unchecked(name: &str) -> Self {
        debug_assert!(name.len() <= MAX_NAME_LEN);
        let mut bytes = [0; MAX_NAME_LEN + 1];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            bytes,
            len: name.len() as u8,
        }
    }

    /// Auto-generated name of an anonymous block
    fn anonymous(serial: u64) -> Self {
        let mut name = String::with_capacity(MAX_NAME_LEN);
        // Writing to a String cannot fail, and "anon-" + 20 digits fits
        let _ = write!(name, "anon-{}", serial);
        Self::new_unchecked(&name)
    }

    pub fn as_str(&self) -> &str {
        // Names are only ever built from whole `&str`s
        std::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or_default()
    }
}

impl Default for BlockName {
    fn default() -> Self {
        Self::new_unchecked("")
    }
}

impl std::fmt::Debug for BlockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Everything the registry knows about a live block
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct BlockRecord {
    pub name: BlockName,
    pub anonymous: bool,
    pub flags: ShmFlags,
    pub size: usize,
    pub align: usize,
    pub arena: ArenaKind,
    pub first_page: usize,
    pub num_pages: usize,

    /// Physical addresses of the pages can be reported
    pub phys: bool,
}

/// Registry entry, only accessed with the registry lock held
#[repr(C)]
struct Entry {
    state: u32,
    generation: u32,
    record: BlockRecord,
}

/// Registry-wide state
#[repr(C)]
pub struct Header {
    lock: SpinLock,
    anon_serial: UnsafeCell<u64>,
}

impl Header {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            anon_serial: UnsafeCell::new(0),
        }
    }
}

/// Storage for one registry entry, to be laid out by the region
#[repr(transparent)]
pub struct EntryCell(UnsafeCell<Entry>);

impl EntryCell {
    pub fn new() -> Self {
        Self(UnsafeCell::new(Entry {
            state: FREE,
            generation: 0,
            record: BlockRecord {
                name: BlockName::default(),
                anonymous: true,
                flags: ShmFlags::empty(),
                size: 0,
                align: 0,
                arena: ArenaKind::Normal,
                first_page: 0,
                num_pages: 0,
                phys: false,
            },
        }))
    }
}

/// Process-local view of the shared block registry
#[derive(Debug)]
pub struct Registry {
    header: NonNull<Header>,
    entries: NonNull<EntryCell>,
    num_entries: usize,
}

impl Registry {
    /// Set up a view of a registry
    ///
    /// # Safety
    ///
    /// `header` and `entries` must point to an initialized header and
    /// `num_entries` initialized entries, which outlive the registry and are
    /// only accessed through `Registry` views.
    pub unsafe fn new(header: NonNull<Header>, entries: NonNull<EntryCell>, num_entries: usize) -> Self {
        debug_assert!(num_entries <= u32::MAX as usize, "Too many registry entries");
        Self {
            header,
            entries,
            num_entries,
        }
    }

    /// Registry capacity
    pub fn capacity(&self) -> usize {
        self.num_entries
    }

    /// Reserve an entry for a block under construction
    ///
    /// The entry goes back to the free pool if the returned guard is dropped
    /// without being published.
    pub fn claim(&self) -> Result<SlotGuard<'_>> {
        let _lock = self.header().lock.lock();
        for (idx, entry) in self.entries().iter().enumerate() {
            // This is safe because we hold the registry lock
            let entry = unsafe { &mut *entry.0.get() };
            if entry.state == FREE {
                entry.state = PENDING;
                entry.generation = entry.generation.wrapping_add(1).max(1);
                return Ok(SlotGuard {
                    registry: self,
                    idx,
                    handle: Handle::from_parts(idx as u32, entry.generation),
                });
            }
        }
        Err(Error::ResourceExhausted(format!(
            "all {} registry entries are in use",
            self.num_entries
        )))
    }

    /// Make a block visible to other contexts, return its handle
    pub fn publish(&self, slot: SlotGuard<'_>, mut record: BlockRecord) -> Handle {
        let handle = slot.handle;
        let idx = slot.idx;
        std::mem::forget(slot);

        let _lock = self.header().lock.lock();
        // This is safe because we hold the registry lock
        let entry = unsafe { &mut *self.entries()[idx].0.get() };
        debug_assert_eq!(entry.state, PENDING, "Published an entry which wasn't claimed");
        if record.anonymous {
            // This is safe because we hold the registry lock
            let serial = unsafe { &mut *self.header().anon_serial.get() };
            *serial += 1;
            record.name = BlockName::anonymous(*serial);
        }
        entry.record = record;
        entry.state = LIVE;
        handle
    }

    /// Start freeing a block, which must be live
    ///
    /// From this point on, the handle does not resolve anymore. The caller
    /// must later call `finish_release()` to recycle the registry entry.
    pub fn begin_release(&self, handle: Handle) -> Result<BlockRecord> {
        self.with_live_entry(handle, |entry| {
            entry.state = RELEASING;
            entry.record
        })
    }

    /// Recycle the entry of a block whose release was started
    pub fn finish_release(&self, handle: Handle) {
        let _lock = self.header().lock.lock();
        if let Some(idx) = handle.slot_idx() {
            // This is safe because we hold the registry lock
            let entry = unsafe { &mut *self.entries()[idx].0.get() };
            debug_assert_eq!(entry.state, RELEASING, "Finished a release which wasn't started");
            debug_assert_eq!(entry.generation, handle.generation(), "Entry was recycled during release");
            entry.state = FREE;
        }
    }

    /// Record of a live block
    pub fn get(&self, handle: Handle) -> Result<BlockRecord> {
        self.with_live_entry(handle, |entry| entry.record)
    }

    /// Find a live, named block by name
    ///
    /// Names need not be unique: when several live blocks share a name, the
    /// one in the lowest registry entry is returned, which says nothing about
    /// which of them was reserved first.
    pub fn lookup(&self, name: &str) -> Option<Handle> {
        let _lock = self.header().lock.lock();
        self.entries().iter().enumerate().find_map(|(idx, entry)| {
            // This is safe because we hold the registry lock
            let entry = unsafe { &*entry.0.get() };
            (entry.state == LIVE && !entry.record.anonymous && entry.record.name.as_str() == name)
                .then(|| Handle::from_parts(idx as u32, entry.generation))
        })
    }

    /// Consistent copy of every live block's record
    pub fn snapshot(&self) -> Vec<(Handle, BlockRecord)> {
        let _lock = self.header().lock.lock();
        self.entries()
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                // This is safe because we hold the registry lock
                let entry = unsafe { &*entry.0.get() };
                (entry.state == LIVE)
                    .then(|| (Handle::from_parts(idx as u32, entry.generation), entry.record))
            })
            .collect()
    }

    /// Number of live blocks
    pub fn live_count(&self) -> usize {
        let _lock = self.header().lock.lock();
        self.entries()
            .iter()
            // This is safe because we hold the registry lock
            .filter(|entry| unsafe { (*entry.0.get()).state } == LIVE)
            .count()
    }

    /// Run an operation on the entry of a live block, with the lock held
    fn with_live_entry<R>(&self, handle: Handle, op: impl FnOnce(&mut Entry) -> R) -> Result<R> {
        let idx = handle
            .slot_idx()
            .filter(|&idx| idx < self.num_entries)
            .ok_or(Error::UnknownHandle(handle))?;
        let _lock = self.header().lock.lock();
        // This is safe because we hold the registry lock
        let entry = unsafe { &mut *self.entries()[idx].0.get() };
        if entry.state != LIVE || entry.generation != handle.generation() {
            return Err(Error::UnknownHandle(handle));
        }
        Ok(op(entry))
    }

    fn header(&self) -> &Header {
        // This is safe per the contract of `Registry::new()`
        unsafe { self.header.as_ref() }
    }

    fn entries(&self) -> &[EntryCell] {
        // This is safe per the contract of `Registry::new()`
        unsafe { slice::from_raw_parts(self.entries.as_ptr(), self.num_entries) }
    }
}

// All shared state is accessed under the registry lock
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

/// Registry entry reserved for a block under construction
///
/// Dropping the guard without publishing the block frees the entry.
#[derive(Debug)]
pub struct SlotGuard<'registry> {
    registry: &'registry Registry,
    idx: usize,
    handle: Handle,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _lock = self.registry.header().lock.lock();
        // This is safe because we hold the registry lock
        let entry = unsafe { &mut *self.registry.entries()[self.idx].0.get() };
        debug_assert_eq!(entry.state, PENDING, "Rolled back an entry which wasn't claimed");
        entry.state = FREE;
    }
}
