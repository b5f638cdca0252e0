//! Process-shared anonymous memory mappings
//!
//! Everything this crate hands out lives in `MAP_SHARED | MAP_ANONYMOUS`
//! mappings which are created before any `fork()`, so that they are visible
//! at the same virtual address in the creating process and all its
//! descendants.

use log::warn;

use std::{io, ptr::NonNull};

/// Kind of backing pages requested for a mapping
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backing {
    /// Normal pages, with no swap space reservation, touched lazily
    Normal,

    /// Huge pages from the kernel's hugetlb pool, reserved at mapping time
    Huge,
}

/// Owned `MAP_SHARED | MAP_ANONYMOUS` mapping, unmapped on drop
#[derive(Debug)]
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedMapping {
    /// Create a new zero-filled shared mapping whose start is a multiple of
    /// `align`
    ///
    /// `len` must be a multiple of the page size of the requested backing,
    /// and `align` a power of two which is at least that page size.
    pub fn new(len: usize, backing: Backing, align: usize) -> io::Result<Self> {
        debug_assert_ne!(len, 0, "Empty mappings are not supported");
        debug_assert!(align.is_power_of_two(), "Alignment must be a power of 2");
        let flags = libc::MAP_SHARED
            | libc::MAP_ANONYMOUS
            | match backing {
                Backing::Normal => libc::MAP_NORESERVE,
                Backing::Huge => libc::MAP_HUGETLB,
            };

        // Reserve enough address space to find an aligned start in it
        let span = len
            .checked_add(align)
            .ok_or_else(|| io::Error::other("mapping is too large"))?;
        // Safety: MAP_ANONYMOUS does not require a file descriptor, and we
        // let the kernel pick the address so no existing mapping is clobbered.
        let reservation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                span,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let reservation = reservation as usize;
        let start = (reservation + align - 1) & !(align - 1);

        // Safety: the target range lies within the reservation we just made,
        // so MAP_FIXED only replaces address space that we own
        let ptr = unsafe {
            libc::mmap(
                start as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            unmap(reservation, span);
            return Err(error);
        }

        // Give back the slack around the mapping
        unmap(reservation, start - reservation);
        unmap(start + len, reservation + span - (start + len));
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null pointer"))?;
        Ok(Self { ptr, len })
    }

    /// Start of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Give the physical pages backing a byte range back to the OS
    ///
    /// The range stays mapped and reads back as zeroes afterwards. Any data
    /// that was stored there is lost, so the caller must own the range.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        debug_assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len),
            "Discarded range is out of the mapping"
        );
        if len == 0 {
            return Ok(());
        }

        // Safety: the range is within our mapping, which stays mapped
        let res = unsafe {
            libc::madvise(
                self.ptr.as_ptr().add(offset).cast::<libc::c_void>(),
                len,
                libc::MADV_REMOVE,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Fault in the physical pages backing a byte range, for writing
    ///
    /// Pages stay populated in every process of the family, and nothing
    /// needs to be undone before they are discarded. `page_size` is the size
    /// of the mapping's pages.
    pub fn populate(&self, offset: usize, len: usize, page_size: usize) -> io::Result<()> {
        debug_assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len),
            "Populated range is out of the mapping"
        );
        if len == 0 {
            return Ok(());
        }

        // Safety: the range is within our mapping, which stays mapped
        let res = unsafe {
            libc::madvise(
                self.ptr.as_ptr().add(offset).cast::<libc::c_void>(),
                len,
                libc::MADV_POPULATE_WRITE,
            )
        };
        if res == 0 {
            return Ok(());
        }
        let error = io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::EINVAL) {
            return Err(error);
        }

        // Kernels older than 5.14 do not know MADV_POPULATE_WRITE
        for page_offset in (offset..offset + len).step_by(page_size) {
            // Safety: the page is within our mapping, and the caller owns it
            unsafe {
                let byte = self.ptr.as_ptr().add(page_offset);
                byte.write_volatile(byte.read_volatile());
            }
        }
        Ok(())
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // Nothing may refer to the mapping once the owning region is gone
        unmap(self.ptr.as_ptr() as usize, self.len);
    }
}

/// Unmap an address range which this module mapped, logging failures
fn unmap(addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    // Safety: callers only pass ranges which they mapped and nobody uses
    let res = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if res < 0 {
        warn!(
            "Failed to unmap {} bytes at {:#x}: {}",
            len,
            addr,
            io::Error::last_os_error()
        );
    }
}

// The mapping is plain memory, access synchronization is up to its users
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}
