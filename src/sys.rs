//! Queries about the memory configuration of the host system
//!
//! Page sizes come from `region`. Huge page configuration comes from
//! `/proc/meminfo` and `/sys/kernel/mm/hugepages`. Physical frame numbers come
//! from `/proc/self/pagemap`, which only exposes them to privileged
//! processes: everyone else reads zeroes.

use std::{
    fs::{self, File},
    io,
    os::unix::fs::FileExt,
    ptr,
};

/// Size of a `/proc/self/pagemap` entry
const PAGEMAP_ENTRY_SIZE: u64 = 8;

/// Pagemap entry bit telling that the page is resident in RAM
const PAGEMAP_PRESENT: u64 = 1 << 63;

/// Pagemap entry bits holding the page frame number
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// Default page size of the system, in bytes
pub fn page_size() -> usize {
    region::page::size()
}

/// Default huge page size of the system, in bytes, if it has huge pages
pub fn huge_page_size() -> Option<usize> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    meminfo_value(&meminfo, "Hugepagesize:").map(|size_kb| size_kb * 1024)
}

/// Number of huge pages of the default size which nobody uses yet
pub fn free_huge_pages() -> usize {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| meminfo_value(&meminfo, "HugePages_Free:"))
        .unwrap_or(0)
}

/// All huge page sizes which the kernel supports, in bytes, smallest first
pub fn huge_page_sizes() -> Vec<usize> {
    let mut sizes = fs::read_dir("/sys/kernel/mm/hugepages")
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| hugepages_dir_size(&entry.file_name().to_string_lossy()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    sizes.sort_unstable();
    sizes
}

/// Extract the numerical value of a `/proc/meminfo` line
fn meminfo_value(meminfo: &str, key: &str) -> Option<usize> {
    meminfo
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// Decode a `/sys/kernel/mm/hugepages` directory name into a page size
fn hugepages_dir_size(dir_name: &str) -> Option<usize> {
    dir_name
        .strip_prefix("hugepages-")?
        .strip_suffix("kB")?
        .parse::<usize>()
        .ok()
        .map(|size_kb| size_kb * 1024)
}

/// Decode a pagemap entry into a page frame number, if the page is resident
/// and its frame number is visible to us
fn pagemap_pfn(entry: u64) -> Option<u64> {
    if entry & PAGEMAP_PRESENT == 0 {
        return None;
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    if pfn == 0 {
        None
    } else {
        Some(pfn)
    }
}

/// Physical addresses of a run of pages of the calling process
///
/// `addr` must be aligned on `page_size`, which may be a huge page size.
/// Returns `None` if any of the pages is not resident or if the kernel hides
/// frame numbers from this process, so that either every page gets a
/// physical address or none does.
pub fn phys_addrs(addr: usize, num_pages: usize, page_size: usize) -> io::Result<Option<Vec<u64>>> {
    debug_assert_eq!(addr % page_size, 0, "Misaligned page address");
    let pagemap = File::open("/proc/self/pagemap")?;
    let base_page_size = self::page_size();
    let mut entry = [0u8; PAGEMAP_ENTRY_SIZE as usize];
    let mut result = Vec::with_capacity(num_pages);
    for page_idx in 0..num_pages {
        let vaddr = addr + page_idx * page_size;
        let offset = (vaddr / base_page_size) as u64 * PAGEMAP_ENTRY_SIZE;
        pagemap.read_exact_at(&mut entry, offset)?;
        match pagemap_pfn(u64::from_ne_bytes(entry)) {
            Some(pfn) => result.push(pfn * base_page_size as u64),
            None => return Ok(None),
        }
    }
    Ok(Some(result))
}

/// Truth that this process can see physical frame numbers
pub fn pagemap_readable() -> bool {
    // Check with a resident page of our own
    let sample = Box::new([1u8; 1]);
    let addr = sample.as_ptr() as usize;
    let base_page_size = page_size();

    // Safety: reading our own live allocation
    unsafe { ptr::read_volatile(sample.as_ptr()) };
    matches!(
        phys_addrs(addr - addr % base_page_size, 1, base_page_size),
        Ok(Some(_))
    )
}
