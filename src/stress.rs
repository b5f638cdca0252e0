//! Randomized reserve/verify/free workload for many concurrent contexts
//!
//! Workers share a table of slots. Each slot is `FREE`, `ALLOCATED` (it
//! describes a live block) or `BUSY` (a worker is moving it between the other
//! two states). The table lock only guards state flips. Once a worker has
//! flipped a slot to `BUSY`, it owns the slot's payload and the block it
//! describes, and works on them without holding any lock. The lock-guarded
//! flip is therefore the only thing ordering one worker's accesses to a block
//! before the next worker's.
//!
//! The table is `#[repr(C)]` and contains no pointers, so it can be placed in
//! a shared block and driven by forked processes as well as by threads.

use crate::{lock::SpinLock, Error, Handle, Region, ShmFlags};

use log::warn;
use rand::RngCore;
use thiserror::Error;

use std::{cell::UnsafeCell, ptr::NonNull};

/// Distance between two pattern bytes in a block
const PATTERN_STRIDE: usize = 256;

/// State of a stress slot
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SlotState {
    /// No block, waiting to be reserved
    Free = 0,

    /// Owned by a worker which is changing its state
    Busy = 1,

    /// Describes a block which is waiting to be verified and freed
    Allocated = 2,
}

/// Block described by an `ALLOCATED` slot
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct SlotPayload {
    /// Handle of the block, invalid if the reservation was refused
    pub handle: Handle,

    /// Address of the block in the reserving context
    pub addr: usize,

    pub size: usize,
    pub align: usize,
    pub flags: ShmFlags,

    /// First value of the byte pattern written to the block
    pub seed: u8,
}

impl Default for SlotPayload {
    fn default() -> Self {
        Self {
            handle: Handle::INVALID,
            addr: 0,
            size: 0,
            align: 0,
            flags: ShmFlags::empty(),
            seed: 0,
        }
    }
}

#[repr(C)]
struct Slot {
    state: UnsafeCell<SlotState>,
    payload: UnsafeCell<SlotPayload>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: UnsafeCell::new(SlotState::Free),
            payload: UnsafeCell::new(SlotPayload::default()),
        }
    }
}

/// Table of `N` stress slots
#[repr(C)]
pub struct SlotTable<const N: usize> {
    lock: SpinLock,
    slots: [Slot; N],
}

impl<const N: usize> SlotTable<N> {
    /// Create a table of free slots
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            slots: std::array::from_fn(|_| Slot::new()),
        }
    }

    /// Create a table of free slots at a given location, typically the start
    /// of a shared block
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `size_of::<Self>()` bytes, suitably
    /// aligned, and stay valid for `'table`. Nothing else may use that memory
    /// in the meantime, except other `SlotTable` views of it obtained with
    /// `attach()`.
    pub unsafe fn init_in<'table>(ptr: NonNull<Self>) -> &'table Self {
        // Safety: per function contract
        unsafe {
            ptr.as_ptr().write(Self::new());
            &*ptr.as_ptr()
        }
    }

    /// Access a table that was previously set up with `init_in()`
    ///
    /// # Safety
    ///
    /// `ptr` must point to a table initialized by `init_in()`, which must
    /// stay valid for `'table`.
    pub unsafe fn attach<'table>(ptr: NonNull<Self>) -> &'table Self {
        // Safety: per function contract
        unsafe { &*ptr.as_ptr() }
    }

    /// Number of slots
    pub const fn len(&self) -> usize {
        N
    }

    /// Truth that the table has no slots
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Current state of a slot
    pub fn state(&self, idx: usize) -> SlotState {
        let _lock = self.lock.lock();
        // This is safe because slot states are only accessed with the lock held
        unsafe { *self.slots[idx].state.get() }
    }

    /// Try to take ownership of a slot, which must not be `BUSY`
    ///
    /// On success, the slot is `BUSY` until the returned claim is published
    /// or dropped.
    pub fn claim(&self, idx: usize) -> Option<SlotClaim<'_>> {
        let slot = &self.slots[idx];
        let _lock = self.lock.lock();
        // This is safe because slot states are only accessed with the lock held
        let state = unsafe { &mut *slot.state.get() };
        match *state {
            SlotState::Busy => None,
            previous => {
                *state = SlotState::Busy;
                Some(SlotClaim {
                    lock: &self.lock,
                    slot,
                    idx,
                    previous,
                })
            }
        }
    }
}

impl<const N: usize> Default for SlotTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

// Slot states are guarded by the lock, payloads by the BUSY state
unsafe impl<const N: usize> Send for SlotTable<N> {}
unsafe impl<const N: usize> Sync for SlotTable<N> {}

/// Exclusive ownership of a `BUSY` slot
///
/// Dropping the claim without publishing a new state puts the slot back in
/// the state it was claimed from.
pub struct SlotClaim<'table> {
    lock: &'table SpinLock,
    slot: &'table Slot,
    idx: usize,
    previous: SlotState,
}

impl SlotClaim<'_> {
    /// Index of the claimed slot
    pub fn index(&self) -> usize {
        self.idx
    }

    /// State the slot was in before being claimed
    pub fn previous(&self) -> SlotState {
        self.previous
    }

    /// Access the slot payload
    pub fn payload(&mut self) -> &mut SlotPayload {
        // This is safe because the BUSY state grants us exclusive access
        unsafe { &mut *self.slot.payload.get() }
    }

    /// Give up ownership of the slot, leaving it in a new state
    pub fn publish(self, state: SlotState) {
        debug_assert_ne!(state, SlotState::Busy, "Claims must release their slot");
        self.set_state(state);
        std::mem::forget(self);
    }

    fn set_state(&self, state: SlotState) {
        let _lock = self.lock.lock();
        // This is safe because slot states are only accessed with the lock held
        unsafe { *self.slot.state.get() = state };
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        self.set_state(self.previous);
    }
}

/// Inconsistency detected while verifying a stress block
#[derive(Debug, Error)]
pub enum StressFailure {
    /// Looking up the block's name did not return the block
    #[error("lookup of {name:?} returned {found:?} instead of {expected}")]
    LookupMismatch {
        name: String,
        expected: Handle,
        found: Option<Handle>,
    },

    /// A `SINGLE_VA` block is not where it was reserved
    #[error("block {handle} moved from {expected:#x} to {found:#x}")]
    Moved {
        handle: Handle,
        expected: usize,
        found: usize,
    },

    /// The block does not honor its requested alignment
    #[error("block at {addr:#x} is not aligned on {align} bytes")]
    Misaligned { addr: usize, align: usize },

    /// The pattern written to the block was altered
    #[error("pattern mismatch at offset {offset}: expected {expected:#x}, found {found:#x}")]
    Corrupted { offset: usize, expected: u8, found: u8 },

    /// A region operation failed
    #[error(transparent)]
    Api(#[from] Error),
}

/// What a worker did
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerReport {
    pub iterations: usize,

    /// Blocks reserved and filled with a pattern
    pub reserved: usize,

    /// Blocks verified and freed
    pub freed: usize,

    /// Iterations that found their slot owned by another worker
    pub busy: usize,

    /// Reservations refused for lack of resources
    pub exhausted: usize,

    /// Inconsistencies and unexpected errors, each of which is logged
    pub failures: usize,
}

impl WorkerReport {
    /// Accumulate another worker's report into this one
    pub fn merge(&mut self, other: &WorkerReport) {
        self.iterations += other.iterations;
        self.reserved += other.reserved;
        self.freed += other.freed;
        self.busy += other.busy;
        self.exhausted += other.exhausted;
        self.failures += other.failures;
    }
}

/// What draining a slot table did
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DrainReport {
    /// Blocks verified and freed
    pub freed: usize,

    /// Slots found `BUSY`, which means a worker did not finish its job
    pub stuck: usize,

    /// Inconsistencies and unexpected errors, each of which is logged
    pub failures: usize,
}

/// Name of the block tracked by a slot
pub fn block_name(idx: usize) -> String {
    format!("stress-{:09}", idx)
}

/// Pattern byte expected at a given offset of a stress block
fn pattern_byte(seed: u8, offset: usize) -> u8 {
    seed.wrapping_add((offset / PATTERN_STRIDE) as u8)
}

/// Write the pattern to a block, one byte per stride
fn write_pattern(region: &Region, payload: &SlotPayload) -> Result<(), StressFailure> {
    let addr = region.addr(payload.handle)?;
    for offset in (0..payload.size).step_by(PATTERN_STRIDE) {
        // This is safe because the block is live, at least `size` bytes long,
        // and owned by the caller via its slot claim
        unsafe { addr.as_ptr().add(offset).write(pattern_byte(payload.seed, offset)) };
    }
    Ok(())
}

/// Check a block's name, alignment and pattern
fn verify(region: &Region, idx: usize, payload: &SlotPayload) -> Result<(), StressFailure> {
    let name = block_name(idx);
    let found = region.lookup(&name);
    if found != Some(payload.handle) {
        return Err(StressFailure::LookupMismatch {
            name,
            expected: payload.handle,
            found,
        });
    }

    let addr = region.addr(payload.handle)?;
    if payload.flags.contains(ShmFlags::SINGLE_VA) && addr.as_ptr() as usize != payload.addr {
        return Err(StressFailure::Moved {
            handle: payload.handle,
            expected: payload.addr,
            found: addr.as_ptr() as usize,
        });
    }
    if payload.align != 0 && addr.as_ptr() as usize % payload.align != 0 {
        return Err(StressFailure::Misaligned {
            addr: addr.as_ptr() as usize,
            align: payload.align,
        });
    }

    for offset in (0..payload.size).step_by(PATTERN_STRIDE) {
        let expected = pattern_byte(payload.seed, offset);
        // This is safe for the same reason as in write_pattern()
        let found = unsafe { addr.as_ptr().add(offset).read() };
        if found != expected {
            return Err(StressFailure::Corrupted {
                offset,
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// Verify and free the block of an `ALLOCATED` slot
///
/// Returns whether the block was freed, and the number of failures.
fn retire(region: &Region, idx: usize, payload: &SlotPayload) -> (bool, usize) {
    if !payload.handle.is_valid() {
        return (false, 0);
    }
    let mut failures = 0;
    if let Err(e) = verify(region, idx, payload) {
        warn!("Stress slot {}: {}", idx, e);
        failures += 1;
    }
    match region.free(payload.handle) {
        Ok(()) => (true, failures),
        Err(e) => {
            warn!("Stress slot {}: failed to free {}: {}", idx, payload.handle, e);
            (false, failures + 1)
        }
    }
}

/// Run the randomized workload on a slot table
///
/// Each iteration draws a random slot. A `FREE` slot gets a new block of
/// random size, alignment and flags, filled with a pattern. An `ALLOCATED`
/// slot gets its block verified and freed. A `BUSY` slot is skipped.
pub fn run_worker<const N: usize>(
    region: &Region,
    table: &SlotTable<N>,
    iterations: usize,
    rng: &mut impl RngCore,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    if N == 0 {
        return report;
    }
    let capability = region.capability();
    for _ in 0..iterations {
        report.iterations += 1;
        let mut bytes = [0u8; 5];
        rng.fill_bytes(&mut bytes);
        let idx = usize::from(bytes[0]) % N;
        let mut claim = match table.claim(idx) {
            Some(claim) => claim,
            None => {
                report.busy += 1;
                continue;
            }
        };

        match claim.previous() {
            SlotState::Free => {
                let flags = if bytes[2] & 1 != 0 && capability.flags.contains(ShmFlags::SINGLE_VA) {
                    ShmFlags::SINGLE_VA
                } else {
                    ShmFlags::empty()
                };
                let mut payload = SlotPayload {
                    handle: Handle::INVALID,
                    addr: 0,
                    size: (usize::from(bytes[1]) + 1) << 6,
                    align: 64 << (bytes[3] % 9),
                    flags,
                    seed: bytes[4],
                };
                match region.reserve(Some(&block_name(idx)), payload.size, payload.align, flags) {
                    Ok(handle) => {
                        payload.handle = handle;
                        if let Ok(addr) = region.addr(handle) {
                            payload.addr = addr.as_ptr() as usize;
                        }
                        if let Err(e) = write_pattern(region, &payload) {
                            warn!("Stress slot {}: {}", idx, e);
                            report.failures += 1;
                        }
                        report.reserved += 1;
                    }
                    // The slot still goes to ALLOCATED, with no block in it
                    Err(Error::ResourceExhausted(_)) => report.exhausted += 1,
                    Err(e) => {
                        warn!("Stress slot {}: reservation failed: {}", idx, e);
                        report.failures += 1;
                    }
                }
                *claim.payload() = payload;
                claim.publish(SlotState::Allocated);
            }
            SlotState::Allocated => {
                let payload = *claim.payload();
                let (freed, failures) = retire(region, idx, &payload);
                report.freed += usize::from(freed);
                report.failures += failures;
                *claim.payload() = SlotPayload::default();
                claim.publish(SlotState::Free);
            }
            SlotState::Busy => unreachable!("Busy slots cannot be claimed"),
        }
    }
    report
}

/// Free every block left in a slot table once all workers are done
pub fn drain<const N: usize>(region: &Region, table: &SlotTable<N>) -> DrainReport {
    let mut report = DrainReport::default();
    for idx in 0..N {
        let mut claim = match table.claim(idx) {
            Some(claim) => claim,
            None => {
                warn!("Stress slot {} is stuck in the BUSY state", idx);
                report.stuck += 1;
                continue;
            }
        };
        if claim.previous() == SlotState::Allocated {
            let payload = *claim.payload();
            let (freed, failures) = retire(region, idx, &payload);
            report.freed += usize::from(freed);
            report.failures += failures;
            *claim.payload() = SlotPayload::default();
        }
        claim.publish(SlotState::Free);
    }
    report
}
