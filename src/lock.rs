//! Minimal spin lock which can live in process-shared memory
//!
//! Operating system mutexes may hold process-local state, so they cannot be
//! placed in a mapping that is shared across `fork()`. This lock is a plain
//! atomic integer instead, which makes it usable from every process which
//! has the mapping. It only guards short critical sections, so spinning a
//! little and then yielding to the OS scheduler is good enough.

use std::{
    hint,
    sync::atomic::{AtomicU32, Ordering},
    thread,
};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Number of busy-wait iterations before yielding to the OS
const SPINS_BEFORE_YIELD: usize = 64;

/// Spin lock usable across threads and processes
#[derive(Debug, Default)]
#[repr(C)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    /// Create an unlocked spin lock
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire the lock, waiting for it if needed
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut spins = 0;
        while self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Wait for the lock to look free before retrying the RMW
            while self.state.load(Ordering::Relaxed) != UNLOCKED {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
        SpinGuard { lock: self }
    }

    /// Try to acquire the lock without waiting
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { lock: self })
    }
}

/// RAII proof that a `SpinLock` is held, releases it on drop
#[derive(Debug)]
pub struct SpinGuard<'lock> {
    lock: &'lock SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}
