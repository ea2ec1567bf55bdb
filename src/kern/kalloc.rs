//! Kernel Allocator Boundary
//!
//! Handle tables and message queues obtain their storage through this
//! accounting layer. Backing memory comes from the global allocator; what is
//! tracked here is how much of the kernel's budget each subsystem holds, so
//! that exhaustion surfaces as `ENOMEM` instead of an abort.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::errno::{Errno, KResult};
use crate::loge;

// ============================================================================
// Statistics
// ============================================================================

/// Allocator statistics
#[derive(Debug, Default)]
pub struct KallocStats {
    /// Successful reservations
    pub alloc_count: AtomicU64,
    /// Releases
    pub free_count: AtomicU64,
    /// Reservations refused because of the limit
    pub failed_count: AtomicU64,
}

// ============================================================================
// Kernel Allocator
// ============================================================================

/// Byte budget shared by every subsystem of one kernel instance
#[derive(Debug)]
pub struct KernelAllocator {
    /// Hard limit (`None` = unlimited)
    limit: Option<usize>,
    /// Bytes currently reserved
    in_use: AtomicUsize,
    /// Statistics
    pub stats: KallocStats,
}

impl KernelAllocator {
    /// Allocator without a limit
    pub const fn unlimited() -> Self {
        Self {
            limit: None,
            in_use: AtomicUsize::new(0),
            stats: KallocStats {
                alloc_count: AtomicU64::new(0),
                free_count: AtomicU64::new(0),
                failed_count: AtomicU64::new(0),
            },
        }
    }

    /// Allocator refusing reservations beyond `limit` bytes
    pub const fn with_limit(limit: usize) -> Self {
        let mut alloc = Self::unlimited();
        alloc.limit = Some(limit);
        alloc
    }

    /// Reserve `bytes` of kernel memory
    pub fn reserve(&self, bytes: usize) -> KResult<()> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if self.limit.map_or(true, |limit| next <= limit) => next,
                _ => {
                    self.stats.failed_count.fetch_add(1, Ordering::Relaxed);
                    loge!("kalloc", "Out of memory reserving {} bytes ({} in use)", bytes, current);
                    return Err(Errno::NoMem);
                }
            };

            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.stats.alloc_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Give `bytes` back to the budget
    pub fn release(&self, bytes: usize) {
        let prev = self.in_use.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "kalloc release underflow");
        self.stats.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes currently reserved
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes still available (`usize::MAX` when unlimited)
    pub fn available(&self) -> usize {
        self.limit
            .map_or(usize::MAX, |limit| limit.saturating_sub(self.in_use()))
    }
}

impl Default for KernelAllocator {
    fn default() -> Self {
        Self::unlimited()
    }
}
