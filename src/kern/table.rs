//! Handle Table - Sparse paged storage for kernel objects
//!
//! Every kernel object kind (message queues, mutexes, condition variables)
//! lives in its own table. A handle is an index into the table; 0 is never a
//! valid handle.
//!
//! ## Layout
//!
//! The table is a sorted sequence of fixed-size pages. Each page covers a
//! contiguous run of slots starting at a multiple of the per-page slot count,
//! so a handle far beyond the current range costs exactly one page. Slots
//! are logically cleared, never compacted, and pages are kept once allocated.
//!
//! Slot accounting mirrors an in-memory page: a page header (next, prev,
//! start index) followed by slots of one presence marker plus the record.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use crate::config::MIN_TABLE_PAGE_SIZE;
use crate::errno::{Errno, KResult};
use crate::kern::kalloc::KernelAllocator;

// ============================================================================
// Constants
// ============================================================================

/// Bytes taken by a page header (next, prev, first index)
pub const PAGE_HEADER_SIZE: usize = 24;

/// Bytes taken by the presence marker in front of each slot
pub const SLOT_MARKER_SIZE: usize = 8;

// ============================================================================
// Handle Counter
// ============================================================================

/// Monotonic handle source for one table
///
/// Handles are never recycled: once the counter wraps to 0 the namespace is
/// exhausted for good.
#[derive(Debug, Clone)]
pub struct HandleCounter {
    next: u64,
}

impl HandleCounter {
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Counter whose next handle is `next`
    pub const fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Take the next handle, `None` once exhausted
    pub fn allocate(&mut self) -> Option<u64> {
        if self.next == 0 {
            return None;
        }
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        Some(handle)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next == 0
    }

    /// The handle the next `allocate` would return
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for HandleCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pages
// ============================================================================

struct Page<T> {
    /// First handle stored in this page
    start: u64,
    /// Record slots; `None` is the cleared sentinel
    slots: Box<[Option<T>]>,
    /// Number of occupied slots
    live: usize,
}

impl<T> Page<T> {
    fn new(start: u64, per_page: usize) -> Self {
        let mut slots = Vec::with_capacity(per_page);
        slots.resize_with(per_page, || None);
        Self {
            start,
            slots: slots.into_boxed_slice(),
            live: 0,
        }
    }
}

// ============================================================================
// Handle Table
// ============================================================================

/// Sparse, paged table mapping handles to records of type `T`
pub struct HandleTable<T> {
    /// Bytes per page
    page_size: usize,
    /// Record slots per page
    per_page: usize,
    /// Allocated pages, sorted by `start`
    pages: Vec<Page<T>>,
    /// Where page budget comes from
    allocator: Arc<KernelAllocator>,
}

impl<T> HandleTable<T> {
    /// Create a table; the first page is allocated immediately if
    /// `initial_count > 0`.
    pub fn create(
        page_size: usize,
        initial_count: usize,
        allocator: Arc<KernelAllocator>,
    ) -> KResult<Self> {
        let page_size = page_size.max(MIN_TABLE_PAGE_SIZE);
        let per_page = Self::slots_for(page_size);

        // Header page
        allocator.reserve(page_size)?;

        let mut table = Self {
            page_size,
            per_page,
            pages: Vec::new(),
            allocator,
        };

        if initial_count > 0 {
            table.page_for_insert(0)?;
        }

        Ok(table)
    }

    fn slots_for(page_size: usize) -> usize {
        let per_page =
            (page_size.saturating_sub(PAGE_HEADER_SIZE)) / (size_of::<T>() + SLOT_MARKER_SIZE);
        per_page.max(1)
    }

    /// Record slots per page
    pub fn entries_per_page(&self) -> usize {
        self.per_page
    }

    fn page_start(&self, handle: u64) -> u64 {
        let per_page = self.per_page as u64;
        (handle / per_page) * per_page
    }

    fn find_page(&self, handle: u64) -> Option<usize> {
        self.pages
            .binary_search_by_key(&self.page_start(handle), |p| p.start)
            .ok()
    }

    fn page_for_insert(&mut self, handle: u64) -> KResult<usize> {
        let start = self.page_start(handle);
        match self.pages.binary_search_by_key(&start, |p| p.start) {
            Ok(idx) => Ok(idx),
            Err(idx) => {
                self.allocator.reserve(self.page_size)?;
                self.pages.insert(idx, Page::new(start, self.per_page));
                Ok(idx)
            }
        }
    }

    /// Look up a record
    pub fn get(&self, handle: u64) -> Option<&T> {
        if handle == 0 {
            return None;
        }
        let page = &self.pages[self.find_page(handle)?];
        page.slots[(handle - page.start) as usize].as_ref()
    }

    /// Look up a record for modification
    pub fn get_mut(&mut self, handle: u64) -> Option<&mut T> {
        if handle == 0 {
            return None;
        }
        let idx = self.find_page(handle)?;
        let page = &mut self.pages[idx];
        page.slots[(handle - page.start) as usize].as_mut()
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.get(handle).is_some()
    }

    /// Write (`Some`) or clear (`None`) the slot at `handle`, growing as
    /// needed. Returns the previous record.
    pub fn set(&mut self, handle: u64, record: Option<T>) -> KResult<Option<T>> {
        if handle == 0 {
            return Err(Errno::Inval);
        }

        match record {
            Some(record) => {
                let idx = self.page_for_insert(handle)?;
                let page = &mut self.pages[idx];
                let slot = &mut page.slots[(handle - page.start) as usize];
                let old = slot.replace(record);
                if old.is_none() {
                    page.live += 1;
                }
                Ok(old)
            }
            None => Ok(self.take(handle)),
        }
    }

    /// Clear the slot at `handle`. The page stays allocated.
    pub fn take(&mut self, handle: u64) -> Option<T> {
        if handle == 0 {
            return None;
        }
        let idx = self.find_page(handle)?;
        let page = &mut self.pages[idx];
        let old = page.slots[(handle - page.start) as usize].take();
        if old.is_some() {
            page.live -= 1;
        }
        old
    }

    /// Total bytes reserved, including the header page
    pub fn size(&self) -> usize {
        self.page_size * (1 + self.pages.len())
    }

    /// Number of occupied slots
    pub fn entry_count(&self) -> usize {
        self.pages.iter().map(|p| p.live).sum()
    }

    /// One past the highest addressable handle, `None` when no page exists.
    /// Saturates at `u64::MAX` for the page holding the last handle.
    pub fn length(&self) -> Option<u64> {
        self.pages
            .last()
            .map(|p| p.start.saturating_add(self.per_page as u64))
    }

    /// Next occupied handle after `cur`
    pub fn next(&self, cur: u64) -> Option<u64> {
        let from = cur.checked_add(1)?;
        self.iter_from(from).map(|(h, _)| h).next()
    }

    /// Occupied `(handle, record)` pairs in ascending handle order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        self.iter_from(1)
    }

    fn iter_from(&self, from: u64) -> impl Iterator<Item = (u64, &T)> + '_ {
        self.pages
            .iter()
            .filter(move |p| from < p.start || from - p.start < self.per_page as u64)
            .flat_map(|p| {
                p.slots
                    .iter()
                    .enumerate()
                    .filter_map(move |(i, s)| s.as_ref().map(|r| (p.start + i as u64, r)))
            })
            .filter(move |(h, _)| *h >= from && *h != 0)
    }

    /// Occupied handles, collected (for callers that mutate while walking)
    pub fn handles(&self) -> Vec<u64> {
        self.iter().map(|(h, _)| h).collect()
    }
}

impl<T> Drop for HandleTable<T> {
    fn drop(&mut self) {
        self.allocator.release(self.size());
    }
}

impl<T> core::fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandleTable")
            .field("page_size", &self.page_size)
            .field("per_page", &self.per_page)
            .field("pages", &self.pages.len())
            .field("entries", &self.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn table() -> HandleTable<u64> {
        HandleTable::create(PAGE, 0, Arc::new(KernelAllocator::unlimited())).unwrap()
    }

    #[test]
    fn test_empty() {
        let t = table();
        assert_eq!(t.size(), PAGE);
        assert_eq!(t.entry_count(), 0);
        assert_eq!(t.length(), None);
        assert_eq!(t.entries_per_page(), (PAGE - 24) / 16);
    }

    #[test]
    fn test_initial_page() {
        let t: HandleTable<u64> =
            HandleTable::create(PAGE, 4, Arc::new(KernelAllocator::unlimited())).unwrap();
        assert_eq!(t.size(), 2 * PAGE);
        assert_eq!(t.length(), Some(t.entries_per_page() as u64));
    }

    #[test]
    fn test_basic_data() {
        let mut t = table();
        let idx = 0x1337;
        t.set(idx, Some(23)).unwrap();

        let per_page = t.entries_per_page() as u64;
        assert_eq!(t.size(), 2 * PAGE);
        assert_eq!(t.entry_count(), 1);
        assert_eq!(t.length(), Some((idx / per_page + 1) * per_page));

        assert_eq!(t.get(idx), Some(&23));
        assert_eq!(t.get(idx + 1), None);

        assert_eq!(t.set(idx, None).unwrap(), Some(23));
        assert_eq!(t.get(idx), None);
        assert_eq!(t.entry_count(), 0);
        // Page stays allocated after the last entry is cleared
        assert_eq!(t.size(), 2 * PAGE);
    }

    #[test]
    fn test_zero_handle() {
        let mut t = table();
        assert_eq!(t.set(0, Some(1)), Err(Errno::Inval));
        assert_eq!(t.get(0), None);
        assert_eq!(t.take(0), None);
    }

    #[test]
    fn test_beyond_range() {
        let mut t = table();
        t.set(1, Some(1)).unwrap();
        assert_eq!(t.get(1_000_000), None);
        assert_eq!(t.get_mut(1_000_000), None);
    }

    #[test]
    fn test_lots_of_data() {
        let mut t = table();
        let count = 3 * t.entries_per_page() + 17;
        for i in 1..=count as u64 {
            t.set(i, Some(42)).unwrap();
        }
        let per_page = t.entries_per_page();
        let pages = (count + 1 + per_page - 1) / per_page;
        assert_eq!(t.entry_count(), count);
        assert_eq!(t.size(), PAGE * (1 + pages));
        assert_eq!(t.length(), Some((pages * per_page) as u64));
    }

    #[test]
    fn test_sparse_pages_sorted() {
        let mut t = table();
        t.set(10_000, Some(3)).unwrap();
        t.set(5, Some(1)).unwrap();
        t.set(2_000, Some(2)).unwrap();

        let handles: Vec<u64> = t.iter().map(|(h, _)| h).collect();
        assert_eq!(handles, [5, 2_000, 10_000]);
        assert_eq!(t.next(0), Some(5));
        assert_eq!(t.next(5), Some(2_000));
        assert_eq!(t.next(2_000), Some(10_000));
        assert_eq!(t.next(10_000), None);
    }

    #[test]
    fn test_get_mut() {
        let mut t = table();
        t.set(9, Some(1)).unwrap();
        *t.get_mut(9).unwrap() += 1;
        assert_eq!(t.get(9), Some(&2));
    }

    #[test]
    fn test_page_budget() {
        let alloc = Arc::new(KernelAllocator::with_limit(2 * PAGE));
        let mut t: HandleTable<u64> = HandleTable::create(PAGE, 0, Arc::clone(&alloc)).unwrap();
        t.set(1, Some(1)).unwrap();
        assert_eq!(t.set(100_000, Some(2)), Err(Errno::NoMem));
        assert_eq!(t.get(100_000), None);

        drop(t);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_last_handle() {
        let mut t = table();
        t.set(u64::MAX, Some(7)).unwrap();
        t.set(5, Some(5)).unwrap();

        assert_eq!(t.length(), Some(u64::MAX));
        assert_eq!(t.get(u64::MAX), Some(&7));
        assert_eq!(t.next(5), Some(u64::MAX));
        assert_eq!(t.next(u64::MAX), None);
        assert_eq!(t.next(u64::MAX - 1), Some(u64::MAX));
        assert_eq!(t.handles(), [5, u64::MAX]);
    }

    #[test]
    fn test_counter_exhaustion() {
        let mut c = HandleCounter::starting_at(u64::MAX);
        assert_eq!(c.allocate(), Some(u64::MAX));
        assert!(c.is_exhausted());
        assert_eq!(c.allocate(), None);

        let mut c = HandleCounter::new();
        assert_eq!(c.allocate(), Some(1));
        assert_eq!(c.peek(), 2);
    }
}
