//! Page pool backed by plain memory regions.
//!
//! Free pages are chained through their own first word, so the pool needs no
//! storage besides the pages it manages.

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::{debug, warn};

use crate::{align_down, is_aligned, AllocError, AllocResult, PageSource};

struct PoolInner {
    free_head: Option<usize>,
    total_pages: usize,
    free_pages: usize,
}

impl PoolInner {
    fn push(&mut self, page: usize) {
        let next = self.free_head.unwrap_or(0);
        unsafe { (page as *mut usize).write(next) };
        self.free_head = Some(page);
        self.free_pages += 1;
    }

    fn pop(&mut self) -> Option<usize> {
        let page = self.free_head?;
        let next = unsafe { (page as *const usize).read() };
        self.free_head = if next == 0 { None } else { Some(next) };
        self.free_pages -= 1;
        Some(page)
    }
}

/// Thread-safe single-page allocator over caller-supplied memory.
pub struct PagePool<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    inner: SpinNoIrq<PoolInner>,
}

impl<const PAGE_SIZE: usize> PagePool<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            inner: SpinNoIrq::new(PoolInner {
                free_head: None,
                total_pages: 0,
                free_pages: 0,
            }),
        }
    }

    /// Hand the whole pages inside `[start, start + size)` to the pool.
    ///
    /// The region must be unused, writable and not overlap memory already
    /// added. Partial pages at either end are ignored.
    pub fn add_memory(&self, start: usize, size: usize) -> AllocResult {
        let end = start.checked_add(size).ok_or(AllocError::InvalidParam)?;
        let first = start
            .checked_add(PAGE_SIZE - 1)
            .ok_or(AllocError::InvalidParam)?
            & !(PAGE_SIZE - 1);
        let last = align_down(end, PAGE_SIZE);
        if start == 0 || first >= last {
            warn!(
                "page pool: region [{:#x}, {:#x}) holds no whole page",
                start, end
            );
            return Err(AllocError::InvalidParam);
        }

        let mut inner = self.inner.lock();
        // Push from the top so pages come out in ascending order
        let mut page = last;
        while page > first {
            page -= PAGE_SIZE;
            inner.push(page);
        }
        inner.total_pages += (last - first) / PAGE_SIZE;
        debug!(
            "page pool: added [{:#x}, {:#x}), {} pages",
            first,
            last,
            (last - first) / PAGE_SIZE
        );
        Ok(())
    }

    /// Return total number of pages.
    pub fn total_pages(&self) -> usize {
        self.inner.lock().total_pages
    }

    /// Return number of pages handed out.
    pub fn used_pages(&self) -> usize {
        let inner = self.inner.lock();
        inner.total_pages - inner.free_pages
    }

    /// Return number of available pages.
    pub fn available_pages(&self) -> usize {
        self.inner.lock().free_pages
    }
}

impl<const PAGE_SIZE: usize> PageSource for PagePool<PAGE_SIZE> {
    fn alloc_page(&self) -> AllocResult<usize> {
        self.inner.lock().pop().ok_or(AllocError::NoMemory)
    }

    fn dealloc_page(&self, pos: usize) {
        debug_assert!(is_aligned(pos, PAGE_SIZE), "unaligned page {:#x}", pos);
        self.inner.lock().push(pos);
    }
}

impl<const PAGE_SIZE: usize> Default for PagePool<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}
