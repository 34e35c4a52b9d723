//! Kernel object allocator
//!
//! This crate implements the dynamic memory allocator used for small kernel objects
//! (process control blocks, file-descriptor tables, ...), featuring:
//! - One-page slabs with an embedded byte-indexed free list
//! - Per-size-class slab caches, each guarded by its own lock
//! - A hash-indexed cache registry with lock-free lookups
//! - A pre-registered bootstrap cache that hosts the caches' own metadata
//!
//! Pages come from an external [`PageSource`]; [`PagePool`] is a ready-made one
//! that carves pages out of a plain memory region.

#![no_std]

extern crate alloc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size for backward compatibility
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Smallest object handed out; smaller requests are raised to this size.
pub const MIN_OBJECT_SIZE: usize = 32;

/// Largest object served from a slab. Larger requests are rejected.
pub const MAX_OBJECT_SIZE: usize = 4048;

/// Granularity of size classes, and the alignment of every returned object.
pub const OBJECT_ALIGN: usize = 16;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` or memory region (e.g. larger than a slab object).
    InvalidParam,
    /// No enough memory to allocate.
    NoMemory,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Page-granularity memory provider backing the slabs.
///
/// Every slab occupies exactly one page, so the object allocator only ever asks
/// for single pages. Implementations are called from several cores at once and
/// must do their own locking.
pub trait PageSource {
    /// Allocate one page, aligned to the page size.
    fn alloc_page(&self) -> AllocResult<usize>;

    /// Return a page previously handed out by [`alloc_page`](Self::alloc_page).
    fn dealloc_page(&self, pos: usize);
}

impl<T: PageSource + ?Sized> PageSource for &T {
    fn alloc_page(&self) -> AllocResult<usize> {
        (**self).alloc_page()
    }

    fn dealloc_page(&self, pos: usize) {
        (**self).dealloc_page(pos)
    }
}

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod size_class;
pub use size_class::{SizeClass, REGISTRY_BUCKETS};

mod slab;
pub use slab::slab_cache::{CacheStats, BOOTSTRAP_CLASS};
pub use slab::slab_node::{slab_capacity, HEADER_SIZE, TABLE_END};

mod registry;

pub mod page_pool;
pub use page_pool::PagePool;

pub mod object_allocator;
pub use object_allocator::ObjectAllocator;
