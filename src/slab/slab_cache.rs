//! Slab cache implementation for a single size class.
//!
//! A [`SlabCache`] owns every slab of one rounded object size. Slabs with at least
//! one free slot sit on the cache's space list; a slab that fills up is detached
//! and only comes back when one of its objects is freed. A slab whose last object
//! is freed goes straight back to the page source.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::warn;

use super::slab_node::SlabNode;
use crate::size_class::SizeClass;
use crate::{AllocResult, PageSource};

/// Size class whose objects are `SlabCache`s themselves, served by the
/// bootstrap cache.
pub const BOOTSTRAP_CLASS: SizeClass = match SizeClass::from_request(size_of::<SlabCache>()) {
    Some(class) => class,
    None => panic!("SlabCache does not fit in a slab object"),
};

/// Singly linked list threaded through the slab headers.
struct SlabList {
    head: Option<usize>,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn front(&self) -> Option<SlabNode> {
        self.head.map(SlabNode::new)
    }

    fn push_front(&mut self, mut node: SlabNode) {
        node.set_next(self.head);
        self.head = Some(node.addr);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<SlabNode> {
        let mut node = self.front()?;
        self.head = node.next();
        node.set_next(None);
        self.len -= 1;
        Some(node)
    }

    /// Unlink `target`; returns false if it is not on the list.
    fn remove(&mut self, mut target: SlabNode) -> bool {
        if self.head == Some(target.addr) {
            self.pop_front();
            return true;
        }

        let mut cursor = self.front();
        while let Some(mut prev) = cursor {
            if prev.next() == Some(target.addr) {
                prev.set_next(target.next());
                target.set_next(None);
                self.len -= 1;
                return true;
            }
            cursor = prev.next().map(SlabNode::new);
        }
        false
    }
}

struct CacheInner {
    space_list: SlabList,
    page_count: usize,
    live_objects: usize,
}

/// Snapshot of one cache's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub object_size: usize,
    /// Pages currently held as slabs.
    pub page_count: usize,
    /// Objects handed out and not yet freed.
    pub live_objects: usize,
    /// Slabs on the space list, i.e. with at least one free slot.
    pub partial_slabs: usize,
    /// Page base of the slab the next allocation is served from.
    pub space_list_head: Option<usize>,
}

/// Slab cache for a specific size class
pub struct SlabCache {
    object_size: usize,
    inner: SpinNoIrq<CacheInner>,
    /// Next cache in the same registry bucket. Written once before the cache
    /// is published.
    next: AtomicPtr<SlabCache>,
}

impl SlabCache {
    pub const fn new(object_size: usize) -> Self {
        Self {
            object_size,
            inner: SpinNoIrq::new(CacheInner {
                space_list: SlabList::new(),
                page_count: 0,
                live_objects: 0,
            }),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub(crate) fn next(&self) -> *mut SlabCache {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut SlabCache) {
        self.next.store(next, Ordering::Release);
    }

    /// Allocate an object from this cache, pulling a fresh page when no slab
    /// has room.
    pub fn alloc_object(&self, pages: &dyn PageSource, page_size: usize) -> AllocResult<usize> {
        let mut inner = self.inner.lock();

        let mut slab = match inner.space_list.front() {
            Some(slab) => slab,
            None => {
                let page = pages.alloc_page().map_err(|e| {
                    warn!(
                        "slab cache: no page for a new {}-byte slab: {:?}",
                        self.object_size, e
                    );
                    e
                })?;
                let mut slab = SlabNode::new(page);
                slab.init(self.object_size, page_size);
                inner.space_list.push_front(slab);
                inner.page_count += 1;
                slab
            }
        };

        let Some(obj_addr) = slab.alloc_object() else {
            panic!(
                "slab cache: slab {:#x} on the space list has no free slot, free list corrupted",
                slab.addr
            );
        };
        inner.live_objects += 1;

        if slab.is_full() {
            inner.space_list.pop_front();
        }

        Ok(obj_addr)
    }

    /// Return an object to its slab, and the slab's page to `pages` once the
    /// slab is empty.
    ///
    /// # Panics
    ///
    /// Panics if the emptied slab is not on the space list, which means the
    /// free list was already corrupted (e.g. by a double free).
    pub fn dealloc_object(&self, obj_addr: usize, pages: &dyn PageSource, page_size: usize) {
        let mut slab = SlabNode::containing(obj_addr, page_size);
        let object_index = slab.object_index_from_addr(obj_addr);

        let mut inner = self.inner.lock();
        debug_assert!(
            inner.live_objects > 0,
            "slab cache: {}-byte cache has no live objects, free list corrupted",
            self.object_size
        );
        inner.live_objects -= 1;

        if slab.is_full() {
            inner.space_list.push_front(slab);
        }

        slab.dealloc_object(object_index);

        if slab.is_empty() {
            if !inner.space_list.remove(slab) {
                panic!(
                    "slab cache: slab {:#x} missing from the {}-byte space list, free list corrupted",
                    slab.addr, self.object_size
                );
            }
            pages.dealloc_page(slab.addr);
            inner.page_count -= 1;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            object_size: self.object_size,
            page_count: inner.page_count,
            live_objects: inner.live_objects,
            partial_slabs: inner.space_list.len,
            space_list_head: inner.space_list.head,
        }
    }
}
