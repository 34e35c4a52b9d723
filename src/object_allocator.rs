//! Kernel object allocator.
//!
//! [`ObjectAllocator`] is the entry point the rest of the kernel calls: it rounds
//! a request to its size class, finds (or creates) the class's slab cache in the
//! registry and lets the cache hand out an object.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "log")]
use log::{error, info, warn};

use crate::registry::CacheRegistry;
use crate::size_class::SizeClass;
use crate::slab::slab_cache::CacheStats;
#[cfg(feature = "log")]
use crate::slab::slab_cache::BOOTSTRAP_CLASS;
use crate::slab::slab_node::{slab_capacity, SlabNode};
#[cfg(feature = "log")]
use crate::slab::slab_node::HEADER_SIZE;
use crate::{AllocError, AllocResult, PageSource, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE};

/// Segregated size-class allocator for small kernel objects.
///
/// Typically placed in a `static` and initialized once the page source is up:
///
/// ```
/// use kmem_slab_allocator::{ObjectAllocator, PagePool};
///
/// static PAGES: PagePool = PagePool::new();
/// static KMEM: ObjectAllocator<&PagePool> = ObjectAllocator::new(&PAGES);
///
/// # let region = vec![0u8; 64 * 0x1000];
/// # let start = (region.as_ptr() as usize + 0xfff) & !0xfff;
/// # PAGES.add_memory(start, 32 * 0x1000).unwrap();
/// KMEM.init();
/// let obj = KMEM.alloc(100).unwrap();
/// unsafe { KMEM.dealloc(obj) };
/// ```
pub struct ObjectAllocator<P, const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    registry: CacheRegistry,
    pages: P,
    initialized: AtomicBool,
}

impl<P, const PAGE_SIZE: usize> ObjectAllocator<P, PAGE_SIZE> {
    /// The largest object must fit in one page together with the slab header.
    const PAGE_SIZE_OK: () = assert!(
        PAGE_SIZE.is_power_of_two() && slab_capacity(PAGE_SIZE, MAX_OBJECT_SIZE) >= 1,
        "page too small for MAX_OBJECT_SIZE"
    );

    pub const fn new(pages: P) -> Self {
        let () = Self::PAGE_SIZE_OK;
        Self {
            registry: CacheRegistry::new(),
            pages,
            initialized: AtomicBool::new(false),
        }
    }

    /// The page source slabs are carved from.
    pub fn page_source(&self) -> &P {
        &self.pages
    }
}

impl<P: PageSource, const PAGE_SIZE: usize> ObjectAllocator<P, PAGE_SIZE> {
    /// Register the bootstrap cache and open the allocator for use.
    ///
    /// Must run after the page source is ready and before any other call.
    pub fn init(&self) {
        if self.initialized.load(Ordering::SeqCst) {
            warn!("object allocator: already initialized");
            return;
        }

        self.registry.register_bootstrap();
        self.initialized.store(true, Ordering::SeqCst);

        info!(
            "object allocator: init, slab header {} bytes, bootstrap class {} bytes",
            HEADER_SIZE,
            BOOTSTRAP_CLASS.size()
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Allocate an object of at least `size` bytes, aligned to
    /// [`OBJECT_ALIGN`](crate::OBJECT_ALIGN).
    ///
    /// Requests below [`MIN_OBJECT_SIZE`] are served from the minimum class;
    /// requests above [`MAX_OBJECT_SIZE`] fail with [`AllocError::InvalidParam`]
    /// without touching the page source.
    pub fn alloc(&self, size: usize) -> AllocResult<NonNull<u8>> {
        if !self.is_initialized() {
            error!("object allocator: Allocator not initialized");
            return Err(AllocError::NoMemory);
        }

        if size < MIN_OBJECT_SIZE {
            warn!(
                "object allocator: size {} too small, reset to {}",
                size, MIN_OBJECT_SIZE
            );
        }
        let Some(class) = SizeClass::from_request(size) else {
            error!(
                "object allocator: size {} out of border {}",
                size, MAX_OBJECT_SIZE
            );
            return Err(AllocError::InvalidParam);
        };

        let cache = self
            .registry
            .lookup_or_create(class, &self.pages, PAGE_SIZE)
            .map_err(|e| {
                error!(
                    "object allocator: failed to get the {}-byte cache: {:?}",
                    class.size(),
                    e
                );
                e
            })?;

        let obj_addr = cache.alloc_object(&self.pages, PAGE_SIZE)?;
        Ok(unsafe { NonNull::new_unchecked(obj_addr as *mut u8) })
    }

    /// Free an object.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) on this allocator and must not
    /// have been freed since. A violation may go unnoticed, or end in a panic
    /// when the slab bookkeeping turns out inconsistent.
    pub unsafe fn dealloc(&self, ptr: NonNull<u8>) {
        if !self.is_initialized() {
            error!("object allocator: Deallocating memory before initializing");
            return;
        }

        let obj_addr = ptr.as_ptr() as usize;
        let slab = SlabNode::containing(obj_addr, PAGE_SIZE);
        let class = SizeClass::from_rounded(slab.object_size());

        match self.registry.find(class) {
            Some(cache) => cache.dealloc_object(obj_addr, &self.pages, PAGE_SIZE),
            None => {
                error!(
                    "object allocator: no {}-byte cache for object {:#x}",
                    class.size(),
                    obj_addr
                );
            }
        }
    }

    /// Accounting of the cache serving `size`, if one has been created.
    pub fn cache_stats(&self, size: usize) -> Option<CacheStats> {
        let class = SizeClass::from_request(size)?;
        self.registry.find(class).map(|cache| cache.stats())
    }

    /// Accounting of every registered cache, including the bootstrap cache.
    pub fn for_each_cache(&self, mut f: impl FnMut(CacheStats)) {
        self.registry.for_each(|cache| f(cache.stats()));
    }

    /// Drop every cache and return the allocator to its uninitialized state.
    ///
    /// Cache storage goes back to the bootstrap cache; slabs that still hold live
    /// objects are leaked. Meant for tests that reuse one allocator.
    pub fn teardown(&mut self) {
        if !self.is_initialized() {
            return;
        }
        self.registry.reset(&self.pages, PAGE_SIZE);
        self.initialized.store(false, Ordering::SeqCst);
    }
}
