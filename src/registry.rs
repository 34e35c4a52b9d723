//! Hash-indexed registry of slab caches.
//!
//! Each bucket heads a chain of caches whose size hashes to it. Chains only ever
//! grow at the front and are never reordered, so lookups walk them without a
//! lock; only inserting a new cache takes the registry lock.
//!
//! Storage for a new cache is itself allocated from the cache of
//! [`BOOTSTRAP_CLASS`]. That cache is embedded in the registry and enabled by
//! [`CacheRegistry::register_bootstrap`] before anything else can be created.
//! It never sits on a chain: lookups of its class resolve to the field, so the
//! buckets only ever point into slab pages and the registry may move freely.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::{debug, warn};

use crate::size_class::{SizeClass, REGISTRY_BUCKETS};
use crate::slab::slab_cache::{SlabCache, BOOTSTRAP_CLASS};
use crate::{is_aligned, AllocError, AllocResult, PageSource};

pub(crate) struct CacheRegistry {
    buckets: [AtomicPtr<SlabCache>; REGISTRY_BUCKETS],
    lock: SpinNoIrq<()>,
    bootstrap: SlabCache,
    bootstrap_ready: AtomicBool,
}

impl CacheRegistry {
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicPtr::new(ptr::null_mut()) }; REGISTRY_BUCKETS],
            lock: SpinNoIrq::new(()),
            bootstrap: SlabCache::new(BOOTSTRAP_CLASS.size()),
            bootstrap_ready: AtomicBool::new(false),
        }
    }

    /// Make the embedded bootstrap cache visible to lookups.
    pub fn register_bootstrap(&self) {
        self.bootstrap_ready.store(true, Ordering::Release);
    }

    fn scan(&self, class: SizeClass) -> Option<&SlabCache> {
        if class == BOOTSTRAP_CLASS {
            return self
                .bootstrap_ready
                .load(Ordering::Acquire)
                .then_some(&self.bootstrap);
        }

        let mut cursor = self.buckets[class.bucket()].load(Ordering::Acquire);
        while let Some(cache) = unsafe { cursor.as_ref() } {
            if cache.object_size() == class.size() {
                return Some(cache);
            }
            cursor = cache.next();
        }
        None
    }

    /// Lock-free lookup of an existing cache.
    pub fn find(&self, class: SizeClass) -> Option<&SlabCache> {
        self.scan(class)
    }

    /// Return the cache for `class`, creating and publishing it on first use.
    ///
    /// Fails only if no page is left for the new cache's storage.
    pub fn lookup_or_create(
        &self,
        class: SizeClass,
        pages: &dyn PageSource,
        page_size: usize,
    ) -> AllocResult<&SlabCache> {
        if let Some(cache) = self.scan(class) {
            return Ok(cache);
        }

        let _guard = self.lock.lock();
        // Another core may have inserted it while we waited for the lock
        if let Some(cache) = self.scan(class) {
            return Ok(cache);
        }

        // Cache storage comes from the bootstrap cache, enabled before any other
        let Some(bootstrap) = self.scan(BOOTSTRAP_CLASS) else {
            warn!("cache registry: bootstrap cache not registered");
            return Err(AllocError::InvalidParam);
        };
        let storage = bootstrap.alloc_object(pages, page_size)?;
        debug_assert!(is_aligned(storage, core::mem::align_of::<SlabCache>()));

        let cache = storage as *mut SlabCache;
        let bucket = &self.buckets[class.bucket()];
        unsafe {
            cache.write(SlabCache::new(class.size()));
            (*cache).set_next(bucket.load(Ordering::Acquire));
        }
        bucket.store(cache, Ordering::Release);
        debug!(
            "cache registry: created {}-byte cache at {:#x} in bucket {}",
            class.size(),
            storage,
            class.bucket()
        );

        Ok(unsafe { &*cache })
    }

    /// Visit every registered cache: the bootstrap cache, then bucket by bucket.
    pub fn for_each(&self, mut f: impl FnMut(&SlabCache)) {
        if let Some(bootstrap) = self.scan(BOOTSTRAP_CLASS) {
            f(bootstrap);
        }
        for bucket in self.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire);
            while let Some(cache) = unsafe { cursor.as_ref() } {
                f(cache);
                cursor = cache.next();
            }
        }
    }

    /// Unlink every cache and return the dynamically created ones to the
    /// bootstrap cache. Slabs still holding live objects are left alone.
    pub fn reset(&mut self, pages: &dyn PageSource, page_size: usize) {
        for bucket in self.buckets.iter() {
            let mut cursor = bucket.swap(ptr::null_mut(), Ordering::AcqRel);
            while let Some(cache) = NonNull::new(cursor) {
                let cache_ref = unsafe { cache.as_ref() };
                cursor = cache_ref.next();

                let stats = cache_ref.stats();
                if stats.live_objects > 0 {
                    warn!(
                        "cache registry: dropping {}-byte cache with {} live objects in {} pages",
                        stats.object_size, stats.live_objects, stats.page_count
                    );
                }

                unsafe { ptr::drop_in_place(cache.as_ptr()) };
                self.bootstrap
                    .dealloc_object(cache.as_ptr() as usize, pages, page_size);
            }
        }

        let stats = self.bootstrap.stats();
        if stats.live_objects > 0 {
            warn!(
                "cache registry: bootstrap cache keeps {} live objects in {} pages",
                stats.live_objects, stats.page_count
            );
        }
        self.bootstrap_ready.store(false, Ordering::Release);
    }
}
