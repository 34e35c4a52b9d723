//! Size-class arithmetic.
//!
//! A request is rounded up to [`OBJECT_ALIGN`]; the rounded size names the size
//! class and doubles as the registry key. Everything here is `const` so that the
//! bootstrap class can be fixed at compile time.

use crate::slab::slab_node::slab_capacity;
use crate::{align_up, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE, OBJECT_ALIGN};

/// Number of buckets in the cache registry.
pub const REGISTRY_BUCKETS: usize = 17;

/// A rounded object size served by one slab cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(usize);

impl SizeClass {
    /// Select the size class for a requested size.
    ///
    /// Requests below [`MIN_OBJECT_SIZE`] are raised to it, requests above
    /// [`MAX_OBJECT_SIZE`] have no class.
    pub const fn from_request(size: usize) -> Option<Self> {
        if size > MAX_OBJECT_SIZE {
            return None;
        }
        let size = if size < MIN_OBJECT_SIZE {
            MIN_OBJECT_SIZE
        } else {
            size
        };
        Some(Self(align_up(size, OBJECT_ALIGN)))
    }

    /// Rebuild a class from a size recorded in a slab header.
    pub(crate) const fn from_rounded(size: usize) -> Self {
        debug_assert!(size % OBJECT_ALIGN == 0);
        Self(size)
    }

    /// Object size in bytes.
    pub const fn size(self) -> usize {
        self.0
    }

    /// Registry bucket holding the cache of this class.
    pub const fn bucket(self) -> usize {
        self.0 % REGISTRY_BUCKETS
    }

    /// Number of objects a single slab of this class holds.
    pub const fn capacity<const PAGE_SIZE: usize>(self) -> usize {
        slab_capacity(PAGE_SIZE, self.0)
    }
}
