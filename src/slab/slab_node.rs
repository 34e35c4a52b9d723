//! Slab node implementation.
//!
//! A slab is exactly one page. The page starts with a [`SlabHeader`], followed by
//! a free-list table holding one byte per object slot, followed by the objects:
//!
//! ```text
//! +--------+-----------------+---------+----------+----------+-----+
//! | header | table[capacity] | padding | object 0 | object 1 | ... |
//! +--------+-----------------+---------+----------+----------+-----+
//! ```
//!
//! `table[i]` is the index of the free slot that follows slot `i`, so the free
//! slots form a chain starting at `head` and ending at [`TABLE_END`].

use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut};

use crate::{align_down, align_up, OBJECT_ALIGN};

/// Free-list terminator; `head == TABLE_END` means the slab is fully allocated.
pub const TABLE_END: u8 = u8::MAX;

/// Every slot index must fit in one byte next to the terminator.
pub const SLAB_MAX_OBJECTS: usize = TABLE_END as usize;

#[repr(C)]
pub(crate) struct SlabHeader {
    next: usize,
    object_size: usize,
    object_base: usize,
    head: u8,
    allocated: u8,
}

/// Bytes reserved at the start of every slab for its header.
pub const HEADER_SIZE: usize = align_up(size_of::<SlabHeader>(), OBJECT_ALIGN);

/// Offset of the first object in a slab holding `capacity` objects.
const fn objects_offset(capacity: usize) -> usize {
    align_up(HEADER_SIZE + capacity, OBJECT_ALIGN)
}

/// Number of `object_size` objects one slab of `page_size` bytes holds.
///
/// Each object costs its own size plus one table byte. The count is capped so
/// every index fits in a byte, and trimmed if aligning the object region would
/// push the last object past the end of the page.
pub const fn slab_capacity(page_size: usize, object_size: usize) -> usize {
    let mut capacity = page_size.saturating_sub(HEADER_SIZE) / (object_size + 1);
    if capacity > SLAB_MAX_OBJECTS {
        capacity = SLAB_MAX_OBJECTS;
    }
    while capacity > 0 && objects_offset(capacity) + capacity * object_size > page_size {
        capacity -= 1;
    }
    capacity
}

/// Handle to the slab living in the page at `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabNode {
    pub addr: usize, // Page base address
}

impl SlabNode {
    pub const fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// The slab an object belongs to.
    pub const fn containing(obj_addr: usize, page_size: usize) -> Self {
        Self::new(align_down(obj_addr, page_size))
    }

    // Fields are read and written one at a time; `object_size` is read without
    // the cache lock while list fields change under it.
    fn header(&self) -> *mut SlabHeader {
        self.addr as *mut SlabHeader
    }

    fn head(&self) -> u8 {
        unsafe { addr_of!((*self.header()).head).read() }
    }

    fn allocated(&self) -> u8 {
        unsafe { addr_of!((*self.header()).allocated).read() }
    }

    fn set_list_state(&mut self, head: u8, allocated: u8) {
        let header = self.header();
        unsafe {
            addr_of_mut!((*header).head).write(head);
            addr_of_mut!((*header).allocated).write(allocated);
        }
    }

    fn table(&self) -> *mut u8 {
        (self.addr + HEADER_SIZE) as *mut u8
    }

    fn table_entry(&self, index: usize) -> u8 {
        unsafe { self.table().add(index).read() }
    }

    fn set_table_entry(&mut self, index: usize, value: u8) {
        unsafe { self.table().add(index).write(value) }
    }

    /// Carve the page into `object_size` objects and chain every slot in order.
    ///
    /// Returns the number of objects, which is zero if not even one fits.
    pub fn init(&mut self, object_size: usize, page_size: usize) -> usize {
        let capacity = slab_capacity(page_size, object_size);
        if capacity == 0 {
            return 0;
        }

        let object_base = self.addr + objects_offset(capacity);
        unsafe {
            self.header().write(SlabHeader {
                next: 0,
                object_size,
                object_base,
                head: 0,
                allocated: 0,
            });
        }

        for i in 0..capacity - 1 {
            self.set_table_entry(i, (i + 1) as u8);
        }
        self.set_table_entry(capacity - 1, TABLE_END);
        capacity
    }

    pub fn object_size(&self) -> usize {
        unsafe { addr_of!((*self.header()).object_size).read() }
    }

    pub fn object_base(&self) -> usize {
        unsafe { addr_of!((*self.header()).object_base).read() }
    }

    /// Number of live objects.
    #[allow(dead_code)]
    pub fn in_use(&self) -> usize {
        self.allocated() as usize
    }

    pub fn is_full(&self) -> bool {
        self.head() == TABLE_END
    }

    pub fn is_empty(&self) -> bool {
        self.allocated() == 0
    }

    /// Index of the next slot [`alloc_object`](Self::alloc_object) hands out.
    pub fn free_head(&self) -> Option<usize> {
        match self.head() {
            TABLE_END => None,
            head => Some(head as usize),
        }
    }

    /// Pop the head of the free chain and return the object's address.
    pub fn alloc_object(&mut self) -> Option<usize> {
        let index = self.free_head()?;
        let next_free = self.table_entry(index);
        let obj_addr = self.object_addr(index);

        let allocated = self.allocated() + 1;
        self.set_list_state(next_free, allocated);
        Some(obj_addr)
    }

    /// Push slot `object_index` back as the new head of the free chain.
    pub fn dealloc_object(&mut self, object_index: usize) {
        debug_assert!(object_index < SLAB_MAX_OBJECTS);
        let old_head = self.head();
        self.set_table_entry(object_index, old_head);

        let allocated = self.allocated().wrapping_sub(1);
        self.set_list_state(object_index as u8, allocated);
    }

    pub fn object_addr(&self, object_index: usize) -> usize {
        self.object_base() + object_index * self.object_size()
    }

    pub fn object_index_from_addr(&self, obj_addr: usize) -> usize {
        let offset = obj_addr.wrapping_sub(self.object_base());
        debug_assert!(
            offset % self.object_size() == 0,
            "invalid object address {:#x}",
            obj_addr
        );
        offset / self.object_size()
    }

    pub fn next(&self) -> Option<usize> {
        let next = unsafe { addr_of!((*self.header()).next).read() };
        if next == 0 {
            None
        } else {
            Some(next)
        }
    }

    pub fn set_next(&mut self, next: Option<usize>) {
        let header = self.header();
        unsafe { addr_of_mut!((*header).next).write(next.unwrap_or(0)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_PAGE_SIZE, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE};
    use alloc::alloc::{alloc, dealloc};
    use alloc::vec::Vec;
    use core::alloc::Layout;

    const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE;

    fn page_layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn new_slab(object_size: usize) -> (SlabNode, usize) {
        let base = unsafe { alloc(page_layout()) } as usize;
        assert_ne!(base, 0);
        let mut node = SlabNode::new(base);
        let capacity = node.init(object_size, PAGE_SIZE);
        (node, capacity)
    }

    fn free_slab(node: SlabNode) {
        unsafe { dealloc(node.addr as *mut u8, page_layout()) };
    }

    #[test]
    fn test_capacity_formula() {
        assert_eq!(
            slab_capacity(PAGE_SIZE, 48),
            (PAGE_SIZE - HEADER_SIZE) / 49
        );
        assert_eq!(
            slab_capacity(PAGE_SIZE, MIN_OBJECT_SIZE),
            (PAGE_SIZE - HEADER_SIZE) / (MIN_OBJECT_SIZE + 1)
        );
        assert_eq!(slab_capacity(PAGE_SIZE, MAX_OBJECT_SIZE), 1);
        assert_eq!(slab_capacity(PAGE_SIZE, PAGE_SIZE), 0);
        assert!(slab_capacity(PAGE_SIZE, MIN_OBJECT_SIZE) <= SLAB_MAX_OBJECTS);
    }

    #[test]
    fn test_every_class_fits_in_page() {
        let mut size = MIN_OBJECT_SIZE;
        while size <= MAX_OBJECT_SIZE {
            let capacity = slab_capacity(PAGE_SIZE, size);
            assert!(capacity >= 1, "size {} has no room", size);
            assert!(objects_offset(capacity) + capacity * size <= PAGE_SIZE);
            size += OBJECT_ALIGN;
        }
    }

    #[test]
    fn test_slab_node() {
        let (mut node, capacity) = new_slab(64);
        assert_eq!(node.object_size(), 64);
        assert!(node.is_empty());
        assert!(!node.is_full());
        assert_eq!(node.in_use(), 0);
        assert_eq!(node.free_head(), Some(0));
        assert_eq!(node.object_base() % OBJECT_ALIGN, 0);
        assert!(node.object_base() >= node.addr + HEADER_SIZE + capacity);

        // Test allocation
        let obj = node.alloc_object().unwrap();
        assert_eq!(obj, node.object_base());
        assert_eq!(node.in_use(), 1);
        assert_eq!(node.free_head(), Some(1));

        // Test deallocation
        node.dealloc_object(node.object_index_from_addr(obj));
        assert!(node.is_empty());
        assert_eq!(node.free_head(), Some(0));

        free_slab(node);
    }

    #[test]
    fn test_exhaust_in_chain_order() {
        let (mut node, capacity) = new_slab(48);
        let objs: Vec<usize> = (0..capacity).map(|_| node.alloc_object().unwrap()).collect();

        for (i, obj) in objs.iter().enumerate() {
            assert_eq!(*obj, node.object_base() + i * 48);
        }
        assert!(node.is_full());
        assert_eq!(node.in_use(), capacity);
        assert_eq!(node.alloc_object(), None);
        assert!(objs[capacity - 1] + 48 <= node.addr + PAGE_SIZE);

        free_slab(node);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let (mut node, _) = new_slab(128);
        let a = node.alloc_object().unwrap();
        let b = node.alloc_object().unwrap();
        let c = node.alloc_object().unwrap();

        node.dealloc_object(node.object_index_from_addr(a));
        node.dealloc_object(node.object_index_from_addr(c));
        assert_eq!(node.in_use(), 1);

        // Most recently freed first, then the older free slot, then untouched ones
        assert_eq!(node.alloc_object(), Some(c));
        assert_eq!(node.alloc_object(), Some(a));
        assert_eq!(node.alloc_object(), Some(node.object_addr(3)));

        node.dealloc_object(node.object_index_from_addr(b));
        assert_eq!(node.in_use(), 3);

        free_slab(node);
    }

    #[test]
    fn test_full_slab_reopens_on_free() {
        let (mut node, capacity) = new_slab(MAX_OBJECT_SIZE);
        assert_eq!(capacity, 1);

        let obj = node.alloc_object().unwrap();
        assert!(node.is_full());
        assert_eq!(node.free_head(), None);

        node.dealloc_object(node.object_index_from_addr(obj));
        assert!(!node.is_full());
        assert!(node.is_empty());
        assert_eq!(node.free_head(), Some(0));

        free_slab(node);
    }

    #[test]
    fn test_list_updates_keep_layout_fields() {
        let (mut node, capacity) = new_slab(96);
        let base = node.object_base();
        node.set_next(Some(0x5000));

        let objs: Vec<usize> = (0..capacity).map(|_| node.alloc_object().unwrap()).collect();
        for obj in objs.iter().rev() {
            node.dealloc_object(node.object_index_from_addr(*obj));
        }

        assert_eq!(node.object_size(), 96);
        assert_eq!(node.object_base(), base);
        assert_eq!(node.next(), Some(0x5000));
        assert!(node.is_empty());
        assert_eq!(node.free_head(), Some(0));

        free_slab(node);
    }

    #[test]
    fn test_containing_and_links() {
        let (mut node, _) = new_slab(256);
        let obj = node.alloc_object().unwrap();
        assert_eq!(SlabNode::containing(obj, PAGE_SIZE), node);
        assert_eq!(SlabNode::containing(node.addr + PAGE_SIZE - 1, PAGE_SIZE), node);

        assert_eq!(node.next(), None);
        node.set_next(Some(0x2000));
        assert_eq!(node.next(), Some(0x2000));
        node.set_next(None);
        assert_eq!(node.next(), None);

        free_slab(node);
    }
}
