//! Slab allocation for small kernel objects.
//!
//! - `slab_node`: layout of a single one-page slab and its free-list table
//! - `slab_cache`: all slabs of one size class behind one lock

pub mod slab_cache;
pub mod slab_node;
