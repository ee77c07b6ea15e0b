//! Two-pool memory manager.
//!
//! Every runtime allocation comes out of one of two pools: the static pool
//! holds long-lived, seldom-freed data (control blocks, string constants,
//! tables), the dynamic pool holds everything created while interpreting and
//! is wiped wholesale by [`purge`] between epochs. Which pool serves an
//! allocation is decided by the allocator's mode counter ([`mstatic`] /
//! [`mdynamic`]), never by the caller.

mod alloc;
mod system;

pub use alloc::{
    alloc, check, configured, dynamic_used, expand, free, mdynamic, mem_size,
    mem_used, minit, mstatic, purge, ALIGN, OFFSET,
};
