use std::alloc::Layout;
use std::ptr::NonNull;

use crate::ALIGN;

/// Allocate a raw block from the system allocator.
///
/// Out of memory is fatal: the runtime has no way to continue without
/// backing store for the pools.
pub(crate) fn newmem(size: usize) -> NonNull<u8> {
    let layout = Layout::from_size_align(size, ALIGN).expect("bad block size");
    // SAFETY: every call site passes size > 0.
    let p = unsafe { std::alloc::alloc(layout) };
    match NonNull::new(p) {
        Some(p) => p,
        None => panic!("out of memory"),
    }
}

/// Return a block obtained from [`newmem`] to the system.
///
/// # Safety
///
/// `ptr` must come from a `newmem(size)` call with the same `size`, and must
/// not be used afterwards.
pub(crate) unsafe fn delmem(ptr: NonNull<u8>, size: usize) {
    let layout = Layout::from_size_align(size, ALIGN).expect("bad block size");
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}
