use std::cmp::Ordering;
use std::ptr::{self, NonNull};
use std::slice;

/// A shared immutable byte string. The bytes follow the header in the same
/// allocation. Fresh strings start with a zero reference count; the first
/// holder that stores the handle takes the reference.
#[repr(C)]
pub struct Str {
    pub refs: u32,
    len: u32,
    // bytes follow inline
}

impl Str {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn text(&self) -> &[u8] {
        unsafe {
            let p = (self as *const Str).add(1) as *const u8;
            slice::from_raw_parts(p, self.len as usize)
        }
    }

    #[inline]
    pub fn text_mut(&mut self) -> &mut [u8] {
        unsafe {
            let p = (self as *mut Str).add(1) as *mut u8;
            slice::from_raw_parts_mut(p, self.len as usize)
        }
    }
}

/// Allocate a string of `len` zero bytes from the current pool.
pub fn str_alloc(len: usize) -> NonNull<Str> {
    assert!(len <= u32::MAX as usize, "string too long");
    let p = heap::alloc(std::mem::size_of::<Str>() + len);
    let s = p.cast::<Str>();
    unsafe {
        ptr::write(s.as_ptr(), Str { refs: 0, len: len as u32 });
        ptr::write_bytes((s.as_ptr() as *mut u8).add(std::mem::size_of::<Str>()), 0, len);
    }
    s
}

/// Allocate a string holding a copy of `text`.
pub fn str_new(text: &[u8]) -> NonNull<Str> {
    let s = str_alloc(text.len());
    unsafe {
        let dst = (s.as_ptr() as *mut u8).add(std::mem::size_of::<Str>());
        ptr::copy_nonoverlapping(text.as_ptr(), dst, text.len());
    }
    s
}

/// Take a reference.
///
/// # Safety
///
/// `s` must be live.
#[inline]
pub unsafe fn str_ref(s: NonNull<Str>) {
    (*s.as_ptr()).refs += 1;
}

/// Release a reference; the last one frees the string.
///
/// # Safety
///
/// `s` must be live and owed a reference by the caller.
pub unsafe fn str_del(s: NonNull<Str>) {
    let p = s.as_ptr();
    (*p).refs -= 1;
    if (*p).refs == 0 {
        heap::free(s.cast());
    }
}

/// Content order.
pub fn str_cmp(a: &Str, b: &Str) -> Ordering {
    a.text().cmp(b.text())
}

/// Range-checked byte index.
pub fn str_index(s: &Str, i: i64) -> Option<usize> {
    if i < 0 || i >= s.len() as i64 {
        None
    } else {
        Some(i as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        heap::minit(16384, 32768);
    }

    #[test]
    fn new_copies_text() {
        init();
        let s = str_new(b"hello");
        unsafe {
            assert_eq!(s.as_ref().text(), b"hello");
            assert_eq!(s.as_ref().refs, 0);
            str_ref(s);
            str_del(s);
        }
    }

    #[test]
    fn refcount_frees_on_last_del() {
        init();
        let before = heap::dynamic_used();
        let s = str_new(b"counted");
        unsafe {
            str_ref(s);
            str_ref(s);
            str_del(s);
            assert_eq!(s.as_ref().refs, 1);
            str_del(s);
        }
        assert_eq!(heap::dynamic_used(), before);
    }

    #[test]
    fn ordering_and_index() {
        init();
        let a = str_new(b"abc");
        let b = str_new(b"abd");
        unsafe {
            assert_eq!(str_cmp(a.as_ref(), b.as_ref()), Ordering::Less);
            assert_eq!(str_index(a.as_ref(), 2), Some(2));
            assert_eq!(str_index(a.as_ref(), 3), None);
            assert_eq!(str_index(a.as_ref(), -1), None);
            str_ref(a);
            str_del(a);
            str_ref(b);
            str_del(b);
        }
    }
}
