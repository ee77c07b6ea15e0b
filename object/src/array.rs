use std::cmp::Ordering;
use std::mem;
use std::ptr::{self, NonNull};

use crate::{del_value, str_cmp, Value};

/// A shared value sequence. Arrays, mappings and lightweight objects all
/// use this representation: a mapping is an `Arr` of interleaved key/value
/// pairs, an lwobject is an `Arr` whose element 0 names the master object
/// and whose element 1 is the version float.
///
/// `odcount` is the object-destruct epoch at the last normalization scan;
/// `level` is the atomic plane that last took a copy-on-write backup of the
/// element buffer. Both are maintained by the runtime that owns the object
/// table and the planes.
#[repr(C)]
pub struct Arr {
    pub refs: u32,
    pub size: u32,
    pub odcount: u32,
    pub level: u16,
    pub sorted: bool,
    pub elts: *mut Value,
}

/// Allocate an element buffer of `size` nil slots from the current pool.
pub(crate) fn alloc_elts(size: usize) -> *mut Value {
    if size == 0 {
        return ptr::null_mut();
    }
    let buf = heap::alloc(size * mem::size_of::<Value>()).as_ptr()
        as *mut Value;
    for i in 0..size {
        unsafe { ptr::write(buf.add(i), Value::Nil) };
    }
    buf
}

/// Allocate an array of `size` nil elements. Fresh arrays start with a zero
/// reference count.
pub fn arr_new(size: usize) -> NonNull<Arr> {
    assert!(size <= u32::MAX as usize, "array too large");
    let a = heap::alloc(mem::size_of::<Arr>()).cast::<Arr>();
    unsafe {
        ptr::write(
            a.as_ptr(),
            Arr {
                refs: 0,
                size: size as u32,
                odcount: 0,
                level: 0,
                sorted: false,
                elts: alloc_elts(size),
            },
        );
    }
    a
}

/// Take a reference.
///
/// # Safety
///
/// `a` must be live.
#[inline]
pub unsafe fn arr_ref(a: NonNull<Arr>) {
    (*a.as_ptr()).refs += 1;
}

/// Release a reference; the last one releases the contents recursively and
/// frees the array.
///
/// # Safety
///
/// `a` must be live and owed a reference by the caller.
pub unsafe fn arr_del(a: NonNull<Arr>) {
    let p = a.as_ptr();
    (*p).refs -= 1;
    if (*p).refs == 0 {
        let elts = (*p).elts;
        if !elts.is_null() {
            for i in 0..(*p).size as usize {
                del_value(&*elts.add(i));
            }
            heap::free(NonNull::new_unchecked(elts as *mut u8));
        }
        heap::free(a.cast());
    }
}

/// The canonical mapping key order: type code first, then value. Strings
/// order by content, handles by address, object references by table index.
pub fn map_cmp(a: &Value, b: &Value) -> Ordering {
    let ta = a.tag();
    let tb = b.tag();
    if ta != tb {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => {
            x.high.cmp(&y.high).then(x.low.cmp(&y.low))
        }
        (Value::String(x), Value::String(y)) => unsafe {
            str_cmp(x.as_ref(), y.as_ref())
        },
        (Value::Object(x), Value::Object(y)) => x.index.cmp(&y.index),
        (Value::Array(x), Value::Array(y))
        | (Value::Mapping(x), Value::Mapping(y))
        | (Value::LwObject(x), Value::LwObject(y)) => {
            (x.as_ptr() as usize).cmp(&(y.as_ptr() as usize))
        }
        _ => Ordering::Equal,
    }
}

fn valid_key(v: &Value) -> bool {
    !matches!(v, Value::Nil | Value::Lvalue(_))
}

/// Establish the key order of a freshly aggregated mapping.
///
/// # Safety
///
/// `a` must be live with an even element count.
pub unsafe fn map_sort(a: NonNull<Arr>) -> Result<(), &'static str> {
    let p = a.as_ptr();
    let n = (*p).size as usize / 2;
    if n != 0 {
        let elts = (*p).elts;
        let mut pairs: Vec<(Value, Value)> = (0..n)
            .map(|i| (*elts.add(2 * i), *elts.add(2 * i + 1)))
            .collect();
        for (k, _) in &pairs {
            if !valid_key(k) {
                return Err("Invalid mapping index");
            }
        }
        pairs.sort_by(|x, y| map_cmp(&x.0, &y.0));
        for w in pairs.windows(2) {
            if map_cmp(&w[0].0, &w[1].0) == Ordering::Equal {
                return Err("Identical indices in mapping");
            }
        }
        for (i, (k, v)) in pairs.into_iter().enumerate() {
            *elts.add(2 * i) = k;
            *elts.add(2 * i + 1) = v;
        }
    }
    (*p).sorted = true;
    Ok(())
}

/// Binary-search a sorted mapping for `key`. `Ok` holds the matching pair
/// index, `Err` the pair index where the key would be inserted.
///
/// # Safety
///
/// `a` must be live and sorted.
pub unsafe fn map_search(a: &Arr, key: &Value) -> Result<usize, usize> {
    debug_assert!(a.sorted);
    let mut l = 0usize;
    let mut h = a.size as usize / 2;
    while l < h {
        let m = (l + h) >> 1;
        match map_cmp(&*a.elts.add(2 * m), key) {
            Ordering::Equal => return Ok(m),
            Ordering::Greater => h = m,
            Ordering::Less => l = m + 1,
        }
    }
    Err(l)
}

/// Insert a key/value pair at pair position `at`, growing the element
/// buffer. Reference counts are the caller's business.
///
/// # Safety
///
/// `a` must be live, `at` at most the pair count.
pub unsafe fn arr_grow_insert(
    a: NonNull<Arr>,
    at: usize,
    key: Value,
    val: Value,
) {
    let p = a.as_ptr();
    let old = (*p).elts;
    let size = (*p).size as usize;
    let buf = heap::alloc((size + 2) * mem::size_of::<Value>()).as_ptr()
        as *mut Value;
    ptr::copy_nonoverlapping(old, buf, 2 * at);
    ptr::write(buf.add(2 * at), key);
    ptr::write(buf.add(2 * at + 1), val);
    ptr::copy_nonoverlapping(old.add(2 * at), buf.add(2 * at + 2), size - 2 * at);
    if !old.is_null() {
        heap::free(NonNull::new_unchecked(old as *mut u8));
    }
    (*p).elts = buf;
    (*p).size += 2;
}

/// Remove the pair at pair position `at`, compacting in place.
///
/// # Safety
///
/// `a` must be live, `at` below the pair count.
pub unsafe fn arr_remove_pair(a: NonNull<Arr>, at: usize) {
    let p = a.as_ptr();
    let size = (*p).size as usize;
    let elts = (*p).elts;
    ptr::copy(elts.add(2 * at + 2), elts.add(2 * at), size - 2 * at - 2);
    (*p).size -= 2;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ref_value, str_new, Value};

    fn init() {
        heap::minit(16384, 32768);
    }

    #[test]
    fn array_releases_contents() {
        init();
        let before = heap::dynamic_used();
        let a = arr_new(2);
        unsafe {
            let s = str_new(b"inner");
            let v = Value::String(s);
            ref_value(&v);
            *(*a.as_ptr()).elts = v;
            arr_ref(a);
            arr_del(a);
        }
        assert_eq!(heap::dynamic_used(), before);
    }

    #[test]
    fn mapping_sorts_and_finds() {
        init();
        let m = arr_new(6);
        unsafe {
            let elts = m.as_ref().elts;
            *elts.add(0) = Value::Int(30);
            *elts.add(1) = Value::Int(300);
            *elts.add(2) = Value::Int(10);
            *elts.add(3) = Value::Int(100);
            *elts.add(4) = Value::Int(20);
            *elts.add(5) = Value::Int(200);
            map_sort(m).unwrap();
            for (i, k) in [10, 20, 30].into_iter().enumerate() {
                let at = map_search(m.as_ref(), &Value::Int(k)).unwrap();
                assert_eq!(at, i);
            }
            assert_eq!(map_search(m.as_ref(), &Value::Int(15)), Err(1));
            arr_ref(m);
            arr_del(m);
        }
    }

    #[test]
    fn mapping_rejects_duplicate_keys() {
        init();
        let m = arr_new(4);
        unsafe {
            let elts = m.as_ref().elts;
            *elts.add(0) = Value::Int(1);
            *elts.add(1) = Value::Int(100);
            *elts.add(2) = Value::Int(1);
            *elts.add(3) = Value::Int(200);
            assert!(map_sort(m).is_err());
            arr_ref(m);
            arr_del(m);
        }
    }

    #[test]
    fn mapping_insert_and_remove() {
        init();
        let m = arr_new(0);
        unsafe {
            (*m.as_ptr()).sorted = true;
            arr_grow_insert(m, 0, Value::Int(2), Value::Int(20));
            arr_grow_insert(m, 0, Value::Int(1), Value::Int(10));
            arr_grow_insert(m, 2, Value::Int(3), Value::Int(30));
            assert_eq!(m.as_ref().size, 6);
            assert_eq!(map_search(m.as_ref(), &Value::Int(3)), Ok(2));
            arr_remove_pair(m, 1);
            assert_eq!(m.as_ref().size, 4);
            assert_eq!(map_search(m.as_ref(), &Value::Int(2)), Err(1));
            arr_ref(m);
            arr_del(m);
        }
    }

    #[test]
    fn key_order_is_type_then_value() {
        init();
        let s = str_new(b"x");
        unsafe {
            assert_eq!(
                map_cmp(&Value::Int(999), &Value::String(s)),
                Ordering::Less
            );
            assert_eq!(
                map_cmp(&Value::Int(-5), &Value::Int(7)),
                Ordering::Less
            );
            let v = Value::String(s);
            ref_value(&v);
            del_value(&v);
        }
    }
}
