use std::mem;
use std::ptr::{self, NonNull};

use object::{
    arr_del, arr_grow_insert, arr_ref, arr_remove_pair, del_value, map_search,
    map_sort, ref_value, Arr, Str, Value,
};

/// Per-object mutable state: the variables, plus the plane stack that
/// stages mutations inside atomic regions.
pub struct Dataspace {
    pub oindex: u32,
    pub variables: Vec<Value>,
    /// Current plane level; zero outside any atomic region.
    pub plane: u16,
    planes: Vec<Plane>,
    pub modified: bool,
}

struct Plane {
    level: u16,
    saved_vars: Vec<Value>,
    backups: Vec<ArrBackup>,
}

/// The pre-plane element buffer of one array, held for rollback.
struct ArrBackup {
    arr: NonNull<Arr>,
    elts: *mut Value,
    size: u32,
    sorted: bool,
    level_before: u16,
}

impl Dataspace {
    pub fn new(oindex: u32, nvariables: usize) -> Self {
        Dataspace {
            oindex,
            variables: vec![Value::Nil; nvariables],
            plane: 0,
            planes: Vec::new(),
            modified: false,
        }
    }

    #[inline]
    pub fn var(&mut self, index: usize) -> *mut Value {
        &mut self.variables[index] as *mut Value
    }
}

impl Drop for Dataspace {
    fn drop(&mut self) {
        debug_assert!(self.planes.is_empty(), "dataspace dropped mid-plane");
        for v in self.variables.drain(..) {
            unsafe { del_value(&v) };
        }
    }
}

/// Assign into a variable slot, keeping the reference counts straight.
///
/// # Safety
///
/// `var` must point into the live variable area of `data`; any handles
/// must be live.
pub unsafe fn assign_var(data: *mut Dataspace, var: *mut Value, val: &Value) {
    ref_value(val);
    del_value(&*var);
    *var = *val;
    if !data.is_null() {
        (*data).modified = true;
    }
}

/// Assign into an array element, taking a plane backup of the element
/// buffer first when the mutation happens inside an atomic region the
/// array predates.
///
/// # Safety
///
/// `arr` must be live and `index` in range; `data` may be null for
/// assignments with no owning dataspace.
pub unsafe fn assign_elt(
    data: *mut Dataspace,
    arr: NonNull<Arr>,
    index: usize,
    val: &Value,
) {
    backup_if_needed(data, arr);
    let slot = (*arr.as_ptr()).elts.add(index);
    ref_value(val);
    del_value(&*slot);
    *slot = *val;
    if !data.is_null() {
        (*data).modified = true;
    }
}

unsafe fn backup_if_needed(data: *mut Dataspace, arr: NonNull<Arr>) {
    if data.is_null() {
        return;
    }
    let data = &mut *data;
    if data.plane == 0 || (*arr.as_ptr()).level >= data.plane {
        return;
    }
    let plane = data.planes.last_mut().expect("plane level without plane");

    // move the current buffer into the backup and hand the array a
    // referenced copy to mutate
    let a = arr.as_ptr();
    let size = (*a).size as usize;
    let old = (*a).elts;
    let fresh = if size == 0 {
        ptr::null_mut()
    } else {
        let buf = heap::alloc(size * mem::size_of::<Value>()).as_ptr()
            as *mut Value;
        for i in 0..size {
            let v = *old.add(i);
            ref_value(&v);
            ptr::write(buf.add(i), v);
        }
        buf
    };
    arr_ref(arr);
    plane.backups.push(ArrBackup {
        arr,
        elts: old,
        size: size as u32,
        sorted: (*a).sorted,
        level_before: (*a).level,
    });
    (*a).elts = fresh;
    (*a).level = data.plane;
}

/// Open a staging plane at `level`.
pub unsafe fn new_plane(data: *mut Dataspace, level: u16) {
    let data = &mut *data;
    let saved: Vec<Value> = data
        .variables
        .iter()
        .map(|v| {
            ref_value(v);
            *v
        })
        .collect();
    data.planes.push(Plane { level, saved_vars: saved, backups: Vec::new() });
    data.plane = level;
}

/// Promote the staged mutations of the top plane.
pub unsafe fn commit_plane(data: *mut Dataspace) {
    let data = &mut *data;
    let plane = data.planes.pop().expect("no plane to commit");
    data.plane = data.planes.last().map_or(0, |p| p.level);

    for v in plane.saved_vars {
        del_value(&v);
    }
    for b in plane.backups {
        let a = b.arr.as_ptr();
        let keep_for_outer = match data.planes.last_mut() {
            Some(outer) if b.level_before < outer.level => {
                if outer.backups.iter().any(|ob| ob.arr == b.arr) {
                    (*a).level = outer.level;
                    None
                } else {
                    // the pre-inner buffer doubles as the pre-outer one
                    (*a).level = outer.level;
                    Some(outer)
                }
            }
            _ => {
                (*a).level = b.level_before;
                None
            }
        };
        match keep_for_outer {
            Some(outer) => outer.backups.push(b),
            None => drop_backup(b),
        }
    }
}

/// Throw the staged mutations of the top plane away.
pub unsafe fn discard_plane(data: *mut Dataspace) {
    let data = &mut *data;
    let plane = data.planes.pop().expect("no plane to discard");
    data.plane = data.planes.last().map_or(0, |p| p.level);

    for v in data.variables.iter() {
        del_value(v);
    }
    data.variables.clear();
    data.variables.extend(plane.saved_vars);

    for b in plane.backups.into_iter().rev() {
        let a = b.arr.as_ptr();
        let cur = (*a).elts;
        if !cur.is_null() {
            for i in 0..(*a).size as usize {
                del_value(&*cur.add(i));
            }
            heap::free(NonNull::new_unchecked(cur as *mut u8));
        }
        (*a).elts = b.elts;
        (*a).size = b.size;
        (*a).sorted = b.sorted;
        (*a).level = b.level_before;
        arr_del(b.arr);
    }
}

unsafe fn drop_backup(b: ArrBackup) {
    if !b.elts.is_null() {
        for i in 0..b.size as usize {
            del_value(&*b.elts.add(i));
        }
        heap::free(NonNull::new_unchecked(b.elts as *mut u8));
    }
    arr_del(b.arr);
}

// ── mapping access ────────────────────────────────────────────────────

/// Look a key up in a mapping, sorting it first if its key order was
/// never established. Returns a plain (unreferenced) copy of the value,
/// nil when absent.
///
/// # Safety
///
/// `map` and any handles must be live.
pub unsafe fn map_index_get(
    map: NonNull<Arr>,
    key: &Value,
) -> Result<Value, &'static str> {
    if !(*map.as_ptr()).sorted {
        map_sort(map)?;
    }
    match map_search(map.as_ref(), key) {
        Ok(pair) => Ok(*(*map.as_ptr()).elts.add(2 * pair + 1)),
        Err(_) => Ok(Value::Nil),
    }
}

/// Assign into a mapping entry: insert, overwrite or (on a nil value)
/// delete. With `verify` set, the store only happens while the entry
/// still holds that exact string.
///
/// # Safety
///
/// `map` and any handles must be live; `data` may be null.
pub unsafe fn map_index_set(
    data: *mut Dataspace,
    map: NonNull<Arr>,
    key: &Value,
    val: &Value,
    verify: Option<NonNull<Str>>,
    nil_deletes: impl Fn(&Value) -> bool,
) -> Result<(), &'static str> {
    if !matches!(
        key,
        Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Object(_)
            | Value::Array(_)
            | Value::Mapping(_)
            | Value::LwObject(_)
    ) {
        return Err("Invalid mapping index");
    }
    if !(*map.as_ptr()).sorted {
        map_sort(map)?;
    }
    let a = map.as_ptr();
    match map_search(map.as_ref(), key) {
        Ok(pair) => {
            if let Some(seen) = verify {
                let cur = *(*a).elts.add(2 * pair + 1);
                match cur {
                    Value::String(s) if s == seen => {}
                    _ => return Ok(()),
                }
            }
            backup_if_needed(data, map);
            if nil_deletes(val) {
                let k = *(*a).elts.add(2 * pair);
                let v = *(*a).elts.add(2 * pair + 1);
                arr_remove_pair(map, pair);
                del_value(&k);
                del_value(&v);
            } else {
                let slot = (*a).elts.add(2 * pair + 1);
                ref_value(val);
                del_value(&*slot);
                *slot = *val;
            }
            if !data.is_null() {
                (*data).modified = true;
            }
        }
        Err(ins) => {
            if nil_deletes(val) || verify.is_some() {
                return Ok(());
            }
            backup_if_needed(data, map);
            ref_value(key);
            ref_value(val);
            arr_grow_insert(map, ins, *key, *val);
            if !data.is_null() {
                (*data).modified = true;
            }
        }
    }
    Ok(())
}
