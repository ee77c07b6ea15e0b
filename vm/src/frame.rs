use std::mem;
use std::ptr::{self, NonNull};

use object::{arr_del, arr_ref, del_value, str_ref, Value};

use crate::control::{Control, FuncDef};
use crate::data::Dataspace;
use crate::otable::OBJ_NONE;
use crate::Host;

/// Headroom kept below the stack pointer so a handful of pushes never
/// need an explicit growth check.
pub const MIN_STACK: usize = 5;
pub const EXTRA_STACK: usize = 32;

/// Local stacks of at most this many slots live inside the `funcall`
/// activation itself; larger ones go to the allocator.
pub const SOS_SLOTS: usize = 80;

/// A resource-limit scope: maximum call depth and remaining ticks, each
/// possibly unlimited, linked to the enclosing scope.
#[repr(C)]
pub struct Rlim {
    pub maxdepth: u32,
    pub ticks: i64,
    pub nodepth: bool,
    pub noticks: bool,
    pub next: *mut Rlim,
}

/// One activation record. The local value stack grows downward:
/// `stack <= sp <= fp`, pushes move `sp` toward `stack`. `argp` points at
/// the arguments, which live on the caller's stack.
pub struct Frame {
    pub prev: *mut Frame,
    pub host: *mut Host,
    pub oindex: u32,
    pub lwobj: *mut object::Arr,
    pub ctrl: *const Control,
    pub p_ctrl: *const Control,
    pub p_index: u16,
    pub foffset: u16,
    pub data: *mut Dataspace,
    pub func: *const FuncDef,
    pub external: bool,
    pub sos: bool,
    pub atomic: bool,
    pub level: u16,
    pub depth: u32,
    pub nargs: u16,
    pub stack: *mut Value,
    pub fp: *mut Value,
    pub sp: *mut Value,
    pub argp: *mut Value,
    pub rlim: *mut Rlim,
    /// Offset of the executing function's code base in the program text.
    pub prog: usize,
    /// Saved program counter, for nested interpreter entries and traces.
    pub pc: usize,
}

// ── the value-stack discipline ────────────────────────────────────────

/// The single push point: write the slot, take the handle reference, and
/// normalize destructed object references to nil on the way in.
///
/// # Safety
///
/// `f` must be a live frame with a push slot available; handles in `v`
/// must be live.
pub unsafe fn push_value(f: *mut Frame, v: &Value) {
    let host = &*(*f).host;
    (*f).sp = (*f).sp.sub(1);
    *(*f).sp = *v;
    match v {
        Value::String(s) => str_ref(*s),
        Value::Object(r) => {
            if host.otable.destructed(*r) {
                // the original slot may live in a mapping; only the
                // stacked copy is rewritten
                *(*f).sp = Value::Nil;
            }
        }
        Value::LwObject(a) => {
            if lw_destructed(host, *a) {
                *(*f).sp = Value::Nil;
            } else {
                arr_ref(*a);
            }
        }
        Value::Array(a) | Value::Mapping(a) => arr_ref(*a),
        _ => {}
    }
}

/// Pop `n` values, releasing their references.
///
/// # Safety
///
/// The top `n` slots of `f` must hold live values.
pub unsafe fn pop(f: *mut Frame, n: usize) {
    let mut v = (*f).sp;
    for _ in 0..n {
        del_value(&*v);
        v = v.add(1);
    }
    (*f).sp = v;
}

/// Bulk-copy `n` values, taking references and normalizing destructed
/// object references to nil.
///
/// # Safety
///
/// Both regions must be valid for `n` values and must not overlap.
pub unsafe fn copy(host: &Host, mut dst: *mut Value, mut src: *const Value, n: usize) {
    for _ in 0..n {
        let v = &*src;
        match v {
            Value::String(s) => {
                str_ref(*s);
                *dst = *v;
            }
            Value::Object(r) => {
                *dst = if host.otable.destructed(*r) {
                    Value::Nil
                } else {
                    *v
                };
            }
            Value::LwObject(a) => {
                if lw_destructed(host, *a) {
                    *dst = Value::Nil;
                } else {
                    arr_ref(*a);
                    *dst = *v;
                }
            }
            Value::Array(a) | Value::Mapping(a) => {
                arr_ref(*a);
                *dst = *v;
            }
            _ => *dst = *v,
        }
        src = src.add(1);
        dst = dst.add(1);
    }
}

pub(crate) unsafe fn lw_destructed(host: &Host, a: NonNull<object::Arr>) -> bool {
    match *(*a.as_ptr()).elts {
        Value::Object(r) => host.otable.destructed(r),
        _ => false,
    }
}

/// Make room for `size` more values on the local stack, replacing the
/// buffer if the headroom would be gone.
///
/// # Safety
///
/// `f` must be a live frame.
pub unsafe fn grow_stack(f: *mut Frame, size: usize) {
    if (*f).sp < (*f).stack.add(size + MIN_STACK) {
        let spsize = (*f).fp.offset_from((*f).sp) as usize;
        let newsize = (spsize + size + MIN_STACK + 7) & !7;
        let stk = heap::alloc(newsize * mem::size_of::<Value>()).as_ptr()
            as *mut Value;
        let top = stk.add(newsize);

        // move stack values
        if spsize != 0 {
            ptr::copy_nonoverlapping((*f).sp, top.sub(spsize), spsize);
        }
        (*f).sp = top.sub(spsize);

        // replace the old stack
        if (*f).sos {
            (*f).sos = false;
        } else {
            heap::free(NonNull::new_unchecked((*f).stack as *mut u8));
        }
        (*f).stack = stk;
        (*f).fp = top;
    }
}

/// Release a frame's remaining values and its stack buffer, and drop its
/// lightweight-object reference. The caller owns the top-level frame's
/// buffer, so that one stays.
///
/// # Safety
///
/// `f` must be a live frame that is being abandoned.
pub unsafe fn unwind_frame(f: *mut Frame) {
    let n = (*f).fp.offset_from((*f).sp) as usize;
    pop(f, n);
    if !(*f).lwobj.is_null() {
        arr_del(NonNull::new_unchecked((*f).lwobj));
        (*f).lwobj = ptr::null_mut();
    }
    if (*f).sos {
        // the buffer lives in the funcall activation
    } else if (*f).oindex != OBJ_NONE {
        heap::free(NonNull::new_unchecked((*f).stack as *mut u8));
    }
}

/// Rewrite every stacked reference to a destructed object as nil, walking
/// the whole frame chain. At an atomic boundary the caller's argument
/// area is swept too: those arguments come back on rollback.
///
/// # Safety
///
/// `top` must be a live frame chain.
pub unsafe fn odest(top: *mut Frame, count: u32) {
    let mut prev = top;
    loop {
        let f = prev;
        let mut v = (*f).sp;
        while v < (*f).fp {
            wipe(v, count);
            v = v.add(1);
        }

        prev = (*f).prev;
        if prev.is_null() {
            break;
        }
        if !(*f).func.is_null()
            && (*(*f).func).class.contains(bytecode::FnClass::ATOMIC)
            && !(*prev).atomic
        {
            let mut v = (*prev).sp;
            for _ in 0..(*f).nargs {
                wipe(v, count);
                v = v.add(1);
            }
            break;
        }
    }
}

unsafe fn wipe(v: *mut Value, count: u32) {
    match *v {
        Value::Object(r) => {
            if r.count == count {
                *v = Value::Nil;
            }
        }
        Value::LwObject(a) => {
            if let Value::Object(r) = *(*a.as_ptr()).elts {
                if r.count == count {
                    arr_del(a);
                    *v = Value::Nil;
                }
            }
        }
        _ => {}
    }
}

// ── resource limits ───────────────────────────────────────────────────

/// Push a new rlimits scope. Zero inherits the enclosing bound, negative
/// removes it, positive bounds it. Newly bounded ticks are taken out of
/// the parent so they are not charged twice; an inherited tick budget is
/// transferred wholesale.
///
/// # Safety
///
/// `f` must be a live frame.
pub unsafe fn new_rlimits(f: *mut Frame, depth: i64, t: i64) {
    let rlim = heap::alloc(mem::size_of::<Rlim>()).as_ptr() as *mut Rlim;
    ptr::write(
        rlim,
        Rlim {
            maxdepth: 0,
            ticks: 0,
            nodepth: false,
            noticks: false,
            next: (*f).rlim,
        },
    );

    if depth != 0 {
        if depth < 0 {
            (*rlim).nodepth = true;
        } else {
            (*rlim).maxdepth = (*f).depth + depth as u32;
        }
    } else {
        (*rlim).maxdepth = (*(*f).rlim).maxdepth;
        (*rlim).nodepth = (*(*f).rlim).nodepth;
    }
    if t != 0 {
        if t < 0 {
            (*rlim).noticks = true;
        } else {
            let t = t >> (*f).level;
            (*(*f).rlim).ticks -= t;
            (*rlim).ticks = t;
        }
    } else {
        (*rlim).ticks = (*(*f).rlim).ticks;
        (*rlim).noticks = (*(*f).rlim).noticks;
        (*(*f).rlim).ticks = 0;
    }

    (*f).rlim = rlim;
}

/// Unwind rlimits scopes down to `target`, returning each scope's
/// remaining ticks to its parent unless the scope was unbounded.
///
/// # Safety
///
/// `target` must be on `f`'s rlimits chain.
pub unsafe fn set_rlimits(f: *mut Frame, target: *mut Rlim) {
    let mut r = (*f).rlim;
    if (*r).ticks < 0 {
        (*r).ticks = 0;
    }
    while r != target {
        let next = (*r).next;
        if !(*r).noticks {
            (*next).ticks += (*r).ticks;
        }
        heap::free(NonNull::new_unchecked(r as *mut u8));
        r = next;
    }
    (*f).rlim = target;
}

/// Remaining call depth, -1 when unlimited.
///
/// # Safety
///
/// `f` must be a live frame.
pub unsafe fn get_depth(f: *const Frame) -> i64 {
    let rlim = &*(*f).rlim;
    if rlim.nodepth {
        -1
    } else {
        rlim.maxdepth as i64 - (*f).depth as i64
    }
}

/// Remaining ticks, -1 when unlimited, scaled by the atomic level.
///
/// # Safety
///
/// `f` must be a live frame.
pub unsafe fn get_ticks(f: *const Frame) -> i64 {
    let rlim = &*(*f).rlim;
    if rlim.noticks {
        -1
    } else if rlim.ticks < 0 {
        0
    } else {
        rlim.ticks << (*f).level
    }
}

/// Charge `n` ticks against the current scope.
///
/// # Safety
///
/// `f` must be a live frame.
#[inline]
pub unsafe fn add_ticks(f: *mut Frame, n: i64) {
    (*(*f).rlim).ticks -= n;
}
