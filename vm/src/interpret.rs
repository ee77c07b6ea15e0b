//! The bytecode dispatcher and the calling convention built around it.
//!
//! One `interpret` activation runs one function body; `CATCH` and
//! `RLIMITS` re-enter it recursively for their guarded regions, and
//! `funcall` re-enters it for every call. Raised errors travel outward as
//! `Err`, with every activation on the way releasing its frame the way
//! the stack-pointer unwind would.

use std::ptr::{self, NonNull};

use bytecode::{
    fetch1s, fetch1u, fetch2s, fetch2u, fetch3s, fetch3u, fetch4s, fetch4u,
    proto_args, proto_class, proto_nargs, proto_size, proto_vargs, FnClass,
    Op, POP_BIT, SWITCH_INT, SWITCH_RANGE, SWITCH_STRING,
};
use object::{
    arr_del, arr_ref, del_value, hashstr, str_cmp, str_del, str_index,
    str_new, str_ref, type_name, Arr, Flt, Lvalue, Oref, Str, Value,
    REF_MASK, TYPE_MASK, T_ARRAY, T_CLASS, T_FLOAT, T_INT, T_LVALUE,
    T_LWOBJECT, T_MIXED, T_OBJECT, T_STRING,
};

use crate::control::Control;
use crate::data::{
    assign_elt, assign_var, map_index_get, map_index_set, new_plane,
};
use crate::error::Error;
use crate::frame::{
    add_ticks, copy, get_ticks, grow_stack, lw_destructed, new_rlimits, pop,
    push_value, set_rlimits, unwind_frame, Frame, EXTRA_STACK, MIN_STACK,
    SOS_SLOTS,
};
use crate::kfun::KfunError;
use crate::otable::{ObjFlags, OBJ_NONE};
use crate::Host;

/// Size of the instanceof cache.
pub(crate) const INHASHSZ: usize = 1024;

/// Significant characters when hashing a program name.
const OBJHASHSZ: usize = 100;

pub(crate) unsafe fn rt_err(
    f: *const Frame,
    msg: impl Into<String>,
) -> Error {
    Error::new(msg, (*f).depth, get_ticks(f))
}

fn val_nil(strict: bool, v: &Value) -> bool {
    match v {
        Value::Nil => true,
        Value::Int(0) => !strict,
        _ => false,
    }
}

fn t_pointer(tp: u8) -> bool {
    tp & TYPE_MASK >= T_STRING
}

/// Take the result reference the way the push point does: handles get a
/// reference, stale object references become nil.
unsafe fn ref_normalized(host: &Host, val: *mut Value) {
    match *val {
        Value::String(s) => str_ref(s),
        Value::Object(r) => {
            if host.otable.destructed(r) {
                *val = Value::Nil;
            }
        }
        Value::LwObject(a) => {
            if lw_destructed(host, a) {
                *val = Value::Nil;
            } else {
                arr_ref(a);
            }
        }
        Value::Array(a) | Value::Mapping(a) => arr_ref(a),
        _ => {}
    }
}

/// Resolve a string constant through the inherit table.
pub(crate) unsafe fn strconst(
    host: &Host,
    ctrl: *const Control,
    inherit: usize,
    index: usize,
) -> NonNull<Str> {
    let c = &*ctrl;
    if inherit == c.self_index() {
        c.strings[index]
    } else {
        let oi = c.inherits[inherit].oindex;
        host.otable.obj(oi).control.strings[index]
    }
}

unsafe fn func_name(host: &Host, f: &Frame) -> String {
    let fd = &*f.func;
    let s = strconst(host, f.p_ctrl, fd.inherit as usize, fd.index as usize);
    String::from_utf8_lossy(s.as_ref().text()).into_owned()
}

// ── globals ───────────────────────────────────────────────────────────

unsafe fn i_global(f: *mut Frame, inherit: usize, index: usize) {
    add_ticks(f, 4);
    let ctrl = &*(*f).ctrl;
    let ih = ctrl.imap[(*f).p_index as usize + inherit] as usize;
    let offset = ctrl.inherits[ih].varoffset as usize + index;
    if (*f).lwobj.is_null() {
        let var = (*(*f).data).var(offset);
        push_value(f, &*var);
    } else {
        let elts = (*(*f).lwobj).elts;
        push_value(f, &*elts.add(2 + offset));
    }
}

unsafe fn store_local(
    f: *mut Frame,
    local: i32,
    val: &Value,
    verify: Option<NonNull<Str>>,
) {
    add_ticks(f, 1);
    let var = if local < 0 {
        (*f).fp.offset(local as isize)
    } else {
        (*f).argp.add(local as usize)
    };
    let ok = match verify {
        None => true,
        Some(seen) => matches!(*var, Value::String(s) if s == seen),
    };
    if ok {
        assign_var((*f).data, var, val);
    }
}

unsafe fn store_global(
    f: *mut Frame,
    inherit: usize,
    index: usize,
    val: &Value,
    verify: Option<NonNull<Str>>,
) {
    add_ticks(f, 5);
    let ctrl = &*(*f).ctrl;
    let ih = ctrl.imap[(*f).p_index as usize + inherit] as usize;
    let offset = ctrl.inherits[ih].varoffset as usize + index;
    if (*f).lwobj.is_null() {
        let var = (*(*f).data).var(offset);
        let ok = match verify {
            None => true,
            Some(seen) => matches!(*var, Value::String(s) if s == seen),
        };
        if ok {
            assign_var((*f).data, var, val);
        }
    } else {
        let lw = NonNull::new_unchecked((*f).lwobj);
        let slot = (*lw.as_ptr()).elts.add(2 + offset);
        let ok = match verify {
            None => true,
            Some(seen) => matches!(*slot, Value::String(s) if s == seen),
        };
        if ok {
            assign_elt((*f).data, lw, 2 + offset, val);
        }
    }
}

/// Store through a stacked lvalue descriptor.
pub(crate) unsafe fn store_lvalue(f: *mut Frame, lv: Lvalue, val: &Value) {
    match lv {
        Lvalue::Local(n) => store_local(f, n as i32, val, None),
        Lvalue::Global { inherit, index } => {
            store_global(f, inherit as usize, index as usize, val, None)
        }
    }
}

// ── indexing ──────────────────────────────────────────────────────────

/// Dispatch an index or indexed assignment to a lightweight object's
/// operator function.
unsafe fn i_operator(
    f: *mut Frame,
    lwobj: NonNull<Arr>,
    op: &[u8],
    nargs: usize,
    var: *mut Value,
    idx: &Value,
    val: Option<&Value>,
) -> Result<(), Error> {
    push_value(f, idx);
    if let Some(v) = val {
        push_value(f, v);
    }
    if !i_call(f, None, lwobj.as_ptr(), op, true, nargs)? {
        return Err(rt_err(f, "Index on bad type"));
    }
    *var = *(*f).sp;
    (*f).sp = (*f).sp.add(1);
    Ok(())
}

/// Index a value. With `keep` set, the operands stay referenced for a
/// later store.
unsafe fn index2(
    f: *mut Frame,
    aval: *mut Value,
    ival: *mut Value,
    val: *mut Value,
    keep: bool,
) -> Result<(), Error> {
    add_ticks(f, 2);
    let host = &mut *(*f).host;
    match *aval {
        Value::String(s) => {
            let n = match *ival {
                Value::Int(n) => n as i64,
                _ => return Err(rt_err(f, "Non-numeric string index")),
            };
            let i = str_index(s.as_ref(), n)
                .ok_or_else(|| rt_err(f, "String index out of range"))?;
            let b = s.as_ref().text()[i];
            if !keep {
                str_del(s);
            }
            *val = Value::Int(b as i32);
            return Ok(());
        }
        Value::Array(a) => {
            let n = match *ival {
                Value::Int(n) => n as i64,
                _ => return Err(rt_err(f, "Non-numeric array index")),
            };
            let size = (*a.as_ptr()).size as i64;
            if n < 0 || n >= size {
                return Err(rt_err(f, "Array index out of range"));
            }
            *val = *host.elts(a).add(n as usize);
        }
        Value::Mapping(m) => {
            *val = map_index_get(m, &*ival).map_err(|e| rt_err(f, e))?;
            if !keep {
                del_value(&*ival);
            }
        }
        Value::LwObject(a) => {
            i_operator(f, a, b"[]", 1, val, &*ival, None)?;
            if !keep {
                del_value(&*ival);
                arr_del(a);
            }
            return Ok(());
        }
        _ => return Err(rt_err(f, "Index on bad type")),
    }

    ref_normalized(host, val);
    if !keep {
        if let Value::Array(a) | Value::Mapping(a) = *aval {
            arr_del(a);
        }
    }
    Ok(())
}

/// Indexed assignment. Returns true when the target was a string: the
/// write produced a new string in `var` that the caller rebinds under
/// the verify rule.
unsafe fn store_index(
    f: *mut Frame,
    var: *mut Value,
    aval: *mut Value,
    ival: *mut Value,
    val: *mut Value,
) -> Result<bool, Error> {
    add_ticks(f, 3);
    let host = &mut *(*f).host;
    let strict = host.strict;
    match *aval {
        Value::String(s) => {
            let n = match *ival {
                Value::Int(n) => n as i64,
                _ => return Err(rt_err(f, "Non-numeric string index")),
            };
            let b = match *val {
                Value::Int(b) => b as u8,
                _ => {
                    return Err(rt_err(
                        f,
                        "Non-numeric value in indexed string assignment",
                    ))
                }
            };
            let i = str_index(s.as_ref(), n)
                .ok_or_else(|| rt_err(f, "String index out of range"))?;
            let ns = str_new(s.as_ref().text());
            (*ns.as_ptr()).text_mut()[i] = b;
            str_ref(ns);
            *var = Value::String(ns);
            Ok(true)
        }
        Value::Array(a) => {
            let n = match *ival {
                Value::Int(n) => n as i64,
                _ => return Err(rt_err(f, "Non-numeric array index")),
            };
            let size = (*a.as_ptr()).size as i64;
            if n < 0 || n >= size {
                return Err(rt_err(f, "Array index out of range"));
            }
            let elts = host.elts(a);
            let cur = elts.add(n as usize);
            let ok = match *var {
                Value::String(vs) => {
                    matches!(*cur, Value::String(cs) if cs == vs)
                }
                _ => true,
            };
            if ok {
                assign_elt((*f).data, a, n as usize, &*val);
            }
            arr_del(a);
            Ok(false)
        }
        Value::Mapping(m) => {
            let verify = match *var {
                Value::String(vs) => Some(vs),
                _ => None,
            };
            map_index_set((*f).data, m, &*ival, &*val, verify, |v| {
                val_nil(strict, v)
            })
            .map_err(|e| rt_err(f, e))?;
            del_value(&*ival);
            arr_del(m);
            Ok(false)
        }
        Value::LwObject(a) => {
            i_operator(f, a, b"[]=", 2, var, &*ival, Some(&*val))?;
            del_value(&*var);
            del_value(&*ival);
            arr_del(a);
            Ok(false)
        }
        _ => Err(rt_err(f, "Index on bad type")),
    }
}

// ── aggregates and spread ─────────────────────────────────────────────

unsafe fn aggregate(f: *mut Frame, size: usize) {
    let host = &mut *(*f).host;
    let a = host.new_array(size, (*f).data);
    if size != 0 {
        add_ticks(f, size as i64);
        let mut elts = (*a.as_ptr()).elts.add(size);
        let mut v = (*f).sp;
        for _ in 0..size {
            elts = elts.sub(1);
            *elts = *v;
            v = v.add(1);
        }
        (*f).sp = v;
    }
    push_value(f, &Value::Array(a));
}

unsafe fn map_aggregate(f: *mut Frame, size: usize) -> Result<(), Error> {
    let host = &mut *(*f).host;
    let a = host.new_array(size, (*f).data);
    if size != 0 {
        add_ticks(f, size as i64);
        let mut elts = (*a.as_ptr()).elts.add(size);
        let mut v = (*f).sp;
        for _ in 0..size {
            elts = elts.sub(1);
            *elts = *v;
            v = v.add(1);
        }
        (*f).sp = v;
        if let Err(msg) = object::map_sort(a) {
            // delete the mapping and pass the error on
            arr_ref(a);
            arr_del(a);
            return Err(rt_err(f, msg));
        }
    } else {
        (*a.as_ptr()).sorted = true;
    }
    push_value(f, &Value::Mapping(a));
    Ok(())
}

/// Push the values of an array as separate stack values. A negative
/// count spreads everything and consumes the array; otherwise the array
/// stays below the spread values for the lvalue stores that follow.
unsafe fn spread1(f: *mut Frame, n: i32) -> Result<i32, Error> {
    let a = match *(*f).sp {
        Value::Array(a) => a,
        _ => return Err(rt_err(f, "Spread of non-array")),
    };
    let host = &mut *(*f).host;

    if n < 0 {
        // no lvalues
        let n = (*a.as_ptr()).size as i32;
        add_ticks(f, n as i64);
        (*f).sp = (*f).sp.add(1);
        grow_stack(f, n as usize);
        let elts = host.elts(a);
        for i in 0..n {
            push_value(f, &*elts.add(i as usize));
        }
        arr_del(a);
        Ok(n - 1)
    } else {
        // including lvalues
        let mut n = n;
        if n > (*a.as_ptr()).size as i32 {
            n = (*a.as_ptr()).size as i32;
        }
        add_ticks(f, n as i64);
        grow_stack(f, n as usize);
        (*f).sp = (*f).sp.add(1);
        let elts = host.elts(a);
        for i in 0..n {
            push_value(f, &*elts.add(i as usize));
        }
        (*f).sp = (*f).sp.sub(1);
        *(*f).sp = Value::Array(a);
        Ok(n)
    }
}

// ── casts and instanceof ──────────────────────────────────────────────

unsafe fn classname(host: &Host, f: *const Frame, class: u32) -> Vec<u8> {
    let s = strconst(
        host,
        (*f).p_ctrl,
        (class >> 16) as usize,
        (class & 0xffff) as usize,
    );
    s.as_ref().text().to_vec()
}

/// Is the object an instance of the named program? 1 when inherited,
/// -1 when privately inherited, 0 otherwise. Hits are cached.
unsafe fn instance_of(
    host: &mut Host,
    oindex: u32,
    prog: &[u8],
    hash: u32,
) -> i32 {
    let ctrl = &*(host.otable.obj(oindex).control.as_ref() as *const Control);
    let h = (((oindex as usize) << 2) ^ hash as usize) % INHASHSZ;

    // first try the cache
    let guess = host.ihash[h] as usize;
    if guess < ctrl.inherits.len()
        && host.otable.obj(ctrl.inherits[guess].oindex).name.as_bytes()
            == prog
    {
        return if ctrl.inherits[guess].private { -1 } else { 1 };
    }

    // then search for it the hard way
    for i in (0..ctrl.inherits.len()).rev() {
        if host.otable.obj(ctrl.inherits[i].oindex).name.as_bytes() == prog {
            host.ihash[h] = i as u8;
            return if ctrl.inherits[i].private { -1 } else { 1 };
        }
    }
    0
}

unsafe fn i_instanceof(
    host: &mut Host,
    f: *const Frame,
    oindex: u32,
    class: u32,
) -> i32 {
    let name = classname(host, f, class);
    instance_of(host, oindex, &name, class)
}

/// Is the object an instance of the program named by `prog`?
pub(crate) unsafe fn instance_str(
    host: &mut Host,
    oindex: u32,
    prog: &[u8],
) -> i32 {
    instance_of(host, oindex, prog, hashstr(prog, OBJHASHSZ) as u32)
}

unsafe fn cast(
    f: *mut Frame,
    val: &Value,
    tp: u8,
    class: u32,
) -> Result<(), Error> {
    let host = &mut *(*f).host;
    let mut tp = tp;
    if tp == T_CLASS {
        match val {
            Value::Object(r) => {
                if i_instanceof(host, f, r.index, class) == 0 {
                    let name = classname(host, f, class);
                    return Err(rt_err(
                        f,
                        format!(
                            "Value is not of object type /{}",
                            String::from_utf8_lossy(&name)
                        ),
                    ));
                }
                return Ok(());
            }
            Value::LwObject(a) => {
                match *(*a.as_ptr()).elts {
                    Value::Object(r) => {
                        if i_instanceof(host, f, r.index, class) == 0 {
                            let name = classname(host, f, class);
                            return Err(rt_err(
                                f,
                                format!(
                                    "Value is not of object type /{}",
                                    String::from_utf8_lossy(&name)
                                ),
                            ));
                        }
                    }
                    _ => {
                        let name = classname(host, f, class);
                        return Err(rt_err(
                            f,
                            format!(
                                "Value is not of object type /{}",
                                String::from_utf8_lossy(&name)
                            ),
                        ));
                    }
                }
                return Ok(());
            }
            _ => tp = T_OBJECT,
        }
    }

    let want = if tp & REF_MASK != 0 { T_ARRAY } else { tp & TYPE_MASK };
    let have = val.tag();
    if have != want
        && !(have == T_LWOBJECT && want == T_OBJECT)
        && (!val_nil(host.strict, val) || !t_pointer(tp))
    {
        let name = type_name(tp);
        let article = if "aeiuoy".contains(name.chars().next().unwrap()) {
            "an"
        } else {
            "a"
        };
        return Err(rt_err(f, format!("Value is not {article} {name}")));
    }
    Ok(())
}

// ── typechecking ──────────────────────────────────────────────────────

/// Check actual arguments on the caller's stack against a prototype.
unsafe fn typecheck(
    f: *mut Frame,
    prog_f: *const Frame,
    name: &str,
    ftype: &str,
    proto: &[u8],
    nargs: usize,
    strict: bool,
) -> Result<(), Error> {
    let host = &mut *(*f).host;
    let args = proto_args(proto);
    let ellipsis = proto_class(proto).contains(FnClass::ELLIPSIS);
    let mut ap = 0usize;
    let mut sclass = 0u32;
    let mut i = nargs;
    let mut n = proto_nargs(proto) + proto_vargs(proto);

    while n > 0 && i > 0 {
        i -= 1;
        let ptype = args[ap];
        ap += 1;
        if ptype & TYPE_MASK == T_CLASS {
            sclass = fetch3u(args, &mut ap);
        }
        if n == 1 && ellipsis {
            if ptype == T_MIXED || ptype == T_LVALUE {
                return Ok(());
            }
            // the ellipsis type checks every remaining argument
            if ptype & TYPE_MASK == T_CLASS {
                ap -= 4;
            } else {
                ap -= 1;
            }
        } else {
            n -= 1;
        }

        if ptype == T_MIXED {
            continue;
        }
        let arg = &*(*f).sp.add(i);
        let mut atype = arg.tag();
        if atype == T_LWOBJECT {
            atype = T_OBJECT;
        }
        if ptype == T_CLASS && atype == T_OBJECT {
            let bad = match arg {
                Value::Object(r) => {
                    i_instanceof(host, prog_f, r.index, sclass) == 0
                }
                Value::LwObject(a) => match *(*a.as_ptr()).elts {
                    Value::Object(r) => {
                        i_instanceof(host, prog_f, r.index, sclass) == 0
                    }
                    _ => true,
                },
                _ => true,
            };
            if bad {
                return Err(rt_err(
                    f,
                    format!(
                        "Bad object argument {} for function {}",
                        nargs - i,
                        name
                    ),
                ));
            }
            continue;
        }
        if ptype != atype && !(atype == T_ARRAY && ptype & REF_MASK != 0) {
            if !val_nil(host.strict, arg) || !t_pointer(ptype) {
                return Err(rt_err(
                    f,
                    format!(
                        "Bad argument {} ({}) for {} {}",
                        nargs - i,
                        type_name(atype),
                        ftype,
                        name
                    ),
                ));
            } else if strict {
                return Err(rt_err(
                    f,
                    format!(
                        "Bad argument {} for {} {}",
                        nargs - i,
                        ftype,
                        name
                    ),
                ));
            }
        }
    }
    Ok(())
}

// ── switches ──────────────────────────────────────────────────────────

unsafe fn switch_int(f: *const Frame, prog: &[u8], pc: usize) -> u16 {
    let mut p = pc;
    let count = fetch2u(prog, &mut p);
    let sz = fetch1u(prog, &mut p) as usize;
    let dflt = fetch2u(prog, &mut p);
    let v = match *(*f).sp {
        Value::Int(n) => n as i64,
        _ => return dflt,
    };

    let mut l = 0usize;
    let mut h = count as usize - 1;
    while l < h {
        let m = (l + h) >> 1;
        let mut q = p + (sz + 2) * m;
        let num = switch_key(prog, &mut q, sz);
        if v == num {
            return fetch2u(prog, &mut q);
        } else if v < num {
            h = m;
        } else {
            l = m + 1;
        }
    }
    dflt
}

unsafe fn switch_range(f: *const Frame, prog: &[u8], pc: usize) -> u16 {
    let mut p = pc;
    let count = fetch2u(prog, &mut p);
    let sz = fetch1u(prog, &mut p) as usize;
    let dflt = fetch2u(prog, &mut p);
    let v = match *(*f).sp {
        Value::Int(n) => n as i64,
        _ => return dflt,
    };

    let mut l = 0usize;
    let mut h = count as usize - 1;
    while l < h {
        let m = (l + h) >> 1;
        let mut q = p + (2 * sz + 2) * m;
        let low = switch_key(prog, &mut q, sz);
        if v < low {
            h = m;
        } else {
            let high = switch_key(prog, &mut q, sz);
            if v <= high {
                return fetch2u(prog, &mut q);
            }
            l = m + 1;
        }
    }
    dflt
}

fn switch_key(prog: &[u8], p: &mut usize, sz: usize) -> i64 {
    match sz {
        1 => fetch1s(prog, p) as i64,
        2 => fetch2s(prog, p) as i64,
        3 => fetch3s(prog, p) as i64,
        _ => fetch4s(prog, p) as i64,
    }
}

unsafe fn switch_str(f: *const Frame, prog: &[u8], pc: usize) -> u16 {
    let host = &*(*f).host;
    let mut p = pc;
    let mut count = fetch2u(prog, &mut p);
    let dflt = fetch2u(prog, &mut p);
    if fetch1u(prog, &mut p) == 0 {
        let nil_target = fetch2u(prog, &mut p);
        if val_nil(host.strict, &*(*f).sp) {
            return nil_target;
        }
        count -= 1;
    }
    let s = match *(*f).sp {
        Value::String(s) => s,
        _ => return dflt,
    };

    let mut l = 0usize;
    let mut h = count as usize - 1;
    while l < h {
        let m = (l + h) >> 1;
        let mut q = p + 5 * m;
        let inherit = fetch1u(prog, &mut q) as usize;
        let index = fetch2u(prog, &mut q) as usize;
        let cs = strconst(host, (*f).p_ctrl, inherit, index);
        match str_cmp(s.as_ref(), cs.as_ref()) {
            std::cmp::Ordering::Equal => return fetch2u(prog, &mut q),
            std::cmp::Ordering::Less => h = m,
            std::cmp::Ordering::Greater => l = m + 1,
        }
    }
    dflt
}

// ── composed stores ───────────────────────────────────────────────────

/// Perform a sequence of store targets read from the code: the first
/// `skip` targets are passed over (their stack operands released), the
/// next `assign` targets receive the value array's elements from the
/// back forward.
unsafe fn i_stores(
    f: *mut Frame,
    prog: &[u8],
    mut skip: i32,
    mut assign: i32,
) -> Result<(), Error> {
    let mut pc = (*f).pc;
    let mut instr = 0u8;

    // stores to skip
    while skip != 0 {
        instr = fetch1u(prog, &mut pc);
        let (op, _) = Op::decode(instr).expect("illegal instruction");
        match op {
            Op::Cast => {
                if fetch1u(prog, &mut pc) == T_CLASS {
                    pc += 3;
                }
                continue;
            }
            Op::StoreLocal | Op::StoreGlobal => {
                pc += 1;
            }
            Op::StoreFarGlobal => {
                pc += 2;
            }
            Op::StoreIndex => {
                del_value(&*(*f).sp.add(1));
                del_value(&*(*f).sp.add(2));
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreLocalIndex | Op::StoreGlobalIndex => {
                pc += 1;
                del_value(&*(*f).sp.add(1));
                del_value(&*(*f).sp.add(2));
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreFarGlobalIndex => {
                pc += 2;
                del_value(&*(*f).sp.add(1));
                del_value(&*(*f).sp.add(2));
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreIndexIndex => {
                for i in 1..=4 {
                    del_value(&*(*f).sp.add(i));
                }
                *(*f).sp.add(4) = *(*f).sp;
                (*f).sp = (*f).sp.add(4);
            }
            _ => panic!("invalid store"),
        }
        skip -= 1;
    }

    // stores to perform
    let mut sclass = 0u32;
    while assign != 0 {
        instr = fetch1u(prog, &mut pc);
        let (op, _) = Op::decode(instr).expect("illegal instruction");
        let varr = match *(*f).sp {
            Value::Array(a) => a,
            _ => unreachable!("stores without a value array"),
        };
        match op {
            Op::Cast => {
                let tp = fetch1u(prog, &mut pc);
                if tp == T_CLASS {
                    sclass = fetch3u(prog, &mut pc);
                }
                let v = (*varr.as_ptr()).elts.add(assign as usize - 1);
                cast(f, &*v, tp, sclass)?;
                continue;
            }
            Op::StoreLocal => {
                let local = fetch1s(prog, &mut pc) as i32;
                let v = *(*varr.as_ptr()).elts.add(assign as usize - 1);
                store_local(f, local, &v, None);
            }
            Op::StoreGlobal => {
                let index = fetch1u(prog, &mut pc) as usize;
                let v = *(*varr.as_ptr()).elts.add(assign as usize - 1);
                store_global(
                    f,
                    (*(*f).p_ctrl).self_index(),
                    index,
                    &v,
                    None,
                );
            }
            Op::StoreFarGlobal => {
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch1u(prog, &mut pc) as usize;
                let v = *(*varr.as_ptr()).elts.add(assign as usize - 1);
                store_global(f, inherit, index, &v, None);
            }
            Op::StoreIndex => {
                let mut var = Value::Nil;
                let v = (*varr.as_ptr()).elts.add(assign as usize - 1);
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    v,
                )? {
                    if let Value::String(s) = *(*f).sp.add(2) {
                        str_del(s);
                    }
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreLocalIndex => {
                let local = fetch1s(prog, &mut pc) as i32;
                let mut var = Value::Nil;
                let v = (*varr.as_ptr()).elts.add(assign as usize - 1);
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    v,
                )? {
                    let seen = match *(*f).sp.add(2) {
                        Value::String(s) => s,
                        _ => unreachable!(),
                    };
                    store_local(f, local, &var, Some(seen));
                    str_del(seen);
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreGlobalIndex => {
                let index = fetch1u(prog, &mut pc) as usize;
                let mut var = Value::Nil;
                let v = (*varr.as_ptr()).elts.add(assign as usize - 1);
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    v,
                )? {
                    let seen = match *(*f).sp.add(2) {
                        Value::String(s) => s,
                        _ => unreachable!(),
                    };
                    store_global(
                        f,
                        (*(*f).p_ctrl).self_index(),
                        index,
                        &var,
                        Some(seen),
                    );
                    str_del(seen);
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreFarGlobalIndex => {
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch1u(prog, &mut pc) as usize;
                let mut var = Value::Nil;
                let v = (*varr.as_ptr()).elts.add(assign as usize - 1);
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    v,
                )? {
                    let seen = match *(*f).sp.add(2) {
                        Value::String(s) => s,
                        _ => unreachable!(),
                    };
                    store_global(f, inherit, index, &var, Some(seen));
                    str_del(seen);
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }
            Op::StoreIndexIndex => {
                let mut var = Value::Nil;
                let v = (*varr.as_ptr()).elts.add(assign as usize - 1);
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    v,
                )? {
                    *(*f).sp.add(1) = var;
                    // the original string verifies the outer store
                    store_index(
                        f,
                        (*f).sp.add(2),
                        (*f).sp.add(4),
                        (*f).sp.add(3),
                        (*f).sp.add(1),
                    )?;
                    if let Value::String(s) = *(*f).sp.add(1) {
                        str_del(s);
                    }
                    if let Value::String(s) = *(*f).sp.add(2) {
                        str_del(s);
                    }
                } else {
                    del_value(&*(*f).sp.add(3));
                    del_value(&*(*f).sp.add(4));
                }
                pc = (*f).pc;
                *(*f).sp.add(4) = *(*f).sp;
                (*f).sp = (*f).sp.add(4);
            }
            _ => panic!("invalid store"),
        }
        assign -= 1;
    }

    if instr & POP_BIT != 0 {
        if let Value::Array(a) = *(*f).sp {
            arr_del(a);
        }
        (*f).sp = (*f).sp.add(1);
    }

    (*f).pc = pc;
    Ok(())
}

/// The `STORES` operation: unpack the top-of-stack value array into the
/// store targets that follow in the code, with an optional leading
/// spread target taking the tail of the values.
unsafe fn lvalues(f: *mut Frame, prog: &[u8]) -> Result<(), Error> {
    let mut pc = (*f).pc;
    let mut n = fetch1u(prog, &mut pc) as i32;
    (*f).pc = pc;

    let varr = match *(*f).sp {
        Value::Array(a) => a,
        _ => return Err(rt_err(f, "Wrong number of lvalues")),
    };
    let host = &mut *(*f).host;
    host.elts(varr);

    if n != 0 {
        let mut nassign = (*varr.as_ptr()).size as i32;

        if let Some((Op::Spread, _)) = Op::decode(prog[pc]) {
            // lvalue spread
            pc += 1;
            let mut sclass = 0u32;
            let offset = fetch1u(prog, &mut pc) as i32;
            let tp = fetch1u(prog, &mut pc);
            if tp == T_CLASS {
                sclass = fetch3u(prog, &mut pc);
            }
            (*f).pc = pc;

            n -= 1;
            let target = match *(*f).sp.add(1) {
                Value::Array(a) => a,
                _ => return Err(rt_err(f, "Spread of non-array")),
            };
            if n < nassign && ((*target.as_ptr()).size as i32) > offset {
                let mut nspread = (*target.as_ptr()).size as i32 - offset;
                if nspread >= nassign - n {
                    nspread = nassign - n;
                    add_ticks(f, nspread as i64 * 3);
                    while nspread != 0 {
                        nassign -= 1;
                        let v = (*varr.as_ptr())
                            .elts
                            .add(nassign as usize);
                        if tp != 0 {
                            cast(f, &*v, tp, sclass)?;
                        }
                        nspread -= 1;
                        assign_elt(
                            (*f).data,
                            target,
                            (offset + nspread) as usize,
                            &*v,
                        );
                    }
                }
            }

            arr_del(target);
            *(*f).sp.add(1) = *(*f).sp;
            (*f).sp = (*f).sp.add(1);
        }

        if n < nassign {
            return Err(rt_err(f, "Missing lvalue"));
        }
        i_stores(f, prog, n - nassign, nassign)?;
    }
    Ok(())
}

// ── rlimits ───────────────────────────────────────────────────────────

/// Ask the driver object whether the new limits are acceptable.
unsafe fn check_rlimits(f: *mut Frame) -> Result<(), Error> {
    let host = &mut *(*f).host;
    let obj = host.otable.obj((*f).oindex);
    if obj.count == 0 {
        return Err(rt_err(f, "Illegal use of rlimits"));
    }
    let oref = Oref { index: (*f).oindex, count: obj.count };
    (*f).sp = (*f).sp.sub(1);
    *(*f).sp = *(*f).sp.add(1);
    *(*f).sp.add(1) = *(*f).sp.add(2);
    if (*f).lwobj.is_null() {
        *(*f).sp.add(2) = Value::Object(oref);
    } else {
        let lw = NonNull::new_unchecked((*f).lwobj);
        arr_ref(lw);
        *(*f).sp.add(2) = Value::LwObject(lw);
    }

    // obj, stack, ticks
    call_driver_object(f, "runtime_rlimits", 3)?;

    if !(*(*f).sp).is_true() {
        return Err(rt_err(f, "Illegal use of rlimits"));
    }
    pop(f, 1);
    Ok(())
}

// ── the dispatcher ────────────────────────────────────────────────────

pub(crate) unsafe fn interpret(f: *mut Frame, mut pc: usize) -> Result<(), Error> {
    let prog: &[u8] = {
        let p = &(*(*f).p_ctrl).prog;
        std::slice::from_raw_parts(p.as_ptr(), p.len())
    };
    let mut size: usize = 0;

    loop {
        debug_assert!((*f).sp >= (*f).stack, "out of value stack");
        {
            let rlim = &mut *(*f).rlim;
            rlim.ticks -= 1;
            if rlim.ticks <= 0 {
                if rlim.noticks {
                    rlim.ticks = i64::MAX >> 1;
                } else {
                    return Err(rt_err(f, "Out of ticks"));
                }
            }
        }
        let instr = fetch1u(prog, &mut pc);
        (*f).pc = pc;
        let (op, pop_result) = match Op::decode(instr) {
            Some(d) => d,
            None => panic!("illegal instruction"),
        };

        match op {
            Op::PushInt1 => {
                let n = fetch1s(prog, &mut pc) as i32;
                push_value(f, &Value::Int(n));
                continue;
            }

            Op::PushInt2 => {
                let n = fetch2s(prog, &mut pc) as i32;
                push_value(f, &Value::Int(n));
                continue;
            }

            Op::PushInt4 => {
                let n = fetch4s(prog, &mut pc);
                push_value(f, &Value::Int(n));
                continue;
            }

            Op::PushFloat6 => {
                let high = fetch2u(prog, &mut pc);
                let low = fetch4u(prog, &mut pc);
                push_value(f, &Value::Float(Flt { high, low }));
                continue;
            }

            Op::PushString => {
                let host = &*(*f).host;
                let index = fetch1u(prog, &mut pc) as usize;
                let inherit = (*(*f).p_ctrl).self_index();
                let s = strconst(host, (*f).p_ctrl, inherit, index);
                push_value(f, &Value::String(s));
                continue;
            }

            Op::PushNearString => {
                let host = &*(*f).host;
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch1u(prog, &mut pc) as usize;
                let s = strconst(host, (*f).p_ctrl, inherit, index);
                push_value(f, &Value::String(s));
                continue;
            }

            Op::PushFarString => {
                let host = &*(*f).host;
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch2u(prog, &mut pc) as usize;
                let s = strconst(host, (*f).p_ctrl, inherit, index);
                push_value(f, &Value::String(s));
                continue;
            }

            Op::PushLocal => {
                let n = fetch1s(prog, &mut pc) as i32;
                let var = if n < 0 {
                    (*f).fp.offset(n as isize)
                } else {
                    (*f).argp.add(n as usize)
                };
                push_value(f, &*var);
                continue;
            }

            Op::PushGlobal => {
                let index = fetch1u(prog, &mut pc) as usize;
                i_global(f, (*(*f).p_ctrl).self_index(), index);
                continue;
            }

            Op::PushFarGlobal => {
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch1u(prog, &mut pc) as usize;
                i_global(f, inherit, index);
                continue;
            }

            Op::Index => {
                let mut val = Value::Nil;
                index2(f, (*f).sp.add(1), (*f).sp, &mut val, false)?;
                (*f).sp = (*f).sp.add(1);
                *(*f).sp = val;
            }

            Op::Index2 => {
                let mut val = Value::Nil;
                index2(f, (*f).sp.add(1), (*f).sp, &mut val, true)?;
                (*f).sp = (*f).sp.sub(1);
                *(*f).sp = val;
                continue;
            }

            Op::Aggregate => {
                let kind = fetch1u(prog, &mut pc);
                let n = fetch2u(prog, &mut pc) as usize;
                if kind == 0 {
                    aggregate(f, n);
                } else {
                    map_aggregate(f, n)?;
                }
            }

            Op::Spread => {
                let u = fetch1s(prog, &mut pc) as i32;
                size = spread1(f, -u - 2)? as usize;
                continue;
            }

            Op::Cast => {
                let tp = fetch1u(prog, &mut pc);
                let class = if tp == T_CLASS {
                    fetch3u(prog, &mut pc)
                } else {
                    0
                };
                cast(f, &*(*f).sp, tp, class)?;
            }

            Op::InstanceOf => {
                let host = &mut *(*f).host;
                let class = fetch3u(prog, &mut pc);
                let instance;
                match *(*f).sp {
                    Value::Object(r) => {
                        instance = i_instanceof(host, f, r.index, class);
                    }
                    Value::LwObject(a) => {
                        instance = match *(*a.as_ptr()).elts {
                            Value::Object(r) => {
                                i_instanceof(host, f, r.index, class)
                            }
                            _ => 0,
                        };
                        arr_del(a);
                    }
                    _ => {
                        return Err(rt_err(f, "Instance of bad type"));
                    }
                }
                *(*f).sp = Value::Int(instance);
            }

            Op::Stores => {
                lvalues(f, prog)?;
                pc = (*f).pc;
                continue;
            }

            Op::StoreLocal => {
                let n = fetch1s(prog, &mut pc) as i32;
                store_local(f, n, &*(*f).sp, None);
            }

            Op::StoreGlobal => {
                let index = fetch1u(prog, &mut pc) as usize;
                store_global(
                    f,
                    (*(*f).p_ctrl).self_index(),
                    index,
                    &*(*f).sp,
                    None,
                );
            }

            Op::StoreFarGlobal => {
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch1u(prog, &mut pc) as usize;
                store_global(f, inherit, index, &*(*f).sp, None);
            }

            Op::StoreIndex => {
                let mut var = Value::Nil;
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    (*f).sp,
                )? {
                    if let Value::String(s) = *(*f).sp.add(2) {
                        str_del(s);
                    }
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }

            Op::StoreLocalIndex => {
                let n = fetch1s(prog, &mut pc) as i32;
                let mut var = Value::Nil;
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    (*f).sp,
                )? {
                    let seen = match *(*f).sp.add(2) {
                        Value::String(s) => s,
                        _ => unreachable!(),
                    };
                    store_local(f, n, &var, Some(seen));
                    str_del(seen);
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }

            Op::StoreGlobalIndex => {
                let index = fetch1u(prog, &mut pc) as usize;
                let mut var = Value::Nil;
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    (*f).sp,
                )? {
                    let seen = match *(*f).sp.add(2) {
                        Value::String(s) => s,
                        _ => unreachable!(),
                    };
                    store_global(
                        f,
                        (*(*f).p_ctrl).self_index(),
                        index,
                        &var,
                        Some(seen),
                    );
                    str_del(seen);
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }

            Op::StoreFarGlobalIndex => {
                let inherit = fetch1u(prog, &mut pc) as usize;
                let index = fetch1u(prog, &mut pc) as usize;
                let mut var = Value::Nil;
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    (*f).sp,
                )? {
                    let seen = match *(*f).sp.add(2) {
                        Value::String(s) => s,
                        _ => unreachable!(),
                    };
                    store_global(f, inherit, index, &var, Some(seen));
                    str_del(seen);
                    if let Value::String(s) = var {
                        str_del(s);
                    }
                }
                pc = (*f).pc;
                *(*f).sp.add(2) = *(*f).sp;
                (*f).sp = (*f).sp.add(2);
            }

            Op::StoreIndexIndex => {
                let mut var = Value::Nil;
                (*f).pc = pc;
                if store_index(
                    f,
                    &mut var,
                    (*f).sp.add(2),
                    (*f).sp.add(1),
                    (*f).sp,
                )? {
                    *(*f).sp.add(1) = var;
                    // the original string verifies the outer store
                    store_index(
                        f,
                        (*f).sp.add(2),
                        (*f).sp.add(4),
                        (*f).sp.add(3),
                        (*f).sp.add(1),
                    )?;
                    if let Value::String(s) = *(*f).sp.add(1) {
                        str_del(s);
                    }
                    if let Value::String(s) = *(*f).sp.add(2) {
                        str_del(s);
                    }
                } else {
                    del_value(&*(*f).sp.add(3));
                    del_value(&*(*f).sp.add(4));
                }
                pc = (*f).pc;
                *(*f).sp.add(4) = *(*f).sp;
                (*f).sp = (*f).sp.add(4);
            }

            Op::JumpZero => {
                let target = fetch2u(prog, &mut pc) as usize;
                if !(*(*f).sp).is_true() {
                    pc = (*f).prog + target;
                }
                pop(f, 1);
                continue;
            }

            Op::JumpNonzero => {
                let target = fetch2u(prog, &mut pc) as usize;
                if (*(*f).sp).is_true() {
                    pc = (*f).prog + target;
                }
                pop(f, 1);
                continue;
            }

            Op::Jump => {
                let target = fetch2u(prog, &mut pc) as usize;
                pc = (*f).prog + target;
                continue;
            }

            Op::Switch => {
                let kind = fetch1u(prog, &mut pc);
                let target = match kind {
                    SWITCH_INT => switch_int(f, prog, pc),
                    SWITCH_RANGE => switch_range(f, prog, pc),
                    SWITCH_STRING => switch_str(f, prog, pc),
                    _ => panic!("illegal switch kind"),
                };
                pc = (*f).prog + target as usize;
                pop(f, 1);
                continue;
            }

            Op::CallKfun | Op::CallEfun => {
                let host = &mut *(*f).host;
                let index = if op == Op::CallKfun {
                    fetch1u(prog, &mut pc) as usize
                } else {
                    fetch2u(prog, &mut pc) as usize
                };
                let kf = host.kfuns.get(index).expect("unknown kfun")
                    as *const crate::kfun::Kfun;
                let nargs = if proto_vargs(&(*kf).proto) != 0 {
                    let n = fetch1u(prog, &mut pc) as usize + size;
                    size = 0;
                    n
                } else {
                    proto_nargs(&(*kf).proto)
                };
                if proto_class(&(*kf).proto).contains(FnClass::TYPECHECKED) {
                    typecheck(
                        f,
                        ptr::null(),
                        (*kf).name,
                        "kfun",
                        &(*kf).proto,
                        nargs,
                        true,
                    )?;
                }
                (*f).pc = pc;
                kfun_invoke(f, kf, nargs)?;
                pc = (*f).pc;
            }

            Op::CallCkfun | Op::CallCefun => {
                let host = &mut *(*f).host;
                let index = if op == Op::CallCkfun {
                    fetch1u(prog, &mut pc) as usize
                } else {
                    fetch2u(prog, &mut pc) as usize
                };
                let kf = host.kfuns.get(index).expect("unknown kfun")
                    as *const crate::kfun::Kfun;
                let nargs = fetch1u(prog, &mut pc) as usize + size;
                size = 0;
                if nargs != proto_nargs(&(*kf).proto) {
                    let msg = if nargs < proto_nargs(&(*kf).proto) {
                        format!(
                            "Too few arguments for kfun {}",
                            (*kf).name
                        )
                    } else {
                        format!(
                            "Too many arguments for kfun {}",
                            (*kf).name
                        )
                    };
                    return Err(rt_err(f, msg));
                }
                if proto_class(&(*kf).proto).contains(FnClass::TYPECHECKED) {
                    typecheck(
                        f,
                        ptr::null(),
                        (*kf).name,
                        "kfun",
                        &(*kf).proto,
                        nargs,
                        true,
                    )?;
                }
                (*f).pc = pc;
                kfun_invoke(f, kf, nargs)?;
                pc = (*f).pc;
            }

            Op::CallAfun => {
                let func = fetch1u(prog, &mut pc) as usize;
                let nargs = fetch1u(prog, &mut pc) as usize + size;
                size = 0;
                (*f).pc = pc;
                funcall(f, None, ptr::null_mut(), 0, func, nargs)?;
            }

            Op::CallDfun => {
                let inherit = fetch1u(prog, &mut pc) as usize;
                let func = fetch1u(prog, &mut pc) as usize;
                let nargs = fetch1u(prog, &mut pc) as usize + size;
                size = 0;
                let ctrl = &*(*f).ctrl;
                let ih =
                    ctrl.imap[(*f).p_index as usize + inherit] as usize;
                (*f).pc = pc;
                funcall(f, None, ptr::null_mut(), ih, func, nargs)?;
            }

            Op::CallFun => {
                let call = fetch2u(prog, &mut pc) as usize;
                let nargs = fetch1u(prog, &mut pc) as usize + size;
                size = 0;
                let ctrl = &*(*f).ctrl;
                let at = 2 * ((*f).foffset as usize + call);
                let inherit = ctrl.funcalls[at] as usize;
                let func = ctrl.funcalls[at + 1] as usize;
                (*f).pc = pc;
                funcall(f, None, ptr::null_mut(), inherit, func, nargs)?;
            }

            Op::Catch => {
                let atomic = (*f).atomic;
                let handler = fetch2u(prog, &mut pc) as usize;
                let saved_depth = (*f).fp.offset_from((*f).sp);
                (*f).atomic = false;
                match interpret(f, pc) {
                    Ok(()) => {
                        pc = (*f).pc;
                        push_value(f, &Value::Nil);
                    }
                    Err(mut e) => {
                        let depth = (*f).fp.offset_from((*f).sp);
                        debug_assert!(depth >= saved_depth);
                        pop(f, (depth - saved_depth) as usize);
                        pc = (*f).prog + handler;
                        (*f).pc = pc;
                        runtime_error(f, &mut e);
                        let s = str_new(e.message.as_bytes());
                        push_value(f, &Value::String(s));
                    }
                }
                (*f).atomic = atomic;
            }

            Op::Rlimits => {
                let newdepth = match *(*f).sp.add(1) {
                    Value::Int(n) => n as i64,
                    _ => return Err(rt_err(f, "Bad rlimits depth type")),
                };
                let newticks = match *(*f).sp {
                    Value::Int(n) => n as i64,
                    _ => return Err(rt_err(f, "Bad rlimits ticks type")),
                };
                if fetch1u(prog, &mut pc) == 0 {
                    // runtime check
                    (*f).pc = pc;
                    check_rlimits(f)?;
                } else {
                    // pop limits
                    pop(f, 2);
                }
                let prior = (*f).rlim;
                new_rlimits(f, newdepth, newticks);
                match interpret(f, pc) {
                    Ok(()) => {
                        pc = (*f).pc;
                        set_rlimits(f, prior);
                    }
                    Err(e) => {
                        set_rlimits(f, prior);
                        return Err(e);
                    }
                }
                continue;
            }

            Op::Return => {
                (*f).pc = pc;
                return Ok(());
            }
        }

        if pop_result {
            // pop the result of the last operation (never an lvalue)
            pop(f, 1);
        }
    }
}

unsafe fn kfun_invoke(
    f: *mut Frame,
    kf: *const crate::kfun::Kfun,
    nargs: usize,
) -> Result<(), Error> {
    match ((*kf).func)(f, nargs) {
        Ok(()) => Ok(()),
        Err(KfunError::BadArg(n)) => Err(rt_err(
            f,
            format!("Bad argument {} for kfun {}", n, (*kf).name),
        )),
        Err(KfunError::TooFew) => Err(rt_err(
            f,
            format!("Too few arguments for kfun {}", (*kf).name),
        )),
        Err(KfunError::TooMany) => Err(rt_err(
            f,
            format!("Too many arguments for kfun {}", (*kf).name),
        )),
        Err(KfunError::Raise(e)) => Err(e),
    }
}

// ── function calls ────────────────────────────────────────────────────

/// Call a function in an object. The arguments must be on the caller's
/// stack already; on return the callee frame has collapsed into a single
/// result value there.
pub(crate) unsafe fn funcall(
    prev: *mut Frame,
    obj: Option<u32>,
    lwobj: *mut Arr,
    p_ctrli: usize,
    funci: usize,
    nargs: usize,
) -> Result<(), Error> {
    let host_ptr = (*prev).host;
    let host = &mut *host_ptr;

    let mut f = Frame {
        prev,
        host: host_ptr,
        oindex: OBJ_NONE,
        lwobj: ptr::null_mut(),
        ctrl: ptr::null(),
        p_ctrl: ptr::null(),
        p_index: 0,
        foffset: 0,
        data: ptr::null_mut(),
        func: ptr::null(),
        external: false,
        sos: false,
        atomic: false,
        level: 0,
        depth: 0,
        nargs: 0,
        stack: ptr::null_mut(),
        fp: ptr::null_mut(),
        sp: ptr::null_mut(),
        argp: ptr::null_mut(),
        rlim: (*prev).rlim,
        prog: 0,
        pc: 0,
    };

    if (*prev).oindex == OBJ_NONE {
        // top level call
        let oi = obj.expect("top level call without an object");
        f.oindex = oi;
        f.ctrl = host.otable.obj(oi).control.as_ref();
        f.data = host.dataspace(oi);
        f.external = true;
    } else if !lwobj.is_null() {
        // call_other to lightweight object
        let oi = obj.expect("lwobject call without a master");
        f.oindex = oi;
        f.lwobj = lwobj;
        f.ctrl = host.otable.obj(oi).control.as_ref();
        f.data = host.dataspace(oi);
        f.external = true;
    } else if let Some(oi) = obj {
        // call_other to persistent object
        f.oindex = oi;
        f.ctrl = host.otable.obj(oi).control.as_ref();
        f.data = host.dataspace(oi);
        f.external = true;
    } else {
        // local function call
        f.oindex = (*prev).oindex;
        f.lwobj = (*prev).lwobj;
        f.ctrl = (*prev).ctrl;
        f.data = (*prev).data;
        f.external = false;
    }
    f.depth = (*prev).depth + 1;
    {
        let rlim = &mut *f.rlim;
        if !rlim.nodepth && f.depth >= rlim.maxdepth {
            return Err(rt_err(prev, "Stack overflow"));
        }
        if rlim.ticks < 100 {
            if rlim.noticks {
                rlim.ticks = i64::MAX >> 1;
            } else {
                return Err(rt_err(prev, "Out of ticks"));
            }
        }
    }

    // set the program control block
    {
        let ctrl = &*f.ctrl;
        let inh = &ctrl.inherits[p_ctrli];
        f.foffset = inh.funcoffset;
        f.p_ctrl = host.otable.obj(inh.oindex).control.as_ref();
        f.p_index = inh.progoffset;
    }

    // get the function
    f.func = &(&(*f.p_ctrl).funcdefs)[funci];
    let fclass = (*f.func).class;
    if fclass.contains(FnClass::UNDEFINED) {
        return Err(rt_err(
            prev,
            format!("Undefined function {}", func_name(host, &f)),
        ));
    }

    let prog: &[u8] = {
        let p = &(*f.p_ctrl).prog;
        std::slice::from_raw_parts(p.as_ptr(), p.len())
    };
    let offset = (*f.func).offset as usize;
    let proto = &prog[offset..];
    if fclass.contains(FnClass::TYPECHECKED) {
        // typecheck arguments
        let name = func_name(host, &f);
        typecheck(prev, &f, &name, "function", proto, nargs, false)?;
    }

    // handle arguments
    let mut nargs = nargs;
    let ellipsis = fclass.contains(FnClass::ELLIPSIS);
    let n = proto_nargs(proto) + proto_vargs(proto);
    if nargs < n {
        // if fewer actual than formal parameters, check for varargs
        if nargs < proto_nargs(proto) && host.strict {
            return Err(rt_err(
                prev,
                format!(
                    "Insufficient arguments for function {}",
                    func_name(host, &f)
                ),
            ));
        }

        // add missing arguments
        grow_stack(prev, n - nargs);
        let fill = if ellipsis { n - 1 } else { n };

        // the walk starts at the return type, which precedes the
        // parameter descriptors
        let types = &proto[bytecode::PROTO_ARGS_AT - 1..proto_size(proto)];
        let mut ap = 0usize;
        for _ in 0..=nargs {
            let t = types[ap];
            ap += 1;
            if t & TYPE_MASK == T_CLASS {
                ap += 3;
            }
        }
        while nargs < fill {
            let t = types[ap];
            ap += 1;
            match t {
                T_INT => {
                    (*prev).sp = (*prev).sp.sub(1);
                    *(*prev).sp = Value::Int(0);
                }
                T_FLOAT => {
                    (*prev).sp = (*prev).sp.sub(1);
                    *(*prev).sp = Value::Float(Flt::ZERO);
                }
                t => {
                    if t & TYPE_MASK == T_CLASS {
                        ap += 3;
                    }
                    (*prev).sp = (*prev).sp.sub(1);
                    *(*prev).sp = Value::Nil;
                }
            }
            nargs += 1;
        }
        if ellipsis {
            let a = host.new_array(0, f.data);
            push_value(prev, &Value::Array(a));
            nargs += 1;
        }
    } else if ellipsis {
        // put additional arguments in an array
        let mut extra = nargs - (n - 1);
        let a = host.new_array(extra, f.data);
        let mut v = (*a.as_ptr()).elts.add(extra);
        while extra > 0 {
            v = v.sub(1);
            *v = *(*prev).sp;
            (*prev).sp = (*prev).sp.add(1);
            extra -= 1;
        }
        push_value(prev, &Value::Array(a));
        nargs = n;
    } else if nargs > n {
        if host.strict {
            return Err(rt_err(
                prev,
                format!(
                    "Too many arguments for function {}",
                    func_name(host, &f)
                ),
            ));
        }
        // pop superfluous arguments
        pop(prev, nargs - n);
        nargs = n;
    }
    f.sp = (*prev).sp;
    f.nargs = nargs as u16;
    if !f.lwobj.is_null() {
        arr_ref(NonNull::new_unchecked(f.lwobj));
    }

    // deal with atomic functions
    f.level = (*prev).level;
    let atomic_root = fclass.contains(FnClass::ATOMIC) && !(*prev).atomic;
    if atomic_root {
        f.level += 1;
        host.otable.new_plane(f.level);
        if !f.data.is_null() {
            new_plane(f.data, f.level);
        }
        f.atomic = true;
        if !(*f.rlim).noticks {
            (*f.rlim).ticks >>= 1;
        }
    } else {
        if f.level != 0 && !f.data.is_null() && (*f.data).plane != f.level {
            new_plane(f.data, f.level);
        }
        f.atomic = (*prev).atomic;
    }

    add_ticks(&mut f, 10);

    // create the new local stack
    f.argp = f.sp;
    let mut c = offset + proto_size(proto);
    let stack_depth = fetch2u(prog, &mut c) as usize;
    let nlocals = fetch1u(prog, &mut c) as usize;
    c += 2; // code size
    f.prog = c;

    let stacksize = stack_depth + MIN_STACK + EXTRA_STACK;
    let mut sosbuf = [Value::Nil; SOS_SLOTS];
    if stacksize <= SOS_SLOTS {
        f.stack = sosbuf.as_mut_ptr();
        f.sos = true;
    } else {
        f.stack = heap::alloc(stacksize * std::mem::size_of::<Value>())
            .as_ptr() as *mut Value;
        f.sos = false;
    }
    f.fp = f.stack.add(stacksize);
    f.sp = f.fp;

    // initialize local variables
    for _ in 0..nlocals {
        f.sp = f.sp.sub(1);
        *f.sp = Value::Nil;
    }

    // execute code
    let fp: *mut Frame = &mut f;
    let result = interpret(fp, c);

    match result {
        Ok(()) => {
            // clean up the stack, move the return value to the caller
            let val = *f.sp;
            f.sp = f.sp.add(1);
            debug_assert_eq!(
                f.fp.offset_from(f.sp) as usize,
                nlocals,
                "bad stack pointer after function call"
            );
            pop(fp, f.fp.offset_from(f.sp) as usize);
            if !f.sos {
                heap::free(NonNull::new_unchecked(f.stack as *mut u8));
            }
            if !f.lwobj.is_null() {
                arr_del(NonNull::new_unchecked(f.lwobj));
            }
            pop(prev, f.nargs as usize);
            (*prev).sp = (*prev).sp.sub(1);
            *(*prev).sp = val;

            if atomic_root {
                host.commit_planes(f.level);
                if !(*f.rlim).noticks {
                    (*f.rlim).ticks *= 2;
                }
            }
            Ok(())
        }
        Err(mut e) => {
            unwind_frame(fp);
            pop(prev, f.nargs as usize);
            if atomic_root {
                atomic_error(prev, f.depth, &mut e);
                host.discard_planes(f.level);
                if !(*f.rlim).noticks {
                    (*f.rlim).ticks *= 2;
                }
            }
            Err(e)
        }
    }
}

/// Attempt to call a named function in an object, applying touch
/// semantics and static visibility. False means the function does not
/// exist (the arguments have been popped).
pub(crate) unsafe fn i_call(
    f: *mut Frame,
    obj: Option<u32>,
    lwobj: *mut Arr,
    func: &[u8],
    call_static: bool,
    nargs: usize,
) -> Result<bool, Error> {
    let host = &mut *(*f).host;
    let mut obj = obj;

    if !lwobj.is_null() {
        let lw = NonNull::new_unchecked(lwobj);
        let elts = (*lwobj).elts;
        let mut flt = match *elts.add(1) {
            Value::Float(x) => x,
            _ => Flt::ZERO,
        };
        if let Value::Object(r) = *elts {
            // ordinary light-weight object
            obj = Some(r.index);
        }
        if flt.high != 0 {
            // touch the light-weight object
            flt.high = 0;
            assign_elt((*f).data, lw, 1, &Value::Float(flt));
            arr_ref(lw);
            (*f).sp = (*f).sp.sub(1);
            *(*f).sp = Value::LwObject(lw);
            let s = str_new(func);
            push_value(f, &Value::String(s));
            call_driver_object(f, "touch", 2)?;
            if (*(*f).sp).is_true() {
                // preserve through the call
                flt.high = 1;
                *elts.add(1) = Value::Float(flt);
            }
            pop(f, 1);
        }
        if matches!(*elts, Value::Int(_)) {
            // no user-callable functions within
            pop(f, nargs);
            return Ok(false);
        }
    } else {
        let oi = obj.expect("call without an object");
        if !host.otable.obj(oi).flags.contains(ObjFlags::TOUCHED) {
            // initialize/touch the object
            host.otable.obj_mut(oi).flags |= ObjFlags::TOUCHED;
            if host.otable.obj(oi).data.is_some() {
                push_value(f, &Value::Object(host.otable.oref(oi)));
                let s = str_new(func);
                push_value(f, &Value::String(s));
                call_driver_object(f, "touch", 2)?;
                if (*(*f).sp).is_true() {
                    // preserve through the call
                    host.otable.obj_mut(oi).flags -= ObjFlags::TOUCHED;
                }
                pop(f, 1);
            } else {
                host.dataspace(oi);
                let creator = host.creator.clone();
                if i_call(
                    f,
                    Some(oi),
                    ptr::null_mut(),
                    creator.as_bytes(),
                    true,
                    0,
                )? {
                    pop(f, 1);
                }
            }
        }
    }

    // find the function in the symbol table
    let oi = obj.expect("call without an object");
    let ctrl: *const Control = host.otable.obj(oi).control.as_ref();
    let symb = match (*ctrl).symb(func) {
        Some(s) => s,
        None => {
            // function doesn't exist in the symbol table
            pop(f, nargs);
            return Ok(false);
        }
    };

    let def_oi = (&(*ctrl).inherits)[symb.inherit as usize].oindex;
    let def_ctrl: *const Control = host.otable.obj(def_oi).control.as_ref();
    let fdef = &(&(*def_ctrl).funcdefs)[symb.index as usize];

    // check if the function can be called
    if !call_static
        && fdef.class.contains(FnClass::STATIC)
        && ((*f).oindex != oi || (*f).lwobj != lwobj)
    {
        pop(f, nargs);
        return Ok(false);
    }

    // call the function
    tracing::trace!(
        object = %host.otable.obj(oi).name,
        func = %String::from_utf8_lossy(func),
        nargs,
        "call"
    );
    funcall(
        f,
        Some(oi),
        lwobj,
        symb.inherit as usize,
        symb.index as usize,
        nargs,
    )?;
    Ok(true)
}

// ── driver callbacks and error handling ───────────────────────────────

/// Issue a callback into the driver object. Without a driver, or when the
/// driver lacks the function, the arguments are replaced by nil.
pub(crate) unsafe fn call_driver_object(
    f: *mut Frame,
    func: &str,
    nargs: usize,
) -> Result<(), Error> {
    let host = &mut *(*f).host;
    match host.driver {
        Some(d) if host.otable.obj(d).count != 0 => {
            if !i_call(f, Some(d), ptr::null_mut(), func.as_bytes(), true, nargs)? {
                push_value(f, &Value::Nil);
            }
        }
        _ => {
            pop(f, nargs);
            push_value(f, &Value::Nil);
        }
    }
    Ok(())
}

/// Call a driver function at a critical moment: under unlimited rlimits,
/// with errors caught. True when the call ran to completion.
pub(crate) unsafe fn call_critical(
    f: *mut Frame,
    func: &str,
    nargs: usize,
) -> bool {
    new_rlimits(f, -1, -1);
    let target = (*(*f).rlim).next;
    let ok = call_driver_object(f, func, nargs).is_ok();
    set_rlimits(f, target);
    ok
}

/// Hand a runtime error to the driver, which may rewrite the message.
pub(crate) unsafe fn runtime_error(f: *mut Frame, e: &mut Error) {
    grow_stack(f, 3);
    let s = str_new(e.message.as_bytes());
    push_value(f, &Value::String(s));
    push_value(f, &Value::Int(e.depth as i32));
    push_value(f, &Value::Int(get_ticks(f) as i32));
    if !call_critical(f, "runtime_error", 3) {
        tracing::error!("error within runtime_error");
    } else {
        if let Value::String(s) = *(*f).sp {
            e.message =
                String::from_utf8_lossy(s.as_ref().text()).into_owned();
        }
        pop(f, 1);
    }
}

/// Hand an error raised in atomic code to the driver.
unsafe fn atomic_error(prev: *mut Frame, depth: u32, e: &mut Error) {
    grow_stack(prev, 3);
    let s = str_new(e.message.as_bytes());
    push_value(prev, &Value::String(s));
    push_value(prev, &Value::Int(depth as i32));
    push_value(prev, &Value::Int(get_ticks(prev) as i32));
    if !call_critical(prev, "atomic_error", 3) {
        tracing::error!("error within atomic_error");
    } else {
        if let Value::String(s) = *(*prev).sp {
            e.message =
                String::from_utf8_lossy(s.as_ref().text()).into_owned();
        }
        pop(prev, 1);
    }
}

// ── call chain inspection ─────────────────────────────────────────────

/// The nth previous object in the call_other chain.
pub(crate) unsafe fn prev_object(f: *const Frame, n: i32) -> Option<u32> {
    let mut f = f;
    let mut n = n;
    while n >= 0 {
        // back to the last external call
        while !(*f).external {
            f = (*f).prev;
        }
        f = (*f).prev;
        if (*f).oindex == OBJ_NONE {
            return None;
        }
        n -= 1;
    }
    Some((*f).oindex)
}

/// The nth previous program in the function call chain.
pub(crate) unsafe fn prev_program(f: *const Frame, n: i32) -> Option<u32> {
    let mut f = f;
    let mut n = n;
    while n >= 0 {
        f = (*f).prev;
        if (*f).oindex == OBJ_NONE {
            return None;
        }
        n -= 1;
    }
    let ctrl = &*(*f).p_ctrl;
    Some(ctrl.inherits[ctrl.self_index()].oindex)
}

/// The source line the given frame is executing, recovered from the
/// instruction line-delta bits and the numbers stream.
pub(crate) unsafe fn frame_line(f: *const Frame) -> u16 {
    let host = &*(*f).host;
    let prog: &[u8] = {
        let p = &(*(*f).p_ctrl).prog;
        std::slice::from_raw_parts(p.as_ptr(), p.len())
    };
    let offset = (*(*f).func).offset as usize;
    let proto = &prog[offset..];

    let mut pc = offset + proto_size(proto) + 3;
    let code_size = fetch2u(prog, &mut pc) as usize;
    let mut numbers = pc + code_size;
    let mut line = 0i32;

    while pc < (*f).pc {
        let instr = fetch1u(prog, &mut pc);

        let delta = Op::line_delta(instr);
        if delta <= 2 {
            line += delta as i32;
        } else {
            let b = fetch1u(prog, &mut numbers);
            if b >= 128 {
                // one byte offset
                line += b as i32 - 128 - 64;
            } else {
                // two byte offset
                line += (((b as i32) << 8)
                    | fetch1u(prog, &mut numbers) as i32)
                    - 16384;
            }
        }

        let (op, _) = Op::decode(instr).expect("illegal instruction");
        match op {
            Op::Index
            | Op::Index2
            | Op::StoreIndex
            | Op::StoreIndexIndex
            | Op::Return => {}

            Op::CallKfun => {
                let i = fetch1u(prog, &mut pc) as usize;
                let kf = host.kfuns.get(i).expect("unknown kfun");
                if proto_vargs(&kf.proto) != 0 {
                    pc += 1;
                }
            }

            Op::CallEfun => {
                let i = fetch2u(prog, &mut pc) as usize;
                let kf = host.kfuns.get(i).expect("unknown kfun");
                if proto_vargs(&kf.proto) != 0 {
                    pc += 1;
                }
            }

            Op::PushInt1
            | Op::PushString
            | Op::PushLocal
            | Op::PushGlobal
            | Op::StoreLocal
            | Op::StoreGlobal
            | Op::Stores
            | Op::StoreLocalIndex
            | Op::StoreGlobalIndex
            | Op::Rlimits => {
                pc += 1;
            }

            Op::Spread => {
                if fetch1s(prog, &mut pc) >= 0 {
                    // spread store target: a type follows
                    if fetch1u(prog, &mut pc) == T_CLASS {
                        pc += 3;
                    }
                }
            }

            Op::Cast => {
                if fetch1u(prog, &mut pc) == T_CLASS {
                    pc += 3;
                }
            }

            Op::PushInt2
            | Op::PushNearString
            | Op::PushFarGlobal
            | Op::StoreFarGlobal
            | Op::StoreFarGlobalIndex
            | Op::JumpZero
            | Op::JumpNonzero
            | Op::Jump
            | Op::CallAfun
            | Op::CallCkfun
            | Op::Catch => {
                pc += 2;
            }

            Op::PushFarString
            | Op::Aggregate
            | Op::InstanceOf
            | Op::CallDfun
            | Op::CallFun
            | Op::CallCefun => {
                pc += 3;
            }

            Op::PushInt4 => {
                pc += 4;
            }

            Op::PushFloat6 => {
                pc += 6;
            }

            Op::Switch => match fetch1u(prog, &mut pc) {
                SWITCH_INT => {
                    let u = fetch2u(prog, &mut pc) as usize;
                    let sz = fetch1u(prog, &mut pc) as usize;
                    pc += 2 + (u - 1) * (sz + 2);
                }
                SWITCH_RANGE => {
                    let u = fetch2u(prog, &mut pc) as usize;
                    let sz = fetch1u(prog, &mut pc) as usize;
                    pc += 2 + (u - 1) * (2 * sz + 2);
                }
                _ => {
                    let mut u = fetch2u(prog, &mut pc) as usize;
                    pc += 2;
                    if fetch1u(prog, &mut pc) == 0 {
                        pc += 2;
                        u -= 1;
                    }
                    pc += (u - 1) * 5;
                }
            },
        }
    }

    line as u16
}

const TRACE_MAX_ARGS: usize = 64;

/// The trace of a single function: object name, program name, function
/// name, line, external flag, and the arguments.
unsafe fn func_trace(f: *const Frame) -> NonNull<Arr> {
    let host = &mut *(*f).host;
    let mut n = (*f).nargs as usize;
    if n > TRACE_MAX_ARGS {
        // unlikely, but possible
        n = TRACE_MAX_ARGS;
    }
    let a = host.new_array(n + 5, (*f).data);
    let elts = (*a.as_ptr()).elts;

    // object name
    let name = &host.otable.obj((*f).oindex).name;
    let objname = if (*f).lwobj.is_null() {
        format!("/{name}")
    } else {
        format!("/{name}#-1")
    };
    let s = str_new(objname.as_bytes());
    str_ref(s);
    *elts = Value::String(s);

    // program name
    let ctrl = &*(*f).p_ctrl;
    let pname = &host.otable.obj(ctrl.inherits[ctrl.self_index()].oindex).name;
    let s = str_new(format!("/{pname}").as_bytes());
    str_ref(s);
    *elts.add(1) = Value::String(s);

    // function name
    let fd = &*(*f).func;
    let s = strconst(host, (*f).p_ctrl, fd.inherit as usize, fd.index as usize);
    str_ref(s);
    *elts.add(2) = Value::String(s);

    // line number
    *elts.add(3) = Value::Int(frame_line(f) as i32);

    // external flag
    *elts.add(4) = Value::Int((*f).external as i32);

    // arguments
    let mut args = (*f).argp.add((*f).nargs as usize);
    for i in 0..n {
        args = args.sub(1);
        copy(host, elts.add(5 + i), args, 1);
    }

    a
}

/// The full function call trace, outermost first.
pub(crate) unsafe fn call_trace(ftop: *const Frame) -> NonNull<Arr> {
    let host = &mut *(*ftop).host;
    let mut n = 0usize;
    let mut f = ftop;
    while (*f).oindex != OBJ_NONE {
        n += 1;
        f = (*f).prev;
    }
    let a = host.new_array(n, (*ftop).data);
    add_ticks(ftop as *mut Frame, 10 * n as i64);
    let mut v = (*a.as_ptr()).elts.add(n);
    let mut f = ftop;
    while (*f).oindex != OBJ_NONE {
        v = v.sub(1);
        let t = func_trace(f);
        arr_ref(t);
        *v = Value::Array(t);
        f = (*f).prev;
    }
    a
}
