use std::ptr::{self, NonNull};

use bytecode::{make_proto, FnClass};
use object::{
    arr_del, del_value, str_alloc, str_new, Flt, Value, T_ARRAY, T_INT,
    T_MIXED, T_OBJECT, T_STRING, T_VOID,
};

use crate::error::Error;
use crate::frame::{add_ticks, copy, get_ticks, odest, pop, push_value, Frame};
use crate::interpret::i_call;

/// How a kernel function failed. Argument complaints are turned into the
/// standard messages by the dispatcher, which knows the kfun's name.
pub enum KfunError {
    BadArg(usize),
    TooFew,
    TooMany,
    Raise(Error),
}

pub type KfunImpl = unsafe fn(*mut Frame, usize) -> Result<(), KfunError>;

/// One kernel function: name, prototype, implementation. Calls reach it
/// through the table index compiled into the bytecode.
pub struct Kfun {
    pub name: &'static str,
    pub proto: Vec<u8>,
    pub func: KfunImpl,
}

/// The kfun dispatch table. The standard table carries the small builtin
/// set the standalone runtime needs; a full library registers through
/// [`KfunTable::register`].
pub struct KfunTable {
    kfuns: Vec<Kfun>,
}

pub const KF_ADD: u8 = 0;
pub const KF_SUB: u8 = 1;
pub const KF_ERROR: u8 = 2;
pub const KF_DESTRUCT: u8 = 3;
pub const KF_NEW_OBJECT: u8 = 4;
pub const KF_CALL_OTHER: u8 = 5;
pub const KF_CALL_TRACE: u8 = 6;
pub const KF_PREVIOUS_OBJECT: u8 = 7;
pub const KF_PREVIOUS_PROGRAM: u8 = 8;

impl KfunTable {
    pub fn standard() -> Self {
        let mut t = KfunTable { kfuns: Vec::new() };
        t.register(Kfun {
            name: "add",
            proto: make_proto(FnClass::empty(), 2, 0, T_MIXED, &[T_MIXED, T_MIXED]),
            func: kf_add,
        });
        t.register(Kfun {
            name: "sub",
            proto: make_proto(FnClass::empty(), 2, 0, T_INT, &[T_MIXED, T_MIXED]),
            func: kf_sub,
        });
        t.register(Kfun {
            name: "error",
            proto: make_proto(FnClass::TYPECHECKED, 1, 0, T_VOID, &[T_STRING]),
            func: kf_error,
        });
        t.register(Kfun {
            name: "destruct_object",
            proto: make_proto(FnClass::TYPECHECKED, 1, 0, T_INT, &[T_OBJECT]),
            func: kf_destruct,
        });
        t.register(Kfun {
            name: "new_object",
            proto: make_proto(FnClass::TYPECHECKED, 1, 0, T_OBJECT, &[T_OBJECT]),
            func: kf_new_object,
        });
        t.register(Kfun {
            name: "call_other",
            proto: make_proto(
                FnClass::TYPECHECKED | FnClass::ELLIPSIS,
                2,
                1,
                T_MIXED,
                &[T_MIXED, T_STRING, T_MIXED],
            ),
            func: kf_call_other,
        });
        t.register(Kfun {
            name: "call_trace",
            proto: make_proto(FnClass::empty(), 0, 0, T_ARRAY, &[]),
            func: kf_call_trace,
        });
        t.register(Kfun {
            name: "previous_object",
            proto: make_proto(FnClass::TYPECHECKED, 1, 0, T_OBJECT, &[T_INT]),
            func: kf_previous_object,
        });
        t.register(Kfun {
            name: "previous_program",
            proto: make_proto(FnClass::TYPECHECKED, 1, 0, T_STRING, &[T_INT]),
            func: kf_previous_program,
        });
        t
    }

    pub fn register(&mut self, kfun: Kfun) -> usize {
        self.kfuns.push(kfun);
        self.kfuns.len() - 1
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Kfun> {
        self.kfuns.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.kfuns.iter().position(|k| k.name == name)
    }
}

/// add lhs and rhs: integer addition, string and array concatenation.
unsafe fn kf_add(f: *mut Frame, _nargs: usize) -> Result<(), KfunError> {
    let lhs = *(*f).sp.add(1);
    let rhs = *(*f).sp;
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            pop(f, 2);
            push_value(f, &Value::Int(a.wrapping_add(b)));
        }
        (Value::String(a), Value::String(b)) => {
            let (a, b) = (a.as_ref(), b.as_ref());
            add_ticks(f, (a.len() + b.len()) as i64 >> 4);
            let s = str_alloc(a.len() + b.len());
            let text = (*s.as_ptr()).text_mut();
            text[..a.len()].copy_from_slice(a.text());
            text[a.len()..].copy_from_slice(b.text());
            pop(f, 2);
            push_value(f, &Value::String(s));
        }
        (Value::Array(a), Value::Array(b)) => {
            let host = &mut *(*f).host;
            let na = (*a.as_ptr()).size as usize;
            let nb = (*b.as_ptr()).size as usize;
            add_ticks(f, (na + nb) as i64);
            let r = host.new_array(na + nb, (*f).data);
            copy(host, (*r.as_ptr()).elts, host.elts(a), na);
            copy(host, (*r.as_ptr()).elts.add(na), host.elts(b), nb);
            pop(f, 2);
            push_value(f, &Value::Array(r));
        }
        (Value::Int(_), _) | (Value::String(_), _) | (Value::Array(_), _) => {
            return Err(KfunError::BadArg(2));
        }
        _ => return Err(KfunError::BadArg(1)),
    }
    Ok(())
}

/// Integer subtraction.
unsafe fn kf_sub(f: *mut Frame, _nargs: usize) -> Result<(), KfunError> {
    let lhs = *(*f).sp.add(1);
    let rhs = *(*f).sp;
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            pop(f, 2);
            push_value(f, &Value::Int(a.wrapping_sub(b)));
            Ok(())
        }
        (Value::Int(_), _) => Err(KfunError::BadArg(2)),
        _ => Err(KfunError::BadArg(1)),
    }
}

/// Raise an error with the given message.
unsafe fn kf_error(f: *mut Frame, _nargs: usize) -> Result<(), KfunError> {
    match *(*f).sp {
        Value::String(s) => {
            let msg = String::from_utf8_lossy(s.as_ref().text()).into_owned();
            Err(KfunError::Raise(Error::new(msg, (*f).depth, get_ticks(f))))
        }
        _ => Err(KfunError::BadArg(1)),
    }
}

/// Destruct a persistent object. Every reference on any stack reads as
/// nil from here on.
unsafe fn kf_destruct(f: *mut Frame, _nargs: usize) -> Result<(), KfunError> {
    match *(*f).sp {
        Value::Object(r) => {
            let host = &mut *(*f).host;
            if host.otable.destructed(r) {
                return Err(KfunError::BadArg(1));
            }
            odest(f, r.count);
            host.otable.destruct(r.index);
            pop(f, 1);
            push_value(f, &Value::Int(1));
            Ok(())
        }
        _ => Err(KfunError::BadArg(1)),
    }
}

/// Create a lightweight instance of a persistent object's program.
unsafe fn kf_new_object(f: *mut Frame, _nargs: usize) -> Result<(), KfunError> {
    match *(*f).sp {
        Value::Object(r) => {
            let host = &mut *(*f).host;
            let nvars = host.otable.obj(r.index).control.nvariables as usize;
            let a = host.new_array(2 + nvars, (*f).data);
            let elts = (*a.as_ptr()).elts;
            *elts = Value::Object(r);
            *elts.add(1) = Value::Float(Flt::ZERO);
            pop(f, 1);
            push_value(f, &Value::LwObject(a));
            Ok(())
        }
        _ => Err(KfunError::BadArg(1)),
    }
}

/// Call a named function in another object; nil when the object has no
/// such function visible to the caller.
unsafe fn kf_call_other(f: *mut Frame, nargs: usize) -> Result<(), KfunError> {
    if nargs < 2 {
        return Err(KfunError::TooFew);
    }
    let target = *(*f).sp.add(nargs - 1);
    let name_v = *(*f).sp.add(nargs - 2);
    let name = match name_v {
        Value::String(s) => s,
        _ => return Err(KfunError::BadArg(2)),
    };
    let fname: Vec<u8> = name.as_ref().text().to_vec();

    let (obj, lwobj) = match target {
        Value::Object(r) => {
            let host = &*(*f).host;
            if host.otable.destructed(r) {
                return Err(KfunError::BadArg(1));
            }
            (Some(r.index), ptr::null_mut())
        }
        Value::LwObject(a) => (None, a.as_ptr()),
        _ => return Err(KfunError::BadArg(1)),
    };

    del_value(&name_v);
    // slide the call arguments up over the target and the name; the
    // recycled slot's reference keeps the lwobject alive until after
    // the call
    let sp = (*f).sp;
    ptr::copy(sp, sp.add(2), nargs - 2);
    (*f).sp = sp.add(2);

    let result = i_call(f, obj, lwobj, &fname, false, nargs - 2);
    if !lwobj.is_null() {
        arr_del(NonNull::new_unchecked(lwobj));
    }
    match result {
        Ok(true) => Ok(()),
        Ok(false) => {
            push_value(f, &Value::Nil);
            Ok(())
        }
        Err(e) => Err(KfunError::Raise(e)),
    }
}

/// The function call trace as an array of per-frame arrays.
unsafe fn kf_call_trace(f: *mut Frame, _nargs: usize) -> Result<(), KfunError> {
    let a = crate::interpret::call_trace(f);
    push_value(f, &Value::Array(a));
    Ok(())
}

/// The nth previous object in the call_other chain.
unsafe fn kf_previous_object(
    f: *mut Frame,
    _nargs: usize,
) -> Result<(), KfunError> {
    let n = match *(*f).sp {
        Value::Int(n) => n,
        _ => return Err(KfunError::BadArg(1)),
    };
    let host = &*(*f).host;
    let v = match crate::interpret::prev_object(f, n) {
        Some(oi) if host.otable.obj(oi).count != 0 => {
            Value::Object(host.otable.oref(oi))
        }
        _ => Value::Nil,
    };
    pop(f, 1);
    push_value(f, &v);
    Ok(())
}

/// The name of the nth previous program in the call chain.
unsafe fn kf_previous_program(
    f: *mut Frame,
    _nargs: usize,
) -> Result<(), KfunError> {
    let n = match *(*f).sp {
        Value::Int(n) => n,
        _ => return Err(KfunError::BadArg(1)),
    };
    let host = &*(*f).host;
    let v = match crate::interpret::prev_program(f, n) {
        Some(oi) => {
            let s = str_new(host.otable.obj(oi).name.as_bytes());
            Value::String(s)
        }
        None => Value::Nil,
    };
    pop(f, 1);
    push_value(f, &v);
    Ok(())
}
