//! The runtime core: object table, dataspaces, frames, resource limits
//! and the bytecode interpreter, glued together by [`Host`].
//!
//! A `Host` owns everything process-wide: the object table with its
//! generation counts, the kfun dispatch table, the creator name, the
//! strict-typechecking flag and the instanceof cache. Programs are
//! presented through [`ControlBuilder`], execution starts at
//! [`Host::call`].

mod control;
mod data;
mod error;
mod frame;
mod interpret;
mod kfun;
mod otable;

use std::mem;
use std::ptr::{self, NonNull};

use object::{arr_new, del_value, Arr};

pub use control::{Control, ControlBuilder, FuncDef, Inherit, Symbol, VarDef};
pub use data::Dataspace;
pub use error::Error;
pub use frame::{
    add_ticks, copy, get_depth, get_ticks, grow_stack, pop, push_value,
    Frame, Rlim, EXTRA_STACK, MIN_STACK,
};
pub use kfun::{
    Kfun, KfunError, KfunTable, KF_ADD, KF_CALL_OTHER, KF_CALL_TRACE,
    KF_DESTRUCT, KF_ERROR, KF_NEW_OBJECT, KF_PREVIOUS_OBJECT,
    KF_PREVIOUS_PROGRAM, KF_SUB,
};
pub use otable::{Obj, ObjFlags, ObjectTable, OBJ_NONE};

pub use object::{Flt, Lvalue, Oref, Value};

use crate::control::InheritedInfo;
use crate::frame::{push_value as fpush, unwind_frame};
use crate::interpret::{i_call, runtime_error, INHASHSZ};

/// Process-wide interpreter state.
pub struct Host {
    pub otable: ObjectTable,
    pub kfuns: KfunTable,
    pub creator: String,
    pub strict: bool,
    pub driver: Option<u32>,
    pub(crate) ihash: [u8; INHASHSZ],
}

impl Host {
    /// Record the creator function name and the strict-typechecking flag.
    /// Under strict typechecking nil is distinct from integer zero.
    pub fn new(creator: &str, strict: bool) -> Host {
        tracing::debug!(creator, strict, "interpreter initialized");
        Host {
            otable: ObjectTable::new(),
            kfuns: KfunTable::standard(),
            creator: creator.to_string(),
            strict,
            driver: None,
            ihash: [0; INHASHSZ],
        }
    }

    /// Load a program and give it an object.
    pub fn load_object(&mut self, name: &str, builder: ControlBuilder) -> u32 {
        let infos: Vec<InheritedInfo> = builder
            .inherited_objects()
            .iter()
            .map(|&oi| {
                let ctrl = &self.otable.obj(oi).control;
                let functions = ctrl
                    .funcdefs
                    .iter()
                    .enumerate()
                    .map(|(i, fd)| {
                        let s = ctrl.strings[fd.index as usize];
                        (unsafe { s.as_ref() }.text().to_vec(), i as u8)
                    })
                    .collect();
                InheritedInfo {
                    oindex: oi,
                    nvariables: ctrl.nvariables,
                    nfuncalls: (ctrl.funcalls.len() / 2) as u16,
                    functions,
                }
            })
            .collect();
        let index = self.otable.objects.len() as u32;
        let ctrl = builder.build(index, &infos);
        self.otable.create(name, ctrl)
    }

    /// Nominate the driver object for runtime callbacks.
    pub fn set_driver(&mut self, oindex: u32) {
        self.driver = Some(oindex);
    }

    /// The object's dataspace, created on first use.
    pub(crate) fn dataspace(&mut self, oindex: u32) -> *mut Dataspace {
        let nvars = self.otable.obj(oindex).control.nvariables as usize;
        let obj = self.otable.obj_mut(oindex);
        if obj.data.is_none() {
            obj.data = Some(Box::new(Dataspace::new(oindex, nvars)));
        }
        obj.data.as_mut().unwrap().as_mut() as *mut Dataspace
    }

    /// Allocate an array stamped with the current destruct epoch and the
    /// owning dataspace's plane level.
    pub(crate) fn new_array(
        &mut self,
        size: usize,
        data: *mut Dataspace,
    ) -> NonNull<Arr> {
        let a = arr_new(size);
        unsafe {
            (*a.as_ptr()).odcount = self.otable.odcount;
            (*a.as_ptr()).level =
                if data.is_null() { 0 } else { (*data).plane };
        }
        a
    }

    /// The element buffer of an array, with stale object references
    /// rewritten to nil when objects were destructed since the last look.
    pub(crate) fn elts(&self, a: NonNull<Arr>) -> *mut Value {
        unsafe {
            let p = a.as_ptr();
            if (*p).odcount != self.otable.odcount {
                for i in 0..(*p).size as usize {
                    let v = (*p).elts.add(i);
                    if let Value::Object(r) = *v {
                        if self.otable.destructed(r) {
                            *v = Value::Nil;
                        }
                    }
                }
                (*p).odcount = self.otable.odcount;
            }
            (*p).elts
        }
    }

    pub(crate) fn commit_planes(&mut self, level: u16) {
        for obj in self.otable.objects.iter_mut() {
            if let Some(d) = obj.data.as_mut() {
                if d.plane == level {
                    unsafe { data::commit_plane(d.as_mut()) };
                }
            }
        }
        self.otable.commit_plane(level);
    }

    pub(crate) fn discard_planes(&mut self, level: u16) {
        for obj in self.otable.objects.iter_mut() {
            if let Some(d) = obj.data.as_mut() {
                if d.plane == level {
                    unsafe { data::discard_plane(d.as_mut()) };
                }
            }
        }
        self.otable.discard_plane(level);
    }

    /// Is the object an instance of the named program?
    pub fn instance_of(&mut self, oindex: u32, prog: &str) -> i32 {
        unsafe { interpret::instance_str(self, oindex, prog.as_bytes()) }
    }

    /// Call a named function in an object from the outside. Returns the
    /// result value (holding one reference the caller releases through
    /// [`Host::release`]), or `None` when the object has no such function.
    pub fn call(
        &mut self,
        oindex: u32,
        func: &str,
        args: &[Value],
    ) -> Result<Option<Value>, Error> {
        unsafe {
            let mut root = Rlim {
                maxdepth: 0,
                ticks: 0,
                nodepth: true,
                noticks: true,
                next: ptr::null_mut(),
            };
            let size = args.len() + MIN_STACK + EXTRA_STACK;
            let buf = heap::alloc(size * mem::size_of::<Value>()).as_ptr()
                as *mut Value;
            let mut top = Frame {
                prev: ptr::null_mut(),
                host: self,
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
                stack: buf,
                fp: buf.add(size),
                sp: buf.add(size),
                argp: buf.add(size),
                rlim: &mut root,
                prog: 0,
                pc: 0,
            };
            let tf: *mut Frame = &mut top;
            for a in args {
                fpush(tf, a);
            }

            let result =
                i_call(tf, Some(oindex), ptr::null_mut(), func.as_bytes(), true, args.len());
            let out = match result {
                Ok(true) => {
                    let v = *top.sp;
                    top.sp = top.sp.add(1);
                    Ok(Some(v))
                }
                Ok(false) => Ok(None),
                Err(mut e) => {
                    // the driver gets the final say on the error string
                    runtime_error(tf, &mut e);
                    let n = top.fp.offset_from(top.sp) as usize;
                    pop(tf, n);
                    Err(e)
                }
            };
            debug_assert!(top.sp == top.fp, "unbalanced top-level stack");
            debug_assert!(
                top.rlim == &mut root as *mut Rlim,
                "leaked rlimits scope"
            );
            top.oindex = OBJ_NONE;
            unwind_frame(tf);
            heap::free(NonNull::new_unchecked(top.stack as *mut u8));
            out
        }
    }

    /// Release a value handed out by [`Host::call`].
    pub fn release(&mut self, v: Value) {
        unsafe { del_value(&v) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{make_proto, CodeBuilder, FnClass};
    use object::{Lvalue, T_INT, T_MIXED, T_OBJECT, T_STRING, T_VOID};

    fn init() {
        if !heap::configured() {
            heap::minit(65536, 262144);
        }
    }

    fn mixed_proto(nargs: u8, args: &[u8]) -> Vec<u8> {
        make_proto(FnClass::empty(), nargs, 0, T_MIXED, args)
    }

    /// Host with one object holding the given functions.
    fn host_with(
        functions: &[(&str, FnClass, Box<dyn Fn(&mut ControlBuilder) -> Vec<u8>>)],
    ) -> (Host, u32) {
        init();
        let mut host = Host::new("create", false);
        let mut cb = ControlBuilder::new();
        let built: Vec<(String, FnClass, Vec<u8>)> = functions
            .iter()
            .map(|(name, class, gen)| (name.to_string(), *class, gen(&mut cb)))
            .collect();
        for (name, class, image) in built {
            cb.function(name.as_bytes(), class, image);
        }
        let oi = host.load_object("test", cb);
        (host, oi)
    }

    fn expect_int(r: Result<Option<Value>, Error>) -> i32 {
        match r {
            Ok(Some(Value::Int(n))) => n,
            other => panic!("expected an int result, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_and_return() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                c.push_int(3);
                c.push_int(4);
                c.call_ckfun(KF_ADD, 2, false);
                c.ret();
                c.finish(&make_proto(FnClass::empty(), 0, 0, T_MIXED, &[]), 8, 0)
            }),
        )]);
        let before = heap::dynamic_used();
        assert_eq!(expect_int(host.call(oi, "run", &[])), 7);
        assert_eq!(heap::dynamic_used(), before);
    }

    #[test]
    fn missing_function_returns_none() {
        let (mut host, oi) = host_with(&[]);
        assert!(matches!(host.call(oi, "nothing", &[]), Ok(None)));
    }

    #[test]
    fn string_element_write_is_copy_on_write() {
        init();
        let mut host = Host::new("create", false);
        let mut cb = ControlBuilder::new();
        cb.variable(b"g", T_STRING);
        let abc = cb.string(b"abc") as u8;

        let mut c = CodeBuilder::new();
        c.push_string(abc);
        c.store_global(0, true);
        c.push_global(0);
        c.store_local(-1, true);
        // s[1] = 'x' rebinds the local to a fresh string
        c.push_local(-1);
        c.push_int(1);
        c.push_int(b'x' as i32);
        c.store_local_index(-1, true);
        c.push_local(-1);
        c.ret();
        cb.function(
            b"run",
            FnClass::empty(),
            c.finish(&mixed_proto(0, &[]), 8, 1),
        );

        let mut c = CodeBuilder::new();
        c.push_global(0);
        c.ret();
        cb.function(
            b"get",
            FnClass::empty(),
            c.finish(&mixed_proto(0, &[]), 4, 0),
        );
        let oi = host.load_object("cow", cb);

        let r = host.call(oi, "run", &[]).unwrap().unwrap();
        match r {
            Value::String(s) => {
                assert_eq!(unsafe { s.as_ref() }.text(), b"axc")
            }
            other => panic!("expected a string, got {other:?}"),
        }
        host.release(r);
        // any other holder of the old string still sees it unchanged
        let g = host.call(oi, "get", &[]).unwrap().unwrap();
        match g {
            Value::String(s) => {
                assert_eq!(unsafe { s.as_ref() }.text(), b"abc")
            }
            other => panic!("expected a string, got {other:?}"),
        }
        host.release(g);
    }

    #[test]
    fn tick_exhaustion_raises_and_unwinds() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                c.push_int(-1);
                c.push_int(10);
                c.rlimits(true);
                // 100-iteration countdown under a 10-tick budget
                c.push_int(100);
                c.store_local(-1, true);
                let top = c.label();
                let out = c.label();
                c.bind(top);
                c.push_local(-1);
                c.jump_zero(out);
                c.push_local(-1);
                c.push_int(1);
                c.call_ckfun(KF_SUB, 2, false);
                c.store_local(-1, true);
                c.jump(top);
                c.bind(out);
                c.push_int(0);
                c.ret();
                // continuation after the guarded body
                c.ret();
                c.finish(&mixed_proto(0, &[]), 8, 1)
            }),
        )]);
        let err = host.call(oi, "run", &[]).unwrap_err();
        assert_eq!(err.message, "Out of ticks");
        // the interpreter is healthy afterwards
        assert!(matches!(host.call(oi, "missing", &[]), Ok(None)));
    }

    #[test]
    fn atomic_rollback_and_commit() {
        init();
        let mut host = Host::new("create", false);
        let mut cb = ControlBuilder::new();
        cb.variable(b"g", T_INT);
        let boom = cb.string(b"boom") as u8;

        let mut c = CodeBuilder::new();
        c.push_int(1);
        c.store_global(0, true);
        c.push_string(boom);
        c.call_ckfun(KF_ERROR, 1, false);
        c.ret();
        cb.function(
            b"atomic_fail",
            FnClass::ATOMIC,
            c.finish(&mixed_proto(0, &[]), 8, 0),
        );

        let mut c = CodeBuilder::new();
        c.push_int(2);
        c.store_global(0, true);
        c.push_int(7);
        c.ret();
        cb.function(
            b"atomic_ok",
            FnClass::ATOMIC,
            c.finish(&mixed_proto(0, &[]), 8, 0),
        );

        let mut c = CodeBuilder::new();
        c.push_global(0);
        c.ret();
        cb.function(b"get", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 4, 0));

        let oi = host.load_object("atomic", cb);

        let err = host.call(oi, "atomic_fail", &[]).unwrap_err();
        assert_eq!(err.message, "boom");
        // the mutation was discarded
        assert!(matches!(host.call(oi, "get", &[]), Ok(Some(Value::Nil))));

        assert_eq!(expect_int(host.call(oi, "atomic_ok", &[])), 7);
        // the mutation was committed
        assert_eq!(expect_int(host.call(oi, "get", &[])), 2);
    }

    #[test]
    fn atomic_ticks_are_restored() {
        let (mut host, oi) = host_with(&[
            (
                "leaf",
                FnClass::ATOMIC,
                Box::new(|_| {
                    let mut c = CodeBuilder::new();
                    c.push_int(1);
                    c.ret();
                    c.finish(&mixed_proto(0, &[]), 4, 0)
                }),
            ),
            (
                "run",
                FnClass::empty(),
                Box::new(|_| {
                    let mut c = CodeBuilder::new();
                    c.push_int(-1);
                    c.push_int(2000);
                    c.rlimits(true);
                    c.call_afun(0, 0, true);
                    // plenty of budget must remain after the atomic call
                    c.push_int(150);
                    c.store_local(-1, true);
                    let top = c.label();
                    let out = c.label();
                    c.bind(top);
                    c.push_local(-1);
                    c.jump_zero(out);
                    c.push_local(-1);
                    c.push_int(1);
                    c.call_ckfun(KF_SUB, 2, false);
                    c.store_local(-1, true);
                    c.jump(top);
                    c.bind(out);
                    c.push_int(5);
                    c.ret();
                    // continuation after the guarded body
                    c.ret();
                    c.finish(&mixed_proto(0, &[]), 8, 1)
                }),
            ),
        ]);
        assert_eq!(expect_int(host.call(oi, "run", &[])), 5);
    }

    #[test]
    fn destruct_mid_call_sweeps_references() {
        init();
        let mut host = Host::new("create", false);
        let victim = host.load_object("victim", ControlBuilder::new());

        let mut cb = ControlBuilder::new();
        let was_nil = cb.string(b"was-nil") as u8;
        let was_obj = cb.string(b"was-obj") as u8;

        // atomic: destruct the argument, then read it again and raise
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.call_ckfun(KF_DESTRUCT, 1, true);
        c.push_local(0);
        let bad = c.label();
        c.jump_nonzero(bad);
        c.push_string(was_nil);
        c.call_ckfun(KF_ERROR, 1, false);
        c.ret();
        c.bind(bad);
        c.push_string(was_obj);
        c.call_ckfun(KF_ERROR, 1, false);
        c.ret();
        let image = c.finish(
            &make_proto(FnClass::ATOMIC, 1, 0, T_VOID, &[T_OBJECT]),
            8,
            0,
        );
        cb.function(b"kill", FnClass::ATOMIC, image);

        // catch the raise, then look at the original argument slot
        let mut c = CodeBuilder::new();
        let handler = c.label();
        c.catch(handler, true);
        c.push_local(0);
        c.call_afun(0, 1, true);
        c.ret();
        c.bind(handler);
        c.push_local(0);
        c.ret();
        let image = c.finish(
            &make_proto(FnClass::empty(), 1, 0, T_MIXED, &[T_MIXED]),
            8,
            0,
        );
        cb.function(b"mid", FnClass::empty(), image);

        let oi = host.load_object("killer", cb);
        let arg = Value::Object(host.otable.oref(victim));
        let r = host.call(oi, "mid", &[arg]).unwrap();
        // the destructed object reads as nil, both inside the atomic
        // callee and in the caller's argument slot after the unwind
        assert!(matches!(r, Some(Value::Nil)), "got {r:?}");
    }

    #[test]
    fn catch_captures_error_string() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|cb| {
                let oops = cb.string(b"oops") as u8;
                let mut c = CodeBuilder::new();
                let handler = c.label();
                c.catch(handler, false);
                c.push_string(oops);
                c.call_ckfun(KF_ERROR, 1, false);
                c.ret();
                c.bind(handler);
                c.ret();
                c.finish(&mixed_proto(0, &[]), 8, 0)
            }),
        )]);
        let before = heap::dynamic_used();
        let r = host.call(oi, "run", &[]).unwrap().unwrap();
        match r {
            Value::String(s) => {
                assert_eq!(unsafe { s.as_ref() }.text(), b"oops")
            }
            other => panic!("expected a string, got {other:?}"),
        }
        host.release(r);
        assert_eq!(heap::dynamic_used(), before);
    }

    #[test]
    fn switch_selects_matching_branches() {
        let (mut host, oi) = host_with(&[(
            "pick",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                let (one, five, dflt) = (c.label(), c.label(), c.label());
                c.push_local(0);
                c.switch_int(&[(1, one), (5, five)], dflt, 2);
                c.bind(one);
                c.push_int(10);
                c.ret();
                c.bind(five);
                c.push_int(50);
                c.ret();
                c.bind(dflt);
                c.push_int(-1);
                c.ret();
                c.finish(
                    &make_proto(FnClass::empty(), 1, 0, T_INT, &[T_INT]),
                    8,
                    0,
                )
            }),
        )]);
        assert_eq!(expect_int(host.call(oi, "pick", &[Value::Int(1)])), 10);
        assert_eq!(expect_int(host.call(oi, "pick", &[Value::Int(5)])), 50);
        assert_eq!(expect_int(host.call(oi, "pick", &[Value::Int(3)])), -1);
    }

    #[test]
    fn range_switch_and_string_switch() {
        init();
        let mut host = Host::new("create", false);
        // an inherited base keeps the program's own inherit index off
        // zero, which the string-switch nil flag reserves
        let base = host.load_object("switchbase", ControlBuilder::new());
        let mut cb = ControlBuilder::new();
        cb.inherit(base);
        let alpha = cb.string(b"alpha");
        let beta = cb.string(b"beta");

        let mut c = CodeBuilder::new();
        let (low, high, dflt) = (c.label(), c.label(), c.label());
        c.push_local(0);
        c.switch_range(&[(0, 9, low), (10, 99, high)], dflt, 2);
        c.bind(low);
        c.push_int(1);
        c.ret();
        c.bind(high);
        c.push_int(2);
        c.ret();
        c.bind(dflt);
        c.push_int(3);
        c.ret();
        cb.function(
            b"ranges",
            FnClass::empty(),
            c.finish(&make_proto(FnClass::empty(), 1, 0, T_INT, &[T_INT]), 8, 0),
        );

        let mut c = CodeBuilder::new();
        let (a, b, nil, dflt) = (c.label(), c.label(), c.label(), c.label());
        c.push_local(0);
        // entries ordered by content; inherit is the program itself
        c.switch_str(&[(1, alpha, a), (1, beta, b)], Some(nil), dflt);
        c.bind(a);
        c.push_int(1);
        c.ret();
        c.bind(b);
        c.push_int(2);
        c.ret();
        c.bind(nil);
        c.push_int(0);
        c.ret();
        c.bind(dflt);
        c.push_int(-1);
        c.ret();
        cb.function(
            b"strings",
            FnClass::empty(),
            c.finish(&mixed_proto(1, &[T_MIXED]), 8, 0),
        );
        let oi = host.load_object("switches", cb);

        assert_eq!(expect_int(host.call(oi, "ranges", &[Value::Int(7)])), 1);
        assert_eq!(expect_int(host.call(oi, "ranges", &[Value::Int(42)])), 2);
        assert_eq!(expect_int(host.call(oi, "ranges", &[Value::Int(-3)])), 3);

        let s = object::str_new(b"beta");
        unsafe { object::str_ref(s) };
        assert_eq!(
            expect_int(host.call(oi, "strings", &[Value::String(s)])),
            2
        );
        unsafe { object::str_del(s) };
        assert_eq!(expect_int(host.call(oi, "strings", &[Value::Nil])), 0);
        assert_eq!(expect_int(host.call(oi, "strings", &[Value::Int(9)])), -1);
    }

    #[test]
    fn argument_adaptation() {
        init();
        let mut host = Host::new("create", false);
        let mut cb = ControlBuilder::new();

        // two(a, b): return b
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.ret();
        cb.function(
            b"two",
            FnClass::empty(),
            c.finish(
                &make_proto(FnClass::empty(), 2, 0, T_INT, &[T_INT, T_INT]),
                4,
                0,
            ),
        );

        // first(a, b): return a
        let mut c = CodeBuilder::new();
        c.push_local(1);
        c.ret();
        cb.function(
            b"first",
            FnClass::empty(),
            c.finish(
                &make_proto(FnClass::empty(), 2, 0, T_INT, &[T_INT, T_INT]),
                4,
                0,
            ),
        );

        // rest(a, tail...): return the packed tail
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.ret();
        cb.function(
            b"rest",
            FnClass::ELLIPSIS,
            c.finish(
                &make_proto(
                    FnClass::ELLIPSIS,
                    2,
                    0,
                    T_MIXED,
                    &[T_MIXED, T_MIXED],
                ),
                4,
                0,
            ),
        );
        let oi = host.load_object("args", cb);

        // missing arguments fill with typed zero
        assert_eq!(expect_int(host.call(oi, "two", &[Value::Int(7)])), 0);
        assert_eq!(expect_int(host.call(oi, "first", &[Value::Int(7)])), 7);
        // excess arguments pop in lax mode
        assert_eq!(
            expect_int(host.call(
                oi,
                "first",
                &[Value::Int(1), Value::Int(2), Value::Int(3)]
            )),
            1
        );
        // the ellipsis tail packs into an array
        let r = host
            .call(
                oi,
                "rest",
                &[
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(3),
                    Value::Int(4),
                ],
            )
            .unwrap()
            .unwrap();
        match r {
            Value::Array(a) => unsafe {
                assert_eq!((*a.as_ptr()).size, 3);
                assert!(matches!(*(*a.as_ptr()).elts, Value::Int(2)));
                assert!(matches!(*(*a.as_ptr()).elts.add(2), Value::Int(4)));
            },
            other => panic!("expected an array, got {other:?}"),
        }
        host.release(r);
    }

    #[test]
    fn strict_mode_rejects_excess_arguments() {
        init();
        let mut host = Host::new("create", true);
        let mut cb = ControlBuilder::new();
        let mut c = CodeBuilder::new();
        c.push_int(0);
        c.ret();
        cb.function(
            b"one",
            FnClass::empty(),
            c.finish(&make_proto(FnClass::empty(), 1, 0, T_INT, &[T_INT]), 4, 0),
        );
        let oi = host.load_object("strict", cb);
        let err = host
            .call(oi, "one", &[Value::Int(1), Value::Int(2)])
            .unwrap_err();
        assert!(err.message.starts_with("Too many arguments"));
    }

    #[test]
    fn typechecked_function_rejects_bad_arguments() {
        let (mut host, oi) = host_with(&[(
            "wants_string",
            FnClass::TYPECHECKED,
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                c.push_int(1);
                c.ret();
                c.finish(
                    &make_proto(
                        FnClass::TYPECHECKED,
                        1,
                        0,
                        T_INT,
                        &[T_STRING],
                    ),
                    4,
                    0,
                )
            }),
        )]);
        let err = host
            .call(oi, "wants_string", &[Value::Int(5)])
            .unwrap_err();
        assert_eq!(
            err.message,
            "Bad argument 1 (int) for function wants_string"
        );
        // nil satisfies a reference type in lax mode
        assert_eq!(
            expect_int(host.call(oi, "wants_string", &[Value::Nil])),
            1
        );
    }

    #[test]
    fn aggregates_index_and_stores() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                // a = ({ 10, 20, 30 }); a[1] = 21; return a[1] + a[2]
                c.push_int(10);
                c.push_int(20);
                c.push_int(30);
                c.aggregate(false, 3, false);
                c.store_local(-1, true);
                c.push_local(-1);
                c.push_int(1);
                c.push_int(21);
                c.store_index(true);
                c.push_local(-1);
                c.push_int(1);
                c.index(false);
                c.push_local(-1);
                c.push_int(2);
                c.index(false);
                c.call_ckfun(KF_ADD, 2, false);
                c.ret();
                c.finish(&mixed_proto(0, &[]), 12, 1)
            }),
        )]);
        let before = heap::dynamic_used();
        assert_eq!(expect_int(host.call(oi, "run", &[])), 51);
        assert_eq!(heap::dynamic_used(), before);
    }

    #[test]
    fn mapping_aggregate_index_and_delete() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                // m = ([ 1: 10, 2: 20 ]); m[3] = 30; m[2] = nil deletes
                // the entry; return m[3] + m[1]
                c.push_int(1);
                c.push_int(10);
                c.push_int(2);
                c.push_int(20);
                c.aggregate(true, 4, false);
                c.store_local(-1, true);
                c.push_local(-1);
                c.push_int(3);
                c.push_int(30);
                c.store_index(true);
                c.push_local(-1);
                c.push_int(2);
                c.push_int(0);
                c.store_index(true);
                c.push_local(-1);
                c.push_int(3);
                c.index(false);
                c.push_local(-1);
                c.push_int(1);
                c.index(false);
                c.call_ckfun(KF_ADD, 2, false);
                c.ret();
                c.finish(&mixed_proto(0, &[]), 12, 1)
            }),
        )]);
        let before = heap::dynamic_used();
        assert_eq!(expect_int(host.call(oi, "run", &[])), 40);
        assert_eq!(heap::dynamic_used(), before);
    }

    #[test]
    fn spread_expands_call_arguments() {
        let (mut host, oi) = host_with(&[
            (
                "pair",
                FnClass::empty(),
                Box::new(|_| {
                    let mut c = CodeBuilder::new();
                    c.push_local(1);
                    c.push_local(0);
                    c.call_ckfun(KF_SUB, 2, false);
                    c.ret();
                    c.finish(
                        &make_proto(
                            FnClass::empty(),
                            2,
                            0,
                            T_INT,
                            &[T_INT, T_INT],
                        ),
                        6,
                        0,
                    )
                }),
            ),
            (
                "run",
                FnClass::empty(),
                Box::new(|_| {
                    let mut c = CodeBuilder::new();
                    // pair(({ 9, 4 })...) == 9 - 4
                    c.push_int(9);
                    c.push_int(4);
                    c.aggregate(false, 2, false);
                    c.spread(-1);
                    c.call_afun(0, 1, false);
                    c.ret();
                    c.finish(&mixed_proto(0, &[]), 12, 0)
                }),
            ),
        ]);
        assert_eq!(expect_int(host.call(oi, "run", &[])), 5);
    }

    #[test]
    fn inherited_globals_and_calls() {
        init();
        let mut host = Host::new("create", false);

        let mut base = ControlBuilder::new();
        base.variable(b"b", T_INT);
        let mut c = CodeBuilder::new();
        c.push_global(0);
        c.ret();
        base.function(b"base_get", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 4, 0));
        let bi = host.load_object("base", base);

        let mut derived = ControlBuilder::new();
        derived.inherit(bi);
        let mut c = CodeBuilder::new();
        // write the inherited variable, then read it back two ways
        c.push_int(11);
        c.store_far_global(0, 0, true);
        c.push_far_global(0, 0);
        c.call_dfun(0, 0, 0, false);
        c.call_ckfun(KF_ADD, 2, false);
        c.ret();
        derived.function(b"run", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 8, 0));
        let di = host.load_object("derived", derived);

        assert_eq!(expect_int(host.call(di, "run", &[])), 22);
        // the symbol table resolves inherited functions too
        assert_eq!(expect_int(host.call(di, "base_get", &[])), 11);
        // and the instanceof cache agrees on the inheritance
        assert_eq!(host.instance_of(di, "base"), 1);
        assert_eq!(host.instance_of(bi, "derived"), 0);
    }

    #[test]
    fn instanceof_and_class_cast() {
        init();
        let mut host = Host::new("create", false);

        let base = host.load_object("lineage", ControlBuilder::new());

        let mut cb = ControlBuilder::new();
        cb.inherit(base);
        let cls = cb.string(b"lineage");
        let mut c = CodeBuilder::new();
        // the class id names this program's string pool: inherit 1 (self)
        c.push_local(0);
        c.instance_of(1, cls, false);
        c.ret();
        cb.function(b"check", FnClass::empty(), c.finish(&mixed_proto(1, &[T_MIXED]), 6, 0));
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.cast(T_OBJECT, None, false);
        c.ret();
        cb.function(
            b"as_object",
            FnClass::empty(),
            c.finish(&mixed_proto(1, &[T_MIXED]), 6, 0),
        );
        let oi = host.load_object("tester", cb);

        let derived_ref = Value::Object(host.otable.oref(oi));
        assert_eq!(expect_int(host.call(oi, "check", &[derived_ref])), 1);
        let base_ref = Value::Object(host.otable.oref(base));
        assert_eq!(expect_int(host.call(oi, "check", &[base_ref])), 1);

        // a failed cast raises
        let ok = host
            .call(oi, "as_object", &[Value::Object(host.otable.oref(base))])
            .unwrap();
        assert!(matches!(ok, Some(Value::Object(_))));
        let err = host.call(oi, "as_object", &[Value::Int(3)]).unwrap_err();
        assert_eq!(err.message, "Value is not an object");
    }

    #[test]
    fn call_other_and_static_visibility() {
        init();
        let mut host = Host::new("create", false);

        let mut cb = ControlBuilder::new();
        let mut c = CodeBuilder::new();
        c.push_int(40);
        c.ret();
        cb.function(b"open", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 4, 0));
        let mut c = CodeBuilder::new();
        c.push_int(99);
        c.ret();
        cb.function(b"hidden", FnClass::STATIC, c.finish(&mixed_proto(0, &[]), 4, 0));
        let ti = host.load_object("target", cb);

        let mut cb = ControlBuilder::new();
        let open = cb.string(b"open");
        let hidden = cb.string(b"hidden");
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.push_far_string(0, open);
        c.call_ckfun(KF_CALL_OTHER, 2, false);
        c.ret();
        cb.function(b"call_open", FnClass::empty(), c.finish(&mixed_proto(1, &[T_MIXED]), 8, 0));
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.push_far_string(0, hidden);
        c.call_ckfun(KF_CALL_OTHER, 2, false);
        c.ret();
        cb.function(b"call_hidden", FnClass::empty(), c.finish(&mixed_proto(1, &[T_MIXED]), 8, 0));
        let ci = host.load_object("caller", cb);

        let t = Value::Object(host.otable.oref(ti));
        assert_eq!(expect_int(host.call(ci, "call_open", &[t])), 40);
        // a static function is invisible from the outside
        let t = Value::Object(host.otable.oref(ti));
        assert!(matches!(
            host.call(ci, "call_hidden", &[t]),
            Ok(Some(Value::Nil))
        ));
    }

    #[test]
    fn lightweight_object_calls_and_globals() {
        init();
        let mut host = Host::new("create", false);

        let mut cb = ControlBuilder::new();
        cb.variable(b"v", T_INT);
        let mut c = CodeBuilder::new();
        c.push_int(123);
        c.store_global(0, true);
        c.push_global(0);
        c.ret();
        cb.function(b"poke", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 8, 0));
        let mut c = CodeBuilder::new();
        c.push_global(0);
        c.ret();
        cb.function(b"peek", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 4, 0));
        let mi = host.load_object("master", cb);

        let mut cb = ControlBuilder::new();
        let poke = cb.string(b"poke");
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.call_ckfun(KF_NEW_OBJECT, 1, false);
        c.store_local(-1, true);
        c.push_local(-1);
        c.push_far_string(0, poke);
        c.call_ckfun(KF_CALL_OTHER, 2, false);
        c.ret();
        cb.function(b"run", FnClass::empty(), c.finish(&mixed_proto(1, &[T_MIXED]), 10, 1));
        let ci = host.load_object("lwuser", cb);

        let m = Value::Object(host.otable.oref(mi));
        // the lwobject's own variables take the write; the master's
        // dataspace never sees it
        assert_eq!(expect_int(host.call(ci, "run", &[m])), 123);
        assert!(matches!(
            host.call(mi, "peek", &[]),
            Ok(Some(Value::Nil))
        ));
    }

    #[test]
    fn driver_rewrites_errors_and_guards_rlimits() {
        init();
        let mut host = Host::new("create", false);

        let mut cb = ControlBuilder::new();
        let rewritten = cb.string(b"rewritten") as u8;
        let mut c = CodeBuilder::new();
        c.push_string(rewritten);
        c.ret();
        cb.function(
            b"runtime_error",
            FnClass::empty(),
            c.finish(&mixed_proto(3, &[T_MIXED, T_MIXED, T_MIXED]), 6, 0),
        );
        let mut c = CodeBuilder::new();
        c.push_int(0);
        c.ret();
        cb.function(
            b"runtime_rlimits",
            FnClass::empty(),
            c.finish(&mixed_proto(3, &[T_MIXED, T_MIXED, T_MIXED]), 6, 0),
        );
        let di = host.load_object("driver", cb);
        host.set_driver(di);

        let mut cb = ControlBuilder::new();
        let oops = cb.string(b"oops") as u8;
        let mut c = CodeBuilder::new();
        let handler = c.label();
        c.catch(handler, false);
        c.push_string(oops);
        c.call_ckfun(KF_ERROR, 1, false);
        c.ret();
        c.bind(handler);
        c.ret();
        cb.function(b"caught", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 8, 0));
        let mut c = CodeBuilder::new();
        c.push_int(-1);
        c.push_int(1000);
        c.rlimits(false);
        c.push_int(1);
        c.ret();
        // continuation after the guarded body
        c.ret();
        cb.function(b"guarded", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 8, 0));
        let oi = host.load_object("prog", cb);

        // the driver rewrote the caught error string
        let r = host.call(oi, "caught", &[]).unwrap().unwrap();
        match r {
            Value::String(s) => {
                assert_eq!(unsafe { s.as_ref() }.text(), b"rewritten")
            }
            other => panic!("expected a string, got {other:?}"),
        }
        host.release(r);

        // the driver denied the unprivileged rlimits
        let err = host.call(oi, "guarded", &[]).unwrap_err();
        assert_eq!(err.message, "rewritten");
    }

    #[test]
    fn composed_stores_unpack_value_arrays() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                // ({ a, b }) = ({ 5, 6 }); return a - b
                c.push_int(5);
                c.push_int(6);
                c.aggregate(false, 2, false);
                c.stores(2);
                c.store_local(-1, false);
                c.store_local(-2, true);
                c.push_local(-1);
                c.push_local(-2);
                c.call_ckfun(KF_SUB, 2, false);
                c.ret();
                c.finish(&mixed_proto(0, &[]), 12, 2)
            }),
        )]);
        // targets take the values back to front: the first target gets 6
        assert_eq!(expect_int(host.call(oi, "run", &[])), 1);
    }

    #[test]
    fn stores_spread_target_takes_the_tail() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                // rest = ({ 0, 0, 0 }); ({ a, rest... }) = ({ 1, 2, 3 });
                // return rest[1]
                c.push_int(0);
                c.push_int(0);
                c.push_int(0);
                c.aggregate(false, 3, false);
                c.store_local(-1, true);
                // the spread target array sits below the value array
                c.push_local(-1);
                c.push_int(1);
                c.push_int(2);
                c.push_int(3);
                c.aggregate(false, 3, false);
                c.stores(2);
                c.spread_target(0, 0, None);
                c.store_local(-2, true);
                c.push_local(-1);
                c.push_int(1);
                c.index(false);
                c.ret();
                c.finish(&mixed_proto(0, &[]), 12, 2)
            }),
        )]);
        assert_eq!(expect_int(host.call(oi, "run", &[])), 3);
    }

    #[test]
    fn lvalue_descriptors_store_through_kfuns() {
        init();
        let mut host = Host::new("create", false);

        unsafe fn kf_poke(
            f: *mut Frame,
            _nargs: usize,
        ) -> Result<(), KfunError> {
            // a precompiled-style store through a descriptor
            let v = *(*f).sp;
            crate::interpret::store_lvalue(f, Lvalue::Local(-1), &v);
            pop(f, 1);
            push_value(f, &Value::Int(1));
            Ok(())
        }
        let poke = host.kfuns.register(Kfun {
            name: "poke",
            proto: make_proto(FnClass::empty(), 1, 0, T_INT, &[T_MIXED]),
            func: kf_poke,
        }) as u8;

        let mut cb = ControlBuilder::new();
        let mut c = CodeBuilder::new();
        c.push_int(42);
        c.call_ckfun(poke, 1, true);
        c.push_local(-1);
        c.ret();
        cb.function(b"run", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 8, 1));
        let oi = host.load_object("poker", cb);
        assert_eq!(expect_int(host.call(oi, "run", &[])), 42);
    }

    #[test]
    fn call_trace_reports_the_chain() {
        init();
        let mut host = Host::new("create", false);
        let mut cb = ControlBuilder::new();
        cb.string(b"ignored");
        let mut c = CodeBuilder::new();
        c.line(3);
        c.call_kfun(KF_CALL_TRACE, None, false);
        c.ret();
        cb.function(b"inner", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 6, 0));
        let mut c = CodeBuilder::new();
        c.call_afun(0, 0, false);
        c.ret();
        cb.function(b"outer", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 6, 0));
        let oi = host.load_object("traced", cb);

        let r = host.call(oi, "outer", &[]).unwrap().unwrap();
        match r {
            Value::Array(a) => unsafe {
                assert_eq!((*a.as_ptr()).size, 2);
                // each entry: objname, progname, funcname, line, external
                let inner = match *(*a.as_ptr()).elts.add(1) {
                    Value::Array(e) => e,
                    _ => panic!("trace entry is not an array"),
                };
                let fname = match *(*inner.as_ptr()).elts.add(2) {
                    Value::String(s) => s,
                    _ => panic!("missing function name"),
                };
                assert_eq!(fname.as_ref().text(), b"inner");
                assert!(matches!(
                    *(*inner.as_ptr()).elts.add(3),
                    Value::Int(3)
                ));
                assert!(matches!(
                    *(*inner.as_ptr()).elts.add(4),
                    Value::Int(0)
                ));
            },
            other => panic!("expected an array, got {other:?}"),
        }
        host.release(r);
    }

    #[test]
    fn floats_push_and_compare_to_zero() {
        let (mut host, oi) = host_with(&[(
            "run",
            FnClass::empty(),
            Box::new(|_| {
                let mut c = CodeBuilder::new();
                let (t, end) = (c.label(), c.label());
                c.push_float(0x3ff0, 1);
                c.jump_nonzero(t);
                c.push_int(0);
                c.jump(end);
                c.bind(t);
                c.push_float(0, 0);
                let f = c.label();
                let e2 = c.label();
                c.jump_zero(f);
                c.push_int(-1);
                c.jump(e2);
                c.bind(f);
                c.push_int(1);
                c.bind(e2);
                c.bind(end);
                c.ret();
                c.finish(&mixed_proto(0, &[]), 8, 0)
            }),
        )]);
        assert_eq!(expect_int(host.call(oi, "run", &[])), 1);
    }

    #[test]
    fn previous_object_sees_the_caller() {
        init();
        let mut host = Host::new("create", false);

        let mut cb = ControlBuilder::new();
        let mut c = CodeBuilder::new();
        c.push_int(0);
        c.call_ckfun(KF_PREVIOUS_OBJECT, 1, false);
        c.ret();
        cb.function(b"who", FnClass::empty(), c.finish(&mixed_proto(0, &[]), 6, 0));
        let ti = host.load_object("callee", cb);

        let mut cb = ControlBuilder::new();
        let who = cb.string(b"who");
        let mut c = CodeBuilder::new();
        c.push_local(0);
        c.push_far_string(0, who);
        c.call_ckfun(KF_CALL_OTHER, 2, false);
        c.ret();
        cb.function(b"run", FnClass::empty(), c.finish(&mixed_proto(1, &[T_MIXED]), 8, 0));
        let ci = host.load_object("caller2", cb);

        let t = Value::Object(host.otable.oref(ti));
        let r = host.call(ci, "run", &[t]).unwrap().unwrap();
        match r {
            Value::Object(o) => assert_eq!(o.index, ci),
            other => panic!("expected an object, got {other:?}"),
        }
    }
}
