use object::T_CLASS;

use crate::op::{
    Op, LINE_MASK, LINE_SHIFT, POP_BIT, SWITCH_INT, SWITCH_RANGE,
    SWITCH_STRING,
};
use crate::proto::PROTO_ARGS_AT;

/// A forward or backward jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembles one function image: prototype, stack depth, local count, code
/// and the line-number stream. Stands in for the code generator, which is
/// not part of this runtime; the loader and the tests feed its output to
/// the interpreter.
pub struct CodeBuilder {
    code: Vec<u8>,
    numbers: Vec<u8>,
    line: u16,
    last_line: u16,
    labels: Vec<Option<u16>>,
    patches: Vec<(usize, usize)>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        CodeBuilder {
            code: Vec::new(),
            numbers: Vec::new(),
            line: 0,
            last_line: 0,
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Set the source line for the instructions that follow.
    pub fn line(&mut self, line: u16) {
        self.line = line;
    }

    /// Current code offset.
    pub fn here(&self) -> u16 {
        self.code.len() as u16
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, l: Label) {
        debug_assert!(self.labels[l.0].is_none(), "label bound twice");
        self.labels[l.0] = Some(self.code.len() as u16);
    }

    fn emit_op(&mut self, op: Op, pop: bool) {
        let mut b = op as u8;
        if pop {
            debug_assert!(op.honours_pop());
            b |= POP_BIT;
        }
        let delta = self.line as i32 - self.last_line as i32;
        if (0..=2).contains(&delta) {
            b |= (delta as u8) << LINE_SHIFT;
        } else {
            b |= LINE_MASK;
            if (-64..=63).contains(&delta) {
                self.numbers.push((delta + 128 + 64) as u8);
            } else {
                let v = delta + 16384;
                self.numbers.push((v >> 8) as u8);
                self.numbers.push(v as u8);
            }
        }
        self.last_line = self.line;
        self.code.push(b);
    }

    fn u8_(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u16_(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn target(&mut self, l: Label) {
        self.patches.push((self.code.len(), l.0));
        self.code.extend_from_slice(&[0, 0]);
    }

    fn class_id(&mut self, inherit: u8, index: u16) {
        self.u8_(inherit);
        self.u16_(index);
    }

    // ── literal pushes ────────────────────────────────────────────────

    /// Push an integer, picking the narrowest encoding.
    pub fn push_int(&mut self, n: i32) {
        if let Ok(b) = i8::try_from(n) {
            self.emit_op(Op::PushInt1, false);
            self.code.push(b as u8);
        } else if let Ok(s) = i16::try_from(n) {
            self.emit_op(Op::PushInt2, false);
            self.u16_(s as u16);
        } else {
            self.emit_op(Op::PushInt4, false);
            self.code.extend_from_slice(&n.to_be_bytes());
        }
    }

    pub fn push_float(&mut self, high: u16, low: u32) {
        self.emit_op(Op::PushFloat6, false);
        self.u16_(high);
        self.code.extend_from_slice(&low.to_be_bytes());
    }

    pub fn push_string(&mut self, index: u8) {
        self.emit_op(Op::PushString, false);
        self.u8_(index);
    }

    pub fn push_near_string(&mut self, inherit: u8, index: u8) {
        self.emit_op(Op::PushNearString, false);
        self.u8_(inherit);
        self.u8_(index);
    }

    pub fn push_far_string(&mut self, inherit: u8, index: u16) {
        self.emit_op(Op::PushFarString, false);
        self.u8_(inherit);
        self.u16_(index);
    }

    // ── locals and globals ────────────────────────────────────────────

    pub fn push_local(&mut self, index: i8) {
        self.emit_op(Op::PushLocal, false);
        self.u8_(index as u8);
    }

    pub fn push_global(&mut self, index: u8) {
        self.emit_op(Op::PushGlobal, false);
        self.u8_(index);
    }

    pub fn push_far_global(&mut self, inherit: u8, index: u8) {
        self.emit_op(Op::PushFarGlobal, false);
        self.u8_(inherit);
        self.u8_(index);
    }

    pub fn store_local(&mut self, index: i8, pop: bool) {
        self.emit_op(Op::StoreLocal, pop);
        self.u8_(index as u8);
    }

    pub fn store_global(&mut self, index: u8, pop: bool) {
        self.emit_op(Op::StoreGlobal, pop);
        self.u8_(index);
    }

    pub fn store_far_global(&mut self, inherit: u8, index: u8, pop: bool) {
        self.emit_op(Op::StoreFarGlobal, pop);
        self.u8_(inherit);
        self.u8_(index);
    }

    // ── indexing ──────────────────────────────────────────────────────

    pub fn index(&mut self, pop: bool) {
        self.emit_op(Op::Index, pop);
    }

    pub fn index2(&mut self) {
        self.emit_op(Op::Index2, false);
    }

    pub fn store_index(&mut self, pop: bool) {
        self.emit_op(Op::StoreIndex, pop);
    }

    pub fn store_local_index(&mut self, index: i8, pop: bool) {
        self.emit_op(Op::StoreLocalIndex, pop);
        self.u8_(index as u8);
    }

    pub fn store_global_index(&mut self, index: u8, pop: bool) {
        self.emit_op(Op::StoreGlobalIndex, pop);
        self.u8_(index);
    }

    pub fn store_far_global_index(
        &mut self,
        inherit: u8,
        index: u8,
        pop: bool,
    ) {
        self.emit_op(Op::StoreFarGlobalIndex, pop);
        self.u8_(inherit);
        self.u8_(index);
    }

    pub fn store_index_index(&mut self, pop: bool) {
        self.emit_op(Op::StoreIndexIndex, pop);
    }

    // ── aggregates and spread ─────────────────────────────────────────

    pub fn aggregate(&mut self, mapping: bool, size: u16, pop: bool) {
        self.emit_op(Op::Aggregate, pop);
        self.u8_(mapping as u8);
        self.u16_(size);
    }

    /// Raw spread operand: -1 spreads every element; -2-n keeps the array
    /// on the stack for n following lvalue targets.
    pub fn spread(&mut self, operand: i8) {
        debug_assert!(operand < 0);
        self.emit_op(Op::Spread, false);
        self.u8_(operand as u8);
    }

    /// Spread as the leading target of a store sequence: assigns the tail
    /// of the value array into the target array from `offset` on.
    pub fn spread_target(
        &mut self,
        offset: u8,
        tp: u8,
        class: Option<(u8, u16)>,
    ) {
        self.emit_op(Op::Spread, false);
        self.u8_(offset);
        self.u8_(tp);
        if tp == T_CLASS {
            let (inherit, index) = class.unwrap();
            self.class_id(inherit, index);
        }
    }

    pub fn stores(&mut self, count: u8) {
        self.emit_op(Op::Stores, false);
        self.u8_(count);
    }

    // ── casts ─────────────────────────────────────────────────────────

    pub fn cast(&mut self, tp: u8, class: Option<(u8, u16)>, pop: bool) {
        self.emit_op(Op::Cast, pop);
        self.u8_(tp);
        if tp == T_CLASS {
            let (inherit, index) = class.unwrap();
            self.class_id(inherit, index);
        }
    }

    pub fn instance_of(&mut self, inherit: u8, index: u16, pop: bool) {
        self.emit_op(Op::InstanceOf, pop);
        self.class_id(inherit, index);
    }

    // ── control flow ──────────────────────────────────────────────────

    pub fn jump(&mut self, l: Label) {
        self.emit_op(Op::Jump, false);
        self.target(l);
    }

    pub fn jump_zero(&mut self, l: Label) {
        self.emit_op(Op::JumpZero, false);
        self.target(l);
    }

    pub fn jump_nonzero(&mut self, l: Label) {
        self.emit_op(Op::JumpNonzero, false);
        self.target(l);
    }

    /// Integer switch. Cases are sorted by value here; `sz` is the stored
    /// key width in bytes (1 to 4).
    pub fn switch_int(
        &mut self,
        cases: &[(i64, Label)],
        default: Label,
        sz: u8,
    ) {
        assert!((1..=4).contains(&sz));
        let mut cases: Vec<(i64, Label)> = cases.to_vec();
        cases.sort_by_key(|c| c.0);
        self.emit_op(Op::Switch, false);
        self.u8_(SWITCH_INT);
        self.u16_((cases.len() + 1) as u16);
        self.u8_(sz);
        self.target(default);
        for (value, l) in cases {
            self.key(value, sz);
            self.target(l);
        }
    }

    /// Range switch over sorted, disjoint `[low, high]` ranges.
    pub fn switch_range(
        &mut self,
        cases: &[(i64, i64, Label)],
        default: Label,
        sz: u8,
    ) {
        assert!((1..=4).contains(&sz));
        let mut cases: Vec<(i64, i64, Label)> = cases.to_vec();
        cases.sort_by_key(|c| c.0);
        self.emit_op(Op::Switch, false);
        self.u8_(SWITCH_RANGE);
        self.u16_((cases.len() + 1) as u16);
        self.u8_(sz);
        self.target(default);
        for (low, high, l) in cases {
            self.key(low, sz);
            self.key(high, sz);
            self.target(l);
        }
    }

    /// String switch. The caller supplies the cases ordered by string
    /// content; the entries name string constants as (inherit, index). A
    /// real first entry must not use inherit 0 — that byte position doubles
    /// as the nil-branch flag.
    pub fn switch_str(
        &mut self,
        cases: &[(u8, u16, Label)],
        nil: Option<Label>,
        default: Label,
    ) {
        let h = cases.len() + 1 + nil.is_some() as usize;
        self.emit_op(Op::Switch, false);
        self.u8_(SWITCH_STRING);
        self.u16_(h as u16);
        self.target(default);
        match nil {
            Some(l) => {
                self.u8_(0);
                self.target(l);
            }
            None => self.u8_(1),
        }
        for &(inherit, index, l) in cases {
            debug_assert!(nil.is_some() || inherit != 0);
            self.u8_(inherit);
            self.u16_(index);
            self.target(l);
        }
    }

    fn key(&mut self, value: i64, sz: u8) {
        for k in (0..sz).rev() {
            self.code.push((value >> (8 * k)) as u8);
        }
    }

    // ── calls ─────────────────────────────────────────────────────────

    /// `nargs` is emitted only for kfuns that take a variable number of
    /// arguments.
    pub fn call_kfun(&mut self, kfun: u8, nargs: Option<u8>, pop: bool) {
        self.emit_op(Op::CallKfun, pop);
        self.u8_(kfun);
        if let Some(n) = nargs {
            self.u8_(n);
        }
    }

    pub fn call_efun(&mut self, kfun: u16, nargs: Option<u8>, pop: bool) {
        self.emit_op(Op::CallEfun, pop);
        self.u16_(kfun);
        if let Some(n) = nargs {
            self.u8_(n);
        }
    }

    pub fn call_ckfun(&mut self, kfun: u8, nargs: u8, pop: bool) {
        self.emit_op(Op::CallCkfun, pop);
        self.u8_(kfun);
        self.u8_(nargs);
    }

    pub fn call_cefun(&mut self, kfun: u16, nargs: u8, pop: bool) {
        self.emit_op(Op::CallCefun, pop);
        self.u16_(kfun);
        self.u8_(nargs);
    }

    pub fn call_afun(&mut self, func: u8, nargs: u8, pop: bool) {
        self.emit_op(Op::CallAfun, pop);
        self.u8_(func);
        self.u8_(nargs);
    }

    pub fn call_dfun(&mut self, inherit: u8, func: u8, nargs: u8, pop: bool) {
        self.emit_op(Op::CallDfun, pop);
        self.u8_(inherit);
        self.u8_(func);
        self.u8_(nargs);
    }

    pub fn call_fun(&mut self, call: u16, nargs: u8, pop: bool) {
        self.emit_op(Op::CallFun, pop);
        self.u16_(call);
        self.u8_(nargs);
    }

    // ── scopes and return ─────────────────────────────────────────────

    pub fn catch(&mut self, handler: Label, pop: bool) {
        self.emit_op(Op::Catch, pop);
        self.target(handler);
    }

    pub fn rlimits(&mut self, privileged: bool) {
        self.emit_op(Op::Rlimits, false);
        self.u8_(privileged as u8);
    }

    pub fn ret(&mut self) {
        self.emit_op(Op::Return, false);
    }

    // ── assembly ──────────────────────────────────────────────────────

    /// Produce the function image: prototype, stack depth, local count,
    /// code size, code, numbers stream.
    pub fn finish(mut self, proto: &[u8], depth: u16, nlocals: u8) -> Vec<u8> {
        for (at, label) in self.patches.drain(..) {
            let offset =
                self.labels[label].expect("unbound label in finished code");
            self.code[at..at + 2].copy_from_slice(&offset.to_be_bytes());
        }
        debug_assert!(proto.len() >= PROTO_ARGS_AT);
        let mut image = Vec::with_capacity(
            proto.len() + 5 + self.code.len() + self.numbers.len(),
        );
        image.extend_from_slice(proto);
        image.extend_from_slice(&depth.to_be_bytes());
        image.push(nlocals);
        image.extend_from_slice(&(self.code.len() as u16).to_be_bytes());
        image.extend_from_slice(&self.code);
        image.extend_from_slice(&self.numbers);
        image
    }
}

impl Default for CodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
