use std::cell::RefCell;
use std::ptr::NonNull;

use bytecode::FnClass;
use object::{str_del, str_new, str_ref, Hashtab, Str};

/// One entry of a control block's inherit table.
#[derive(Debug, Clone)]
pub struct Inherit {
    /// The object whose program is inherited (the last entry names the
    /// program itself).
    pub oindex: u32,
    /// Where that program's function-call thunks start.
    pub funcoffset: u16,
    /// Where that program's variables start in the dataspace.
    pub varoffset: u16,
    /// Where that program's slice of the inherit map starts.
    pub progoffset: u16,
    /// Privately inherited.
    pub private: bool,
}

/// A function definition: class bits, the string constant holding the
/// name, and the offset of the function image in the program text.
#[derive(Debug, Clone)]
pub struct FuncDef {
    pub class: FnClass,
    pub inherit: u8,
    pub index: u16,
    pub offset: u16,
}

/// A variable definition.
#[derive(Debug, Clone)]
pub struct VarDef {
    pub class: u8,
    pub inherit: u8,
    pub index: u16,
    pub tp: u8,
}

/// A symbol-table entry: which inherit defines the function, and the
/// function's index among that program's definitions.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub inherit: u8,
    pub index: u8,
}

/// The immutable per-program data: inherit table and map, program text,
/// string pool, function and variable definitions, function-call thunks
/// and the runtime symbol table.
pub struct Control {
    pub inherits: Vec<Inherit>,
    pub imap: Vec<u8>,
    pub prog: Vec<u8>,
    pub strings: Vec<NonNull<Str>>,
    pub funcdefs: Vec<FuncDef>,
    pub vardefs: Vec<VarDef>,
    /// 2-byte (inherit, index) pairs, both unsigned.
    pub funcalls: Vec<u8>,
    pub symbols: RefCell<Hashtab<Symbol>>,
    pub nvariables: u16,
}

impl Control {
    /// The inherit index of the program itself.
    #[inline]
    pub fn self_index(&self) -> usize {
        self.inherits.len() - 1
    }

    /// Resolve a function name through the symbol table.
    pub fn symb(&self, name: &[u8]) -> Option<Symbol> {
        self.symbols.borrow_mut().lookup(name, true).copied()
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        for s in self.strings.drain(..) {
            unsafe { str_del(s) };
        }
    }
}

/// Assembles a control block the way the loader presents already-parsed
/// programs: string pool, function images, variables, inherits.
pub struct ControlBuilder {
    strings: Vec<Vec<u8>>,
    prog: Vec<u8>,
    funcdefs: Vec<FuncDef>,
    func_names: Vec<Vec<u8>>,
    vardefs: Vec<VarDef>,
    nvariables: u16,
    funcalls: Vec<u8>,
    inherited: Vec<u32>,
}

impl ControlBuilder {
    pub fn new() -> Self {
        ControlBuilder {
            strings: Vec::new(),
            prog: Vec::new(),
            funcdefs: Vec::new(),
            func_names: Vec::new(),
            vardefs: Vec::new(),
            nvariables: 0,
            funcalls: Vec::new(),
            inherited: Vec::new(),
        }
    }

    /// Add a string constant, reusing an existing pool entry.
    pub fn string(&mut self, s: &[u8]) -> u16 {
        if let Some(i) = self.strings.iter().position(|t| t.as_slice() == s) {
            return i as u16;
        }
        self.strings.push(s.to_vec());
        (self.strings.len() - 1) as u16
    }

    /// Inherit the program of an already-loaded object. Order matters:
    /// offsets accumulate in inherit order.
    pub fn inherit(&mut self, oindex: u32) {
        self.inherited.push(oindex);
    }

    /// Declare a variable of the program itself.
    pub fn variable(&mut self, name: &[u8], tp: u8) -> u16 {
        let index = self.string(name);
        self.vardefs.push(VarDef {
            class: 0,
            inherit: 0,
            index,
            tp,
        });
        self.nvariables += 1;
        self.nvariables - 1
    }

    /// Add a function image produced by [`bytecode::CodeBuilder::finish`].
    /// Returns the function's index among this program's definitions.
    pub fn function(
        &mut self,
        name: &[u8],
        class: FnClass,
        image: Vec<u8>,
    ) -> u8 {
        let offset = self.prog.len();
        assert!(offset + image.len() <= u16::MAX as usize, "program too big");
        let index = self.string(name);
        self.prog.extend_from_slice(&image);
        self.funcdefs.push(FuncDef {
            class,
            inherit: 0,
            index,
            offset: offset as u16,
        });
        self.func_names.push(name.to_vec());
        (self.funcdefs.len() - 1) as u8
    }

    /// Add a function-call thunk; returns its index for `CALL_FUNC`.
    pub fn funcall_entry(&mut self, inherit: u8, index: u8) -> u16 {
        let at = self.funcalls.len() / 2;
        self.funcalls.push(inherit);
        self.funcalls.push(index);
        at as u16
    }

    pub(crate) fn inherited_objects(&self) -> &[u32] {
        &self.inherited
    }

    /// Resolve the builder into a control block. `inherited` describes the
    /// inherited programs in the same order [`inherit`](Self::inherit) was
    /// called; offsets and the inherit map accumulate in that order, the
    /// program itself last. The string pool is allocated from the static
    /// pool.
    pub(crate) fn build(
        mut self,
        self_oindex: u32,
        inherited: &[InheritedInfo],
    ) -> Control {
        debug_assert_eq!(inherited.len(), self.inherited.len());
        let ninherits = inherited.len() + 1;
        let mut inherits = Vec::with_capacity(ninherits);
        let mut imap: Vec<u8> = Vec::new();
        let mut varoffset = 0u16;
        let mut funcoffset = 0u16;
        for (i, info) in inherited.iter().enumerate() {
            inherits.push(Inherit {
                oindex: info.oindex,
                funcoffset,
                varoffset,
                progoffset: imap.len() as u16,
                private: false,
            });
            imap.push(i as u8);
            varoffset += info.nvariables;
            funcoffset += info.nfuncalls;
        }
        inherits.push(Inherit {
            oindex: self_oindex,
            funcoffset,
            varoffset,
            progoffset: imap.len() as u16,
            private: false,
        });
        // the program's own slice of the map covers every inherit
        for i in 0..ninherits {
            imap.push(i as u8);
        }

        heap::mstatic();
        let strings: Vec<NonNull<Str>> = self
            .strings
            .iter()
            .map(|s| {
                let h = str_new(s);
                unsafe { str_ref(h) };
                h
            })
            .collect();
        heap::mdynamic();

        let nsymb = (self.funcdefs.len()
            + inherited.iter().map(|i| i.functions.len()).sum::<usize>())
        .max(1);
        let symbols = RefCell::new(Hashtab::new(nsymb, 64, false));
        {
            let mut tab = symbols.borrow_mut();
            // later inserts land at the bucket head, so the program's own
            // functions shadow inherited ones of the same name
            for (i, info) in inherited.iter().enumerate() {
                for (name, index) in &info.functions {
                    tab.insert(name, Symbol {
                        inherit: i as u8,
                        index: *index,
                    });
                }
            }
            for (i, name) in self.func_names.iter().enumerate() {
                tab.insert(name, Symbol {
                    inherit: (ninherits - 1) as u8,
                    index: i as u8,
                });
            }
        }

        let self_inherit = (ninherits - 1) as u8;
        for fd in self.funcdefs.iter_mut() {
            fd.inherit = self_inherit;
        }
        for vd in self.vardefs.iter_mut() {
            vd.inherit = self_inherit;
        }

        Control {
            inherits,
            imap,
            prog: self.prog,
            strings,
            funcdefs: self.funcdefs,
            vardefs: self.vardefs,
            funcalls: self.funcalls,
            symbols,
            nvariables: varoffset + self.nvariables,
        }
    }
}

/// What the builder needs to know about an inherited program.
pub(crate) struct InheritedInfo {
    pub oindex: u32,
    pub nvariables: u16,
    /// Thunk pairs contributed, for the function-call offset.
    pub nfuncalls: u16,
    /// Function names and indices, for the merged symbol table.
    pub functions: Vec<(Vec<u8>, u8)>,
}

impl Default for ControlBuilder {
    fn default() -> Self {
        Self::new()
    }
}
