/// Bytecode emission machinery behind the parser.
///
/// Expressions are compiled through a stack of operand descriptors rather
/// than an AST. Each descriptor names where a value lives (local,
/// constant, temporary register, a property/element reference with its
/// base, `this`, or an up-value); baking a descriptor emits whatever load
/// materializes it into a register. Temporaries are allocated downward
/// from register 127 and a final pass remaps them into the contiguous
/// range just above the declared locals.
///
/// Every emission primitive short-circuits once a parse error has been
/// recorded, so a failed parse produces diagnostics but no code.

use crate::atom::Atom;
use crate::bytecode::{
    self, byte_from_op, constant_size, layout, BuiltinConstant, Op, MAX_JUMP, MAX_REGISTER,
};
use crate::error::{ParseErrorEntry, ParseErrorList};
use crate::gc::ObjId;
use crate::object::{function_object, mater_object, FunctionBody, UpValueDesc};
use crate::program::Program;
use crate::runtime::Environment;
use crate::value::Value;
use std::rc::Rc;

/// A one-byte operand: register (0..=127) or constant id, with the atom
/// payload for the inline-atom constant forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOrConst {
    raw: u8,
    is_reg: bool,
    atom: Atom,
}

impl RegOrConst {
    pub fn reg(r: u8) -> RegOrConst {
        debug_assert!(r <= MAX_REGISTER);
        RegOrConst {
            raw: r,
            is_reg: true,
            atom: Atom::NONE,
        }
    }

    pub fn constant(id: u8, atom: Atom) -> RegOrConst {
        debug_assert!(id <= MAX_REGISTER);
        RegOrConst {
            raw: id,
            is_reg: false,
            atom,
        }
    }

    pub fn is_reg(self) -> bool {
        self.is_reg
    }

    pub fn raw(self) -> u8 {
        self.raw
    }

    /// The operand byte: registers pass through, constants are offset
    /// past the register space.
    pub fn index(self) -> u8 {
        if self.is_reg {
            self.raw
        } else {
            self.raw + MAX_REGISTER + 1
        }
    }

    fn is_short_atom(self) -> bool {
        !self.is_reg && self.raw == BuiltinConstant::AtomShort as u8
    }

    fn is_long_atom(self) -> bool {
        !self.is_reg && self.raw == BuiltinConstant::AtomLong as u8
    }

    fn push(self, code: &mut Vec<u8>) {
        code.push(self.index());
        if self.is_short_atom() {
            debug_assert!(self.atom.raw() < 256);
            code.push(self.atom.raw() as u8);
        } else if self.is_long_atom() {
            code.push((self.atom.raw() >> 8) as u8);
            code.push(self.atom.raw() as u8);
        }
    }
}

impl Default for RegOrConst {
    fn default() -> RegOrConst {
        RegOrConst::constant(BuiltinConstant::Undefined as u8, Atom::NONE)
    }
}

/// A jump label: the code offset it names, a unique id, and the offset of
/// a matched (to-be-patched) jump instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Label {
    pub label: i32,
    pub unique_id: u32,
    pub matched_addr: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackType {
    Unknown,
    Local,
    Constant,
    Register,
    RefK,
    PropRef,
    EltRef,
    This,
    UpValue,
}

#[derive(Debug, Clone, Copy)]
struct StackEntry {
    ty: StackType,
    reg: RegOrConst,
    deref_reg: RegOrConst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    MustBeLocal,
    MightBeLocal,
    NotLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefType {
    Prop,
    Elt,
}

/// Per-function compilation state.
struct FunctionEntry {
    obj: ObjId,
    code: Vec<u8>,
    constants: Vec<Value>,
    locals: Vec<Atom>,
    upvalues: Vec<UpValueDesc>,
    formal_param_count: u16,
    next_reg: u8,
    min_reg: u8,
    ctor: bool,
}

impl FunctionEntry {
    fn new(obj: ObjId, ctor: bool) -> FunctionEntry {
        FunctionEntry {
            obj,
            code: Vec::new(),
            constants: Vec::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            formal_param_count: 0,
            next_reg: MAX_REGISTER,
            min_reg: MAX_REGISTER + 1,
            ctor,
        }
    }

    fn add_local(&mut self, atom: Atom) -> Option<u16> {
        if self.locals.contains(&atom) {
            return None;
        }
        self.locals.push(atom);
        Some(self.locals.len() as u16 - 1)
    }

    fn local_index(&self, atom: Atom) -> Option<u32> {
        self.locals.iter().position(|a| *a == atom).map(|i| i as u32)
    }

    fn add_upvalue(&mut self, index: u32, frame: u16, name: Atom) -> u32 {
        let entry = UpValueDesc { index, frame, name };
        if let Some(pos) = self.upvalues.iter().position(|u| *u == entry) {
            return pos as u32;
        }
        self.upvalues.push(entry);
        self.upvalues.len() as u32 - 1
    }
}

pub struct Codegen<'e, 'p> {
    pub env: &'e mut Environment,
    pub program: &'p mut Program,

    functions: Vec<FunctionEntry>,
    classes: Vec<ObjId>,
    stack: Vec<StackEntry>,

    deferred: bool,
    deferred_code: Vec<u8>,
    deferred_blocks: Vec<usize>,

    next_label_id: u32,
    emitted_lineno: i32,
    pub lineno: u32,

    pub errors: ParseErrorList,
}

impl<'e, 'p> Codegen<'e, 'p> {
    pub fn new(env: &'e mut Environment, program: &'p mut Program) -> Codegen<'e, 'p> {
        let main = program.main;
        let mut gen = Codegen {
            env,
            program,
            functions: Vec::new(),
            classes: Vec::new(),
            stack: Vec::new(),
            deferred: false,
            deferred_code: Vec::new(),
            deferred_blocks: Vec::new(),
            next_label_id: 1,
            emitted_lineno: -1,
            lineno: 1,
            errors: Vec::new(),
        };
        gen.functions.push(FunctionEntry::new(main, false));
        gen
    }

    pub fn nerrors(&self) -> usize {
        self.errors.len()
    }

    pub fn print_error(&mut self, message: &str) {
        let formatted = crate::error::Error::Parse.format(self.lineno, message);
        self.env.system.print(&format!("***** {}", formatted));
        self.errors
            .push(ParseErrorEntry::new(message, self.lineno, 1, 1));
    }

    fn current(&mut self) -> &mut FunctionEntry {
        self.functions.last_mut().expect("function entry")
    }

    fn current_ref(&self) -> &FunctionEntry {
        self.functions.last().expect("function entry")
    }

    fn code_len(&self) -> usize {
        if self.deferred {
            self.deferred_code.len()
        } else {
            self.current_ref().code.len()
        }
    }

    // ── Labels and jumps ────────────────────────────────────────────────

    pub fn label(&mut self) -> Label {
        let mut label = Label::default();
        if self.nerrors() == 0 {
            label.label = self.code_len() as i32;
            label.unique_id = self.next_label_id;
            self.next_label_id += 1;
        }
        label
    }

    /// Emit `op` with a placeholder target, to be patched by one of the
    /// `match_jump` forms.
    pub fn add_matched_jump(&mut self, op: Op, label: &mut Label) {
        if self.nerrors() > 0 {
            return;
        }
        debug_assert!(matches!(op, Op::Jmp | Op::Jt | Op::Jf));

        let mut reg = RegOrConst::default();
        if op != Op::Jmp {
            reg = self.bake(false);
            self.pop();
        }
        label.matched_addr = self.code_len() as i32;
        if op == Op::Jmp {
            self.emit_sn(op, 0);
        } else {
            self.emit_rk_sn(op, reg, 0);
        }
    }

    /// Patch the matched jump to land at the current code offset.
    pub fn match_jump(&mut self, label: &Label) {
        if self.nerrors() > 0 {
            return;
        }
        let jump_addr = self.code_len() as i32 - label.matched_addr;
        self.do_match_jump(label.matched_addr, jump_addr);
    }

    /// Patch the matched jump to land at another label's position.
    pub fn match_jump_to_label(&mut self, label: &Label, dst: &Label) {
        if self.nerrors() > 0 {
            return;
        }
        let jump_addr = dst.label - label.matched_addr;
        self.do_match_jump(label.matched_addr, jump_addr);
    }

    /// Patch the matched jump to land at an explicit offset.
    pub fn match_jump_to_addr(&mut self, label: &Label, dst: i32) {
        if self.nerrors() > 0 {
            return;
        }
        let jump_addr = dst - label.matched_addr;
        self.do_match_jump(label.matched_addr, jump_addr);
    }

    fn do_match_jump(&mut self, match_addr: i32, jump_addr: i32) {
        if self.nerrors() > 0 {
            return;
        }
        if jump_addr < -MAX_JUMP || jump_addr > MAX_JUMP {
            self.print_error("jump address too far");
            return;
        }
        let code: &mut Vec<u8> = if self.deferred {
            &mut self.deferred_code
        } else {
            &mut self.functions.last_mut().unwrap().code
        };
        let op = Op::from_u8(code[match_addr as usize]);
        debug_assert!(matches!(op, Op::Jmp | Op::Jt | Op::Jf));
        let emit_addr = if op == Op::Jmp {
            match_addr as usize + 1
        } else {
            match_addr as usize + 2
        };
        code[emit_addr] = (jump_addr >> 8) as u8;
        code[emit_addr + 1] = jump_addr as u8;
    }

    /// Emit a backward jump directly to a known label.
    pub fn jump_to_label(&mut self, op: Op, label: &Label) {
        if self.nerrors() > 0 {
            return;
        }
        debug_assert!(matches!(op, Op::Jmp | Op::Jt | Op::Jf));

        let mut reg = RegOrConst::default();
        if op != Op::Jmp {
            reg = self.bake(false);
            self.pop();
        }
        let jump_addr = label.label - self.code_len() as i32;
        if jump_addr < -MAX_JUMP || jump_addr > MAX_JUMP {
            self.print_error("jump address too far");
            return;
        }
        if op == Op::Jmp {
            self.emit_sn(op, jump_addr as i16);
        } else {
            self.emit_rk_sn(op, reg, jump_addr as i16);
        }
    }

    // ── Deferred emission ───────────────────────────────────────────────

    pub fn start_deferred(&mut self) -> i32 {
        debug_assert!(!self.deferred);
        self.deferred = true;
        self.deferred_blocks.push(self.deferred_code.len());
        self.deferred_code.len() as i32
    }

    pub fn resume_deferred(&mut self) -> i32 {
        debug_assert!(!self.deferred);
        self.deferred = true;
        self.deferred_code.len() as i32
    }

    pub fn end_deferred(&mut self) {
        debug_assert!(self.deferred);
        self.deferred = false;
    }

    /// Splice the current deferred block into the main stream, returning
    /// the offset it landed at.
    pub fn emit_deferred(&mut self) -> i32 {
        if self.nerrors() > 0 {
            return 0;
        }
        debug_assert!(!self.deferred);
        let block_start = self.deferred_blocks.pop().expect("deferred block");
        let start = self.current_ref().code.len() as i32;
        let tail: Vec<u8> = self.deferred_code.split_off(block_start);
        self.current().code.extend_from_slice(&tail);
        start
    }

    // ── Low-level emission ──────────────────────────────────────────────

    fn emit_lineno(&mut self) {
        let lineno = self.lineno;
        if lineno as i32 == self.emitted_lineno {
            return;
        }
        self.emitted_lineno = lineno as i32;
        self.add_code(Op::LineNo, &[], lineno as u16, true);
    }

    /// Append one instruction. `operands` follow the opcode's layout;
    /// `n` is the trailing number/params field when the layout has one.
    fn add_code(&mut self, mut op: Op, operands: &[RegOrConst], n: u16, has_n: bool) {
        if !matches!(op, Op::LineNo | Op::Jf | Op::Jt | Op::Jmp) {
            self.emit_lineno();
        }

        let mut imm = 0u8;
        if op == Op::Ret && n <= 3 && has_n {
            op = Op::RetI;
            imm = n as u8;
        }

        let lay = layout(op);
        let code: &mut Vec<u8> = if self.deferred {
            &mut self.deferred_code
        } else {
            &mut self.functions.last_mut().unwrap().code
        };
        code.push(byte_from_op(op, imm));

        let mut i = 0;
        for &flag in &[lay.a, lay.b, lay.c, lay.d] {
            if flag {
                operands[i].push(code);
                i += 1;
            }
        }

        if lay.number {
            code.push((n >> 8) as u8);
            code.push(n as u8);
        }
        if lay.params && op != Op::RetI {
            code.push(n as u8);
        }

        if matches!(op, Op::Jf | Op::Jt | Op::Jmp) {
            self.emit_lineno();
        }
    }

    fn emit_op(&mut self, op: Op) {
        self.add_code(op, &[], 0, false);
    }

    fn emit_r(&mut self, op: Op, a: RegOrConst) {
        self.add_code(op, &[a], 0, false);
    }

    fn emit_rr(&mut self, op: Op, a: RegOrConst, b: RegOrConst) {
        self.add_code(op, &[a, b], 0, false);
    }

    fn emit_rrr(&mut self, op: Op, a: RegOrConst, b: RegOrConst, c: RegOrConst) {
        self.add_code(op, &[a, b, c], 0, false);
    }

    fn emit_sn(&mut self, op: Op, n: i16) {
        self.add_code(op, &[], n as u16, true);
    }

    fn emit_rk_sn(&mut self, op: Op, b: RegOrConst, n: i16) {
        self.add_code(op, &[b], n as u16, true);
    }

    fn emit_params(&mut self, op: Op, n: u8) {
        self.add_code(op, &[], n as u16, true);
    }

    fn emit_r_params(&mut self, op: Op, a: RegOrConst, n: u8) {
        self.add_code(op, &[a], n as u16, true);
    }

    fn emit_rr_params(&mut self, op: Op, a: RegOrConst, b: RegOrConst, n: u8) {
        self.add_code(op, &[a, b], n as u16, true);
    }

    // ── Constants ───────────────────────────────────────────────────────

    pub fn add_constant(&mut self, v: Value) -> RegOrConst {
        match &v {
            Value::Id(atom) => {
                let id = if atom.raw() < 256 {
                    BuiltinConstant::AtomShort
                } else {
                    BuiltinConstant::AtomLong
                };
                return RegOrConst::constant(id as u8, *atom);
            }
            Value::Null => {
                return RegOrConst::constant(BuiltinConstant::Null as u8, Atom::NONE);
            }
            Value::Undefined => {
                return RegOrConst::default();
            }
            Value::Integer(0) => {
                return RegOrConst::constant(BuiltinConstant::Int0 as u8, Atom::NONE);
            }
            Value::Integer(1) => {
                return RegOrConst::constant(BuiltinConstant::Int1 as u8, Atom::NONE);
            }
            _ => {}
        }

        let offset = bytecode::builtin_constant_offset();
        let constants = &mut self.functions.last_mut().unwrap().constants;
        for (id, existing) in constants.iter().enumerate() {
            if *existing == v {
                return RegOrConst::constant(id as u8 + offset, Atom::NONE);
            }
        }
        if constants.len() + offset as usize > MAX_REGISTER as usize {
            self.print_error("too many constants in function");
            return RegOrConst::default();
        }
        constants.push(v);
        let id = constants.len() as u8 - 1 + offset;
        RegOrConst::constant(id, Atom::NONE)
    }

    pub fn push_k(&mut self, v: Value) {
        if self.nerrors() > 0 {
            return;
        }
        let reg = self.add_constant(v);
        self.push_entry(StackType::Constant, reg);
    }

    pub fn push_k_str(&mut self, s: &str) {
        if self.nerrors() > 0 {
            return;
        }
        let literal = self.program.add_string_literal(s);
        self.push_k(Value::StringLiteral(literal));
    }

    pub fn push_this(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        self.push_entry(StackType::This, RegOrConst::default());
    }

    pub fn push_tmp(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        self.push_register();
    }

    // ── Parse stack ─────────────────────────────────────────────────────

    fn push_entry(&mut self, ty: StackType, reg: RegOrConst) {
        debug_assert!(ty != StackType::Register);
        self.stack.push(StackEntry {
            ty,
            reg,
            deref_reg: RegOrConst::default(),
        });
    }

    fn push_register(&mut self) -> RegOrConst {
        let entry = self.functions.last_mut().unwrap();
        let reg = entry.next_reg;
        entry.next_reg = entry.next_reg.saturating_sub(1);
        if reg < entry.min_reg {
            entry.min_reg = reg;
        }
        let r = RegOrConst::reg(reg);
        self.stack.push(StackEntry {
            ty: StackType::Register,
            reg: r,
            deref_reg: RegOrConst::default(),
        });
        r
    }

    fn pop(&mut self) {
        let Some(top) = self.stack.pop() else { return };
        if top.ty == StackType::Register {
            let entry = self.functions.last_mut().unwrap();
            debug_assert!(entry.next_reg < MAX_REGISTER);
            entry.next_reg += 1;
        }
    }

    fn swap(&mut self) {
        let len = self.stack.len();
        debug_assert!(len >= 2);
        self.stack.swap(len - 1, len - 2);
    }

    pub fn top_type(&self) -> StackType {
        self.stack.last().map(|e| e.ty).unwrap_or(StackType::Unknown)
    }

    pub fn top_reg(&self) -> RegOrConst {
        self.stack.last().map(|e| e.reg).unwrap_or_default()
    }

    pub fn top_deref_reg(&self) -> RegOrConst {
        self.stack
            .last()
            .map(|e| e.deref_reg)
            .unwrap_or_default()
    }

    fn replace_top(&mut self, ty: StackType, reg: RegOrConst, deref_reg: RegOrConst) {
        let top = self.stack.last_mut().expect("parse stack entry");
        *top = StackEntry { ty, reg, deref_reg };
    }

    /// Re-push a previously snapshot descriptor (used by for-in over an
    /// existing variable).
    pub fn push_descriptor(&mut self, ty: StackType, reg: RegOrConst) {
        self.push_entry(ty, reg);
    }

    pub fn snapshot_top(&self) -> (StackType, RegOrConst) {
        (self.top_type(), self.top_reg())
    }

    /// Emit whatever load materializes the top descriptor into a
    /// register (or returns the constant operand directly). With
    /// `make_closure`, function constants are wrapped in a CLOSURE.
    pub fn bake(&mut self, make_closure: bool) -> RegOrConst {
        let Some(entry) = self.stack.last().copied() else {
            return RegOrConst::default();
        };
        match entry.ty {
            StackType::PropRef | StackType::EltRef => {
                self.pop();
                let r = self.push_register();
                let op = if entry.ty == StackType::PropRef {
                    Op::LoadProp
                } else {
                    Op::LoadElt
                };
                self.emit_rrr(op, r, entry.reg, entry.deref_reg);
                r
            }
            StackType::RefK => {
                self.pop();
                let r = self.push_register();
                self.emit_rr(Op::LoadRefK, r, entry.reg);
                r
            }
            StackType::This => {
                self.pop();
                let r = self.push_register();
                self.emit_r(Op::LoadThis, r);
                r
            }
            StackType::UpValue => {
                self.pop();
                let r = self.push_register();
                self.emit_r_params(Op::LoadUp, r, entry.reg.raw());
                r
            }
            StackType::Constant => {
                let mut r = entry.reg;
                if make_closure && !r.is_reg() {
                    let index = r.index() as i32
                        - MAX_REGISTER as i32
                        - 1
                        - bytecode::builtin_constant_offset() as i32;
                    if index >= 0 {
                        let constant = self
                            .current_ref()
                            .constants
                            .get(index as usize)
                            .cloned()
                            .unwrap_or(Value::Undefined);
                        if let Some(id) = constant.as_object() {
                            let makes = self
                                .env
                                .heap
                                .object(id)
                                .map(|o| o.can_make_closure())
                                .unwrap_or(false);
                            if makes {
                                self.pop();
                                let dst = self.push_register();
                                self.emit_rr(Op::Closure, dst, r);
                                r = dst;
                            }
                        }
                    }
                }
                r
            }
            StackType::Local | StackType::Register => entry.reg,
            StackType::Unknown => {
                self.print_error("expression expected");
                RegOrConst::default()
            }
        }
    }

    // ── Identifier resolution ───────────────────────────────────────────

    pub fn emit_id(&mut self, atom: Atom, ty: IdType) {
        if self.nerrors() > 0 {
            return;
        }

        if ty == IdType::MightBeLocal || ty == IdType::MustBeLocal {
            // Named local functions are already in the constant pool
            let offset = bytecode::builtin_constant_offset();
            for i in 0..self.current_ref().constants.len() {
                if let Some(obj) = self.current_ref().constants[i].as_object() {
                    let name = self.env.heap.object(obj).map(|o| o.name());
                    if name == Some(atom) && !atom.is_none() {
                        let reg = RegOrConst::constant(i as u8 + offset, Atom::NONE);
                        self.push_entry(StackType::Constant, reg);
                        return;
                    }
                }
            }

            // Walk outward through the enclosing functions' locals
            let mut local = true;
            let mut frame: u16 = 0;
            for i in (0..self.functions.len()).rev() {
                if let Some(index) = self.functions[i].local_index(atom) {
                    if local {
                        self.push_entry(StackType::Local, RegOrConst::reg(index as u8));
                        return;
                    }
                    let up = self
                        .current()
                        .add_upvalue(index, frame, atom);
                    self.push_entry(StackType::UpValue, RegOrConst::reg(up as u8));
                    return;
                }
                local = false;
                frame += 1;

                if ty == IdType::MustBeLocal {
                    let name = self.env.atoms.string_from(atom).to_string();
                    self.print_error(&format!("nonexistent variable '{}'", name));
                    return;
                }
            }
        }

        let id = self.add_constant(Value::Id(atom));
        let ty = if ty == IdType::NotLocal {
            StackType::Constant
        } else {
            StackType::RefK
        };
        self.push_entry(ty, id);
    }

    // ── Expression emission ─────────────────────────────────────────────

    pub fn emit_dup(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        match self.top_type() {
            StackType::PropRef | StackType::EltRef | StackType::RefK | StackType::Constant => {
                let entry = *self.stack.last().unwrap();
                self.stack.push(entry);
                self.bake(false);
            }
            StackType::Local => {
                let reg = self.top_reg();
                self.push_entry(StackType::Local, reg);
            }
            StackType::UpValue => {
                let reg = self.top_reg();
                self.push_entry(StackType::UpValue, reg);
            }
            StackType::Register => {
                // Alias the register without taking ownership of it
                let reg = self.top_reg();
                self.push_entry(StackType::Local, reg);
            }
            _ => {
                self.print_error("internal error: cannot dup");
            }
        }
    }

    /// Store TOS into TOS-1, leaving the destination on the stack.
    pub fn emit_move(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let src_reg = self.bake(true);
        self.swap();
        match self.top_type() {
            StackType::This => {
                self.print_error("assignment to 'this' not allowed");
            }
            StackType::Unknown | StackType::Constant => {
                self.print_error("invalid assignment target");
            }
            StackType::PropRef | StackType::EltRef => {
                let op = if self.top_type() == StackType::PropRef {
                    Op::StoProp
                } else {
                    Op::StoElt
                };
                let (obj, deref) = (self.top_reg(), self.top_deref_reg());
                self.emit_rrr(op, obj, deref, src_reg);
            }
            StackType::Local | StackType::Register => {
                let dst = self.top_reg();
                self.emit_rr(Op::Move, dst, src_reg);
            }
            StackType::RefK => {
                let dst = self.top_reg();
                self.emit_rr(Op::StoRefK, dst, src_reg);
                self.pop();
                return;
            }
            StackType::UpValue => {
                let index = self.top_reg().raw();
                self.emit_r_params(Op::StoreUp, src_reg, index);
            }
        }
        self.swap();
        self.pop();
    }

    /// Collapse `[object, key]` into a property or element reference.
    pub fn emit_deref(&mut self, ty: DerefType) -> RegOrConst {
        if self.nerrors() > 0 {
            return RegOrConst::default();
        }
        let deref_reg = self.bake(false);
        self.swap();
        let object_reg = self.bake(false);
        self.swap();
        self.pop();
        let stack_ty = if ty == DerefType::Prop {
            StackType::PropRef
        } else {
            StackType::EltRef
        };
        self.replace_top(stack_ty, object_reg, deref_reg);
        object_reg
    }

    pub fn emit_append_elt(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let src_reg = self.bake(false);
        self.swap();
        let object_reg = self.bake(false);
        self.swap();
        self.pop();
        self.emit_rr(Op::AppendElt, object_reg, src_reg);
    }

    pub fn emit_append_prop(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let src_reg = self.bake(false);
        self.swap();
        let prop_reg = self.bake(false);
        self.pop();
        self.pop();
        let object_reg = self.top_reg();
        self.emit_rrr(Op::AppendProp, object_reg, prop_reg, src_reg);
    }

    pub fn emit_bin_op(&mut self, op: Op) {
        if self.nerrors() > 0 {
            return;
        }
        if op == Op::Move {
            self.emit_move();
            return;
        }
        let right_reg = self.bake(false);
        self.swap();
        let left_reg = self.bake(false);
        self.pop();
        self.pop();
        let dst = self.push_register();
        self.emit_rrr(op, dst, left_reg, right_reg);
    }

    /// Like `emit_bin_op(EQ)` but keeps the left operand on the stack
    /// (switch cases re-test the same subject).
    pub fn emit_case_test(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let right_reg = self.bake(false);
        self.swap();
        let left_reg = self.bake(false);
        self.swap();
        self.pop();
        let dst = self.push_register();
        self.emit_rrr(Op::Eq, dst, left_reg, right_reg);
    }

    pub fn emit_un_op(&mut self, op: Op) {
        if self.nerrors() > 0 {
            return;
        }
        if matches!(op, Op::PreDec | Op::PreInc | Op::PostDec | Op::PostInc) {
            let dst = self.push_register();
            self.swap();
            self.emit_dup();
            let src_reg = self.bake(false);
            self.emit_rr(op, dst, src_reg);
            self.emit_move();
            self.pop();
            return;
        }
        let src_reg = self.bake(false);
        self.pop();
        let dst = self.push_register();
        self.emit_rr(op, dst, src_reg);
    }

    pub fn emit_load_lit(&mut self, array: bool) {
        if self.nerrors() > 0 {
            return;
        }
        let dst = self.push_register();
        self.emit_r(if array { Op::LoadLitA } else { Op::LoadLitO }, dst);
    }

    pub fn emit_push(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let src = self.bake(true);
        self.pop();
        self.emit_r(Op::Push, src);
    }

    pub fn emit_pop(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let dst = self.push_register();
        self.emit_r(Op::Pop, dst);
    }

    pub fn emit_end(&mut self) {
        if self.nerrors() > 0 {
            self.stack.clear();
            return;
        }
        self.emit_op(Op::End);
    }

    pub fn emit_call_ret(&mut self, op: Op, this_reg: RegOrConst, nparams: u8) {
        if self.nerrors() > 0 {
            return;
        }
        debug_assert!(matches!(op, Op::Call | Op::New | Op::Ret));

        if op == Op::Call
            && matches!(self.top_type(), StackType::PropRef | StackType::EltRef)
        {
            // Method call: one CALLPROP avoids materializing the function
            let (obj, prop) = (self.top_reg(), self.top_deref_reg());
            self.emit_rr_params(Op::CallProp, obj, prop, nparams);
            self.pop();
            self.emit_pop();
            return;
        }

        let mut callee = RegOrConst::default();
        if op == Op::Call || op == Op::New {
            callee = self.bake(false);
            self.pop();
        } else {
            // Return values go onto the runtime stack
            for _ in 0..nparams {
                self.emit_push();
            }
        }

        match op {
            Op::Ret => self.emit_params(Op::Ret, nparams),
            Op::New => self.emit_r_params(Op::New, callee, nparams),
            _ => self.emit_rr_params(Op::Call, callee, this_reg, nparams),
        }

        if op == Op::Call || op == Op::New {
            // The call leaves its result on the runtime stack
            self.emit_pop();
        }
    }

    pub fn discard_result(&mut self) {
        self.pop();
    }

    // ── Functions and classes ───────────────────────────────────────────

    pub fn function_start(&mut self, ctor: bool) {
        if self.nerrors() > 0 {
            return;
        }
        let obj = self.env.heap.alloc_object(function_object(FunctionBody::new()));
        self.functions.push(FunctionEntry::new(obj, ctor));
    }

    pub fn function_add_param(&mut self, atom: Atom) {
        if self.nerrors() > 0 {
            return;
        }
        if self.current().add_local(atom).is_none() {
            let name = self.env.atoms.string_from(atom).to_string();
            self.print_error(&format!("param '{}' already exists", name));
        }
    }

    pub fn function_params_end(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let count = self.current_ref().locals.len() as u16;
        self.current().formal_param_count = count;
    }

    pub fn function_is_ctor(&self) -> bool {
        self.current_ref().ctor
    }

    pub fn add_var(&mut self, atom: Atom) {
        if self.nerrors() > 0 {
            return;
        }
        self.current().add_local(atom);
    }

    pub fn function_end(&mut self) -> Option<ObjId> {
        if self.nerrors() > 0 {
            return None;
        }

        if self.function_is_ctor() {
            self.push_this();
            self.emit_call_ret(Op::Ret, RegOrConst::default(), 1);
        }
        self.emit_end();

        let entry = self.functions.pop().expect("function entry");
        let temp_register_count = MAX_REGISTER as u16 + 1 - entry.min_reg as u16;
        let local_count = entry.locals.len() as u16;

        let mut code = entry.code;
        reconcile_registers(&mut code, local_count);

        let obj = entry.obj;
        if let Some(heap_obj) = self.env.heap.object_mut(obj) {
            if let crate::object::ObjectKind::Function(body) = &mut heap_obj.kind {
                let name = body.name;
                *body = FunctionBody {
                    code: Rc::new(code),
                    constants: Rc::new(entry.constants),
                    upvalues: entry.upvalues,
                    formal_param_count: entry.formal_param_count,
                    local_count: local_count + temp_register_count,
                    name,
                };
            }
        }
        Some(obj)
    }

    pub fn add_named_function(&mut self, func: ObjId, name: Atom) {
        if self.nerrors() > 0 {
            return;
        }
        self.add_constant(Value::Object(func));
        if let Some(obj) = self.env.heap.object_mut(func) {
            if let crate::object::ObjectKind::Function(body) = &mut obj.kind {
                body.name = name;
            }
        }
        // Top-level functions also become program properties so the
        // LOADREFK chain (this, program, Global) can resolve them from
        // anywhere, recursive bodies included
        if self.functions.len() == 1 {
            let main = self.program.main;
            if let Some(obj) = self.env.heap.object_mut(main) {
                obj.set_property(
                    name,
                    Value::Object(func),
                    crate::object::SetType::AddIfNeeded,
                );
            }
        }
    }

    pub fn class_start(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let obj = self.env.heap.alloc_object(mater_object());
        self.classes.push(obj);
    }

    pub fn class_end(&mut self) {
        if self.nerrors() > 0 {
            return;
        }
        let obj = self.classes.pop().expect("class entry");
        self.push_k(Value::Object(obj));
    }

    pub fn current_class(&self) -> Option<ObjId> {
        self.classes.last().copied()
    }

    pub fn set_class_property(&mut self, class: ObjId, name: Atom, value: Value) {
        if let Some(obj) = self.env.heap.object_mut(class) {
            obj.set_property(name, value, crate::object::SetType::AddIfNeeded);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::object::ObjectKind;
    use crate::runtime::Runtime;
    use crate::value::Value;

    fn main_body(runtime: &Runtime, program: &crate::program::Program) -> crate::object::FunctionBody {
        let obj = runtime.env.heap.object(program.main).expect("program object");
        match &obj.kind {
            ObjectKind::Function(body) => body.clone(),
            _ => panic!("program is not a function"),
        }
    }

    #[test]
    fn constants_deduplicate() {
        let mut runtime = Runtime::new();
        let program = runtime.compile("var a = 7 + 7 + 7;").expect("parse");
        let body = main_body(&runtime, &program.borrow());
        let sevens = body
            .constants
            .iter()
            .filter(|v| **v == Value::Integer(7))
            .count();
        assert_eq!(sevens, 1);
    }

    #[test]
    fn zero_and_one_use_builtin_constants() {
        let mut runtime = Runtime::new();
        let program = runtime.compile("var a = 0; var b = 1;").expect("parse");
        let body = main_body(&runtime, &program.borrow());
        assert!(body.constants.iter().all(|v| !v.is_integer()));
    }

    #[test]
    fn frame_covers_locals_and_temporaries() {
        let mut runtime = Runtime::new();
        let program = runtime
            .compile("var a = 1; var b = a + 2;")
            .expect("parse");
        let body = main_body(&runtime, &program.borrow());
        assert_eq!(body.formal_param_count, 0);
        assert!(body.local_count >= 3, "locals plus at least one temporary");
    }

    #[test]
    fn line_numbers_are_emitted() {
        let mut runtime = Runtime::new();
        let program = runtime.compile("var a = 1;\nvar b = 2;\n").expect("parse");
        let body = main_body(&runtime, &program.borrow());
        // The first emitted instruction is the line marker for line 1
        assert_eq!(
            crate::bytecode::Op::from_u8(body.code[0]),
            crate::bytecode::Op::LineNo
        );
    }
}

/// Final pass: remap downward-allocated temporaries into the contiguous
/// range immediately above the declared locals.
fn reconcile_registers(code: &mut [u8], local_count: u16) {
    let remap = |reg: u8| -> u8 {
        if reg as u16 > local_count && reg <= MAX_REGISTER {
            (MAX_REGISTER as u16 - reg as u16 + local_count) as u8
        } else {
            reg
        }
    };

    let mut p = 0usize;
    while p < code.len() {
        let (op, _imm) = bytecode::op_from_byte(code[p]);
        p += 1;
        let lay = layout(op);
        for &flag in &[lay.a, lay.b, lay.c, lay.d] {
            if flag {
                code[p] = remap(code[p]);
                p += constant_size(code[p]) + 1;
            }
        }
        if lay.number {
            p += 2;
        }
        if lay.params && op != Op::RetI {
            p += 1;
        }
    }
}
