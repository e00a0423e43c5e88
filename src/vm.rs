/// The execution unit: a register-based bytecode interpreter.
///
/// One flat operand stack of values plus a separate call-record stack.
/// Registers address the current frame window; constants come from the
/// builtin table or the function's pool. Runtime errors never unwind:
/// they print, bump a counter, and execution continues until the error
/// budget is spent.
///
/// Suspension only happens at instruction boundaries. Termination and
/// yield requests, and event arrival, set a cheap check flag that the
/// dispatcher polls each iteration.

use crate::atom::{Atom, SharedAtom};
use crate::bytecode::{
    self, Op, BuiltinConstant, MAX_REGISTER,
};
use crate::error::{CallReturnValue, Error};
use crate::gc::{Marker, ObjId};
use crate::global;
use crate::object::{
    mater_object, ClosureBody, HeapObject, ObjectKind, SetType, UpValue, UpValueRef,
};
use crate::program::Program;
use crate::runtime::Environment;
use crate::time::{Duration, Time};
use crate::timer::Timer;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const MAX_RUNTIME_ERRORS: u32 = 30;
const SLICE_CHECK_INTERVAL: u32 = 128;

/// Flags shared with the scheduler and timers so they can poke a VM that
/// is currently executing (or not).
#[derive(Default)]
pub struct VmSignals {
    pub terminate: Cell<bool>,
    pub yield_req: Cell<bool>,
    pub check: Cell<bool>,
    pub deadline: Cell<Option<Time>>,
}

impl VmSignals {
    pub fn request_terminate(&self) {
        self.terminate.set(true);
        self.check.set(true);
    }

    pub fn request_yield(&self) {
        self.yield_req.set(true);
        self.check.set(true);
    }
}

struct CallRecord {
    pc: usize,
    frame: usize,
    func: Option<ObjId>,
    this_obj: Option<ObjId>,
    param_count: u32,
    lineno: u32,
    locals_added: u32,
    executing_delay: bool,
}

pub struct ExecutionUnit {
    stack: Vec<Value>,
    frame: usize,
    call_records: Vec<CallRecord>,

    program: Option<Rc<RefCell<Program>>>,
    function: Option<ObjId>,
    this_obj: Option<ObjId>,
    code: Rc<Vec<u8>>,
    constants: Rc<Vec<Value>>,
    pc: usize,

    local_offset: u32,
    formal_param_count: u32,
    actual_param_count: u32,

    nerrors: u32,
    lineno: u32,

    // Event queue: flat records of [func, this, argc, args...]. Shared so
    // timers can enqueue without borrowing the VM.
    events: Rc<RefCell<Vec<Value>>>,
    executing_event: bool,
    event_depth: Option<usize>,
    waiting_for_event: bool,

    signals: Rc<VmSignals>,
    wake: Rc<Cell<bool>>,
    delay_complete: Rc<Cell<bool>>,
    delay_timer: Option<crate::timer::TimerRef>,

    open_upvalues: Vec<UpValueRef>,
    console_print: Option<Rc<dyn Fn(&str)>>,
    slice_counter: u32,
}

impl ExecutionUnit {
    pub fn new(wake: Rc<Cell<bool>>) -> ExecutionUnit {
        ExecutionUnit {
            stack: Vec::with_capacity(20),
            frame: 0,
            call_records: Vec::new(),
            program: None,
            function: None,
            this_obj: None,
            code: Rc::new(Vec::new()),
            constants: Rc::new(Vec::new()),
            pc: 0,
            local_offset: 0,
            formal_param_count: 0,
            actual_param_count: 0,
            nerrors: 0,
            lineno: 0,
            events: Rc::new(RefCell::new(Vec::new())),
            executing_event: false,
            event_depth: None,
            waiting_for_event: false,
            signals: Rc::new(VmSignals::default()),
            wake,
            delay_complete: Rc::new(Cell::new(true)),
            delay_timer: None,
            open_upvalues: Vec::new(),
            console_print: None,
            slice_counter: 0,
        }
    }

    // ── Handles ─────────────────────────────────────────────────────────

    pub fn signals(&self) -> Rc<VmSignals> {
        self.signals.clone()
    }

    pub fn events_handle(&self) -> Rc<RefCell<Vec<Value>>> {
        self.events.clone()
    }

    pub fn wake_handle(&self) -> Rc<Cell<bool>> {
        self.wake.clone()
    }

    pub fn set_console_print_function(&mut self, f: Rc<dyn Fn(&str)>) {
        self.console_print = Some(f);
    }

    pub fn lineno(&self) -> u32 {
        self.lineno
    }

    pub fn program(&self) -> Option<Rc<RefCell<Program>>> {
        self.program.clone()
    }

    pub fn argument_count(&self) -> u32 {
        self.actual_param_count
    }

    pub fn argument(&self, i: u32) -> Value {
        self.stack
            .get(self.frame + i as usize)
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    /// `off` counts down from the top of the runtime stack: 0 is TOS,
    /// `1 - n` is the first of the top `n` values.
    pub fn stack_top(&self, off: i32) -> Value {
        let index = self.stack.len() as i32 - 1 + off;
        if index < 0 {
            return Value::Undefined;
        }
        self.stack.get(index as usize).cloned().unwrap_or(Value::Undefined)
    }

    pub fn stack_push(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Argument `i` of the current native call (`0..nparams`).
    pub fn native_arg(&self, i: u32, nparams: u32) -> Value {
        self.stack_top(1 - nparams as i32 + i as i32)
    }

    pub fn print(&self, env: &Environment, s: &str) {
        if let Some(f) = &self.console_print {
            f(s);
        } else {
            env.system.print(s);
        }
    }

    pub fn print_runtime_error(&mut self, env: &Environment, message: &str) {
        let formatted = Error::Runtime.format(self.lineno, message);
        self.print(env, &format!("***** {}", formatted));
        self.nerrors += 1;
        if self.nerrors > MAX_RUNTIME_ERRORS {
            self.print(
                env,
                &format!("\n\nToo many runtime errors, ({}) exiting...\n", self.nerrors),
            );
            self.signals.request_terminate();
        }
    }

    fn print_error_code(&mut self, env: &Environment, error: Error) {
        self.print_runtime_error(env, &error.to_string());
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn start_execution(&mut self, env: &mut Environment, program: Rc<RefCell<Program>>) {
        let main = program.borrow().main;
        self.call_records.clear();
        self.stack.clear();
        self.frame = 0;

        self.program = Some(program);
        self.function = Some(main);
        self.this_obj = Some(main);

        self.local_offset = 0;
        self.formal_param_count = 0;
        self.actual_param_count = 0;

        self.nerrors = 0;
        self.signals.terminate.set(false);
        self.signals.yield_req.set(false);

        self.events.borrow_mut().clear();
        self.executing_event = false;
        self.event_depth = None;
        self.waiting_for_event = false;
        self.lineno = 0;
        self.open_upvalues.clear();

        self.update_code(env);
        let local_count = self.current_local_count(env);
        self.set_local_frame(0, 0, local_count);
        self.pc = 0;
    }

    pub fn ready_to_run(&self) -> bool {
        if !self.events.borrow().is_empty() {
            return true;
        }
        if self.waiting_for_event {
            return false;
        }
        !self.executing_delay()
    }

    fn executing_delay(&self) -> bool {
        let in_delay = self
            .call_records
            .last()
            .map(|r| r.executing_delay)
            .unwrap_or(true);
        in_delay && !self.delay_complete.get()
    }

    pub fn gc_mark(&self, marker: &mut Marker) {
        let Some(program) = &self.program else { return };
        for v in &self.stack {
            marker.value(v);
        }
        marker.object(program.borrow().main);
        if let Some(func) = self.function {
            marker.object(func);
        }
        if let Some(this_obj) = self.this_obj {
            marker.object(this_obj);
        }
        for record in &self.call_records {
            if let Some(func) = record.func {
                marker.object(func);
            }
            if let Some(this_obj) = record.this_obj {
                marker.object(this_obj);
            }
        }
        for v in self.events.borrow().iter() {
            marker.value(v);
        }
        for up in &self.open_upvalues {
            let up = up.borrow();
            if up.closed {
                marker.value(&up.value);
            }
        }
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Append an event record and wake the scheduler. The free function
    /// form lets timer callbacks enqueue without holding the VM.
    pub fn enqueue_event(
        events: &RefCell<Vec<Value>>,
        signals: &VmSignals,
        wake: &Cell<bool>,
        func: Value,
        this: Value,
        args: &[Value],
    ) {
        let mut queue = events.borrow_mut();
        queue.push(func);
        queue.push(this);
        queue.push(Value::Integer(args.len() as i32));
        queue.extend_from_slice(args);
        signals.check.set(true);
        wake.set(true);
    }

    pub fn fire_event(&mut self, func: Value, this: Value, args: &[Value]) {
        Self::enqueue_event(&self.events, &self.signals, &self.wake, func, this, args);
    }

    /// Fire the program's `consoleListener` with a line of console input.
    pub fn received_data(&mut self, env: &mut Environment, data: &str) {
        let Some(program) = self.program.clone() else { return };
        let main = program.borrow().main;
        let listener = env
            .heap
            .object(main)
            .and_then(|o| o.property(Atom::from(SharedAtom::ConsoleListener)))
            .unwrap_or(Value::Undefined);
        if listener.is_defined() && !listener.is_null() {
            let s = env.heap.alloc_string(data.to_string());
            self.fire_event(listener, Value::Undefined, &[Value::String(s)]);
        }
    }

    /// Dequeue and invoke the next event record. Only ever returns
    /// Delay, Yield, WaitForEvent, Terminated or an error.
    fn run_next_event(&mut self, env: &mut Environment) -> CallReturnValue {
        let (func, this, nargs) = {
            let mut queue = self.events.borrow_mut();
            if queue.is_empty() {
                return CallReturnValue::WaitForEvent;
            }
            debug_assert!(queue.len() >= 3);
            let func = queue[0].clone();
            let this = queue[1].clone();
            let nargs = queue[2].as_int().max(0) as usize;
            let args: Vec<Value> = queue[3..3 + nargs].to_vec();
            queue.drain(..3 + nargs);
            drop(queue);
            for arg in args {
                self.stack.push(arg);
            }
            (func, this, nargs)
        };

        self.waiting_for_event = false;
        self.executing_event = true;
        self.event_depth = Some(self.call_records.len());
        let result = self.call_value(env, func, this, nargs as u32);

        match result {
            CallReturnValue::ReturnCount(count) => {
                // Native handler ran synchronously; drop its results
                for _ in 0..count {
                    self.stack.pop();
                }
                for _ in 0..nargs {
                    self.stack.pop();
                }
                self.executing_event = false;
                self.event_depth = None;
                CallReturnValue::Yield
            }
            CallReturnValue::FunctionStart => CallReturnValue::Yield,
            CallReturnValue::Finished | CallReturnValue::Terminated => {
                CallReturnValue::Error(Error::InternalError)
            }
            other => other,
        }
    }

    // ── Frames ──────────────────────────────────────────────────────────

    fn body_counts(&self, env: &Environment, func: ObjId) -> (u32, u32) {
        let Some(obj) = env.heap.object(func) else {
            return (0, 0);
        };
        match &obj.kind {
            ObjectKind::Function(f) => (f.formal_param_count as u32, f.local_count as u32),
            ObjectKind::Closure(c) => {
                let Some(inner) = env.heap.object(c.func) else {
                    return (0, 0);
                };
                match &inner.kind {
                    ObjectKind::Function(f) => {
                        (f.formal_param_count as u32, f.local_count as u32)
                    }
                    _ => (0, 0),
                }
            }
            _ => (0, 0),
        }
    }

    fn current_local_count(&self, env: &Environment) -> u32 {
        self.function
            .map(|f| self.body_counts(env, f).1)
            .unwrap_or(0)
    }

    fn update_code(&mut self, env: &Environment) {
        let body = self.function.and_then(|f| {
            let obj = env.heap.object(f)?;
            match &obj.kind {
                ObjectKind::Function(body) => Some(body.clone()),
                ObjectKind::Closure(c) => {
                    let inner = env.heap.object(c.func)?;
                    inner.function().cloned()
                }
                _ => None,
            }
        });
        match body {
            Some(body) => {
                self.code = body.code.clone();
                self.constants = body.constants.clone();
            }
            None => {
                self.code = Rc::new(Vec::new());
                self.constants = Rc::new(Vec::new());
            }
        }
        self.pc = 0;
    }

    fn set_local_frame(&mut self, formal: u32, actual: u32, local_count: u32) -> (usize, u32) {
        let prev_frame = self.frame;
        self.frame = self.stack.len() - actual as usize;
        let mut locals_added = local_count.saturating_sub(formal);
        if actual < formal {
            locals_added += formal - actual;
        }
        for _ in 0..locals_added {
            self.stack.push(Value::Undefined);
        }
        self.formal_param_count = formal;
        self.actual_param_count = actual;
        self.local_offset = actual.saturating_sub(formal);
        (prev_frame, locals_added)
    }

    pub fn start_function(
        &mut self,
        env: &mut Environment,
        function: ObjId,
        this_obj: Option<ObjId>,
        nparams: u32,
    ) {
        let (formal, local_count) = self.body_counts(env, function);
        let prev_function = self.function;
        let prev_this = self.this_obj;
        let prev_actual = self.actual_param_count;
        let return_pc = self.pc;

        self.function = Some(function);
        self.this_obj = this_obj.or_else(|| self.program.as_ref().map(|p| p.borrow().main));

        let (prev_frame, locals_added) = self.set_local_frame(formal, nparams, local_count);

        self.call_records.push(CallRecord {
            pc: return_pc,
            frame: prev_frame,
            func: prev_function,
            this_obj: prev_this,
            param_count: prev_actual,
            lineno: self.lineno,
            locals_added: locals_added + nparams,
            executing_delay: false,
        });

        self.update_code(env);
    }

    fn end_function(&mut self, env: &mut Environment) {
        let record = self.call_records.pop().expect("call record");

        // Anything captured from the popped frame closes now
        let popped_frame = self.frame;
        self.close_upvalues(popped_frame);

        self.stack
            .truncate(self.stack.len() - record.locals_added as usize);
        self.frame = record.frame;
        self.actual_param_count = record.param_count;
        self.this_obj = record.this_obj;
        self.function = record.func;
        self.update_code(env);
        self.pc = record.pc;
        self.lineno = record.lineno;

        let formal = self
            .function
            .map(|f| self.body_counts(env, f).0)
            .unwrap_or(0);
        self.formal_param_count = formal;
        self.local_offset = self.actual_param_count.saturating_sub(formal);
    }

    // ── Up-values ───────────────────────────────────────────────────────

    pub fn up_value_stack_index(&self, index: u32, frame: u16) -> usize {
        if frame == 0 {
            return self.frame + index as usize;
        }
        let record = &self.call_records[self.call_records.len() - frame as usize];
        record.frame + index as usize
    }

    fn close_upvalues(&mut self, frame: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|up| {
            let mut up = up.borrow_mut();
            if up.closed {
                return false;
            }
            if up.stack_index >= frame {
                up.value = stack.get(up.stack_index).cloned().unwrap_or(Value::Undefined);
                up.closed = true;
                return false;
            }
            true
        });
    }

    fn load_upvalue(&mut self, env: &Environment, index: usize) -> Option<Value> {
        let func = self.function?;
        let obj = env.heap.object(func)?;
        match &obj.kind {
            ObjectKind::Closure(c) => {
                let up = c.upvalues.get(index)?;
                let up = up.borrow();
                if up.closed {
                    Some(up.value.clone())
                } else {
                    self.stack.get(up.stack_index).cloned()
                }
            }
            ObjectKind::Function(f) => {
                let desc = f.upvalues.get(index)?;
                let stack_index = self.up_value_stack_index(desc.index, desc.frame);
                self.stack.get(stack_index).cloned()
            }
            _ => None,
        }
    }

    fn store_upvalue(&mut self, env: &Environment, index: usize, value: Value) -> bool {
        let Some(func) = self.function else { return false };
        let Some(obj) = env.heap.object(func) else { return false };
        match &obj.kind {
            ObjectKind::Closure(c) => {
                let Some(up) = c.upvalues.get(index) else { return false };
                let up = up.clone();
                let mut up = up.borrow_mut();
                if up.closed {
                    up.value = value;
                } else {
                    let stack_index = up.stack_index;
                    drop(up);
                    if stack_index < self.stack.len() {
                        self.stack[stack_index] = value;
                    } else {
                        return false;
                    }
                }
                true
            }
            ObjectKind::Function(f) => {
                let Some(desc) = f.upvalues.get(index).copied() else {
                    return false;
                };
                let stack_index = self.up_value_stack_index(desc.index, desc.frame);
                if stack_index < self.stack.len() {
                    self.stack[stack_index] = value;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    // ── Register access ─────────────────────────────────────────────────

    fn next_byte(&mut self) -> u8 {
        let b = self.code.get(self.pc).copied().unwrap_or(Op::End as u8);
        self.pc += 1;
        b
    }

    fn next_u16(&mut self) -> u16 {
        let hi = self.next_byte() as u16;
        let lo = self.next_byte() as u16;
        (hi << 8) | lo
    }

    fn next_i16(&mut self) -> i16 {
        self.next_u16() as i16
    }

    fn reg_slot(&self, r: u8) -> usize {
        let mut index = r as usize;
        if index >= self.formal_param_count as usize {
            index += self.local_offset as usize;
        }
        self.frame + index
    }

    fn reg(&self, r: u8) -> Value {
        self.stack
            .get(self.reg_slot(r))
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    fn set_in_frame(&mut self, r: u8, v: Value) {
        let slot = self.reg_slot(r);
        if slot < self.stack.len() {
            self.stack[slot] = v;
        }
    }

    /// Decode one RK operand: register value, inline atom, builtin
    /// constant, or function pool constant.
    fn reg_or_const(&mut self) -> Value {
        let r = self.next_byte();
        if r <= MAX_REGISTER {
            return self.reg(r);
        }
        if bytecode::short_shared_atom_constant(r) {
            let id = self.next_byte() as u16;
            return Value::Id(Atom::from_raw(id));
        }
        if bytecode::long_shared_atom_constant(r) {
            let id = self.next_u16();
            return Value::Id(Atom::from_raw(id));
        }
        let id = r - MAX_REGISTER - 1;
        match id {
            x if x == BuiltinConstant::Undefined as u8 => Value::Undefined,
            x if x == BuiltinConstant::Null as u8 => Value::Null,
            x if x == BuiltinConstant::Int0 as u8 => Value::Integer(0),
            x if x == BuiltinConstant::Int1 as u8 => Value::Integer(1),
            _ => self
                .constants
                .get((id - bytecode::builtin_constant_offset()) as usize)
                .cloned()
                .unwrap_or(Value::Undefined),
        }
    }

    // ── Conversions ─────────────────────────────────────────────────────

    pub fn to_string_value(&self, env: &Environment, v: &Value) -> String {
        match v {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(id) => env.heap.string(*id).unwrap_or("").to_string(),
            Value::StringLiteral(id) => self
                .program
                .as_ref()
                .map(|p| p.borrow().string_from_literal(*id).to_string())
                .unwrap_or_default(),
            Value::Id(atom) => env.atoms.string_from(*atom).to_string(),
            Value::Object(id) => self.object_to_string(env, *id),
            Value::NativeObject(_) => "Native()".to_string(),
            Value::NativeFunction(_) => "NativeFunction()".to_string(),
            Value::StaticObject(obj) => {
                format!("{}()", env.atoms.string_from(Atom::from(obj.name)))
            }
        }
    }

    fn object_to_string(&self, env: &Environment, id: ObjId) -> String {
        let Some(obj) = env.heap.object(id) else {
            return "null".to_string();
        };
        match &obj.kind {
            ObjectKind::Array(elements) => {
                let parts: Vec<String> = elements
                    .iter()
                    .map(|e| self.to_string_value(env, e))
                    .collect();
                parts.join(",")
            }
            ObjectKind::Function(_) | ObjectKind::Closure(_) => "function".to_string(),
            ObjectKind::Mater => "Object".to_string(),
        }
    }

    pub fn to_float_value(&self, env: &Environment, v: &Value) -> f32 {
        match v {
            Value::Float(f) => *f,
            Value::Integer(i) => *i as f32,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(_) | Value::StringLiteral(_) => {
                let s = self.to_string_value(env, v);
                s.trim().parse::<f32>().unwrap_or(0.0)
            }
            Value::Null
            | Value::Id(_)
            | Value::NativeObject(_)
            | Value::NativeFunction(_)
            | Value::StaticObject(_) => 0.0,
            Value::Object(_) => {
                let s = self.to_string_value(env, v);
                s.trim().parse::<f32>().unwrap_or(0.0)
            }
            Value::Undefined => f32::NAN,
        }
    }

    pub fn to_int_value(&self, env: &Environment, v: &Value) -> i32 {
        match v {
            Value::Integer(i) => *i,
            Value::Bool(b) => *b as i32,
            _ => {
                let f = self.to_float_value(env, v);
                if f.is_nan() {
                    0
                } else {
                    f as i32
                }
            }
        }
    }

    pub fn to_bool_value(&self, env: &Environment, v: &Value) -> bool {
        match v {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(id) => env.heap.string(*id).map(|s| !s.is_empty()).unwrap_or(false),
            Value::StringLiteral(_) => !self.to_string_value(env, v).is_empty(),
            Value::Id(atom) => !atom.is_none(),
            Value::Object(id) => env.heap.object(*id).is_some(),
            Value::NativeObject(_) | Value::NativeFunction(_) | Value::StaticObject(_) => true,
        }
    }

    pub fn to_id_value(&self, env: &mut Environment, v: &Value) -> Atom {
        match v {
            Value::Id(atom) => *atom,
            Value::String(_) | Value::StringLiteral(_) | Value::Integer(_) | Value::Float(_) => {
                let s = self.to_string_value(env, v);
                env.atoms.atomize(&s)
            }
            _ => Atom::NONE,
        }
    }

    /// The comparison protocol: nulls compare equal, integers fast-path,
    /// equal string literals fast-path, strings byte-compare, mixed
    /// number/string compare as floats, anything else is only equal to
    /// itself.
    pub fn compare_values(&self, env: &Environment, a: &Value, b: &Value) -> i32 {
        let a_nullish = a.is_null() || a.is_undefined();
        let b_nullish = b.is_null() || b.is_undefined();
        if a_nullish && b_nullish {
            return 0;
        }

        if a.is_integer() && b.is_integer() {
            let diff = a.as_int() as i64 - b.as_int() as i64;
            return diff.signum() as i32;
        }

        if a.is_string_literal() && b.is_string_literal() && a == b {
            return 0;
        }

        if a.is_string() && b.is_string() {
            let sa = self.to_string_value(env, a);
            let sb = self.to_string_value(env, b);
            return match sa.cmp(&sb) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            };
        }

        if (a.is_number() || a.is_string()) && (b.is_number() || b.is_string()) {
            let fa = self.to_float_value(env, a);
            let fb = self.to_float_value(env, b);
            return if fa < fb {
                -1
            } else if fa > fb {
                1
            } else {
                0
            };
        }

        if a == b {
            0
        } else {
            -1
        }
    }

    // ── Property and element protocol ───────────────────────────────────

    pub fn property_of(&self, env: &Environment, v: &Value, prop: Atom) -> Value {
        match v {
            Value::Object(id) => {
                let mut current = *id;
                loop {
                    let Some(obj) = env.heap.object(current) else {
                        return Value::Undefined;
                    };
                    if let ObjectKind::Array(elements) = &obj.kind {
                        if prop == Atom::from(SharedAtom::Length) {
                            return Value::Integer(elements.len() as i32);
                        }
                    }
                    if let Some(value) = obj.property(prop) {
                        return value;
                    }
                    match &obj.proto {
                        Value::Object(next) => current = *next,
                        Value::StaticObject(s) => {
                            return s.property(prop).unwrap_or(Value::Undefined)
                        }
                        _ => return Value::Undefined,
                    }
                }
            }
            Value::String(_) | Value::StringLiteral(_) => {
                if prop == Atom::from(SharedAtom::Length) {
                    Value::Integer(self.to_string_value(env, v).len() as i32)
                } else {
                    Value::Undefined
                }
            }
            Value::StaticObject(s) => s.property(prop).unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    pub fn set_property_on(
        &mut self,
        env: &mut Environment,
        v: &Value,
        prop: Atom,
        value: Value,
        set_type: SetType,
    ) -> bool {
        let Some(id) = v.as_object() else {
            return false;
        };

        if let Some(obj) = env.heap.object(id) {
            if matches!(obj.kind, ObjectKind::Array(_)) && prop == Atom::from(SharedAtom::Length) {
                let new_len = self.to_int_value(env, &value).max(0) as usize;
                if let Some(obj) = env.heap.object_mut(id) {
                    if let ObjectKind::Array(elements) = &mut obj.kind {
                        elements.resize(new_len, Value::Undefined);
                        return true;
                    }
                }
                return false;
            }
        }

        // NeverAdd consults the proto chain: writing a property the
        // prototype declares creates the own (shadowing) binding.
        if set_type == SetType::NeverAdd {
            let has_own = env
                .heap
                .object(id)
                .map(|o| o.property(prop).is_some())
                .unwrap_or(false);
            if !has_own && !self.property_of(env, v, prop).is_defined() {
                return false;
            }
            return env
                .heap
                .object_mut(id)
                .map(|o| o.set_property(prop, value, SetType::AddIfNeeded))
                .unwrap_or(false);
        }

        env.heap
            .object_mut(id)
            .map(|o| o.set_property(prop, value, set_type))
            .unwrap_or(false)
    }

    pub fn element_of(&self, env: &mut Environment, v: &Value, elt: &Value) -> Value {
        match v {
            Value::Object(id) => {
                let is_array = env
                    .heap
                    .object(*id)
                    .map(|o| matches!(o.kind, ObjectKind::Array(_)))
                    .unwrap_or(false);
                if is_array {
                    let index = self.to_int_value(env, elt);
                    if index < 0 {
                        return Value::Undefined;
                    }
                    return env
                        .heap
                        .object(*id)
                        .and_then(|o| match &o.kind {
                            ObjectKind::Array(elements) => {
                                elements.get(index as usize).cloned()
                            }
                            _ => None,
                        })
                        .unwrap_or(Value::Undefined);
                }
                let atom = self.to_id_value(env, elt);
                self.property_of(env, v, atom)
            }
            Value::String(_) | Value::StringLiteral(_) => {
                let index = self.to_int_value(env, elt);
                let s = self.to_string_value(env, v);
                if index >= 0 {
                    s.as_bytes()
                        .get(index as usize)
                        .map(|b| Value::Integer(*b as i32))
                        .unwrap_or(Value::Undefined)
                } else {
                    Value::Undefined
                }
            }
            _ => Value::Undefined,
        }
    }

    pub fn set_element_on(
        &mut self,
        env: &mut Environment,
        v: &Value,
        elt: &Value,
        value: Value,
        set_type: SetType,
    ) -> bool {
        let Some(id) = v.as_object() else {
            return false;
        };
        let is_array = env
            .heap
            .object(id)
            .map(|o| matches!(o.kind, ObjectKind::Array(_)))
            .unwrap_or(false);

        if is_array {
            // An undefined index with AlwaysAdd is the append idiom
            if elt.is_undefined() && set_type == SetType::AlwaysAdd {
                if let Some(obj) = env.heap.object_mut(id) {
                    if let ObjectKind::Array(elements) = &mut obj.kind {
                        elements.push(value);
                        return true;
                    }
                }
                return false;
            }
            let index = self.to_int_value(env, elt);
            if index < 0 {
                return false;
            }
            if let Some(obj) = env.heap.object_mut(id) {
                if let ObjectKind::Array(elements) = &mut obj.kind {
                    let index = index as usize;
                    if index < elements.len() {
                        elements[index] = value;
                        return true;
                    }
                    if index == elements.len() {
                        elements.push(value);
                        return true;
                    }
                }
            }
            return false;
        }

        let atom = self.to_id_value(env, elt);
        if atom.is_none() {
            return false;
        }
        self.set_property_on(env, v, atom, value, set_type)
    }

    // ── Calls ───────────────────────────────────────────────────────────

    pub fn call_value(
        &mut self,
        env: &mut Environment,
        callee: Value,
        this: Value,
        nparams: u32,
    ) -> CallReturnValue {
        match callee {
            Value::Object(id) => {
                // Pull what we need out of the heap before entering the
                // frame machinery
                let bound_this = match env.heap.object(id).map(|o| &o.kind) {
                    Some(ObjectKind::Function(_)) => Value::Undefined,
                    Some(ObjectKind::Closure(c)) => c.this.clone(),
                    _ => return CallReturnValue::Error(Error::CannotCall),
                };
                let this_obj = if bound_this.is_defined() {
                    bound_this.as_object()
                } else {
                    this.as_object()
                };
                self.start_function(env, id, this_obj, nparams);
                CallReturnValue::FunctionStart
            }
            Value::NativeFunction(f) => f(self, env, this, nparams),
            _ => CallReturnValue::Error(Error::CannotCall),
        }
    }

    /// `new target(...)`: make a fresh object whose proto is the target
    /// and run the target's constructor over it. A constructor that
    /// returns nothing yields the fresh object.
    pub fn construct_value(
        &mut self,
        env: &mut Environment,
        target: Value,
        nparams: u32,
    ) -> CallReturnValue {
        let type_name = match &target {
            Value::Object(id) => env.heap.object(*id).map(|o| o.name()).unwrap_or(Atom::NONE),
            Value::StaticObject(s) => Atom::from(s.name),
            _ => return CallReturnValue::Error(Error::CannotConstruct),
        };

        let mut fresh = mater_object();
        fresh.proto = target.clone();
        fresh.type_name = type_name;
        let fresh = env.heap.alloc_object(fresh);

        let ctor = self.property_of(env, &target, Atom::from(SharedAtom::Constructor));
        if ctor.is_defined() {
            let result = self.call_value(env, ctor, Value::Object(fresh), nparams);
            match result {
                CallReturnValue::ReturnCount(0) => {
                    self.stack.push(Value::Object(fresh));
                    CallReturnValue::ReturnCount(1)
                }
                other => other,
            }
        } else {
            self.stack.push(Value::Object(fresh));
            CallReturnValue::ReturnCount(1)
        }
    }

    pub fn call_property_value(
        &mut self,
        env: &mut Environment,
        obj: Value,
        prop: Atom,
        nparams: u32,
    ) -> CallReturnValue {
        if let Some(result) = global::call_builtin_property(self, env, &obj, prop, nparams) {
            return result;
        }
        let func = self.property_of(env, &obj, prop);
        if !func.is_defined() {
            return CallReturnValue::Error(Error::PropertyDoesNotExist);
        }
        self.call_value(env, func, obj, nparams)
    }

    // ── Identifier resolution ───────────────────────────────────────────

    fn deref_id(&mut self, env: &mut Environment, atom: Atom) -> Value {
        if atom.is_none() {
            self.print_runtime_error(env, "value in LOADREFK must be an id");
            return Value::Undefined;
        }

        if let Some(this_obj) = self.this_obj {
            if let Some(value) = env.heap.object(this_obj).and_then(|o| o.property(atom)) {
                return value;
            }
        }

        if let Some(program) = self.program.clone() {
            let main = program.borrow().main;
            if let Some(value) = env.heap.object(main).and_then(|o| o.property(atom)) {
                return value;
            }
        }

        if let Some(value) = global::GLOBAL.property(atom) {
            return value;
        }

        let name = env.atoms.string_from(atom).to_string();
        self.print_runtime_error(
            env,
            &format!("'{}' property does not exist in global scope", name),
        );
        Value::Undefined
    }

    fn sto_id_ref(&mut self, env: &mut Environment, atom: Atom, value: Value) {
        if atom.is_none() {
            self.print_runtime_error(env, "destination in STOREFK must be an id");
            return;
        }

        if let Some(this_obj) = self.this_obj {
            let has = env
                .heap
                .object(this_obj)
                .map(|o| o.property(atom).is_some())
                .unwrap_or(false);
            if has {
                if let Some(obj) = env.heap.object_mut(this_obj) {
                    obj.set_property(atom, value, SetType::AddIfNeeded);
                }
                return;
            }
        }

        if let Some(program) = self.program.clone() {
            let main = program.borrow().main;
            let has = env
                .heap
                .object(main)
                .map(|o| o.property(atom).is_some())
                .unwrap_or(false);
            if has {
                if let Some(obj) = env.heap.object_mut(main) {
                    obj.set_property(atom, value, SetType::AddIfNeeded);
                }
                return;
            }
        }

        let name = env.atoms.string_from(atom).to_string();
        self.print_runtime_error(
            env,
            &format!("'{}' property does not exist or cannot be set", name),
        );
    }

    // ── Delay ───────────────────────────────────────────────────────────

    pub fn start_delay(&mut self, env: &mut Environment, duration: Duration) {
        self.delay_complete.set(false);
        if let Some(record) = self.call_records.last_mut() {
            record.executing_delay = true;
        }
        let complete = self.delay_complete.clone();
        let signals = self.signals.clone();
        let wake = self.wake.clone();
        let timer = Timer::new(
            duration,
            false,
            Rc::new(RefCell::new(move || {
                complete.set(true);
                signals.check.set(true);
                wake.set(true);
            })),
        );
        env.timers.borrow_mut().start(&timer);
        self.delay_timer = Some(timer);
    }

    // ── Dispatcher ──────────────────────────────────────────────────────

    fn finalize_terminated(&mut self, env: &mut Environment) -> CallReturnValue {
        self.stack.clear();
        self.call_records.clear();
        env.heap.gc_pending = true;
        self.program = None;
        self.function = None;
        self.this_obj = None;
        CallReturnValue::Terminated
    }

    fn is_program_function(&self) -> bool {
        match (&self.program, self.function) {
            (Some(program), Some(func)) => program.borrow().main == func,
            _ => false,
        }
    }

    /// Return handling for RET / RETI / END. `None` means keep
    /// dispatching in the frame below.
    fn do_return(
        &mut self,
        env: &mut Environment,
        op: Op,
        imm: u8,
    ) -> Option<CallReturnValue> {
        if self.signals.terminate.get() {
            return Some(self.finalize_terminated(env));
        }

        let return_value;
        if op == Op::End || self.call_records.is_empty() {
            let mut returned = Value::Undefined;
            if op != Op::End {
                let nparams = if op == Op::Ret {
                    self.next_byte() as u32
                } else {
                    imm as u32
                };
                if nparams > 0 {
                    returned = self.stack_top(1 - nparams as i32);
                    for _ in 0..nparams {
                        self.stack.pop();
                    }
                }
            }

            if self.is_program_function() {
                // End of the top-level program
                let local_count = self.current_local_count(env) as usize;
                if self.stack.len() != local_count {
                    self.print_runtime_error(
                        env,
                        &format!(
                            "internal error. On exit stack has {} elements, should have {}",
                            self.stack.len(),
                            local_count
                        ),
                    );
                    return Some(self.finalize_terminated(env));
                }
                env.heap.gc_pending = true;
                self.program = None;
                self.function = None;
                self.this_obj = None;
                return Some(CallReturnValue::Finished);
            }
            if self.call_records.is_empty() {
                return Some(CallReturnValue::Finished);
            }
            return_value = returned;
        } else {
            let nparams = if op == Op::Ret {
                self.next_byte() as u32
            } else {
                imm as u32
            };
            let mut returned = Value::Undefined;
            if nparams > 0 {
                returned = self.stack_top(1 - nparams as i32);
            }
            for _ in 0..nparams {
                self.stack.pop();
            }
            return_value = returned;
        }

        self.end_function(env);

        if self.executing_event && self.event_depth == Some(self.call_records.len()) {
            // The event frame just returned; its arguments went with it
            self.executing_event = false;
            self.event_depth = None;
            self.signals.check.set(true);
        } else {
            self.stack.push(return_value);
        }

        if self.executing_delay() {
            return Some(CallReturnValue::Delay(Duration::ZERO));
        }
        None
    }

    /// Shared tail of CALL / NEW / CALLPROP. `None` keeps dispatching.
    fn finish_call(
        &mut self,
        env: &mut Environment,
        result: CallReturnValue,
        nparams: u32,
    ) -> Option<CallReturnValue> {
        if result.is_wait_for_event() {
            if self.executing_event {
                self.print_runtime_error(env, "waitForEvent() not allowed in event handler");
                return Some(self.finalize_terminated(env));
            }
            // Dummy return value for the POP that follows the call
            for _ in 0..nparams {
                self.stack.pop();
            }
            self.stack.push(Value::Undefined);
            self.waiting_for_event = true;
            return Some(result);
        }

        if let CallReturnValue::Error(error) = result {
            self.print_error_code(env, error);
        }

        if result.is_function_start() {
            return None;
        }

        // Calls are expressions: exactly one value replaces the params
        let mut returned = Value::Undefined;
        if result.is_return_count() && result.return_count() > 0 {
            returned = self.stack_top(1 - result.return_count() as i32);
            for _ in 0..result.return_count() {
                self.stack.pop();
            }
        }
        for _ in 0..nparams {
            self.stack.pop();
        }
        self.stack.push(returned);

        if let CallReturnValue::Delay(duration) = result {
            self.start_delay(env, duration);
            return Some(result);
        }
        None
    }

    pub fn continue_execution(&mut self, env: &mut Environment) -> CallReturnValue {
        if self.program.is_none() {
            return CallReturnValue::Finished;
        }

        self.signals.yield_req.set(false);

        if self.executing_delay() && self.events.borrow().is_empty() {
            return CallReturnValue::Delay(Duration::ZERO);
        }
        if self.waiting_for_event && self.events.borrow().is_empty() {
            return CallReturnValue::WaitForEvent;
        }

        if !self.events.borrow().is_empty() && !self.executing_event {
            return self.run_next_event(env);
        }

        loop {
            // Exception poll: cheap flag test per instruction
            if self.signals.check.get() {
                self.signals.check.set(false);
                if self.signals.terminate.get() {
                    return self.finalize_terminated(env);
                }
                if self.signals.yield_req.get() {
                    self.signals.yield_req.set(false);
                    return CallReturnValue::Yield;
                }
                if !self.events.borrow().is_empty() && !self.executing_event {
                    return self.run_next_event(env);
                }
            }

            // Time-slice poll, amortized over many instructions
            self.slice_counter += 1;
            if self.slice_counter >= SLICE_CHECK_INTERVAL {
                self.slice_counter = 0;
                if let Some(deadline) = self.signals.deadline.get() {
                    if Time::now() >= deadline {
                        return CallReturnValue::Yield;
                    }
                }
            }

            let instruction_start = self.pc;
            let (op, imm) = bytecode::op_from_byte(self.next_byte());

            match op {
                Op::LineNo => {
                    self.lineno = self.next_u16() as u32;
                }
                Op::Unknown => {
                    self.print_runtime_error(env, "unknown opcode");
                    return self.finalize_terminated(env);
                }
                Op::Yield => {
                    return CallReturnValue::Yield;
                }
                Op::Ret | Op::RetI | Op::End => {
                    if let Some(result) = self.do_return(env, op, imm) {
                        return result;
                    }
                }
                Op::Move => {
                    let ra = self.next_byte();
                    let v = self.reg_or_const();
                    self.set_in_frame(ra, v);
                }
                Op::LoadRefK => {
                    let ra = self.next_byte();
                    let id = self.reg_or_const().as_atom();
                    let v = self.deref_id(env, id);
                    self.set_in_frame(ra, v);
                }
                Op::StoRefK => {
                    let id = self.reg_or_const().as_atom();
                    let v = self.reg_or_const();
                    self.sto_id_ref(env, id, v);
                }
                Op::LoadProp => {
                    let ra = self.next_byte();
                    let obj = self.reg_or_const();
                    let prop = self.reg_or_const();
                    let atom = self.to_id_value(env, &prop);
                    let mut value = self.property_of(env, &obj, atom);
                    if !value.is_defined() {
                        if atom == Atom::from(SharedAtom::IteratorProp) {
                            // Plain values fall back to the stock iterator
                            value = global::GLOBAL
                                .property(Atom::from(SharedAtom::Iterator))
                                .unwrap_or(Value::Undefined);
                        } else {
                            let name = env.atoms.string_from(atom).to_string();
                            self.print_runtime_error(
                                env,
                                &format!("Property '{}' does not exist", name),
                            );
                            continue;
                        }
                    }
                    self.set_in_frame(ra, value);
                }
                Op::StoProp => {
                    let ra = self.next_byte();
                    let obj = self.reg(ra);
                    let prop = self.reg_or_const();
                    let v = self.reg_or_const();
                    let atom = self.to_id_value(env, &prop);
                    if !self.set_property_on(env, &obj, atom, v, SetType::NeverAdd) {
                        let name = env.atoms.string_from(atom).to_string();
                        self.print_runtime_error(
                            env,
                            &format!("Property '{}' does not exist", name),
                        );
                    }
                }
                Op::LoadElt => {
                    let ra = self.next_byte();
                    let obj = self.reg_or_const();
                    let elt = self.reg_or_const();
                    let value = self.element_of(env, &obj, &elt);
                    if !value.is_defined() {
                        let name = self.to_string_value(env, &elt);
                        self.print_runtime_error(
                            env,
                            &format!("Can't read element '{}' of a non-existant object", name),
                        );
                    } else {
                        self.set_in_frame(ra, value);
                    }
                }
                Op::StoElt => {
                    let ra = self.next_byte();
                    let obj = self.reg(ra);
                    let elt = self.reg_or_const();
                    let v = self.reg_or_const();
                    if !self.set_element_on(env, &obj, &elt, v, SetType::AddIfNeeded) {
                        let name = self.to_string_value(env, &elt);
                        self.print_runtime_error(
                            env,
                            &format!("Element '{}' does not exist", name),
                        );
                    }
                }
                Op::AppendElt => {
                    let ra = self.next_byte();
                    let obj = self.reg(ra);
                    let v = self.reg_or_const();
                    if !self.set_element_on(env, &obj, &Value::Undefined, v, SetType::AlwaysAdd) {
                        self.print_runtime_error(env, "Can't append element to object");
                    }
                }
                Op::AppendProp => {
                    let ra = self.next_byte();
                    let obj = self.reg(ra);
                    let prop = self.reg_or_const();
                    let v = self.reg_or_const();
                    let atom = self.to_id_value(env, &prop);
                    if !self.set_property_on(env, &obj, atom, v, SetType::AlwaysAdd) {
                        let name = env.atoms.string_from(atom).to_string();
                        self.print_runtime_error(
                            env,
                            &format!("Property '{}' already exists for APPENDPROP", name),
                        );
                    }
                }
                Op::LoadLitA => {
                    let ra = self.next_byte();
                    let id = env.heap.alloc_object(crate::object::mater_array());
                    self.set_in_frame(ra, Value::Object(id));
                }
                Op::LoadLitO => {
                    let ra = self.next_byte();
                    let id = env.heap.alloc_object(mater_object());
                    self.set_in_frame(ra, Value::Object(id));
                }
                Op::LoadTrue => {
                    let ra = self.next_byte();
                    self.set_in_frame(ra, Value::Bool(true));
                }
                Op::LoadFalse => {
                    let ra = self.next_byte();
                    self.set_in_frame(ra, Value::Bool(false));
                }
                Op::LoadNull => {
                    let ra = self.next_byte();
                    self.set_in_frame(ra, Value::Null);
                }
                Op::LoadThis => {
                    let ra = self.next_byte();
                    let v = self
                        .this_obj
                        .map(Value::Object)
                        .unwrap_or(Value::Undefined);
                    self.set_in_frame(ra, v);
                }
                Op::LoadUp => {
                    let ra = self.next_byte();
                    let index = self.next_byte() as usize;
                    match self.load_upvalue(env, index) {
                        Some(v) => self.set_in_frame(ra, v),
                        None => self.print_runtime_error(env, "unable to load upValue"),
                    }
                }
                Op::StoreUp => {
                    let v = self.reg_or_const();
                    let index = self.next_byte() as usize;
                    if !self.store_upvalue(env, index, v) {
                        self.print_runtime_error(env, "unable to store upValue");
                    }
                }
                Op::Push => {
                    let v = self.reg_or_const();
                    self.stack.push(v);
                }
                Op::Pop => {
                    let ra = self.next_byte();
                    let v = self.stack.pop().unwrap_or(Value::Undefined);
                    self.set_in_frame(ra, v);
                }
                Op::PopX => {
                    self.stack.pop();
                }
                Op::Lor | Op::Land => {
                    let ra = self.next_byte();
                    let left = self.reg_or_const();
                    let right = self.reg_or_const();
                    let lb = self.to_bool_value(env, &left);
                    let rb = self.to_bool_value(env, &right);
                    let result = if op == Op::Lor { lb || rb } else { lb && rb };
                    self.set_in_frame(ra, Value::Bool(result));
                }
                Op::Or | Op::And | Op::Xor | Op::Shl | Op::Shr | Op::Sar => {
                    let ra = self.next_byte();
                    let left = self.reg_or_const();
                    let right = self.reg_or_const();
                    let li = self.to_int_value(env, &left);
                    let ri = self.to_int_value(env, &right);
                    let result = match op {
                        Op::Or => li | ri,
                        Op::And => li & ri,
                        Op::Xor => li ^ ri,
                        Op::Shl => li.wrapping_shl(ri as u32),
                        Op::Sar => li.wrapping_shr(ri as u32),
                        _ => (li as u32).wrapping_shr(ri as u32) as i32,
                    };
                    self.set_in_frame(ra, Value::Integer(result));
                }
                Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                    let ra = self.next_byte();
                    let left = self.reg_or_const();
                    let right = self.reg_or_const();
                    let cmp = self.compare_values(env, &left, &right);
                    let result = match op {
                        Op::Eq => cmp == 0,
                        Op::Ne => cmp != 0,
                        Op::Lt => cmp < 0,
                        Op::Le => cmp <= 0,
                        Op::Gt => cmp > 0,
                        _ => cmp >= 0,
                    };
                    self.set_in_frame(ra, Value::Bool(result));
                }
                Op::Add => {
                    let ra = self.next_byte();
                    let left = self.reg_or_const();
                    let right = self.reg_or_const();
                    let result = if left.is_integer() && right.is_integer() {
                        Value::Integer(left.as_int().wrapping_add(right.as_int()))
                    } else if left.is_number() && right.is_number() {
                        Value::Float(
                            self.to_float_value(env, &left) + self.to_float_value(env, &right),
                        )
                    } else {
                        // Non-numeric ADD concatenates
                        let s = format!(
                            "{}{}",
                            self.to_string_value(env, &left),
                            self.to_string_value(env, &right)
                        );
                        Value::String(env.heap.alloc_string(s))
                    };
                    self.set_in_frame(ra, result);
                }
                Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                    let ra = self.next_byte();
                    let left = self.reg_or_const();
                    let right = self.reg_or_const();
                    let result = if left.is_integer() && right.is_integer() {
                        let li = left.as_int();
                        let ri = right.as_int();
                        match op {
                            Op::Sub => Value::Integer(li.wrapping_sub(ri)),
                            Op::Mul => Value::Integer(li.wrapping_mul(ri)),
                            Op::Div => {
                                if ri == 0 {
                                    Value::Float(f32::NAN)
                                } else {
                                    Value::Integer(li.wrapping_div(ri))
                                }
                            }
                            _ => {
                                if ri == 0 {
                                    Value::Float(f32::NAN)
                                } else {
                                    Value::Integer(li.wrapping_rem(ri))
                                }
                            }
                        }
                    } else {
                        let lf = self.to_float_value(env, &left);
                        let rf = self.to_float_value(env, &right);
                        match op {
                            Op::Sub => Value::Float(lf - rf),
                            Op::Mul => Value::Float(lf * rf),
                            Op::Div => Value::Float(lf / rf),
                            _ => Value::Float(lf % rf),
                        }
                    };
                    self.set_in_frame(ra, result);
                }
                Op::UMinus => {
                    let ra = self.next_byte();
                    let v = self.reg_or_const();
                    let result = if v.is_integer() {
                        Value::Integer(v.as_int().wrapping_neg())
                    } else {
                        Value::Float(-self.to_float_value(env, &v))
                    };
                    self.set_in_frame(ra, result);
                }
                Op::UNeg => {
                    let ra = self.next_byte();
                    let v = self.reg_or_const();
                    let result = if self.to_int_value(env, &v) == 0 { 1 } else { 0 };
                    self.set_in_frame(ra, Value::Integer(result));
                }
                Op::UNot => {
                    let ra = self.next_byte();
                    let v = self.reg_or_const();
                    let result = !self.to_int_value(env, &v);
                    self.set_in_frame(ra, Value::Integer(result));
                }
                Op::PreInc | Op::PreDec | Op::PostInc | Op::PostDec => {
                    let ra = self.next_byte();
                    let rb = self.next_byte();
                    let current = self.reg(rb);
                    let old = self.to_int_value(env, &current);
                    let new = if matches!(op, Op::PreInc | Op::PostInc) {
                        old.wrapping_add(1)
                    } else {
                        old.wrapping_sub(1)
                    };
                    if matches!(op, Op::PreInc | Op::PreDec) {
                        self.set_in_frame(rb, Value::Integer(new));
                        self.set_in_frame(ra, Value::Integer(new));
                    } else {
                        self.set_in_frame(ra, Value::Integer(old));
                        self.set_in_frame(rb, Value::Integer(new));
                    }
                }
                Op::Closure => {
                    let ra = self.next_byte();
                    let func = self.reg_or_const();
                    match self.make_closure(env, &func) {
                        Some(id) => self.set_in_frame(ra, Value::Object(id)),
                        None => self.print_runtime_error(env, "cannot make closure"),
                    }
                }
                Op::Call => {
                    let callee = self.reg_or_const();
                    let this = self.reg_or_const();
                    let nparams = self.next_byte() as u32;
                    let this = if this.is_defined() {
                        this
                    } else {
                        self.this_obj.map(Value::Object).unwrap_or(Value::Undefined)
                    };
                    let result = self.call_value(env, callee, this, nparams);
                    if let Some(ret) = self.finish_call(env, result, nparams) {
                        return ret;
                    }
                }
                Op::New => {
                    let target = self.reg_or_const();
                    let nparams = self.next_byte() as u32;
                    let result = self.construct_value(env, target, nparams);
                    if let Some(ret) = self.finish_call(env, result, nparams) {
                        return ret;
                    }
                }
                Op::CallProp => {
                    let obj = self.reg_or_const();
                    let prop = self.reg_or_const();
                    let nparams = self.next_byte() as u32;
                    let atom = self.to_id_value(env, &prop);
                    let result = self.call_property_value(env, obj, atom, nparams);
                    if result.is_error() {
                        let name = env.atoms.string_from(atom).to_string();
                        self.print_runtime_error(env, &format!("'{}'", name));
                    }
                    if let Some(ret) = self.finish_call(env, result, nparams) {
                        return ret;
                    }
                }
                Op::Jt | Op::Jf => {
                    let test = self.reg_or_const();
                    let sn = self.next_i16();
                    let mut take = self.to_bool_value(env, &test);
                    if op == Op::Jf {
                        take = !take;
                    }
                    if take {
                        self.pc = (instruction_start as i64 + sn as i64) as usize;
                    }
                }
                Op::Jmp => {
                    let sn = self.next_i16();
                    self.pc = (instruction_start as i64 + sn as i64) as usize;
                }
            }
        }
    }

    fn make_closure(&mut self, env: &mut Environment, func: &Value) -> Option<ObjId> {
        let func_id = func.as_object()?;
        let descs = env.heap.object(func_id)?.function()?.upvalues.clone();

        let mut upvalues: Vec<UpValueRef> = Vec::with_capacity(descs.len());
        for desc in &descs {
            let stack_index = self.up_value_stack_index(desc.index, desc.frame.saturating_sub(1));
            let up = Rc::new(RefCell::new(UpValue::open(stack_index)));
            self.open_upvalues.push(up.clone());
            env.heap
                .record_alloc(crate::gc::MemoryType::UpValue, std::mem::size_of::<UpValue>() as u32);
            upvalues.push(up);
        }

        let this = self
            .this_obj
            .map(Value::Object)
            .unwrap_or(Value::Undefined);
        let closure = HeapObject::new(ObjectKind::Closure(ClosureBody {
            func: func_id,
            this,
            upvalues,
        }));
        Some(env.heap.alloc_object(closure))
    }
}
