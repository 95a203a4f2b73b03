//! vm.rs — the stack-based bytecode interpreter.
//!
//! Owns every piece of mutable interpreter state explicitly (heap, value
//! stack, frame stack, open-upvalue list, globals, intern table) rather
//! than reaching for a process-wide global, per the "global mutable VM"
//! design note: a single owned value threaded through gives the same
//! semantics without an actual global.

use std::io::{self, Write};

use crate::chunk::Chunk;
use crate::compiler;
use crate::config::Config;
use crate::diagnostic::{InterpretError, RuntimeError, TraceFrame};
use crate::gc::{Gc, Roots};
use crate::object::{
    ArrayObj, BoundMethodObj, ClosureObj, GcRef, Heap, InstanceObj, NativeFn, NativeObj, Obj,
    UpvalueLocation, UpvalueObj,
};
use crate::table::Table;
use crate::value::Value;

const FRAMES_MAX: usize = 64;
const FRAME_STACK_SLOTS: usize = 256;
const STACK_MAX: usize = FRAMES_MAX * FRAME_STACK_SLOTS;

struct CallFrame {
    closure: GcRef,
    ip: usize,
    slots_base: usize,
}

enum Signal {
    Continue,
    Halt,
}

pub struct Vm {
    heap: Heap,
    gc: Gc,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<GcRef>,
    globals: Table,
    init_string: GcRef,
    config: Config,
    stdout: Box<dyn Write>,
}

enum Callee {
    Closure(GcRef),
    Native { arity: Option<u8>, func: NativeFn },
    Class { class: GcRef, init: Option<Value> },
    BoundMethod { method: GcRef, receiver: Value },
    Other,
}

impl Vm {
    pub fn new(config: Config) -> Self {
        Self::with_writer(config, Box::new(io::stdout()))
    }

    pub fn with_writer(config: Config, stdout: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_str("init");
        let gc = Gc::new(config.debug_stress_gc, config.debug_log_gc);
        Self {
            heap,
            gc,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            init_string,
            config,
            stdout,
        }
    }

    /// Registers a native callable, following the allocator contract:
    /// both the name string and the native object are kept reachable on
    /// the value stack across the two allocations that create them.
    pub fn define_native(&mut self, name: &str, arity: Option<u8>, func: NativeFn) {
        self.maybe_collect();
        let name_ref = self.heap.intern_str(name);
        self.stack.push(Value::Obj(name_ref));
        self.maybe_collect();
        let native_ref = self.heap.alloc_native(NativeObj { name: name_ref, arity, func });
        self.stack.push(Value::Obj(native_ref));
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
        self.stack.pop();
        self.stack.pop();
    }

    /// Compiles and runs `source` in this VM's existing global state,
    /// mirroring running successive REPL lines against one session.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_ref = compiler::compile(source, &mut self.heap, &self.config)
            .map_err(InterpretError::Compile)?;
        self.stack.push(Value::Obj(function_ref));
        let closure = self.heap.alloc_closure(ClosureObj { function: function_ref, upvalues: Vec::new() });
        self.stack.pop();
        self.stack.push(Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, slots_base: 0 });
        self.run().map_err(InterpretError::from)
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        let result = self.dispatch();
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        result
    }

    fn dispatch(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.config.debug_trace_execution {
                self.trace();
            }
            match self.step()? {
                Signal::Continue => {}
                Signal::Halt => return Ok(()),
            }
        }
    }

    fn trace(&self) {
        let function = self.current_function();
        let ip = self.frames.last().unwrap().ip;
        if let Obj::Function(f) = self.heap.get(function) {
            let stack_repr: Vec<String> = self.stack.iter().map(|v| self.stringify(*v)).collect();
            eprint!("          [{}]\n", stack_repr.join(", "));
            let (text, _) = crate::disasm::disassemble_instruction(&f.chunk, ip, &self.heap);
            eprintln!("{text}");
        }
    }

    // ----- byte/constant reading -----

    fn current_function(&self) -> GcRef {
        let closure = self.frames.last().expect("dispatch with no active frame").closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("frame closure is not a Closure object"),
        }
    }

    fn read_u8(&mut self) -> u8 {
        let function = self.current_function();
        let ip = self.frames.last().unwrap().ip;
        let byte = match self.heap.get(function) {
            Obj::Function(f) => f.chunk.code[ip],
            _ => unreachable!(),
        };
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn read_constant(&self, idx: usize) -> Value {
        let function = self.current_function();
        match self.heap.get(function) {
            Obj::Function(f) => f.chunk.constants[idx],
            _ => unreachable!(),
        }
    }

    fn read_name(&mut self, wide: bool) -> GcRef {
        let idx = if wide { self.read_u16() as usize } else { self.read_u8() as usize };
        self.read_constant(idx).as_obj().expect("name constant must be a string")
    }

    // ----- stack primitives -----

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop from empty stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn is_string(&self, v: Value) -> bool {
        matches!(v, Value::Obj(r) if matches!(self.heap.get(r), Obj::Str(_)))
    }

    fn is_array(&self, v: Value) -> bool {
        matches!(v, Value::Obj(r) if matches!(self.heap.get(r), Obj::Array(_)))
    }

    // ----- errors -----

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function,
                _ => unreachable!(),
            };
            match self.heap.get(function) {
                Obj::Function(f) => {
                    let line = f.chunk.line_at(frame.ip.saturating_sub(1).min(f.chunk.len().saturating_sub(1)));
                    let name = f.name.map(|n| self.heap.as_str(n).to_string());
                    trace.push(TraceFrame { line, name });
                }
                _ => unreachable!(),
            }
        }
        RuntimeError::new(message, trace)
    }

    // ----- garbage collection -----

    fn maybe_collect(&mut self) {
        if !self.gc.should_collect(&self.heap) {
            return;
        }
        let frame_closures: Vec<GcRef> = self.frames.iter().map(|f| f.closure).collect();
        let open_upvalues = self.open_upvalues.clone();
        let globals_keys: Vec<GcRef> = self.globals.iter().map(|(k, _)| k).collect();
        let extra_objects = [self.init_string];
        let roots = Roots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            open_upvalues: &open_upvalues,
            globals: Some(&self.globals),
            globals_keys: &globals_keys,
            extra_values: &[],
            extra_objects: &extra_objects,
        };
        self.gc.collect(&mut self.heap, &roots);
    }

    // ----- upvalues -----

    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        if let Some(&existing) = self.open_upvalues.iter().find(|&&r| {
            matches!(self.heap.get(r), Obj::Upvalue(u) if matches!(u.location, UpvalueLocation::Open(s) if s == slot))
        }) {
            return existing;
        }
        self.maybe_collect();
        let upvalue = self.heap.alloc_upvalue(UpvalueObj { location: UpvalueLocation::Open(slot) });
        let pos = self
            .open_upvalues
            .iter()
            .position(|&r| match self.heap.get(r) {
                Obj::Upvalue(u) => matches!(u.location, UpvalueLocation::Open(s) if s < slot),
                _ => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, limit: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            let slot = match self.heap.get(r) {
                Obj::Upvalue(u) => match u.location {
                    UpvalueLocation::Open(s) => Some(s),
                    UpvalueLocation::Closed(_) => None,
                },
                _ => unreachable!(),
            };
            match slot {
                Some(s) if s >= limit => {
                    let value = self.stack[s];
                    match self.heap.get_mut(r) {
                        Obj::Upvalue(u) => u.location = UpvalueLocation::Closed(value),
                        _ => unreachable!(),
                    }
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // ----- calling convention -----

    fn classify_callee(&self, r: GcRef) -> Callee {
        match self.heap.get(r) {
            Obj::Closure(_) => Callee::Closure(r),
            Obj::Native(n) => Callee::Native { arity: n.arity, func: n.func.clone() },
            Obj::Class(c) => Callee::Class { class: r, init: c.initializer },
            Obj::BoundMethod(b) => Callee::BoundMethod { method: b.method, receiver: b.receiver },
            _ => Callee::Other,
        }
    }

    fn call_closure(&mut self, closure: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let arity = match self.heap.get(function) {
            Obj::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let r = match callee {
            Value::Obj(r) => r,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match self.classify_callee(r) {
            Callee::Closure(c) => self.call_closure(c, argc),
            Callee::Native { arity, func } => {
                if let Some(a) = arity {
                    if a != argc {
                        return Err(self.runtime_error(format!("Expected {a} arguments but got {argc}.")));
                    }
                }
                let start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[start..].to_vec();
                let result = func(&mut self.heap, &args).map_err(|msg| self.runtime_error(msg))?;
                self.stack.truncate(start - 1);
                self.push(result)
            }
            Callee::Class { class, init } => {
                self.maybe_collect();
                let instance = self.heap.alloc_instance(InstanceObj { class, fields: Table::new() });
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Obj(instance);
                match init {
                    Some(Value::Obj(init_closure)) => self.call_closure(init_closure, argc),
                    _ => {
                        if argc != 0 {
                            Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            Callee::BoundMethod { method, receiver } => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Callee::Other => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn bind_method(&mut self, class: GcRef, name: GcRef) -> Result<Option<Value>, RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure_ref)) => {
                let receiver = self.peek(0);
                self.maybe_collect();
                let bound = self.heap.alloc_bound_method(BoundMethodObj { receiver, method: closure_ref });
                Ok(Some(Value::Obj(bound)))
            }
            _ => Ok(None),
        }
    }

    fn invoke_from_class(&mut self, class: GcRef, name: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure_ref)) => self.call_closure(closure_ref, argc),
            _ => Err(self.runtime_error(format!("Undefined property '{}'.", self.heap.as_str(name)))),
        }
    }

    fn invoke(&mut self, name: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.heap.string_hash(name);
        let (class_ref, field) = match self.heap.get(instance_ref) {
            Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(class_ref, name, argc)
    }

    // ----- arithmetic -----

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(x + y))
            }
            _ if self.is_string(a) && self.is_string(b) => {
                let sa = self.heap.as_str(a.as_obj().unwrap()).to_string();
                let sb = self.heap.as_str(b.as_obj().unwrap()).to_string();
                self.maybe_collect();
                let result = self.heap.intern_str(&format!("{sa}{sb}"));
                self.pop();
                self.pop();
                self.push(Value::Obj(result))
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn binary_number(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(f(x, y)))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_compare(&mut self, f: impl FnOnce(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(Value::Bool(f(x, y)))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn index_from(&self, v: Value) -> Result<usize, RuntimeError> {
        match v.as_number() {
            Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
            _ => Err(self.runtime_error("Index must be a non-negative integer.")),
        }
    }

    // ----- globals -----

    fn define_global(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let name = self.read_name(wide);
        let value = self.pop();
        let hash = self.heap.string_hash(name);
        self.globals.set(name, hash, value);
        Ok(())
    }

    fn get_global(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let name = self.read_name(wide);
        let hash = self.heap.string_hash(name);
        match self.globals.get(name, hash) {
            Some(v) => self.push(v),
            None => Err(self.runtime_error(format!("Undefined variable '{}'.", self.heap.as_str(name)))),
        }
    }

    /// `wide` reflects the 16-bit variant's own name-index width; unlike
    /// the original source, which mistakenly read an 8-bit index here
    /// regardless of opcode, this always honours the opcode it was
    /// dispatched from.
    fn set_global(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let name = self.read_name(wide);
        let value = self.peek(0);
        let hash = self.heap.string_hash(name);
        if self.globals.set(name, hash, value) {
            self.globals.delete(name, hash);
            return Err(self.runtime_error(format!("Undefined variable '{}'.", self.heap.as_str(name))));
        }
        Ok(())
    }

    // ----- output -----

    fn class_name_str(&self, class: GcRef) -> &str {
        match self.heap.get(class) {
            Obj::Class(c) => self.heap.as_str(c.name),
            _ => unreachable!(),
        }
    }

    pub fn stringify(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format!("{n}"),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Str(s) => s.chars.clone(),
                Obj::Function(f) => match f.name {
                    Some(name) => format!("<fn {}>", self.heap.as_str(name)),
                    None => "<script>".to_string(),
                },
                Obj::Closure(c) => self.stringify(Value::Obj(c.function)),
                Obj::Native(_) => "<native fn>".to_string(),
                Obj::Class(c) => self.heap.as_str(c.name).to_string(),
                Obj::Instance(i) => format!("<{} instance>", self.class_name_str(i.class)),
                Obj::BoundMethod(b) => self.stringify(Value::Obj(b.method)),
                Obj::Upvalue(_) => "<upvalue>".to_string(),
                Obj::Array(a) => {
                    let items: Vec<String> = a.items.iter().map(|v| self.stringify(*v)).collect();
                    format!("[{}]", items.join(", "))
                }
            },
        }
    }

    // ----- the dispatch loop -----

    fn step(&mut self) -> Result<Signal, RuntimeError> {
        use crate::op::Op;

        let byte = self.read_u8();
        let op = Op::try_from(byte).map_err(|_| self.runtime_error(format!("Unknown opcode {byte}.")))?;

        match op {
            Op::Constant => {
                let idx = self.read_u8() as usize;
                let v = self.read_constant(idx);
                self.push(v)?;
            }
            Op::Constant16 => {
                let idx = self.read_u16() as usize;
                let v = self.read_constant(idx);
                self.push(v)?;
            }
            Op::Nil => self.push(Value::Nil)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let v = self.peek(0);
                self.push(v)?;
            }
            Op::GetLocal => {
                let idx = self.read_u8() as usize;
                let slot = self.frames.last().unwrap().slots_base + idx;
                self.push(self.stack[slot])?;
            }
            Op::SetLocal => {
                let idx = self.read_u8() as usize;
                let slot = self.frames.last().unwrap().slots_base + idx;
                self.stack[slot] = self.peek(0);
            }
            Op::GetUpvalue => {
                let idx = self.read_u8() as usize;
                let closure = self.frames.last().unwrap().closure;
                let upvalue_ref = match self.heap.get(closure) {
                    Obj::Closure(c) => c.upvalues[idx],
                    _ => unreachable!(),
                };
                let value = match self.heap.get(upvalue_ref) {
                    Obj::Upvalue(u) => match u.location {
                        UpvalueLocation::Open(slot) => self.stack[slot],
                        UpvalueLocation::Closed(v) => v,
                    },
                    _ => unreachable!(),
                };
                self.push(value)?;
            }
            Op::SetUpvalue => {
                let idx = self.read_u8() as usize;
                let value = self.peek(0);
                let closure = self.frames.last().unwrap().closure;
                let upvalue_ref = match self.heap.get(closure) {
                    Obj::Closure(c) => c.upvalues[idx],
                    _ => unreachable!(),
                };
                match self.heap.get_mut(upvalue_ref) {
                    Obj::Upvalue(u) => match u.location {
                        UpvalueLocation::Open(slot) => self.stack[slot] = value,
                        UpvalueLocation::Closed(_) => u.location = UpvalueLocation::Closed(value),
                    },
                    _ => unreachable!(),
                }
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }
            Op::DefineGlobal => self.define_global(false)?,
            Op::DefineGlobal16 => self.define_global(true)?,
            Op::GetGlobal => self.get_global(false)?,
            Op::GetGlobal16 => self.get_global(true)?,
            Op::SetGlobal => self.set_global(false)?,
            Op::SetGlobal16 => self.set_global(true)?,
            Op::Add => self.op_add()?,
            Op::Subtract => self.binary_number(|a, b| a - b)?,
            Op::Multiply => self.binary_number(|a, b| a * b)?,
            Op::Divide => self.binary_number(|a, b| a / b)?,
            Op::Negate => {
                let v = self.peek(0);
                match v.as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n))?;
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                }
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(Value::values_equal(a, b)))?;
            }
            Op::Greater => self.binary_compare(|a, b| a > b)?,
            Op::Less => self.binary_compare(|a, b| a < b)?,
            Op::Not => {
                let v = self.pop();
                self.push(Value::Bool(!v.is_truthy()))?;
            }
            Op::Print => {
                let v = self.pop();
                let s = self.stringify(v);
                let _ = writeln!(self.stdout, "{s}");
            }
            Op::Jump => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            Op::JumpIfFalse => {
                let offset = self.read_u16();
                if !self.peek(0).is_truthy() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            Op::Loop => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }
            Op::Call => {
                let argc = self.read_u8();
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            Op::Invoke => {
                let name = self.read_name(false);
                let argc = self.read_u8();
                self.invoke(name, argc)?;
            }
            Op::SuperInvoke => {
                let name = self.read_name(false);
                let argc = self.read_u8();
                let superclass = self.pop();
                let class_ref = superclass.as_obj().expect("superclass operand must be a class");
                self.invoke_from_class(class_ref, name, argc)?;
            }
            Op::Closure => {
                let const_idx = self.read_u8() as usize;
                let function_ref = self.read_constant(const_idx).as_obj().expect("closure operand must be a function");
                let upvalue_count = match self.heap.get(function_ref) {
                    Obj::Function(f) => f.upvalue_count,
                    _ => unreachable!(),
                };
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let is_local = self.read_u8() != 0;
                    let index = self.read_u8() as usize;
                    if is_local {
                        let slot = self.frames.last().unwrap().slots_base + index;
                        upvalues.push(self.capture_upvalue(slot));
                    } else {
                        let enclosing = self.frames.last().unwrap().closure;
                        let parent_upvalue = match self.heap.get(enclosing) {
                            Obj::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(parent_upvalue);
                    }
                }
                self.maybe_collect();
                let closure = self.heap.alloc_closure(ClosureObj { function: function_ref, upvalues });
                self.push(Value::Obj(closure))?;
            }
            Op::Class => {
                let name = self.read_name(false);
                self.maybe_collect();
                let class = self.heap.alloc_class(crate::object::ClassObj {
                    name,
                    methods: Table::new(),
                    initializer: None,
                });
                self.push(Value::Obj(class))?;
            }
            Op::Inherit => {
                let superclass_val = self.peek(1);
                let superclass_ref = match superclass_val {
                    Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                    _ => return Err(self.runtime_error("Superclass must be a class.")),
                };
                let subclass_ref = self.peek(0).as_obj().expect("subclass operand must be a class");
                let super_methods = match self.heap.get(superclass_ref) {
                    Obj::Class(c) => c.methods.clone(),
                    _ => unreachable!(),
                };
                match self.heap.get_mut(subclass_ref) {
                    Obj::Class(c) => super_methods.add_all_into(&mut c.methods),
                    _ => unreachable!(),
                }
                self.pop();
            }
            Op::Method => {
                let name = self.read_name(false);
                let method = self.peek(0);
                let class_ref = self.peek(1).as_obj().expect("class operand must be a class");
                let hash = self.heap.string_hash(name);
                let is_init = name == self.init_string;
                match self.heap.get_mut(class_ref) {
                    Obj::Class(c) => {
                        c.methods.set(name, hash, method);
                        if is_init {
                            c.initializer = Some(method);
                        }
                    }
                    _ => unreachable!(),
                }
                self.pop();
            }
            Op::GetProperty => {
                let name = self.read_name(false);
                let receiver = self.peek(0);
                let instance_ref = match receiver {
                    Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
                    _ => return Err(self.runtime_error("Only instances have properties.")),
                };
                let hash = self.heap.string_hash(name);
                let field = match self.heap.get(instance_ref) {
                    Obj::Instance(i) => i.fields.get(name, hash),
                    _ => unreachable!(),
                };
                if let Some(v) = field {
                    self.pop();
                    self.push(v)?;
                } else {
                    let class_ref = match self.heap.get(instance_ref) {
                        Obj::Instance(i) => i.class,
                        _ => unreachable!(),
                    };
                    match self.bind_method(class_ref, name)? {
                        Some(bound) => {
                            self.pop();
                            self.push(bound)?;
                        }
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined property '{}'.",
                                self.heap.as_str(name)
                            )))
                        }
                    }
                }
            }
            Op::SetProperty => {
                let name = self.read_name(false);
                let value = self.peek(0);
                let receiver = self.peek(1);
                let instance_ref = match receiver {
                    Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
                    _ => return Err(self.runtime_error("Only instances have fields.")),
                };
                let hash = self.heap.string_hash(name);
                match self.heap.get_mut(instance_ref) {
                    Obj::Instance(i) => i.fields.set(name, hash, value),
                    _ => unreachable!(),
                };
                self.pop();
                self.pop();
                self.push(value)?;
            }
            Op::GetSuper => {
                let name = self.read_name(false);
                let superclass = self.pop();
                let superclass_ref = superclass.as_obj().expect("superclass operand must be a class");
                match self.bind_method(superclass_ref, name)? {
                    Some(bound) => {
                        self.pop();
                        self.push(bound)?;
                    }
                    None => {
                        return Err(self.runtime_error(format!(
                            "Undefined property '{}'.",
                            self.heap.as_str(name)
                        )))
                    }
                }
            }
            Op::Array => {
                let n = self.read_u8() as usize;
                let mut items = vec![Value::Nil; n];
                for i in (0..n).rev() {
                    items[i] = self.pop();
                }
                self.maybe_collect();
                let arr = self.heap.alloc_array(ArrayObj { items });
                self.push(Value::Obj(arr))?;
            }
            Op::GetIndex => {
                let index_val = self.pop();
                let array_val = self.pop();
                if !self.is_array(array_val) {
                    return Err(self.runtime_error("Only arrays can be indexed."));
                }
                let arr_ref = array_val.as_obj().unwrap();
                let idx = self.index_from(index_val)?;
                let item = match self.heap.get(arr_ref) {
                    Obj::Array(a) => a.items.get(idx).copied(),
                    _ => unreachable!(),
                };
                match item {
                    Some(v) => self.push(v)?,
                    None => return Err(self.runtime_error("Array index out of bounds.")),
                }
            }
            Op::SetIndex => {
                let value = self.peek(0);
                let index_val = self.peek(1);
                let array_val = self.peek(2);
                if !self.is_array(array_val) {
                    return Err(self.runtime_error("Only arrays can be indexed."));
                }
                let arr_ref = array_val.as_obj().unwrap();
                let idx = self.index_from(index_val)?;
                match self.heap.get_mut(arr_ref) {
                    Obj::Array(a) => {
                        if idx >= a.items.len() {
                            return Err(self.runtime_error("Array index out of bounds."));
                        }
                        a.items[idx] = value;
                    }
                    _ => unreachable!(),
                }
                self.pop();
                self.pop();
                self.pop();
                self.push(value)?;
            }
            Op::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("return with no active frame");
                self.close_upvalues(frame.slots_base);
                if self.frames.is_empty() {
                    self.pop();
                    return Ok(Signal::Halt);
                }
                self.stack.truncate(frame.slots_base);
                self.push(result)?;
            }
        }

        Ok(Signal::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_capture(source: &str) -> String {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_writer(Config::default(), Box::new(buf.clone()));
        vm.interpret(source).expect("program should run without error");
        let bytes = buf.0.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run_capture("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run_capture("var a = \"he\"; var b = \"llo\"; print a + b;"), "hello\n");
    }

    #[test]
    fn closures_share_upvalue_after_return() {
        let src = "fun make(){var x=0; fun inc(){x = x+1; return x;} return inc;} \
                   var f=make(); print f(); print f(); print f();";
        assert_eq!(run_capture(src), "1\n2\n3\n");
    }

    #[test]
    fn type_mismatch_on_add_errors() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_writer(Config::default(), Box::new(buf.clone()));
        let err = vm.interpret("print 1 + \"x\";").unwrap_err();
        assert!(matches!(err, InterpretError::Runtime(_)));
    }
}
