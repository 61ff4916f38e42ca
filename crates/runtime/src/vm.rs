//! The stack-based virtual machine.
//!
//! A `Vm` owns the heap, the value stack, the call frames, the globals
//! and builtin member tables, and the open-upvalue list. `interpret`
//! compiles source text, wraps the script function in a closure, and
//! drives the dispatch loop until the script returns or fails.
//!
//! Collection runs at dispatch boundaries once the heap reports
//! allocation pressure, so no instruction can lose a transient object
//! mid-flight. Runtime errors capture the frame stack as a trace and
//! reset the VM; the `kill` flag aborts the run at the next boundary.

use std::io::Write;
use std::time::{Duration, Instant};

use raven_core::{
    Handle, Heap, NativeError, NativeFn, NativeHost, Obj, ObjBoundMethod, ObjBoundNative,
    ObjClass, ObjClosure, ObjInstance, ObjNative, ObjUpvalue, OpCode, Table, UpvalueState, Value,
};
use raven_compiler::compile;
use tracing::debug;

use crate::builtins::{Builtins, clock};
use crate::error::{InterpretError, RuntimeError};

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: Handle,
    /// The closure's function, cached to keep instruction decoding short.
    function: Handle,
    ip: usize,
    /// Stack index of slot 0 (the callee / receiver position).
    slots: usize,
}

/// How a call target should be entered, extracted from the heap before
/// any mutation happens.
enum Callee {
    Closure(Handle),
    BoundMethod(ObjBoundMethod),
    BoundNative(ObjBoundNative),
    Class { class: Handle, init: Option<Value> },
    Native(NativeFn),
    NotCallable,
}

pub struct Vm {
    heap: Heap,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    builtins: Builtins,
    /// Open upvalues sorted by strictly descending stack slot.
    open_upvalues: Vec<Handle>,
    /// One-slot scratch register for compiler-emitted save/restore
    /// sequences.
    reserve: Value,
    init_string: Handle,
    /// The shared `none` object, so `none == none` holds by identity.
    none_singleton: Handle,
    start: Instant,
    kill: bool,
    out: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl NativeHost for Vm {
    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_output(Box::new(std::io::stdout()))
    }

    /// A VM whose program output goes to `out` instead of stdout.
    pub fn with_output(out: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let none_singleton = heap.allocate(Obj::Option(None));
        let builtins = Builtins::new(&mut heap);

        let mut globals = Table::new();
        let clock_name = heap.intern("clock");
        let clock_hash = heap.string(clock_name).hash;
        let clock_native = heap.allocate(Obj::Native(ObjNative {
            function: clock,
            arity: 0,
        }));
        globals.set(
            Value::object(clock_name),
            clock_hash,
            Value::object(clock_native),
        );

        Vm {
            heap,
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(256),
            globals,
            builtins,
            open_upvalues: Vec::new(),
            reserve: Value::NIL,
            init_string,
            none_singleton,
            start: Instant::now(),
            kill: false,
            out,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Request termination at the next dispatch boundary.
    pub fn set_kill(&mut self) {
        self.kill = true;
    }

    /// Compile and run one source text. Globals persist across calls, so
    /// a REPL can feed lines to the same VM.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap)?;
        self.reset_stack();

        self.push(Value::object(function))?;
        let closure = self.heap.allocate(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::object(closure))?;
        self.call_closure(closure, 0)?;
        self.run()?;
        self.out.flush().ok();
        Ok(())
    }

    // ---- Stack primitives ----

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.reserve = Value::NIL;
        self.kill = false;
    }

    // ---- Instruction decoding ----

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("active call frame");
        let byte = match self.heap.get(frame.function) {
            Obj::Function(f) => f.chunk.code[frame.ip],
            _ => unreachable!("frame function handle"),
        };
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("active call frame");
        match self.heap.get(frame.function) {
            Obj::Function(f) => f.chunk.constants[index],
            _ => unreachable!("frame function handle"),
        }
    }

    /// Read a constant that the compiler guaranteed is an interned
    /// string; returns its handle and hash.
    fn read_string_constant(&mut self) -> (Handle, u32) {
        let value = self.read_constant();
        let handle = value.as_object().expect("string constant");
        let hash = self.heap.string(handle).hash;
        (handle, hash)
    }

    // ---- Errors ----

    /// Build a runtime error carrying the stack trace, then unwind.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = match self.heap.get(frame.function) {
                Obj::Function(f) => f,
                _ => unreachable!("frame function handle"),
            };
            let line = function.chunk.lines[frame.ip.saturating_sub(1).min(
                function.chunk.lines.len().saturating_sub(1),
            )];
            let name = match function.name {
                Some(name) => format!("{}()", self.heap.string_chars(name)),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, name));
        }
        let error = RuntimeError {
            message: message.into(),
            trace,
        };
        self.reset_stack();
        error
    }

    // ---- Dispatch loop ----

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let op = OpCode::try_from(self.read_byte())
                .map_err(|byte| self.runtime_error(format!("Unknown opcode {}.", byte)))?;

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::NIL)?,
                OpCode::True => self.push(Value::TRUE)?,
                OpCode::False => self.push(Value::FALSE)?,
                OpCode::Int => {
                    let byte = self.read_byte();
                    self.push(Value::number(f64::from(byte)))?;
                }
                OpCode::List => {
                    let count = self.read_byte() as usize;
                    let items = self.stack.split_off(self.stack.len() - count);
                    let list = self.heap.allocate(Obj::List(items));
                    self.push(Value::object(list))?;
                }
                OpCode::Dict => {
                    let count = self.read_byte() as usize;
                    let pairs = self.stack.split_off(self.stack.len() - 2 * count);
                    let mut entries = Table::new();
                    for pair in pairs.chunks_exact(2) {
                        let (key, value) = (pair[0], pair[1]);
                        let Some(hash) = self.heap.hash_value(key) else {
                            return Err(self.runtime_error("Unhashable type."));
                        };
                        entries.set(key, hash, value);
                    }
                    let dict = self.heap.allocate(Obj::Dict(entries));
                    self.push(Value::object(dict))?;
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("active call frame").slots;
                    let value = self.stack[base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("active call frame").slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let (name, hash) = self.read_string_constant();
                    match self.globals.get(Value::object(name), hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                self.heap.string_chars(name)
                            );
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let (name, hash) = self.read_string_constant();
                    let value = self.pop();
                    self.globals.set(Value::object(name), hash, value);
                }
                OpCode::SetGlobal => {
                    let (name, hash) = self.read_string_constant();
                    let value = self.peek(0);
                    if self.globals.set(Value::object(name), hash, value) {
                        self.globals.delete(Value::object(name), hash);
                        let message = format!(
                            "Undefined variable '{}'.",
                            self.heap.string_chars(name)
                        );
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frames.last().expect("active call frame").closure;
                    let upvalue = match self.heap.get(closure) {
                        Obj::Closure(c) => c.upvalues[index],
                        _ => unreachable!("frame closure handle"),
                    };
                    let value = match self.upvalue_state(upvalue) {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frames.last().expect("active call frame").closure;
                    let upvalue = match self.heap.get(closure) {
                        Obj::Closure(c) => c.upvalues[index],
                        _ => unreachable!("frame closure handle"),
                    };
                    let value = self.peek(0);
                    match self.upvalue_state(upvalue) {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => match self.heap.get_mut(upvalue) {
                            Obj::Upvalue(u) => u.state = UpvalueState::Closed(value),
                            _ => unreachable!("upvalue handle"),
                        },
                    }
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetSuper => {
                    let (name, hash) = self.read_string_constant();
                    let superclass = self.pop();
                    self.bind_method(superclass, name, hash)?;
                }
                OpCode::GetIndex => self.get_index()?,
                OpCode::SetIndex => self.set_index()?,
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a == b))?;
                }
                OpCode::Greater => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::boolean(a > b))?;
                }
                OpCode::Less => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::boolean(a < b))?;
                }
                OpCode::Add => self.add()?,
                OpCode::Subtract => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::number(a - b))?;
                }
                OpCode::Multiply => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::number(a * b))?;
                }
                OpCode::Divide => {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::number(a / b))?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    let falsy = self.heap.is_falsy(value);
                    self.push(Value::boolean(falsy))?;
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.push(Value::number(-n))?,
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let rendered = self.heap.format_value(self.peek(0));
                    if let Err(e) = writeln!(self.out, "{}", rendered) {
                        return Err(self.runtime_error(format!("I/O error: {}.", e)));
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("active call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.heap.is_falsy(self.peek(0)) {
                        self.frames.last_mut().expect("active call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("active call frame").ip -= offset;
                }
                OpCode::NextJump => self.next_jump()?,
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let (name, hash) = self.read_string_constant();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, hash, argc)?;
                }
                OpCode::SuperInvoke => {
                    let (name, hash) = self.read_string_constant();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop();
                    let class = superclass.as_object().expect("superclass on stack");
                    self.invoke_from_class(class, name, hash, argc)?;
                }
                OpCode::Closure => self.make_closure()?,
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("active call frame");
                    self.close_upvalues(frame.slots);
                    self.stack.truncate(frame.slots);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                OpCode::Class => {
                    let (name, _) = self.read_string_constant();
                    let class = self.heap.allocate(Obj::Class(ObjClass::new(name)));
                    self.push(Value::object(class))?;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let methods = match superclass.as_object().map(|h| self.heap.get(h)) {
                        Some(Obj::Class(c)) => c.methods.clone(),
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass = self.peek(0).as_object().expect("subclass on stack");
                    match self.heap.get_mut(subclass) {
                        Obj::Class(c) => methods.add_all(&mut c.methods),
                        _ => unreachable!("subclass handle"),
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let (name, hash) = self.read_string_constant();
                    let method = self.peek(0);
                    let class = self.peek(1).as_object().expect("class on stack");
                    match self.heap.get_mut(class) {
                        Obj::Class(c) => {
                            c.methods.set(Value::object(name), hash, method);
                        }
                        _ => unreachable!("class handle"),
                    }
                    self.pop();
                }
                OpCode::GetReserve => {
                    let value = self.reserve;
                    self.push(value)?;
                }
                OpCode::SetReserve => {
                    self.reserve = self.pop();
                }
                OpCode::NoneOption => {
                    let none = self.none_singleton;
                    self.push(Value::object(none))?;
                }
                OpCode::SomeOption => {
                    let value = self.pop();
                    let option = self.heap.allocate(Obj::Option(Some(value)));
                    self.push(Value::object(option))?;
                }
            }

            if self.kill {
                return Err(self.runtime_error("Execution killed."));
            }
        }
    }

    // ---- Arithmetic helpers ----

    fn pop_number_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            return self.push(Value::number(a + b));
        }
        let strings = match (a.as_object(), b.as_object()) {
            (Some(ha), Some(hb)) => match (self.heap.get(ha), self.heap.get(hb)) {
                (Obj::String(sa), Obj::String(sb)) => {
                    Some(format!("{}{}", sa.chars, sb.chars))
                }
                _ => None,
            },
            _ => None,
        };
        match strings {
            Some(joined) => {
                let handle = self.heap.intern(&joined);
                self.pop();
                self.pop();
                self.push(Value::object(handle))
            }
            None => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    // ---- Properties and indexing ----

    /// Member table for built-in receiver types, if the value has one.
    fn builtin_members(&self, receiver: Value) -> Option<&Table> {
        let handle = receiver.as_object()?;
        match self.heap.get(handle) {
            Obj::String(_) => Some(&self.builtins.string),
            Obj::List(_) => Some(&self.builtins.list),
            Obj::Dict(_) => Some(&self.builtins.dict),
            Obj::Option(_) => Some(&self.builtins.option),
            _ => None,
        }
    }

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let (name, hash) = self.read_string_constant();
        let receiver = self.peek(0);

        if let Some(handle) = receiver.as_object() {
            if let Obj::Instance(instance) = self.heap.get(handle) {
                // Fields shadow class methods.
                if let Some(field) = instance.fields.get(Value::object(name), hash) {
                    self.pop();
                    return self.push(field);
                }
                let class = Value::object(instance.class);
                return self.bind_method(class, name, hash);
            }
        }

        if let Some(members) = self.builtin_members(receiver) {
            return match members.get(Value::object(name), hash) {
                Some(native) => {
                    let native = self.native_object(native);
                    if native.arity == 0 {
                        // Attribute-style member: evaluate in place, with
                        // the receiver already sitting in the callee slot.
                        self.call_native(native.function, 0)
                    } else {
                        let bound = self.heap.allocate(Obj::BoundNative(ObjBoundNative {
                            receiver,
                            function: native.function,
                        }));
                        self.pop();
                        self.push(Value::object(bound))
                    }
                }
                None => {
                    let message =
                        format!("Undefined property '{}'.", self.heap.string_chars(name));
                    Err(self.runtime_error(message))
                }
            };
        }

        Err(self.runtime_error("Value has no properties."))
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let (name, hash) = self.read_string_constant();
        let receiver = self.peek(1);
        let Some(instance) = receiver.as_object().filter(|&h| {
            matches!(self.heap.get(h), Obj::Instance(_))
        }) else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        let value = self.pop();
        self.pop();
        match self.heap.get_mut(instance) {
            Obj::Instance(i) => {
                i.fields.set(Value::object(name), hash, value);
            }
            _ => unreachable!("instance handle"),
        }
        self.push(value)
    }

    /// Pop the receiver on top of the stack and push `name` bound to it
    /// from `class`'s method table.
    fn bind_method(
        &mut self,
        class: Value,
        name: Handle,
        hash: u32,
    ) -> Result<(), RuntimeError> {
        let class = class.as_object().expect("class value");
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(Value::object(name), hash),
            _ => unreachable!("class handle"),
        };
        match method {
            Some(method) => {
                let receiver = self.peek(0);
                let closure = method.as_object().expect("method closure");
                let bound = self.heap.allocate(Obj::BoundMethod(ObjBoundMethod {
                    receiver,
                    method: closure,
                }));
                self.pop();
                self.push(Value::object(bound))
            }
            None => {
                let message = format!("Undefined property '{}'.", self.heap.string_chars(name));
                Err(self.runtime_error(message))
            }
        }
    }

    fn get_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let target = self.pop();
        let Some(handle) = target.as_object() else {
            return Err(self.runtime_error("Value is not indexable."));
        };

        enum Target {
            List(usize),
            Str(usize),
            Dict,
            Other,
        }

        let kind = match self.heap.get(handle) {
            Obj::List(items) => Target::List(items.len()),
            Obj::String(s) => Target::Str(s.chars.chars().count()),
            Obj::Dict(_) => Target::Dict,
            _ => Target::Other,
        };

        match kind {
            Target::List(length) => {
                let i = self.check_list_index(index, length)?;
                let value = match self.heap.get(handle) {
                    Obj::List(items) => items[i],
                    _ => unreachable!("list handle"),
                };
                self.push(value)
            }
            Target::Str(length) => {
                let i = self.check_string_index(index, length)?;
                let ch = match self.heap.get(handle) {
                    Obj::String(s) => s.chars.chars().nth(i).expect("index in bounds"),
                    _ => unreachable!("string handle"),
                };
                let element = self.heap.intern(&ch.to_string());
                self.push(Value::object(element))
            }
            Target::Dict => {
                let Some(hash) = self.heap.hash_value(index) else {
                    return Err(self.runtime_error("Unhashable type."));
                };
                let found = match self.heap.get(handle) {
                    Obj::Dict(entries) => entries.get(index, hash),
                    _ => unreachable!("dict handle"),
                };
                match found {
                    Some(value) => self.push(value),
                    None => {
                        let message =
                            format!("Undefined key '{}'.", self.heap.format_value(index));
                        Err(self.runtime_error(message))
                    }
                }
            }
            Target::Other => Err(self.runtime_error("Value is not indexable.")),
        }
    }

    fn set_index(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let target = self.pop();
        let Some(handle) = target.as_object() else {
            return Err(self.runtime_error("Value does not support index assignment."));
        };

        let list_length = match self.heap.get(handle) {
            Obj::List(items) => Some(items.len()),
            Obj::Dict(_) => None,
            _ => return Err(self.runtime_error("Value does not support index assignment.")),
        };

        match list_length {
            Some(length) => {
                let i = self.check_list_index(index, length)?;
                match self.heap.get_mut(handle) {
                    Obj::List(items) => items[i] = value,
                    _ => unreachable!("list handle"),
                }
            }
            None => {
                let Some(hash) = self.heap.hash_value(index) else {
                    return Err(self.runtime_error("Unhashable type."));
                };
                match self.heap.get_mut(handle) {
                    Obj::Dict(entries) => {
                        entries.set(index, hash, value);
                    }
                    _ => unreachable!("dict handle"),
                }
            }
        }
        self.push(value)
    }

    fn check_list_index(&mut self, index: Value, length: usize) -> Result<usize, RuntimeError> {
        let number = match index.as_number() {
            Some(n) if n.fract() == 0.0 => n,
            _ => return Err(self.runtime_error("List index must be a whole number.")),
        };
        if number < 0.0 || number >= length as f64 {
            return Err(self.runtime_error("List index out of bounds."));
        }
        Ok(number as usize)
    }

    fn check_string_index(
        &mut self,
        index: Value,
        length: usize,
    ) -> Result<usize, RuntimeError> {
        let number = match index.as_number() {
            Some(n) if n.fract() == 0.0 => n,
            _ => return Err(self.runtime_error("String index must be a whole number.")),
        };
        if number < 0.0 || number >= length as f64 {
            return Err(self.runtime_error("String index out of bounds."));
        }
        Ok(number as usize)
    }

    // ---- Iteration ----

    fn next_jump(&mut self) -> Result<(), RuntimeError> {
        let offset = self.read_short() as usize;
        let index = self
            .pop()
            .as_number()
            .expect("iteration index is a number") as usize;
        let iterable = self.peek(0);

        enum Next {
            Value(Value),
            Char(char),
            Done,
        }

        let next = match iterable.as_object().map(|h| self.heap.get(h)) {
            Some(Obj::List(items)) => match items.get(index) {
                Some(&value) => Next::Value(value),
                None => Next::Done,
            },
            Some(Obj::String(s)) => match s.chars.chars().nth(index) {
                Some(c) => Next::Char(c),
                None => Next::Done,
            },
            _ => return Err(self.runtime_error("Only lists and strings are iterable.")),
        };

        match next {
            Next::Value(value) => {
                self.push(Value::number((index + 1) as f64))?;
                self.push(value)
            }
            Next::Char(c) => {
                // Characters come back as single-character strings.
                let element = self.heap.intern(&c.to_string());
                self.push(Value::number((index + 1) as f64))?;
                self.push(Value::object(element))
            }
            Next::Done => {
                // Exhausted: jump past the loop, pushing nothing.
                self.frames.last_mut().expect("active call frame").ip += offset;
                Ok(())
            }
        }
    }

    // ---- Calls ----

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let kind = match callee.as_object() {
            Some(handle) => match self.heap.get(handle) {
                Obj::Closure(_) => Callee::Closure(handle),
                Obj::BoundMethod(b) => Callee::BoundMethod(*b),
                Obj::BoundNative(b) => Callee::BoundNative(*b),
                Obj::Native(n) => Callee::Native(n.function),
                Obj::Class(c) => {
                    let init_hash = self.heap.string(self.init_string).hash;
                    Callee::Class {
                        class: handle,
                        init: c.methods.get(Value::object(self.init_string), init_hash),
                    }
                }
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match kind {
            Callee::Closure(closure) => self.call_closure(closure, argc),
            Callee::BoundMethod(bound) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, argc)
            }
            Callee::BoundNative(bound) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bound.receiver;
                self.call_native(bound.function, argc)
            }
            Callee::Native(function) => self.call_native(function, argc),
            Callee::Class { class, init } => {
                let instance = self.heap.allocate(Obj::Instance(ObjInstance::new(class)));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = Value::object(instance);
                match init {
                    Some(init) => {
                        let closure = init.as_object().expect("initializer closure");
                        self.call_closure(closure, argc)
                    }
                    None if argc != 0 => Err(self.runtime_error(format!(
                        "Expected 0 arguments but got {}.",
                        argc
                    ))),
                    None => Ok(()),
                }
            }
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes."))
            }
        }
    }

    fn call_closure(&mut self, closure: Handle, argc: usize) -> Result<(), RuntimeError> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("closure handle"),
        };
        let arity = match self.heap.get(function) {
            Obj::Function(f) => f.arity as usize,
            _ => unreachable!("function handle"),
        };
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, argc
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_native(&mut self, function: NativeFn, argc: usize) -> Result<(), RuntimeError> {
        let base = self.stack.len() - argc;
        let receiver = self.stack[base - 1];
        let args: Vec<Value> = self.stack[base..].to_vec();
        match function(self, receiver, &args) {
            Ok(result) => {
                self.stack.truncate(base - 1);
                self.push(result)
            }
            Err(NativeError::Runtime(message)) => Err(self.runtime_error(message)),
            Err(NativeError::Fatal(message)) => {
                self.kill = true;
                Err(self.runtime_error(message))
            }
        }
    }

    fn invoke(&mut self, name: Handle, hash: u32, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);

        if let Some(handle) = receiver.as_object() {
            if let Obj::Instance(instance) = self.heap.get(handle) {
                // A field shadows the method and is called unbound.
                if let Some(field) = instance.fields.get(Value::object(name), hash) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = field;
                    return self.call_value(field, argc);
                }
                let class = instance.class;
                return self.invoke_from_class(class, name, hash, argc);
            }
        }

        if let Some(members) = self.builtin_members(receiver) {
            return match members.get(Value::object(name), hash) {
                Some(native) => {
                    let function = self.native_object(native).function;
                    self.call_native(function, argc)
                }
                None => {
                    let message =
                        format!("Undefined property '{}'.", self.heap.string_chars(name));
                    Err(self.runtime_error(message))
                }
            };
        }

        Err(self.runtime_error("Value has no properties."))
    }

    fn invoke_from_class(
        &mut self,
        class: Handle,
        name: Handle,
        hash: u32,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(Value::object(name), hash),
            _ => unreachable!("class handle"),
        };
        match method {
            Some(method) => {
                let closure = method.as_object().expect("method closure");
                self.call_closure(closure, argc)
            }
            None => {
                let message = format!("Undefined property '{}'.", self.heap.string_chars(name));
                Err(self.runtime_error(message))
            }
        }
    }

    fn native_object(&self, value: Value) -> ObjNative {
        let handle = value.as_object().expect("native value");
        match self.heap.get(handle) {
            Obj::Native(n) => *n,
            _ => unreachable!("native handle"),
        }
    }

    // ---- Closures and upvalues ----

    fn make_closure(&mut self) -> Result<(), RuntimeError> {
        let function_value = self.read_constant();
        let function = function_value.as_object().expect("function constant");
        let upvalue_count = match self.heap.get(function) {
            Obj::Function(f) => f.upvalue_count,
            _ => unreachable!("function handle"),
        };

        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let base = self.frames.last().expect("active call frame").slots;
                let upvalue = self.capture_upvalue(base + index);
                upvalues.push(upvalue);
            } else {
                let enclosing = self.frames.last().expect("active call frame").closure;
                let upvalue = match self.heap.get(enclosing) {
                    Obj::Closure(c) => c.upvalues[index],
                    _ => unreachable!("frame closure handle"),
                };
                upvalues.push(upvalue);
            }
        }

        let closure = self.heap.allocate(Obj::Closure(ObjClosure { function, upvalues }));
        self.push(Value::object(closure))
    }

    fn upvalue_state(&self, upvalue: Handle) -> UpvalueState {
        match self.heap.get(upvalue) {
            Obj::Upvalue(u) => u.state,
            _ => unreachable!("upvalue handle"),
        }
    }

    fn open_slot(&self, upvalue: Handle) -> usize {
        match self.upvalue_state(upvalue) {
            UpvalueState::Open(slot) => slot,
            UpvalueState::Closed(_) => unreachable!("closed upvalue in open list"),
        }
    }

    /// Return the open upvalue for `slot`, creating and threading a new
    /// one if none exists. The list stays sorted by descending slot, one
    /// upvalue per slot at most.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut position = self.open_upvalues.len();
        for (i, &existing) in self.open_upvalues.iter().enumerate() {
            let existing_slot = self.open_slot(existing);
            if existing_slot == slot {
                return existing;
            }
            if existing_slot < slot {
                position = i;
                break;
            }
        }
        let upvalue = self.heap.allocate(Obj::Upvalue(ObjUpvalue {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(position, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from_slot`, lifting the
    /// stack values into the upvalues' own cells.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = self.open_slot(upvalue);
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            match self.heap.get_mut(upvalue) {
                Obj::Upvalue(u) => u.state = UpvalueState::Closed(value),
                _ => unreachable!("upvalue handle"),
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- Collection ----

    /// Mark all roots, trace, cull weak intern entries, and sweep.
    fn collect_garbage(&mut self) {
        debug!(bytes = self.heap.bytes_allocated(), "gc begin");

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
            self.heap.mark_object(frame.function);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.builtins.string);
        self.heap.mark_table(&self.builtins.list);
        self.heap.mark_table(&self.builtins.dict);
        self.heap.mark_table(&self.builtins.option);
        self.heap.mark_value(self.reserve);
        self.heap.mark_object(self.init_string);
        self.heap.mark_object(self.none_singleton);

        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();
    }
}
