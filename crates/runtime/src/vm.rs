//! The stack virtual machine.
//!
//! Executes bytecode chunks produced by the compiler. State is a value
//! stack, a call-frame stack (at most 64 deep), a globals table, the list
//! of open upvalues sorted by descending stack slot, and the
//! garbage-collected heap everything lives on. One [`Vm`] is one
//! interpreter invocation: strictly single-threaded, with left-to-right
//! evaluation everywhere.
//!
//! Calling convention: the callee sits below its arguments on the value
//! stack, so a frame's slot 0 is the callee (for methods, the receiver
//! bound over it). `Return` closes upvalues down to the frame base,
//! truncates the stack there, and pushes the result for the caller.
//!
//! Runtime errors print the message and a stack trace (innermost frame
//! first) to the error sink, reset the VM, and report
//! [`InterpretResult::RuntimeError`].

use std::io::{self, Write};

use tracing::debug;

use fidel_compiler::{CompileOptions, compile};
use fidel_core::chunk::OpCode;
use fidel_core::object::{ObjBody, ObjBoundMethod, ObjClass, ObjClosure};
use fidel_core::object::{ObjInstance, ObjNative, ObjUpvalue};
use fidel_core::value::print_value;
use fidel_core::{Heap, INIT_METHOD_NAME, NativeFn, ObjRef, RootSet, Table, Value};

use crate::natives;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of one `interpret` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Diagnostic switches, surfaced as CLI flags.
#[derive(Debug, Default, Clone)]
pub struct VmOptions {
    /// Dump each function's bytecode as it finishes compiling.
    pub print_code: bool,
    /// Dump the stack and the current instruction before each step.
    pub trace_execution: bool,
    /// Collect before every allocation.
    pub stress_gc: bool,
}

struct CallFrame {
    closure: ObjRef,
    /// Offset of the next instruction in the closure's chunk.
    ip: usize,
    /// Stack index of slot 0 (the callee or receiver).
    slots: usize,
}

enum Flow {
    Continue,
    Done,
}

/// One interpreter instance: heap, stacks, globals, and host sinks.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues ordered by strictly descending stack slot; at most
    /// one per slot.
    open_upvalues: Vec<ObjRef>,
    /// Interned initializer name, kept rooted for `Invoke`-time lookups.
    init_string: ObjRef,
    options: VmOptions,
    stdout: Box<dyn Write>,
    stderr: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.set_stress(options.stress_gc);
        let init_string = heap.intern(INIT_METHOD_NAME, &RootSet::default());

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            options,
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
        };
        natives::register_default_natives(&mut vm);
        vm
    }

    /// Redirect the `print` sink (stdout by default).
    pub fn set_stdout(&mut self, sink: Box<dyn Write>) {
        self.stdout = sink;
    }

    /// Redirect the diagnostics sink (stderr by default).
    pub fn set_stderr(&mut self, sink: Box<dyn Write>) {
        self.stderr = sink;
    }

    /// Expose a host function to guest code under `name`.
    pub fn register_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name_ref = self.intern(name);
        // Not reachable from any root until the native object holds it.
        self.heap.push_temp_root(Value::Obj(name_ref));
        let native = self.alloc(ObjBody::Native(ObjNative {
            name: name_ref,
            arity,
            function,
        }));
        self.heap.pop_temp_root();
        let hash = self.heap.string(name_ref).hash;
        self.globals.set(name_ref, hash, Value::Obj(native));
    }

    /// Compile and run one source string. Globals persist across calls,
    /// which is what makes the REPL accumulate state.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let handles = [self.init_string];
        let options = CompileOptions {
            print_code: self.options.print_code,
        };
        let function = compile(
            source,
            &mut self.heap,
            RootSet {
                stack: &self.stack,
                globals: Some(&self.globals),
                open_upvalues: &self.open_upvalues,
                handles: &handles,
            },
            &options,
            &mut self.stderr,
        );
        let Some(function) = function else {
            return InterpretResult::CompileError;
        };

        // Pin the script function on the stack while its closure is made.
        self.stack.push(Value::Obj(function));
        let closure = self.alloc(ObjBody::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));
        if let Err(message) = self.call_closure(closure, 0) {
            return self.runtime_error(&message);
        }

        debug!("interpret start");
        self.run()
    }

    // ----- dispatch loop -----

    fn run(&mut self) -> InterpretResult {
        loop {
            if self.options.trace_execution {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return self.runtime_error(&format!("Unknown opcode {byte}."));
            };
            match self.step(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return InterpretResult::Ok,
                Err(message) => return self.runtime_error(&message),
            }
        }
    }

    fn step(&mut self, op: OpCode) -> Result<Flow, String> {
        match op {
            OpCode::Constant => {
                let value = self.read_constant();
                self.push(value)?;
            }
            OpCode::Nil => self.push(Value::Nil)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().slots;
                let value = self.stack[base + slot];
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().slots;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::GetGlobal => {
                let name = self.read_string();
                let hash = self.heap.string(name).hash;
                match self.globals.get(name, hash) {
                    Some(value) => self.push(value)?,
                    None => {
                        return Err(format!("Undefined variable '{}'.", self.heap.str(name)));
                    }
                }
            }
            OpCode::DefineGlobal => {
                let name = self.read_string();
                let hash = self.heap.string(name).hash;
                let value = self.peek(0);
                self.globals.set(name, hash, value);
                self.pop();
            }
            OpCode::SetGlobal => {
                let name = self.read_string();
                let hash = self.heap.string(name).hash;
                let value = self.peek(0);
                if self.globals.set(name, hash, value) {
                    // The key did not exist: undo and report.
                    self.globals.delete(name, hash);
                    return Err(format!("Undefined variable '{}'.", self.heap.str(name)));
                }
            }
            OpCode::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = match self.heap.upvalue(upvalue) {
                    ObjUpvalue::Open(stack_slot) => self.stack[*stack_slot],
                    ObjUpvalue::Closed(value) => *value,
                };
                self.push(value)?;
            }
            OpCode::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = self.peek(0);
                match self.heap.upvalue_mut(upvalue) {
                    ObjUpvalue::Open(stack_slot) => {
                        let stack_slot = *stack_slot;
                        self.stack[stack_slot] = value;
                    }
                    closed => *closed = ObjUpvalue::Closed(value),
                }
            }
            OpCode::GetProperty => {
                let name = self.read_string();
                let receiver = self.peek(0);
                let instance = match receiver.as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Instance(_)) => r,
                    _ => return Err("Only instances have properties.".to_string()),
                };

                let hash = self.heap.string(name).hash;
                if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                    self.pop();
                    self.push(value)?;
                } else {
                    let class = self.heap.instance(instance).class;
                    self.bind_method(class, name)?;
                }
            }
            OpCode::SetProperty => {
                let name = self.read_string();
                let target = self.peek(1);
                let instance = match target.as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Instance(_)) => r,
                    _ => return Err("Only instances have fields.".to_string()),
                };

                let hash = self.heap.string(name).hash;
                let value = self.peek(0);
                self.heap
                    .instance_mut(instance)
                    .fields
                    .set(name, hash, value);
                let value = self.pop();
                self.pop();
                self.push(value)?;
            }
            OpCode::GetSuper => {
                let name = self.read_string();
                let superclass = match self.pop().as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Class(_)) => r,
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                self.bind_method(superclass, name)?;
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b))?;
            }
            OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
            OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
            OpCode::Add => self.add()?,
            OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
            OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
            OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
            OpCode::Not => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsey()))?;
            }
            OpCode::Negate => {
                let Some(n) = self.peek(0).as_number() else {
                    return Err("Operand must be a number.".to_string());
                };
                self.pop();
                self.push(Value::Number(-n))?;
            }
            OpCode::Print => {
                let value = self.pop();
                let text = print_value(&self.heap, value);
                let _ = writeln!(self.stdout, "{text}");
            }
            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_falsey() {
                    self.frame_mut().ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }
            OpCode::Call => {
                let argc = self.read_byte();
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            OpCode::Invoke => {
                let name = self.read_string();
                let argc = self.read_byte();
                self.invoke(name, argc)?;
            }
            OpCode::SuperInvoke => {
                let name = self.read_string();
                let argc = self.read_byte();
                let superclass = match self.pop().as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Class(_)) => r,
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                self.invoke_from_class(superclass, name, argc)?;
            }
            OpCode::Closure => {
                self.make_closure()?;
            }
            OpCode::CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }
            OpCode::Return => {
                let result = self.pop();
                let base = self.frame().slots;
                self.close_upvalues(base);
                self.frames.pop();
                if self.frames.is_empty() {
                    // The script closure itself.
                    self.pop();
                    debug!("interpret finished");
                    return Ok(Flow::Done);
                }
                self.stack.truncate(base);
                self.push(result)?;
            }
            OpCode::Class => {
                let name = self.read_string();
                let class = self.alloc(ObjBody::Class(ObjClass {
                    name,
                    methods: Table::new(),
                }));
                self.push(Value::Obj(class))?;
            }
            OpCode::Inherit => {
                let superclass = match self.peek(1).as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Class(_)) => r,
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                let subclass = match self.peek(0).as_obj() {
                    Some(r) if matches!(self.heap.get(r), ObjBody::Class(_)) => r,
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                // Copy now; methods declared later shadow these.
                let methods: Vec<(ObjRef, u32, Value)> = self
                    .heap
                    .class(superclass)
                    .methods
                    .iter()
                    .map(|(key, value)| (key, self.heap.string(key).hash, value))
                    .collect();
                for (key, hash, value) in methods {
                    self.heap.class_mut(subclass).methods.set(key, hash, value);
                }
                self.pop();
            }
            OpCode::Method => {
                let name = self.read_string();
                let hash = self.heap.string(name).hash;
                let method = self.peek(0);
                let class = match self.peek(1).as_obj() {
                    Some(r) => r,
                    None => return Err("Only classes have methods.".to_string()),
                };
                self.heap.class_mut(class).methods.set(name, hash, method);
                self.pop();
            }
        }
        Ok(Flow::Continue)
    }

    // ----- calls -----

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), String> {
        let Some(r) = callee.as_obj() else {
            return Err("Can only call functions and classes.".to_string());
        };
        match self.heap.get(r) {
            ObjBody::Closure(_) => self.call_closure(r, argc),
            ObjBody::Native(native) => {
                if argc != native.arity {
                    return Err(format!(
                        "Expected {} arguments but got {}.",
                        native.arity, argc
                    ));
                }
                let function = native.function;
                let args_start = self.stack.len() - argc as usize;
                let result = {
                    let (heap, stack) = (&mut self.heap, &self.stack[args_start..]);
                    function(heap, stack)?
                };
                // Replace the callee and arguments with the result.
                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            ObjBody::Class(_) => {
                let instance = self.alloc(ObjBody::Instance(ObjInstance {
                    class: r,
                    fields: Table::new(),
                }));
                let receiver_slot = self.stack.len() - argc as usize - 1;
                self.stack[receiver_slot] = Value::Obj(instance);

                let init_hash = self.heap.string(self.init_string).hash;
                let initializer = self.heap.class(r).methods.get(self.init_string, init_hash);
                if let Some(initializer) = initializer {
                    let Some(closure) = initializer.as_obj() else {
                        return Err("Can only call functions and classes.".to_string());
                    };
                    self.call_closure(closure, argc)
                } else if argc != 0 {
                    Err(format!("Expected 0 arguments but got {argc}."))
                } else {
                    Ok(())
                }
            }
            ObjBody::BoundMethod(bound) => {
                let (receiver, method) = (bound.receiver, bound.method);
                let receiver_slot = self.stack.len() - argc as usize - 1;
                self.stack[receiver_slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), String> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity;
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - argc as usize - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), String> {
        let receiver = self.peek(argc as usize);
        let instance = match receiver.as_obj() {
            Some(r) if matches!(self.heap.get(r), ObjBody::Instance(_)) => r,
            _ => return Err("Only instances have methods.".to_string()),
        };

        // Fields shadow methods, so a callable field wins.
        let hash = self.heap.string(name).hash;
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let receiver_slot = self.stack.len() - 1 - argc as usize;
            self.stack[receiver_slot] = field;
            return self.call_value(field, argc);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> Result<(), String> {
        let hash = self.heap.string(name).hash;
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            return Err(format!("Undefined property '{}'.", self.heap.str(name)));
        };
        let Some(closure) = method.as_obj() else {
            return Err("Can only call functions and classes.".to_string());
        };
        self.call_closure(closure, argc)
    }

    /// Bind `class`'s method `name` over the receiver at the stack top.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), String> {
        let hash = self.heap.string(name).hash;
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            return Err(format!("Undefined property '{}'.", self.heap.str(name)));
        };
        let Some(method) = method.as_obj() else {
            return Err("Can only call functions and classes.".to_string());
        };

        let receiver = self.peek(0);
        let bound = self.alloc(ObjBody::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound))
    }

    // ----- closures and upvalues -----

    fn make_closure(&mut self) -> Result<(), String> {
        let function = match self.read_constant() {
            Value::Obj(r) => r,
            _ => return Err("Closure over a non-function constant.".to_string()),
        };
        let count = self.heap.function(function).upvalue_count;

        // Push the closure first so the collector sees it (and every
        // upvalue captured so far) while the remaining captures allocate.
        let closure = self.alloc(ObjBody::Closure(ObjClosure {
            function,
            upvalues: Vec::with_capacity(count),
        }));
        self.push(Value::Obj(closure))?;

        for _ in 0..count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
        Ok(())
    }

    /// Return the open upvalue for `slot`, creating and threading it into
    /// the sorted list if this is the first capture of that slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(upvalue).open_slot() {
                Some(existing) if existing == slot => return upvalue,
                Some(existing) if existing < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let created = self.alloc(ObjBody::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at or above `min_slot`, moving the stack
    /// value into the upvalue's own storage.
    fn close_upvalues(&mut self, min_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let Some(slot) = self.heap.upvalue(upvalue).open_slot() else {
                break;
            };
            if slot < min_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ----- stack and operands -----

    fn push(&mut self, value: Value) -> Result<(), String> {
        if self.stack.len() == STACK_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("value stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn read_byte(&mut self) -> u8 {
        let i = self.frames.len() - 1;
        let (closure, ip) = (self.frames[i].closure, self.frames[i].ip);
        let function = self.heap.closure(closure).function;
        let byte = self.heap.function(function).chunk.code[ip];
        self.frames[i].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            other => unreachable!("name constant is not an object: {other:?}"),
        }
    }

    fn binary_number_op(&mut self, f: impl Fn(f64, f64) -> Value) -> Result<(), String> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(f(a, b))
    }

    /// `+` is numeric addition or string concatenation; the concatenated
    /// result is interned like every other string.
    fn add(&mut self) -> Result<(), String> {
        let (b, a) = (self.peek(0), self.peek(1));
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b))
            }
            (Value::Obj(ra), Value::Obj(rb)) => {
                let (ObjBody::String(sa), ObjBody::String(sb)) =
                    (self.heap.get(ra), self.heap.get(rb))
                else {
                    return Err("Operands must be two numbers or two strings.".to_string());
                };
                let combined = format!("{}{}", sa.chars, sb.chars);
                // The operands stay on the stack as roots until the result
                // exists.
                let result = self.intern(&combined);
                self.pop();
                self.pop();
                self.push(Value::Obj(result))
            }
            _ => Err("Operands must be two numbers or two strings.".to_string()),
        }
    }

    // ----- heap plumbing -----

    /// Handle-typed roots not covered by the stack, globals, or upvalue
    /// list: every frame's closure and the initializer name.
    fn root_handles(&self) -> Vec<ObjRef> {
        let mut handles: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        handles.push(self.init_string);
        handles
    }

    fn alloc(&mut self, body: ObjBody) -> ObjRef {
        let handles = self.root_handles();
        self.heap.allocate(
            body,
            &RootSet {
                stack: &self.stack,
                globals: Some(&self.globals),
                open_upvalues: &self.open_upvalues,
                handles: &handles,
            },
        )
    }

    fn intern(&mut self, text: &str) -> ObjRef {
        let handles = self.root_handles();
        self.heap.intern(
            text,
            &RootSet {
                stack: &self.stack,
                globals: Some(&self.globals),
                open_upvalues: &self.open_upvalues,
                handles: &handles,
            },
        )
    }

    // ----- diagnostics -----

    fn trace_instruction(&mut self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", print_value(&self.heap, *value)));
        }
        let _ = writeln!(self.stderr, "{line}");

        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        let mut listing = String::new();
        fidel_core::debug::disassemble_instruction(
            &self.heap,
            &self.heap.function(function).chunk,
            frame.ip,
            &mut listing,
        );
        let _ = write!(self.stderr, "{listing}");
    }

    fn runtime_error(&mut self, message: &str) -> InterpretResult {
        let _ = writeln!(self.stderr, "{message}");
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            match function.name {
                Some(name) => {
                    let _ = writeln!(self.stderr, "[line {line}] in {}()", self.heap.str(name));
                }
                None => {
                    let _ = writeln!(self.stderr, "[line {line}] in script");
                }
            }
        }
        self.reset_stack();
        InterpretResult::RuntimeError
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
