// File: src/vm.rs
//
// Stack-based bytecode interpreter. Dispatches one opcode at a time out
// of the current call frame's chunk, mutating a fixed-capacity value
// stack and a call-frame stack. No recursion into Rust's own call stack
// for script-level calls — `Call`/`Return` push and pop `CallFrame`s and
// the dispatch loop itself stays flat.

use crate::chunk::OpCode;
use crate::errors::RuntimeError;
use crate::gc::Heap;
use crate::object::{ObjRef, UpvalueLocation};
use crate::table::Table;
use crate::value::Value;
use std::time::Instant;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots_base: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    output: Box<dyn std::io::Write>,
}

enum Flow {
    Continue,
    Return,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let clock_name = {
            let mut roots = |_: &mut Heap| {};
            heap.alloc_string(b"clock", &mut roots)
        };
        let native = {
            let mut roots = |_: &mut Heap| {};
            heap.alloc_native(0, native_clock, &mut roots)
        };
        let mut globals = Table::new();
        globals.set(clock_name, Value::Obj(native));

        Self {
            heap,
            stack: vec![Value::Nil; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: Vec::new(),
            output: Box::new(std::io::stdout()),
        }
    }

    /// Builds a `Vm` whose `print` statements write to `output` instead
    /// of stdout — what the test suite uses to assert on program output.
    pub fn with_output(output: impl std::io::Write + 'static) -> Self {
        let mut vm = Self::new();
        vm.output = Box::new(output);
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let bytes = name.as_bytes();
        self.heap.find_interned(bytes).and_then(|key| self.globals.get(key))
    }

    /// Loads `function` (the compiler's top-level script function) as an
    /// implicit zero-arg closure and runs it to completion.
    pub fn interpret(&mut self, function: ObjRef) -> Result<(), RuntimeError> {
        self.push(Value::Obj(function));
        let closure = self.alloc(|heap, roots| heap.alloc_closure(function, Vec::new(), roots));
        self.pop();
        self.push(Value::Obj(closure));
        self.call(closure, 0)?;
        self.run()
    }

    /// Splits `self` into its `heap` field and a `mark_roots` closure over
    /// every other field, so an allocation call can hold a mutable borrow
    /// of the heap and a root-marking callback at once without the
    /// whole-`self` borrow a `self.mark_roots(..)` method call would need.
    fn alloc<R>(&mut self, f: impl FnOnce(&mut Heap, &mut dyn FnMut(&mut Heap)) -> R) -> R {
        let Vm { heap, stack, stack_top, frames, open_upvalues, globals, output: _ } = self;
        let mut roots = |h: &mut Heap| {
            for &value in &stack[..*stack_top] {
                h.mark_value(value);
            }
            for frame in frames.iter() {
                h.mark_object(frame.closure);
            }
            for &uv in open_upvalues.iter() {
                h.mark_object(uv);
            }
            for (key, value) in globals.iter() {
                h.mark_object(key);
                h.mark_value(value);
            }
        };
        f(heap, &mut roots)
    }

    fn push(&mut self, value: Value) {
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let line = self.current_frame_line();
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let closure = frame.closure.as_closure().expect("call frame always holds a Closure");
            let function = closure.function.as_function().expect("closure always wraps a Function");
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = function.name.map(|n| n.to_string()).unwrap_or_else(|| "script".to_string());
            trace.push(format!("[line {}] in {}()", line, name));
        }
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError::new(line, message).with_trace(trace)
    }

    fn current_frame_line(&self) -> usize {
        let frame = self.frames.last().expect("run() only executes with an active frame");
        let closure = frame.closure.as_closure().expect("call frame always holds a Closure");
        let function = closure.function.as_function().expect("closure always wraps a Function");
        function.chunk.line_at(frame.ip.saturating_sub(1))
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace-execution")]
            self.trace();

            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(format!("Unknown opcode {}.", byte))),
            };

            match self.dispatch(op)? {
                Flow::Continue => {}
                Flow::Return => return Ok(()),
            }
        }
    }

    #[cfg(feature = "trace-execution")]
    fn trace(&self) {
        print!("          ");
        for i in 0..self.stack_top {
            print!("[ {} ]", self.stack[i]);
        }
        println!();
        let frame = self.frames.last().expect("trace only called mid-run");
        let closure = frame.closure.as_closure().expect("call frame always holds a Closure");
        let function = closure.function.as_function().expect("closure always wraps a Function");
        crate::chunk::disassemble::instruction(&function.chunk, frame.ip);
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("read_byte only called mid-run");
        let closure = frame.closure.as_closure().expect("call frame always holds a Closure");
        let function = closure.function.as_function().expect("closure always wraps a Function");
        let byte = function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, index: u8) -> Value {
        let frame = self.frames.last().expect("read_constant only called mid-run");
        let closure = frame.closure.as_closure().expect("call frame always holds a Closure");
        let function = closure.function.as_function().expect("closure always wraps a Function");
        function.chunk.constants[index as usize]
    }

    fn dispatch(&mut self, op: OpCode) -> Result<Flow, RuntimeError> {
        use OpCode::*;
        match op {
            Constant => {
                let idx = self.read_byte();
                let value = self.read_constant(idx);
                self.push(value);
            }
            Nil => self.push(Value::Nil),
            True => self.push(Value::Bool(true)),
            False => self.push(Value::Bool(false)),
            Pop => {
                self.pop();
            }
            GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().expect("mid-run").slots_base;
                self.push(self.stack[base + slot]);
            }
            SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().expect("mid-run").slots_base;
                self.stack[base + slot] = self.peek(0);
            }
            GetGlobal => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                match self.globals.get(name) {
                    Some(value) => self.push(value),
                    None => {
                        let msg = format!("Undefined variable '{}'.", name);
                        return Err(self.runtime_error(msg));
                    }
                }
            }
            DefineGlobal => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                let value = self.peek(0);
                self.globals.set(name, value);
                self.pop();
            }
            SetGlobal => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                // check-then-insert: assigning to an undefined global must
                // not create it, unlike DefineGlobal.
                if !self.globals.contains(name) {
                    let msg = format!("Undefined variable '{}'.", name);
                    return Err(self.runtime_error(msg));
                }
                self.globals.set(name, self.peek(0));
            }
            GetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure = self.frames.last().expect("mid-run").closure;
                let closure = closure.as_closure().expect("call frame always holds a Closure");
                let upvalue = closure.upvalues[slot];
                let up = upvalue.as_upvalue().expect("closure upvalues are always Upvalue objects");
                let value = match up.location.get() {
                    UpvalueLocation::Open(stack_idx) => self.stack[stack_idx],
                    UpvalueLocation::Closed(v) => v,
                };
                self.push(value);
            }
            SetUpvalue => {
                let slot = self.read_byte() as usize;
                let value = self.peek(0);
                let closure = self.frames.last().expect("mid-run").closure;
                let closure = closure.as_closure().expect("call frame always holds a Closure");
                let upvalue = closure.upvalues[slot];
                let up = upvalue.as_upvalue().expect("closure upvalues are always Upvalue objects");
                match up.location.get() {
                    UpvalueLocation::Open(stack_idx) => self.stack[stack_idx] = value,
                    UpvalueLocation::Closed(_) => up.location.set(UpvalueLocation::Closed(value)),
                }
            }
            GetProperty => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                let receiver = self.peek(0);
                let instance = match receiver {
                    Value::Obj(o) if o.as_instance().is_some() => o,
                    _ => return Err(self.runtime_error("Only instances have properties.")),
                };
                let inst = instance.as_instance().expect("checked above");
                let existing = inst.fields.borrow().get(name);
                if let Some(value) = existing {
                    self.pop();
                    self.push(value);
                } else if let Some(method) = self.find_method(instance, name) {
                    self.pop();
                    let bound = self.alloc(|heap, roots| heap.alloc_bound_method(receiver, method, roots));
                    self.push(Value::Obj(bound));
                } else {
                    let msg = format!("Undefined property '{}'.", name);
                    return Err(self.runtime_error(msg));
                }
            }
            SetProperty => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                let receiver = self.peek(1);
                let instance = match receiver {
                    Value::Obj(o) if o.as_instance().is_some() => o,
                    _ => return Err(self.runtime_error("Only instances have fields.")),
                };
                let value = self.peek(0);
                instance.as_instance().expect("checked above").fields.borrow_mut().set(name, value);
                let value = self.pop();
                self.pop();
                self.push(value);
            }
            Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            Greater => self.binary_compare(|a, b| a > b)?,
            Less => self.binary_compare(|a, b| a < b)?,
            Add => self.add()?,
            Subtract => self.binary_number(|a, b| a - b)?,
            Multiply => self.binary_number(|a, b| a * b)?,
            Divide => self.binary_number(|a, b| a / b)?,
            Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsy()));
            }
            Negate => {
                if !self.peek(0).is_number() {
                    return Err(self.runtime_error("Operand must be a number."));
                }
                let n = self.pop().as_number().expect("checked above");
                self.push(Value::Number(-n));
            }
            Print => {
                let value = self.pop();
                let _ = writeln!(self.output, "{}", value);
            }
            Jump => {
                let offset = self.read_u16();
                self.frames.last_mut().expect("mid-run").ip += offset as usize;
            }
            JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0).is_falsy() {
                    self.frames.last_mut().expect("mid-run").ip += offset as usize;
                }
            }
            Loop => {
                let offset = self.read_u16();
                self.frames.last_mut().expect("mid-run").ip -= offset as usize;
            }
            Call => {
                let arg_count = self.read_byte();
                self.call_value(arg_count)?;
            }
            Closure => {
                let idx = self.read_byte();
                let function = self.read_constant(idx);
                let function_obj = self.as_function_obj(function);
                let upvalue_count = function_obj.as_function().expect("constant is a Function").upvalue_count;
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte() as usize;
                    if is_local {
                        let base = self.frames.last().expect("mid-run").slots_base;
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let closure = self.frames.last().expect("mid-run").closure;
                        let closure = closure.as_closure().expect("call frame always holds a Closure");
                        upvalues.push(closure.upvalues[index]);
                    }
                }
                let closure = self.alloc(|heap, roots| heap.alloc_closure(function_obj, upvalues, roots));
                self.push(Value::Obj(closure));
            }
            CloseUpvalue => {
                let top = self.stack_top - 1;
                self.close_upvalues(top);
                self.pop();
            }
            Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("Return only dispatched with an active frame");
                self.close_upvalues(frame.slots_base);
                if self.frames.is_empty() {
                    self.pop();
                    return Ok(Flow::Return);
                }
                self.stack_top = frame.slots_base;
                self.push(result);
            }
            Class => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                let class = self.alloc(|heap, roots| heap.alloc_class(name, roots));
                self.push(Value::Obj(class));
            }
            Method => {
                let idx = self.read_byte();
                let name = self.read_constant(idx);
                let name = self.as_string_obj(name);
                let method = self.peek(0);
                let class = self.peek(1);
                let class = match class {
                    Value::Obj(o) => o,
                    _ => unreachable!("Method always follows a Class value on the stack"),
                };
                class.as_class().expect("Method target is always a Class").methods.borrow_mut().set(name, method);
                self.pop();
            }
        }
        Ok(Flow::Continue)
    }

    fn as_string_obj(&self, value: Value) -> ObjRef {
        match value {
            Value::Obj(o) if o.as_string().is_some() => o,
            _ => unreachable!("compiler only ever emits interned strings for name operands"),
        }
    }

    fn as_function_obj(&self, value: Value) -> ObjRef {
        match value {
            Value::Obj(o) if o.as_function().is_some() => o,
            _ => unreachable!("Closure operand constant is always a compiled Function"),
        }
    }

    fn binary_number(
        &mut self,
        op: impl Fn(crate::value::Number, crate::value::Number) -> crate::value::Number,
    ) -> Result<(), RuntimeError> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        let b = self.pop().as_number().expect("checked above");
        let a = self.pop().as_number().expect("checked above");
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(
        &mut self,
        op: impl Fn(crate::value::Number, crate::value::Number) -> bool,
    ) -> Result<(), RuntimeError> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        let b = self.pop().as_number().expect("checked above");
        let a = self.pop().as_number().expect("checked above");
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(_), Value::Number(_)) => self.binary_number(|a, b| a + b),
            (Value::Obj(oa), Value::Obj(ob)) if oa.as_string().is_some() && ob.as_string().is_some() => {
                self.pop();
                self.pop();
                let sa = oa.as_string().expect("checked above").as_str();
                let sb = ob.as_string().expect("checked above").as_str();
                let mut concatenated = String::with_capacity(sa.len() + sb.len());
                concatenated.push_str(sa);
                concatenated.push_str(sb);
                // `a`/`b` are already popped; nothing reachable only
                // through them survives to this point, so interning the
                // result needs no extra temporary root.
                let obj = self.alloc(|heap, roots| heap.alloc_string(concatenated.as_bytes(), roots));
                self.push(Value::Obj(obj));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn call_value(&mut self, arg_count: u8) -> Result<(), RuntimeError> {
        let callee = self.peek(arg_count as usize);
        match callee {
            Value::Obj(o) => match o.kind() {
                crate::object::ObjKind::Closure => self.call(o, arg_count),
                crate::object::ObjKind::Native => self.call_native(o, arg_count),
                crate::object::ObjKind::Class => self.instantiate(o, arg_count),
                crate::object::ObjKind::BoundMethod => self.call_bound_method(o, arg_count),
                _ => Err(self.runtime_error("Can only call functions and classes.")),
            },
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let function = closure.as_closure().expect("call() only invoked on Closure objects").function;
        let arity = function.as_function().expect("Closure always wraps a Function").arity;
        if arg_count != arity {
            let msg = crate::errors::arity_message(arity, arg_count);
            return Err(self.runtime_error(msg));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack_top - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots_base });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let n = native.as_native().expect("call_native only invoked on Native objects");
        if arg_count != n.arity {
            let msg = crate::errors::arity_message(n.arity, arg_count);
            return Err(self.runtime_error(msg));
        }
        let args_start = self.stack_top - arg_count as usize;
        let args: Vec<Value> = self.stack[args_start..self.stack_top].to_vec();
        let func = n.func;
        match func(&args) {
            Ok(result) => {
                self.stack_top = args_start - 1;
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn instantiate(&mut self, class: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = self.alloc(|heap, roots| heap.alloc_instance(class, roots));
        let slot = self.stack_top - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance);

        let init_name = self.heap.init_string;
        if let Some(initializer) = self.find_method(instance, init_name) {
            return self.call(initializer, arg_count);
        }
        if arg_count != 0 {
            let msg = crate::errors::arity_message(0, arg_count);
            return Err(self.runtime_error(msg));
        }
        Ok(())
    }

    fn call_bound_method(&mut self, bound_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let bound = bound_ref.as_bound_method().expect("call_bound_method only invoked on BoundMethod objects");
        let method = bound.method;
        let receiver = bound.receiver;
        let slot = self.stack_top - arg_count as usize - 1;
        self.stack[slot] = receiver;
        self.call(method, arg_count)
    }

    fn find_method(&self, instance: ObjRef, name: ObjRef) -> Option<ObjRef> {
        let inst = instance.as_instance().expect("find_method only called with an instance");
        let class = inst.class.as_class().expect("instance.class is always a Class");
        class.methods.borrow().get(name).and_then(|v| match v {
            Value::Obj(o) => Some(o),
            _ => None,
        })
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        // Scanned front-to-back; doesn't need to be sorted since the list
        // is only ever searched linearly and closed from one end.
        for &existing in &self.open_upvalues {
            let up = existing.as_upvalue().expect("open_upvalues only holds Upvalue objects");
            if let UpvalueLocation::Open(idx) = up.location.get() {
                if idx == stack_index {
                    return existing;
                }
            }
        }
        let upvalue = self.alloc(|heap, roots| heap.alloc_upvalue(stack_index, roots));
        self.open_upvalues.push(upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, from_stack_index: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let uv_ref = self.open_upvalues[i];
            let up = uv_ref.as_upvalue().expect("open_upvalues only holds Upvalue objects");
            let should_close = matches!(up.location.get(), UpvalueLocation::Open(idx) if idx >= from_stack_index);
            if should_close {
                if let UpvalueLocation::Open(idx) = up.location.get() {
                    up.location.set(UpvalueLocation::Closed(self.stack[idx]));
                }
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    let elapsed = EPOCH.with(|epoch| epoch.elapsed());
    #[cfg(not(feature = "integer-only"))]
    return Ok(Value::Number(elapsed.as_secs_f64()));
    #[cfg(feature = "integer-only")]
    return Ok(Value::Number(elapsed.as_secs() as i64));
}
