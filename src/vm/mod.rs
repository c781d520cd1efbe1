pub mod chunk;
pub mod heap;
pub mod natives;
pub mod object;
pub mod table;
pub mod value;

use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

use log::debug;

use crate::compiler;
use chunk::{op, read_uleb128, Chunk};
use heap::Heap;
use natives::{NativeError, NativeResult};
use object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, ListObj, Obj, UpvalueObj, UpvalueState,
};
use table::Table;
use value::{is_integer, number_to_string, ModuleId, ObjRef, StrId, Value};

// ---------------------------------------------------------------------------
// VM structure
// ---------------------------------------------------------------------------

/// Hard cap on the call depth; exceeding it raises StackOverflowException.
pub const FRAMES_MAX: usize = 1024;

const INITIAL_FRAMES: usize = 64;
const STACK_SLOTS_PER_FRAME: usize = 256;

/// Result of driving a source unit to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileErr,
    RuntimeErr,
}

/// Result of one fetch/execute step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Continue,
    Ok,
    CompileErr,
    RuntimeErr,
}

/// What happened when a value was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallFlow {
    /// A closure frame was pushed; the interpreter loop executes it.
    Frame,
    /// The call completed immediately (native, or argless instantiation)
    /// and its result is on the stack.
    Done,
    /// An exception was raised and landed at a catch handler.
    Caught,
    /// An exception was raised and nothing caught it.
    Uncaught,
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
    is_try: bool,
    catch_ip: usize,
    /// Value-stack height at TRY_BEGIN; restored when the catch is entered
    /// so the handler sees exactly its locals plus the exception.
    try_stack: usize,
}

/// One compiled source unit: its private globals and its export surface.
pub struct Module {
    pub globals: Table,
    pub exports: Table,
}

/// Interned names the VM reaches for constantly.
struct StringConstants {
    constructor: StrId,
    message: StrId,
    stack_trace: StrId,
    index: StrId,
    data: StrId,
    this_module: StrId,
    to_string: StrId,
    type_boolean: StrId,
    type_number: StrId,
    type_null: StrId,
    type_function: StrId,
    type_class: StrId,
    type_instance: StrId,
    type_string: StrId,
    type_list: StrId,
}

impl StringConstants {
    fn new(heap: &mut Heap) -> StringConstants {
        StringConstants {
            constructor: heap.intern("constructor"),
            message: heap.intern("message"),
            stack_trace: heap.intern("stackTrace"),
            index: heap.intern("index"),
            data: heap.intern("data"),
            this_module: heap.intern("THIS_MODULE"),
            to_string: heap.intern("toString"),
            type_boolean: heap.intern("boolean"),
            type_number: heap.intern("number"),
            type_null: heap.intern("null"),
            type_function: heap.intern("function"),
            type_class: heap.intern("class"),
            type_instance: heap.intern("instance"),
            type_string: heap.intern("string"),
            type_list: heap.intern("list"),
        }
    }
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the intrusive open-upvalue list, deepest stack slot first.
    open_upvalues: Option<ObjRef>,
    pub modules: Vec<Module>,
    import_table: Table,
    list_methods: Table,
    string_methods: Table,
    names: StringConstants,
    object_class: ObjRef,
    iterator_class: ObjRef,
    import_class: ObjRef,
    exception_class: ObjRef,
    number_class: ObjRef,
    string_class: ObjRef,
    boolean_class: ObjRef,
    list_class: ObjRef,
    function_class: ObjRef,
    /// Exception hierarchy, `Exception` first; bound into module globals.
    exception_classes: Vec<ObjRef>,
    /// `(name, value)` pairs every new module's globals start from.
    global_values: Vec<(StrId, Value)>,
    directory: String,
    pub out: Box<dyn Write>,
    start: Instant,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_output(Box::new(std::io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();
        // Bring-up builds structures the collector cannot see yet.
        heap.should_gc = false;

        let names = StringConstants::new(&mut heap);
        let object_class = bare_class(&mut heap, "Object");

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(INITIAL_FRAMES * STACK_SLOTS_PER_FRAME),
            frames: Vec::with_capacity(INITIAL_FRAMES),
            open_upvalues: None,
            modules: Vec::new(),
            import_table: Table::new(),
            list_methods: Table::new(),
            string_methods: Table::new(),
            names,
            object_class,
            iterator_class: object_class,
            import_class: object_class,
            exception_class: object_class,
            number_class: object_class,
            string_class: object_class,
            boolean_class: object_class,
            list_class: object_class,
            function_class: object_class,
            exception_classes: Vec::new(),
            global_values: Vec::new(),
            directory: ".".to_string(),
            out,
            start: Instant::now(),
        };

        natives::object::register(&mut vm);
        vm.iterator_class = vm.subclass_of_object("Iterator");
        natives::iterator::register(&mut vm);
        vm.import_class = vm.subclass_of_object("Import");
        vm.number_class = vm.subclass_of_object("Number");
        vm.string_class = vm.subclass_of_object("String");
        vm.boolean_class = vm.subclass_of_object("Boolean");
        vm.list_class = vm.subclass_of_object("List");
        vm.function_class = vm.subclass_of_object("Function");
        natives::exceptions::register(&mut vm);
        natives::list::register(&mut vm);
        natives::string::register(&mut vm);
        natives::globals::register(&mut vm);
        vm.build_global_values();

        vm.heap.should_gc = true;
        vm
    }

    /// Derive a fresh class whose method table starts as a copy of
    /// Object's, the base every class ultimately inherits from.
    fn subclass_of_object(&mut self, name: &str) -> ObjRef {
        let class = bare_class(&mut self.heap, name);
        let methods: Vec<(StrId, Value)> =
            self.heap.class(self.object_class).methods.iter().collect();
        let object_class = self.object_class;
        let class_obj = self.heap.class_mut(class);
        for (key, value) in methods {
            class_obj.methods.set(key, value);
        }
        class_obj.superclass = Some(object_class);
        class
    }

    fn build_global_values(&mut self) {
        let pairs = [
            ("Object", Value::Obj(self.object_class)),
            ("Iterator", Value::Obj(self.iterator_class)),
            ("Import", Value::Obj(self.import_class)),
            ("Number", Value::Obj(self.number_class)),
            ("String", Value::Obj(self.string_class)),
            ("Boolean", Value::Obj(self.boolean_class)),
            ("List", Value::Obj(self.list_class)),
            ("Function", Value::Obj(self.function_class)),
            ("NaN", Value::Number(f64::NAN)),
            ("Infinity", Value::Number(f64::INFINITY)),
        ];
        for (name, value) in pairs {
            let id = self.heap.intern(name);
            self.global_values.push((id, value));
        }
        for class in self.exception_classes.clone() {
            let name = self.heap.class(class).name;
            self.global_values.push((name, Value::Obj(class)));
        }
    }

    /// Create a module with the standard predefined globals.
    pub fn new_module(&mut self) -> ModuleId {
        let mut globals = Table::new();
        for &(name, value) in &self.global_values {
            globals.set(name, value);
        }
        self.modules.push(Module {
            globals,
            exports: Table::new(),
        });
        self.modules.len() - 1
    }

    // -- Public drive --

    /// Compile and execute one source unit. The main module persists across
    /// calls so a REPL accumulates state.
    pub fn interpret(&mut self, directory: &str, source: &str) -> InterpretResult {
        self.directory = directory.to_string();

        let function = match compiler::compile(&mut self.heap, source) {
            Some(function) => function,
            None => return InterpretResult::CompileErr,
        };

        if self.modules.is_empty() {
            let module = self.new_module();
            let main_name = self.heap.intern("$main$");
            self.modules[module]
                .globals
                .set(self.names.this_module, Value::Obj(main_name.obj));
        }

        // A previous run that aborted mid-unwind can leave upvalues open
        // over the old stack; close them before it goes away.
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.heap.temp_roots.clear();

        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
            module: 0,
        }));
        self.pop();
        self.push(Value::Obj(closure));
        match self.call_closure(closure, 0) {
            CallFlow::Frame => {}
            CallFlow::Caught => {}
            CallFlow::Uncaught => return InterpretResult::RuntimeErr,
            CallFlow::Done => unreachable!("script call cannot complete eagerly"),
        }

        loop {
            match self.fetch_execute(false, 0) {
                Action::Continue => {}
                Action::Ok => return InterpretResult::Ok,
                Action::CompileErr => return InterpretResult::CompileErr,
                Action::RuntimeErr => return InterpretResult::RuntimeErr,
            }
        }
    }

    // -- Stack primitives --

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> CallFrame {
        self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    /// Allocate through the GC trigger: collect first when the heap has
    /// outgrown its threshold.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    /// Intern an owned string through the GC trigger.
    pub fn take_string(&mut self, text: String) -> StrId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.take_string(text)
    }

    /// Intern a borrowed string through the GC trigger.
    pub fn intern(&mut self, text: &str) -> StrId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    // -- Bytecode reading --

    fn current_chunk(&self) -> Rc<Chunk> {
        let frame = self.frame();
        let closure = self.heap.closure(frame.closure);
        self.heap.function(closure.function).chunk.clone()
    }

    fn read_byte(&mut self, chunk: &Chunk) -> u8 {
        let frame = self.frame_mut();
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self, chunk: &Chunk) -> u16 {
        let frame = self.frame_mut();
        let hi = chunk.code[frame.ip];
        let lo = chunk.code[frame.ip + 1];
        frame.ip += 2;
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self, chunk: &Chunk) -> Value {
        let frame = self.frame_mut();
        let (index, length) = read_uleb128(&chunk.code, frame.ip);
        frame.ip += length;
        chunk.constants[index]
    }

    fn read_string(&mut self, chunk: &Chunk) -> StrId {
        let value = self.read_constant(chunk);
        self.heap.str_id(value)
    }

    fn current_module(&self) -> ModuleId {
        self.heap.closure(self.frame().closure).module
    }

    // -- Type predicates --

    fn is_list(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.heap.get(r), Obj::List(_)))
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.heap.get(r), Obj::String(_)))
    }

    fn is_instance(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)))
    }

    fn is_class(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)))
    }

    fn str_text(&self, id: StrId) -> String {
        self.heap.string(id.obj).chars.clone()
    }

    // -- Equality --

    /// Language equality: same tag, identity for objects, except lists
    /// which compare elementwise.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
            if let (Obj::List(la), Obj::List(lb)) = (self.heap.get(x), self.heap.get(y)) {
                return la.items.len() == lb.items.len()
                    && la
                        .items
                        .iter()
                        .zip(lb.items.iter())
                        .all(|(&ia, &ib)| self.values_equal(ia, ib));
            }
            return x == y;
        }
        a == b
    }

    fn instance_of(&self, instance: ObjRef, class: ObjRef) -> bool {
        let mut current = Some(self.heap.instance(instance).class);
        while let Some(c) = current {
            if c == class {
                return true;
            }
            current = self.heap.class(c).superclass;
        }
        false
    }

    /// Built-in marker class matching a value's runtime type, if any.
    fn marker_class(&self, value: Value) -> Option<ObjRef> {
        match value {
            Value::Number(_) => Some(self.number_class),
            Value::Bool(_) => Some(self.boolean_class),
            Value::Null => None,
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(_) => Some(self.string_class),
                Obj::List(_) => Some(self.list_class),
                Obj::Function(_) | Obj::Closure(_) | Obj::Native(_) | Obj::BoundMethod(_) => {
                    Some(self.function_class)
                }
                _ => None,
            },
        }
    }

    // -- Stringification --

    /// Language `toString` of a value. Re-enters the interpreter for
    /// instances with a user `toString`.
    pub fn value_to_string(&mut self, value: Value) -> Result<String, NativeError> {
        match value {
            Value::Null => Ok("null".to_string()),
            Value::Bool(b) => Ok(if b { "true" } else { "false" }.to_string()),
            Value::Number(n) => Ok(number_to_string(n)),
            Value::Obj(r) => {
                // Instances are the one case that can re-enter the
                // interpreter; everything else renders like repr.
                if matches!(self.heap.get(r), Obj::Instance(_)) {
                    return self.instance_to_string(r);
                }
                if let Obj::String(s) = self.heap.get(r) {
                    return Ok(s.chars.clone());
                }
                Ok(self.value_to_repr(value))
            }
        }
    }

    fn function_name(&self, name: Option<StrId>) -> String {
        match name {
            Some(id) => format!("<function {}>", self.str_text(id)),
            None => "<script>".to_string(),
        }
    }

    fn instance_to_string(&mut self, instance: ObjRef) -> Result<String, NativeError> {
        let receiver = Value::Obj(instance);
        let field = self.heap.instance(instance).fields.get(self.names.to_string);
        let result = if let Some(callable) = field {
            Some(self.call_from_native(callable, &[])?)
        } else {
            let class = self.heap.instance(instance).class;
            match self.heap.class(class).methods.get(self.names.to_string) {
                Some(method) => Some(self.call_method_from_native(method, receiver, &[])?),
                None => None,
            }
        };
        match result {
            Some(string_value) => {
                if !self.is_string(string_value) {
                    let class = self.heap.instance(instance).class;
                    let name = self.heap.class(class).name;
                    return Err(self.native_error(
                        "TypeException",
                        format!(
                            "{}'s 'toString' method must return a string.",
                            self.str_text(name)
                        ),
                    ));
                }
                Ok(self.heap.string(string_value.as_obj()).chars.clone())
            }
            None => {
                let class = self.heap.instance(instance).class;
                let name = self.heap.class(class).name;
                Ok(format!("<instance {}>", self.str_text(name)))
            }
        }
    }

    /// Source-shaped rendering: strings quoted with escapes expanded,
    /// everything else as `toString` without invoking user code.
    pub fn value_to_repr(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Number(n) => number_to_string(n),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String(s) => format!("\"{}\"", escape_string(&s.chars)),
                Obj::List(l) => {
                    let rendered: Vec<String> =
                        l.items.iter().map(|&item| self.value_to_repr(item)).collect();
                    format!("[{}]", rendered.join(", "))
                }
                Obj::Instance(i) => {
                    let name = self.heap.class(i.class).name;
                    format!("<instance {}>", self.str_text(name))
                }
                Obj::Function(f) => self.function_name(f.name),
                Obj::Closure(c) => {
                    let name = self.heap.function(c.function).name;
                    self.function_name(name)
                }
                Obj::BoundMethod(b) => {
                    let function = self.heap.closure(b.method).function;
                    self.function_name(self.heap.function(function).name)
                }
                Obj::Native(_) => "<native function>".to_string(),
                Obj::Class(c) => format!("<class {}>", self.str_text(c.name)),
                Obj::Upvalue(_) => "upvalue".to_string(),
            },
        }
    }

    // -- Exceptions --

    /// Construct an exception instance of the named built-in class with a
    /// `message` field. Returns `None` (after reporting) if the class is
    /// missing from the current module's globals.
    pub fn make_exception(&mut self, name: &str, message: String) -> Option<Value> {
        let message_id = self.take_string(message);
        self.push(Value::Obj(message_id.obj));

        let name_id = self.intern(name);
        let module = if self.frames.is_empty() {
            0
        } else {
            self.current_module()
        };
        let class_value = match self.modules.get(module).and_then(|m| m.globals.get(name_id)) {
            Some(value) => value,
            None => {
                eprintln!("Expected '{}' to be available at global scope.", name);
                self.pop();
                return None;
            }
        };
        if !self.is_class(class_value) {
            eprintln!("Expected '{}' to be a class.", name);
            self.pop();
            return None;
        }

        let instance = self.alloc(Obj::Instance(InstanceObj {
            class: class_value.as_obj(),
            fields: Table::new(),
        }));
        self.push(Value::Obj(instance));
        self.heap
            .instance_mut(instance)
            .fields
            .set(self.names.message, Value::Obj(message_id.obj));
        self.pop();
        self.pop();
        Some(Value::Obj(instance))
    }

    /// Build an exception for the native error channel.
    pub fn native_error(&mut self, name: &str, message: String) -> NativeError {
        match self.make_exception(name, message) {
            Some(instance) => NativeError::Exception(instance),
            None => NativeError::Fatal,
        }
    }

    /// Raise a built-in exception from inside the interpreter. Returns true
    /// when a catch handler took it.
    fn throw(&mut self, name: &str, message: String) -> bool {
        match self.make_exception(name, message) {
            Some(instance) => {
                self.push(instance);
                self.throw_value(instance)
            }
            None => false,
        }
    }

    fn throw_flow(&mut self, name: &str, message: String) -> CallFlow {
        if self.throw(name, message) {
            CallFlow::Caught
        } else {
            CallFlow::Uncaught
        }
    }

    /// Unwind to the nearest try frame, collecting the stack trace. The
    /// thrown instance must be on top of the stack. Returns false when no
    /// handler exists (the trace is printed and execution dies).
    fn throw_value(&mut self, throwee: Value) -> bool {
        let instance = throwee.as_obj();

        let message_value = self
            .heap
            .instance(instance)
            .fields
            .get(self.names.message)
            .unwrap_or(Value::Null);
        let class_name = {
            let class = self.heap.instance(instance).class;
            self.str_text(self.heap.class(class).name)
        };
        let message_text = match self.value_to_string(message_value) {
            Ok(text) => text,
            Err(_) => return false,
        };

        let mut trace: Vec<String> = vec![format!("{}: {}", class_name, message_text)];
        let mut prev: Option<(usize, ObjRef)> = None;
        let mut repeat_count = 0usize;

        loop {
            let frame = self.frame();
            if frame.is_try {
                break;
            }
            let result = self.pop();
            self.close_upvalues(frame.base);

            let (line, function) = self.frame_trace_location(&frame);
            if prev == Some((line, function)) {
                repeat_count += 1;
            } else {
                if repeat_count > 0 {
                    trace.push(format!("[Previous * {}]", repeat_count));
                    repeat_count = 0;
                }
                trace.push(self.trace_line(line, function));
                prev = Some((line, function));
            }

            self.frames.pop();
            if self.frames.is_empty() {
                self.pop();
                if repeat_count > 0 {
                    trace.push(format!("[Previous * {}]", repeat_count));
                }
                for line in &trace {
                    eprintln!("{}", line);
                }
                return false;
            }
            self.stack.truncate(frame.base);
            self.push(result);
        }

        if repeat_count > 0 {
            trace.push(format!("[Previous * {}]", repeat_count));
        }
        let frame = self.frame();
        let (line, function) = self.frame_trace_location(&frame);
        trace.push(self.trace_line(line, function));

        // Materialize the trace as a list of strings, pinned while built.
        let mark = self.heap.temp_roots.len();
        for line in &trace {
            let id = self.take_string(line.clone());
            self.heap.temp_roots.push(Value::Obj(id.obj));
        }
        let items = self.heap.temp_roots[mark..].to_vec();
        let trace_list = self.alloc(Obj::List(ListObj { items }));
        self.heap.temp_roots.truncate(mark);
        self.heap
            .instance_mut(instance)
            .fields
            .set(self.names.stack_trace, Value::Obj(trace_list));

        let frame = self.frame_mut();
        frame.is_try = false;
        let catch_ip = frame.catch_ip;
        let try_stack = frame.try_stack;
        frame.ip = catch_ip;
        self.stack.truncate(try_stack);
        self.push(throwee);
        true
    }

    fn frame_trace_location(&self, frame: &CallFrame) -> (usize, ObjRef) {
        let closure = self.heap.closure(frame.closure);
        let function = closure.function;
        let chunk = &self.heap.function(function).chunk;
        let line = chunk.lines.line(frame.ip.saturating_sub(1));
        (line, function)
    }

    fn trace_line(&self, line: usize, function: ObjRef) -> String {
        let name = match self.heap.function(function).name {
            Some(id) => self.str_text(id),
            None => "<script>".to_string(),
        };
        format!("[{}] in {}", line, name)
    }

    // -- Upvalues --

    /// Find or create the open upvalue for a stack slot, keeping the list
    /// ordered by slot, deepest first.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            let location = match self.heap.upvalue(r).state {
                UpvalueState::Open(location) => location,
                UpvalueState::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if location <= slot {
                if location == slot {
                    return r;
                }
                break;
            }
            prev = Some(r);
            current = self.heap.upvalue(r).next;
        }

        let created = self.alloc(Obj::Upvalue(UpvalueObj {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `threshold`, copying the stack
    /// slot's value into the upvalue itself.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(r) = self.open_upvalues {
            let (slot, next) = match self.heap.upvalue(r) {
                UpvalueObj {
                    state: UpvalueState::Open(slot),
                    next,
                } => (*slot, *next),
                _ => unreachable!("closed upvalue in open list"),
            };
            if slot < threshold {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(r).state = UpvalueState::Closed(value);
            self.open_upvalues = next;
        }
    }

    // -- Call protocol --

    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> CallFlow {
        let function_ref = self.heap.closure(closure).function;
        let (arity, is_lambda, varargs) = {
            let function = self.heap.function(function_ref);
            (function.arity, function.is_lambda, function.varargs)
        };
        let mut arg_count = arg_count as usize;

        if varargs {
            let required = arity - 1;
            if arg_count < required {
                if is_lambda {
                    while arg_count < required {
                        self.push(Value::Null);
                        arg_count += 1;
                    }
                } else {
                    return self.throw_flow(
                        "ArityException",
                        format!(
                            "Expected {} or more arguments but got {}.",
                            required, arg_count
                        ),
                    );
                }
            }
            let surplus = arg_count - required;
            let split = self.stack.len() - surplus;
            let items = self.stack[split..].to_vec();
            let list = self.alloc(Obj::List(ListObj { items }));
            self.stack.truncate(split);
            self.push(Value::Obj(list));
        } else if arg_count != arity {
            if !is_lambda {
                return self.throw_flow(
                    "ArityException",
                    format!("Expected {} arguments but got {}.", arity, arg_count),
                );
            }
            // Lambdas have lax arity: drop extras, pad with null.
            while arg_count > arity {
                self.pop();
                arg_count -= 1;
            }
            while arg_count < arity {
                self.push(Value::Null);
                arg_count += 1;
            }
        }

        if self.frames.len() == FRAMES_MAX {
            return self.throw_flow(
                "StackOverflowException",
                format!("Stack overflow (Max frame: {}).", FRAMES_MAX),
            );
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arity - 1,
            is_try: false,
            catch_ip: 0,
            try_stack: 0,
        });
        CallFlow::Frame
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> CallFlow {
        if let Value::Obj(r) = callee {
            if matches!(self.heap.get(r), Obj::BoundMethod(_)) {
                let (receiver, method) = {
                    let bound = self.heap.bound_method(r);
                    (bound.receiver, bound.method)
                };
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                return self.call_closure(method, arg_count);
            }
            if matches!(self.heap.get(r), Obj::Class(_)) {
                return self.call_class(r, arg_count);
            }
            if matches!(self.heap.get(r), Obj::Closure(_)) {
                return self.call_closure(r, arg_count);
            }
            if matches!(self.heap.get(r), Obj::Native(_)) {
                return self.call_native(r, arg_count);
            }
        }
        self.throw_flow(
            "TypeException",
            "Can only call functions or classes.".to_string(),
        )
    }

    fn call_class(&mut self, class: ObjRef, arg_count: u8) -> CallFlow {
        let instance = self.alloc(Obj::Instance(InstanceObj {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance);

        match self.heap.class(class).methods.get(self.names.constructor) {
            Some(initializer) => {
                let init_ref = initializer.as_obj();
                if matches!(self.heap.get(init_ref), Obj::Native(_)) {
                    self.heap.native_mut(init_ref).bound = Some(Value::Obj(instance));
                    return self.call_native(init_ref, arg_count);
                }
                self.call_closure(init_ref, arg_count)
            }
            None if arg_count != 0 => self.throw_flow(
                "ArityException",
                format!("Expected 0 arguments but got {}.", arg_count),
            ),
            None => CallFlow::Done,
        }
    }

    fn call_native(&mut self, native: ObjRef, arg_count: u8) -> CallFlow {
        let (function, arity, varargs, bound) = {
            let n = self.heap.native(native);
            (n.function, n.arity, n.varargs, n.bound)
        };
        let arg_count = arg_count as usize;

        if arg_count != arity && !(varargs && arg_count > arity) {
            return self.throw_flow(
                "ArityException",
                format!("Expected {} argument(s) but got {}.", arity, arg_count),
            );
        }

        let base = self.stack.len() - arg_count;
        let args: Vec<Value> = self.stack[base..].to_vec();
        match function(self, bound, &args) {
            Ok(result) => {
                self.stack.truncate(base - 1);
                self.push(result);
                CallFlow::Done
            }
            Err(NativeError::Exception(exception)) => {
                self.stack.truncate(base - 1);
                self.push(exception);
                if self.throw_value(exception) {
                    CallFlow::Caught
                } else {
                    CallFlow::Uncaught
                }
            }
            Err(NativeError::Unwound) => CallFlow::Caught,
            Err(NativeError::Fatal) => CallFlow::Uncaught,
        }
    }

    /// Call a language value from native context: pushes the callee and
    /// arguments, then drives a nested fetch/execute until the frame depth
    /// returns to its entry baseline.
    pub fn call_from_native(&mut self, callee: Value, args: &[Value]) -> NativeResult {
        let entry_depth = self.frames.len();
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        match self.call_value(callee, args.len() as u8) {
            CallFlow::Done => Ok(self.pop()),
            CallFlow::Frame => self.run_to_depth(entry_depth),
            CallFlow::Caught => Err(NativeError::Unwound),
            CallFlow::Uncaught => Err(NativeError::Fatal),
        }
    }

    /// Like `call_from_native` but substitutes `receiver` for the callee
    /// slot, the calling convention for method closures.
    pub fn call_method_from_native(
        &mut self,
        method: Value,
        receiver: Value,
        args: &[Value],
    ) -> NativeResult {
        let entry_depth = self.frames.len();
        self.push(receiver);
        for &arg in args {
            self.push(arg);
        }
        let flow = match method {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Native(_)) => {
                self.heap.native_mut(r).bound = Some(receiver);
                self.call_native(r, args.len() as u8)
            }
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Closure(_)) => {
                self.call_closure(r, args.len() as u8)
            }
            _ => self.call_value(method, args.len() as u8),
        };
        match flow {
            CallFlow::Done => Ok(self.pop()),
            CallFlow::Frame => self.run_to_depth(entry_depth),
            CallFlow::Caught => Err(NativeError::Unwound),
            CallFlow::Uncaught => Err(NativeError::Fatal),
        }
    }

    /// Nested drive: step until the frame count drops back to
    /// `entry_depth` (normal completion) or below it (an exception
    /// unwound past the nested call).
    fn run_to_depth(&mut self, entry_depth: usize) -> NativeResult {
        loop {
            match self.fetch_execute(true, entry_depth) {
                Action::Continue => {
                    if self.frames.len() <= entry_depth {
                        return Err(NativeError::Unwound);
                    }
                }
                Action::Ok => return Ok(self.pop()),
                Action::CompileErr | Action::RuntimeErr => return Err(NativeError::Fatal),
            }
        }
    }

    // -- Method dispatch --

    fn bind_method(&mut self, class: ObjRef, name: StrId) -> CallFlow {
        let method = match self.heap.class(class).methods.get(name) {
            Some(method) => method,
            None => {
                return self.throw_flow(
                    "PropertyException",
                    format!("Undefined property '{}'.", self.str_text(name)),
                );
            }
        };
        let method_ref = method.as_obj();
        let receiver = self.peek(0);
        if matches!(self.heap.get(method_ref), Obj::Native(_)) {
            self.heap.native_mut(method_ref).bound = Some(receiver);
            self.pop();
            self.push(method);
        } else {
            let bound = self.alloc(Obj::BoundMethod(BoundMethodObj {
                receiver,
                method: method_ref,
            }));
            self.pop();
            self.push(Value::Obj(bound));
        }
        CallFlow::Done
    }

    fn invoke(&mut self, name: StrId, arg_count: u8) -> CallFlow {
        let receiver = self.peek(arg_count as usize);

        if self.is_list(receiver) {
            let method = match self.list_methods.get(name) {
                Some(method) => method,
                None => {
                    return self.throw_flow(
                        "PropertyException",
                        format!("Undefined list method '{}'.", self.str_text(name)),
                    );
                }
            };
            self.heap.native_mut(method.as_obj()).bound = Some(receiver);
            return self.call_value(method, arg_count);
        }
        if self.is_string(receiver) {
            let method = match self.string_methods.get(name) {
                Some(method) => method,
                None => {
                    return self.throw_flow(
                        "PropertyException",
                        format!("Undefined string method '{}'.", self.str_text(name)),
                    );
                }
            };
            self.heap.native_mut(method.as_obj()).bound = Some(receiver);
            return self.call_value(method, arg_count);
        }

        if !self.is_instance(receiver) {
            return self.throw_flow(
                "TypeException",
                "Only instances contain methods.".to_string(),
            );
        }

        let instance = receiver.as_obj();
        if let Some(field) = self.heap.instance(instance).fields.get(name) {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }
        let class = self.heap.instance(instance).class;
        self.invoke_from_class(instance, class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        instance: ObjRef,
        class: ObjRef,
        name: StrId,
        arg_count: u8,
    ) -> CallFlow {
        let method = match self.heap.class(class).methods.get(name) {
            Some(method) => method,
            None => {
                return self.throw_flow(
                    "PropertyException",
                    format!("Undefined property '{}'.", self.str_text(name)),
                );
            }
        };
        let method_ref = method.as_obj();
        if matches!(self.heap.get(method_ref), Obj::Native(_)) {
            self.heap.native_mut(method_ref).bound = Some(Value::Obj(instance));
            return self.call_value(method, arg_count);
        }
        self.call_closure(method_ref, arg_count)
    }

    // -- Operators --

    /// `+` with at least one string operand. When the left operand is an
    /// instance the conversions run left-to-right so its `toString` side
    /// effects come first; otherwise right-to-left, matching the original
    /// calling convention.
    fn concatenate(&mut self) -> CallFlow {
        let b = self.peek(0);
        let a = self.peek(1);

        let (first, second) = if self.is_instance(a) { (a, b) } else { (b, a) };
        let first_text = match self.value_to_string(first) {
            Ok(text) => text,
            Err(e) => return self.native_error_flow(e),
        };
        let second_text = match self.value_to_string(second) {
            Ok(text) => text,
            Err(e) => return self.native_error_flow(e),
        };
        let (a_text, b_text) = if self.is_instance(a) {
            (first_text, second_text)
        } else {
            (second_text, first_text)
        };

        let result = self.take_string(format!("{}{}", a_text, b_text));
        self.pop();
        self.pop();
        self.push(Value::Obj(result.obj));
        CallFlow::Done
    }

    fn native_error_flow(&mut self, error: NativeError) -> CallFlow {
        match error {
            NativeError::Exception(exception) => {
                self.pop();
                self.pop();
                self.push(exception);
                if self.throw_value(exception) {
                    CallFlow::Caught
                } else {
                    CallFlow::Uncaught
                }
            }
            NativeError::Unwound => CallFlow::Caught,
            NativeError::Fatal => CallFlow::Uncaught,
        }
    }

    fn binary_number_op(&mut self, f: fn(f64, f64) -> Value) -> CallFlow {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            self.pop();
            self.pop();
            return self.throw_flow("TypeException", "Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(f(a, b));
        CallFlow::Done
    }

    fn bitwise_binary_op(&mut self, f: fn(i64, i64) -> f64) -> CallFlow {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            self.pop();
            self.pop();
            return self.throw_flow("TypeException", "Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        if !is_integer(a) || !is_integer(b) {
            return self.throw_flow("TypeException", "Operands must be integers.".to_string());
        }
        self.push(Value::Number(f(a as i64, b as i64)));
        CallFlow::Done
    }

    fn shift_op(&mut self, f: fn(i64, u32) -> f64) -> CallFlow {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            self.pop();
            self.pop();
            return self.throw_flow("TypeException", "Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        if !is_integer(a) || !is_integer(b) || b < 0.0 {
            return self.throw_flow("TypeException", "Operands must be integers.".to_string());
        }
        self.push(Value::Number(f(a as i64, (b as i64).min(64) as u32)));
        CallFlow::Done
    }

    /// Signed index validation shared by lists, strings, and iterators.
    fn validate_index(&mut self, length: usize, index_value: Value) -> Result<usize, CallFlow> {
        if !index_value.is_number() {
            return Err(self.throw_flow("TypeException", "Index must be a number.".to_string()));
        }
        let number = index_value.as_number();
        if !is_integer(number) {
            return Err(self.throw_flow("TypeException", "Index must be an integer.".to_string()));
        }
        let signed = number as i64;
        let resolved = if signed < 0 {
            length as i128 + signed as i128
        } else {
            signed as i128
        };
        if resolved < 0 || resolved >= length as i128 {
            return Err(self.throw_flow(
                "IndexException",
                format!("Index {} is out of bounds for length {}.", signed, length),
            ));
        }
        Ok(resolved as usize)
    }

    // -- Fetch/execute --

    /// Execute one instruction. `is_function_call` marks a nested drive; a
    /// RETURN that brings the frame count back to `base_frame_count`
    /// finishes the drive.
    fn fetch_execute(&mut self, is_function_call: bool, base_frame_count: usize) -> Action {
        let chunk = self.current_chunk();
        let instruction = self.read_byte(&chunk);

        macro_rules! flow {
            ($flow:expr) => {
                match $flow {
                    CallFlow::Uncaught => return Action::RuntimeErr,
                    _ => {}
                }
            };
        }

        match instruction {
            op::CONSTANT => {
                let constant = self.read_constant(&chunk);
                self.push(constant);
            }
            op::NULL => self.push(Value::Null),
            op::TRUE => self.push(Value::Bool(true)),
            op::FALSE => self.push(Value::Bool(false)),
            op::OBJECT => {
                let class = self.object_class;
                self.push(Value::Obj(class));
            }

            op::LIST => {
                let count = self.read_byte(&chunk) as usize;
                let split = self.stack.len() - count;
                let items = self.stack[split..].to_vec();
                let list = self.alloc(Obj::List(ListObj { items }));
                self.stack.truncate(split);
                self.push(Value::Obj(list));
            }

            op::RANGE => {
                let end = self.pop();
                let start = self.pop();
                if !start.is_number() || !end.is_number() {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Operands must be numbers.".to_string()
                    ));
                    return Action::Continue;
                }
                let (a, b) = (start.as_number(), end.as_number());
                if !is_integer(a) || !is_integer(b) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Operands must be integers.".to_string()
                    ));
                    return Action::Continue;
                }
                let (a, b) = (a as i64, b as i64);
                let items: Vec<Value> = if b > a {
                    (a..=b).map(|i| Value::Number(i as f64)).collect()
                } else {
                    (b..=a).rev().map(|i| Value::Number(i as f64)).collect()
                };
                let list = self.alloc(Obj::List(ListObj { items }));
                self.push(Value::Obj(list));
            }

            op::GET_GLOBAL => {
                let name = self.read_string(&chunk);
                let module = self.current_module();
                match self.modules[module].globals.get(name) {
                    Some(value) => self.push(value),
                    None => {
                        flow!(self.throw_flow(
                            "UndefinedVariableException",
                            format!("Undefined variable '{}'.", self.str_text(name)),
                        ));
                    }
                }
            }

            op::DEFINE_GLOBAL => {
                let name = self.read_string(&chunk);
                let value = self.peek(0);
                let module = self.current_module();
                self.modules[module].globals.set(name, value);
                self.pop();
            }

            op::SET_GLOBAL => {
                let name = self.read_string(&chunk);
                let value = self.peek(0);
                let module = self.current_module();
                if self.modules[module].globals.set(name, value) {
                    self.modules[module].globals.delete(name);
                    flow!(self.throw_flow(
                        "UndefinedVariableException",
                        format!("Undefined variable '{}'.", self.str_text(name)),
                    ));
                }
            }

            op::GET_LOCAL => {
                let slot = self.read_byte(&chunk) as usize;
                let base = self.frame().base;
                let value = self.stack[base + slot];
                self.push(value);
            }

            op::SET_LOCAL => {
                let slot = self.read_byte(&chunk) as usize;
                let base = self.frame().base;
                self.stack[base + slot] = self.peek(0);
            }

            op::GET_UPVALUE => {
                let slot = self.read_byte(&chunk) as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open(location) => self.stack[location],
                    UpvalueState::Closed(value) => value,
                };
                self.push(value);
            }

            op::SET_UPVALUE => {
                let slot = self.read_byte(&chunk) as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = self.peek(0);
                match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open(location) => self.stack[location] = value,
                    UpvalueState::Closed(_) => {
                        self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                    }
                }
            }

            op::CLOSE_UPVALUE => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            op::GET_PROPERTY => {
                let name = self.read_string(&chunk);
                let target = self.peek(0);

                if self.is_list(target) {
                    match self.list_methods.get(name) {
                        Some(method) => {
                            let receiver = self.pop();
                            self.heap.native_mut(method.as_obj()).bound = Some(receiver);
                            self.push(method);
                        }
                        None => {
                            flow!(self.throw_flow(
                                "PropertyException",
                                format!("Undefined list method '{}'.", self.str_text(name)),
                            ));
                        }
                    }
                } else if self.is_string(target) {
                    match self.string_methods.get(name) {
                        Some(method) => {
                            let receiver = self.pop();
                            self.heap.native_mut(method.as_obj()).bound = Some(receiver);
                            self.push(method);
                        }
                        None => {
                            flow!(self.throw_flow(
                                "PropertyException",
                                format!("Undefined string method '{}'.", self.str_text(name)),
                            ));
                        }
                    }
                } else if self.is_instance(target) {
                    let instance = target.as_obj();
                    match self.heap.instance(instance).fields.get(name) {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => {
                            let class = self.heap.instance(instance).class;
                            flow!(self.bind_method(class, name));
                        }
                    }
                } else {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Only instances contain properties.".to_string(),
                    ));
                }
            }

            op::SET_PROPERTY => {
                let name = self.read_string(&chunk);
                if !self.is_instance(self.peek(1)) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Only instances contain fields.".to_string(),
                    ));
                    return Action::Continue;
                }
                let instance = self.peek(1).as_obj();
                let value = self.peek(0);
                self.heap.instance_mut(instance).fields.set(name, value);
                let value = self.pop();
                self.pop();
                self.push(value);
            }

            op::SET_PROPERTY_KV => {
                let name = self.read_string(&chunk);
                if !self.is_instance(self.peek(1)) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Only instances contain fields.".to_string(),
                    ));
                    return Action::Continue;
                }
                let instance = self.peek(1).as_obj();
                let value = self.peek(0);
                self.heap.instance_mut(instance).fields.set(name, value);
                self.pop();
            }

            op::GET_INDEX => {
                let container = self.peek(1);
                if self.is_list(container) {
                    let index_value = self.pop();
                    let list = self.pop().as_obj();
                    let length = self.heap.list(list).items.len();
                    match self.validate_index(length, index_value) {
                        Ok(index) => {
                            let value = self.heap.list(list).items[index];
                            self.push(value);
                        }
                        Err(flow) => flow!(flow),
                    }
                } else if self.is_string(container) {
                    let index_value = self.pop();
                    let string = self.pop().as_obj();
                    let length = self.heap.string(string).chars.len();
                    match self.validate_index(length, index_value) {
                        Ok(index) => {
                            let bytes = self.heap.string(string).chars.as_bytes();
                            let one = String::from_utf8_lossy(&bytes[index..index + 1]).into_owned();
                            let id = self.take_string(one);
                            self.push(Value::Obj(id.obj));
                        }
                        Err(flow) => flow!(flow),
                    }
                } else if self.is_instance(container) {
                    let index_value = self.pop();
                    let instance = self.pop().as_obj();
                    if !self.is_string(index_value) {
                        flow!(self.throw_flow(
                            "TypeException",
                            "Field name must be a string.".to_string(),
                        ));
                        return Action::Continue;
                    }
                    let key = self.heap.str_id(index_value);
                    let value = self
                        .heap
                        .instance(instance)
                        .fields
                        .get(key)
                        .unwrap_or(Value::Null);
                    self.push(value);
                } else {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Can only index into lists.".to_string(),
                    ));
                }
            }

            op::SET_INDEX => {
                let container = self.peek(2);
                if self.is_list(container) {
                    let value = self.pop();
                    let index_value = self.pop();
                    let list = self.pop().as_obj();
                    let length = self.heap.list(list).items.len();
                    match self.validate_index(length, index_value) {
                        Ok(index) => {
                            self.heap.list_mut(list).items[index] = value;
                            self.push(value);
                        }
                        Err(flow) => flow!(flow),
                    }
                } else if self.is_instance(container) {
                    let value = self.peek(0);
                    let index_value = self.peek(1);
                    let instance = self.peek(2).as_obj();
                    if !self.is_string(index_value) {
                        flow!(self.throw_flow(
                            "TypeException",
                            "Field name must be a string.".to_string(),
                        ));
                        return Action::Continue;
                    }
                    let key = self.heap.str_id(index_value);
                    self.heap.instance_mut(instance).fields.set(key, value);
                    self.stack.truncate(self.stack.len() - 3);
                    self.push(value);
                } else {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Can only index into lists.".to_string(),
                    ));
                }
            }

            op::GET_SUPER => {
                let name = self.read_string(&chunk);
                let superclass = self.pop().as_obj();
                flow!(self.bind_method(superclass, name));
            }

            op::POP => {
                self.pop();
            }
            op::DUP => {
                let top = self.peek(0);
                self.push(top);
            }
            op::DUP_X2 => {
                // x, y -> x, y, x, y
                let x = self.peek(1);
                let y = self.peek(0);
                self.push(x);
                self.push(y);
            }
            op::SWAP => {
                let a = self.pop();
                let b = self.pop();
                self.push(a);
                self.push(b);
            }

            op::NOT => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsey()));
            }

            op::NEGATE => {
                if !self.peek(0).is_number() {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Operand must be a number.".to_string()
                    ));
                    return Action::Continue;
                }
                let value = self.pop().as_number();
                self.push(Value::Number(-value));
            }

            op::ADD => {
                let a = self.peek(1);
                let b = self.peek(0);
                if self.is_list(a) {
                    let list = a.as_obj();
                    let mut items = self.heap.list(list).items.clone();
                    items.push(b);
                    let appended = self.alloc(Obj::List(ListObj { items }));
                    self.pop();
                    self.pop();
                    self.push(Value::Obj(appended));
                } else if self.is_string(a) || self.is_string(b) {
                    flow!(self.concatenate());
                } else if a.is_number() && b.is_number() {
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::Number(a + b));
                } else {
                    self.pop();
                    self.pop();
                    flow!(self.throw_flow(
                        "TypeException",
                        "Operands are invalid for '+' operation.".to_string(),
                    ));
                }
            }

            op::SUB => flow!(self.binary_number_op(|a, b| Value::Number(a - b))),
            op::MUL => flow!(self.binary_number_op(|a, b| Value::Number(a * b))),
            op::DIV => flow!(self.binary_number_op(|a, b| Value::Number(a / b))),
            op::MOD => flow!(self.binary_number_op(|a, b| Value::Number(a % b))),

            op::BIT_NOT => {
                if !self.peek(0).is_number() {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Operand must be a number.".to_string()
                    ));
                    return Action::Continue;
                }
                let value = self.pop().as_number();
                if !is_integer(value) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Operand must be an integer.".to_string()
                    ));
                    return Action::Continue;
                }
                self.push(Value::Number(!(value as i64) as f64));
            }

            op::BIT_AND => flow!(self.bitwise_binary_op(|a, b| (a & b) as f64)),
            op::BIT_OR => flow!(self.bitwise_binary_op(|a, b| (a | b) as f64)),
            op::BIT_XOR => flow!(self.bitwise_binary_op(|a, b| (a ^ b) as f64)),
            op::LSH => flow!(self.shift_op(|a, b| {
                if b >= 64 {
                    0.0
                } else {
                    ((a as u64) << b) as i64 as f64
                }
            })),
            op::ASH => flow!(self.shift_op(|a, b| {
                if b >= 64 {
                    if a < 0 {
                        -1.0
                    } else {
                        0.0
                    }
                } else {
                    (a >> b) as f64
                }
            })),
            op::RSH => flow!(self.shift_op(|a, b| {
                if b >= 64 {
                    0.0
                } else {
                    ((a as u64) >> b) as f64
                }
            })),

            op::EQUAL => {
                let b = self.pop();
                let a = self.pop();
                let equal = self.values_equal(a, b);
                self.push(Value::Bool(equal));
            }

            op::NOT_EQUAL => {
                let b = self.pop();
                let a = self.pop();
                let equal = self.values_equal(a, b);
                self.push(Value::Bool(!equal));
            }

            op::IS => {
                let b = self.pop();
                let a = self.pop();
                let result = if self.is_class(b) && !self.is_class(a) {
                    let class = b.as_obj();
                    if self.is_instance(a) {
                        self.instance_of(a.as_obj(), class)
                    } else {
                        self.marker_class(a) == Some(class)
                    }
                } else if a.is_obj() && b.is_obj() {
                    a.as_obj() == b.as_obj()
                } else {
                    self.values_equal(a, b)
                };
                self.push(Value::Bool(result));
            }

            op::GREATER => flow!(self.binary_number_op(|a, b| Value::Bool(a > b))),
            op::GREATER_EQ => flow!(self.binary_number_op(|a, b| Value::Bool(a >= b))),
            op::LESS => flow!(self.binary_number_op(|a, b| Value::Bool(a < b))),
            op::LESS_EQ => flow!(self.binary_number_op(|a, b| Value::Bool(a <= b))),

            op::IN => {
                let b = self.pop();
                let a = self.pop();
                if self.is_list(b) {
                    let items = self.heap.list(b.as_obj()).items.clone();
                    let found = items.iter().any(|&item| self.values_equal(item, a));
                    self.push(Value::Bool(found));
                } else if self.is_instance(b) {
                    if !self.is_string(a) {
                        flow!(self.throw_flow(
                            "TypeException",
                            "Field name must be a string.".to_string(),
                        ));
                        return Action::Continue;
                    }
                    let key = self.heap.str_id(a);
                    let has = self.heap.instance(b.as_obj()).fields.contains(key);
                    self.push(Value::Bool(has));
                } else if self.is_string(b) {
                    if !self.is_string(a) {
                        flow!(self.throw_flow(
                            "TypeException",
                            "Substring must be a string.".to_string(),
                        ));
                        return Action::Continue;
                    }
                    let haystack = self.heap.string(b.as_obj()).chars.clone();
                    let needle = self.heap.string(a.as_obj()).chars.clone();
                    self.push(Value::Bool(haystack.contains(&needle)));
                } else {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Can only use 'in' on strings, lists, and instances.".to_string(),
                    ));
                }
            }

            op::INSTANCEOF => {
                let superclass = self.pop();
                let value = self.pop();
                if !self.is_instance(value) {
                    self.push(Value::Bool(false));
                } else if !self.is_class(superclass) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Superclass must be a class.".to_string(),
                    ));
                } else {
                    let result = self.instance_of(value.as_obj(), superclass.as_obj());
                    self.push(Value::Bool(result));
                }
            }

            op::TYPEOF => {
                let value = self.pop();
                let name = match value {
                    Value::Bool(_) => self.names.type_boolean,
                    Value::Number(_) => self.names.type_number,
                    Value::Null => self.names.type_null,
                    Value::Obj(r) => match self.heap.get(r) {
                        Obj::Closure(_)
                        | Obj::BoundMethod(_)
                        | Obj::Native(_)
                        | Obj::Function(_) => self.names.type_function,
                        Obj::Class(_) => self.names.type_class,
                        Obj::Instance(_) => self.names.type_instance,
                        Obj::String(_) => self.names.type_string,
                        Obj::List(_) => self.names.type_list,
                        Obj::Upvalue(_) => self.names.type_null,
                    },
                };
                self.push(Value::Obj(name.obj));
            }

            op::JUMP_IF_FALSE => {
                let offset = self.read_short(&chunk) as usize;
                if self.pop().is_falsey() {
                    self.frame_mut().ip += offset;
                }
            }

            op::JUMP_IF_FALSE_SC => {
                let offset = self.read_short(&chunk) as usize;
                if self.peek(0).is_falsey() {
                    self.frame_mut().ip += offset;
                }
            }

            op::JUMP => {
                let offset = self.read_short(&chunk) as usize;
                self.frame_mut().ip += offset;
            }

            op::LOOP => {
                let offset = self.read_short(&chunk) as usize;
                self.frame_mut().ip -= offset;
            }

            op::CALL => {
                let arg_count = self.read_byte(&chunk);
                let callee = self.peek(arg_count as usize);
                flow!(self.call_value(callee, arg_count));
            }

            op::CLOSURE => {
                let function_value = self.read_constant(&chunk);
                let function = function_value.as_obj();
                let module = self.current_module();
                let upvalue_count = self.heap.function(function).upvalue_count;
                let closure = self.alloc(Obj::Closure(ClosureObj {
                    function,
                    upvalues: Vec::with_capacity(upvalue_count),
                    module,
                }));
                self.push(Value::Obj(closure));
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte(&chunk) != 0;
                    let index = self.read_byte(&chunk) as usize;
                    let upvalue = if is_local {
                        let base = self.frame().base;
                        self.capture_upvalue(base + index)
                    } else {
                        self.heap.closure(self.frame().closure).upvalues[index]
                    };
                    self.heap.closure_mut(closure).upvalues.push(upvalue);
                }
            }

            op::CLASS => {
                let name = self.read_string(&chunk);
                let class = self.alloc(Obj::Class(ClassObj {
                    name,
                    methods: Table::new(),
                    superclass: None,
                }));
                self.push(Value::Obj(class));
            }

            op::INHERIT => {
                let superclass = self.peek(1);
                if !self.is_class(superclass) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Superclass must be a class.".to_string(),
                    ));
                    return Action::Continue;
                }
                let superclass = superclass.as_obj();
                let subclass = self.peek(0).as_obj();
                let methods: Vec<(StrId, Value)> =
                    self.heap.class(superclass).methods.iter().collect();
                let subclass_obj = self.heap.class_mut(subclass);
                for (key, value) in methods {
                    subclass_obj.methods.set(key, value);
                }
                subclass_obj.superclass = Some(superclass);
                self.pop();
            }

            op::METHOD => {
                let name = self.read_string(&chunk);
                let method = self.peek(0);
                let class = self.peek(1).as_obj();
                self.heap.class_mut(class).methods.set(name, method);
                self.pop();
            }

            op::INVOKE => {
                let name = self.read_string(&chunk);
                let arg_count = self.read_byte(&chunk);
                flow!(self.invoke(name, arg_count));
            }

            op::SUPER_INVOKE => {
                let name = self.read_string(&chunk);
                let arg_count = self.read_byte(&chunk);
                let superclass = self.pop().as_obj();
                let receiver_slot = self.frame().base;
                let receiver = self.stack[receiver_slot];
                flow!(self.invoke_from_class(receiver.as_obj(), superclass, name, arg_count));
            }

            op::THROW => {
                let throwee = self.peek(0);
                if !self.is_instance(throwee) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Throwee must be an instance.".to_string(),
                    ));
                    return Action::Continue;
                }
                let exception_class = self.exception_class;
                if !self.instance_of(throwee.as_obj(), exception_class) {
                    flow!(self.throw_flow(
                        "TypeException",
                        "Throwee must inherit from 'Exception'.".to_string(),
                    ));
                    return Action::Continue;
                }
                if !self.throw_value(throwee) {
                    return Action::RuntimeErr;
                }
            }

            op::TRY_BEGIN => {
                let offset = self.read_short(&chunk) as usize;
                let stack_len = self.stack.len();
                let frame = self.frame_mut();
                frame.is_try = true;
                frame.catch_ip = frame.ip + offset;
                frame.try_stack = stack_len;
            }

            op::TRY_END => {
                self.frame_mut().is_try = false;
            }

            op::IMPORT => {
                let path_value = self.read_constant(&chunk);
                let path = self.heap.str_id(path_value);

                if let Some(cached) = self.import_table.get(path) {
                    self.push(cached);
                    return Action::Continue;
                }

                let lookup = format!("{}/{}.dgn", self.directory, self.str_text(path));
                let source = match std::fs::read_to_string(&lookup) {
                    Ok(source) => source,
                    Err(_) => {
                        eprintln!("Could not open file \"{}\".", lookup);
                        std::process::exit(120);
                    }
                };
                debug!("importing module '{}'", self.str_text(path));

                let function = match compiler::compile(&mut self.heap, &source) {
                    Some(function) => function,
                    None => return Action::CompileErr,
                };

                let module = self.new_module();
                self.modules[module]
                    .globals
                    .set(self.names.this_module, path_value);

                self.push(Value::Obj(function));
                let closure = self.alloc(Obj::Closure(ClosureObj {
                    function,
                    upvalues: Vec::new(),
                    module,
                }));
                self.pop();

                match self.call_from_native(Value::Obj(closure), &[]) {
                    Ok(_) => {}
                    // A failed import leaves its exception propagating.
                    Err(NativeError::Unwound) => return Action::Continue,
                    Err(_) => return Action::RuntimeErr,
                }

                let import_obj = self.alloc(Obj::Instance(InstanceObj {
                    class: self.import_class,
                    fields: Table::new(),
                }));
                self.push(Value::Obj(import_obj));
                let exports: Vec<(StrId, Value)> = self.modules[module].exports.iter().collect();
                let fields = &mut self.heap.instance_mut(import_obj).fields;
                for (key, value) in exports {
                    fields.set(key, value);
                }
                self.import_table.set(path, Value::Obj(import_obj));
            }

            op::EXPORT => {
                let name = self.read_string(&chunk);
                let value = self.peek(0);
                let module = self.current_module();
                self.modules[module].exports.set(name, value);
                self.pop();
            }

            op::RETURN => {
                let value = self.pop();
                let frame = self.frame();
                self.close_upvalues(frame.base);
                self.frames.pop();
                if (is_function_call && self.frames.len() == base_frame_count)
                    || self.frames.is_empty()
                {
                    self.stack.truncate(frame.base);
                    if is_function_call {
                        self.push(value);
                    }
                    return Action::Ok;
                }
                self.stack.truncate(frame.base);
                self.push(value);
            }

            _ => unreachable!("unknown opcode {}", instruction),
        }
        Action::Continue
    }

    // -- Garbage collection --

    /// Mark every root, trace, and sweep.
    pub fn collect_garbage(&mut self) {
        debug!("gc cycle at {} bytes", self.heap.bytes_allocated);

        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }
        for module in &self.modules {
            self.heap.mark_table(&module.globals);
            self.heap.mark_table(&module.exports);
        }
        self.heap.mark_table(&self.import_table);
        self.heap.mark_table(&self.list_methods);
        self.heap.mark_table(&self.string_methods);
        for &(name, value) in &self.global_values {
            self.heap.mark_object(name.obj);
            self.heap.mark_value(value);
        }
        let name_roots = [
            self.names.constructor,
            self.names.message,
            self.names.stack_trace,
            self.names.index,
            self.names.data,
            self.names.this_module,
            self.names.to_string,
            self.names.type_boolean,
            self.names.type_number,
            self.names.type_null,
            self.names.type_function,
            self.names.type_class,
            self.names.type_instance,
            self.names.type_string,
            self.names.type_list,
        ];
        for id in name_roots {
            self.heap.mark_object(id.obj);
        }
        let class_roots = [
            self.object_class,
            self.iterator_class,
            self.import_class,
            self.exception_class,
            self.number_class,
            self.string_class,
            self.boolean_class,
            self.list_class,
            self.function_class,
        ];
        for class in class_roots {
            self.heap.mark_object(class);
        }
        for i in 0..self.exception_classes.len() {
            let class = self.exception_classes[i];
            self.heap.mark_object(class);
        }
        self.heap.mark_own_roots();

        self.heap.trace_references();
        self.heap.sweep();
    }

    /// Build an Iterator instance over `data` (a list or string).
    pub(crate) fn make_iterator(&mut self, data: Value) -> Value {
        let class = self.iterator_class;
        let instance = self.alloc(Obj::Instance(InstanceObj {
            class,
            fields: Table::new(),
        }));
        self.push(Value::Obj(instance));
        let index_name = self.names.index;
        let data_name = self.names.data;
        let fields = &mut self.heap.instance_mut(instance).fields;
        fields.set(index_name, Value::Number(0.0));
        fields.set(data_name, data);
        self.pop()
    }
}

fn bare_class(heap: &mut Heap, name: &str) -> ObjRef {
    let id = heap.intern(name);
    heap.alloc(Obj::Class(ClassObj {
        name: id,
        methods: Table::new(),
        superclass: None,
    }))
}

/// Expand control characters back into escape sequences for `repr`.
fn escape_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> (InterpretResult, String) {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let result = vm.interpret(".", source);
        let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8 output");
        (result, output)
    }

    fn run_ok(source: &str) -> String {
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok, "output so far: {}", output);
        output
    }

    // -- Basics --

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run_ok("print(1 + 2 * 3);"), "7\n");
        assert_eq!(run_ok("print((1 + 2) * 3);"), "9\n");
        assert_eq!(run_ok("print(10 % 3);"), "1\n");
        assert_eq!(run_ok("print(-4 / 2);"), "-2\n");
    }

    #[test]
    fn string_concatenation_stringifies_either_side() {
        assert_eq!(run_ok("print(\"n=\" + 2);"), "n=2\n");
        assert_eq!(run_ok("print(2 + \"!\");"), "2!\n");
        assert_eq!(run_ok("print(\"a\" + \"b\");"), "ab\n");
    }

    #[test]
    fn globals_and_locals() {
        assert_eq!(run_ok("var a = 1; a = a + 1; print(a);"), "2\n");
        assert_eq!(run_ok("{ var b = 10; { var c = b * 2; print(c); } }"), "20\n");
    }

    #[test]
    fn undefined_variable_is_catchable() {
        let out = run_ok("try { missing; } catch (e) { print(e.message); }");
        assert_eq!(out, "Undefined variable 'missing'.\n");
    }

    #[test]
    fn control_flow() {
        assert_eq!(run_ok("if (1 < 2) print(\"y\"); else print(\"n\");"), "y\n");
        assert_eq!(run_ok("var s = \"\"; for (var i = 0; i < 3; i += 1) s = s + i; print(s);"), "012\n");
        assert_eq!(run_ok("var n = 0; while (n < 5) { n += 2; } print(n);"), "6\n");
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(run_ok("print(false && missing);"), "false\n");
        assert_eq!(run_ok("print(true || missing);"), "true\n");
        assert_eq!(run_ok("print(null || \"fallback\");"), "fallback\n");
    }

    #[test]
    fn ternary_and_pipe() {
        assert_eq!(run_ok("print(1 < 2 ? \"a\" : \"b\");"), "a\n");
        assert_eq!(run_ok("function double(x) { return x * 2; } print(21 |> double);"), "42\n");
    }

    #[test]
    fn break_and_continue() {
        assert_eq!(
            run_ok("var s = \"\"; for (var i = 0; i < 10; i += 1) { if (i == 3) break; s = s + i; } print(s);"),
            "012\n"
        );
        assert_eq!(
            run_ok("var s = \"\"; for (var i = 0; i < 5; i += 1) { if (i % 2 == 0) continue; s = s + i; } print(s);"),
            "13\n"
        );
    }

    // -- Functions, closures, lambdas --

    #[test]
    fn function_calls_and_returns() {
        assert_eq!(run_ok("function add(a, b) { return a + b; } print(add(2, 3));"), "5\n");
        assert_eq!(run_ok("function f() {} print(f());"), "null\n");
    }

    #[test]
    fn recursion() {
        let source = "function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print(fib(10));";
        assert_eq!(run_ok(source), "55\n");
    }

    #[test]
    fn arity_mismatch_raises() {
        let out = run_ok("function f(a) { return a; } try { f(); } catch (e) { print(typeof e); }");
        assert_eq!(out, "instance\n");
    }

    #[test]
    fn lambda_lax_arity() {
        assert_eq!(run_ok("var f = |a, b| [a, b]; print(f(1));"), "[1, null]\n");
        assert_eq!(run_ok("var f = |a| a; print(f(1, 2, 3));"), "1\n");
        assert_eq!(run_ok("var f = || 7; print(f());"), "7\n");
    }

    #[test]
    fn varargs_packs_surplus_into_list() {
        assert_eq!(run_ok("function f(a, b...) { return b; } print(f(1, 2, 3, 4));"), "[2, 3, 4]\n");
        assert_eq!(run_ok("function f(a, b...) { return b; } print(f(1));"), "[]\n");
    }

    #[test]
    fn closures_capture_and_close_upvalues() {
        let source = "\
            function counter() {\n\
              var n = 0;\n\
              return || { n = n + 1; return n; };\n\
            }\n\
            var c = counter();\n\
            c(); c();\n\
            print(c());\n";
        assert_eq!(run_ok(source), "3\n");
    }

    #[test]
    fn closed_upvalue_keeps_value_at_close() {
        let source = "\
            var fs = [];\n\
            for (var i = 0; i < 3; i += 1) {\n\
              var j = i;\n\
              fs.push(|| j);\n\
            }\n\
            print(fs[0]() + fs[1]() + fs[2]());\n";
        assert_eq!(run_ok(source), "3\n");
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let source = "\
            function pair() {\n\
              var n = 0;\n\
              var inc = || { n = n + 1; return n; };\n\
              var get = || n;\n\
              inc();\n\
              return get();\n\
            }\n\
            print(pair());\n";
        assert_eq!(run_ok(source), "1\n");
    }

    // -- Lists, ranges, indexing --

    #[test]
    fn list_literals_and_indexing() {
        assert_eq!(run_ok("var a = [1, 2, 3]; print(a[0] + a[2]);"), "4\n");
        assert_eq!(run_ok("var a = [1, 2, 3]; a[1] = 9; print(a);"), "[1, 9, 3]\n");
    }

    #[test]
    fn negative_indices_count_from_the_end() {
        assert_eq!(run_ok("var a = [1, 2, 3]; print(a[-1]);"), "3\n");
        assert_eq!(run_ok("print(\"abc\"[-2]);"), "b\n");
    }

    #[test]
    fn out_of_bounds_raises_index_exception() {
        let out = run_ok("var a = [1]; try { a[3]; } catch (e) { print(e.message); }");
        assert_eq!(out, "Index 3 is out of bounds for length 1.\n");
    }

    #[test]
    fn ranges_are_inclusive_both_directions() {
        assert_eq!(run_ok("print(1..5);"), "[1, 2, 3, 4, 5]\n");
        assert_eq!(run_ok("print(3..1);"), "[3, 2, 1]\n");
    }

    #[test]
    fn list_equality_is_elementwise() {
        assert_eq!(run_ok("print([1, 2] == [1, 2]);"), "true\n");
        assert_eq!(run_ok("print([1, 2] == [1, 3]);"), "false\n");
        assert_eq!(run_ok("print([1, [2]] == [1, [2]]);"), "true\n");
    }

    #[test]
    fn plus_appends_to_lists() {
        assert_eq!(run_ok("print([1, 2] + 3);"), "[1, 2, 3]\n");
    }

    #[test]
    fn list_methods() {
        assert_eq!(run_ok("var a = [1, 2, 3]; print(a.map(|x| x * x));"), "[1, 4, 9]\n");
        assert_eq!(run_ok("print([1, 2, 3, 4].filter(|x| x % 2 == 0));"), "[2, 4]\n");
        assert_eq!(run_ok("print([1, 2, 3].reduce(|acc, x| acc + x, 0));"), "6\n");
        assert_eq!(run_ok("print([3, 1, 2].sort());"), "[1, 2, 3]\n");
        assert_eq!(run_ok("print([1, 2, 3].sort(|a, b| b - a));"), "[3, 2, 1]\n");
        assert_eq!(run_ok("print([1, 2].concat([3]));"), "[1, 2, 3]\n");
        assert_eq!(run_ok("var a = [1]; a.push(5); print(a.pop() + a.length());"), "6\n");
        assert_eq!(run_ok("print([1, 2, 3].reverse());"), "[3, 2, 1]\n");
        assert_eq!(run_ok("print([5, 6, 7].indexOf(6));"), "1\n");
        assert_eq!(run_ok("print([1, 2].any(|x| x > 1));"), "true\n");
        assert_eq!(run_ok("print([1, 2].every(|x| x > 1));"), "false\n");
    }

    #[test]
    fn string_methods() {
        assert_eq!(run_ok("print(\"hello\".length());"), "5\n");
        assert_eq!(run_ok("print(\"hello\".substring(1, 3));"), "el\n");
        assert_eq!(run_ok("print(\"ab\".repeat(3));"), "ababab\n");
        assert_eq!(run_ok("print(\"hello\".startsWith(\"he\"));"), "true\n");
        assert_eq!(run_ok("print(\"hello\".indexOf(\"ll\"));"), "2\n");
        assert_eq!(run_ok("print(\"3.5\".parseNumber() * 2);"), "7\n");
        assert_eq!(run_ok("print(\"no\".parseNumber());"), "null\n");
    }

    #[test]
    fn membership_operator() {
        assert_eq!(run_ok("print(2 in [1, 2, 3]);"), "true\n");
        assert_eq!(run_ok("print(\"ell\" in \"hello\");"), "true\n");
        assert_eq!(run_ok("var o = { a: 1 }; print(\"a\" in o);"), "true\n");
        assert_eq!(run_ok("var o = { a: 1 }; print(\"b\" in o);"), "false\n");
    }

    // -- foreach and iterators --

    #[test]
    fn foreach_over_string() {
        assert_eq!(run_ok("foreach (var c in \"ab\") print(c);"), "a\nb\n");
    }

    #[test]
    fn foreach_over_list() {
        assert_eq!(run_ok("var total = 0; foreach (var x in [1, 2, 3]) total += x; print(total);"), "6\n");
    }

    #[test]
    fn custom_iterator_protocol() {
        let source = "\
            var it = Iterator([10, 20]);\n\
            var total = 0;\n\
            while (it.more()) total += it.next();\n\
            print(total);\n";
        assert_eq!(run_ok(source), "30\n");
    }

    // -- Classes --

    #[test]
    fn classes_constructors_and_to_string() {
        let source = "\
            class A {\n\
              constructor(x) { this.x = x; }\n\
              toString() { return \"A(\" + this.x + \")\"; }\n\
            }\n\
            print(A(7));\n";
        assert_eq!(run_ok(source), "A(7)\n");
    }

    #[test]
    fn default_instance_rendering() {
        assert_eq!(run_ok("class A {} print(A());"), "<instance A>\n");
    }

    #[test]
    fn methods_and_fields() {
        let source = "\
            class Point {\n\
              constructor(x, y) { this.x = x; this.y = y; }\n\
              sum() { return this.x + this.y; }\n\
            }\n\
            var p = Point(3, 4);\n\
            print(p.sum());\n\
            p.x = 10;\n\
            print(p.sum());\n";
        assert_eq!(run_ok(source), "7\n14\n");
    }

    #[test]
    fn inheritance_and_super() {
        let source = "\
            class A {\n\
              greet() { return \"A\"; }\n\
            }\n\
            class B : A {\n\
              greet() { return super.greet() + \"B\"; }\n\
            }\n\
            print(B().greet());\n";
        assert_eq!(run_ok(source), "AB\n");
    }

    #[test]
    fn instanceof_walks_the_chain() {
        let source = "\
            class A {}\n\
            class B : A {}\n\
            var b = B();\n\
            print(b instanceof B);\n\
            print(b instanceof A);\n\
            print(b instanceof Object);\n\
            print(A() instanceof B);\n";
        assert_eq!(run_ok(source), "true\ntrue\ntrue\nfalse\n");
    }

    #[test]
    fn object_literals_and_shorthand() {
        assert_eq!(run_ok("var o = { a: 1, b: 2 }; print(o.a + o.b);"), "3\n");
        assert_eq!(run_ok("var a = 5; var o = { a }; print(o.a);"), "5\n");
        assert_eq!(run_ok("var o = { x: 1 }; print(o[\"x\"]);"), "1\n");
    }

    #[test]
    fn trailing_object_body_sets_fields() {
        let source = "\
            class A {}\n\
            var a = A() { x: 1, y: 2 };\n\
            print(a.x + a.y);\n";
        assert_eq!(run_ok(source), "3\n");
    }

    #[test]
    fn object_base_methods() {
        assert_eq!(run_ok("var o = { a: 1, b: 2 }; print(o.keys().length());"), "2\n");
        assert_eq!(run_ok("var o = { a: 1 }; print(o.hasProperty(\"a\"));"), "true\n");
        assert_eq!(run_ok("var o = { a: 1 }; print(o.values());"), "[1]\n");
    }

    #[test]
    fn field_shadows_method_on_invoke() {
        let source = "\
            class A {\n\
              f() { return \"method\"; }\n\
            }\n\
            var a = A();\n\
            a.f = || \"field\";\n\
            print(a.f());\n";
        assert_eq!(run_ok(source), "field\n");
    }

    // -- switch --

    #[test]
    fn switch_expression_patterns() {
        let source = "\
            var n = 5;\n\
            var r = switch (n) { 1, 2 -> \"lo\"; is Number -> \"num\"; else -> \"?\"; };\n\
            print(r);\n";
        assert_eq!(run_ok(source), "num\n");
    }

    #[test]
    fn switch_matches_literals_and_else() {
        let source = "var r = switch (2) { 1, 2 -> \"lo\"; else -> \"hi\"; }; print(r);";
        assert_eq!(run_ok(source), "lo\n");
        let source = "var r = switch (9) { 1, 2 -> \"lo\"; else -> \"hi\"; }; print(r);";
        assert_eq!(run_ok(source), "hi\n");
    }

    #[test]
    fn switch_in_and_predicate_patterns() {
        let source = "var r = switch (3) { in [1, 2] -> \"a\"; |> (|x| x > 2) -> \"b\"; else -> \"c\"; }; print(r);";
        assert_eq!(run_ok(source), "b\n");
    }

    #[test]
    fn switch_negated_pattern() {
        let source = "var r = switch (4) { !in [1, 2] -> \"notin\"; else -> \"in\"; }; print(r);";
        assert_eq!(run_ok(source), "notin\n");
    }

    #[test]
    fn switch_without_match_yields_null() {
        assert_eq!(run_ok("print(switch (9) { 1 -> \"a\"; });"), "null\n");
    }

    #[test]
    fn switch_statement_form() {
        let source = "switch (1) { 1 -> print(\"one\"); else -> print(\"other\"); }";
        assert_eq!(run_ok(source), "one\n");
    }

    // -- Operators --

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(run_ok("print(6 & 3);"), "2\n");
        assert_eq!(run_ok("print(6 | 3);"), "7\n");
        assert_eq!(run_ok("print(6 ^ 3);"), "5\n");
        assert_eq!(run_ok("print(1 << 4);"), "16\n");
        assert_eq!(run_ok("print(-8 >> 1);"), "-4\n");
        assert_eq!(run_ok("print(~0);"), "-1\n");
    }

    #[test]
    fn unsigned_shift_treats_operand_as_unsigned() {
        assert_eq!(run_ok("print(-1 >>> 56);"), "255\n");
    }

    #[test]
    fn fractional_bitwise_operand_raises() {
        let out = run_ok("try { 1.5 & 1; } catch (e) { print(e.message); }");
        assert_eq!(out, "Operands must be integers.\n");
    }

    #[test]
    fn negative_shift_raises() {
        let out = run_ok("try { 1 << -1; } catch (e) { print(e.message); }");
        assert_eq!(out, "Operands must be integers.\n");
    }

    #[test]
    fn compound_assignment_operators() {
        assert_eq!(run_ok("var a = 8; a -= 3; a *= 2; print(a);"), "10\n");
        assert_eq!(run_ok("var a = 8; a >>= 2; print(a);"), "2\n");
        assert_eq!(run_ok("var o = { n: 1 }; o.n += 5; print(o.n);"), "6\n");
        assert_eq!(run_ok("var a = [1, 2]; a[0] += 10; print(a);"), "[11, 2]\n");
    }

    #[test]
    fn typeof_names() {
        assert_eq!(run_ok("print(typeof true);"), "boolean\n");
        assert_eq!(run_ok("print(typeof 1);"), "number\n");
        assert_eq!(run_ok("print(typeof null);"), "null\n");
        assert_eq!(run_ok("print(typeof \"s\");"), "string\n");
        assert_eq!(run_ok("print(typeof []);"), "list\n");
        assert_eq!(run_ok("print(typeof print);"), "function\n");
        assert_eq!(run_ok("class A {} print(typeof A);"), "class\n");
        assert_eq!(run_ok("class A {} print(typeof A());"), "instance\n");
    }

    #[test]
    fn is_operator_matches_type_markers() {
        assert_eq!(run_ok("print(5 is Number);"), "true\n");
        assert_eq!(run_ok("print(\"s\" is String);"), "true\n");
        assert_eq!(run_ok("print([] is List);"), "true\n");
        assert_eq!(run_ok("print(5 is String);"), "false\n");
        assert_eq!(run_ok("print(null is Number);"), "false\n");
    }

    #[test]
    fn is_operator_identity_for_objects() {
        assert_eq!(run_ok("var a = [1]; var b = a; print(a is b);"), "true\n");
        assert_eq!(run_ok("print([1] is [1]);"), "false\n");
        assert_eq!(run_ok("print(1 is 1);"), "true\n");
    }

    // -- Exceptions --

    #[test]
    fn throw_and_catch_builtin_exception() {
        let out = run_ok("try { throw TypeException(\"boom\"); } catch (e) { print(e.message); }");
        assert_eq!(out, "boom\n");
    }

    #[test]
    fn catch_without_binding() {
        assert_eq!(run_ok("try { throw Exception(\"x\"); } catch { print(\"caught\"); }"), "caught\n");
    }

    #[test]
    fn finally_runs_after_catch() {
        let out = run_ok(
            "try { throw Exception(\"x\"); } catch { print(\"c\"); } finally { print(\"f\"); }",
        );
        assert_eq!(out, "c\nf\n");
    }

    #[test]
    fn user_exception_subclass() {
        let source = "\
            class MyError : Exception {}\n\
            try { throw MyError(\"custom\"); } catch (e) {\n\
              print(e instanceof MyError);\n\
              print(e instanceof Exception);\n\
              print(e.message);\n\
            }\n";
        assert_eq!(run_ok(source), "true\ntrue\ncustom\n");
    }

    #[test]
    fn throwing_a_non_exception_raises_type_exception() {
        let out = run_ok("class A {} try { throw A(); } catch (e) { print(e.message); }");
        assert_eq!(out, "Throwee must inherit from 'Exception'.\n");
    }

    #[test]
    fn exception_carries_stack_trace_list() {
        let out = run_ok(
            "try { throw Exception(\"t\"); } catch (e) { print(typeof e.stackTrace); print(e.stackTrace.length() > 0); }",
        );
        assert_eq!(out, "list\ntrue\n");
    }

    #[test]
    fn uncaught_exception_is_a_runtime_error() {
        let (result, _) = run("throw Exception(\"bye\");");
        assert_eq!(result, InterpretResult::RuntimeErr);
    }

    #[test]
    fn exception_unwinds_nested_calls_to_outer_try() {
        let source = "\
            function inner() { throw Exception(\"deep\"); }\n\
            function outer() { inner(); }\n\
            try { outer(); } catch (e) { print(e.message); }\n";
        assert_eq!(run_ok(source), "deep\n");
    }

    #[test]
    fn execution_resumes_after_catch() {
        let source = "\
            try { throw Exception(\"a\"); } catch { }\n\
            print(\"alive\");\n";
        assert_eq!(run_ok(source), "alive\n");
    }

    #[test]
    fn stack_overflow_is_catchable() {
        let source = "\
            function f() { return f(); }\n\
            try { f(); } catch (e) { print(typeof e); }\n";
        assert_eq!(run_ok(source), "instance\n");
    }

    #[test]
    fn exception_inside_callback_propagates() {
        let source = "\
            try { [1].map(|x| { throw Exception(\"cb\"); }); }\n\
            catch (e) { print(e.message); }\n";
        assert_eq!(run_ok(source), "cb\n");
    }

    #[test]
    fn to_string_must_return_a_string() {
        let source = "\
            class A { toString() { return 1; } }\n\
            try { print(A()); } catch (e) { print(typeof e); }\n";
        assert_eq!(run_ok(source), "instance\n");
    }

    // -- typeof/tostring helpers --

    #[test]
    fn repr_quotes_strings_and_to_string_does_not() {
        assert_eq!(run_ok("print(repr(\"hi\"));"), "\"hi\"\n");
        assert_eq!(run_ok("print(toString(42));"), "42\n");
        assert_eq!(run_ok("print(repr([1, \"a\"]));"), "[1, \"a\"]\n");
    }

    #[test]
    fn print_joins_arguments_with_spaces() {
        assert_eq!(run_ok("print(1, \"and\", 2);"), "1 and 2\n");
    }

    #[test]
    fn sqrt_native() {
        assert_eq!(run_ok("print(sqrt(16));"), "4\n");
    }

    #[test]
    fn nan_and_infinity_globals() {
        assert_eq!(run_ok("print(NaN == NaN);"), "false\n");
        assert_eq!(run_ok("print(Infinity > 1e308);"), "true\n");
    }

    #[test]
    fn this_module_is_main() {
        assert_eq!(run_ok("print(THIS_MODULE);"), "$main$\n");
    }

    // -- GC behavior --

    #[test]
    fn collection_preserves_reachable_data() {
        // Builds enough garbage to cross the first GC threshold many times.
        let source = "\
            var keep = [];\n\
            for (var i = 0; i < 200; i += 1) {\n\
              keep.push(\"item\" + i);\n\
              var junk = \"\";\n\
              for (var j = 0; j < 50; j += 1) junk = junk + \"xxxxxxxxxxxxxxxx\";\n\
            }\n\
            print(keep.length());\n\
            print(keep[0]);\n\
            print(keep[199]);\n";
        assert_eq!(run_ok(source), "200\nitem0\nitem199\n");
    }

    #[test]
    fn interning_survives_collection() {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(Box::new(buf.clone()));
        let a = vm.heap.intern("shared");
        vm.heap.temp_roots.push(Value::Obj(a.obj));
        vm.collect_garbage();
        let b = vm.heap.intern("shared");
        assert_eq!(a.obj, b.obj);
    }

    #[test]
    fn deterministic_evaluation() {
        let source = "print(2 * 3 + 4 * 5);";
        assert_eq!(run_ok(source), run_ok(source));
    }
}
