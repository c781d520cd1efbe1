use super::{define_class_native, receiver, NativeResult};
use crate::vm::heap::Heap;
use crate::vm::object::{ClassObj, Obj};
use crate::vm::table::Table;
use crate::vm::value::{ObjRef, StrId, Value};
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// Exception hierarchy
// ---------------------------------------------------------------------------

const SUBCLASSES: [&str; 6] = [
    "TypeException",
    "ArityException",
    "PropertyException",
    "IndexException",
    "UndefinedVariableException",
    "StackOverflowException",
];

/// Create `Exception` and its built-in subclasses. The same class objects
/// are bound into every module's globals, so an exception caught in one
/// module is `instanceof`-compatible everywhere.
pub(crate) fn register(vm: &mut Vm) {
    let exception = subclass(&mut vm.heap, vm.object_class, "Exception");
    define_class_native(
        &mut vm.heap,
        exception,
        "constructor",
        0,
        true,
        native_constructor,
    );
    vm.exception_class = exception;
    vm.exception_classes.push(exception);
    for name in SUBCLASSES {
        let class = subclass(&mut vm.heap, exception, name);
        vm.exception_classes.push(class);
    }
}

/// `Exception(message)` stores its optional message field.
fn native_constructor(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let this = receiver(bound);
    let message = args.first().copied().unwrap_or(Value::Null);
    let message_name = vm.names.message;
    vm.heap
        .instance_mut(this.as_obj())
        .fields
        .set(message_name, message);
    Ok(this)
}

fn subclass(heap: &mut Heap, parent: ObjRef, name: &str) -> ObjRef {
    let id = heap.intern(name);
    let class = heap.alloc(Obj::Class(ClassObj {
        name: id,
        methods: Table::new(),
        superclass: None,
    }));
    let methods: Vec<(StrId, Value)> = heap.class(parent).methods.iter().collect();
    let class_obj = heap.class_mut(class);
    for (key, value) in methods {
        class_obj.methods.set(key, value);
    }
    class_obj.superclass = Some(parent);
    class
}
