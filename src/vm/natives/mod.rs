pub mod exceptions;
pub mod globals;
pub mod iterator;
pub mod list;
pub mod object;
pub mod string;

use super::heap::Heap;
use super::object::{NativeObj, Obj};
use super::table::Table;
use super::value::{ObjRef, Value};
use super::Vm;

// ---------------------------------------------------------------------------
// Native calling protocol
// ---------------------------------------------------------------------------

/// How a native signals failure back to the VM.
#[derive(Debug)]
pub enum NativeError {
    /// Throw this exception instance through the unwinder.
    Exception(Value),
    /// A nested VM drive already dispatched an exception to a catch
    /// handler; the interpreter should simply resume.
    Unwound,
    /// Uncaught failure; abort with a runtime error.
    Fatal,
}

pub type NativeResult = Result<Value, NativeError>;

/// A built-in callable. `bound` carries the receiver for method-style
/// invocations; argument values are copied out of the stack, which still
/// roots them for the duration of the call.
pub type NativeFn = fn(&mut Vm, Option<Value>, &[Value]) -> NativeResult;

/// Register a native function into a method table.
pub(crate) fn define_native(
    heap: &mut Heap,
    table: &mut Table,
    name: &str,
    arity: usize,
    varargs: bool,
    function: NativeFn,
) {
    let id = heap.intern(name);
    let native = heap.alloc(Obj::Native(NativeObj {
        function,
        arity,
        varargs,
        bound: None,
    }));
    table.set(id, Value::Obj(native));
}

/// Register a native method on a class.
pub(crate) fn define_class_native(
    heap: &mut Heap,
    class: ObjRef,
    name: &str,
    arity: usize,
    varargs: bool,
    function: NativeFn,
) {
    let id = heap.intern(name);
    let native = heap.alloc(Obj::Native(NativeObj {
        function,
        arity,
        varargs,
        bound: None,
    }));
    heap.class_mut(class).methods.set(id, Value::Obj(native));
}

/// Unwrap the bound receiver every method-style native is dispatched with.
pub(crate) fn receiver(bound: Option<Value>) -> Value {
    match bound {
        Some(value) => value,
        None => unreachable!("native method invoked without a receiver"),
    }
}
