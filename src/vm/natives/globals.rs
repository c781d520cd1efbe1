use std::io::BufRead;
use std::io::Write;

use super::{NativeFn, NativeResult};
use crate::vm::object::{NativeObj, Obj};
use crate::vm::value::Value;
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// Global native functions
// ---------------------------------------------------------------------------

pub(crate) fn register(vm: &mut Vm) {
    define_global(vm, "print", 1, true, native_print);
    define_global(vm, "input", 0, false, native_input);
    define_global(vm, "clock", 0, false, native_clock);
    define_global(vm, "toString", 1, false, native_to_string);
    define_global(vm, "repr", 1, false, native_repr);
    define_global(vm, "sqrt", 1, false, native_sqrt);
}

fn define_global(vm: &mut Vm, name: &str, arity: usize, varargs: bool, function: NativeFn) {
    let id = vm.heap.intern(name);
    let native = vm.heap.alloc(Obj::Native(NativeObj {
        function,
        arity,
        varargs,
        bound: None,
    }));
    vm.global_values.push((id, Value::Obj(native)));
}

fn native_print(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> NativeResult {
    let mut rendered = Vec::with_capacity(args.len());
    for &arg in args {
        rendered.push(vm.value_to_string(arg)?);
    }
    let _ = writeln!(vm.out, "{}", rendered.join(" "));
    Ok(Value::Null)
}

fn native_input(vm: &mut Vm, _bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => Ok(Value::Null),
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            let id = vm.take_string(line);
            Ok(Value::Obj(id.obj))
        }
    }
}

fn native_clock(vm: &mut Vm, _bound: Option<Value>, _args: &[Value]) -> NativeResult {
    Ok(Value::Number(vm.start.elapsed().as_secs_f64()))
}

fn native_to_string(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = vm.value_to_string(args[0])?;
    let id = vm.take_string(text);
    Ok(Value::Obj(id.obj))
}

fn native_repr(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = vm.value_to_repr(args[0]);
    let id = vm.take_string(text);
    Ok(Value::Obj(id.obj))
}

fn native_sqrt(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> NativeResult {
    if !args[0].is_number() {
        return Err(vm.native_error(
            "TypeException",
            "Expected number as first argument to sqrt.".to_string(),
        ));
    }
    Ok(Value::Number(args[0].as_number().sqrt()))
}
