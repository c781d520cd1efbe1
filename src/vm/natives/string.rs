use super::{define_native, receiver, NativeError, NativeResult};
use crate::vm::object::Obj;
use crate::vm::value::{is_integer, Value};
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// String method table
// ---------------------------------------------------------------------------

pub(crate) fn register(vm: &mut Vm) {
    let heap = &mut vm.heap;
    let table = &mut vm.string_methods;
    define_native(heap, table, "length", 0, false, native_length);
    define_native(heap, table, "concat", 1, false, native_concat);
    define_native(heap, table, "endsWith", 1, false, native_ends_with);
    define_native(heap, table, "indexOf", 1, false, native_index_of);
    define_native(heap, table, "lastIndexOf", 1, false, native_last_index_of);
    define_native(heap, table, "iterator", 0, false, native_iterator);
    define_native(heap, table, "parseNumber", 0, false, native_parse_number);
    define_native(heap, table, "repeat", 1, false, native_repeat);
    define_native(heap, table, "startsWith", 1, false, native_starts_with);
    define_native(heap, table, "substring", 2, false, native_substring);
}

fn receiver_text(vm: &Vm, bound: Option<Value>) -> String {
    vm.heap.string(receiver(bound).as_obj()).chars.clone()
}

fn string_arg(vm: &mut Vm, value: Value, method: &str) -> Result<String, NativeError> {
    match value {
        Value::Obj(r) => {
            if let Obj::String(s) = vm.heap.get(r) {
                return Ok(s.chars.clone());
            }
            Err(string_arg_error(vm, method))
        }
        _ => Err(string_arg_error(vm, method)),
    }
}

fn string_arg_error(vm: &mut Vm, method: &str) -> NativeError {
    vm.native_error(
        "TypeException",
        format!("Argument to '{}' must be a string.", method),
    )
}

fn native_length(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    Ok(Value::Number(text.len() as f64))
}

fn native_concat(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    let other = string_arg(vm, args[0], "concat")?;
    let id = vm.take_string(format!("{}{}", text, other));
    Ok(Value::Obj(id.obj))
}

fn native_ends_with(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    let suffix = string_arg(vm, args[0], "endsWith")?;
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn native_starts_with(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    let prefix = string_arg(vm, args[0], "startsWith")?;
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn native_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    let needle = string_arg(vm, args[0], "indexOf")?;
    match text.find(&needle) {
        Some(index) => Ok(Value::Number(index as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn native_last_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    let needle = string_arg(vm, args[0], "lastIndexOf")?;
    match text.rfind(&needle) {
        Some(index) => Ok(Value::Number(index as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn native_iterator(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    Ok(vm.make_iterator(receiver(bound)))
}

fn native_parse_number(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    match text.trim().parse::<f64>() {
        Ok(number) => Ok(Value::Number(number)),
        Err(_) => Ok(Value::Null),
    }
}

fn native_repeat(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    if !args[0].is_number() || !is_integer(args[0].as_number()) || args[0].as_number() < 0.0 {
        return Err(vm.native_error(
            "TypeException",
            "Argument to 'repeat' must be a non-negative integer.".to_string(),
        ));
    }
    let count = args[0].as_number() as usize;
    let id = vm.take_string(text.repeat(count));
    Ok(Value::Obj(id.obj))
}

fn native_substring(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let text = receiver_text(vm, bound);
    for &arg in &args[..2] {
        if !arg.is_number() || !is_integer(arg.as_number()) {
            return Err(vm.native_error(
                "TypeException",
                "Arguments to 'substring' must be integers.".to_string(),
            ));
        }
    }
    let start = args[0].as_number() as i64;
    let end = args[1].as_number() as i64;
    if start < 0 || end < start || end > text.len() as i64 {
        return Err(vm.native_error(
            "IndexException",
            format!(
                "Substring range {}..{} is out of bounds for length {}.",
                start,
                end,
                text.len()
            ),
        ));
    }
    let slice =
        String::from_utf8_lossy(&text.as_bytes()[start as usize..end as usize]).into_owned();
    let id = vm.take_string(slice);
    Ok(Value::Obj(id.obj))
}
