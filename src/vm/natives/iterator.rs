use super::{define_class_native, receiver, NativeError, NativeResult};
use crate::vm::object::Obj;
use crate::vm::value::{is_integer, Value};
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// Iterator class
// ---------------------------------------------------------------------------

pub(crate) fn register(vm: &mut Vm) {
    let class = vm.iterator_class;
    define_class_native(
        &mut vm.heap,
        class,
        "constructor",
        1,
        false,
        native_constructor,
    );
    define_class_native(&mut vm.heap, class, "iterator", 0, false, native_iterator);
    define_class_native(&mut vm.heap, class, "next", 0, false, native_next);
    define_class_native(&mut vm.heap, class, "more", 0, false, native_more);
}

fn native_constructor(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let this = receiver(bound);
    let instance = this.as_obj();
    let index_name = vm.names.index;
    let data_name = vm.names.data;
    let fields = &mut vm.heap.instance_mut(instance).fields;
    fields.set(index_name, Value::Number(0.0));
    fields.set(data_name, args[0]);
    Ok(this)
}

fn native_iterator(_vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    Ok(receiver(bound))
}

/// Read and validate the `data` and `index` fields shared by next/more.
fn iterator_state(vm: &mut Vm, this: Value) -> Result<(Value, i64), NativeError> {
    let instance = this.as_obj();
    let data = match vm.heap.instance(instance).fields.get(vm.names.data) {
        Some(data) => data,
        None => {
            return Err(vm.native_error(
                "PropertyException",
                "Iterator object must have a 'data' field.".to_string(),
            ));
        }
    };
    let index = match vm.heap.instance(instance).fields.get(vm.names.index) {
        Some(index) => index,
        None => {
            return Err(vm.native_error(
                "PropertyException",
                "Iterator object must have an 'index' field.".to_string(),
            ));
        }
    };
    if !index.is_number() {
        return Err(vm.native_error(
            "TypeException",
            "Iterator object's 'index' must be a number.".to_string(),
        ));
    }
    let number = index.as_number();
    if !is_integer(number) {
        return Err(vm.native_error(
            "TypeException",
            "Iterator object's 'index' must be an integer.".to_string(),
        ));
    }
    Ok((data, number as i64))
}

fn resolve(index: i64, length: usize) -> i64 {
    if index < 0 {
        length as i64 + index
    } else {
        index
    }
}

/// Element produced by one step, before any allocation happens.
enum Step {
    Value(Value),
    Char(Option<String>),
}

fn native_next(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let this = receiver(bound);
    let (data, signed) = iterator_state(vm, this)?;

    let stepped = match data {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(list) => {
                let index = resolve(signed, list.items.len());
                let value = if index < 0 || index >= list.items.len() as i64 {
                    Value::Null
                } else {
                    list.items[index as usize]
                };
                Some((index, Step::Value(value)))
            }
            Obj::String(string) => {
                let length = string.chars.len();
                let index = resolve(signed, length);
                let one = if index < 0 || index >= length as i64 {
                    None
                } else {
                    let byte = index as usize;
                    Some(
                        String::from_utf8_lossy(&string.chars.as_bytes()[byte..byte + 1])
                            .into_owned(),
                    )
                };
                Some((index, Step::Char(one)))
            }
            _ => None,
        },
        _ => None,
    };
    let (resolved, step) = match stepped {
        Some(found) => found,
        None => {
            return Err(vm.native_error(
                "TypeException",
                "Iterator object's 'data' must be a string or a list.".to_string(),
            ));
        }
    };
    let value = match step {
        Step::Value(value) => value,
        Step::Char(Some(one)) => {
            let id = vm.take_string(one);
            Value::Obj(id.obj)
        }
        Step::Char(None) => Value::Null,
    };

    let index_name = vm.names.index;
    vm.heap
        .instance_mut(this.as_obj())
        .fields
        .set(index_name, Value::Number((resolved + 1) as f64));
    Ok(value)
}

fn native_more(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let this = receiver(bound);
    let (data, signed) = iterator_state(vm, this)?;

    let length = match data {
        Value::Obj(r) => match vm.heap.get(r) {
            Obj::List(list) => list.items.len(),
            Obj::String(string) => string.chars.len(),
            _ => {
                return Err(vm.native_error(
                    "TypeException",
                    "Iterator object's 'data' must be a string or a list.".to_string(),
                ));
            }
        },
        _ => {
            return Err(vm.native_error(
                "TypeException",
                "Iterator object's 'data' must be a string or a list.".to_string(),
            ));
        }
    };
    let index = resolve(signed, length);
    Ok(Value::Bool((0..length as i64).contains(&index)))
}
