use super::{define_class_native, receiver, NativeResult};
use crate::vm::object::{ListObj, Obj};
use crate::vm::value::Value;
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// Object base-class methods (inherited by every instance)
// ---------------------------------------------------------------------------

pub(crate) fn register(vm: &mut Vm) {
    let class = vm.object_class;
    define_class_native(&mut vm.heap, class, "keys", 0, false, native_keys);
    define_class_native(&mut vm.heap, class, "values", 0, false, native_values);
    define_class_native(&mut vm.heap, class, "entries", 0, false, native_entries);
    define_class_native(
        &mut vm.heap,
        class,
        "hasProperty",
        1,
        false,
        native_has_property,
    );
    define_class_native(&mut vm.heap, class, "toString", 0, false, native_to_string);
}

fn native_keys(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let instance = receiver(bound).as_obj();
    let items: Vec<Value> = vm
        .heap
        .instance(instance)
        .fields
        .iter()
        .map(|(key, _)| Value::Obj(key.obj))
        .collect();
    let list = vm.alloc(Obj::List(ListObj { items }));
    Ok(Value::Obj(list))
}

fn native_values(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let instance = receiver(bound).as_obj();
    let items: Vec<Value> = vm
        .heap
        .instance(instance)
        .fields
        .iter()
        .map(|(_, value)| value)
        .collect();
    let list = vm.alloc(Obj::List(ListObj { items }));
    Ok(Value::Obj(list))
}

fn native_entries(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let instance = receiver(bound).as_obj();
    let pairs: Vec<(Value, Value)> = vm
        .heap
        .instance(instance)
        .fields
        .iter()
        .map(|(key, value)| (Value::Obj(key.obj), value))
        .collect();

    let mark = vm.heap.temp_roots.len();
    for (key, value) in pairs {
        let entry = vm.alloc(Obj::List(ListObj {
            items: vec![key, value],
        }));
        vm.heap.temp_roots.push(Value::Obj(entry));
    }
    let items = vm.heap.temp_roots[mark..].to_vec();
    let list = vm.alloc(Obj::List(ListObj { items }));
    vm.heap.temp_roots.truncate(mark);
    Ok(Value::Obj(list))
}

fn native_has_property(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let instance = receiver(bound).as_obj();
    if !matches!(args[0], Value::Obj(r) if matches!(vm.heap.get(r), Obj::String(_))) {
        return Err(vm.native_error(
            "TypeException",
            "Property name must be a string.".to_string(),
        ));
    }
    let key = vm.heap.str_id(args[0]);
    let has = vm.heap.instance(instance).fields.contains(key);
    Ok(Value::Bool(has))
}

/// Default rendering for instances whose class chain never overrides
/// `toString`.
fn native_to_string(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let instance = receiver(bound).as_obj();
    let class = vm.heap.instance(instance).class;
    let name = vm.heap.class(class).name;
    let text = format!("<instance {}>", vm.heap.string(name.obj).chars);
    let id = vm.take_string(text);
    Ok(Value::Obj(id.obj))
}
