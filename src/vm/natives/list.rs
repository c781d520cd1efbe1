use std::cmp::Ordering;

use super::{define_native, receiver, NativeError, NativeResult};
use crate::vm::object::{ListObj, Obj};
use crate::vm::value::{is_integer, ObjRef, Value};
use crate::vm::Vm;

// ---------------------------------------------------------------------------
// List method table
// ---------------------------------------------------------------------------

pub(crate) fn register(vm: &mut Vm) {
    let heap = &mut vm.heap;
    let table = &mut vm.list_methods;
    define_native(heap, table, "length", 0, false, native_length);
    define_native(heap, table, "push", 1, false, native_push);
    define_native(heap, table, "pop", 0, false, native_pop);
    define_native(heap, table, "concat", 1, false, native_concat);
    define_native(heap, table, "extend", 1, false, native_extend);
    define_native(heap, table, "clear", 0, false, native_clear);
    define_native(heap, table, "filter", 1, false, native_filter);
    define_native(heap, table, "fill", 1, false, native_fill);
    define_native(heap, table, "forEach", 1, false, native_for_each);
    define_native(heap, table, "indexOf", 1, false, native_index_of);
    define_native(heap, table, "lastIndexOf", 1, false, native_last_index_of);
    define_native(heap, table, "iterator", 0, false, native_iterator);
    define_native(heap, table, "map", 1, false, native_map);
    define_native(heap, table, "ofLength", 1, false, native_of_length);
    define_native(heap, table, "reduce", 2, false, native_reduce);
    define_native(heap, table, "reverse", 0, false, native_reverse);
    define_native(heap, table, "sort", 0, true, native_sort);
    define_native(heap, table, "any", 1, false, native_any);
    define_native(heap, table, "every", 1, false, native_every);
}

fn list_ref(bound: Option<Value>) -> ObjRef {
    receiver(bound).as_obj()
}

fn expect_list(vm: &mut Vm, value: Value, method: &str) -> Result<ObjRef, NativeError> {
    match value {
        Value::Obj(r) if matches!(vm.heap.get(r), Obj::List(_)) => Ok(r),
        _ => Err(vm.native_error(
            "TypeException",
            format!("Argument to '{}' must be a list.", method),
        )),
    }
}

fn native_length(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    Ok(Value::Number(vm.heap.list(list).items.len() as f64))
}

fn native_push(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    vm.heap.list_mut(list).items.push(args[0]);
    Ok(Value::Null)
}

fn native_pop(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    match vm.heap.list_mut(list).items.pop() {
        Some(value) => Ok(value),
        None => Err(vm.native_error(
            "IndexException",
            "Cannot pop from an empty list.".to_string(),
        )),
    }
}

fn native_concat(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let other = expect_list(vm, args[0], "concat")?;
    let mut items = vm.heap.list(list).items.clone();
    items.extend(vm.heap.list(other).items.iter().copied());
    let result = vm.alloc(Obj::List(ListObj { items }));
    Ok(Value::Obj(result))
}

fn native_extend(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let other = expect_list(vm, args[0], "extend")?;
    let added = vm.heap.list(other).items.clone();
    vm.heap.list_mut(list).items.extend(added);
    Ok(Value::Null)
}

fn native_clear(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    vm.heap.list_mut(list).items.clear();
    Ok(Value::Null)
}

fn native_fill(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    for slot in vm.heap.list_mut(list).items.iter_mut() {
        *slot = args[0];
    }
    Ok(Value::Null)
}

fn native_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    for (index, &item) in items.iter().enumerate() {
        if vm.values_equal(item, args[0]) {
            return Ok(Value::Number(index as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn native_last_index_of(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    for (index, &item) in items.iter().enumerate().rev() {
        if vm.values_equal(item, args[0]) {
            return Ok(Value::Number(index as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn native_iterator(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    Ok(vm.make_iterator(receiver(bound)))
}

fn native_map(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    let mark = vm.heap.temp_roots.len();
    for item in items {
        let mapped = match vm.call_from_native(args[0], &[item]) {
            Ok(value) => value,
            Err(e) => {
                vm.heap.temp_roots.truncate(mark);
                return Err(e);
            }
        };
        vm.heap.temp_roots.push(mapped);
    }
    let mapped_items = vm.heap.temp_roots[mark..].to_vec();
    let result = vm.alloc(Obj::List(ListObj {
        items: mapped_items,
    }));
    vm.heap.temp_roots.truncate(mark);
    Ok(Value::Obj(result))
}

fn native_filter(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    let mut kept = Vec::new();
    for item in items {
        let verdict = vm.call_from_native(args[0], &[item])?;
        if !verdict.is_falsey() {
            kept.push(item);
        }
    }
    // Every kept value is still reachable through the receiver.
    let result = vm.alloc(Obj::List(ListObj { items: kept }));
    Ok(Value::Obj(result))
}

fn native_for_each(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    for item in items {
        vm.call_from_native(args[0], &[item])?;
    }
    Ok(Value::Null)
}

fn native_reduce(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    let mut accumulator = args[1];
    for item in items {
        accumulator = vm.call_from_native(args[0], &[accumulator, item])?;
    }
    Ok(accumulator)
}

fn native_any(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    for item in items {
        let verdict = vm.call_from_native(args[0], &[item])?;
        if !verdict.is_falsey() {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn native_every(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let items = vm.heap.list(list).items.clone();
    for item in items {
        let verdict = vm.call_from_native(args[0], &[item])?;
        if verdict.is_falsey() {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn native_of_length(vm: &mut Vm, _bound: Option<Value>, args: &[Value]) -> NativeResult {
    if !args[0].is_number() || !is_integer(args[0].as_number()) || args[0].as_number() < 0.0 {
        return Err(vm.native_error(
            "TypeException",
            "Argument to 'ofLength' must be a non-negative integer.".to_string(),
        ));
    }
    let length = args[0].as_number() as usize;
    let result = vm.alloc(Obj::List(ListObj {
        items: vec![Value::Null; length],
    }));
    Ok(Value::Obj(result))
}

fn native_reverse(vm: &mut Vm, bound: Option<Value>, _args: &[Value]) -> NativeResult {
    let list = list_ref(bound);
    let mut items = vm.heap.list(list).items.clone();
    items.reverse();
    let result = vm.alloc(Obj::List(ListObj { items }));
    Ok(Value::Obj(result))
}

/// Sort in place. With no comparator the list must be all numbers or all
/// strings; a user comparator returns a number whose sign orders the pair.
fn native_sort(vm: &mut Vm, bound: Option<Value>, args: &[Value]) -> NativeResult {
    let this = receiver(bound);
    let list = this.as_obj();
    let mut items = vm.heap.list(list).items.clone();

    match args.first() {
        Some(&comparator) => {
            let mut failure: Option<NativeError> = None;
            items.sort_by(|&a, &b| {
                if failure.is_some() {
                    return Ordering::Equal;
                }
                match vm.call_from_native(comparator, &[a, b]) {
                    Ok(Value::Number(n)) => {
                        if n < 0.0 {
                            Ordering::Less
                        } else if n > 0.0 {
                            Ordering::Greater
                        } else {
                            Ordering::Equal
                        }
                    }
                    Ok(_) => {
                        failure = Some(vm.native_error(
                            "TypeException",
                            "Comparator must return a number.".to_string(),
                        ));
                        Ordering::Equal
                    }
                    Err(e) => {
                        failure = Some(e);
                        Ordering::Equal
                    }
                }
            });
            if let Some(error) = failure {
                return Err(error);
            }
        }
        None => {
            let all_numbers = items.iter().all(|item| item.is_number());
            let all_strings = items
                .iter()
                .all(|&item| matches!(item, Value::Obj(r) if matches!(vm.heap.get(r), Obj::String(_))));
            if all_numbers {
                items.sort_by(|a, b| {
                    a.as_number()
                        .partial_cmp(&b.as_number())
                        .unwrap_or(Ordering::Equal)
                });
            } else if all_strings {
                items.sort_by(|&a, &b| {
                    let sa = &vm.heap.string(a.as_obj()).chars;
                    let sb = &vm.heap.string(b.as_obj()).chars;
                    sa.cmp(sb)
                });
            } else {
                return Err(vm.native_error(
                    "TypeException",
                    "Can only sort lists of numbers or lists of strings.".to_string(),
                ));
            }
        }
    }

    vm.heap.list_mut(list).items = items;
    Ok(this)
}
