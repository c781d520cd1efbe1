use std::rc::Rc;

use super::chunk::Chunk;
use super::natives::NativeFn;
use super::table::Table;
use super::value::{ModuleId, ObjRef, StrId, Value};

// ---------------------------------------------------------------------------
// Heap objects
// ---------------------------------------------------------------------------

/// Immutable interned byte string with its cached FNV-1a hash.
#[derive(Debug)]
pub struct StrObj {
    pub chars: String,
    pub hash: u32,
}

/// Growable ordered sequence of values.
#[derive(Debug, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

/// A compiled function: its chunk plus call-shape metadata. The chunk is
/// frozen at compile time and shared by reference from the run loop.
#[derive(Debug)]
pub struct FunctionObj {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
    pub name: Option<StrId>,
    pub is_lambda: bool,
    pub varargs: bool,
}

/// A function closed over its captured upvalues, owned by a module.
#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
    pub module: ModuleId,
}

/// An upvalue is open (pointing at a live stack slot) until the slot leaves
/// the stack, at which point it owns the value.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

/// Open upvalues form an intrusive list ordered by stack slot, deepest
/// (highest slot) first, threaded through `next`.
#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
    pub next: Option<ObjRef>,
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: StrId,
    pub methods: Table,
    pub superclass: Option<ObjRef>,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

/// A closure pre-bound to its receiver; calling it rewrites the callee slot
/// with the receiver.
#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Built-in callable. `bound` is the per-native receiver slot the VM fills
/// immediately before dispatching a method-style invocation; it is only
/// meaningful during that call.
#[derive(Debug)]
pub struct NativeObj {
    pub function: NativeFn,
    pub arity: usize,
    pub varargs: bool,
    pub bound: Option<Value>,
}

#[derive(Debug)]
pub enum Obj {
    String(StrObj),
    List(ListObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Native(NativeObj),
}

impl Obj {
    /// Approximate retained size in bytes, used for GC trigger accounting.
    pub fn size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.len(),
            Obj::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>(),
            Obj::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(c) => c.methods.byte_size(),
            Obj::Instance(i) => i.fields.byte_size(),
            Obj::BoundMethod(_) => 0,
            Obj::Native(_) => 0,
        }
    }

    /// Every value this object keeps alive, for the GC trace phase.
    pub fn children(&self) -> Vec<Value> {
        match self {
            Obj::String(_) => Vec::new(),
            Obj::List(l) => l.items.clone(),
            Obj::Function(f) => {
                let mut out: Vec<Value> = f.chunk.constants.clone();
                if let Some(name) = f.name {
                    out.push(Value::Obj(name.obj));
                }
                out
            }
            Obj::Closure(c) => {
                let mut out = vec![Value::Obj(c.function)];
                out.extend(c.upvalues.iter().map(|&r| Value::Obj(r)));
                out
            }
            Obj::Upvalue(u) => {
                let mut out = Vec::new();
                if let UpvalueState::Closed(v) = u.state {
                    out.push(v);
                }
                if let Some(next) = u.next {
                    out.push(Value::Obj(next));
                }
                out
            }
            Obj::Class(c) => {
                let mut out = vec![Value::Obj(c.name.obj)];
                if let Some(superclass) = c.superclass {
                    out.push(Value::Obj(superclass));
                }
                c.methods.collect_refs(&mut out);
                out
            }
            Obj::Instance(i) => {
                let mut out = vec![Value::Obj(i.class)];
                i.fields.collect_refs(&mut out);
                out
            }
            Obj::BoundMethod(b) => vec![b.receiver, Value::Obj(b.method)],
            Obj::Native(n) => match n.bound {
                Some(v) => vec![v],
                None => Vec::new(),
            },
        }
    }
}
