use log::debug;

use super::object::{Obj, StrObj};
use super::table::{hash_bytes, Table};
use super::value::{ObjRef, StrId, Value};

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Object arena and mark-and-sweep collector.
///
/// Objects live in indexed slots; an `ObjRef` is a slot index, so handle
/// equality is object identity. Freed slots are recycled through a free
/// list. The collector itself never decides when to run; the VM checks
/// `should_collect` at allocation boundaries and supplies the roots, because
/// only the VM can see them all.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    /// Cleared while structures not yet reachable from roots are being
    /// built (VM bring-up, compilation, module wiring).
    pub should_gc: bool,
    gray: Vec<ObjRef>,
    /// Weak interning pool: keys whose objects die are removed after sweep.
    strings: Table,
    /// Explicitly pinned values, for natives holding objects the stack does
    /// not reference yet.
    pub temp_roots: Vec<Value>,
}

struct Slot {
    obj: Obj,
    marked: bool,
    size: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::with_capacity(256),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            should_gc: true,
            gray: Vec::new(),
            strings: Table::new(),
            temp_roots: Vec::new(),
        }
    }

    // -- Allocation --

    /// Link a new object into the arena. Collection decisions are made by
    /// the caller (see `Vm::alloc`).
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.size();
        self.bytes_allocated += size;
        let slot = Slot {
            obj,
            marked: false,
            size,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn should_collect(&self) -> bool {
        self.should_gc && self.bytes_allocated > self.next_gc
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // -- Accessors --

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.0 as usize] {
            Some(slot) => &slot.obj,
            None => unreachable!("dangling object reference"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.0 as usize] {
            Some(slot) => &mut slot.obj,
            None => unreachable!("dangling object reference"),
        }
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    // -- String interning --

    /// Intern `text`, returning the canonical handle for its byte sequence.
    pub fn intern(&mut self, text: &str) -> StrId {
        let hash = hash_bytes(text.as_bytes());
        if let Some(existing) = self.find_interned(text, hash) {
            return existing;
        }
        let obj = self.alloc(Obj::String(StrObj {
            chars: text.to_string(),
            hash,
        }));
        let id = StrId { obj, hash };
        self.strings.set(id, Value::Null);
        id
    }

    /// Intern an owned string, avoiding the copy when it is new.
    pub fn take_string(&mut self, text: String) -> StrId {
        let hash = hash_bytes(text.as_bytes());
        if let Some(existing) = self.find_interned(&text, hash) {
            return existing;
        }
        let obj = self.alloc(Obj::String(StrObj { chars: text, hash }));
        let id = StrId { obj, hash };
        self.strings.set(id, Value::Null);
        id
    }

    /// Content-based probe of the intern pool.
    fn find_interned(&self, text: &str, hash: u32) -> Option<StrId> {
        if self.strings.entries.is_empty() {
            return None;
        }
        let mask = self.strings.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.strings.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Null) {
                        return None;
                    }
                }
                Some(key) => {
                    if key.hash == hash && self.string(key.obj).chars == text {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn string(&self, r: ObjRef) -> &StrObj {
        match self.get(r) {
            Obj::String(s) => s,
            _ => unreachable!("object is not a string"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &super::object::FunctionObj {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("object is not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &super::object::ClosureObj {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut super::object::ClosureObj {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &super::object::ClassObj {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!("object is not a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut super::object::ClassObj {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!("object is not a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &super::object::InstanceObj {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("object is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut super::object::InstanceObj {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("object is not an instance"),
        }
    }

    pub fn list(&self, r: ObjRef) -> &super::object::ListObj {
        match self.get(r) {
            Obj::List(l) => l,
            _ => unreachable!("object is not a list"),
        }
    }

    pub fn list_mut(&mut self, r: ObjRef) -> &mut super::object::ListObj {
        match self.get_mut(r) {
            Obj::List(l) => l,
            _ => unreachable!("object is not a list"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &super::object::NativeObj {
        match self.get(r) {
            Obj::Native(n) => n,
            _ => unreachable!("object is not a native"),
        }
    }

    pub fn native_mut(&mut self, r: ObjRef) -> &mut super::object::NativeObj {
        match self.get_mut(r) {
            Obj::Native(n) => n,
            _ => unreachable!("object is not a native"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &super::object::UpvalueObj {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut super::object::UpvalueObj {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &super::object::BoundMethodObj {
        match self.get(r) {
            Obj::BoundMethod(b) => b,
            _ => unreachable!("object is not a bound method"),
        }
    }

    /// Rebuild the interned handle for a string-valued `Value`.
    pub fn str_id(&self, value: Value) -> StrId {
        let obj = value.as_obj();
        StrId {
            obj,
            hash: self.string(obj).hash,
        }
    }

    // -- Collection --

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if let Some(slot) = &mut self.slots[r.0 as usize] {
            if slot.marked {
                return;
            }
            slot.marked = true;
            self.gray.push(r);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.obj);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, marking each object's references.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            let children = self.get(r).children();
            for child in children {
                self.mark_value(child);
            }
        }
    }

    /// Free every unmarked object and clear the marks of the survivors.
    /// Interned strings that died are dropped from the pool first so the
    /// table never holds dangling keys.
    pub fn sweep(&mut self) {
        let dead_strings: Vec<StrId> = self
            .strings
            .iter()
            .filter(|(key, _)| {
                self.slots[key.obj.0 as usize]
                    .as_ref()
                    .map_or(true, |slot| !slot.marked)
            })
            .map(|(key, _)| key)
            .collect();
        for key in dead_strings {
            self.strings.delete(key);
        }

        for index in 0..self.slots.len() {
            let dead_size = match &mut self.slots[index] {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    None
                }
                Some(slot) => Some(slot.size),
                None => None,
            };
            if let Some(size) = dead_size {
                self.bytes_allocated -= size;
                self.slots[index] = None;
                self.free.push(index as u32);
            }
        }

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        debug!(
            "gc swept to {} live bytes, next cycle at {}",
            self.bytes_allocated, self.next_gc
        );
    }

    /// Mark the heap-internal roots (pinned temporaries). The VM marks
    /// everything else before calling `trace_references`.
    pub fn mark_own_roots(&mut self) {
        let pinned = self.temp_roots.clone();
        for value in pinned {
            self.mark_value(value);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object::ListObj;

    #[test]
    fn interning_is_identity() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a.obj, b.obj);
        assert_ne!(a.obj, c.obj);
        assert_eq!(heap.string(a.obj).chars, "hello");
    }

    #[test]
    fn take_string_reuses_existing() {
        let mut heap = Heap::new();
        let a = heap.intern("x");
        let b = heap.take_string("x".to_string());
        assert_eq!(a.obj, b.obj);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let keep = heap.alloc(Obj::List(ListObj::default()));
        let drop = heap.alloc(Obj::List(ListObj::default()));

        heap.mark_object(keep);
        heap.trace_references();
        heap.sweep();

        assert!(heap.is_live(keep));
        assert!(!heap.is_live(drop));
    }

    #[test]
    fn reachable_children_survive() {
        let mut heap = Heap::new();
        let inner = heap.alloc(Obj::List(ListObj::default()));
        let outer = heap.alloc(Obj::List(ListObj {
            items: vec![Value::Obj(inner)],
        }));

        heap.mark_object(outer);
        heap.trace_references();
        heap.sweep();

        assert!(heap.is_live(outer));
        assert!(heap.is_live(inner));
    }

    #[test]
    fn dead_interned_strings_leave_the_pool() {
        let mut heap = Heap::new();
        let doomed = heap.intern("ephemeral");
        heap.trace_references();
        heap.sweep();
        assert!(!heap.is_live(doomed.obj));

        // A fresh intern of the same text gets a fresh object.
        let again = heap.intern("ephemeral");
        assert!(heap.is_live(again.obj));
    }

    #[test]
    fn temp_roots_pin_objects() {
        let mut heap = Heap::new();
        let pinned = heap.alloc(Obj::List(ListObj::default()));
        heap.temp_roots.push(Value::Obj(pinned));

        heap.mark_own_roots();
        heap.trace_references();
        heap.sweep();

        assert!(heap.is_live(pinned));
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let dead = heap.alloc(Obj::List(ListObj::default()));
        heap.sweep();
        let recycled = heap.alloc(Obj::List(ListObj::default()));
        assert_eq!(dead.0, recycled.0);
    }

    #[test]
    fn byte_accounting_shrinks_on_sweep() {
        let mut heap = Heap::new();
        heap.alloc(Obj::String(StrObj {
            chars: "not interned, dies at sweep".to_string(),
            hash: 0,
        }));
        let before = heap.bytes_allocated;
        assert!(before > 0);
        heap.sweep();
        assert_eq!(heap.bytes_allocated, 0);
        assert_eq!(heap.next_gc, 0);
    }
}
