//! The object heap: an arena of slots addressed by `Handle`, string
//! interning, and the tricolor mark-sweep collector core.
//!
//! All object references between heap values are handles, so ownership of
//! the whole (possibly cyclic) object graph rests here. The VM supplies
//! the roots each cycle: it marks them, then calls `trace_references`,
//! `remove_white_strings`, and `sweep` in that order.
//!
//! Collections are triggered by allocation pressure: `should_collect`
//! turns true once `bytes_allocated` crosses `next_gc` (1 MiB to start,
//! doubling after every sweep), and the VM checks it at dispatch
//! boundaries. In stress mode every boundary collects.

use tracing::{debug, trace};

use crate::object::{Handle, Obj, ObjString, UpvalueState, fnv1a};
use crate::table::Table;
use crate::value::Value;

const FIRST_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

#[derive(Debug)]
struct Slot {
    obj: Obj,
    marked: bool,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Weak intern table: string value → nil. Entries whose key object is
    /// unmarked are removed before every sweep.
    strings: Table,
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            stress: cfg!(feature = "gc-stress"),
        }
    }

    /// Force a collection at every dispatch boundary.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn allocate(&mut self, obj: Obj) -> Handle {
        self.bytes_allocated += obj.size();
        let slot = Slot { obj, marked: false };
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                Handle::from_index(index)
            }
            None => {
                self.slots.push(Some(slot));
                Handle::from_index((self.slots.len() - 1) as u32)
            }
        };
        trace!(handle = handle.index(), bytes = self.bytes_allocated, "allocate");
        handle
    }

    #[inline]
    pub fn get(&self, handle: Handle) -> &Obj {
        &self.slots[handle.index() as usize]
            .as_ref()
            .expect("stale object handle")
            .obj
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        &mut self.slots[handle.index() as usize]
            .as_mut()
            .expect("stale object handle")
            .obj
    }

    // Typed accessors. A wrong kind is a VM invariant violation, not a
    // user-reachable error, so these panic.

    pub fn string(&self, handle: Handle) -> &ObjString {
        match self.get(handle) {
            Obj::String(s) => s,
            _ => unreachable!("handle is not a string"),
        }
    }

    pub fn string_chars(&self, handle: Handle) -> &str {
        &self.string(handle).chars
    }

    /// Intern a string: return the existing handle for these exact
    /// characters, or allocate and register a new one.
    pub fn intern(&mut self, text: &str) -> Handle {
        let hash = fnv1a(text.as_bytes());
        let slots = &self.slots;
        let existing = self.strings.find_string_with(hash, |handle| {
            match &slots[handle.index() as usize] {
                Some(slot) => match &slot.obj {
                    Obj::String(s) => s.chars == text,
                    _ => false,
                },
                None => false,
            }
        });
        if let Some(handle) = existing {
            return handle;
        }
        let handle = self.allocate(Obj::String(ObjString {
            chars: text.to_string(),
            hash,
        }));
        self.strings.set(Value::object(handle), hash, Value::NIL);
        handle
    }

    /// Hash a value for table use. `None` means "Unhashable type."
    pub fn hash_value(&self, value: Value) -> Option<u32> {
        if value.is_nil() || value.is_empty() {
            return Some(0);
        }
        if let Some(b) = value.as_bool() {
            return Some(u32::from(b));
        }
        if let Some(n) = value.as_number() {
            // +0.0 and -0.0 are equal keys, so they must hash alike.
            let bits = if n == 0.0 { 0 } else { n.to_bits() };
            return Some((bits >> 32) as u32 ^ bits as u32);
        }
        let handle = value.as_object()?;
        match self.get(handle) {
            Obj::String(s) => Some(s.hash),
            _ => None,
        }
    }

    /// A value is falsy iff it is `nil`, `false`, the number zero, or the
    /// `none` option.
    pub fn is_falsy(&self, value: Value) -> bool {
        if value.is_nil() {
            return true;
        }
        if let Some(b) = value.as_bool() {
            return !b;
        }
        if let Some(n) = value.as_number() {
            return n == 0.0;
        }
        match value.as_object() {
            Some(handle) => matches!(self.get(handle), Obj::Option(None)),
            None => false,
        }
    }

    /// Short type word for runtime error messages.
    pub fn type_name(&self, value: Value) -> &'static str {
        if value.is_nil() {
            return "nil";
        }
        if value.is_bool() {
            return "boolean";
        }
        if value.is_number() {
            return "number";
        }
        match value.as_object() {
            Some(handle) => match self.get(handle) {
                Obj::String(_) => "string",
                Obj::Function(_) | Obj::Closure(_) => "function",
                Obj::Native(_) | Obj::BoundNative(_) => "native function",
                Obj::Upvalue(_) => "upvalue",
                Obj::BoundMethod(_) => "method",
                Obj::Class(_) => "class",
                Obj::Instance(_) => "instance",
                Obj::List(_) => "list",
                Obj::Dict(_) => "dict",
                Obj::Option(_) => "option",
            },
            None => "value",
        }
    }

    /// Render a value the way `print` shows it.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_empty() {
            return "<empty>".to_string();
        }
        if let Some(b) = value.as_bool() {
            return b.to_string();
        }
        if let Some(n) = value.as_number() {
            return crate::format_number(n);
        }
        let handle = match value.as_object() {
            Some(handle) => handle,
            None => return "<value>".to_string(),
        };
        match self.get(handle) {
            Obj::String(s) => s.chars.clone(),
            Obj::Function(f) => self.format_function(f.name),
            Obj::Native(_) | Obj::BoundNative(_) => "<native fn>".to_string(),
            Obj::Closure(c) => {
                let function = match self.get(c.function) {
                    Obj::Function(f) => f,
                    _ => unreachable!("closure over a non-function"),
                };
                self.format_function(function.name)
            }
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::BoundMethod(b) => self.format_value(Value::object(b.method)),
            Obj::Class(c) => self.string_chars(c.name).to_string(),
            Obj::Instance(i) => {
                let class = match self.get(i.class) {
                    Obj::Class(c) => c,
                    _ => unreachable!("instance of a non-class"),
                };
                format!("{} instance", self.string_chars(class.name))
            }
            Obj::List(items) => {
                let rendered: Vec<String> =
                    items.iter().map(|&item| self.format_value(item)).collect();
                format!("[{}]", rendered.join(", "))
            }
            Obj::Dict(entries) => {
                let rendered: Vec<String> = entries
                    .entries()
                    .map(|(k, v)| format!("{}: {}", self.format_value(k), self.format_value(v)))
                    .collect();
                format!("dict {{{}}}", rendered.join(", "))
            }
            Obj::Option(None) => "none".to_string(),
            Obj::Option(Some(inner)) => format!("some({})", self.format_value(*inner)),
        }
    }

    fn format_function(&self, name: Option<Handle>) -> String {
        match name {
            Some(name) => format!("<fn {}>", self.string_chars(name)),
            None => "<script>".to_string(),
        }
    }

    // ---- Collector ----

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        matches!(&self.slots[handle.index() as usize], Some(slot) if slot.marked)
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Some(handle) = value.as_object() {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: Handle) {
        let slot = self.slots[handle.index() as usize]
            .as_mut()
            .expect("marking a freed object");
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(handle);
    }

    /// Mark every key and value of an externally owned table (globals,
    /// builtin member tables). The intern table is deliberately not a
    /// root: its references are weak.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.entries() {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray stack, marking each object's outgoing references.
    pub fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: Handle) {
        let mut children: Vec<Value> = Vec::new();
        match self.get(handle) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::object(name));
                }
                children.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                children.push(Value::object(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::object(u)));
            }
            Obj::Upvalue(u) => {
                // Safe whether open or closed: an open upvalue's stack
                // slot is marked with the rest of the stack roots.
                if let UpvalueState::Closed(value) = u.state {
                    children.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::object(b.method));
            }
            Obj::BoundNative(b) => children.push(b.receiver),
            Obj::Class(c) => {
                children.push(Value::object(c.name));
                children.extend(c.methods.entries().flat_map(|(k, v)| [k, v]));
            }
            Obj::Instance(i) => {
                children.push(Value::object(i.class));
                children.extend(i.fields.entries().flat_map(|(k, v)| [k, v]));
            }
            Obj::List(items) => children.extend_from_slice(items),
            Obj::Dict(entries) => children.extend(entries.entries().flat_map(|(k, v)| [k, v])),
            Obj::Option(inner) => children.extend(inner.iter().copied()),
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// Drop intern entries for strings the mark phase did not reach, so
    /// the sweep can free them without leaving dangling intern entries.
    pub fn remove_white_strings(&mut self) {
        let slots = &self.slots;
        self.strings
            .remove_white(|handle| matches!(&slots[handle.index() as usize], Some(slot) if slot.marked));
    }

    /// Free every unmarked object, clear surviving marks, and set the
    /// next collection threshold. Returns the number of bytes freed.
    pub fn sweep(&mut self) -> usize {
        let before = self.bytes_allocated;
        let mut live_bytes = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    live_bytes += slot.obj.size();
                }
                Some(_) => {
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        // Recompute from survivors: mutations since allocation (list
        // growth, table growth) are invisible to allocate-time accounting.
        self.bytes_allocated = live_bytes;
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        let freed = before.saturating_sub(live_bytes);
        debug!(
            freed,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc sweep"
        );
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_returns_same_handle_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string_chars(a), "hello");
    }

    #[test]
    fn test_unreferenced_strings_are_swept_and_reinterned() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let dropped = heap.intern("dropped");
        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert_eq!(heap.object_count(), 1);
        // Interning the dropped text again allocates a fresh object; the
        // intern table has no dangling entry for the old one.
        let again = heap.intern("dropped");
        assert_ne!(again, kept);
        assert_eq!(heap.string_chars(again), "dropped");
        let _ = dropped;
    }

    #[test]
    fn test_collection_traces_object_graph() {
        let mut heap = Heap::new();
        let name = heap.intern("point");
        let class = heap.allocate(Obj::Class(crate::object::ObjClass::new(name)));
        let instance = heap.allocate(Obj::Instance(crate::object::ObjInstance::new(class)));
        let field_name = heap.intern("x");
        let hash = heap.string(field_name).hash;
        match heap.get_mut(instance) {
            Obj::Instance(i) => {
                i.fields
                    .set(Value::object(field_name), hash, Value::number(3.0));
            }
            _ => unreachable!(),
        }
        let garbage = heap.intern("garbage");

        heap.mark_object(instance);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        // instance → class → name, and the field key, all survive.
        assert_eq!(heap.object_count(), 4);
        assert!(!heap.is_marked(instance));
        assert_eq!(heap.string_chars(name), "point");
        let _ = garbage;
    }

    #[test]
    fn test_collection_is_idempotent() {
        let mut heap = Heap::new();
        let root = heap.intern("root");
        for i in 0..32 {
            heap.intern(&format!("junk{}", i));
        }
        heap.mark_object(root);
        heap.trace_references();
        heap.remove_white_strings();
        let first = heap.sweep();
        assert!(first > 0);

        heap.mark_object(root);
        heap.trace_references();
        heap.remove_white_strings();
        let second = heap.sweep();
        assert_eq!(second, 0);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let junk = heap.intern("junk");
        heap.remove_white_strings();
        heap.sweep();
        let next = heap.intern("next");
        assert_eq!(junk.index(), next.index());
    }

    #[test]
    fn test_number_hash_folds_and_normalizes_zero() {
        let heap = Heap::new();
        assert_eq!(heap.hash_value(Value::number(0.0)), heap.hash_value(Value::number(-0.0)));
        assert_eq!(heap.hash_value(Value::NIL), Some(0));
        assert_eq!(heap.hash_value(Value::TRUE), Some(1));
        assert_eq!(heap.hash_value(Value::FALSE), Some(0));
        // Non-integral doubles hash consistently.
        assert_eq!(
            heap.hash_value(Value::number(2.5)),
            heap.hash_value(Value::number(2.5))
        );
    }

    #[test]
    fn test_unhashable_types() {
        let mut heap = Heap::new();
        let list = heap.allocate(Obj::List(Vec::new()));
        assert_eq!(heap.hash_value(Value::object(list)), None);
        let s = heap.intern("key");
        assert_eq!(heap.hash_value(Value::object(s)), Some(heap.string(s).hash));
    }

    #[test]
    fn test_falsiness() {
        let mut heap = Heap::new();
        assert!(heap.is_falsy(Value::NIL));
        assert!(heap.is_falsy(Value::FALSE));
        assert!(heap.is_falsy(Value::number(0.0)));
        let none = heap.allocate(Obj::Option(None));
        assert!(heap.is_falsy(Value::object(none)));

        assert!(!heap.is_falsy(Value::TRUE));
        assert!(!heap.is_falsy(Value::number(1.0)));
        let some = heap.allocate(Obj::Option(Some(Value::FALSE)));
        assert!(!heap.is_falsy(Value::object(some)));
        let empty = heap.intern("");
        assert!(!heap.is_falsy(Value::object(empty)));
    }

    #[test]
    fn test_format_values() {
        let mut heap = Heap::new();
        assert_eq!(heap.format_value(Value::NIL), "nil");
        assert_eq!(heap.format_value(Value::TRUE), "true");
        assert_eq!(heap.format_value(Value::number(2.5)), "2.5");
        let s = heap.intern("hi");
        assert_eq!(heap.format_value(Value::object(s)), "hi");
        let list = heap.allocate(Obj::List(vec![Value::number(1.0), Value::object(s)]));
        assert_eq!(heap.format_value(Value::object(list)), "[1, hi]");
        let none = heap.allocate(Obj::Option(None));
        assert_eq!(heap.format_value(Value::object(none)), "none");
    }
}
