//! Garbage-collected object heap.
//!
//! An arena of object slots addressed by stable [`ObjRef`] handles, with a
//! precise, non-moving mark-sweep collector. All live objects are threaded
//! on a singly-linked sweep list headed at the heap; collection marks from
//! the caller-supplied roots with an explicit grey worklist, drops interned
//! strings the intern table holds weakly, then sweeps the list and returns
//! dead slots to a free list.
//!
//! A collection may run before *any* allocation, so every allocation site
//! passes a [`RootSet`] describing what it can reach. Values that are
//! mid-construction and not yet visible from any root are pinned with
//! [`Heap::push_temp_root`] / [`Heap::pop_temp_root`].
//!
//! The trigger heuristic follows the classic scheme: collect when the
//! tracked byte footprint passes a threshold that doubles after each
//! cycle. Stress mode forces a collection before every allocation and is
//! the main lever for flushing out rooting bugs.

use tracing::debug;

use crate::object::{ObjBody, ObjClass, ObjFunction, ObjInstance, ObjString};
use crate::object::{ObjBoundMethod, ObjClosure, ObjNative, ObjUpvalue};
use crate::table::{Table, hash_string};
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Stable handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn new(index: u32) -> Self {
        ObjRef(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct HeapObj {
    marked: bool,
    /// Next object on the sweep list.
    next: Option<ObjRef>,
    body: ObjBody,
}

/// Everything a caller can reach at an allocation point. All fields are
/// borrowed; an empty set is only correct when the caller holds no live
/// handles at all.
#[derive(Clone, Copy, Default)]
pub struct RootSet<'a> {
    /// The VM value stack between its base and top.
    pub stack: &'a [Value],
    /// The VM globals table (keys and values are both roots).
    pub globals: Option<&'a Table>,
    /// Open upvalue objects threaded by the VM.
    pub open_upvalues: &'a [ObjRef],
    /// Everything else: frame closures, the interned initializer name, and
    /// the in-flight compiler's function chain.
    pub handles: &'a [ObjRef],
}

/// The object arena and collector.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapObj>>,
    free: Vec<u32>,
    /// Head of the sweep list; every live object is reachable from here.
    head: Option<ObjRef>,
    /// Interned strings. Keys are held weakly: unmarked keys are removed
    /// before each sweep.
    strings: Table,
    /// Pin stack for values under construction.
    temp_roots: Vec<Value>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            strings: Table::new(),
            temp_roots: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress: false,
        }
    }

    /// Force a collection before every allocation.
    pub fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects, for tests and diagnostics.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate a new object, possibly collecting first. The returned
    /// handle must become reachable from `roots` (or be temp-rooted)
    /// before the caller's next allocation.
    pub fn allocate(&mut self, body: ObjBody, roots: &RootSet) -> ObjRef {
        if self.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }

        self.bytes_allocated += body.heap_size();
        let obj = HeapObj {
            marked: false,
            next: self.head,
            body,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                index
            }
            None => {
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        };
        let r = ObjRef(index);
        self.head = Some(r);
        r
    }

    /// Return the canonical string object for `chars`, allocating and
    /// registering it on first sight. Like [`Heap::allocate`], the result
    /// must be rooted by the caller before the next allocation.
    pub fn intern(&mut self, chars: &str, roots: &RootSet) -> ObjRef {
        let hash = hash_string(chars);
        let slots = &self.slots;
        let existing = self.strings.find_string(hash, |key| {
            match &slots[key.index()] {
                Some(obj) => match &obj.body {
                    ObjBody::String(s) => s.chars == chars,
                    _ => false,
                },
                None => false,
            }
        });
        if let Some(existing) = existing {
            return existing;
        }

        let r = self.allocate(
            ObjBody::String(ObjString {
                chars: chars.to_string(),
                hash,
            }),
            roots,
        );
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Pin a value that no root can see yet.
    pub fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop();
    }

    /// Run a full mark-sweep cycle over the arena.
    pub fn collect(&mut self, roots: &RootSet) {
        let before = self.bytes_allocated;
        let mut grey: Vec<ObjRef> = Vec::new();

        // Mark roots.
        for &value in roots.stack {
            self.mark_value(value, &mut grey);
        }
        if let Some(globals) = roots.globals {
            for (key, value) in globals.iter() {
                self.mark_object(key, &mut grey);
                self.mark_value(value, &mut grey);
            }
        }
        for &r in roots.open_upvalues {
            self.mark_object(r, &mut grey);
        }
        for &r in roots.handles {
            self.mark_object(r, &mut grey);
        }
        let pinned = self.temp_roots.clone();
        for value in pinned {
            self.mark_value(value, &mut grey);
        }

        // Trace until the grey worklist drains.
        while let Some(r) = grey.pop() {
            self.blacken(r, &mut grey);
        }

        // The intern table holds its keys weakly: drop the ones about to
        // be swept so no dangling handle survives in the table.
        let mut strings = std::mem::take(&mut self.strings);
        strings.retain(|key| self.is_marked(key));
        self.strings = strings;

        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        debug!(
            freed = before - self.bytes_allocated,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc cycle"
        );
    }

    fn mark_value(&mut self, value: Value, grey: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = value {
            self.mark_object(r, grey);
        }
    }

    fn mark_object(&mut self, r: ObjRef, grey: &mut Vec<ObjRef>) {
        if let Some(obj) = &mut self.slots[r.index()]
            && !obj.marked
        {
            obj.marked = true;
            grey.push(r);
        }
    }

    /// Mark everything a grey object refers to.
    fn blacken(&mut self, r: ObjRef, grey: &mut Vec<ObjRef>) {
        let mut children: Vec<Value> = Vec::new();
        match self.body(r) {
            ObjBody::String(_) | ObjBody::Upvalue(ObjUpvalue::Open(_)) => {}
            ObjBody::Upvalue(ObjUpvalue::Closed(value)) => children.push(*value),
            ObjBody::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend_from_slice(&f.chunk.constants);
            }
            ObjBody::Native(n) => children.push(Value::Obj(n.name)),
            ObjBody::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            ObjBody::Class(c) => {
                children.push(Value::Obj(c.name));
                for (key, value) in c.methods.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            ObjBody::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (key, value) in i.fields.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            ObjBody::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
        }
        for child in children {
            self.mark_value(child, grey);
        }
    }

    /// Walk the sweep list: free unmarked objects, clear surviving marks.
    fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.head;
        while let Some(r) = current {
            let (marked, next) = {
                let obj = self.existing(r);
                (obj.marked, obj.next)
            };
            if marked {
                self.existing_mut(r).marked = false;
                previous = Some(r);
            } else {
                match previous {
                    Some(p) => self.existing_mut(p).next = next,
                    None => self.head = next,
                }
                self.free_object(r);
            }
            current = next;
        }
    }

    fn free_object(&mut self, r: ObjRef) {
        let size = self.body(r).heap_size();
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        self.slots[r.index()] = None;
        self.free.push(r.index() as u32);
    }

    pub(crate) fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index()].as_ref().is_some_and(|o| o.marked)
    }

    // Accessors. Handles are only produced by this heap, so a missing or
    // kind-mismatched slot is an interpreter bug, not a user error.

    fn existing(&self, r: ObjRef) -> &HeapObj {
        match &self.slots[r.index()] {
            Some(obj) => obj,
            None => panic!("use of freed object handle {r:?}"),
        }
    }

    fn existing_mut(&mut self, r: ObjRef) -> &mut HeapObj {
        match &mut self.slots[r.index()] {
            Some(obj) => obj,
            None => panic!("use of freed object handle {r:?}"),
        }
    }

    fn body(&self, r: ObjRef) -> &ObjBody {
        &self.existing(r).body
    }

    pub fn get(&self, r: ObjRef) -> &ObjBody {
        self.body(r)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut ObjBody {
        &mut self.existing_mut(r).body
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.body(r) {
            ObjBody::String(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    /// The text of an interned string.
    pub fn str(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match self.body(r) {
            ObjBody::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut ObjFunction {
        match self.get_mut(r) {
            ObjBody::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn native(&self, r: ObjRef) -> &ObjNative {
        match self.body(r) {
            ObjBody::Native(n) => n,
            other => panic!("expected native, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ObjClosure {
        match self.body(r) {
            ObjBody::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ObjClosure {
        match self.get_mut(r) {
            ObjBody::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.body(r) {
            ObjBody::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            ObjBody::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match self.body(r) {
            ObjBody::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.get_mut(r) {
            ObjBody::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match self.body(r) {
            ObjBody::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.get_mut(r) {
            ObjBody::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match self.body(r) {
            ObjBody::BoundMethod(b) => b,
            other => panic!("expected bound method, found {}", other.kind_name()),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_returns_canonical_instance() {
        let mut heap = Heap::new();
        let roots = RootSet::default();
        let a = heap.intern("ሀሰት", &roots);
        let b = heap.intern("ሀሰት", &roots);
        let c = heap.intern("እውነት", &roots);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str(a), "ሀሰት");
    }

    #[test]
    fn test_collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let roots = RootSet::default();
        let kept = heap.intern("kept", &roots);
        let _dropped = heap.intern("dropped", &roots);
        assert_eq!(heap.object_count(), 2);

        let handles = [kept];
        heap.collect(&RootSet {
            handles: &handles,
            ..RootSet::default()
        });
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.str(kept), "kept");
    }

    #[test]
    fn test_collect_drops_stale_intern_entries() {
        let mut heap = Heap::new();
        let roots = RootSet::default();
        let _stale = heap.intern("gone", &roots);
        heap.collect(&roots);
        // The weak entry is gone, so re-interning creates a fresh object.
        let fresh = heap.intern("gone", &roots);
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.str(fresh), "gone");
    }

    #[test]
    fn test_marks_are_cleared_after_collection() {
        let mut heap = Heap::new();
        let roots = RootSet::default();
        let kept = heap.intern("kept", &roots);
        let handles = [kept];
        let rooted = RootSet {
            handles: &handles,
            ..RootSet::default()
        };
        heap.collect(&rooted);
        assert!(!heap.is_marked(kept));
        // A second cycle must re-trace from the roots, not rely on marks.
        heap.collect(&rooted);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_closure_keeps_function_and_upvalues_alive() {
        let mut heap = Heap::new();
        let roots = RootSet::default();
        let name = heap.intern("f", &roots);
        heap.push_temp_root(Value::Obj(name));
        let function = heap.allocate(ObjBody::Function(ObjFunction::new(Some(name))), &roots);
        heap.push_temp_root(Value::Obj(function));
        let upvalue = heap.allocate(
            ObjBody::Upvalue(ObjUpvalue::Closed(Value::Number(3.0))),
            &roots,
        );
        heap.push_temp_root(Value::Obj(upvalue));
        let closure = heap.allocate(
            ObjBody::Closure(ObjClosure {
                function,
                upvalues: vec![upvalue],
            }),
            &roots,
        );
        heap.pop_temp_root();
        heap.pop_temp_root();
        heap.pop_temp_root();

        let handles = [closure];
        heap.collect(&RootSet {
            handles: &handles,
            ..RootSet::default()
        });
        assert_eq!(heap.object_count(), 4);
        assert_eq!(heap.closure(closure).upvalues.len(), 1);
        assert_eq!(
            heap.upvalue(upvalue).open_slot(),
            None,
            "closed upvalue stays closed across collection"
        );
    }

    #[test]
    fn test_stress_mode_collects_on_every_allocation() {
        let mut heap = Heap::new();
        heap.set_stress(true);
        let roots = RootSet::default();
        let a = heap.intern("a", &roots);
        heap.push_temp_root(Value::Obj(a));
        // This allocation collects first; the pinned string must survive.
        let b = heap.intern("b", &roots);
        heap.pop_temp_root();
        assert_eq!(heap.str(a), "a");
        assert_eq!(heap.str(b), "b");
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new();
        let roots = RootSet::default();
        let _garbage = heap.intern("garbage", &roots);
        heap.collect(&roots);
        let recycled = heap.intern("recycled", &roots);
        assert_eq!(heap.object_count(), 1);
        assert_eq!(recycled.index(), 0);
    }
}
