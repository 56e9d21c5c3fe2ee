// File: src/gc.rs
//
// Precise tracing mark-sweep over an intrusive list of heap objects.
// `Heap` is the sole allocator and sole releaser: nothing in this
// codebase reference-counts a GC'd object (see object.rs). A collection
// runs opportunistically whenever `bytes_allocated` crosses `next_gc`,
// growing that threshold by HEAP_GROW_FACTOR afterwards.
//
// `Heap` has no idea what a "root" is — that's the VM's and compiler's
// job (vm.rs's `Vm::mark_roots`, compiler.rs's `Compiler::mark_roots`).
// Every allocation call takes a `mark_roots` callback so a collection
// triggered mid-compile marks the compiler's in-progress constant pools
// instead of a VM that may not even exist yet.

use crate::object::{
    Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjFunction, ObjInstance, ObjNative,
    ObjRef, ObjString, ObjUpvalue, UpvalueLocation,
};
use crate::table::{fnv1a_hash, Table};
use crate::value::Value;
use std::cell::Cell;
use std::ptr::NonNull;

const HEAP_GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub type MarkRoots<'a> = dyn FnMut(&mut Heap) + 'a;

pub struct Heap {
    objects: Option<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    gray_stack: Vec<ObjRef>,
    /// The string interner. A *weak* table: entries are never marked as
    /// roots, only swept of dead keys after tracing (phase 3).
    strings: Table,
    pub init_string: ObjRef,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Self {
            objects: None,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray_stack: Vec::new(),
            strings: Table::new(),
            // placeholder, replaced immediately below
            init_string: ObjRef::new(NonNull::dangling()),
        };
        heap.init_string = heap.alloc_string(b"init", &mut |_| {});
        heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // ---- allocation -----------------------------------------------------

    fn push(&mut self, data: ObjData, mark_roots: &mut MarkRoots) -> ObjRef {
        self.maybe_collect(mark_roots);
        let boxed = Box::new(Obj { marked: Cell::new(false), next: Cell::new(self.objects), data });
        let ptr = NonNull::new(Box::into_raw(boxed)).expect("Box::into_raw is never null");
        let obj = ObjRef::new(ptr);
        self.objects = Some(obj);
        self.bytes_allocated += obj.approx_size();
        #[cfg(feature = "log-gc")]
        eprintln!("alloc {:p} size={} kind={:?}", ptr.as_ptr(), obj.approx_size(), obj.kind());
        obj
    }

    /// Interns `bytes`, allocating a new string only if no equal string
    /// already exists. This is the single entry point `copy`/`adopt`
    /// style string construction goes through.
    /// Looks up an already-interned string without allocating. Used by
    /// `Vm::global` to read a global back out by name in tests.
    pub fn find_interned(&self, bytes: &[u8]) -> Option<ObjRef> {
        self.strings.find_string(bytes, fnv1a_hash(bytes))
    }

    pub fn alloc_string(&mut self, bytes: &[u8], mark_roots: &mut MarkRoots) -> ObjRef {
        let hash = fnv1a_hash(bytes);
        if let Some(existing) = self.strings.find_string(bytes, hash) {
            return existing;
        }
        let obj =
            self.push(ObjData::Str(ObjString { bytes: bytes.to_vec().into_boxed_slice(), hash }), mark_roots);
        self.strings.set(obj, Value::Nil);
        obj
    }

    pub fn alloc_function(&mut self, function: ObjFunction, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(ObjData::Function(function), mark_roots)
    }

    pub fn alloc_native(&mut self, arity: u8, func: crate::object::NativeFn, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(ObjData::Native(ObjNative { arity, func }), mark_roots)
    }

    pub fn alloc_upvalue(&mut self, stack_index: usize, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(
            ObjData::Upvalue(ObjUpvalue { location: Cell::new(UpvalueLocation::Open(stack_index)) }),
            mark_roots,
        )
    }

    pub fn alloc_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(
            ObjData::Closure(ObjClosure { function, upvalues: upvalues.into_boxed_slice() }),
            mark_roots,
        )
    }

    pub fn alloc_class(&mut self, name: ObjRef, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(ObjData::Class(ObjClass { name, methods: Default::default() }), mark_roots)
    }

    pub fn alloc_instance(&mut self, class: ObjRef, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(ObjData::Instance(ObjInstance { class, fields: Default::default() }), mark_roots)
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef, mark_roots: &mut MarkRoots) -> ObjRef {
        self.push(ObjData::BoundMethod(ObjBoundMethod { receiver, method }), mark_roots)
    }

    // ---- GC ---------------------------------------------------------------

    fn maybe_collect(&mut self, mark_roots: &mut MarkRoots) {
        if cfg!(feature = "stress-gc") || self.bytes_allocated > self.next_gc {
            self.collect(mark_roots);
        }
    }

    pub fn collect(&mut self, mark_roots: &mut MarkRoots) {
        #[cfg(feature = "log-gc")]
        let before = self.bytes_allocated;
        #[cfg(feature = "log-gc")]
        eprintln!("-- gc begin");

        self.mark_object(self.init_string);
        mark_roots(self);
        self.trace_references();
        self.strings.remove_unmarked_keys();
        self.sweep();
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(INITIAL_NEXT_GC);

        #[cfg(feature = "log-gc")]
        eprintln!(
            "-- gc end, collected {} bytes ({} -> {}), next at {}",
            before.saturating_sub(self.bytes_allocated),
            before,
            self.bytes_allocated,
            self.next_gc
        );
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        if obj.is_marked() {
            return;
        }
        obj.set_marked(true);
        self.gray_stack.push(obj);
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        #[cfg(feature = "log-gc")]
        eprintln!("{:p} blacken {:?}", obj.as_ptr().as_ptr(), obj.kind());
        match obj.kind() {
            crate::object::ObjKind::Str | crate::object::ObjKind::Native => {}
            crate::object::ObjKind::Function => {
                let func = obj.as_function().expect("kind matched Function");
                if let Some(name) = func.name {
                    self.mark_object(name);
                }
                for &constant in &func.chunk.constants {
                    self.mark_value(constant);
                }
            }
            crate::object::ObjKind::Upvalue => {
                let up = obj.as_upvalue().expect("kind matched Upvalue");
                if let UpvalueLocation::Closed(v) = up.location.get() {
                    self.mark_value(v);
                }
            }
            crate::object::ObjKind::Closure => {
                let c = obj.as_closure().expect("kind matched Closure");
                self.mark_object(c.function);
                for &uv in c.upvalues.iter() {
                    self.mark_object(uv);
                }
            }
            crate::object::ObjKind::Class => {
                let class = obj.as_class().expect("kind matched Class");
                self.mark_object(class.name);
                let pairs: Vec<_> = class.methods.borrow().iter().collect();
                for (key, value) in pairs {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            crate::object::ObjKind::Instance => {
                let inst = obj.as_instance().expect("kind matched Instance");
                self.mark_object(inst.class);
                let pairs: Vec<_> = inst.fields.borrow().iter().collect();
                for (key, value) in pairs {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            crate::object::ObjKind::BoundMethod => {
                let bound = obj.as_bound_method().expect("kind matched BoundMethod");
                self.mark_value(bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.objects;
        while let Some(obj) = current {
            if obj.is_marked() {
                obj.set_marked(false);
                previous = Some(obj);
                current = obj.next();
            } else {
                let unreached = obj;
                current = obj.next();
                match previous {
                    Some(p) => p.set_next(current),
                    None => self.objects = current,
                }
                self.bytes_allocated = self.bytes_allocated.saturating_sub(unreached.approx_size());
                #[cfg(feature = "log-gc")]
                eprintln!("{:p} free {:?}", unreached.as_ptr().as_ptr(), unreached.kind());
                // SAFETY: `unreached` has just been unlinked from the only
                // list that can reach it, the sweep it was found in
                // already ran its mark phase to completion, and nothing
                // else on a single-threaded VM can be holding this
                // pointer across a collection (the allocator discipline
                // in SPEC_FULL.md guarantees every live reference is
                // rooted before the allocation that could trigger this).
                unsafe {
                    drop(Box::from_raw(unreached.as_ptr().as_ptr()));
                }
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while let Some(obj) = current {
            current = obj.next();
            // SAFETY: the heap is being torn down; every object in the
            // intrusive list was allocated by `push` via `Box::into_raw`
            // and is freed here exactly once.
            unsafe {
                drop(Box::from_raw(obj.as_ptr().as_ptr()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_string_is_collected_and_unmarked_after() {
        let mut heap = Heap::new();
        let bytes_before_alloc = heap.bytes_allocated();
        {
            let mut roots = |_: &mut Heap| {};
            heap.alloc_string(b"throwaway", &mut roots);
        }
        assert!(heap.bytes_allocated() > bytes_before_alloc);

        let mut roots = |_: &mut Heap| {}; // no roots: nothing survives
        heap.collect(&mut roots);
        assert_eq!(heap.bytes_allocated(), bytes_before_alloc);
    }

    #[test]
    fn rooted_string_survives_collection() {
        let mut heap = Heap::new();
        let kept = {
            let mut roots = |_: &mut Heap| {};
            heap.alloc_string(b"kept", &mut roots)
        };
        let mut roots = |h: &mut Heap| h.mark_object(kept);
        heap.collect(&mut roots);
        assert_eq!(kept.as_string().map(|s| s.as_str()), Some("kept"));
    }

    #[test]
    fn unrooted_literal_is_dropped_from_the_intern_table() {
        let mut heap = Heap::new();
        {
            let mut roots = |_: &mut Heap| {};
            heap.alloc_string(b"ephemeral", &mut roots);
        }
        assert!(heap.find_interned(b"ephemeral").is_some());

        let mut roots = |_: &mut Heap| {};
        heap.collect(&mut roots);
        assert!(heap.find_interned(b"ephemeral").is_none());

        // A later identical literal is a fresh allocation, not the freed one:
        // it can't be found before re-allocating, and bytes_allocated grows
        // again to account for it.
        let before = heap.bytes_allocated();
        let mut roots = |_: &mut Heap| {};
        let fresh = heap.alloc_string(b"ephemeral", &mut roots);
        assert!(heap.bytes_allocated() > before);
        assert_eq!(fresh.as_string().map(|s| s.as_str()), Some("ephemeral"));
    }
}
