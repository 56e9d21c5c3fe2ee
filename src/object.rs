// File: src/object.rs
//
// Heap object model. Every object allocated by the interpreter — strings,
// functions, closures, classes, instances, upvalues, bound methods,
// natives — is one `Obj`: a common GC header (`marked`, intrusive `next`)
// plus a tagged payload. This is "struct inheritance" reworked as a
// closed tagged sum with a shared header rather than runtime inheritance
// (see SPEC_FULL.md Design Notes).
//
// Objects live behind `ObjRef`, a thin `Copy` wrapper around a raw
// pointer. The GC (gc.rs) is the sole owner and sole releaser: nothing
// here is reference-counted. That's deliberate — a heap object's
// lifetime is a property of the trace from the root set, not of how many
// `ObjRef`s happen to alias it at a given instant.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjKind {
    Str,
    Function,
    Native,
    Upvalue,
    Closure,
    Class,
    Instance,
    BoundMethod,
}

pub struct ObjString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        // The scanner only ever produces ASCII-range bytes (see lexer.rs),
        // so this is always valid UTF-8 in practice; fall back rather than
        // panic if a native ever builds a non-UTF8 byte string.
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid-utf8>")
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

pub struct ObjNative {
    pub arity: u8,
    pub func: NativeFn,
}

#[derive(Clone, Copy)]
pub enum UpvalueLocation {
    /// Points at a live stack slot, valid only while the owning frame runs.
    Open(usize),
    /// Promoted off the stack; owns its value.
    Closed(Value),
}

pub struct ObjUpvalue {
    pub location: Cell<UpvalueLocation>,
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Box<[ObjRef]>,
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: RefCell<Table>,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

pub enum ObjData {
    Str(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
    Closure(ObjClosure),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// The common header plus payload. Only ever touched through `Box` at
/// allocation/free time (gc.rs) and through `ObjRef` everywhere else.
pub struct Obj {
    pub marked: Cell<bool>,
    pub next: Cell<Option<ObjRef>>,
    pub data: ObjData,
}

/// A `Copy` handle to a heap object. Equality is by address — this *is*
/// the reference-equality rule the value model relies on for objects,
/// and (combined with interning) for strings too.
#[derive(Clone, Copy, Debug)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    pub(crate) fn new(ptr: NonNull<Obj>) -> Self {
        ObjRef(ptr)
    }

    pub fn ptr_eq(self, other: Self) -> bool {
        self.0 == other.0
    }

    fn obj(&self) -> &Obj {
        // SAFETY: an ObjRef only ever exists for the lifetime between its
        // allocation and the sweep that frees it; nothing constructs an
        // ObjRef from a dangling address, and the GC never frees an
        // object still reachable from a root (see gc.rs).
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_ptr(self) -> NonNull<Obj> {
        self.0
    }

    pub fn is_marked(&self) -> bool {
        self.obj().marked.get()
    }

    pub fn set_marked(&self, marked: bool) {
        self.obj().marked.set(marked);
    }

    pub fn next(&self) -> Option<ObjRef> {
        self.obj().next.get()
    }

    pub fn set_next(&self, next: Option<ObjRef>) {
        self.obj().next.set(next);
    }

    pub fn kind(&self) -> ObjKind {
        match &self.obj().data {
            ObjData::Str(_) => ObjKind::Str,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Native(_) => ObjKind::Native,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            ObjKind::Str => "string",
            ObjKind::Function | ObjKind::Native | ObjKind::Closure | ObjKind::BoundMethod => {
                "function"
            }
            ObjKind::Upvalue => "upvalue",
            ObjKind::Class => "class",
            ObjKind::Instance => "instance",
        }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match &self.obj().data {
            ObjData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match &self.obj().data {
            ObjData::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&ObjNative> {
        match &self.obj().data {
            ObjData::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        match &self.obj().data {
            ObjData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match &self.obj().data {
            ObjData::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match &self.obj().data {
            ObjData::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match &self.obj().data {
            ObjData::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match &self.obj().data {
            ObjData::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    /// Rough byte cost used to drive the GC's allocation threshold. Exact
    /// accounting isn't load-bearing for correctness, only for *when* a
    /// collection runs.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match &self.obj().data {
            ObjData::Str(s) => s.bytes.len(),
            ObjData::Function(f) => f.chunk.approx_size(),
            ObjData::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            ObjData::Class(c) => c.methods.borrow().approx_size(),
            ObjData::Instance(i) => i.fields.borrow().approx_size(),
            _ => 0,
        }
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.obj().data {
            ObjData::Str(s) => write!(f, "{}", s.as_str()),
            ObjData::Function(func) => match func.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<script>"),
            },
            ObjData::Native(_) => write!(f, "<native fn>"),
            ObjData::Upvalue(_) => write!(f, "<upvalue>"),
            ObjData::Closure(c) => write!(f, "{}", c.function),
            ObjData::Class(c) => write!(f, "{}", c.name),
            ObjData::Instance(i) => write!(f, "{} instance", i.class),
            ObjData::BoundMethod(b) => write!(f, "{}", b.method),
        }
    }
}
