//! Heap object payloads.
//!
//! Every heap-allocated value is an [`ObjBody`] variant stored in an arena
//! slot behind an [`ObjRef`] handle. Objects refer to each other only
//! through handles; from an ownership perspective every such reference is
//! a borrow from the collector, which is what lets the cyclic graphs here
//! (closure ↔ upvalue ↔ stack, class ↔ method, instance ↔ class) work
//! without reference counting.

use crate::chunk::Chunk;
use crate::heap::{Heap, ObjRef};
use crate::table::Table;
use crate::value::Value;

/// Interned, immutable string with its cached FNV-1a hash.
#[derive(Debug)]
pub struct ObjString {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: bytecode plus the metadata the VM needs to call it.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    /// Number of upvalues the function captures; a closure over this
    /// function carries exactly this many upvalue handles.
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Interned name; `None` for the top-level script.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    pub fn new(name: Option<ObjRef>) -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

/// Host function callable from guest code.
///
/// Natives that allocate must pin any intermediate values through the
/// heap's temp-root stack before their next allocation.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, String>;

/// A registered host function with a fixed arity.
pub struct ObjNative {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Runtime pairing of a function with its captured upvalues.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable: open while its stack slot is live, closed (owning
/// the value) once that slot leaves the stack. The transition happens
/// exactly once.
#[derive(Debug)]
pub enum ObjUpvalue {
    /// Absolute index into the VM value stack.
    Open(usize),
    Closed(Value),
}

impl ObjUpvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            ObjUpvalue::Open(slot) => Some(*slot),
            ObjUpvalue::Closed(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    /// Method name → closure value.
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method pre-bound to its receiver, ready for a later call.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    /// Closure of the underlying method.
    pub method: ObjRef,
}

/// Payload of one heap object.
#[derive(Debug)]
pub enum ObjBody {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl ObjBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjBody::String(_) => "string",
            ObjBody::Function(_) => "function",
            ObjBody::Native(_) => "native",
            ObjBody::Closure(_) => "closure",
            ObjBody::Upvalue(_) => "upvalue",
            ObjBody::Class(_) => "class",
            ObjBody::Instance(_) => "instance",
            ObjBody::BoundMethod(_) => "bound method",
        }
    }

    /// Rough byte footprint used by the collection-trigger heuristic.
    pub(crate) fn heap_size(&self) -> usize {
        let base = std::mem::size_of::<ObjBody>();
        base + match self {
            ObjBody::String(s) => s.chars.capacity(),
            ObjBody::Function(f) => {
                f.chunk.code.capacity()
                    + f.chunk.lines.capacity() * std::mem::size_of::<u32>()
                    + f.chunk.constants.capacity() * std::mem::size_of::<Value>()
            }
            ObjBody::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
            ObjBody::Class(c) => c.methods.len() * std::mem::size_of::<Value>() * 2,
            ObjBody::Instance(i) => i.fields.len() * std::mem::size_of::<Value>() * 2,
            ObjBody::Native(_) | ObjBody::Upvalue(_) | ObjBody::BoundMethod(_) => 0,
        }
    }
}
