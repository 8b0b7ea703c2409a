//! Fidel Core Object Model
//!
//! Shared foundation for the Fidel compiler and virtual machine:
//!
//! - [`value::Value`] - the tagged runtime value (nil, boolean, number, object)
//! - [`heap::Heap`] - garbage-collected object arena with string interning
//! - [`object::ObjBody`] - heap object payloads (strings, functions, closures,
//!   classes, instances, bound methods, upvalues, natives)
//! - [`chunk::Chunk`] - compiled bytecode with a constant pool and line table
//! - [`table::Table`] - open-addressed hash table keyed by interned strings
//! - [`debug`] - bytecode disassembler
//!
//! The compiler emits into chunks hanging off heap-allocated function
//! objects; the VM executes those chunks. Both sides allocate through the
//! same [`heap::Heap`], which may run a mark-sweep collection before any
//! allocation, so every allocation site supplies its roots via
//! [`heap::RootSet`].

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, ObjRef, RootSet};
pub use object::{NativeFn, ObjBody};
pub use table::Table;
pub use value::Value;

/// Method name that marks a class initializer (invoked when a class is
/// called to construct an instance). Reserved at the language surface.
pub const INIT_METHOD_NAME: &str = "ማስጀመሪያ";
