//! Fidel Runtime
//!
//! The stack virtual machine that executes compiled Fidel bytecode, plus
//! the default native registry. One [`Vm`] is one interpreter invocation;
//! its `interpret` method drives the compiler and then the dispatch loop,
//! and its globals persist across calls so a REPL can feed it line by
//! line.
//!
//! ```rust,ignore
//! use fidel_runtime::{InterpretResult, Vm};
//!
//! let mut vm = Vm::new();
//! assert_eq!(vm.interpret("አውጣ 1 + 2;"), InterpretResult::Ok);
//! ```

pub mod natives;
pub mod vm;

pub use vm::{InterpretResult, Vm, VmOptions};
