//! Fidel Compiler
//!
//! Turns Fidel source text into bytecode in a single pass: the
//! [`scanner`] produces tokens on demand and the [`compiler`] parses and
//! emits simultaneously, hanging chunks off heap-allocated function
//! objects. The top-level script compiles to a function like any other.
//!
//! ```rust,ignore
//! use fidel_core::{Heap, RootSet};
//! use fidel_compiler::{CompileOptions, compile};
//!
//! let mut heap = Heap::new();
//! let mut stderr = std::io::stderr();
//! let script = compile(
//!     "አውጣ 1 + 2;",
//!     &mut heap,
//!     RootSet::default(),
//!     &CompileOptions::default(),
//!     &mut stderr,
//! );
//! ```

pub mod compiler;
pub mod scanner;

pub use compiler::{CompileOptions, compile};
pub use scanner::{Scanner, Token, TokenKind};
