//! Cinder - a small embeddable scripting language.
//!
//! The crate has two layers sharing one object heap:
//!
//! - the Core: a homoiconic Lisp whose values are cons pairs, atoms and
//!   closures, evaluated by a tree-walking interpreter over a fixed-size
//!   arena with its own mark-sweep garbage collector;
//! - the Front-End: a curly-brace surface language compiled by a Pratt
//!   parser into the same pair trees the Core evaluates.
//!
//! A host embeds the language through [`Context`]: open an arena, register
//! native functions, read or compile source into the heap, evaluate, and
//! inspect the results.

pub mod analysis;
pub mod builtins;
pub mod compiler;
pub mod context;
pub mod error;
pub mod eval;
pub mod gc;
pub mod reader;
pub mod repl;
pub mod span;
pub mod value;
pub mod writer;

pub use context::{Context, Foreign};
pub use error::{Diagnostic, Error};
pub use value::{Obj, Type};
