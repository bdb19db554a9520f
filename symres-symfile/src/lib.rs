//! Symbol file parsing and address lookup.
//!
//! To symbolicate crash reports without understanding native debug formats,
//! the processing side works on text symbol files in the Breakpad dialect.
//! They comprise records describing source files, functions and their line
//! records, public symbols, as well as Windows unwind information:
//!
//! ```text
//! MODULE windows x86 5A9832E5287241C1838ED98914E9B7FF1 test_app.pdb
//! FILE 1 c:\src\test_app.cc
//! FUNC 1000 24 4 main
//! 1000 10 42 1
//! 1010 14 43 1
//! PUBLIC 1400 0 _start
//! STACK WIN 4 1000 24 1 0 4 0 8 0 1 $ebp $esp 4 - =
//! ```
//!
//! [`Module::parse`] ingests such a file and indexes its records so that
//! [`Module::lookup_address`] can fill function, source line and frame info
//! into a [`StackFrame`] for an instruction address. A parsed module can be
//! written to and re-read from a compact binary form via
//! [`Module::serialize`] and [`Module::deserialize`], which is much faster
//! than re-parsing the text on every start.
//!
//! Individual record parsers are exposed in the [`records`] module.

#![warn(missing_docs)]

pub mod records;

mod frame;
mod module;
mod serialize;

pub use frame::{CodeModule, FrameInfo, FrameInfoKind, StackFrame};
pub use module::{Function, Line, Module, ParseSymError, PublicSymbol};
pub use serialize::{DeserializeError, FORMAT_VERSION};
