//! cscript - in-process C compilation and execution.
//!
//! cscript compiles a subset of C straight to x86-64 machine code in memory,
//! resolves external references against a host-supplied [`Registry`], links
//! the result into W^X pages and calls into it, all without leaving the
//! process.
//!
//! # Primary Usage
//!
//! ```ignore
//! use cscript::{CompileOptions, Registry, Session, Value};
//!
//! extern "C" fn add(a: i64, b: i64) -> i64 { a + b }
//!
//! let registry = Registry::new(false);
//! registry.register_function("add", add as usize)?;
//!
//! let mut session = Session::new(&registry);
//! session.compile("long add(long, long); long go(void) { return add(40, 2); }",
//!                 &CompileOptions::default())?;
//! session.link_and_load()?;
//! assert_eq!(session.execute("go", &[])?, Value::Int(42));
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Registry, object model, linker, executor and sessions
//! - [`cfront`] - Lexer, preprocessor and parser for the C subset
//! - [`x64`] - x86-64 encoder, calling convention and the built-in backend
//! - [`host`] - Registration of host C library functions

pub mod cfront;
pub mod core;
pub mod host;
pub mod x64;

pub use core::{
    // Registry
    Registry, RegistryOptions, Symbol, SymbolKind,
    // Compilation
    CallingConvention, CompileBackend, CompileOptions, CompileOutput, CompiledObject, OutputKind, WordSize,
    // Sessions and execution
    Session, SessionState, SessionStats, Value,
    // Diagnostics and errors
    CompileError, Diagnostic, Error, ExecuteError, LinkError, Location, RegistryError, Result, SessionError,
    Severity, Stage,
};
pub use x64::X64Backend;
