// This module gathers the target-independent half of the engine: the symbol registry the host
// populates, the compiled-object model a backend produces, the linker that turns that object
// into protected memory, the executor that calls into it, and the session that sequences all
// of it. Nothing here knows how C is parsed or how x86-64 is encoded; a backend plugs in
// through the CompileBackend trait and hands back a CompiledObject.

//! Core engine infrastructure.
//!
//! ## Registry (`registry`)
//! - Thread-safe name to address table supplied by the host
//!
//! ## Object model (`object`)
//! - Sections, defined symbols, relocations and signatures
//!
//! ## Linking (`linker`, `memory`)
//! - Relocation against the registry and in-object symbols
//! - Page-granular W^X regions
//!
//! ## Execution (`executor`)
//! - Typed calls into loaded code under the System V convention
//!
//! ## Sessions (`session`)
//! - Compile, link, load, execute and unload in one owner

pub mod assembler;
pub mod compiler;
pub mod diagnostic;
pub mod error;
pub mod executor;
pub mod linker;
pub mod memory;
pub mod object;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;

pub use assembler::emit_elf;
pub use compiler::{CallingConvention, CompileBackend, CompileOptions, CompileOutput, OutputKind, WordSize};
pub use diagnostic::{Diagnostic, Location, Severity, Stage};
pub use error::{CompileError, Error, ExecuteError, LinkError, RegistryError, Result, SessionError};
pub use executor::Value;
pub use linker::{LinkStats, LoadedSymbol};
pub use memory::{MemoryRegion, Permission};
pub use object::{
    CompiledObject, DefinedSymbol, RelocKind, RelocTarget, Relocation, Section, SectionId, SectionKind, Signature,
    ValueKind,
};
pub use registry::{Registry, RegistryOptions, Symbol, SymbolKind};
pub use session::{Session, SessionState, SessionStats};
