// Error types for every stage of the cscript pipeline, built with thiserror. Each stage owns
// its enum so a caller can tell from the type alone where a session stopped: RegistryError
// for symbol table misuse, CompileError for front end and code generation failures (carrying
// the accumulated diagnostics), LinkError for resolution, relocation and memory commit
// failures, ExecuteError for entry lookup, argument marshalling and faults, and SessionError
// for lifecycle misuse. The crate-level Error wraps them all so drivers can use `?` across
// stages.

//! Error types for the cscript engine.

use thiserror::Error;

use super::diagnostic::Diagnostic;
use super::object::RelocKind;
use super::registry::SymbolKind;
use super::session::SessionState;

/// Failures reported by the symbol [`Registry`](super::registry::Registry).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate symbol: {name}")]
    DuplicateSymbol { name: String },

    #[error("symbol not found: {name}")]
    NotFound { name: String },

    #[error("invalid symbol name: {name:?}")]
    InvalidName { name: String },
}

/// Failures of the compile stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("compilation failed: {}", first_error(.diagnostics))]
    Failed { diagnostics: Vec<Diagnostic> },

    #[error("cannot compile a session in state {state}")]
    InvalidState { state: SessionState },
}

impl CompileError {
    /// Diagnostics explaining the failure (empty for state errors).
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CompileError::Failed { diagnostics } => diagnostics,
            CompileError::InvalidState { .. } => &[],
        }
    }
}

fn first_error(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .find(|d| d.is_error())
        .map(|d| d.to_string())
        .unwrap_or_else(|| "no diagnostics".to_string())
}

/// Failures of the link and load stages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("undefined symbol: {name}")]
    UndefinedSymbol { name: String },

    #[error("symbol {name} is referenced as {expected} but registered as {found}")]
    TypeMismatch {
        name: String,
        expected: SymbolKind,
        found: SymbolKind,
    },

    #[error("{kind} relocation against {target} overflows (value {value:#x})")]
    RelocationOverflow {
        target: String,
        kind: RelocKind,
        value: i128,
    },

    #[error("malformed object: {reason}")]
    MalformedObject { reason: String },

    #[error("section {section} requires alignment {align}, larger than the page size")]
    Alignment { section: String, align: usize },

    #[error("memory operation failed: {reason}")]
    Memory { reason: String },

    #[error("session was compiled for object output and cannot be loaded")]
    NotExecutable,

    #[error("cannot link a session in state {state}")]
    InvalidState { state: SessionState },
}

impl From<region::Error> for LinkError {
    fn from(err: region::Error) -> Self {
        LinkError::Memory {
            reason: err.to_string(),
        }
    }
}

/// Failures of the execute stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("entry point not found: {name}")]
    EntryNotFound { name: String },

    #[error("cannot call {name}: {reason}")]
    TypeMismatch { name: String, reason: String },

    #[error("runtime fault in {name}: {reason}")]
    RuntimeFault { name: String, reason: String },

    #[error("session has been unloaded")]
    UseAfterUnload,

    #[error("session is not loaded (state {state})")]
    NotLoaded { state: SessionState },

    #[error("executing generated code is not supported on this host")]
    UnsupportedHost,
}

/// Lifecycle misuse that is not tied to a single stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("object emission failed: {reason}")]
    Emit { reason: String },
}

/// Any error produced by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
