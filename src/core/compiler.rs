// This module defines the seam between a Session and whatever turns source text into a
// CompiledObject. A CompileBackend receives the source and the CompileOptions and either
// returns an object (plus any warnings it produced) or the list of diagnostics explaining why
// it could not. The session never looks inside the backend; it only relies on the object's
// relocations naming symbols the registry can resolve and on exported symbols carrying their
// kind. CompileOptions is the configuration surface for a compile: target word size, calling
// convention, output kind and object-like preprocessor defines.

//! Compile backend interface and options.

use std::fmt;

use super::diagnostic::Diagnostic;
use super::object::CompiledObject;

/// Pointer width of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordSize {
    W32,
    W64,
}

impl WordSize {
    pub fn bits(self) -> u32 {
        match self {
            WordSize::W32 => 32,
            WordSize::W64 => 64,
        }
    }
}

/// Calling convention used for generated functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    SystemV,
    Win64,
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::SystemV => f.write_str("sysv"),
            CallingConvention::Win64 => f.write_str("win64"),
        }
    }
}

/// What the compiled object is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Linked and loaded into this process.
    InMemoryExecutable,
    /// Relocatable object only; the session refuses to load it.
    Object,
}

/// Options for one compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub target_word_size: WordSize,
    pub calling_convention: CallingConvention,
    pub output_kind: OutputKind,
    /// Object-like macros, as if given with `-DNAME=VALUE`.
    pub defines: Vec<(String, String)>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target_word_size: WordSize::W64,
            calling_convention: CallingConvention::SystemV,
            output_kind: OutputKind::InMemoryExecutable,
            defines: Vec::new(),
        }
    }
}

impl CompileOptions {
    /// Add a macro definition.
    pub fn define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    pub fn with_output_kind(mut self, output_kind: OutputKind) -> Self {
        self.output_kind = output_kind;
        self
    }
}

/// Successful backend result.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub object: CompiledObject,
    /// Non-fatal diagnostics.
    pub warnings: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn new(object: CompiledObject) -> Self {
        Self {
            object,
            warnings: Vec::new(),
        }
    }
}

/// Turns source text into a relocatable object.
///
/// On failure the returned list holds at least one error diagnostic.
pub trait CompileBackend {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn compile(&self, source: &str, options: &CompileOptions) -> Result<CompileOutput, Vec<Diagnostic>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CompileOptions::default();
        assert_eq!(options.target_word_size.bits(), 64);
        assert_eq!(options.calling_convention, CallingConvention::SystemV);
        assert_eq!(options.output_kind, OutputKind::InMemoryExecutable);
        assert!(options.defines.is_empty());
    }

    #[test]
    fn test_define_builder() {
        let options = CompileOptions::default()
            .define("N", "10")
            .with_output_kind(OutputKind::Object);
        assert_eq!(options.defines, vec![("N".to_string(), "10".to_string())]);
        assert_eq!(options.output_kind, OutputKind::Object);
    }
}
