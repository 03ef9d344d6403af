// This module provides the Session, which drives one compile, link, load and execute cycle
// and owns everything that cycle produces: the CompiledObject, the loaded image with its
// MemoryRegions, the accumulated diagnostics and the statistics. The Session borrows the
// Registry for its whole lifetime, so the borrow checker guarantees the registry outlives
// any code linked against it. State moves strictly forward through Created, Compiled, Linked
// and Loaded; a compile or link failure parks the session in a terminal Failed state, and
// unloading (explicitly or on drop) releases the memory and makes further execution fail
// with UseAfterUnload. A session that failed to link can hand its object back through
// `take_object` so a fresh session can retry once the registry has been fixed.

//! Compile-and-execute sessions.
//!
//! ```ignore
//! use cscript::{CompileOptions, Registry, Session, Value};
//!
//! let registry = Registry::new(false);
//! let mut session = Session::new(&registry);
//! session.compile("int twice(int x) { return x * 2; }", &CompileOptions::default())?;
//! session.link_and_load()?;
//! assert_eq!(session.execute("twice", &[Value::Int(21)])?, Value::Int(42));
//! ```

use std::fmt;

use super::assembler::emit_elf;
use super::compiler::{CompileBackend, CompileOptions, OutputKind};
use super::diagnostic::{Diagnostic, Stage};
use super::error::{CompileError, ExecuteError, LinkError, SessionError};
use super::executor::{self, Value};
use super::linker::{self, LoadedImage};
use super::memory::MemoryRegion;
use super::object::{CompiledObject, SectionKind};
use super::registry::{Registry, SymbolKind};
use crate::x64::X64Backend;

/// Lifecycle position of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Compiled,
    /// Relocated but not yet sealed; only observable if loading fails midway.
    Linked,
    Loaded,
    Unloaded,
    /// Terminal failure at the given stage.
    Failed(Stage),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => f.write_str("created"),
            SessionState::Compiled => f.write_str("compiled"),
            SessionState::Linked => f.write_str("linked"),
            SessionState::Loaded => f.write_str("loaded"),
            SessionState::Unloaded => f.write_str("unloaded"),
            SessionState::Failed(stage) => write!(f, "failed ({stage})"),
        }
    }
}

/// Statistics for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Function symbols defined by the object.
    pub functions_compiled: usize,

    /// Data symbols defined by the object.
    pub data_symbols: usize,

    /// Bytes of code.
    pub total_code_size: usize,

    /// Bytes of initialised and zero-filled data.
    pub total_data_size: usize,

    pub largest_function_size: usize,
    pub largest_function_name: String,

    /// Relocation records in the object.
    pub relocations: usize,

    /// Relocations actually patched by the linker.
    pub relocations_applied: usize,

    /// Registry symbols the link depended on.
    pub externals_resolved: usize,

    /// Jump stubs emitted for external calls.
    pub stubs: usize,

    /// Successful entry point calls.
    pub executions: usize,
}

impl SessionStats {
    fn record_object(&mut self, object: &CompiledObject) {
        for section in &object.sections {
            match section.kind {
                SectionKind::Text => {
                    self.total_code_size = self.total_code_size.saturating_add(section.size)
                }
                _ => self.total_data_size = self.total_data_size.saturating_add(section.size),
            }
        }
        for symbol in &object.symbols {
            match symbol.kind {
                SymbolKind::Function => {
                    self.functions_compiled += 1;
                    if symbol.size > self.largest_function_size {
                        self.largest_function_size = symbol.size;
                        self.largest_function_name = symbol.name.clone();
                    }
                }
                SymbolKind::Data => self.data_symbols += 1,
            }
        }
        self.relocations = object.relocation_count();
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Data symbols: {}", self.data_symbols)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Total data size: {} bytes", self.total_data_size)?;
        writeln!(
            f,
            "  Relocations: {} ({} applied)",
            self.relocations, self.relocations_applied
        )?;
        writeln!(f, "  Externals resolved: {}", self.externals_resolved)?;
        writeln!(f, "  Jump stubs: {}", self.stubs)?;
        writeln!(f, "  Executions: {}", self.executions)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        Ok(())
    }
}

/// One compile, link, load and execute lifecycle.
pub struct Session<'r> {
    registry: &'r Registry,
    backend: Box<dyn CompileBackend + 'r>,
    state: SessionState,
    output_kind: OutputKind,
    object: Option<CompiledObject>,
    image: Option<LoadedImage>,
    diagnostics: Vec<Diagnostic>,
    stats: SessionStats,
}

impl<'r> Session<'r> {
    /// Create a session using the built-in x86-64 backend.
    pub fn new(registry: &'r Registry) -> Self {
        Self::with_backend(registry, X64Backend::new())
    }

    /// Create a session driving a custom compile backend.
    pub fn with_backend(registry: &'r Registry, backend: impl CompileBackend + 'r) -> Self {
        Self {
            registry,
            backend: Box::new(backend),
            state: SessionState::Created,
            output_kind: OutputKind::InMemoryExecutable,
            object: None,
            image: None,
            diagnostics: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    /// Diagnostics accumulated across all stages so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The compiled object, if the session still owns one.
    pub fn object(&self) -> Option<&CompiledObject> {
        self.object.as_ref()
    }

    /// Compile `source` with the session's backend.
    pub fn compile(&mut self, source: &str, options: &CompileOptions) -> Result<(), CompileError> {
        if self.state != SessionState::Created {
            return Err(CompileError::InvalidState { state: self.state });
        }

        log::debug!(
            "compiling {} bytes of source with {} backend",
            source.len(),
            self.backend.name()
        );
        match self.backend.compile(source, options) {
            Ok(output) => {
                for warning in &output.warnings {
                    log::warn!("{warning}");
                }
                self.diagnostics.extend(output.warnings);
                self.output_kind = options.output_kind;
                self.accept(output.object);
                Ok(())
            }
            Err(diagnostics) => {
                log::debug!("compile failed with {} diagnostic(s)", diagnostics.len());
                self.diagnostics.extend(diagnostics.iter().cloned());
                self.state = SessionState::Failed(Stage::Compile);
                Err(CompileError::Failed { diagnostics })
            }
        }
    }

    /// Take a ready-made object instead of compiling source.
    pub fn adopt(&mut self, object: CompiledObject) -> Result<(), SessionError> {
        if self.state != SessionState::Created {
            return Err(SessionError::InvalidState {
                operation: "adopt an object",
                state: self.state,
            });
        }
        self.output_kind = OutputKind::InMemoryExecutable;
        self.accept(object);
        Ok(())
    }

    fn accept(&mut self, object: CompiledObject) {
        self.stats.record_object(&object);
        log::debug!(
            "session compiled: {} functions, {} bytes of code, {} relocations",
            self.stats.functions_compiled,
            self.stats.total_code_size,
            self.stats.relocations
        );
        self.object = Some(object);
        self.state = SessionState::Compiled;
    }

    /// Resolve, relocate and commit the compiled object.
    ///
    /// Nothing is left allocated if this fails, and the session becomes
    /// `Failed(Link)`.
    pub fn link_and_load(&mut self) -> Result<(), LinkError> {
        if self.state != SessionState::Compiled {
            return Err(LinkError::InvalidState { state: self.state });
        }
        if self.output_kind == OutputKind::Object {
            return Err(LinkError::NotExecutable);
        }
        let Some(object) = self.object.as_ref() else {
            return Err(LinkError::InvalidState { state: self.state });
        };

        let reported = self.diagnostics.len();
        let result = linker::link(object, self.registry, &mut self.diagnostics).and_then(|linked| {
            self.state = SessionState::Linked;
            linked.load()
        });

        match result {
            Ok(image) => {
                let link = image.stats();
                self.stats.relocations_applied = link.relocations_applied;
                self.stats.externals_resolved = link.externals_resolved;
                self.stats.stubs = link.stubs;
                self.image = Some(image);
                self.state = SessionState::Loaded;
                Ok(())
            }
            Err(err) => {
                if self.diagnostics.len() == reported {
                    self.diagnostics
                        .push(Diagnostic::error(Stage::Link, err.to_string()));
                }
                log::debug!("link failed: {err}");
                self.state = SessionState::Failed(Stage::Link);
                Err(err)
            }
        }
    }

    /// Call the exported function `entry` with `args`.
    ///
    /// Does not change the session state; a loaded session may be executed
    /// any number of times.
    pub fn execute(&mut self, entry: &str, args: &[Value]) -> Result<Value, ExecuteError> {
        let image = match (self.state, self.image.as_ref()) {
            (SessionState::Loaded, Some(image)) => image,
            (SessionState::Unloaded, _) => return Err(ExecuteError::UseAfterUnload),
            (state, _) => return Err(ExecuteError::NotLoaded { state }),
        };

        match executor::execute(image, entry, args) {
            Ok(value) => {
                self.stats.executions += 1;
                Ok(value)
            }
            Err(err) => {
                self.diagnostics
                    .push(Diagnostic::error(Stage::Execute, err.to_string()));
                Err(err)
            }
        }
    }

    /// Release all memory regions.
    ///
    /// A session with nothing loaded is left as it is, so unloading twice
    /// or before loading is a no-op. The compiled object is kept so it can
    /// still be emitted or taken.
    pub fn unload(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Loaded {
            self.image = None;
            self.state = SessionState::Unloaded;
            log::debug!("session unloaded");
        }
        Ok(())
    }

    /// Address of a loaded global symbol.
    pub fn symbol_address(&self, name: &str) -> Option<usize> {
        self.image.as_ref()?.symbol(name).map(|s| s.address)
    }

    /// Memory regions committed by the last successful load.
    pub fn regions(&self) -> &[MemoryRegion] {
        self.image.as_ref().map_or(&[], |image| image.regions())
    }

    /// Give up the compiled object of a failed or unloaded session.
    pub fn take_object(&mut self) -> Result<CompiledObject, SessionError> {
        match self.state {
            SessionState::Failed(Stage::Link) | SessionState::Unloaded => {
                self.object.take().ok_or(SessionError::InvalidState {
                    operation: "take the object",
                    state: self.state,
                })
            }
            state => Err(SessionError::InvalidState {
                operation: "take the object",
                state,
            }),
        }
    }

    /// Serialize the compiled object as an ELF relocatable object.
    pub fn emit_object(&self) -> Result<Vec<u8>, SessionError> {
        let object = self.object.as_ref().ok_or(SessionError::InvalidState {
            operation: "emit an object",
            state: self.state,
        })?;
        emit_elf(object)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.image.is_some() {
            log::debug!("unloading session on drop");
        }
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("diagnostics", &self.diagnostics.len())
            .field("regions", &self.regions().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::{Section, ValueKind};
    use crate::core::test_utils::test::{add_args, ret_imm32, text_object, typed_text_object, FixedBackend};

    #[test]
    fn test_adopt_link_execute() {
        let registry = Registry::default();
        let mut session = Session::new(&registry);
        session.adopt(text_object("answer", ret_imm32(42))).unwrap();
        assert_eq!(session.state(), SessionState::Compiled);

        session.link_and_load().unwrap();
        assert_eq!(session.state(), SessionState::Loaded);
        assert_eq!(session.execute("answer", &[]).unwrap(), Value::Int(42));
        assert_eq!(session.execute("answer", &[]).unwrap(), Value::Int(42));
        assert_eq!(session.stats().executions, 2);
    }

    #[test]
    fn test_typed_entry() {
        let registry = Registry::default();
        let mut session = Session::new(&registry);
        session
            .adopt(typed_text_object("add", add_args(), vec![ValueKind::I32, ValueKind::I32]))
            .unwrap();
        session.link_and_load().unwrap();

        let result = session.execute("add", &[Value::Int(-3), Value::Int(1)]).unwrap();
        assert_eq!(result, Value::Int(-2));

        let err = session.execute("add", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, ExecuteError::TypeMismatch { .. }));
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[test]
    fn test_execute_before_load() {
        let registry = Registry::default();
        let mut session = Session::new(&registry);
        let err = session.execute("f", &[]).unwrap_err();
        assert_eq!(
            err,
            ExecuteError::NotLoaded {
                state: SessionState::Created
            }
        );
    }

    #[test]
    fn test_unload_then_execute() {
        let registry = Registry::default();
        let mut session = Session::new(&registry);
        session.adopt(text_object("f", ret_imm32(1))).unwrap();
        session.link_and_load().unwrap();
        assert!(!session.regions().is_empty());

        session.unload().unwrap();
        session.unload().unwrap();
        assert!(session.regions().is_empty());
        assert_eq!(session.execute("f", &[]), Err(ExecuteError::UseAfterUnload));
        assert!(session.emit_object().is_ok());
    }

    #[test]
    fn test_unload_without_image_is_noop() {
        let registry = Registry::default();
        let mut session = Session::new(&registry);
        session.unload().unwrap();
        assert_eq!(session.state(), SessionState::Created);

        session.adopt(text_object("f", ret_imm32(1))).unwrap();
        session.unload().unwrap();
        assert_eq!(session.state(), SessionState::Compiled);
        session.link_and_load().unwrap();
        assert_eq!(session.execute("f", &[]).unwrap(), Value::Int(1));

        let mut failed = Session::with_backend(&registry, FixedBackend::failing("bad token"));
        assert!(failed.compile("", &CompileOptions::default()).is_err());
        failed.unload().unwrap();
        assert_eq!(failed.state(), SessionState::Failed(Stage::Compile));
    }

    #[test]
    fn test_oversized_sections_rejected() {
        let registry = Registry::default();
        let mut object = text_object("f", ret_imm32(1));
        object.add_section(Section::zeroed(16, 16));
        object.add_section(Section::zeroed(usize::MAX - 4, 16));

        let mut session = Session::new(&registry);
        session.adopt(object).unwrap();
        assert_eq!(session.stats().total_data_size, usize::MAX);

        let err = session.link_and_load().unwrap_err();
        assert!(matches!(err, LinkError::MalformedObject { .. }));
        assert_eq!(session.state(), SessionState::Failed(Stage::Link));
        assert!(session.regions().is_empty());
        assert_eq!(session.diagnostics().last().unwrap().stage, Stage::Link);
    }

    #[test]
    fn test_missing_entry() {
        let registry = Registry::default();
        let mut session = Session::new(&registry);
        session.adopt(text_object("f", ret_imm32(1))).unwrap();
        session.link_and_load().unwrap();

        let err = session.execute("g", &[]).unwrap_err();
        assert_eq!(err, ExecuteError::EntryNotFound { name: "g".into() });
        assert_eq!(session.diagnostics().last().unwrap().stage, Stage::Execute);
    }

    #[test]
    fn test_compile_twice_rejected() {
        let registry = Registry::default();
        let backend = FixedBackend::new(text_object("f", ret_imm32(1)));
        let mut session = Session::with_backend(&registry, backend);
        let options = CompileOptions::default();
        session.compile("", &options).unwrap();
        assert!(matches!(
            session.compile("", &options),
            Err(CompileError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_object_output_cannot_load() {
        let registry = Registry::default();
        let backend = FixedBackend::new(text_object("f", ret_imm32(1)));
        let mut session = Session::with_backend(&registry, backend);
        let options = CompileOptions::default().with_output_kind(OutputKind::Object);
        session.compile("", &options).unwrap();

        assert_eq!(session.link_and_load(), Err(LinkError::NotExecutable));
        assert_eq!(session.state(), SessionState::Compiled);
        assert!(session.emit_object().is_ok());
    }

    #[test]
    fn test_failed_compile_is_terminal() {
        let registry = Registry::default();
        let mut session = Session::with_backend(&registry, FixedBackend::failing("bad token"));
        let err = session.compile("", &CompileOptions::default()).unwrap_err();
        assert_eq!(err.diagnostics().len(), 1);
        assert_eq!(session.state(), SessionState::Failed(Stage::Compile));
        assert!(matches!(
            session.link_and_load(),
            Err(LinkError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Loaded.to_string(), "loaded");
        assert_eq!(SessionState::Failed(Stage::Link).to_string(), "failed (link)");
    }
}
