// The x86-64 compile backend. It runs the C front end, lays out global data, generates every
// function into a single text section and packages the result as a CompiledObject. Data
// placement: globals without an initialiser go to .bss, const globals whose initialiser
// holds no addresses go to .rodata together with the string literals, and everything else
// goes to .data. Sections are only emitted when non-empty, except .text which always exists
// and is section 0. Addresses that code or data needs are first recorded against labels or
// section offsets and turned into object relocations once the text section is assembled:
// references to this unit's own functions and data become section-relative relocations, and
// anything else is left as an external name for the linker to resolve through the registry.
// Exported symbols carry their machine-level signature so the executor can marshal calls.

//! x86-64 compile backend.

use bumpalo::Bump;
use hashbrown::HashMap;

use super::encoder::{AssembledCode, X64Encoder};
use super::function_codegen::{
    function_labels, FunctionCodegen, PendingReloc, PendingTarget, UnitLayout,
};
use crate::cfront::{
    self,
    ast::{AddressTarget, InitItem, InitValue, TranslationUnit},
};
use crate::core::compiler::{
    CallingConvention, CompileBackend, CompileOptions, CompileOutput, WordSize,
};
use crate::core::diagnostic::{Diagnostic, Stage};
use crate::core::object::{
    CompiledObject, DefinedSymbol, RelocKind, RelocTarget, Relocation, Section, SectionId,
    SectionKind, Signature,
};
use crate::core::registry::SymbolKind;

const TEXT: SectionId = SectionId(0);
const TEXT_ALIGN: usize = 16;

/// Compiles the C subset to x86-64 System V machine code.
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Backend;

impl X64Backend {
    pub fn new() -> Self {
        Self
    }
}

impl CompileBackend for X64Backend {
    fn name(&self) -> &str {
        "x64"
    }

    fn compile(
        &self,
        source: &str,
        options: &CompileOptions,
    ) -> Result<CompileOutput, Vec<Diagnostic>> {
        if options.target_word_size != WordSize::W64 {
            return Err(vec![Diagnostic::error(
                Stage::Compile,
                format!(
                    "{}-bit targets are not supported by the x64 backend",
                    options.target_word_size.bits()
                ),
            )]);
        }
        if options.calling_convention != CallingConvention::SystemV {
            return Err(vec![Diagnostic::error(
                Stage::Compile,
                format!(
                    "calling convention '{}' is not supported by the x64 backend",
                    options.calling_convention
                ),
            )]);
        }

        let arena = Bump::new();
        let (unit, warnings) = cfront::parse_source(&arena, source, &options.defines)?;
        let object = ObjectBuilder::new(&unit).build(&arena).map_err(|d| vec![d])?;
        log::debug!(
            "x64 backend: {} sections, {} symbols, {} relocations, {} warnings",
            object.sections.len(),
            object.symbols.len(),
            object.relocation_count(),
            warnings.len()
        );
        Ok(CompileOutput { object, warnings })
    }
}

/// One data section being filled.
#[derive(Debug, Default)]
struct DataBuffer {
    bytes: Vec<u8>,
    size: usize,
    align: usize,
}

impl DataBuffer {
    fn reserve(&mut self, size: usize, align: usize) -> usize {
        let align = align.max(1);
        let offset = (self.size + align - 1) & !(align - 1);
        self.size = offset + size;
        self.align = self.align.max(align);
        offset
    }
}

/// An address stored into initialised data.
struct DataReloc<'a> {
    kind: SectionKind,
    offset: usize,
    target: AddressTarget<'a>,
    addend: i64,
}

struct ObjectBuilder<'u, 'a> {
    unit: &'u TranslationUnit<'a>,
    buffers: [DataBuffer; 3],
    /// Name to (section kind, offset).
    placements: HashMap<&'a str, (SectionKind, usize)>,
    strings: Vec<usize>,
    data_relocs: Vec<DataReloc<'a>>,
}

fn buffer_index(kind: SectionKind) -> usize {
    match kind {
        SectionKind::Data => 0,
        SectionKind::ReadOnlyData => 1,
        _ => 2,
    }
}

const DATA_KINDS: [SectionKind; 3] =
    [SectionKind::Data, SectionKind::ReadOnlyData, SectionKind::Bss];

fn write_item(bytes: &mut [u8], base: usize, item: &InitItem<'_>) {
    let at = base + item.offset;
    match &item.value {
        InitValue::Int { value, size } => {
            let size = (*size).min(8);
            bytes[at..at + size].copy_from_slice(&value.to_le_bytes()[..size]);
        }
        InitValue::Float(value) => {
            bytes[at..at + 8].copy_from_slice(&value.to_bits().to_le_bytes());
        }
        InitValue::Bytes(data) => bytes[at..at + data.len()].copy_from_slice(data),
        // Patched by a relocation.
        InitValue::Address { .. } => {}
    }
}

impl<'u, 'a> ObjectBuilder<'u, 'a> {
    fn new(unit: &'u TranslationUnit<'a>) -> Self {
        Self {
            unit,
            buffers: Default::default(),
            placements: HashMap::new(),
            strings: Vec::new(),
            data_relocs: Vec::new(),
        }
    }

    fn layout_data(&mut self) {
        for global in &self.unit.globals {
            let kind = match &global.init {
                None => SectionKind::Bss,
                Some(items) => {
                    let has_address = items
                        .iter()
                        .any(|i| matches!(i.value, InitValue::Address { .. }));
                    if global.is_const && !has_address {
                        SectionKind::ReadOnlyData
                    } else {
                        SectionKind::Data
                    }
                }
            };
            let buffer = &mut self.buffers[buffer_index(kind)];
            let offset = buffer.reserve(global.ty.size(), global.ty.align());
            if let Some(items) = &global.init {
                buffer.bytes.resize(buffer.size, 0);
                for item in items {
                    write_item(&mut buffer.bytes, offset, item);
                    if let InitValue::Address { target, addend } = item.value {
                        self.data_relocs.push(DataReloc {
                            kind,
                            offset: offset + item.offset,
                            target,
                            addend,
                        });
                    }
                }
            }
            self.placements.insert(global.name, (kind, offset));
        }

        let rodata = &mut self.buffers[buffer_index(SectionKind::ReadOnlyData)];
        for string in &self.unit.strings {
            let offset = rodata.reserve(string.len(), 1);
            rodata.bytes.resize(rodata.size, 0);
            rodata.bytes[offset..offset + string.len()].copy_from_slice(string);
            self.strings.push(offset);
        }
        for buffer in &mut self.buffers[..2] {
            buffer.bytes.resize(buffer.size, 0);
        }
    }

    /// Section ids of the non-empty data sections, text being section 0.
    fn section_ids(&self) -> HashMap<SectionKind, SectionId> {
        let mut ids = HashMap::new();
        let mut next = 1;
        for kind in DATA_KINDS {
            if self.buffers[buffer_index(kind)].size > 0 {
                ids.insert(kind, SectionId(next));
                next += 1;
            }
        }
        ids
    }

    fn build(mut self, arena: &Bump) -> Result<CompiledObject, Diagnostic> {
        self.layout_data();
        let ids = self.section_ids();
        let section_of = |kind: SectionKind| ids.get(&kind).copied().unwrap_or(TEXT);

        let internal = |e: super::encoder::EncodingError| {
            Diagnostic::error(Stage::Compile, format!("code generation failed: {e}"))
        };
        let mut encoder = X64Encoder::new().map_err(internal)?;
        let layout = UnitLayout {
            functions: function_labels(&mut encoder, self.unit),
            data: self
                .placements
                .iter()
                .map(|(name, (kind, offset))| (*name, (section_of(*kind), *offset)))
                .collect(),
            strings: self
                .strings
                .iter()
                .map(|offset| (section_of(SectionKind::ReadOnlyData), *offset))
                .collect(),
        };

        let mut pending = Vec::new();
        for function in &self.unit.functions {
            let entry = layout.functions[function.name];
            FunctionCodegen::new(arena, &mut encoder, &layout, &mut pending, function)
                .and_then(|codegen| codegen.generate(entry))
                .map_err(|e| {
                    Diagnostic::error(
                        Stage::Compile,
                        format!("code generation failed for '{}': {e}", function.name),
                    )
                    .at(function.loc)
                })?;
        }
        let code = encoder.finish().map_err(internal)?;

        let mut object = CompiledObject::new();
        let mut text = Section::new(SectionKind::Text, code.code.clone(), TEXT_ALIGN);
        for reloc in &pending {
            text.relocations.push(resolve_pending(&code, reloc)?);
        }
        object.add_section(text);

        for kind in DATA_KINDS {
            if !ids.contains_key(&kind) {
                continue;
            }
            let buffer = std::mem::take(&mut self.buffers[buffer_index(kind)]);
            let align = buffer.align.max(1);
            let mut section = if kind == SectionKind::Bss {
                Section::zeroed(buffer.size, align)
            } else {
                Section::new(kind, buffer.bytes, align)
            };
            for reloc in self.data_relocs.iter().filter(|r| r.kind == kind) {
                let (target, expected) = match reloc.target {
                    AddressTarget::Symbol(name) => {
                        (layout.global_target(name), self.expected_kind(name))
                    }
                    AddressTarget::Str(id) => (
                        PendingTarget::Section(
                            section_of(SectionKind::ReadOnlyData),
                            self.strings.get(id).copied().unwrap_or(0),
                        ),
                        None,
                    ),
                };
                let (target, base) = resolve_target(&code, target)?;
                section.relocations.push(Relocation {
                    offset: reloc.offset,
                    kind: RelocKind::Abs64,
                    addend: base + reloc.addend,
                    expected: match target {
                        RelocTarget::External(_) => expected,
                        RelocTarget::Section(_) => None,
                    },
                    target,
                });
            }
            object.add_section(section);
        }

        self.define_symbols(&mut object, &code, &layout, section_of);
        Ok(object)
    }

    fn expected_kind(&self, name: &str) -> Option<SymbolKind> {
        self.unit.symbol(name).map(|s| {
            if s.ty.is_function() {
                SymbolKind::Function
            } else {
                SymbolKind::Data
            }
        })
    }

    fn define_symbols(
        &self,
        object: &mut CompiledObject,
        code: &AssembledCode,
        layout: &UnitLayout<'a>,
        section_of: impl Fn(SectionKind) -> SectionId,
    ) {
        let mut starts: Vec<(usize, &str)> = self
            .unit
            .functions
            .iter()
            .filter_map(|f| {
                let label = layout.functions.get(f.name)?;
                Some((code.label_offset(*label)?, f.name))
            })
            .collect();
        starts.sort_unstable();

        for function in &self.unit.functions {
            let Some(offset) = layout
                .functions
                .get(function.name)
                .and_then(|label| code.label_offset(*label))
            else {
                continue;
            };
            let end = starts
                .iter()
                .map(|(start, _)| *start)
                .find(|start| *start > offset)
                .unwrap_or(code.code.len());
            let signature = function.signature;
            object.define(DefinedSymbol {
                name: function.name.to_string(),
                kind: SymbolKind::Function,
                section: TEXT,
                offset,
                size: end - offset,
                global: !function.is_static,
                signature: Some(Signature {
                    params: signature
                        .params
                        .iter()
                        .filter_map(|p| p.value_kind())
                        .collect(),
                    ret: signature.ret.value_kind(),
                    variadic: signature.variadic,
                }),
            });
        }

        for global in &self.unit.globals {
            let Some((kind, offset)) = self.placements.get(global.name) else {
                continue;
            };
            object.define(DefinedSymbol {
                name: global.name.to_string(),
                kind: SymbolKind::Data,
                section: section_of(*kind),
                offset: *offset,
                size: global.ty.size(),
                global: !global.is_static,
                signature: None,
            });
        }
    }
}

/// Final relocation target and the addend contributed by the target itself.
fn resolve_target(
    code: &AssembledCode,
    target: PendingTarget,
) -> Result<(RelocTarget, i64), Diagnostic> {
    Ok(match target {
        PendingTarget::Label(label) => {
            let offset = code.label_offset(label).ok_or_else(|| {
                Diagnostic::error(Stage::Compile, "function label was never placed")
            })?;
            (RelocTarget::Section(TEXT), offset as i64)
        }
        PendingTarget::Section(section, offset) => (RelocTarget::Section(section), offset as i64),
        PendingTarget::External(name) => (RelocTarget::External(name), 0),
    })
}

fn resolve_pending(code: &AssembledCode, reloc: &PendingReloc) -> Result<Relocation, Diagnostic> {
    let offset = code.site_offset(reloc.site).ok_or_else(|| {
        Diagnostic::error(Stage::Compile, "relocation site was not assembled")
    })?;
    let (target, base) = resolve_target(code, reloc.target.clone())?;
    Ok(Relocation {
        offset,
        kind: reloc.kind,
        target,
        addend: base + reloc.addend,
        expected: reloc.expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> CompiledObject {
        X64Backend::new()
            .compile(src, &CompileOptions::default())
            .unwrap()
            .object
    }

    #[test]
    fn test_sections_and_symbols() {
        let object = compile(
            "int counter = 5;\nconst int limit = 10;\nint scratch[4];\nstatic int hidden;\n\
             int get(void) { return counter + limit + scratch[0] + hidden; }",
        );
        let kinds: Vec<_> = object.sections.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SectionKind::Text,
                SectionKind::Data,
                SectionKind::ReadOnlyData,
                SectionKind::Bss
            ]
        );
        assert_eq!(object.sections[1].data, 5i32.to_le_bytes());
        assert_eq!(object.sections[2].data, 10i32.to_le_bytes());
        assert_eq!(object.sections[3].size, 20);
        assert!(object.global("get").is_some());
        assert!(object.global("hidden").is_none());
        assert!(object.symbols.iter().any(|s| s.name == "hidden" && !s.global));
        assert!(object.undefined_names().is_empty());
        object.validate().unwrap();
    }

    #[test]
    fn test_signatures_exported() {
        use crate::core::object::ValueKind;
        let object = compile("double scale(double x, long n) { return x * n; }");
        let signature = object.global("scale").unwrap().signature.clone().unwrap();
        assert_eq!(signature.params, vec![ValueKind::F64, ValueKind::I64]);
        assert_eq!(signature.ret, Some(ValueKind::F64));
    }

    #[test]
    fn test_external_references() {
        let object = compile(
            "extern int add(int, int);\nextern const char hello[];\n\
             const char *greeting = hello;\nint f(void) { return add(hello[0], 1); }",
        );
        assert_eq!(object.undefined_names(), vec!["hello", "add"]);
        let data = &object.sections[1];
        assert_eq!(data.kind, SectionKind::Data);
        assert_eq!(data.relocations.len(), 1);
        assert_eq!(data.relocations[0].target, RelocTarget::External("hello".into()));
        assert_eq!(data.relocations[0].expected, Some(SymbolKind::Data));
    }

    #[test]
    fn test_string_literals_in_rodata() {
        let object = compile("const char *name(void) { return \"cscript\"; }");
        let rodata = object
            .sections
            .iter()
            .find(|s| s.kind == SectionKind::ReadOnlyData)
            .unwrap();
        assert_eq!(rodata.data, b"cscript\0");
        let text = &object.sections[0];
        assert_eq!(text.relocations.len(), 1);
        assert_eq!(text.relocations[0].kind, RelocKind::Abs64);
        assert!(matches!(text.relocations[0].target, RelocTarget::Section(_)));
    }

    #[test]
    fn test_function_pointer_to_own_function() {
        let object = compile(
            "static int inc(int x) { return x + 1; }\nint (*hook)(int) = inc;\n\
             int call(void) { return hook(1); }",
        );
        let data = &object.sections[1];
        assert_eq!(data.relocations[0].target, RelocTarget::Section(TEXT));
        assert_eq!(
            data.relocations[0].addend as usize,
            object.symbols.iter().find(|s| s.name == "inc").unwrap().offset
        );
    }

    #[test]
    fn test_unsupported_target_rejected() {
        let options = CompileOptions {
            target_word_size: WordSize::W32,
            ..CompileOptions::default()
        };
        let errors = X64Backend::new().compile("int x;", &options).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, Stage::Compile);
    }

    #[test]
    fn test_parse_errors_returned() {
        let errors = X64Backend::new()
            .compile("int f( { }", &CompileOptions::default())
            .unwrap_err();
        assert!(errors.iter().all(|e| e.is_error()));
        assert!(errors[0].location.is_some());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let src = "int ok(void) { return 1; }\nint f(void) { char a[2000000000]; char b[2000000000]; return a[0] + b[0]; }";
        let errors = X64Backend::new()
            .compile(src, &CompileOptions::default())
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, Stage::Compile);
        assert!(errors[0].message.contains("'f'"));
        assert!(errors[0].message.contains("stack frame exceeds"));
        assert_eq!(errors[0].location.map(|l| l.line), Some(2));

        let object = compile("int f(void) { char a[2000000000]; return a[0]; }");
        assert!(object.symbols.iter().any(|s| s.name == "f"));
    }
}
