// The in-memory relocatable object handed from a compile backend to the linker. A
// CompiledObject is an ordered list of sections (text, data, read-only data, zero-filled
// data), each with its bytes, alignment and relocation list, plus the symbols the object
// defines. Relocations name their target either as a section of this object (plus addend)
// or as an external symbol to be resolved through the registry, and carry an enumerated
// encoding tag instead of raw pointer arithmetic. `validate` bounds-checks every byte range
// up front so the linker can patch through checked slices only.

//! Relocatable object representation.

use std::fmt;

use super::error::LinkError;
use super::registry::SymbolKind;

/// Section classification; decides the memory block and final permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    Text,
    Data,
    ReadOnlyData,
    /// Zero-filled data; carries a size but no bytes.
    Bss,
}

impl SectionKind {
    pub const ALL: [SectionKind; 4] = [
        SectionKind::Text,
        SectionKind::Data,
        SectionKind::ReadOnlyData,
        SectionKind::Bss,
    ];

    pub fn default_name(self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::Data => ".data",
            SectionKind::ReadOnlyData => ".rodata",
            SectionKind::Bss => ".bss",
        }
    }
}

/// Index of a section within its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub usize);

/// How a relocation patches its site.
///
/// `S` is the resolved target address, `A` the addend, `P` the address of
/// the patched bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// 8 bytes: `S + A`.
    Abs64,
    /// 4 bytes: `S + A`, must fit in `u32`.
    Abs32,
    /// 4 bytes: `S + A - P`, must fit in `i32`.
    Pc32,
    /// 4 bytes: `S + A - P` for a call or jump; external targets go
    /// through a linker stub.
    Branch32,
}

impl RelocKind {
    /// Width of the patched field in bytes.
    pub fn width(self) -> usize {
        match self {
            RelocKind::Abs64 => 8,
            RelocKind::Abs32 | RelocKind::Pc32 | RelocKind::Branch32 => 4,
        }
    }
}

impl fmt::Display for RelocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelocKind::Abs64 => "abs64",
            RelocKind::Abs32 => "abs32",
            RelocKind::Pc32 => "pc32",
            RelocKind::Branch32 => "branch32",
        };
        f.write_str(name)
    }
}

/// What a relocation points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelocTarget {
    /// Start of a section in the same object.
    Section(SectionId),
    /// A symbol resolved by name at link time.
    External(String),
}

impl fmt::Display for RelocTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocTarget::Section(id) => write!(f, "section #{}", id.0),
            RelocTarget::External(name) => f.write_str(name),
        }
    }
}

/// A patch to apply once addresses are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the patched field within its section.
    pub offset: usize,
    pub kind: RelocKind,
    pub target: RelocTarget,
    pub addend: i64,
    /// Kind the referencing code expects, when the backend knows it.
    pub expected: Option<SymbolKind>,
}

/// Machine-level class of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Ptr,
    F64,
}

impl ValueKind {
    pub fn is_float(self) -> bool {
        self == ValueKind::F64
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::I8 => "i8",
            ValueKind::I16 => "i16",
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::U8 => "u8",
            ValueKind::U16 => "u16",
            ValueKind::U32 => "u32",
            ValueKind::U64 => "u64",
            ValueKind::Ptr => "ptr",
            ValueKind::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Calling signature of an exported function.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<ValueKind>,
    /// `None` for `void`.
    pub ret: Option<ValueKind>,
    pub variadic: bool,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        if self.variadic {
            f.write_str(if self.params.is_empty() { "..." } else { ", ..." })?;
        }
        match self.ret {
            Some(ret) => write!(f, ") -> {ret}"),
            None => f.write_str(") -> void"),
        }
    }
}

/// A symbol defined by the object itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub section: SectionId,
    pub offset: usize,
    pub size: usize,
    /// Global symbols are visible to the executor and satisfy external
    /// references; local ones (`static`) are not.
    pub global: bool,
    pub signature: Option<Signature>,
}

/// One section of a compiled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    /// Contents; empty for [`SectionKind::Bss`].
    pub data: Vec<u8>,
    /// Size in bytes; equals `data.len()` except for zero-filled sections.
    pub size: usize,
    pub align: usize,
    pub relocations: Vec<Relocation>,
}

impl Section {
    /// Create a section holding `data`.
    pub fn new(kind: SectionKind, data: Vec<u8>, align: usize) -> Self {
        Self {
            name: kind.default_name().to_string(),
            kind,
            size: data.len(),
            data,
            align,
            relocations: Vec::new(),
        }
    }

    /// Create a zero-filled section of `size` bytes.
    pub fn zeroed(size: usize, align: usize) -> Self {
        Self {
            name: SectionKind::Bss.default_name().to_string(),
            kind: SectionKind::Bss,
            data: Vec::new(),
            size,
            align,
            relocations: Vec::new(),
        }
    }
}

/// Output of a compile backend: sections plus the symbols they define.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledObject {
    pub sections: Vec<Section>,
    pub symbols: Vec<DefinedSymbol>,
}

impl CompiledObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section and return its id.
    pub fn add_section(&mut self, section: Section) -> SectionId {
        self.sections.push(section);
        SectionId(self.sections.len() - 1)
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(id.0)
    }

    pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.get_mut(id.0)
    }

    /// Record a symbol definition.
    pub fn define(&mut self, symbol: DefinedSymbol) {
        self.symbols.push(symbol);
    }

    /// Find a defined global symbol.
    pub fn global(&self, name: &str) -> Option<&DefinedSymbol> {
        self.symbols.iter().find(|s| s.global && s.name == name)
    }

    /// External names referenced by relocations, in first-use order, that
    /// the object does not define itself.
    pub fn undefined_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for section in &self.sections {
            for reloc in &section.relocations {
                if let RelocTarget::External(name) = &reloc.target {
                    if self.global(name).is_none() && !names.contains(&name.as_str()) {
                        names.push(name.as_str());
                    }
                }
            }
        }
        names
    }

    /// Total number of relocation records.
    pub fn relocation_count(&self) -> usize {
        self.sections.iter().map(|s| s.relocations.len()).sum()
    }

    /// Bounds-check every section, symbol and relocation.
    pub fn validate(&self) -> Result<(), LinkError> {
        let mut extents = [0usize; SectionKind::ALL.len()];
        for (index, section) in self.sections.iter().enumerate() {
            if section.align == 0 || !section.align.is_power_of_two() {
                return Err(malformed(format!(
                    "section {} has invalid alignment {}",
                    section.name, section.align
                )));
            }
            let extent = &mut extents[section.kind as usize];
            *extent = extent
                .checked_add(section.align - 1)
                .map(|offset| offset & !(section.align - 1))
                .and_then(|offset| offset.checked_add(section.size))
                .filter(|end| *end <= MAX_SECTION_EXTENT)
                .ok_or_else(|| {
                    malformed(format!(
                        "{} sections exceed {MAX_SECTION_EXTENT} bytes at {} (size {})",
                        section.kind.default_name(),
                        section.name,
                        section.size
                    ))
                })?;
            match section.kind {
                SectionKind::Bss => {
                    if !section.data.is_empty() {
                        return Err(malformed(format!(
                            "zero-filled section {} carries bytes",
                            section.name
                        )));
                    }
                    if !section.relocations.is_empty() {
                        return Err(malformed(format!(
                            "zero-filled section {} carries relocations",
                            section.name
                        )));
                    }
                }
                _ => {
                    if section.size != section.data.len() {
                        return Err(malformed(format!(
                            "section {} size {} does not match its {} bytes",
                            section.name,
                            section.size,
                            section.data.len()
                        )));
                    }
                }
            }

            for reloc in &section.relocations {
                let end = reloc.offset.checked_add(reloc.kind.width());
                if end.map_or(true, |end| end > section.data.len()) {
                    return Err(malformed(format!(
                        "{} relocation at {:#x} lies outside section {} (#{index})",
                        reloc.kind, reloc.offset, section.name
                    )));
                }
                if let RelocTarget::Section(target) = reloc.target {
                    if self.section(target).is_none() {
                        return Err(malformed(format!(
                            "relocation in {} targets missing section #{}",
                            section.name, target.0
                        )));
                    }
                }
            }
        }

        for symbol in &self.symbols {
            let section = self.section(symbol.section).ok_or_else(|| {
                malformed(format!(
                    "symbol {} lives in missing section #{}",
                    symbol.name, symbol.section.0
                ))
            })?;
            let end = symbol.offset.checked_add(symbol.size);
            if end.map_or(true, |end| end > section.size) {
                return Err(malformed(format!(
                    "symbol {} extends past the end of {}",
                    symbol.name, section.name
                )));
            }
            if symbol.kind == SymbolKind::Function && section.kind != SectionKind::Text {
                return Err(malformed(format!(
                    "function {} is not defined in a code section",
                    symbol.name
                )));
            }
        }

        let mut names: Vec<&str> = self
            .symbols
            .iter()
            .filter(|s| s.global)
            .map(|s| s.name.as_str())
            .collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(malformed(format!("symbol {} is defined twice", pair[0])));
        }

        Ok(())
    }
}

/// Largest combined size of one kind of section.
pub const MAX_SECTION_EXTENT: usize = isize::MAX as usize / 2;

fn malformed(reason: String) -> LinkError {
    LinkError::MalformedObject { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_with_reloc(offset: usize, kind: RelocKind) -> CompiledObject {
        let mut object = CompiledObject::new();
        let mut text = Section::new(SectionKind::Text, vec![0x90; 8], 16);
        text.relocations.push(Relocation {
            offset,
            kind,
            target: RelocTarget::External("ext".into()),
            addend: 0,
            expected: None,
        });
        object.add_section(text);
        object
    }

    #[test]
    fn test_relocation_in_bounds() {
        assert!(text_with_reloc(0, RelocKind::Abs64).validate().is_ok());
        assert!(text_with_reloc(4, RelocKind::Pc32).validate().is_ok());
    }

    #[test]
    fn test_relocation_out_of_bounds() {
        let err = text_with_reloc(4, RelocKind::Abs64).validate().unwrap_err();
        assert!(matches!(err, LinkError::MalformedObject { .. }));

        let err = text_with_reloc(usize::MAX - 1, RelocKind::Pc32)
            .validate()
            .unwrap_err();
        assert!(matches!(err, LinkError::MalformedObject { .. }));
    }

    #[test]
    fn test_undefined_names_skip_own_globals() {
        let mut object = text_with_reloc(0, RelocKind::Branch32);
        object.sections[0].relocations.push(Relocation {
            offset: 4,
            kind: RelocKind::Pc32,
            target: RelocTarget::External("own".into()),
            addend: 0,
            expected: None,
        });
        object.define(DefinedSymbol {
            name: "own".into(),
            kind: SymbolKind::Function,
            section: SectionId(0),
            offset: 0,
            size: 8,
            global: true,
            signature: None,
        });

        assert_eq!(object.undefined_names(), vec!["ext"]);
        assert_eq!(object.relocation_count(), 2);
    }

    #[test]
    fn test_symbol_outside_section_rejected() {
        let mut object = CompiledObject::new();
        let id = object.add_section(Section::zeroed(4, 8));
        object.define(DefinedSymbol {
            name: "buf".into(),
            kind: SymbolKind::Data,
            section: id,
            offset: 2,
            size: 4,
            global: true,
            signature: None,
        });
        assert!(matches!(
            object.validate(),
            Err(LinkError::MalformedObject { .. })
        ));
    }

    #[test]
    fn test_duplicate_global_rejected() {
        let mut object = CompiledObject::new();
        let id = object.add_section(Section::new(SectionKind::Text, vec![0xC3; 2], 1));
        for offset in 0..2 {
            object.define(DefinedSymbol {
                name: "f".into(),
                kind: SymbolKind::Function,
                section: id,
                offset,
                size: 1,
                global: true,
                signature: None,
            });
        }
        assert!(object.validate().is_err());
    }

    #[test]
    fn test_section_extent_bounded() {
        let mut object = CompiledObject::new();
        object.add_section(Section::zeroed(16, 16));
        object.add_section(Section::zeroed(usize::MAX - 4, 16));
        let err = object.validate().unwrap_err();
        assert!(err.to_string().contains(".bss sections exceed"));

        let mut object = CompiledObject::new();
        object.add_section(Section::zeroed(MAX_SECTION_EXTENT / 2, 16));
        object.add_section(Section::zeroed(MAX_SECTION_EXTENT / 2, 16));
        object.add_section(Section::new(SectionKind::Data, vec![0; 8], 8));
        assert!(object.validate().is_ok());
        object.add_section(Section::zeroed(32, 16));
        assert!(matches!(
            object.validate(),
            Err(LinkError::MalformedObject { .. })
        ));
    }

    #[test]
    fn test_signature_display() {
        let sig = Signature {
            params: vec![ValueKind::Ptr, ValueKind::I32],
            ret: Some(ValueKind::F64),
            variadic: true,
        };
        assert_eq!(sig.to_string(), "(ptr, i32, ...) -> f64");
        assert_eq!(Signature::default().to_string(), "() -> void");
    }
}
