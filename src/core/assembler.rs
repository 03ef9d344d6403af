// ELF64 relocatable object emission for a CompiledObject, built on the `object` crate's
// writer. Each section becomes an ELF section of the matching standard kind, defined symbols
// become local or global symbols at their section offsets, external names become undefined
// symbols, and every relocation is translated to the generic x86-64 relocation of the same
// width. The result can be fed to a system linker; the in-process loader does not use it.

//! ELF object file emission.

use hashbrown::HashMap;
use object::write::{Object, Relocation as ObjRelocation, SectionId as ObjSectionId, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind as ObjSectionKind, SymbolFlags, SymbolKind as ObjSymbolKind, SymbolScope,
};

use super::error::SessionError;
use super::object::{CompiledObject, RelocKind, RelocTarget, SectionKind};
use super::registry::SymbolKind;

fn section_kind(kind: SectionKind) -> ObjSectionKind {
    match kind {
        SectionKind::Text => ObjSectionKind::Text,
        SectionKind::Data => ObjSectionKind::Data,
        SectionKind::ReadOnlyData => ObjSectionKind::ReadOnlyData,
        SectionKind::Bss => ObjSectionKind::UninitializedData,
    }
}

fn relocation_flags(kind: RelocKind) -> RelocationFlags {
    let (kind, encoding, size) = match kind {
        RelocKind::Abs64 => (RelocationKind::Absolute, RelocationEncoding::Generic, 64),
        RelocKind::Abs32 => (RelocationKind::Absolute, RelocationEncoding::Generic, 32),
        RelocKind::Pc32 => (RelocationKind::Relative, RelocationEncoding::Generic, 32),
        RelocKind::Branch32 => (RelocationKind::PltRelative, RelocationEncoding::X86Branch, 32),
    };
    RelocationFlags::Generic { kind, encoding, size }
}

/// Serialize `compiled` as an x86-64 ELF relocatable object.
pub fn emit_elf(compiled: &CompiledObject) -> Result<Vec<u8>, SessionError> {
    compiled.validate().map_err(|e| SessionError::Emit {
        reason: e.to_string(),
    })?;

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let mut sections: Vec<(ObjSectionId, u64)> = Vec::with_capacity(compiled.sections.len());

    for section in &compiled.sections {
        let id = obj.add_section(
            Vec::new(),
            section.name.as_bytes().to_vec(),
            section_kind(section.kind),
        );
        let offset = match section.kind {
            SectionKind::Bss => obj.append_section_bss(id, section.size as u64, section.align as u64),
            _ => obj.append_section_data(id, &section.data, section.align as u64),
        };
        sections.push((id, offset));
    }

    let mut sym_map: HashMap<String, SymbolId> = HashMap::new();
    for symbol in &compiled.symbols {
        let (section, base) = sections[symbol.section.0];
        let id = obj.add_symbol(Symbol {
            name: symbol.name.as_bytes().to_vec(),
            value: base + symbol.offset as u64,
            size: symbol.size as u64,
            kind: match symbol.kind {
                SymbolKind::Function => ObjSymbolKind::Text,
                SymbolKind::Data => ObjSymbolKind::Data,
            },
            scope: if symbol.global {
                SymbolScope::Linkage
            } else {
                SymbolScope::Compilation
            },
            weak: false,
            section: SymbolSection::Section(section),
            flags: SymbolFlags::None,
        });
        if symbol.global {
            sym_map.insert(symbol.name.clone(), id);
        }
    }

    for (index, section) in compiled.sections.iter().enumerate() {
        let (section_id, base) = sections[index];
        for reloc in &section.relocations {
            let (symbol, addend) = match &reloc.target {
                RelocTarget::Section(target) => {
                    let (target_id, target_base) = sections[target.0];
                    (obj.section_symbol(target_id), reloc.addend + target_base as i64)
                }
                RelocTarget::External(name) => {
                    let id = match sym_map.get(name) {
                        Some(&id) => id,
                        None => {
                            let id = obj.add_symbol(Symbol {
                                name: name.as_bytes().to_vec(),
                                value: 0,
                                size: 0,
                                kind: match reloc.expected {
                                    Some(SymbolKind::Data) => ObjSymbolKind::Data,
                                    Some(SymbolKind::Function) => ObjSymbolKind::Text,
                                    None => ObjSymbolKind::Unknown,
                                },
                                scope: SymbolScope::Unknown,
                                weak: false,
                                section: SymbolSection::Undefined,
                                flags: SymbolFlags::None,
                            });
                            sym_map.insert(name.clone(), id);
                            id
                        }
                    };
                    (id, reloc.addend)
                }
            };
            obj.add_relocation(
                section_id,
                ObjRelocation {
                    offset: base + reloc.offset as u64,
                    symbol,
                    addend,
                    flags: relocation_flags(reloc.kind),
                },
            )
            .map_err(|e| SessionError::Emit {
                reason: e.to_string(),
            })?;
        }
    }

    let mut buf = Vec::new();
    obj.emit(&mut buf).map_err(|e| SessionError::Emit {
        reason: e.to_string(),
    })?;
    log::debug!(
        "emitted ELF object: {} sections, {} symbols, {} bytes",
        compiled.sections.len(),
        compiled.symbols.len(),
        buf.len()
    );
    Ok(buf)
}
