// The linker/loader turns a CompiledObject plus a Registry into committed memory. Linking
// validates the object, resolves every external name (own globals first, then one locked
// registry snapshot), lays sections out into one page-granular block per section kind,
// copies bytes, reserves an absolute jump stub for each external branch target and applies
// every relocation through bounds-checked slices. Loading then seals data blocks and finally
// code blocks, so nothing is executable before every relocation in every section has been
// applied. Any failure drops the half-built image, which releases its memory: a load either
// fully succeeds or leaves nothing behind.

//! Linking and loading of compiled objects.

use hashbrown::HashMap;

use super::diagnostic::{Diagnostic, Stage};
use super::error::LinkError;
use super::memory::{page_size, MemoryRegion, Permission};
use super::object::{CompiledObject, RelocKind, RelocTarget, Relocation, SectionKind, Signature};
use super::registry::{Registry, Symbol, SymbolKind};
use crate::x64::encoder::{encode_jump_stub, JUMP_STUB_SIZE};

/// A defined global symbol at its final address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub address: usize,
    pub size: usize,
    pub signature: Option<Signature>,
}

/// Counters gathered while linking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sections: usize,
    pub relocations_applied: usize,
    pub externals_resolved: usize,
    pub stubs: usize,
}

/// Where a section landed.
#[derive(Debug, Clone, Copy)]
struct Placement {
    region: usize,
    offset: usize,
}

/// Relocated but still writable image.
pub struct LinkedImage {
    regions: Vec<MemoryRegion>,
    symbols: HashMap<String, LoadedSymbol>,
    stats: LinkStats,
}

/// Sealed image ready for execution.
pub struct LoadedImage {
    regions: Vec<MemoryRegion>,
    symbols: HashMap<String, LoadedSymbol>,
    stats: LinkStats,
}

/// Resolve and relocate `object` into freshly allocated memory.
///
/// Every missing external is reported in `diagnostics`; the returned error
/// names the first one in relocation order.
pub fn link(
    object: &CompiledObject,
    registry: &Registry,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<LinkedImage, LinkError> {
    object.validate()?;

    let undefined = object.undefined_names();
    let (resolved, missing) = registry.snapshot(undefined.iter().copied());
    if let Some(first) = missing.first() {
        for name in &missing {
            diagnostics.push(Diagnostic::error(
                Stage::Link,
                format!("undefined symbol: {name}"),
            ));
        }
        return Err(LinkError::UndefinedSymbol { name: first.clone() });
    }

    let mut linker = Linker::new(object, resolved);
    linker.layout()?;
    linker.allocate()?;
    linker.copy_sections()?;
    linker.write_stubs()?;
    linker.apply_relocations()?;
    Ok(linker.finish())
}

struct Linker<'o> {
    object: &'o CompiledObject,
    resolved: HashMap<String, Symbol>,
    placements: Vec<Placement>,
    /// Section kind and used size per region, in allocation order.
    blocks: Vec<(SectionKind, usize)>,
    regions: Vec<MemoryRegion>,
    /// External branch targets and their stub offsets in the code block.
    stubs: Vec<(String, usize)>,
    stats: LinkStats,
}

impl<'o> Linker<'o> {
    fn new(object: &'o CompiledObject, resolved: HashMap<String, Symbol>) -> Self {
        Self {
            object,
            resolved,
            placements: Vec::new(),
            blocks: Vec::new(),
            regions: Vec::new(),
            stubs: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    /// Assign every section an offset inside the block for its kind.
    fn layout(&mut self) -> Result<(), LinkError> {
        let page = page_size();
        let mut placements = vec![None; self.object.sections.len()];

        for kind in SectionKind::ALL {
            let mut offset = 0usize;
            let mut any = false;
            for (index, section) in self.object.sections.iter().enumerate() {
                if section.kind != kind {
                    continue;
                }
                if section.align > page {
                    return Err(LinkError::Alignment {
                        section: section.name.clone(),
                        align: section.align,
                    });
                }
                offset = align_up(offset, section.align)
                    .ok_or_else(|| block_overflow(kind))?;
                placements[index] = Some(Placement {
                    region: self.blocks.len(),
                    offset,
                });
                offset = offset
                    .checked_add(section.size)
                    .ok_or_else(|| block_overflow(kind))?;
                any = true;
            }

            if kind == SectionKind::Text {
                let names = self.branch_stub_names();
                if !names.is_empty() {
                    offset = align_up(offset, JUMP_STUB_SIZE)
                        .ok_or_else(|| block_overflow(kind))?;
                    for name in names {
                        self.stubs.push((name, offset));
                        offset = offset
                            .checked_add(JUMP_STUB_SIZE)
                            .ok_or_else(|| block_overflow(kind))?;
                    }
                    any = true;
                }
            }

            if any {
                self.blocks.push((kind, offset));
            }
        }

        self.placements = placements
            .into_iter()
            .enumerate()
            .map(|(index, placement)| {
                placement.ok_or_else(|| LinkError::MalformedObject {
                    reason: format!("section #{index} was not placed"),
                })
            })
            .collect::<Result<_, _>>()?;
        self.stats.sections = self.object.sections.len();
        self.stats.stubs = self.stubs.len();
        Ok(())
    }

    /// External names reached through `Branch32`, in first-use order.
    fn branch_stub_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for section in &self.object.sections {
            for reloc in &section.relocations {
                if reloc.kind != RelocKind::Branch32 {
                    continue;
                }
                if let RelocTarget::External(name) = &reloc.target {
                    if self.object.global(name).is_none() && !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        names
    }

    fn allocate(&mut self) -> Result<(), LinkError> {
        for &(kind, size) in &self.blocks {
            self.regions.push(MemoryRegion::allocate(kind, size)?);
        }
        Ok(())
    }

    fn copy_sections(&mut self) -> Result<(), LinkError> {
        let object = self.object;
        for (section, placement) in object.sections.iter().zip(&self.placements) {
            if section.kind == SectionKind::Bss {
                // Blocks are zeroed on allocation.
                continue;
            }
            let bytes = self.regions[placement.region].bytes_mut()?;
            let dest = bytes
                .get_mut(placement.offset..placement.offset + section.data.len())
                .ok_or_else(|| LinkError::MalformedObject {
                    reason: format!("section {} does not fit its block", section.name),
                })?;
            dest.copy_from_slice(&section.data);
        }
        Ok(())
    }

    fn text_region(&self) -> Option<usize> {
        self.blocks
            .iter()
            .position(|&(kind, _)| kind == SectionKind::Text)
    }

    fn write_stubs(&mut self) -> Result<(), LinkError> {
        let Some(text) = self.text_region() else {
            return Ok(());
        };
        for (name, offset) in &self.stubs {
            let symbol = self
                .resolved
                .get(name)
                .ok_or_else(|| LinkError::UndefinedSymbol { name: name.clone() })?;
            let stub = encode_jump_stub(symbol.address as u64).map_err(|e| {
                LinkError::MalformedObject {
                    reason: format!("cannot encode stub for {name}: {e}"),
                }
            })?;
            let bytes = self.regions[text].bytes_mut()?;
            let dest = bytes
                .get_mut(*offset..*offset + JUMP_STUB_SIZE)
                .ok_or_else(|| LinkError::MalformedObject {
                    reason: format!("stub for {name} does not fit the code block"),
                })?;
            dest.fill(0xCC);
            dest[..stub.len()].copy_from_slice(&stub);
            log::trace!("stub for {} -> {:#x} at +{:#x}", name, symbol.address, offset);
        }
        Ok(())
    }

    fn section_address(&self, index: usize) -> usize {
        let placement = self.placements[index];
        self.regions[placement.region].base() + placement.offset
    }

    /// Resolve a relocation target to `(address, kind if known)`.
    fn target_address(&self, reloc: &Relocation) -> Result<(usize, Option<SymbolKind>), LinkError> {
        match &reloc.target {
            RelocTarget::Section(id) => Ok((self.section_address(id.0), None)),
            RelocTarget::External(name) => {
                if let Some(own) = self.object.global(name) {
                    return Ok((self.section_address(own.section.0) + own.offset, Some(own.kind)));
                }
                let symbol = self
                    .resolved
                    .get(name)
                    .ok_or_else(|| LinkError::UndefinedSymbol { name: name.clone() })?;
                if reloc.kind == RelocKind::Branch32 {
                    let text = self.text_region().ok_or_else(|| LinkError::MalformedObject {
                        reason: "branch relocation without a code block".to_string(),
                    })?;
                    if let Some((_, offset)) = self.stubs.iter().find(|(n, _)| n == name) {
                        return Ok((self.regions[text].base() + offset, Some(symbol.kind)));
                    }
                }
                Ok((symbol.address, Some(symbol.kind)))
            }
        }
    }

    fn apply_relocations(&mut self) -> Result<(), LinkError> {
        let object = self.object;
        for (index, section) in object.sections.iter().enumerate() {
            let placement = self.placements[index];
            let section_base = self.section_address(index);

            for reloc in &section.relocations {
                let (target, found) = self.target_address(reloc)?;
                if let (Some(expected), Some(found)) = (reloc.expected, found) {
                    if expected != found {
                        return Err(LinkError::TypeMismatch {
                            name: reloc.target.to_string(),
                            expected,
                            found,
                        });
                    }
                }

                let site = section_base + reloc.offset;
                let value = target as i128 + reloc.addend as i128;
                let encoded = encode_value(reloc, value, site)?;

                let start = placement.offset + reloc.offset;
                let bytes = self.regions[placement.region].bytes_mut()?;
                let dest = bytes
                    .get_mut(start..start + encoded.len())
                    .ok_or_else(|| LinkError::MalformedObject {
                        reason: format!("relocation at {:#x} outside {}", reloc.offset, section.name),
                    })?;
                dest.copy_from_slice(&encoded);

                log::trace!(
                    "{} {}+{:#x} -> {} ({:#x})",
                    reloc.kind,
                    section.name,
                    reloc.offset,
                    reloc.target,
                    target
                );
                self.stats.relocations_applied += 1;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> LinkedImage {
        self.stats.externals_resolved = self.resolved.len();
        let mut symbols = HashMap::new();
        for symbol in self.object.symbols.iter().filter(|s| s.global) {
            let address = self.section_address(symbol.section.0) + symbol.offset;
            symbols.insert(
                symbol.name.clone(),
                LoadedSymbol {
                    name: symbol.name.clone(),
                    kind: symbol.kind,
                    address,
                    size: symbol.size,
                    signature: symbol.signature.clone(),
                },
            );
        }
        log::debug!(
            "linked {} sections into {} blocks, {} relocations, {} stubs",
            self.stats.sections,
            self.regions.len(),
            self.stats.relocations_applied,
            self.stats.stubs
        );
        LinkedImage {
            regions: self.regions,
            symbols,
            stats: self.stats,
        }
    }
}

/// Encode the patched field for `reloc` given `S + A` and the site `P`.
fn encode_value(reloc: &Relocation, value: i128, site: usize) -> Result<Vec<u8>, LinkError> {
    let overflow = |value: i128| LinkError::RelocationOverflow {
        target: reloc.target.to_string(),
        kind: reloc.kind,
        value,
    };
    match reloc.kind {
        RelocKind::Abs64 => {
            let value = u64::try_from(value)
                .or_else(|_| i64::try_from(value).map(|v| v as u64))
                .map_err(|_| overflow(value))?;
            Ok(value.to_le_bytes().to_vec())
        }
        RelocKind::Abs32 => {
            let value = u32::try_from(value).map_err(|_| overflow(value))?;
            Ok(value.to_le_bytes().to_vec())
        }
        RelocKind::Pc32 | RelocKind::Branch32 => {
            let relative = value - site as i128;
            let relative = i32::try_from(relative).map_err(|_| overflow(relative))?;
            Ok(relative.to_le_bytes().to_vec())
        }
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    value
        .checked_add(align - 1)
        .map(|value| value & !(align - 1))
}

fn block_overflow(kind: SectionKind) -> LinkError {
    LinkError::MalformedObject {
        reason: format!("{} sections overflow the address space", kind.default_name()),
    }
}

impl LinkedImage {
    /// Seal every region to its final permission, code last.
    pub fn load(mut self) -> Result<LoadedImage, LinkError> {
        self.regions.sort_by_key(|r| r.kind() == SectionKind::Text);
        for region in &mut self.regions {
            region.seal(Permission::for_section(region.kind()))?;
        }
        log::debug!("loaded {} regions", self.regions.len());
        Ok(LoadedImage {
            regions: self.regions,
            symbols: self.symbols,
            stats: self.stats,
        })
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

impl LoadedImage {
    pub fn symbol(&self, name: &str) -> Option<&LoadedSymbol> {
        self.symbols.get(name)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &LoadedSymbol> {
        self.symbols.values()
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Region holding `address`, if any.
    pub fn region_containing(&self, address: usize) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::{DefinedSymbol, Section};
    use crate::core::test_utils::test::{ret_imm32, text_object};

    fn link_and_load(object: &CompiledObject, registry: &Registry) -> Result<LoadedImage, LinkError> {
        let mut diagnostics = Vec::new();
        link(object, registry, &mut diagnostics)?.load()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(17, 8), Some(24));
        assert_eq!(align_up(usize::MAX - 4, 16), None);
    }

    #[test]
    fn test_code_sealed_executable() {
        let object = text_object("answer", ret_imm32(42));
        let registry = Registry::default();
        let image = link_and_load(&object, &registry).unwrap();

        let symbol = image.symbol("answer").unwrap();
        let region = image.region_containing(symbol.address).unwrap();
        assert_eq!(region.permission(), Permission::ReadExecute);
        assert!(region.is_sealed());
    }

    #[test]
    fn test_undefined_symbol_reports_all_missing() {
        let mut object = text_object("f", vec![0x90; 16]);
        for (offset, name) in [(0, "first"), (8, "second")] {
            object.sections[0].relocations.push(Relocation {
                offset,
                kind: RelocKind::Abs64,
                target: RelocTarget::External(name.into()),
                addend: 0,
                expected: None,
            });
        }
        let registry = Registry::default();
        let mut diagnostics = Vec::new();
        let err = link(&object, &registry, &mut diagnostics).err().unwrap();

        assert_eq!(err, LinkError::UndefinedSymbol { name: "first".into() });
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[1].message.contains("second"));
    }

    #[test]
    fn test_abs64_data_relocation() {
        let mut object = CompiledObject::new();
        let rodata = object.add_section(Section::new(SectionKind::ReadOnlyData, b"hi\0".to_vec(), 1));
        let mut data = Section::new(SectionKind::Data, vec![0; 8], 8);
        data.relocations.push(Relocation {
            offset: 0,
            kind: RelocKind::Abs64,
            target: RelocTarget::Section(rodata),
            addend: 1,
            expected: None,
        });
        let data = object.add_section(data);
        object.define(DefinedSymbol {
            name: "ptr".into(),
            kind: SymbolKind::Data,
            section: data,
            offset: 0,
            size: 8,
            global: true,
            signature: None,
        });

        let image = link_and_load(&object, &Registry::default()).unwrap();
        let ptr = image.symbol("ptr").unwrap();
        let region = image.region_containing(ptr.address).unwrap();
        let stored = u64::from_le_bytes(region.bytes()[..8].try_into().unwrap()) as usize;

        let rodata_region = image
            .regions()
            .iter()
            .find(|r| r.kind() == SectionKind::ReadOnlyData)
            .unwrap();
        assert_eq!(stored, rodata_region.base() + 1);
        assert_eq!(rodata_region.permission(), Permission::ReadOnly);
    }

    #[test]
    fn test_kind_mismatch_is_terminal() {
        let mut object = text_object("f", vec![0x90; 8]);
        object.sections[0].relocations.push(Relocation {
            offset: 0,
            kind: RelocKind::Abs64,
            target: RelocTarget::External("value".into()),
            addend: 0,
            expected: Some(SymbolKind::Function),
        });
        let registry = Registry::default();
        registry
            .register("value", SymbolKind::Data, 0x1000, Some(4))
            .unwrap();

        let err = link_and_load(&object, &registry).err().unwrap();
        assert_eq!(
            err,
            LinkError::TypeMismatch {
                name: "value".into(),
                expected: SymbolKind::Function,
                found: SymbolKind::Data,
            }
        );
    }

    #[test]
    fn test_pc32_overflow() {
        let mut object = text_object("f", vec![0x90; 8]);
        object.sections[0].relocations.push(Relocation {
            offset: 0,
            kind: RelocKind::Pc32,
            target: RelocTarget::External("far".into()),
            addend: -4,
            expected: None,
        });
        let registry = Registry::default();
        // Page zero is never mapped next to user allocations on 64-bit hosts.
        registry.register("far", SymbolKind::Data, 0x10, None).unwrap();

        let err = link_and_load(&object, &registry).err().unwrap();
        assert!(matches!(
            err,
            LinkError::RelocationOverflow { kind: RelocKind::Pc32, .. }
        ));
    }

    #[test]
    fn test_external_branch_goes_through_stub() {
        let mut object = text_object("f", vec![0xE8, 0, 0, 0, 0, 0xC3]);
        object.sections[0].relocations.push(Relocation {
            offset: 1,
            kind: RelocKind::Branch32,
            target: RelocTarget::External("host_fn".into()),
            addend: -4,
            expected: Some(SymbolKind::Function),
        });
        let registry = Registry::default();
        registry.register_function("host_fn", 0x10).unwrap();

        let image = link_and_load(&object, &registry).unwrap();
        assert_eq!(image.stats().stubs, 1);

        let code = image
            .regions()
            .iter()
            .find(|r| r.kind() == SectionKind::Text)
            .unwrap();
        let rel = i32::from_le_bytes(code.bytes()[1..5].try_into().unwrap());
        let stub_offset = (5 + rel as isize) as usize;
        assert_eq!(stub_offset % JUMP_STUB_SIZE, 0);
        assert_eq!(&code.bytes()[stub_offset..stub_offset + 2], &[0xFF, 0x25]);
        let target = u64::from_le_bytes(
            code.bytes()[stub_offset + 6..stub_offset + 14].try_into().unwrap(),
        );
        assert_eq!(target, 0x10);
    }

    #[test]
    fn test_own_global_satisfies_external_reference() {
        let mut object = text_object("f", vec![0xE8, 0, 0, 0, 0, 0xC3]);
        object.sections[0].relocations.push(Relocation {
            offset: 1,
            kind: RelocKind::Branch32,
            target: RelocTarget::External("f".into()),
            addend: -4,
            expected: Some(SymbolKind::Function),
        });

        let image = link_and_load(&object, &Registry::default()).unwrap();
        assert_eq!(image.stats().stubs, 0);
        let code = &image.regions()[0];
        let rel = i32::from_le_bytes(code.bytes()[1..5].try_into().unwrap());
        assert_eq!(rel, -5);
    }

    #[test]
    fn test_oversized_alignment_rejected() {
        let mut object = CompiledObject::new();
        object.add_section(Section::new(SectionKind::Data, vec![0; 8], page_size() * 2));
        let err = link_and_load(&object, &Registry::default()).err().unwrap();
        assert!(matches!(err, LinkError::Alignment { .. }));
    }

    #[test]
    fn test_bss_is_zeroed_and_writable() {
        let mut object = CompiledObject::new();
        let bss = object.add_section(Section::zeroed(64, 16));
        object.define(DefinedSymbol {
            name: "buffer".into(),
            kind: SymbolKind::Data,
            section: bss,
            offset: 0,
            size: 64,
            global: true,
            signature: None,
        });
        let image = link_and_load(&object, &Registry::default()).unwrap();
        let region = image.region_containing(image.symbol("buffer").unwrap().address).unwrap();
        assert_eq!(region.kind(), SectionKind::Bss);
        assert_eq!(region.permission(), Permission::ReadWrite);
        assert!(region.bytes().iter().all(|&b| b == 0));
    }
}
