use core::fmt::Display;
use core::marker::PhantomData;
use std::ffi::CString;

use bitflags::bitflags;
use goblin::elf::Elf;
use goblin::elf::header::{EM_386, EM_X86_64};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHN_UNDEF, SHT_NOBITS};
use goblin::elf::sym::{STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION, Sym};

use crate::arch::{X86Relocate, X86_64Relocate};
use crate::arena::{Arena, align_up};
use crate::index::SymbolIndex;
use crate::{ObjErr, Result};

/// Sections are padded apart to this boundary inside the arena.
const SECTION_ALIGN: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionPerm: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Display for SectionPerm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut perms = String::new();
        if self.contains(SectionPerm::READ) {
            perms.push('R');
        }
        if self.contains(SectionPerm::WRITE) {
            perms.push('W');
        }
        if self.contains(SectionPerm::EXECUTE) {
            perms.push('X');
        }
        write!(f, "{}", perms)
    }
}

impl SectionPerm {
    /// Create SectionPerm from ELF section flags
    pub fn from_elf_flags(sh_flags: u64) -> Self {
        let mut perms = SectionPerm::empty();
        if (sh_flags & SHF_ALLOC as u64) != 0 {
            perms |= SectionPerm::READ;
        }
        if (sh_flags & SHF_WRITE as u64) != 0 {
            perms |= SectionPerm::WRITE;
        }
        if (sh_flags & SHF_EXECINSTR as u64) != 0 {
            perms |= SectionPerm::EXECUTE;
        }
        perms
    }
}

/// Where undefined symbols come from. The stock implementation asks the
/// process's dynamic loader; embedders and tests substitute their own
/// tables.
pub trait HostResolver {
    /// Runtime address of `name`, or `None` when the host does not export
    /// it.
    fn resolve(name: &str) -> Option<usize>;
}

/// Default-scope dynamic-loader lookup, `dlsym(RTLD_DEFAULT, name)`.
pub struct DlResolver;

impl HostResolver for DlResolver {
    fn resolve(name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if addr.is_null() { None } else { Some(addr as usize) }
    }
}

/// Clone of the symbol table with `st_value` rewritten to runtime
/// addresses for defined function and data symbols, so relocation
/// resolution reads every symbol uniformly. The input buffer itself is
/// never mutated.
struct LoadInfo {
    syms: Vec<Sym>,
}

pub struct ObjectLoader<'a, R: HostResolver> {
    elf: Elf<'a>,
    bin: &'a [u8],
    path: &'a str,
    _resolver: PhantomData<R>,
}

impl<'a, R: HostResolver> ObjectLoader<'a, R> {
    /// Parse `bin` and check that it is ELF of the host's pointer width.
    /// Everything else about the image is taken at face value.
    pub fn new(bin: &'a [u8], path: &'a str) -> Result<Self> {
        let elf = Elf::parse(bin).map_err(|_| ObjErr::NotElf(path.to_string()))?;
        if elf.is_64 != cfg!(target_pointer_width = "64") {
            return Err(ObjErr::NotElf(path.to_string()));
        }
        Ok(ObjectLoader {
            elf,
            bin,
            path,
            _resolver: PhantomData,
        })
    }

    /// Run the full load: size the arena, place sections, index symbols,
    /// apply relocations.
    pub fn load(self) -> Result<crate::LoadedObject> {
        let mut arena = Arena::new(self.image_size()?)?;
        let placement = self.place_sections(&mut arena)?;
        let (index, info) = self.index_symbols(&placement);
        self.apply_relocations(&mut arena, &placement, &info)?;
        let range = arena.range();
        log::debug!(
            "loaded {} ({} symbols) at {:#x}-{:#x}",
            self.path,
            index.len(),
            range.start,
            range.end
        );
        Ok(crate::LoadedObject { arena, index })
    }

    /// Sizing pass: allocatable sections padded apart, plus whatever the
    /// relocations reserve for stubs and slots. Also the point where
    /// unknown relocation types are rejected, before any mapping exists.
    fn image_size(&self) -> Result<usize> {
        let mut total = 0usize;
        for shdr in &self.elf.section_headers {
            if shdr.sh_flags & SHF_ALLOC as u64 == 0 {
                continue;
            }
            total = align_up(total, SECTION_ALIGN);
            total += shdr.sh_size as usize;
        }
        for (idx, relocs) in &self.elf.shdr_relocs {
            if !self.relocates_mapped_section(*idx) {
                continue;
            }
            for reloc in relocs.iter() {
                total += self.reserve(reloc.r_type)?;
            }
        }
        Ok(total)
    }

    fn reserve(&self, r_type: u32) -> Result<usize> {
        match self.elf.header.e_machine {
            EM_X86_64 => X86_64Relocate::reserve(r_type),
            EM_386 => X86Relocate::reserve(r_type),
            machine => Err(ObjErr::UnsupportedMachine(machine)),
        }
    }

    /// Whether relocation section `idx` patches a section that ends up in
    /// the arena.
    fn relocates_mapped_section(&self, idx: usize) -> bool {
        let target = self.elf.section_headers[idx].sh_info as usize;
        self.elf
            .section_headers
            .get(target)
            .is_some_and(|shdr| shdr.sh_flags & SHF_ALLOC as u64 != 0)
    }

    /// Placement pass: copy allocatable sections into the arena in section
    /// index order. NOBITS sections keep the zeroed mapping.
    fn place_sections(&self, arena: &mut Arena) -> Result<Vec<*mut u8>> {
        let mut placement = vec![core::ptr::null_mut::<u8>(); self.elf.section_headers.len()];
        for (idx, shdr) in self.elf.section_headers.iter().enumerate() {
            if shdr.sh_flags & SHF_ALLOC as u64 == 0 {
                continue;
            }
            arena.align_to(SECTION_ALIGN);
            let size = shdr.sh_size as usize;
            let base = arena.alloc(size);
            if shdr.sh_type != SHT_NOBITS {
                let offset = shdr.sh_offset as usize;
                let bytes = self
                    .bin
                    .get(offset..offset + size)
                    .ok_or_else(|| ObjErr::BadObject(format!("section {idx} data out of range")))?;
                unsafe {
                    core::ptr::copy_nonoverlapping(bytes.as_ptr(), base, size);
                }
            }
            log::trace!(
                "placed section '{}' at {:p} [{}] ({:#x} bytes)",
                self.section_name(shdr.sh_name),
                base,
                SectionPerm::from_elf_flags(shdr.sh_flags),
                size
            );
            placement[idx] = base;
        }
        Ok(placement)
    }

    /// Symbol pass: one index record per defined function or data symbol,
    /// and the rewritten symbol table for the relocation pass.
    fn index_symbols(&self, placement: &[*mut u8]) -> (SymbolIndex, LoadInfo) {
        let mut index = SymbolIndex::new();
        let mut info = LoadInfo {
            syms: Vec::with_capacity(self.elf.syms.len()),
        };
        for mut sym in self.elf.syms.iter() {
            let defined = sym.st_shndx != SHN_UNDEF as usize;
            if defined && matches!(sym.st_type(), STT_FUNC | STT_OBJECT) {
                let addr = section_base(placement, sym.st_shndx).wrapping_add(sym.st_value as usize);
                sym.st_value = addr as u64;
                let name = self.symbol_name(&sym);
                log::trace!("symbol '{}' => {:#x}", name, addr);
                index.push(name, addr as *mut u8);
            }
            info.syms.push(sym);
        }
        (index, info)
    }

    /// Relocation pass: walk every REL/RELA section that patches a mapped
    /// section and apply the machine's fixups.
    fn apply_relocations(
        &self,
        arena: &mut Arena,
        placement: &[*mut u8],
        info: &LoadInfo,
    ) -> Result<()> {
        for (idx, relocs) in &self.elf.shdr_relocs {
            if !self.relocates_mapped_section(*idx) {
                continue;
            }
            let target = self.elf.section_headers[*idx].sh_info as usize;
            let target_base = placement[target] as u64;
            for reloc in relocs.iter() {
                let location = target_base.wrapping_add(reloc.r_offset);
                let addend = reloc.r_addend.unwrap_or(0);
                let sym_addr = self.reloc_symbol_addr(reloc.r_sym, placement, info)? as u64;
                match self.elf.header.e_machine {
                    EM_X86_64 => {
                        X86_64Relocate::apply(arena, location, sym_addr, addend, reloc.r_type)?
                    }
                    EM_386 => X86Relocate::apply(location, sym_addr, addend, reloc.r_type)?,
                    machine => return Err(ObjErr::UnsupportedMachine(machine)),
                }
            }
        }
        Ok(())
    }

    /// Runtime address of the symbol a relocation references.
    fn reloc_symbol_addr(
        &self,
        sym_idx: usize,
        placement: &[*mut u8],
        info: &LoadInfo,
    ) -> Result<usize> {
        let sym = info.syms.get(sym_idx).ok_or_else(|| {
            ObjErr::BadObject(format!("relocation against symbol {sym_idx} out of range"))
        })?;
        match sym.st_type() {
            STT_SECTION => Ok(section_base(placement, sym.st_shndx)),
            STT_FUNC | STT_OBJECT => Ok(sym.st_value as usize),
            STT_NOTYPE => {
                if sym.st_shndx == SHN_UNDEF as usize {
                    let name = self.symbol_name(sym);
                    R::resolve(name).ok_or_else(|| ObjErr::UnresolvedSymbol(name.to_string()))
                } else {
                    Ok(section_base(placement, sym.st_shndx))
                }
            }
            kind => Err(ObjErr::UnsupportedSymKind(kind)),
        }
    }

    fn section_name(&self, sh_name: usize) -> &str {
        self.elf.shdr_strtab.get_at(sh_name).unwrap_or("<unknown>")
    }

    fn symbol_name(&self, sym: &Sym) -> &str {
        self.elf.strtab.get_at(sym.st_name).unwrap_or("")
    }
}

/// Runtime base of a section, or 0 for anything unmapped or reserved.
fn section_base(placement: &[*mut u8], shndx: usize) -> usize {
    placement.get(shndx).map_or(0, |base| *base as usize)
}
