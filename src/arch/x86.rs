use int_enum::IntEnum;

use crate::arch::{Ptr, accumulate32};
use crate::{ObjErr, Result};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum X86RelocationType {
    /// No reloc
    R_386_NONE = 0,
    /// Direct 32 bit
    R_386_32 = 1,
    /// PC relative 32 bit
    R_386_PC32 = 2,
    /// 32 bit GOT entry
    R_386_GOT32 = 3,
    /// 32 bit PLT address
    R_386_PLT32 = 4,
    /// Copy symbol at runtime
    R_386_COPY = 5,
    /// Create GOT entry
    R_386_GLOB_DAT = 6,
    /// Create PLT entry
    R_386_JMP_SLOT = 7,
    /// Adjust by program base
    R_386_RELATIVE = 8,
    /// 32 bit offset to GOT
    R_386_GOTOFF = 9,
    /// 32 bit PC relative offset to GOT
    R_386_GOTPC = 10,
}

type X86RelTy = X86RelocationType;

impl X86RelocationType {
    fn apply(&self, location: Ptr, sym_addr: u64, addend: i64) -> Result<()> {
        match self {
            X86RelTy::R_386_32 => {
                accumulate32(location, sym_addr.wrapping_add(addend as u64) as u32);
            }
            X86RelTy::R_386_PC32 => {
                let value = sym_addr.wrapping_sub(location.0).wrapping_add(addend as u64);
                accumulate32(location, value as u32);
            }
            _ => return Err(ObjErr::UnknownReloc(*self as u32)),
        }
        Ok(())
    }
}

pub(crate) struct X86Relocate;

impl X86Relocate {
    /// i386 fixups fit in place and never synthesize arena stubs; sizing
    /// only rejects types the applier would not handle.
    pub fn reserve(r_type: u32) -> Result<usize> {
        let reloc = X86RelTy::try_from(r_type).map_err(|_| ObjErr::UnknownReloc(r_type))?;
        match reloc {
            X86RelTy::R_386_32 | X86RelTy::R_386_PC32 => Ok(0),
            _ => Err(ObjErr::UnknownReloc(r_type)),
        }
    }

    pub fn apply(location: u64, sym_addr: u64, addend: i64, r_type: u32) -> Result<()> {
        X86RelTy::try_from(r_type)
            .map_err(|_| ObjErr::UnknownReloc(r_type))?
            .apply(Ptr(location), sym_addr, addend)
    }
}
