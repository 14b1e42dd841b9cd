use int_enum::IntEnum;

use crate::arch::{Ptr, accumulate32, accumulate64};
use crate::arena::Arena;
use crate::{ObjErr, Result};

/// Stub synthesized for call targets beyond the reach of a 32-bit
/// displacement: an indirect absolute jump through the 8-byte slot that
/// immediately follows the instruction (`jmp *0(%rip)`).
const JMP_STUB: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];
const JMP_STUB_SIZE: usize = JMP_STUB.len() + 8;
const GOT_SLOT_SIZE: usize = 8;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum X86_64RelocationType {
    /// No reloc
    R_X86_64_NONE = 0,
    /// Direct 64 bit
    R_X86_64_64 = 1,
    /// PC relative 32 bit signed
    R_X86_64_PC32 = 2,
    /// 32 bit GOT entry
    R_X86_64_GOT32 = 3,
    /// 32 bit PLT address
    R_X86_64_PLT32 = 4,
    /// Copy symbol at runtime
    R_X86_64_COPY = 5,
    /// Create GOT entry
    R_X86_64_GLOB_DAT = 6,
    /// Create PLT entry
    R_X86_64_JUMP_SLOT = 7,
    /// Adjust by program base
    R_X86_64_RELATIVE = 8,
    /// 32 bit signed pc relative offset to GOT
    R_X86_64_GOTPCREL = 9,
    /// Direct 32 bit zero extended
    R_X86_64_32 = 10,
    /// Direct 32 bit sign extended
    R_X86_64_32S = 11,
    /// Direct 16 bit zero extended
    R_X86_64_16 = 12,
    /// 16 bit sign extended pc relative
    R_X86_64_PC16 = 13,
    /// Direct 8 bit sign extended
    R_X86_64_8 = 14,
    /// 8 bit sign extended pc relative
    R_X86_64_PC8 = 15,
    /// Place relative 64-bit signed
    R_X86_64_PC64 = 24,
    /// Relaxable load from 32 bit pc relative GOT entry
    R_X86_64_GOTPCRELX = 41,
    /// Relaxable REX-prefixed load from 32 bit pc relative GOT entry
    R_X86_64_REX_GOTPCRELX = 42,
}

type X64RelTy = X86_64RelocationType;

impl X86_64RelocationType {
    /// Arena bytes this relocation consumes over and above its target
    /// section.
    fn stub_bytes(&self) -> Result<usize> {
        match self {
            X64RelTy::R_X86_64_64 | X64RelTy::R_X86_64_PC32 => Ok(0),
            X64RelTy::R_X86_64_PLT32 => Ok(JMP_STUB_SIZE),
            X64RelTy::R_X86_64_REX_GOTPCRELX => Ok(GOT_SLOT_SIZE),
            _ => Err(ObjErr::UnknownReloc(*self as u32)),
        }
    }

    fn apply(&self, arena: &mut Arena, location: Ptr, sym_addr: u64, addend: i64) -> Result<()> {
        match self {
            X64RelTy::R_X86_64_64 => {
                accumulate64(location, sym_addr.wrapping_add(addend as u64));
            }
            X64RelTy::R_X86_64_PC32 => {
                pc_relative(location, sym_addr, addend);
            }
            X64RelTy::R_X86_64_PLT32 => {
                // The resolved symbol can sit anywhere in the address
                // space; route the call through an absolute-jump stub in
                // the arena so the displacement always fits.
                let stub = arena.alloc(JMP_STUB_SIZE);
                unsafe {
                    core::ptr::copy_nonoverlapping(JMP_STUB.as_ptr(), stub, JMP_STUB.len());
                }
                Ptr(stub as u64 + JMP_STUB.len() as u64).write::<u64>(sym_addr);
                pc_relative(location, stub as u64, addend);
            }
            X64RelTy::R_X86_64_REX_GOTPCRELX => {
                // Same reach problem for GOT-relative loads: park the
                // absolute address in an arena slot and point the load at
                // the slot.
                let slot = arena.alloc(GOT_SLOT_SIZE);
                Ptr(slot as u64).write::<u64>(sym_addr);
                pc_relative(location, slot as u64, addend);
            }
            _ => return Err(ObjErr::UnknownReloc(*self as u32)),
        }
        Ok(())
    }
}

fn pc_relative(location: Ptr, target: u64, addend: i64) {
    let value = target.wrapping_sub(location.0).wrapping_add(addend as u64) as u32;
    accumulate32(location, value);
}

pub(crate) struct X86_64Relocate;

impl X86_64Relocate {
    /// Sizing mode: bytes to reserve for stubs and slots, rejecting
    /// relocation types the applier would not handle.
    pub fn reserve(r_type: u32) -> Result<usize> {
        X64RelTy::try_from(r_type)
            .map_err(|_| ObjErr::UnknownReloc(r_type))?
            .stub_bytes()
    }

    pub fn apply(
        arena: &mut Arena,
        location: u64,
        sym_addr: u64,
        addend: i64,
        r_type: u32,
    ) -> Result<()> {
        X64RelTy::try_from(r_type)
            .map_err(|_| ObjErr::UnknownReloc(r_type))?
            .apply(arena, Ptr(location), sym_addr, addend)
    }
}
