//! `call_indirect` lowering: table bounds check, signature check, target
//! load.
//!
//! The indirect-call table lives below memzero, 16 bytes per slot:
//! `{expected signature index, entry address}`. Unoccupied slots are
//! filled with all-ones, which can never equal a signature index, so a
//! call through them takes the signature-mismatch trap. Both checks
//! branch to the shared `ud2` at the start of the code region.

use crate::asm::{Assembler, Cc, Gpr};
use crate::code_region::CodeRegion;
use crate::library::{int_operand, load_int, IntLoc};
use crate::stencil::{FixupData, Stencil, SLOT_BOUND, SLOT_IMM, SLOT_SIG};
use once_cell::sync::Lazy;
use smallvec::SmallVec;

/// `mov rax, [r13]; mov r13, r14; call rax` — the tail of every indirect
/// call, consuming the target stashed in the frame scratch slot.
pub const INDIRECT_CALL_SEQ: [u8; 9] = [0x49, 0x8b, 0x45, 0x00, 0x4d, 0x89, 0xf5, 0xff, 0xd0];

struct CallIndirectStencil {
    stencil: Stencil,
    /// In-stencil offsets of rel32 slots that must point at the shared
    /// trap instruction.
    trap_slots: SmallVec<[u16; 2]>,
}

pub struct CallIndirectLibrary {
    variants: Vec<CallIndirectStencil>,
}

static CALL_INDIRECTS: Lazy<CallIndirectLibrary> = Lazy::new(CallIndirectLibrary::build);

impl CallIndirectLibrary {
    pub fn global() -> &'static CallIndirectLibrary {
        &CALL_INDIRECTS
    }

    pub const MAX_EMIT: u32 = 64;

    fn build() -> CallIndirectLibrary {
        let variants = (0..=crate::abi::MAX_INT_REGS)
            .map(|k| {
                let mut a = Assembler::new();
                let mut trap_slots = SmallVec::new();
                match int_operand(k, 0) {
                    IntLoc::Reg(r) => a.mov_rr(false, Gpr::Rax, r),
                    loc => load_int(&mut a, loc, Gpr::Rax, false),
                }
                a.alu_ri32(false, 7, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_BOUND, 0);
                trap_slots.push(a.jcc32(Cc::Ae) as u16);
                a.shl_imm8(true, Gpr::Rax, 4);
                a.mov_load_gs(true, Gpr::Rcx, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_IMM, 0);
                a.alu_ri32(true, 7, Gpr::Rcx, 0);
                a.mark_reloc32(SLOT_SIG, 0);
                trap_slots.push(a.jcc32(Cc::Ne) as u16);
                a.mov_load_gs(true, Gpr::Rax, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_IMM, 8);
                // Stash the target; parameter fills run before the call.
                a.mov_store(true, crate::abi::FRAME, 0, Gpr::Rax);
                CallIndirectStencil {
                    stencil: a.finish(),
                    trap_slots,
                }
            })
            .collect();
        CallIndirectLibrary { variants }
    }

    /// Emits the checks and target load, wiring both traps to `ud2_off`.
    pub fn emit(&self, out: &mut CodeRegion, k_int: u32, ud2_off: u32, fixups: &FixupData) {
        let v = &self.variants[k_int as usize];
        let base = out.pos();
        v.stencil.emit(out, fixups);
        for slot in &v.trap_slots {
            out.patch_rel32(base + *slot as u32, ud2_off);
        }
    }

    pub fn emit_call(out: &mut CodeRegion) {
        out.push_bytes(&INDIRECT_CALL_SEQ);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_two_traps() {
        let lib = CallIndirectLibrary::global();
        for v in &lib.variants {
            assert_eq!(v.trap_slots.len(), 2);
            // jae rel32 / jne rel32
            let code = v.stencil.code();
            assert_eq!(code[v.trap_slots[0] as usize - 2], 0x0f);
            assert_eq!(code[v.trap_slots[0] as usize - 1], 0x83);
            assert_eq!(code[v.trap_slots[1] as usize - 1], 0x85);
        }
    }

    #[test]
    fn traps_resolve_to_the_shared_ud2() {
        let lib = CallIndirectLibrary::global();
        let mut region = CodeRegion::new().unwrap();
        region.reserve(4096);
        region.push_bytes(&[0x0f, 0x0b]); // the shared trap
        region.align16();
        lib.emit(&mut region, 0, 0, &FixupData::default());
        let v = &lib.variants[0];
        let base = 16;
        for slot in &v.trap_slots {
            let at = (base + *slot as u32) as usize;
            let rel = i32::from_le_bytes(region.bytes()[at..at + 4].try_into().unwrap());
            assert_eq!((at as i64 + 4 + rel as i64) as u32, 0);
        }
    }
}
