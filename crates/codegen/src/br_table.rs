//! `br_table` lowering: clamp, landing-pad load, indirect jump.
//!
//! Each `br_table` instruction owns a run of 64-bit slots in the
//! per-instance landing-pad table below memzero. The stencil clamps the
//! operand to the case count (out-of-range indices take the default
//! case), loads `gs:[index*8 + base]` and jumps to it. The landing pads
//! themselves are ordinary branch emissions placed right after the jump;
//! their addresses are written into the table when the instance's
//! runtime memory is built.

use crate::asm::{Assembler, Cc, Gpr};
use crate::code_region::CodeRegion;
use crate::library::{int_operand, load_int, IntLoc};
use crate::stencil::{FixupData, Stencil, SLOT_BOUND, SLOT_IMM};
use once_cell::sync::Lazy;

pub struct BrTableLibrary {
    /// Indexed by the in-register integer count.
    variants: Vec<Stencil>,
}

static BR_TABLES: Lazy<BrTableLibrary> = Lazy::new(BrTableLibrary::build);

impl BrTableLibrary {
    pub fn global() -> &'static BrTableLibrary {
        &BR_TABLES
    }

    pub const MAX_EMIT: u32 = 40;

    fn build() -> BrTableLibrary {
        let variants = (0..=crate::abi::MAX_INT_REGS)
            .map(|k| {
                let mut a = Assembler::new();
                match int_operand(k, 0) {
                    IntLoc::Reg(r) => a.mov_rr(false, Gpr::Rax, r),
                    loc => load_int(&mut a, loc, Gpr::Rax, false),
                }
                // Clamp to the default case.
                a.alu_ri32(false, 7, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_BOUND, 0);
                a.jcc8(Cc::Be, 5);
                a.mov_ri32(Gpr::Rax, 0);
                a.mark_reloc32(SLOT_BOUND, 0);
                // Landing pad addresses live below memzero; the base
                // offset arrives pre-negated in IMM.
                a.mov_load_gs_scaled(Gpr::Rax, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_IMM, 0);
                a.jmp_r(Gpr::Rax);
                a.finish()
            })
            .collect();
        BrTableLibrary { variants }
    }

    pub fn emit(&self, out: &mut CodeRegion, k_int: u32, fixups: &FixupData) {
        self.variants[k_int as usize].emit(out, fixups);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_ends_in_an_indirect_jump() {
        let lib = BrTableLibrary::global();
        for stencil in &lib.variants {
            let code = stencil.code();
            assert_eq!(&code[code.len() - 2..], [0xff, 0xe0]); // jmp rax
        }
    }

    #[test]
    fn clamp_uses_the_case_count_twice() {
        let lib = BrTableLibrary::global();
        let bounds = lib.variants[1]
            .relocs()
            .iter()
            .filter(|r| r.slot == SLOT_BOUND)
            .count();
        assert_eq!(bounds, 2);
    }
}
