//! Branch stencils: `br`, `br_if` and the `if` conditional, with and
//! without a carried block result.
//!
//! Every emitter ends in a `jmp`/`jcc` whose 4-byte displacement is left
//! unresolved; the region offset of that slot is returned to the caller,
//! who queues it on the target block's patch list. Slots are resolved at
//! the block's `end` (or at the loop header for backward branches),
//! always before the patched code can become reachable.

use crate::abi::{INT_REGS, MAX_FLOAT_REGS, MAX_INT_REGS};
use crate::asm::{Assembler, Cc, Gpr, Xmm};
use crate::code_region::CodeRegion;
use crate::library::{
    flags_from_int, float_operand, int_operand, load_float, load_int, FloatLoc, IntLoc,
};
use crate::stencil::{FixupData, Stencil, SLOT_IMM};
use module::ValType;
use once_cell::sync::Lazy;

/// A branch stencil plus the in-stencil offset of its displacement slot.
struct BranchStencil {
    stencil: Stencil,
    target_slot: u16,
}

impl BranchStencil {
    /// Emits the stencil and returns the region offset of the slot.
    fn emit(&self, out: &mut CodeRegion, fixups: &FixupData) -> u32 {
        let base = out.pos();
        self.stencil.emit(out, fixups);
        base + self.target_slot as u32
    }
}

/// Moves the branch's result value into the target block's shape: either
/// the next in-register position (`new_k`) or the spill slot whose frame
/// offset arrives in the IMM fixup.
fn store_int_result(a: &mut Assembler, value: IntLoc, new_k: u32, spill: bool, wide: bool) {
    if spill {
        let src = match value {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(a, loc, Gpr::Rax, wide);
                Gpr::Rax
            }
        };
        a.mov_store(wide, crate::abi::FRAME, 0, src);
        a.mark_reloc32(SLOT_IMM, 0);
    } else {
        let dst = INT_REGS[new_k as usize];
        match value {
            IntLoc::Reg(r) if r == dst => {}
            loc => load_int(a, loc, dst, wide),
        }
    }
}

fn store_float_result(a: &mut Assembler, value: FloatLoc, new_k: u32, spill: bool, wide: bool) {
    if spill {
        let src = match value {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(a, loc, Xmm::Xmm0, wide);
                Xmm::Xmm0
            }
        };
        a.movs_store(wide, crate::abi::FRAME, 0, src);
        a.mark_reloc32(SLOT_IMM, 0);
    } else {
        let dst = crate::abi::FLOAT_REGS[new_k as usize];
        match value {
            FloatLoc::Reg(r) if r == dst => {}
            loc => load_float(a, loc, dst, wide),
        }
    }
}

/// `store` + `jmp rel32`.
fn br_with_store(store: Assembler) -> BranchStencil {
    let mut a = Assembler::new();
    a.append(&store);
    let slot = a.jmp32();
    BranchStencil {
        target_slot: slot as u16,
        stencil: a.finish(),
    }
}

/// flags; `je8` over the store and jump; store; `jmp rel32`.
fn cond_br_with_store(k_int: u32, store: Assembler) -> BranchStencil {
    let mut a = Assembler::new();
    flags_from_int(&mut a, int_operand(k_int, 0));
    a.jcc8(Cc::E, (store.len() + 5) as i8);
    a.append(&store);
    let slot = a.jmp32();
    BranchStencil {
        target_slot: slot as u16,
        stencil: a.finish(),
    }
}

fn int_store_for_branch(
    old_k: u32,
    new_k: u32,
    spill: bool,
    wide: bool,
    value_depth: u32,
) -> Option<Assembler> {
    if spill && new_k > 0 {
        return None;
    }
    if new_k == MAX_INT_REGS && !spill {
        return None;
    }
    let remaining = old_k.saturating_sub(value_depth + 1);
    if !spill && new_k > remaining {
        return None;
    }
    let mut a = Assembler::new();
    store_int_result(&mut a, int_operand(old_k, value_depth), new_k, spill, wide);
    Some(a)
}

fn float_store_for_branch(old_k: u32, new_k: u32, spill: bool, wide: bool) -> Option<Assembler> {
    if spill && new_k > 0 {
        return None;
    }
    if new_k == MAX_FLOAT_REGS && !spill {
        return None;
    }
    let remaining = old_k.saturating_sub(1);
    if !spill && new_k > remaining {
        return None;
    }
    let mut a = Assembler::new();
    store_float_result(&mut a, float_operand(old_k, 0), new_k, spill, wide);
    Some(a)
}

const K: usize = MAX_INT_REGS as usize + 1;

fn idx3(a: u32, b: u32, d: bool) -> usize {
    (a as usize * K + b as usize) * 2 + d as usize
}

pub struct BranchLibrary {
    /// `[k_int]`: flags; je8 +5; jmp rel32.
    cond_plain: Vec<BranchStencil>,
    /// `[k_int]`: flags; je rel32 (the inverted `if` jump).
    if_plain: Vec<BranchStencil>,
    /// `[wide][old_k][new_k][spill]`.
    br_int: [Vec<Option<BranchStencil>>; 2],
    br_float: [Vec<Option<BranchStencil>>; 2],
    /// `[wide][cond_k = old_k][new_k][spill]`; the value sits below the
    /// condition.
    cond_int: [Vec<Option<BranchStencil>>; 2],
    /// `[wide][old_ki][old_kf][new_kf][spill]`, flattened.
    cond_float: [Vec<Option<BranchStencil>>; 2],
    /// Fallthrough fixups at a block's `end` (or `else`): store the
    /// in-register result into its spill slot, `[wide][k - 1]` ...
    end_store_int: [Vec<Stencil>; 2],
    end_store_float: [Vec<Stencil>; 2],
    /// ... or reload a spilled result into the bottom register, `[wide]`.
    end_reload_int: [Stencil; 2],
    end_reload_float: [Stencil; 2],
}

static BRANCHES: Lazy<BranchLibrary> = Lazy::new(BranchLibrary::build);

impl BranchLibrary {
    pub fn global() -> &'static BranchLibrary {
        &BRANCHES
    }

    /// Worst-case bytes for one branch emission.
    pub const MAX_EMIT: u32 = 48;

    fn build() -> BranchLibrary {
        let cond_plain = (0..K as u32)
            .map(|k| cond_br_with_store(k, Assembler::new()))
            .collect();

        let if_plain = (0..K as u32)
            .map(|k| {
                let mut a = Assembler::new();
                flags_from_int(&mut a, int_operand(k, 0));
                let slot = a.jcc32(Cc::E);
                BranchStencil {
                    target_slot: slot as u16,
                    stencil: a.finish(),
                }
            })
            .collect();

        let build_br_int = |wide: bool| {
            let mut v = Vec::with_capacity(K * K * 2);
            for old_k in 0..K as u32 {
                for new_k in 0..K as u32 {
                    for spill in [false, true] {
                        v.push(
                            int_store_for_branch(old_k, new_k, spill, wide, 0).map(br_with_store),
                        );
                    }
                }
            }
            v
        };
        let build_br_float = |wide: bool| {
            let mut v = Vec::with_capacity(K * K * 2);
            for old_k in 0..K as u32 {
                for new_k in 0..K as u32 {
                    for spill in [false, true] {
                        v.push(float_store_for_branch(old_k, new_k, spill, wide).map(br_with_store));
                    }
                }
            }
            v
        };
        let build_cond_int = |wide: bool| {
            let mut v = Vec::with_capacity(K * K * 2);
            for old_k in 0..K as u32 {
                for new_k in 0..K as u32 {
                    for spill in [false, true] {
                        // The condition is on top; the value one below.
                        v.push(
                            int_store_for_branch(old_k, new_k, spill, wide, 1)
                                .map(|store| cond_br_with_store(old_k, store)),
                        );
                    }
                }
            }
            v
        };
        let build_cond_float = |wide: bool| {
            let mut v = Vec::with_capacity(K * K * K * 2);
            for old_ki in 0..K as u32 {
                for old_kf in 0..K as u32 {
                    for new_kf in 0..K as u32 {
                        for spill in [false, true] {
                            v.push(
                                float_store_for_branch(old_kf, new_kf, spill, wide)
                                    .map(|store| cond_br_with_store(old_ki, store)),
                            );
                        }
                    }
                }
            }
            v
        };

        let build_end_store_int = |wide: bool| {
            (1..=MAX_INT_REGS as usize)
                .map(|k| {
                    let mut a = Assembler::new();
                    a.mov_store(wide, crate::abi::FRAME, 0, INT_REGS[k - 1]);
                    a.mark_reloc32(crate::stencil::SLOT_INT_TOP, 0);
                    a.finish()
                })
                .collect()
        };
        let build_end_store_float = |wide: bool| {
            (1..=MAX_FLOAT_REGS as usize)
                .map(|k| {
                    let mut a = Assembler::new();
                    a.movs_store(wide, crate::abi::FRAME, 0, crate::abi::FLOAT_REGS[k - 1]);
                    a.mark_reloc32(crate::stencil::SLOT_FLOAT_TOP, 0);
                    a.finish()
                })
                .collect()
        };
        let end_reload_int = [false, true].map(|wide| {
            let mut a = Assembler::new();
            load_int(&mut a, IntLoc::Stack(-8), INT_REGS[0], wide);
            a.finish()
        });
        let end_reload_float = [false, true].map(|wide| {
            let mut a = Assembler::new();
            load_float(&mut a, FloatLoc::Stack(-8), crate::abi::FLOAT_REGS[0], wide);
            a.finish()
        });

        BranchLibrary {
            cond_plain,
            if_plain,
            br_int: [build_br_int(false), build_br_int(true)],
            br_float: [build_br_float(false), build_br_float(true)],
            cond_int: [build_cond_int(false), build_cond_int(true)],
            cond_float: [build_cond_float(false), build_cond_float(true)],
            end_store_int: [build_end_store_int(false), build_end_store_int(true)],
            end_store_float: [build_end_store_float(false), build_end_store_float(true)],
            end_reload_int,
            end_reload_float,
        }
    }

    /// Fallthrough at a block boundary whose result was retroactively
    /// spilled: store the in-register value into the result slot.
    pub fn emit_end_store(&self, out: &mut CodeRegion, ty: ValType, k: u32, fixups: &FixupData) {
        let wide = ty.is_wide() as usize;
        let table = if ty.is_integral() {
            &self.end_store_int[wide]
        } else {
            &self.end_store_float[wide]
        };
        table[k as usize - 1].emit(out, fixups);
    }

    /// Fallthrough at a block boundary whose result stayed in-register
    /// per the block shape but was spilled by its producer: reload it.
    pub fn emit_end_reload(&self, out: &mut CodeRegion, ty: ValType, fixups: &FixupData) {
        let wide = ty.is_wide() as usize;
        let stencil = if ty.is_integral() {
            &self.end_reload_int[wide]
        } else {
            &self.end_reload_float[wide]
        };
        stencil.emit(out, fixups);
    }

    /// Unconditional branch carrying no value: a bare `jmp rel32`.
    pub fn emit_br(out: &mut CodeRegion) -> u32 {
        out.push_bytes(&[0xe9, 0, 0, 0, 0]);
        out.pos() - 4
    }

    /// `br_if` with no carried value.
    pub fn emit_cond_br(&self, out: &mut CodeRegion, k_int: u32, fixups: &FixupData) -> u32 {
        self.cond_plain[k_int as usize].emit(out, fixups)
    }

    /// The `if` opcode's inverted conditional jump; the returned slot is
    /// later resolved to the `else` (or `end`) address.
    pub fn emit_if(&self, out: &mut CodeRegion, k_int: u32, fixups: &FixupData) -> u32 {
        self.if_plain[k_int as usize].emit(out, fixups)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_br_with_output(
        &self,
        out: &mut CodeRegion,
        old_ki: u32,
        old_kf: u32,
        new_ki: u32,
        new_kf: u32,
        ty: ValType,
        spill: bool,
        fixups: &FixupData,
    ) -> u32 {
        let wide = ty.is_wide() as usize;
        let bs = if ty.is_integral() {
            self.br_int[wide][idx3(old_ki, new_ki, spill)].as_ref()
        } else {
            self.br_float[wide][idx3(old_kf, new_kf, spill)].as_ref()
        };
        bs.expect("no branch stencil for this operand shape")
            .emit(out, fixups)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_cond_br_with_output(
        &self,
        out: &mut CodeRegion,
        old_ki: u32,
        old_kf: u32,
        new_ki: u32,
        new_kf: u32,
        ty: ValType,
        spill: bool,
        fixups: &FixupData,
    ) -> u32 {
        let wide = ty.is_wide() as usize;
        let bs = if ty.is_integral() {
            self.cond_int[wide][idx3(old_ki, new_ki, spill)].as_ref()
        } else {
            let idx = ((old_ki as usize * K + old_kf as usize) * K + new_kf as usize) * 2
                + spill as usize;
            self.cond_float[wide][idx].as_ref()
        };
        bs.expect("no conditional branch stencil for this operand shape")
            .emit(out, fixups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_branches_end_in_a_displacement_slot() {
        let lib = BranchLibrary::global();
        for k in 0..=MAX_INT_REGS {
            let bs = &lib.cond_plain[k as usize];
            assert_eq!(bs.target_slot as usize, bs.stencil.len() - 4);
            // The jump over the exit is a two-byte je8 +5.
            let code = bs.stencil.code();
            let jmp_at = code.len() - 5;
            assert_eq!(code[jmp_at], 0xe9);
            assert_eq!(code[jmp_at - 2], 0x74);
            assert_eq!(code[jmp_at - 1], 5);
        }
    }

    #[test]
    fn if_branch_is_an_inverted_je32() {
        let lib = BranchLibrary::global();
        let code = lib.if_plain[1].stencil.code();
        // With one integer in registers the condition sits in rbx.
        assert_eq!(&code[..2], [0x85, 0xdb]); // test ebx, ebx
        assert_eq!(&code[2..4], [0x0f, 0x84]); // je rel32
    }

    #[test]
    fn branch_shape_rules() {
        let lib = BranchLibrary::global();
        // Carrying a value into three in-register slots is impossible.
        assert!(lib.br_int[0][idx3(3, 3, false)].is_none());
        // A spilled result with pending register values is impossible.
        assert!(lib.br_int[0][idx3(3, 1, true)].is_none());
        // Value in rbx (old_k = 1), target keeps zero registers, spilled.
        assert!(lib.br_int[0][idx3(1, 0, true)].is_some());
    }
}
