//! The common-opcode stencil library.
//!
//! Built once at startup: for every supported combination of
//! `(opcode, in-register ints, in-register floats, spill-output)` a
//! machine-code fragment is assembled and indexed in a flat table.
//!
//! Variant existence is a contract with the pre-pass: a spill variant
//! exists exactly when the in-register operand count does not exceed the
//! opcode's consumption (so nothing remains in registers once the result
//! is spilled), and a pure producer has no variant at full register
//! pressure unless it spills. The pre-pass never makes a spill decision
//! this table cannot serve.

use crate::abi::{FLOAT_REGS, FRAME, INT_REGS, MAX_FLOAT_REGS, MAX_INT_REGS};
use crate::asm::{Assembler, Cc, Gpr, Xmm};
use crate::stencil::{Stencil, SLOT_FLOAT_TOP, SLOT_IMM, SLOT_INT_TOP};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use module::{entity_ref, Opcode};
use once_cell::sync::Lazy;

entity_ref! {
    pub struct StencilId;
}

/// Location of one integer operand or result in a specific variant.
#[derive(Copy, Clone, Debug)]
pub(crate) enum IntLoc {
    Reg(Gpr),
    /// `[r13 + int_top + addend]`.
    Stack(i32),
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum FloatLoc {
    Reg(Xmm),
    /// `[r13 + float_top + addend]`.
    Stack(i32),
}

/// Operand at `depth` below the top, with `k` values in registers.
pub(crate) fn int_operand(k: u32, depth: u32) -> IntLoc {
    if depth < k {
        IntLoc::Reg(INT_REGS[(k - 1 - depth) as usize])
    } else {
        IntLoc::Stack(-8 * (depth - k + 1) as i32)
    }
}

pub(crate) fn float_operand(k: u32, depth: u32) -> FloatLoc {
    if depth < k {
        FloatLoc::Reg(FLOAT_REGS[(k - 1 - depth) as usize])
    } else {
        FloatLoc::Stack(-8 * (depth - k + 1) as i32)
    }
}

/// Result location after consuming `consumes` integers with `k` of them
/// in registers.
pub(crate) fn int_result(k: u32, consumes: u32, spill: bool) -> IntLoc {
    if spill {
        IntLoc::Stack(-8 * consumes.saturating_sub(k) as i32)
    } else {
        IntLoc::Reg(INT_REGS[k.saturating_sub(consumes) as usize])
    }
}

pub(crate) fn float_result(k: u32, consumes: u32, spill: bool) -> FloatLoc {
    if spill {
        FloatLoc::Stack(-8 * consumes.saturating_sub(k) as i32)
    } else {
        FloatLoc::Reg(FLOAT_REGS[k.saturating_sub(consumes) as usize])
    }
}

pub(crate) fn load_int(a: &mut Assembler, loc: IntLoc, dst: Gpr, wide: bool) {
    match loc {
        IntLoc::Reg(r) => a.mov_rr(wide, dst, r),
        IntLoc::Stack(addend) => {
            a.mov_load(wide, dst, FRAME, 0);
            a.mark_reloc32(SLOT_INT_TOP, addend as i64);
        }
    }
}

pub(crate) fn store_int(a: &mut Assembler, loc: IntLoc, src: Gpr, wide: bool) {
    match loc {
        IntLoc::Reg(r) => a.mov_rr(wide, r, src),
        IntLoc::Stack(addend) => {
            a.mov_store(wide, FRAME, 0, src);
            a.mark_reloc32(SLOT_INT_TOP, addend as i64);
        }
    }
}

pub(crate) fn load_float(a: &mut Assembler, loc: FloatLoc, dst: Xmm, wide: bool) {
    match loc {
        FloatLoc::Reg(r) => a.movaps_rr(dst, r),
        FloatLoc::Stack(addend) => {
            a.movs_load(wide, dst, FRAME, 0);
            a.mark_reloc32(SLOT_FLOAT_TOP, addend as i64);
        }
    }
}

pub(crate) fn store_float(a: &mut Assembler, loc: FloatLoc, src: Xmm, wide: bool) {
    match loc {
        FloatLoc::Reg(r) => a.movaps_rr(r, src),
        FloatLoc::Stack(addend) => {
            a.movs_store(wide, FRAME, 0, src);
            a.mark_reloc32(SLOT_FLOAT_TOP, addend as i64);
        }
    }
}

/// Raw-bits view of a float operand, into a GPR.
pub(crate) fn load_float_bits(a: &mut Assembler, loc: FloatLoc, dst: Gpr, wide: bool) {
    match loc {
        FloatLoc::Reg(r) => a.mov_rx(wide, dst, r),
        FloatLoc::Stack(addend) => {
            a.mov_load(wide, dst, FRAME, 0);
            a.mark_reloc32(SLOT_FLOAT_TOP, addend as i64);
        }
    }
}

pub(crate) fn store_float_bits(a: &mut Assembler, loc: FloatLoc, src: Gpr, wide: bool) {
    match loc {
        FloatLoc::Reg(r) => a.mov_xr(wide, r, src),
        FloatLoc::Stack(addend) => {
            a.mov_store(wide, FRAME, 0, src);
            a.mark_reloc32(SLOT_FLOAT_TOP, addend as i64);
        }
    }
}

/// ALU with a possibly in-memory right operand (reg,rm opcode form).
pub(crate) fn alu_int(a: &mut Assembler, opcode: u8, dst: Gpr, loc: IntLoc, wide: bool) {
    match loc {
        IntLoc::Reg(r) => a.alu_rr(wide, opcode, dst, r),
        IntLoc::Stack(addend) => {
            a.alu_load(wide, opcode, dst, FRAME, 0);
            a.mark_reloc32(SLOT_INT_TOP, addend as i64);
        }
    }
}

/// Sets flags from an integer condition operand.
pub(crate) fn flags_from_int(a: &mut Assembler, loc: IntLoc) {
    match loc {
        IntLoc::Reg(r) => a.test_rr(false, r, r),
        IntLoc::Stack(addend) => {
            a.cmp_mem_imm8(false, FRAME, 0, 0);
            // The disp32 is not the final field; the imm8 follows it.
            let offset = a.len() - 5;
            a.mark_reloc32_at(offset, SLOT_INT_TOP, addend as i64);
        }
    }
}

pub struct StencilLibrary {
    stencils: PrimaryMap<StencilId, Stencil>,
    table: Vec<PackedOption<StencilId>>,
    max_size: [u16; 256],
}

fn table_index(op: Opcode, ints: u32, floats: u32, spill: bool) -> usize {
    (((op as usize * (MAX_INT_REGS as usize + 1) + ints as usize) * (MAX_FLOAT_REGS as usize + 1))
        + floats as usize)
        * 2
        + spill as usize
}

static LIBRARY: Lazy<StencilLibrary> = Lazy::new(StencilLibrary::build);

impl StencilLibrary {
    pub fn global() -> &'static StencilLibrary {
        &LIBRARY
    }

    pub fn lookup(&self, op: Opcode, ints: u32, floats: u32, spill: bool) -> Option<&Stencil> {
        self.table[table_index(op, ints, floats, spill)]
            .expand()
            .map(|id| &self.stencils[id])
    }

    pub fn get(&self, op: Opcode, ints: u32, floats: u32, spill: bool) -> &Stencil {
        self.lookup(op, ints, floats, spill).unwrap_or_else(|| {
            panic!("no stencil for {op:?} ints={ints} floats={floats} spill={spill}")
        })
    }

    /// Largest variant of `op`, for emission-buffer reservation.
    pub fn max_size(&self, op: Opcode) -> u32 {
        self.max_size[op as usize] as u32
    }

    fn fill(&mut self, op: Opcode, f: impl Fn(u32, u32, bool) -> Option<Stencil>) {
        for ints in 0..=MAX_INT_REGS {
            for floats in 0..=MAX_FLOAT_REGS {
                for spill in [false, true] {
                    let idx = table_index(op, ints, floats, spill);
                    debug_assert!(self.table[idx].is_none(), "{op:?} registered twice");
                    if let Some(stencil) = f(ints, floats, spill) {
                        let len = stencil.len() as u16;
                        self.max_size[op as usize] = self.max_size[op as usize].max(len);
                        let id = self.stencils.push(stencil);
                        self.table[idx] = PackedOption::from(id);
                    }
                }
            }
        }
    }

    pub fn build() -> StencilLibrary {
        let mut lib = StencilLibrary {
            stencils: PrimaryMap::new(),
            table: vec![
                PackedOption::default();
                256 * (MAX_INT_REGS as usize + 1) * (MAX_FLOAT_REGS as usize + 1) * 2
            ],
            max_size: [0; 256],
        };
        build_into(&mut lib);
        tracing::debug!(
            stencils = lib.stencils.len(),
            bytes = lib.stencils.values().map(|s| s.len()).sum::<usize>(),
            "built stencil library"
        );
        lib
    }
}

// ---- family builders ----

#[derive(Copy, Clone)]
enum IntBinary {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    DivS,
    DivU,
    RemS,
    RemU,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

fn int_binary(kind: IntBinary, wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 2 {
            return None;
        }
        let lhs = int_operand(k, 1);
        let rhs = int_operand(k, 0);
        let result = int_result(k, 2, spill);
        let mut a = Assembler::new();
        let out = match kind {
            IntBinary::Add => {
                load_int(&mut a, lhs, Gpr::Rax, wide);
                alu_int(&mut a, 0x03, Gpr::Rax, rhs, wide);
                Gpr::Rax
            }
            IntBinary::Sub => {
                load_int(&mut a, lhs, Gpr::Rax, wide);
                alu_int(&mut a, 0x2b, Gpr::Rax, rhs, wide);
                Gpr::Rax
            }
            IntBinary::And => {
                load_int(&mut a, lhs, Gpr::Rax, wide);
                alu_int(&mut a, 0x23, Gpr::Rax, rhs, wide);
                Gpr::Rax
            }
            IntBinary::Or => {
                load_int(&mut a, lhs, Gpr::Rax, wide);
                alu_int(&mut a, 0x0b, Gpr::Rax, rhs, wide);
                Gpr::Rax
            }
            IntBinary::Xor => {
                load_int(&mut a, lhs, Gpr::Rax, wide);
                alu_int(&mut a, 0x33, Gpr::Rax, rhs, wide);
                Gpr::Rax
            }
            IntBinary::Mul => {
                load_int(&mut a, lhs, Gpr::Rax, wide);
                match rhs {
                    IntLoc::Reg(r) => a.imul_rr(wide, Gpr::Rax, r),
                    IntLoc::Stack(addend) => {
                        a.imul_load(wide, Gpr::Rax, FRAME, 0);
                        a.mark_reloc32(SLOT_INT_TOP, addend as i64);
                    }
                }
                Gpr::Rax
            }
            IntBinary::DivS | IntBinary::DivU | IntBinary::RemS | IntBinary::RemU => {
                let signed = matches!(kind, IntBinary::DivS | IntBinary::RemS);
                load_int(&mut a, rhs, Gpr::Rcx, wide);
                load_int(&mut a, lhs, Gpr::Rax, wide);
                if signed {
                    if wide {
                        a.cqo();
                    } else {
                        a.cdq();
                    }
                } else {
                    a.xor_zero(Gpr::Rdx);
                }
                a.div_r(wide, signed, Gpr::Rcx);
                if matches!(kind, IntBinary::RemS | IntBinary::RemU) {
                    Gpr::Rdx
                } else {
                    Gpr::Rax
                }
            }
            IntBinary::Shl | IntBinary::ShrS | IntBinary::ShrU | IntBinary::Rotl
            | IntBinary::Rotr => {
                // The hardware masks the count by 31/63.
                let ext = match kind {
                    IntBinary::Shl => 4,
                    IntBinary::ShrU => 5,
                    IntBinary::ShrS => 7,
                    IntBinary::Rotl => 0,
                    IntBinary::Rotr => 1,
                    _ => unreachable!(),
                };
                load_int(&mut a, rhs, Gpr::Rcx, wide);
                load_int(&mut a, lhs, Gpr::Rax, wide);
                a.shift_cl(wide, ext, Gpr::Rax);
                Gpr::Rax
            }
        };
        store_int(&mut a, result, out, wide);
        Some(a.finish())
    }
}

/// clz/ctz/popcnt.
fn int_bitcount(opcode: u8, wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 1 {
            return None;
        }
        let mut a = Assembler::new();
        match int_operand(k, 0) {
            IntLoc::Reg(r) => a.bitcount_rr(wide, opcode, Gpr::Rax, r),
            IntLoc::Stack(addend) => {
                a.bitcount_load(wide, opcode, Gpr::Rax, FRAME, 0);
                a.mark_reloc32(SLOT_INT_TOP, addend as i64);
            }
        }
        store_int(&mut a, int_result(k, 1, spill), Gpr::Rax, wide);
        Some(a.finish())
    }
}

fn int_eqz(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 1 {
            return None;
        }
        let mut a = Assembler::new();
        match int_operand(k, 0) {
            IntLoc::Reg(r) => a.test_rr(wide, r, r),
            IntLoc::Stack(addend) => {
                load_int(&mut a, IntLoc::Stack(addend), Gpr::Rax, wide);
                a.test_rr(wide, Gpr::Rax, Gpr::Rax);
            }
        }
        a.setcc(Cc::E, Gpr::Rax);
        a.movzx8_rr(Gpr::Rax, Gpr::Rax);
        store_int(&mut a, int_result(k, 1, spill), Gpr::Rax, false);
        Some(a.finish())
    }
}

fn int_compare(cc: Cc, wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 2 {
            return None;
        }
        let mut a = Assembler::new();
        load_int(&mut a, int_operand(k, 1), Gpr::Rax, wide);
        alu_int(&mut a, 0x3b, Gpr::Rax, int_operand(k, 0), wide);
        a.setcc(cc, Gpr::Rax);
        a.movzx8_rr(Gpr::Rax, Gpr::Rax);
        store_int(&mut a, int_result(k, 2, spill), Gpr::Rax, false);
        Some(a.finish())
    }
}

#[derive(Copy, Clone, PartialEq)]
enum FloatCmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn float_compare(op: FloatCmp, wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if k == MAX_INT_REGS && !spill {
            return None;
        }
        if spill && k != 0 {
            return None;
        }
        let mut a = Assembler::new();
        let lhs = match float_operand(kf, 1) {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(&mut a, loc, Xmm::Xmm0, wide);
                Xmm::Xmm0
            }
        };
        let rhs = match float_operand(kf, 0) {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(&mut a, loc, Xmm::Xmm1, wide);
                Xmm::Xmm1
            }
        };
        match op {
            FloatCmp::Eq => {
                a.ucomis_rr(wide, lhs, rhs);
                a.setcc(Cc::E, Gpr::Rax);
                a.setcc(Cc::Np, Gpr::Rcx);
                a.movzx8_rr(Gpr::Rax, Gpr::Rax);
                a.movzx8_rr(Gpr::Rcx, Gpr::Rcx);
                a.alu_rr(false, 0x23, Gpr::Rax, Gpr::Rcx);
            }
            FloatCmp::Ne => {
                a.ucomis_rr(wide, lhs, rhs);
                a.setcc(Cc::Ne, Gpr::Rax);
                a.setcc(Cc::P, Gpr::Rcx);
                a.movzx8_rr(Gpr::Rax, Gpr::Rax);
                a.movzx8_rr(Gpr::Rcx, Gpr::Rcx);
                a.alu_rr(false, 0x0b, Gpr::Rax, Gpr::Rcx);
            }
            // An unordered comparison sets CF, so strict/inclusive "above"
            // on swapped operands yields false on NaN.
            FloatCmp::Lt => {
                a.comis_rr(wide, rhs, lhs);
                a.setcc(Cc::A, Gpr::Rax);
                a.movzx8_rr(Gpr::Rax, Gpr::Rax);
            }
            FloatCmp::Le => {
                a.comis_rr(wide, rhs, lhs);
                a.setcc(Cc::Ae, Gpr::Rax);
                a.movzx8_rr(Gpr::Rax, Gpr::Rax);
            }
            FloatCmp::Gt => {
                a.comis_rr(wide, lhs, rhs);
                a.setcc(Cc::A, Gpr::Rax);
                a.movzx8_rr(Gpr::Rax, Gpr::Rax);
            }
            FloatCmp::Ge => {
                a.comis_rr(wide, lhs, rhs);
                a.setcc(Cc::Ae, Gpr::Rax);
                a.movzx8_rr(Gpr::Rax, Gpr::Rax);
            }
        }
        store_int(&mut a, int_result(k, 0, spill), Gpr::Rax, false);
        Some(a.finish())
    }
}

#[derive(Copy, Clone)]
enum FloatBinary {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Copysign,
}

fn float_binary(kind: FloatBinary, wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if spill && kf > 2 {
            return None;
        }
        let lhs = float_operand(kf, 1);
        let rhs = float_operand(kf, 0);
        let result = float_result(kf, 2, spill);
        let mut a = Assembler::new();
        if let FloatBinary::Copysign = kind {
            load_float_bits(&mut a, lhs, Gpr::Rax, wide);
            load_float_bits(&mut a, rhs, Gpr::Rcx, wide);
            if wide {
                a.mov_ri64(Gpr::Rdx, 0x7fff_ffff_ffff_ffff);
                a.alu_rr(true, 0x23, Gpr::Rax, Gpr::Rdx);
                a.mov_ri64(Gpr::Rdx, 0x8000_0000_0000_0000);
                a.alu_rr(true, 0x23, Gpr::Rcx, Gpr::Rdx);
                a.alu_rr(true, 0x0b, Gpr::Rax, Gpr::Rcx);
            } else {
                a.alu_ri32(false, 4, Gpr::Rax, 0x7fff_ffff);
                a.alu_ri32(false, 4, Gpr::Rcx, 0x8000_0000u32 as i32);
                a.alu_rr(false, 0x0b, Gpr::Rax, Gpr::Rcx);
            }
            store_float_bits(&mut a, result, Gpr::Rax, wide);
            return Some(a.finish());
        }
        let opcode = match kind {
            FloatBinary::Add => 0x58,
            FloatBinary::Mul => 0x59,
            FloatBinary::Sub => 0x5c,
            FloatBinary::Min => 0x5d,
            FloatBinary::Div => 0x5e,
            FloatBinary::Max => 0x5f,
            FloatBinary::Copysign => unreachable!(),
        };
        load_float(&mut a, lhs, Xmm::Xmm0, wide);
        match rhs {
            FloatLoc::Reg(r) => a.scalar_rr(wide, opcode, Xmm::Xmm0, r),
            FloatLoc::Stack(addend) => {
                a.scalar_load(wide, opcode, Xmm::Xmm0, FRAME, 0);
                a.mark_reloc32(SLOT_FLOAT_TOP, addend as i64);
            }
        }
        store_float(&mut a, result, Xmm::Xmm0, wide);
        Some(a.finish())
    }
}

#[derive(Copy, Clone)]
enum FloatUnary {
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
}

fn float_unary(kind: FloatUnary, wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if spill && kf > 1 {
            return None;
        }
        let src = float_operand(kf, 0);
        let result = float_result(kf, 1, spill);
        let mut a = Assembler::new();
        match kind {
            FloatUnary::Abs => {
                load_float_bits(&mut a, src, Gpr::Rax, wide);
                if wide {
                    a.mov_ri64(Gpr::Rcx, 0x7fff_ffff_ffff_ffff);
                    a.alu_rr(true, 0x23, Gpr::Rax, Gpr::Rcx);
                } else {
                    a.alu_ri32(false, 4, Gpr::Rax, 0x7fff_ffff);
                }
                store_float_bits(&mut a, result, Gpr::Rax, wide);
            }
            FloatUnary::Neg => {
                load_float_bits(&mut a, src, Gpr::Rax, wide);
                if wide {
                    a.mov_ri64(Gpr::Rcx, 0x8000_0000_0000_0000);
                    a.alu_rr(true, 0x33, Gpr::Rax, Gpr::Rcx);
                } else {
                    a.alu_ri32(false, 6, Gpr::Rax, 0x8000_0000u32 as i32);
                }
                store_float_bits(&mut a, result, Gpr::Rax, wide);
            }
            FloatUnary::Ceil | FloatUnary::Floor | FloatUnary::Trunc | FloatUnary::Nearest => {
                let mode = match kind {
                    FloatUnary::Nearest => 0,
                    FloatUnary::Floor => 1,
                    FloatUnary::Ceil => 2,
                    FloatUnary::Trunc => 3,
                    _ => unreachable!(),
                };
                load_float(&mut a, src, Xmm::Xmm0, wide);
                a.round_rr(wide, Xmm::Xmm0, Xmm::Xmm0, mode);
                store_float(&mut a, result, Xmm::Xmm0, wide);
            }
            FloatUnary::Sqrt => {
                load_float(&mut a, src, Xmm::Xmm0, wide);
                a.scalar_rr(wide, 0x51, Xmm::Xmm0, Xmm::Xmm0);
                store_float(&mut a, result, Xmm::Xmm0, wide);
            }
        }
        Some(a.finish())
    }
}

/// i32.wrap_i64, the sign extensions, and i64.extend_i32_*.
#[derive(Copy, Clone)]
enum IntConv {
    Wrap,
    Extend8(bool),
    Extend16(bool),
    Extend32S,
    ExtendI32S,
    ExtendI32U,
}

fn int_conversion(kind: IntConv) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 1 {
            return None;
        }
        let src = int_operand(k, 0);
        let mut a = Assembler::new();
        let wide_out = match kind {
            IntConv::Wrap => {
                load_int(&mut a, src, Gpr::Rax, false);
                false
            }
            IntConv::Extend8(wide) => {
                load_int(&mut a, src, Gpr::Rax, false);
                a.movsx8_rr(wide, Gpr::Rax, Gpr::Rax);
                wide
            }
            IntConv::Extend16(wide) => {
                load_int(&mut a, src, Gpr::Rax, false);
                a.movsx16_rr(wide, Gpr::Rax, Gpr::Rax);
                wide
            }
            IntConv::Extend32S | IntConv::ExtendI32S => {
                load_int(&mut a, src, Gpr::Rax, false);
                a.movsxd_rr(Gpr::Rax, Gpr::Rax);
                true
            }
            IntConv::ExtendI32U => {
                // A 32-bit move zero-extends.
                load_int(&mut a, src, Gpr::Rax, false);
                true
            }
        };
        store_int(&mut a, int_result(k, 1, spill), Gpr::Rax, wide_out);
        Some(a.finish())
    }
}

/// trunc: float to int. Unsigned 64-bit goes through the signed
/// conversion, as the source implementation does.
fn trunc_to_int(src_wide: bool, dst_wide: bool, dst_unsigned_32: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if spill && k != 0 {
            return None;
        }
        if k == MAX_INT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        let src = match float_operand(kf, 0) {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(&mut a, loc, Xmm::Xmm0, src_wide);
                Xmm::Xmm0
            }
        };
        // u32 results use the 64-bit conversion and keep the low half.
        let w = dst_wide || dst_unsigned_32;
        a.cvtts2si_rr(src_wide, w, Gpr::Rax, src);
        store_int(&mut a, int_result(k, 0, spill), Gpr::Rax, dst_wide);
        Some(a.finish())
    }
}

/// convert: int to float.
fn convert_to_float(src_wide: bool, src_unsigned_32: bool, src_signed64: bool, dst_wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if spill && kf != 0 {
            return None;
        }
        if kf == MAX_FLOAT_REGS && !spill {
            return None;
        }
        let src = int_operand(k, 0);
        let mut a = Assembler::new();
        if src_unsigned_32 {
            // Zero-extend, then convert from 64 bits.
            load_int(&mut a, src, Gpr::Rax, false);
            a.cvtsi2s_rr(dst_wide, true, Xmm::Xmm0, Gpr::Rax);
        } else {
            let w = src_wide || src_signed64;
            match src {
                IntLoc::Reg(r) => a.cvtsi2s_rr(dst_wide, w, Xmm::Xmm0, r),
                IntLoc::Stack(addend) => {
                    a.cvtsi2s_load(dst_wide, w, Xmm::Xmm0, FRAME, 0);
                    a.mark_reloc32(SLOT_INT_TOP, addend as i64);
                }
            }
        }
        store_float(&mut a, float_result(kf, 0, spill), Xmm::Xmm0, dst_wide);
        Some(a.finish())
    }
}

fn float_to_float(to_wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if spill && kf > 1 {
            return None;
        }
        let from_wide = !to_wide;
        let mut a = Assembler::new();
        load_float(&mut a, float_operand(kf, 0), Xmm::Xmm0, from_wide);
        a.scalar_rr(from_wide, 0x5a, Xmm::Xmm0, Xmm::Xmm0);
        store_float(&mut a, float_result(kf, 1, spill), Xmm::Xmm0, to_wide);
        Some(a.finish())
    }
}

fn bitcast_float_to_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if spill && k > 0 {
            return None;
        }
        if k == MAX_INT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        load_float_bits(&mut a, float_operand(kf, 0), Gpr::Rax, wide);
        store_int(&mut a, int_result(k, 0, spill), Gpr::Rax, wide);
        Some(a.finish())
    }
}

fn bitcast_int_to_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if spill && kf > 0 {
            return None;
        }
        if kf == MAX_FLOAT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        load_int(&mut a, int_operand(k, 0), Gpr::Rax, wide);
        store_float_bits(&mut a, float_result(kf, 0, spill), Gpr::Rax, wide);
        Some(a.finish())
    }
}

fn const_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 0 {
            return None;
        }
        if k == MAX_INT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        if wide {
            a.mov_ri64(Gpr::Rax, 0);
            a.mark_reloc64(SLOT_IMM, 0);
            store_int(&mut a, int_result(k, 0, spill), Gpr::Rax, true);
        } else {
            match int_result(k, 0, spill) {
                IntLoc::Reg(r) => {
                    a.mov_ri32(r, 0);
                    a.mark_reloc32(SLOT_IMM, 0);
                }
                IntLoc::Stack(addend) => {
                    debug_assert_eq!(addend, 0);
                    // mov dword [r13 + int_top], imm32: two relocations.
                    a.mov_store_imm32(false, FRAME, 0, 0);
                    let disp_offset = a.len() - 8;
                    a.mark_reloc32_at(disp_offset, SLOT_INT_TOP, 0);
                    a.mark_reloc32(SLOT_IMM, 0);
                }
            }
        }
        Some(a.finish())
    }
}

fn const_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if spill && kf > 0 {
            return None;
        }
        if kf == MAX_FLOAT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        if wide {
            a.mov_ri64(Gpr::Rax, 0);
            a.mark_reloc64(SLOT_IMM, 0);
        } else {
            a.mov_ri32(Gpr::Rax, 0);
            a.mark_reloc32(SLOT_IMM, 0);
        }
        store_float_bits(&mut a, float_result(kf, 0, spill), Gpr::Rax, wide);
        Some(a.finish())
    }
}

fn local_get_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 0 {
            return None;
        }
        if k == MAX_INT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        match int_result(k, 0, spill) {
            IntLoc::Reg(r) => {
                a.mov_load(wide, r, FRAME, 0);
                a.mark_reloc32(SLOT_IMM, 0);
            }
            loc => {
                a.mov_load(wide, Gpr::Rax, FRAME, 0);
                a.mark_reloc32(SLOT_IMM, 0);
                store_int(&mut a, loc, Gpr::Rax, wide);
            }
        }
        Some(a.finish())
    }
}

fn local_get_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if spill && kf > 0 {
            return None;
        }
        if kf == MAX_FLOAT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        match float_result(kf, 0, spill) {
            FloatLoc::Reg(r) => {
                a.movs_load(wide, r, FRAME, 0);
                a.mark_reloc32(SLOT_IMM, 0);
            }
            loc => {
                a.mov_load(wide, Gpr::Rax, FRAME, 0);
                a.mark_reloc32(SLOT_IMM, 0);
                store_float_bits(&mut a, loc, Gpr::Rax, wide);
            }
        }
        Some(a.finish())
    }
}

/// `local.set` and `local.tee` share the store; tee keeps the operand.
fn local_set_int(wide: bool, tee: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if tee && spill && k > 1 {
            return None;
        }
        let mut a = Assembler::new();
        match int_operand(k, 0) {
            IntLoc::Reg(r) => {
                a.mov_store(wide, FRAME, 0, r);
                a.mark_reloc32(SLOT_IMM, 0);
                // Tee without spill keeps the value where it is.
                if tee && spill {
                    store_int(&mut a, int_result(k, 1, true), r, wide);
                }
            }
            loc => {
                load_int(&mut a, loc, Gpr::Rax, wide);
                a.mov_store(wide, FRAME, 0, Gpr::Rax);
                a.mark_reloc32(SLOT_IMM, 0);
                if tee && !spill {
                    store_int(&mut a, int_result(k, 1, false), Gpr::Rax, wide);
                }
                // Tee with spill from memory leaves the value in place.
            }
        }
        Some(a.finish())
    }
}

fn local_set_float(wide: bool, tee: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if tee && spill && kf > 1 {
            return None;
        }
        let mut a = Assembler::new();
        match float_operand(kf, 0) {
            FloatLoc::Reg(r) => {
                a.movs_store(wide, FRAME, 0, r);
                a.mark_reloc32(SLOT_IMM, 0);
                if tee && spill {
                    store_float(&mut a, float_result(kf, 1, true), r, wide);
                }
            }
            loc => {
                load_float_bits(&mut a, loc, Gpr::Rax, wide);
                a.mov_store(wide, FRAME, 0, Gpr::Rax);
                a.mark_reloc32(SLOT_IMM, 0);
                if tee && !spill {
                    store_float_bits(&mut a, float_result(kf, 1, false), Gpr::Rax, wide);
                }
            }
        }
        Some(a.finish())
    }
}

/// Globals live in the negative metadata region; the immediate arrives
/// pre-negated and is used as a sign-extended absolute displacement.
fn global_get_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 0 {
            return None;
        }
        if k == MAX_INT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        match int_result(k, 0, spill) {
            IntLoc::Reg(r) => {
                a.mov_load_gs_abs(wide, r, 0);
                a.mark_reloc32(SLOT_IMM, 0);
            }
            loc => {
                a.mov_load_gs_abs(wide, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_IMM, 0);
                store_int(&mut a, loc, Gpr::Rax, wide);
            }
        }
        Some(a.finish())
    }
}

fn global_get_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, spill| {
        if spill && kf > 0 {
            return None;
        }
        if kf == MAX_FLOAT_REGS && !spill {
            return None;
        }
        let mut a = Assembler::new();
        match float_result(kf, 0, spill) {
            FloatLoc::Reg(r) => {
                a.movs_load_gs_abs(wide, r, 0);
                a.mark_reloc32(SLOT_IMM, 0);
            }
            loc => {
                a.mov_load_gs_abs(wide, Gpr::Rax, 0);
                a.mark_reloc32(SLOT_IMM, 0);
                store_float_bits(&mut a, loc, Gpr::Rax, wide);
            }
        }
        Some(a.finish())
    }
}

fn global_set_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, _spill| {
        let mut a = Assembler::new();
        let src = match int_operand(k, 0) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rax, wide);
                Gpr::Rax
            }
        };
        a.mov_store_gs_abs(wide, 0, src);
        a.mark_reloc32(SLOT_IMM, 0);
        Some(a.finish())
    }
}

fn global_set_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, _spill| {
        let mut a = Assembler::new();
        let src = match float_operand(kf, 0) {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(&mut a, loc, Xmm::Xmm0, wide);
                Xmm::Xmm0
            }
        };
        a.movs_store_gs_abs(wide, 0, src);
        a.mark_reloc32(SLOT_IMM, 0);
        Some(a.finish())
    }
}

/// Linear-memory loads. `ld` emits the actual GS load from
/// `[index + offset]` into rax.
fn memory_load_int(
    wide_out: bool,
    ld: impl Fn(&mut Assembler, Gpr) + Copy,
) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        if spill && k > 1 {
            return None;
        }
        let mut a = Assembler::new();
        let idx = match int_operand(k, 0) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rcx, false);
                Gpr::Rcx
            }
        };
        ld(&mut a, idx);
        a.mark_reloc32(SLOT_IMM, 0);
        store_int(&mut a, int_result(k, 1, spill), Gpr::Rax, wide_out);
        Some(a.finish())
    }
}

fn memory_load_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if kf == MAX_FLOAT_REGS && !spill {
            return None;
        }
        if spill && kf != 0 {
            return None;
        }
        let mut a = Assembler::new();
        let idx = match int_operand(k, 0) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rcx, false);
                Gpr::Rcx
            }
        };
        a.movs_load_gs(wide, Xmm::Xmm0, idx, 0);
        a.mark_reloc32(SLOT_IMM, 0);
        store_float(&mut a, float_result(kf, 0, spill), Xmm::Xmm0, wide);
        Some(a.finish())
    }
}

#[derive(Copy, Clone)]
enum StoreWidth {
    B8,
    B16,
    B32,
    B64,
}

fn memory_store_int(value_wide: bool, width: StoreWidth) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, _spill| {
        let mut a = Assembler::new();
        let value = match int_operand(k, 0) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rax, value_wide);
                Gpr::Rax
            }
        };
        let idx = match int_operand(k, 1) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rcx, false);
                Gpr::Rcx
            }
        };
        match width {
            StoreWidth::B8 => a.mov_store8_gs(idx, 0, value),
            StoreWidth::B16 => a.mov_store16_gs(idx, 0, value),
            StoreWidth::B32 => a.mov_store_gs(false, idx, 0, value),
            StoreWidth::B64 => a.mov_store_gs(true, idx, 0, value),
        }
        a.mark_reloc32(SLOT_IMM, 0);
        Some(a.finish())
    }
}

fn memory_store_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, _spill| {
        let mut a = Assembler::new();
        let value = match float_operand(kf, 0) {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(&mut a, loc, Xmm::Xmm0, wide);
                Xmm::Xmm0
            }
        };
        let idx = match int_operand(k, 0) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rcx, false);
                Gpr::Rcx
            }
        };
        a.movs_store_gs(wide, idx, 0, value);
        a.mark_reloc32(SLOT_IMM, 0);
        Some(a.finish())
    }
}

fn select_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, spill| {
        // Three consumes; the spill variant exists at any register count.
        let cond = int_operand(k, 0);
        let if_false = int_operand(k, 1);
        let if_true = int_operand(k, 2);
        let mut a = Assembler::new();
        load_int(&mut a, if_true, Gpr::Rax, wide);
        load_int(&mut a, if_false, Gpr::Rcx, wide);
        flags_from_int(&mut a, cond);
        a.cmovcc_rr(wide, Cc::E, Gpr::Rax, Gpr::Rcx);
        store_int(&mut a, int_result(k, 3, spill), Gpr::Rax, wide);
        Some(a.finish())
    }
}

fn select_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, kf, spill| {
        if spill && kf > 2 {
            return None;
        }
        let cond = int_operand(k, 0);
        let if_false = float_operand(kf, 0);
        let if_true = float_operand(kf, 1);
        let mut a = Assembler::new();
        load_float(&mut a, if_true, Xmm::Xmm0, wide);
        flags_from_int(&mut a, cond);
        // Keep the false value when the condition is zero.
        let skip_len = match if_false {
            FloatLoc::Reg(_) => 3,   // movaps xmm0, reg
            FloatLoc::Stack(_) => 9, // movss/movsd load with disp32
        };
        a.jcc8(Cc::Ne, skip_len);
        load_float(&mut a, if_false, Xmm::Xmm0, wide);
        store_float(&mut a, float_result(kf, 2, spill), Xmm::Xmm0, wide);
        Some(a.finish())
    }
}

/// Parameter fill for calls: store the operand-stack top into the callee
/// frame at `[r14 + imm]`.
fn fill_param_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, _spill| {
        let mut a = Assembler::new();
        let src = match int_operand(k, 0) {
            IntLoc::Reg(r) => r,
            loc => {
                load_int(&mut a, loc, Gpr::Rax, wide);
                Gpr::Rax
            }
        };
        a.mov_store(wide, crate::abi::CALLEE_FRAME, 0, src);
        a.mark_reloc32(SLOT_IMM, 0);
        Some(a.finish())
    }
}

fn fill_param_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, _spill| {
        let mut a = Assembler::new();
        let src = match float_operand(kf, 0) {
            FloatLoc::Reg(r) => r,
            loc => {
                load_float(&mut a, loc, Xmm::Xmm0, wide);
                Xmm::Xmm0
            }
        };
        a.movs_store(wide, crate::abi::CALLEE_FRAME, 0, src);
        a.mark_reloc32(SLOT_IMM, 0);
        Some(a.finish())
    }
}

fn switch_frame() -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, _kf, _spill| {
        let mut a = Assembler::new();
        a.mov_rr(true, FRAME, crate::abi::CALLEE_FRAME);
        Some(a.finish())
    }
}

fn return_int(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |k, _kf, _spill| {
        let mut a = Assembler::new();
        load_int(&mut a, int_operand(k, 0), Gpr::Rax, wide);
        a.ret();
        Some(a.finish())
    }
}

fn return_float(wide: bool) -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, kf, _spill| {
        let mut a = Assembler::new();
        load_float(&mut a, float_operand(kf, 0), Xmm::Xmm0, wide);
        a.ret();
        Some(a.finish())
    }
}

fn return_none() -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, _kf, _spill| {
        let mut a = Assembler::new();
        a.ret();
        Some(a.finish())
    }
}

/// Dropping a value is pure bookkeeping; the stencil is empty.
fn drop_value() -> impl Fn(u32, u32, bool) -> Option<Stencil> {
    move |_k, _kf, _spill| Some(Assembler::new().finish())
}

fn build_into(lib: &mut StencilLibrary) {
    use Opcode::*;

    // Memory loads.
    lib.fill(I32Load, memory_load_int(false, |a, idx| a.mov_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I64Load, memory_load_int(true, |a, idx| a.mov_load_gs(true, Gpr::Rax, idx, 0)));
    lib.fill(F32Load, memory_load_float(false));
    lib.fill(F64Load, memory_load_float(true));
    lib.fill(I32Load8S, memory_load_int(false, |a, idx| a.movsx8_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I32Load8U, memory_load_int(false, |a, idx| a.movzx8_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I32Load16S, memory_load_int(false, |a, idx| a.movsx16_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I32Load16U, memory_load_int(false, |a, idx| a.movzx16_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I64Load8S, memory_load_int(true, |a, idx| a.movsx8_load_gs(true, Gpr::Rax, idx, 0)));
    lib.fill(I64Load8U, memory_load_int(true, |a, idx| a.movzx8_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I64Load16S, memory_load_int(true, |a, idx| a.movsx16_load_gs(true, Gpr::Rax, idx, 0)));
    lib.fill(I64Load16U, memory_load_int(true, |a, idx| a.movzx16_load_gs(false, Gpr::Rax, idx, 0)));
    lib.fill(I64Load32S, memory_load_int(true, |a, idx| a.movsxd_load_gs(Gpr::Rax, idx, 0)));
    lib.fill(I64Load32U, memory_load_int(true, |a, idx| a.mov_load_gs(false, Gpr::Rax, idx, 0)));

    // Memory stores.
    lib.fill(I32Store, memory_store_int(false, StoreWidth::B32));
    lib.fill(I64Store, memory_store_int(true, StoreWidth::B64));
    lib.fill(F32Store, memory_store_float(false));
    lib.fill(F64Store, memory_store_float(true));
    lib.fill(I32Store8, memory_store_int(false, StoreWidth::B8));
    lib.fill(I32Store16, memory_store_int(false, StoreWidth::B16));
    lib.fill(I64Store8, memory_store_int(true, StoreWidth::B8));
    lib.fill(I64Store16, memory_store_int(true, StoreWidth::B16));
    lib.fill(I64Store32, memory_store_int(true, StoreWidth::B32));

    // Constants.
    lib.fill(I32Const, const_int(false));
    lib.fill(I64Const, const_int(true));
    lib.fill(F32Const, const_float(false));
    lib.fill(F64Const, const_float(true));

    // Integer comparisons.
    lib.fill(I32Eqz, int_eqz(false));
    lib.fill(I64Eqz, int_eqz(true));
    for (eq_op, wide) in [(I32Eq, false), (I64Eq, true)] {
        let base = eq_op as u8;
        let ccs = [Cc::E, Cc::Ne, Cc::L, Cc::B, Cc::G, Cc::A, Cc::Le, Cc::Be, Cc::Ge, Cc::Ae];
        for (i, cc) in ccs.into_iter().enumerate() {
            lib.fill(Opcode::from_wire(base + i as u8), int_compare(cc, wide));
        }
    }

    // Float comparisons.
    for (eq_op, wide) in [(F32Eq, false), (F64Eq, true)] {
        let base = eq_op as u8;
        let ops = [FloatCmp::Eq, FloatCmp::Ne, FloatCmp::Lt, FloatCmp::Gt, FloatCmp::Le, FloatCmp::Ge];
        for (i, op) in ops.into_iter().enumerate() {
            lib.fill(Opcode::from_wire(base + i as u8), float_compare(op, wide));
        }
    }

    // Integer arithmetic.
    lib.fill(I32Clz, int_bitcount(0xbd, false));
    lib.fill(I32Ctz, int_bitcount(0xbc, false));
    lib.fill(I32Popcnt, int_bitcount(0xb8, false));
    lib.fill(I64Clz, int_bitcount(0xbd, true));
    lib.fill(I64Ctz, int_bitcount(0xbc, true));
    lib.fill(I64Popcnt, int_bitcount(0xb8, true));
    for (add_op, wide) in [(I32Add, false), (I64Add, true)] {
        let base = add_op as u8;
        let kinds = [
            IntBinary::Add,
            IntBinary::Sub,
            IntBinary::Mul,
            IntBinary::DivS,
            IntBinary::DivU,
            IntBinary::RemS,
            IntBinary::RemU,
            IntBinary::And,
            IntBinary::Or,
            IntBinary::Xor,
            IntBinary::Shl,
            IntBinary::ShrS,
            IntBinary::ShrU,
            IntBinary::Rotl,
            IntBinary::Rotr,
        ];
        for (i, kind) in kinds.into_iter().enumerate() {
            lib.fill(Opcode::from_wire(base + i as u8), int_binary(kind, wide));
        }
    }

    // Float arithmetic.
    for (abs_op, wide) in [(F32Abs, false), (F64Abs, true)] {
        let base = abs_op as u8;
        let unary = [
            FloatUnary::Abs,
            FloatUnary::Neg,
            FloatUnary::Ceil,
            FloatUnary::Floor,
            FloatUnary::Trunc,
            FloatUnary::Nearest,
            FloatUnary::Sqrt,
        ];
        for (i, kind) in unary.into_iter().enumerate() {
            lib.fill(Opcode::from_wire(base + i as u8), float_unary(kind, wide));
        }
        let binary = [
            FloatBinary::Add,
            FloatBinary::Sub,
            FloatBinary::Mul,
            FloatBinary::Div,
            FloatBinary::Min,
            FloatBinary::Max,
            FloatBinary::Copysign,
        ];
        for (i, kind) in binary.into_iter().enumerate() {
            lib.fill(Opcode::from_wire(base + 7 + i as u8), float_binary(kind, wide));
        }
    }

    // Conversions.
    lib.fill(I32WrapI64, int_conversion(IntConv::Wrap));
    lib.fill(I32TruncF32S, trunc_to_int(false, false, false));
    lib.fill(I32TruncF32U, trunc_to_int(false, false, true));
    lib.fill(I32TruncF64S, trunc_to_int(true, false, false));
    lib.fill(I32TruncF64U, trunc_to_int(true, false, true));
    lib.fill(I64ExtendI32S, int_conversion(IntConv::ExtendI32S));
    lib.fill(I64ExtendI32U, int_conversion(IntConv::ExtendI32U));
    lib.fill(I64TruncF32S, trunc_to_int(false, true, false));
    lib.fill(I64TruncF32U, trunc_to_int(false, true, false));
    lib.fill(I64TruncF64S, trunc_to_int(true, true, false));
    lib.fill(I64TruncF64U, trunc_to_int(true, true, false));
    lib.fill(F32ConvertI32S, convert_to_float(false, false, false, false));
    lib.fill(F32ConvertI32U, convert_to_float(false, true, false, false));
    lib.fill(F32ConvertI64S, convert_to_float(true, false, false, false));
    lib.fill(F32ConvertI64U, convert_to_float(true, false, true, false));
    lib.fill(F32DemoteF64, float_to_float(false));
    lib.fill(F64ConvertI32S, convert_to_float(false, false, false, true));
    lib.fill(F64ConvertI32U, convert_to_float(false, true, false, true));
    lib.fill(F64ConvertI64S, convert_to_float(true, false, false, true));
    lib.fill(F64ConvertI64U, convert_to_float(true, false, true, true));
    lib.fill(F64PromoteF32, float_to_float(true));

    lib.fill(I32ReinterpretF32, bitcast_float_to_int(false));
    lib.fill(I64ReinterpretF64, bitcast_float_to_int(true));
    lib.fill(F32ReinterpretI32, bitcast_int_to_float(false));
    lib.fill(F64ReinterpretI64, bitcast_int_to_float(true));

    lib.fill(I32Extend8S, int_conversion(IntConv::Extend8(false)));
    lib.fill(I32Extend16S, int_conversion(IntConv::Extend16(false)));
    lib.fill(I64Extend8S, int_conversion(IntConv::Extend8(true)));
    lib.fill(I64Extend16S, int_conversion(IntConv::Extend16(true)));
    lib.fill(I64Extend32S, int_conversion(IntConv::Extend32S));

    // Call lowering helpers.
    lib.fill(SwitchFrame, switch_frame());
    lib.fill(FillParamI32, fill_param_int(false));
    lib.fill(FillParamI64, fill_param_int(true));
    lib.fill(FillParamF32, fill_param_float(false));
    lib.fill(FillParamF64, fill_param_float(true));

    lib.fill(ReturnI32, return_int(false));
    lib.fill(ReturnI64, return_int(true));
    lib.fill(ReturnF32, return_float(false));
    lib.fill(ReturnF64, return_float(true));
    lib.fill(ReturnNone, return_none());

    lib.fill(DropInt, drop_value());
    lib.fill(DropFloat, drop_value());

    lib.fill(SelectI32, select_int(false));
    lib.fill(SelectI64, select_int(true));
    lib.fill(SelectF32, select_float(false));
    lib.fill(SelectF64, select_float(true));

    // Typed local and global accesses.
    lib.fill(LocalGetI32, local_get_int(false));
    lib.fill(LocalGetI64, local_get_int(true));
    lib.fill(LocalGetF32, local_get_float(false));
    lib.fill(LocalGetF64, local_get_float(true));
    lib.fill(LocalSetI32, local_set_int(false, false));
    lib.fill(LocalSetI64, local_set_int(true, false));
    lib.fill(LocalSetF32, local_set_float(false, false));
    lib.fill(LocalSetF64, local_set_float(true, false));
    lib.fill(LocalTeeI32, local_set_int(false, true));
    lib.fill(LocalTeeI64, local_set_int(true, true));
    lib.fill(LocalTeeF32, local_set_float(false, true));
    lib.fill(LocalTeeF64, local_set_float(true, true));

    lib.fill(GlobalGetI32, global_get_int(false));
    lib.fill(GlobalGetI64, global_get_int(true));
    lib.fill(GlobalGetF32, global_get_float(false));
    lib.fill(GlobalGetF64, global_get_float(true));
    lib.fill(GlobalSetI32, global_set_int(false));
    lib.fill(GlobalSetI64, global_set_int(true));
    lib.fill(GlobalSetF32, global_set_float(false));
    lib.fill(GlobalSetF64, global_set_float(true));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_variants_exist_only_at_low_pressure() {
        let lib = StencilLibrary::global();
        // Binary op: spill exists for k <= 2.
        for k in 0..=2 {
            assert!(lib.lookup(Opcode::I32Add, k, 0, true).is_some());
        }
        assert!(lib.lookup(Opcode::I32Add, 3, 0, true).is_none());
        // Producer: no variant at full pressure without spill.
        assert!(lib.lookup(Opcode::I32Const, 3, 0, false).is_none());
        assert!(lib.lookup(Opcode::I32Const, 0, 0, true).is_some());
        assert!(lib.lookup(Opcode::I32Const, 1, 0, true).is_none());
        // Float producer pressure is on the float side.
        assert!(lib.lookup(Opcode::F64Const, 0, 3, false).is_none());
        assert!(lib.lookup(Opcode::F64Const, 3, 2, false).is_some());
    }

    #[test]
    fn add_stencil_bytes_at_full_register_pressure() {
        let lib = StencilLibrary::global();
        let s = lib.get(Opcode::I32Add, 2, 0, false);
        // mov eax, ebx; add eax, r12d; mov ebx, eax
        assert_eq!(s.code(), [0x89, 0xd8, 0x41, 0x03, 0xc4, 0x89, 0xc3]);
        assert!(s.relocs().is_empty());
    }

    #[test]
    fn spilled_operands_use_the_stack_top_slots() {
        let lib = StencilLibrary::global();
        let s = lib.get(Opcode::I32Add, 0, 0, false);
        // Two memory operands, relative to the int stack top.
        let addends: Vec<i64> = s.relocs().iter().map(|r| r.addend).collect();
        assert_eq!(addends, vec![-16, -8]);
        assert!(s
            .relocs()
            .iter()
            .all(|r| r.slot == SLOT_INT_TOP && r.kind == crate::stencil::RelocKind::Abs32));
    }

    #[test]
    fn library_build_is_deterministic() {
        let a = StencilLibrary::build();
        let b = StencilLibrary::build();
        assert_eq!(a.stencils.len(), b.stencils.len());
        for (x, y) in a.stencils.values().zip(b.stencils.values()) {
            assert_eq!(x.code(), y.code());
            assert_eq!(x.relocs(), y.relocs());
        }
    }

    #[test]
    fn drop_stencils_are_empty() {
        let lib = StencilLibrary::global();
        assert_eq!(lib.get(Opcode::DropInt, 2, 1, false).len(), 0);
    }

    #[test]
    fn return_stencils_end_in_ret() {
        let lib = StencilLibrary::global();
        for k in 0..=MAX_INT_REGS {
            let s = lib.get(Opcode::ReturnI32, k, 0, false);
            assert_eq!(*s.code().last().unwrap(), 0xc3);
        }
        assert_eq!(lib.get(Opcode::ReturnNone, 0, 0, false).code(), [0xc3]);
    }
}
