//! A minimal x86-64 encoder, just large enough to assemble the stencil
//! fragments at startup.
//!
//! Every method appends bytes to the internal buffer. Methods that encode
//! a 32/64-bit displacement or immediate the caller wants patched at emit
//! time are followed by a call to [`Assembler::mark_reloc32`] /
//! [`Assembler::mark_reloc64`], which records a relocation against the
//! last 4 or 8 bytes written.

use crate::stencil::{RelocKind, Relocation, Stencil};
use smallvec::SmallVec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

/// Condition codes, by encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

/// Legacy SSE mandatory prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pfx {
    None,
    P66,
    F3,
    F2,
}

#[derive(Default)]
pub struct Assembler {
    buf: Vec<u8>,
    relocs: SmallVec<[Relocation; 4]>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Stencil {
        Stencil::new(self.buf, self.relocs.into_vec())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn push32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Records a 32-bit relocation against the last 4 bytes written.
    pub fn mark_reloc32(&mut self, slot: u8, addend: i64) {
        let offset = (self.buf.len() - 4) as u16;
        self.relocs.push(Relocation {
            kind: RelocKind::Abs32,
            offset,
            slot,
            addend,
        });
    }

    /// Records a 64-bit relocation against the last 8 bytes written.
    pub fn mark_reloc64(&mut self, slot: u8, addend: i64) {
        let offset = (self.buf.len() - 8) as u16;
        self.relocs.push(Relocation {
            kind: RelocKind::Abs64,
            offset,
            slot,
            addend,
        });
    }

    /// Records a 32-bit relocation at an explicit buffer offset, for
    /// instructions where the patched field is not the final one.
    pub fn mark_reloc32_at(&mut self, offset: usize, slot: u8, addend: i64) {
        self.relocs.push(Relocation {
            kind: RelocKind::Abs32,
            offset: offset as u16,
            slot,
            addend,
        });
    }

    /// GS segment override; must precede the instruction it applies to.
    pub fn gs(&mut self) {
        self.push(0x65);
    }

    /// Appends another fragment, shifting its relocations.
    pub fn append(&mut self, other: &Assembler) {
        let base = self.buf.len() as u16;
        self.buf.extend_from_slice(&other.buf);
        for r in &other.relocs {
            self.relocs.push(Relocation {
                offset: r.offset + base,
                ..*r
            });
        }
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8, byte_op_reg: Option<u8>) {
        let mut rex = 0x40u8;
        if w {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if index >= 8 {
            rex |= 0x02;
        }
        if base >= 8 {
            rex |= 0x01;
        }
        // spl/bpl/sil/dil are only addressable with a REX prefix.
        let force = byte_op_reg.is_some_and(|r| (4..8u8).contains(&r));
        if rex != 0x40 || force {
            self.push(rex);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.push(mode << 6 | (reg & 7) << 3 | (rm & 7));
    }

    /// reg-reg form (mod = 11).
    fn modrm_rr(&mut self, reg: u8, rm: u8) {
        self.modrm(0b11, reg, rm);
    }

    /// `[base + disp32]` form. `rsp`/`r12` bases need a SIB byte.
    fn modrm_base_disp32(&mut self, reg: u8, base: Gpr, disp: i32) {
        let base = base as u8;
        self.modrm(0b10, reg, base);
        if base & 7 == 4 {
            self.push(0x24); // SIB: no index
        }
        self.push32(disp as u32);
    }

    /// `[disp32]` absolute form (sign-extended; used with a GS override
    /// for the negative metadata region).
    fn modrm_abs_disp32(&mut self, reg: u8, disp: i32) {
        self.modrm(0b00, reg, 0b100);
        self.push(0x25);
        self.push32(disp as u32);
    }

    /// `[index*8 + disp32]` form.
    fn modrm_scaled_disp32(&mut self, reg: u8, index: Gpr, disp: i32) {
        self.modrm(0b00, reg, 0b100);
        self.push(0b11 << 6 | (index as u8 & 7) << 3 | 0b101);
        self.push32(disp as u32);
    }

    // ---- moves ----

    pub fn mov_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.rex(w, src as u8, 0, dst as u8, None);
        self.push(0x89);
        self.modrm_rr(src as u8, dst as u8);
    }

    pub fn mov_ri32(&mut self, dst: Gpr, imm: i32) {
        self.rex(false, 0, 0, dst as u8, None);
        self.push(0xb8 + (dst as u8 & 7));
        self.push32(imm as u32);
    }

    pub fn mov_ri64(&mut self, dst: Gpr, imm: u64) {
        self.rex(true, 0, 0, dst as u8, None);
        self.push(0xb8 + (dst as u8 & 7));
        self.push64(imm);
    }

    pub fn mov_load(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(0x8b);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn mov_store(&mut self, w: bool, base: Gpr, disp: i32, src: Gpr) {
        self.rex(w, src as u8, 0, base as u8, None);
        self.push(0x89);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    pub fn mov_store8(&mut self, base: Gpr, disp: i32, src: Gpr) {
        self.rex(false, src as u8, 0, base as u8, Some(src as u8));
        self.push(0x88);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    pub fn mov_store16(&mut self, base: Gpr, disp: i32, src: Gpr) {
        self.push(0x66);
        self.rex(false, src as u8, 0, base as u8, None);
        self.push(0x89);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    /// `mov dword/qword [base + disp32], imm32`.
    pub fn mov_store_imm32(&mut self, w: bool, base: Gpr, disp: i32, imm: i32) {
        self.rex(w, 0, 0, base as u8, None);
        self.push(0xc7);
        self.modrm_base_disp32(0, base, disp);
        self.push32(imm as u32);
    }

    /// GS-absolute load: `mov dst, gs:[disp32]`.
    pub fn mov_load_gs_abs(&mut self, w: bool, dst: Gpr, disp: i32) {
        self.gs();
        self.rex(w, dst as u8, 0, 0, None);
        self.push(0x8b);
        self.modrm_abs_disp32(dst as u8, disp);
    }

    pub fn mov_store_gs_abs(&mut self, w: bool, disp: i32, src: Gpr) {
        self.gs();
        self.rex(w, src as u8, 0, 0, None);
        self.push(0x89);
        self.modrm_abs_disp32(src as u8, disp);
    }

    /// GS-based load: `mov dst, gs:[base + disp32]`.
    pub fn mov_load_gs(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.gs();
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(0x8b);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn mov_store_gs(&mut self, w: bool, base: Gpr, disp: i32, src: Gpr) {
        self.gs();
        self.rex(w, src as u8, 0, base as u8, None);
        self.push(0x89);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    pub fn mov_store8_gs(&mut self, base: Gpr, disp: i32, src: Gpr) {
        self.gs();
        self.rex(false, src as u8, 0, base as u8, Some(src as u8));
        self.push(0x88);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    pub fn mov_store16_gs(&mut self, base: Gpr, disp: i32, src: Gpr) {
        self.push(0x66);
        self.gs();
        self.rex(false, src as u8, 0, base as u8, None);
        self.push(0x89);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    /// GS scaled-index load: `mov dst, gs:[index*8 + disp32]`.
    pub fn mov_load_gs_scaled(&mut self, dst: Gpr, index: Gpr, disp: i32) {
        self.gs();
        self.rex(true, dst as u8, index as u8, 0, None);
        self.push(0x8b);
        self.modrm_scaled_disp32(dst as u8, index, disp);
    }

    // ---- widening loads/moves ----

    fn ext_op(&mut self, w: bool, opcode: u8, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(0x0f);
        self.push(opcode);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    fn ext_op_rr(&mut self, w: bool, opcode: u8, dst: Gpr, src: Gpr) {
        self.rex(w, dst as u8, 0, src as u8, Some(src as u8));
        self.push(0x0f);
        self.push(opcode);
        self.modrm_rr(dst as u8, src as u8);
    }

    pub fn movzx8_load_gs(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.gs();
        self.ext_op(w, 0xb6, dst, base, disp);
    }

    pub fn movsx8_load_gs(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.gs();
        self.ext_op(w, 0xbe, dst, base, disp);
    }

    pub fn movzx16_load_gs(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.gs();
        self.ext_op(w, 0xb7, dst, base, disp);
    }

    pub fn movsx16_load_gs(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.gs();
        self.ext_op(w, 0xbf, dst, base, disp);
    }

    /// `movsxd dst64, src32` (register form).
    pub fn movsxd_rr(&mut self, dst: Gpr, src: Gpr) {
        self.rex(true, dst as u8, 0, src as u8, None);
        self.push(0x63);
        self.modrm_rr(dst as u8, src as u8);
    }

    pub fn movsxd_load(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(true, dst as u8, 0, base as u8, None);
        self.push(0x63);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn movsxd_load_gs(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.gs();
        self.movsxd_load(dst, base, disp);
    }

    pub fn movsx8_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.ext_op_rr(w, 0xbe, dst, src);
    }

    pub fn movsx16_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.ext_op_rr(w, 0xbf, dst, src);
    }

    pub fn movzx8_rr(&mut self, dst: Gpr, src: Gpr) {
        self.ext_op_rr(false, 0xb6, dst, src);
    }

    // ---- ALU ----

    /// Two-operand ALU, `op dst, src` (register form). `opcode` is the
    /// reg,rm form (add 0x03, sub 0x2b, and 0x23, or 0x0b, xor 0x33,
    /// cmp 0x3b).
    pub fn alu_rr(&mut self, w: bool, opcode: u8, dst: Gpr, src: Gpr) {
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(opcode);
        self.modrm_rr(dst as u8, src as u8);
    }

    /// `op dst, [base + disp32]`.
    pub fn alu_load(&mut self, w: bool, opcode: u8, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(opcode);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    /// Group-1 ALU with imm32: `op reg, imm32`. `ext` is the /n field
    /// (add 0, or 1, and 4, sub 5, xor 6, cmp 7).
    pub fn alu_ri32(&mut self, w: bool, ext: u8, reg: Gpr, imm: i32) {
        self.rex(w, 0, 0, reg as u8, None);
        self.push(0x81);
        self.modrm_rr(ext, reg as u8);
        self.push32(imm as u32);
    }

    /// `cmp dword/qword [base + disp32], imm8`.
    pub fn cmp_mem_imm8(&mut self, w: bool, base: Gpr, disp: i32, imm: i8) {
        self.rex(w, 0, 0, base as u8, None);
        self.push(0x83);
        self.modrm_base_disp32(7, base, disp);
        self.push(imm as u8);
    }

    pub fn test_rr(&mut self, w: bool, a: Gpr, b: Gpr) {
        self.rex(w, b as u8, 0, a as u8, None);
        self.push(0x85);
        self.modrm_rr(b as u8, a as u8);
    }

    pub fn imul_rr(&mut self, w: bool, dst: Gpr, src: Gpr) {
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(0xaf);
        self.modrm_rr(dst as u8, src as u8);
    }

    pub fn imul_load(&mut self, w: bool, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(0x0f);
        self.push(0xaf);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn cdq(&mut self) {
        self.push(0x99);
    }

    pub fn cqo(&mut self) {
        self.push(0x48);
        self.push(0x99);
    }

    /// `idiv r` (`/7`) or `div r` (`/6`).
    pub fn div_r(&mut self, w: bool, signed: bool, r: Gpr) {
        self.rex(w, 0, 0, r as u8, None);
        self.push(0xf7);
        self.modrm_rr(if signed { 7 } else { 6 }, r as u8);
    }

    pub fn xor_zero(&mut self, r: Gpr) {
        self.alu_rr(false, 0x33, r, r);
    }

    /// Shift/rotate by `cl`. `ext`: rol 0, ror 1, shl 4, shr 5, sar 7.
    pub fn shift_cl(&mut self, w: bool, ext: u8, r: Gpr) {
        self.rex(w, 0, 0, r as u8, None);
        self.push(0xd3);
        self.modrm_rr(ext, r as u8);
    }

    pub fn shl_imm8(&mut self, w: bool, r: Gpr, imm: u8) {
        self.rex(w, 0, 0, r as u8, None);
        self.push(0xc1);
        self.modrm_rr(4, r as u8);
        self.push(imm);
    }

    /// lzcnt (0xbd), tzcnt (0xbc) or popcnt (0xb8), register source.
    pub fn bitcount_rr(&mut self, w: bool, opcode: u8, dst: Gpr, src: Gpr) {
        self.push(0xf3);
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(opcode);
        self.modrm_rr(dst as u8, src as u8);
    }

    pub fn bitcount_load(&mut self, w: bool, opcode: u8, dst: Gpr, base: Gpr, disp: i32) {
        self.push(0xf3);
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(0x0f);
        self.push(opcode);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn setcc(&mut self, cc: Cc, r: Gpr) {
        self.rex(false, 0, 0, r as u8, Some(r as u8));
        self.push(0x0f);
        self.push(0x90 + cc as u8);
        self.modrm_rr(0, r as u8);
    }

    pub fn cmovcc_rr(&mut self, w: bool, cc: Cc, dst: Gpr, src: Gpr) {
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(0x40 + cc as u8);
        self.modrm_rr(dst as u8, src as u8);
    }

    // ---- SSE ----

    fn sse_prefix(&mut self, pfx: Pfx) {
        match pfx {
            Pfx::None => {}
            Pfx::P66 => self.push(0x66),
            Pfx::F3 => self.push(0xf3),
            Pfx::F2 => self.push(0xf2),
        }
    }

    fn sse_rr(&mut self, pfx: Pfx, opcode: u8, reg: u8, rm: u8) {
        self.sse_prefix(pfx);
        self.rex(false, reg, 0, rm, None);
        self.push(0x0f);
        self.push(opcode);
        self.modrm_rr(reg, rm);
    }

    fn sse_mem(&mut self, pfx: Pfx, opcode: u8, reg: u8, base: Gpr, disp: i32) {
        self.sse_prefix(pfx);
        self.rex(false, reg, 0, base as u8, None);
        self.push(0x0f);
        self.push(opcode);
        self.modrm_base_disp32(reg, base, disp);
    }

    fn scalar_pfx(f64: bool) -> Pfx {
        if f64 {
            Pfx::F2
        } else {
            Pfx::F3
        }
    }

    /// `movss`/`movsd` load from `[base + disp32]`.
    pub fn movs_load(&mut self, f64: bool, dst: Xmm, base: Gpr, disp: i32) {
        self.sse_mem(Self::scalar_pfx(f64), 0x10, dst as u8, base, disp);
    }

    pub fn movs_store(&mut self, f64: bool, base: Gpr, disp: i32, src: Xmm) {
        self.sse_mem(Self::scalar_pfx(f64), 0x11, src as u8, base, disp);
    }

    pub fn movs_load_gs(&mut self, f64: bool, dst: Xmm, base: Gpr, disp: i32) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.gs();
        self.rex(false, dst as u8, 0, base as u8, None);
        self.push(0x0f);
        self.push(0x10);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn movs_store_gs(&mut self, f64: bool, base: Gpr, disp: i32, src: Xmm) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.gs();
        self.rex(false, src as u8, 0, base as u8, None);
        self.push(0x0f);
        self.push(0x11);
        self.modrm_base_disp32(src as u8, base, disp);
    }

    pub fn movs_load_gs_abs(&mut self, f64: bool, dst: Xmm, disp: i32) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.gs();
        self.rex(false, dst as u8, 0, 0, None);
        self.push(0x0f);
        self.push(0x10);
        self.modrm_abs_disp32(dst as u8, disp);
    }

    pub fn movs_store_gs_abs(&mut self, f64: bool, disp: i32, src: Xmm) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.gs();
        self.rex(false, src as u8, 0, 0, None);
        self.push(0x0f);
        self.push(0x11);
        self.modrm_abs_disp32(src as u8, disp);
    }

    pub fn movaps_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Pfx::None, 0x28, dst as u8, src as u8);
    }

    pub fn movups_store(&mut self, base: Gpr, disp: i32, src: Xmm) {
        self.sse_mem(Pfx::None, 0x11, src as u8, base, disp);
    }

    /// Scalar arithmetic, register source: addss/sd 0x58, mulss/sd 0x59,
    /// subss/sd 0x5c, minss/sd 0x5d, divss/sd 0x5e, maxss/sd 0x5f,
    /// sqrtss/sd 0x51, cvtss2sd/cvtsd2ss 0x5a.
    pub fn scalar_rr(&mut self, f64: bool, opcode: u8, dst: Xmm, src: Xmm) {
        self.sse_rr(Self::scalar_pfx(f64), opcode, dst as u8, src as u8);
    }

    pub fn scalar_load(&mut self, f64: bool, opcode: u8, dst: Xmm, base: Gpr, disp: i32) {
        self.sse_mem(Self::scalar_pfx(f64), opcode, dst as u8, base, disp);
    }

    pub fn ucomis_rr(&mut self, f64: bool, a: Xmm, b: Xmm) {
        let pfx = if f64 { Pfx::P66 } else { Pfx::None };
        self.sse_rr(pfx, 0x2e, a as u8, b as u8);
    }

    pub fn comis_rr(&mut self, f64: bool, a: Xmm, b: Xmm) {
        let pfx = if f64 { Pfx::P66 } else { Pfx::None };
        self.sse_rr(pfx, 0x2f, a as u8, b as u8);
    }

    pub fn xorps(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(Pfx::None, 0x57, dst as u8, src as u8);
    }

    /// `roundss`/`roundsd`. Mode: 0 nearest, 1 floor, 2 ceil, 3 trunc.
    pub fn round_rr(&mut self, f64: bool, dst: Xmm, src: Xmm, mode: u8) {
        self.push(0x66);
        self.rex(false, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(0x3a);
        self.push(if f64 { 0x0b } else { 0x0a });
        self.modrm_rr(dst as u8, src as u8);
        self.push(mode);
    }

    /// `cvtsi2ss`/`cvtsi2sd` from a GPR. `w` selects the 64-bit source.
    pub fn cvtsi2s_rr(&mut self, f64: bool, w: bool, dst: Xmm, src: Gpr) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(0x2a);
        self.modrm_rr(dst as u8, src as u8);
    }

    pub fn cvtsi2s_load(&mut self, f64: bool, w: bool, dst: Xmm, base: Gpr, disp: i32) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.rex(w, dst as u8, 0, base as u8, None);
        self.push(0x0f);
        self.push(0x2a);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    /// `cvttss2si`/`cvttsd2si` into a GPR. `w` selects the 64-bit dest.
    pub fn cvtts2si_rr(&mut self, f64: bool, w: bool, dst: Gpr, src: Xmm) {
        self.sse_prefix(Self::scalar_pfx(f64));
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(0x2c);
        self.modrm_rr(dst as u8, src as u8);
    }

    /// `movd`/`movq xmm, gpr`.
    pub fn mov_xr(&mut self, w: bool, dst: Xmm, src: Gpr) {
        self.push(0x66);
        self.rex(w, dst as u8, 0, src as u8, None);
        self.push(0x0f);
        self.push(0x6e);
        self.modrm_rr(dst as u8, src as u8);
    }

    /// `movd`/`movq gpr, xmm`.
    pub fn mov_rx(&mut self, w: bool, dst: Gpr, src: Xmm) {
        self.push(0x66);
        self.rex(w, src as u8, 0, dst as u8, None);
        self.push(0x0f);
        self.push(0x7e);
        self.modrm_rr(src as u8, dst as u8);
    }

    // ---- control flow ----

    pub fn jcc8(&mut self, cc: Cc, rel: i8) {
        self.push(0x70 + cc as u8);
        self.push(rel as u8);
    }

    /// `jcc rel32` with a zero displacement; returns the patch offset.
    pub fn jcc32(&mut self, cc: Cc) -> usize {
        self.push(0x0f);
        self.push(0x80 + cc as u8);
        self.push32(0);
        self.buf.len() - 4
    }

    pub fn jmp8(&mut self, rel: i8) {
        self.push(0xeb);
        self.push(rel as u8);
    }

    /// `jmp rel32` with a zero displacement; returns the patch offset.
    pub fn jmp32(&mut self) -> usize {
        self.push(0xe9);
        self.push32(0);
        self.buf.len() - 4
    }

    /// `call rel32` with a zero displacement; returns the patch offset.
    pub fn call32(&mut self) -> usize {
        self.push(0xe8);
        self.push32(0);
        self.buf.len() - 4
    }

    pub fn jmp_r(&mut self, r: Gpr) {
        self.rex(false, 0, 0, r as u8, None);
        self.push(0xff);
        self.modrm_rr(4, r as u8);
    }

    pub fn call_r(&mut self, r: Gpr) {
        self.rex(false, 0, 0, r as u8, None);
        self.push(0xff);
        self.modrm_rr(2, r as u8);
    }

    pub fn push_r(&mut self, r: Gpr) {
        self.rex(false, 0, 0, r as u8, None);
        self.push(0x50 + (r as u8 & 7));
    }

    pub fn pop_r(&mut self, r: Gpr) {
        self.rex(false, 0, 0, r as u8, None);
        self.push(0x58 + (r as u8 & 7));
    }

    pub fn sub_rsp_imm32(&mut self) -> usize {
        self.push(0x48);
        self.push(0x81);
        self.modrm_rr(5, Gpr::Rsp as u8);
        self.push32(0);
        self.buf.len() - 4
    }

    pub fn add_rsp_imm32(&mut self) -> usize {
        self.push(0x48);
        self.push(0x81);
        self.modrm_rr(0, Gpr::Rsp as u8);
        self.push32(0);
        self.buf.len() - 4
    }

    pub fn add_rsp_imm8(&mut self, imm: i8) {
        self.push(0x48);
        self.push(0x83);
        self.modrm_rr(0, Gpr::Rsp as u8);
        self.push(imm as u8);
    }

    pub fn sub_rsp_imm8(&mut self, imm: i8) {
        self.push(0x48);
        self.push(0x83);
        self.modrm_rr(5, Gpr::Rsp as u8);
        self.push(imm as u8);
    }

    pub fn lea(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(true, dst as u8, 0, base as u8, None);
        self.push(0x8d);
        self.modrm_base_disp32(dst as u8, base, disp);
    }

    pub fn ud2(&mut self) {
        self.push(0x0f);
        self.push(0x0b);
    }

    pub fn ret(&mut self) {
        self.push(0xc3);
    }

    pub fn nops(&mut self, n: usize) {
        for _ in 0..n {
            self.push(0x90);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut a = Assembler::new();
        f(&mut a);
        a.bytes().to_vec()
    }

    #[test]
    fn mov_encodings() {
        // mov r13, r14
        assert_eq!(bytes(|a| a.mov_rr(true, Gpr::R13, Gpr::R14)), [0x4d, 0x89, 0xf5]);
        // mov rax, [r13 + 0]
        assert_eq!(
            bytes(|a| a.mov_load(true, Gpr::Rax, Gpr::R13, 0)),
            [0x49, 0x8b, 0x85, 0, 0, 0, 0]
        );
        // mov [rsp], r13 needs a SIB byte
        assert_eq!(
            bytes(|a| a.mov_store(true, Gpr::Rsp, 0, Gpr::R13)),
            [0x4c, 0x89, 0xac, 0x24, 0, 0, 0, 0]
        );
        // mov ebx, imm32
        assert_eq!(bytes(|a| a.mov_ri32(Gpr::Rbx, 1)), [0xbb, 1, 0, 0, 0]);
    }

    #[test]
    fn gs_encodings() {
        // mov rax, gs:[rax*8 + disp32]
        assert_eq!(
            bytes(|a| a.mov_load_gs_scaled(Gpr::Rax, Gpr::Rax, 0x100)),
            [0x65, 0x48, 0x8b, 0x04, 0xc5, 0, 1, 0, 0]
        );
        // mov eax, gs:[disp32]
        assert_eq!(
            bytes(|a| a.mov_load_gs_abs(false, Gpr::Rax, -8)),
            [0x65, 0x8b, 0x04, 0x25, 0xf8, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn control_flow_encodings() {
        assert_eq!(bytes(|a| a.ud2()), [0x0f, 0x0b]);
        assert_eq!(bytes(|a| { a.jmp32(); }), [0xe9, 0, 0, 0, 0]);
        assert_eq!(bytes(|a| a.jcc8(Cc::E, 5)), [0x74, 5]);
        assert_eq!(bytes(|a| { a.jcc32(Cc::Ne); }), [0x0f, 0x85, 0, 0, 0, 0]);
        assert_eq!(bytes(|a| a.call_r(Gpr::Rax)), [0xff, 0xd0]);
        assert_eq!(bytes(|a| a.jmp_r(Gpr::Rax)), [0xff, 0xe0]);
    }

    #[test]
    fn rsp_adjustments() {
        assert_eq!(
            bytes(|a| { a.sub_rsp_imm32(); }),
            [0x48, 0x81, 0xec, 0, 0, 0, 0]
        );
        assert_eq!(
            bytes(|a| { a.add_rsp_imm32(); }),
            [0x48, 0x81, 0xc4, 0, 0, 0, 0]
        );
    }

    #[test]
    fn sse_encodings() {
        // movsd [r13 + 0], xmm4
        assert_eq!(
            bytes(|a| a.movs_store(true, Gpr::R13, 0, Xmm::Xmm4)),
            [0xf2, 0x41, 0x0f, 0x11, 0xa5, 0, 0, 0, 0]
        );
        // addss xmm0, xmm5
        assert_eq!(
            bytes(|a| a.scalar_rr(false, 0x58, Xmm::Xmm0, Xmm::Xmm5)),
            [0xf3, 0x0f, 0x58, 0xc5]
        );
        // movq rax, xmm0
        assert_eq!(
            bytes(|a| a.mov_rx(true, Gpr::Rax, Xmm::Xmm0)),
            [0x66, 0x48, 0x0f, 0x7e, 0xc0]
        );
    }
}
