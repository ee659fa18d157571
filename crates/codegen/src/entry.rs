//! Region header, import thunks, and host-entry thunks.
//!
//! The code region starts with a fixed 32-byte header: the shared trap
//! (`ud2`) at offset 0, and the `memory.grow` host thunk at offset 16.
//! Each imported function gets a 16-byte thunk that forwards the guest
//! frame base to the host function and tail-jumps into it, so the host's
//! `ret` returns straight to the guest call site. Unknown imports get a
//! trap thunk; the module still compiles, the call faults.
//!
//! Exported functions get an entry thunk converting from the System-V
//! ABI (`fn(frame_base: usize)`) to the pinned-register convention:
//! callee-saved registers are preserved, `r13` is loaded from `rdi`, and
//! the result comes back in `rax`/`xmm0` as both conventions agree.

use crate::asm::{Assembler, Gpr};
use crate::code_region::CodeRegion;

/// Region offset of the shared trap instruction.
pub const UD2_OFFSET: u32 = 0;

/// Region offset of the `memory.grow` thunk.
pub const GROW_THUNK_OFFSET: u32 = 16;

pub const HEADER_SIZE: u32 = 32;

pub const IMPORT_THUNK_SIZE: u32 = 16;

pub const ENTRY_THUNK_SIZE: u32 = 64;

/// `mov rdi, r13; movabs rax, target; jmp rax`, NOP-padded to 16 bytes.
fn host_thunk(out: &mut CodeRegion, target: u64) {
    let mut a = Assembler::new();
    a.mov_rr(true, Gpr::Rdi, crate::abi::FRAME);
    a.mov_ri64(Gpr::Rax, target);
    a.jmp_r(Gpr::Rax);
    a.nops(IMPORT_THUNK_SIZE as usize - a.len());
    out.push_bytes(a.bytes());
}

pub fn emit_region_header(out: &mut CodeRegion, grow_entry: u64) {
    debug_assert_eq!(out.pos(), 0);
    out.reserve(HEADER_SIZE);
    let mut a = Assembler::new();
    a.ud2();
    a.nops(14);
    out.push_bytes(a.bytes());
    host_thunk(out, grow_entry);
    debug_assert_eq!(out.pos(), HEADER_SIZE);
}

/// Emits an import thunk; returns its offset (the import's entry point).
pub fn emit_import_thunk(out: &mut CodeRegion, host: Option<u64>) -> u32 {
    let off = out.pos();
    match host {
        Some(target) => host_thunk(out, target),
        None => {
            let mut a = Assembler::new();
            a.ud2();
            a.nops(IMPORT_THUNK_SIZE as usize - 2);
            out.push_bytes(a.bytes());
        }
    }
    off
}

/// Emits a host-entry thunk for one exported function; returns
/// `(thunk offset, rel32 slot for the function address)`.
pub fn emit_entry_thunk(out: &mut CodeRegion) -> (u32, u32) {
    let off = out.pos();
    let mut a = Assembler::new();
    for r in [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15] {
        a.push_r(r);
    }
    // Odd number of slots keeps the guest entry alignment invariant.
    a.sub_rsp_imm8(8);
    a.mov_rr(true, crate::abi::FRAME, Gpr::Rdi);
    let slot = a.call32();
    a.add_rsp_imm8(8);
    for r in [Gpr::R15, Gpr::R14, Gpr::R13, Gpr::R12, Gpr::Rbp, Gpr::Rbx] {
        a.pop_r(r);
    }
    a.ret();
    debug_assert!(a.len() <= ENTRY_THUNK_SIZE as usize);
    out.push_bytes(a.bytes());
    (off, off + slot as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut region = CodeRegion::new().unwrap();
        emit_region_header(&mut region, 0x1122_3344_5566_7788);
        let bytes = region.bytes();
        assert_eq!(&bytes[0..2], [0x0f, 0x0b]);
        // Grow thunk: mov rdi, r13 then movabs rax, imm64.
        assert_eq!(&bytes[16..19], [0x4c, 0x89, 0xef]);
        assert_eq!(&bytes[19..21], [0x48, 0xb8]);
        assert_eq!(
            u64::from_le_bytes(bytes[21..29].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
        assert_eq!(&bytes[29..31], [0xff, 0xe0]);
    }

    #[test]
    fn unknown_import_traps() {
        let mut region = CodeRegion::new().unwrap();
        emit_region_header(&mut region, 0);
        let off = emit_import_thunk(&mut region, None);
        assert_eq!(off, HEADER_SIZE);
        assert_eq!(&region.bytes()[off as usize..off as usize + 2], [0x0f, 0x0b]);
    }

    #[test]
    fn entry_thunk_calls_through_the_slot() {
        let mut region = CodeRegion::new().unwrap();
        region.reserve(256);
        let (off, slot) = emit_entry_thunk(&mut region);
        assert_eq!(off, 0);
        assert_eq!(region.bytes()[slot as usize - 1], 0xe8);
        assert_eq!(*region.bytes().last().unwrap(), 0xc3);
    }
}
