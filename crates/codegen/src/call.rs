//! Call lowering: callee-frame setup, the call itself, and cleanup.
//!
//! A call site is the concatenation of
//!
//! 1. *prepare*: `sub rsp, <callee frame size>`, link the caller frame
//!    below the new one, `r14 = new frame base`;
//! 2. one fill-param stencil per argument (library opcodes), filling the
//!    callee frame back to front;
//! 3. *switch frame* (`r13 = r14`) and `call`;
//! 4. *cleanup*: unlink, `add rsp, <callee frame size>`, and move the
//!    return value into the operand stack.
//!
//! The two frame-size immediates cannot be known until every function
//! body has been sized, so both are returned as patch slots; they are
//! resolved after compilation to the callee's frame size, or for
//! indirect calls to the maximum over all functions sharing the
//! signature.

use crate::abi::FRAME;
use crate::asm::{Assembler, Gpr, Xmm};
use crate::code_region::CodeRegion;
use crate::library::{store_float, store_int, FloatLoc, IntLoc};
use crate::stencil::{FixupData, Stencil};
use module::ValType;
use once_cell::sync::Lazy;

struct CallStencil {
    stencil: Stencil,
    /// In-stencil offset of the frame-size imm32.
    size_slot: u16,
}

impl CallStencil {
    fn emit(&self, out: &mut CodeRegion, fixups: &FixupData) -> u32 {
        let base = out.pos();
        self.stencil.emit(out, fixups);
        base + self.size_slot as u32
    }
}

pub struct CallLibrary {
    prepare: CallStencil,
    /// `[return class][spill]`; index 4 is "no result".
    cleanup: Vec<CallStencil>,
}

fn ret_index(ty: Option<ValType>) -> usize {
    ty.map_or(4, |t| t as usize)
}

static CALLS: Lazy<CallLibrary> = Lazy::new(CallLibrary::build);

impl CallLibrary {
    pub fn global() -> &'static CallLibrary {
        &CALLS
    }

    /// Worst-case bytes for prepare + call + cleanup (excluding fills).
    pub const MAX_EMIT: u32 = 80;

    fn build() -> CallLibrary {
        let prepare = {
            let mut a = Assembler::new();
            let slot = a.sub_rsp_imm32();
            a.mov_store(true, Gpr::Rsp, 0, FRAME);
            a.lea(crate::abi::CALLEE_FRAME, Gpr::Rsp, 8);
            CallStencil {
                size_slot: slot as u16,
                stencil: a.finish(),
            }
        };

        let mut cleanup = Vec::with_capacity(10);
        for ret in [
            Some(ValType::I32),
            Some(ValType::I64),
            Some(ValType::F32),
            Some(ValType::F64),
            None,
        ] {
            for spill in [false, true] {
                let mut a = Assembler::new();
                a.mov_load(true, FRAME, Gpr::Rsp, 0);
                let slot = a.add_rsp_imm32();
                match ret {
                    Some(ty) if ty.is_integral() => {
                        // All registers were spilled across the call, so
                        // the result lands at the bottom of the window.
                        store_int(
                            &mut a,
                            if spill {
                                IntLoc::Stack(0)
                            } else {
                                IntLoc::Reg(crate::abi::INT_REGS[0])
                            },
                            Gpr::Rax,
                            ty.is_wide(),
                        );
                    }
                    Some(ty) => {
                        store_float(
                            &mut a,
                            if spill {
                                FloatLoc::Stack(0)
                            } else {
                                FloatLoc::Reg(crate::abi::FLOAT_REGS[0])
                            },
                            Xmm::Xmm0,
                            ty.is_wide(),
                        );
                    }
                    None => {}
                }
                cleanup.push(CallStencil {
                    size_slot: slot as u16,
                    stencil: a.finish(),
                });
            }
        }

        CallLibrary { prepare, cleanup }
    }

    /// Emits the frame setup; returns the first frame-size patch slot.
    pub fn emit_prepare(&self, out: &mut CodeRegion) -> u32 {
        self.prepare.emit(out, &FixupData::default())
    }

    /// Emits a direct `call rel32`; returns the target patch slot.
    pub fn emit_call(out: &mut CodeRegion) -> u32 {
        out.push_bytes(&[0xe8, 0, 0, 0, 0]);
        out.pos() - 4
    }

    /// Emits the post-call cleanup; returns the second frame-size slot.
    pub fn emit_cleanup(
        &self,
        out: &mut CodeRegion,
        ret: Option<ValType>,
        spill: bool,
        fixups: &FixupData,
    ) -> u32 {
        self.cleanup[ret_index(ret) * 2 + spill as usize].emit(out, fixups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_shape() {
        let lib = CallLibrary::global();
        let code = lib.prepare.stencil.code();
        assert_eq!(&code[..3], [0x48, 0x81, 0xec]); // sub rsp, imm32
        assert_eq!(lib.prepare.size_slot, 3);
        // Frame link and r14 setup follow.
        assert_eq!(&code[7..11], [0x4c, 0x89, 0xac, 0x24]); // mov [rsp], r13
    }

    #[test]
    fn cleanup_restores_the_frame_pointer() {
        let lib = CallLibrary::global();
        for stencil in &lib.cleanup {
            let code = stencil.stencil.code();
            // mov r13, [rsp]
            assert_eq!(&code[..4], [0x4c, 0x8b, 0xac, 0x24]);
            // add rsp, imm32 right after the 8-byte load
            assert_eq!(&code[8..11], [0x48, 0x81, 0xc4]);
            assert_eq!(stencil.size_slot, 11);
        }
    }
}
