//! The pinned-register ABI shared by every stencil.
//!
//! Compiled code keeps the top of the operand stack in registers: up to
//! three integers and three floats. Older values live in the in-memory
//! evaluation stack inside the guest frame. State passes from one stencil
//! to the next entirely through this convention; stencils are contiguous
//! and joined by straight-line fallthrough or direct jumps.
//!
//! Register assignment:
//!
//! * `r13` — base of the current guest frame.
//! * `r14` — base of the callee frame being prepared during a call.
//! * `rbx`, `r12`, `r15` — the in-register integer operand stack, bottom
//!   to top. With `k` integers in registers the top is `INT_REGS[k-1]`.
//! * `xmm4`, `xmm5`, `xmm6` — the in-register float operand stack.
//! * `rax`, `rcx`, `rdx`, `xmm0`, `xmm1` — scratch within one stencil.
//!
//! Guest frame layout (offsets from the frame base):
//!
//! ```text
//! [0      ] scratch / return slot (indirect-call target stash)
//! [8      ] param 0, then params and locals, 8 bytes each
//! [int_base  ] spilled integer evaluation stack
//! [float_base] spilled float evaluation stack
//! ```
//!
//! The frame is 16-byte aligned with a 24-byte trailer; callers allocate
//! it with `sub rsp, size` and store the previous `r13` in the 8 bytes
//! just below the frame base. Since sizes are `16·m + 24`, every function
//! is entered with `rsp ≡ 8 (mod 16)` and host calls see a System-V
//! aligned stack.
//!
//! i32/f32 values occupy the low half of their 8-byte slot and are always
//! written with 32-bit stores, so integer slots read back zero-extended.

use crate::asm::{Gpr, Xmm};

pub const MAX_INT_REGS: u32 = 3;
pub const MAX_FLOAT_REGS: u32 = 3;

pub const FRAME: Gpr = Gpr::R13;
pub const CALLEE_FRAME: Gpr = Gpr::R14;

pub const INT_REGS: [Gpr; 3] = [Gpr::Rbx, Gpr::R12, Gpr::R15];
pub const FLOAT_REGS: [Xmm; 3] = [Xmm::Xmm4, Xmm::Xmm5, Xmm::Xmm6];

/// Bytes below the frame base reserved by the call sequence: the saved
/// caller `r13` plus alignment slack.
pub const FRAME_TRAILER: u32 = 24;

/// Frame size for a function whose frame holds only the scratch slot and
/// `num_params` parameter slots (imported functions and host thunks).
pub fn frame_size_for_params(num_params: u32) -> u32 {
    (8 * num_params + 16) / 16 * 16 + FRAME_TRAILER
}

/// Frame size for a compiled function: scratch slot, params + locals, and
/// the two spilled evaluation stacks.
pub fn frame_size_for_body(num_locals: u32, max_ints: u32, max_floats: u32) -> u32 {
    let limit = 8 + 8 * num_locals + 8 * max_ints + 8 * max_floats;
    (limit + 8) / 16 * 16 + FRAME_TRAILER
}

/// Frame offset of the first spilled-integer slot.
pub fn int_stack_base(num_locals: u32) -> u32 {
    8 + 8 * num_locals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_keep_the_call_alignment() {
        for p in 0..9 {
            assert_eq!(frame_size_for_params(p) % 16, 8);
        }
        assert_eq!(frame_size_for_params(0), 40);
        assert_eq!(frame_size_for_params(1), 40);
        assert_eq!(frame_size_for_params(2), 56);
        assert_eq!(frame_size_for_body(0, 0, 0), 40);
        assert_eq!(frame_size_for_body(2, 3, 1), 88);
    }
}
