//! Template-stencil code generation: WASM opcodes to x86-64 machine code.
//!
//! There is no IR, register allocator or instruction selector here.
//! A library of pre-assembled machine-code fragments ("stencils"),
//! built once at startup for every supported
//! `(opcode, in-register ints, in-register floats, spill-output)`
//! combination, is pasted into an executable buffer and patched with the
//! caller's stack offsets and immediates. Compile cost is proportional to
//! the bytes emitted.
//!
//! Compilation is two passes per function: a pre-pass that resolves every
//! operand's register/memory placement ([`prepass`]), then an emission
//! pass that pastes stencils and records patch sites ([`emit`]).

extern crate presto_module as module;

pub mod abi;
pub mod asm;
pub mod br_table;
pub mod branch;
pub mod call;
pub mod call_indirect;
pub mod code_region;
pub mod emit;
pub mod entry;
pub mod error;
pub mod library;
pub mod prepass;
pub mod stencil;

pub use code_region::CodeRegion;
pub use emit::{compile_module, CompiledCode, ImportResolver};
pub use error::CompileError;
pub use library::StencilLibrary;
pub use stencil::{FixupData, RelocKind, Relocation, Stencil};
