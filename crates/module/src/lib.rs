//! Decoded representation of a WebAssembly binary module.
//!
//! This crate owns the shallow byte reader, the typed records for every
//! module section, and the opcode tables shared with the code generator.
//! Decoding is deliberately shallow: the module is assumed to have passed
//! validation upstream, so malformed input is a programming error (panic),
//! while the handful of conditions we diagnose for users (bad magic,
//! unsupported constructs) surface as [`DecodeError`].

#[macro_export]
macro_rules! entity_ref {
    {
        $(#[$attr:meta])*
        pub struct $ident:ident;
    } => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord, bytemuck::Pod, bytemuck::Zeroable)]
        #[repr(transparent)]
        $(#[$attr])*
        pub struct $ident(u32);

        impl ::cranelift_entity::EntityRef for $ident {
            fn new(i: usize) -> Self {
                if i >= u32::MAX as usize {
                    // u32::MAX is a reserved value
                    panic!(concat!("too many entity refs of type ", stringify!($ident)));
                }
                Self(i as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl ::cranelift_entity::packed_option::ReservedValue for $ident {
            fn is_reserved_value(&self) -> bool {
                self.0 == u32::MAX
            }

            fn reserved_value() -> Self {
                Self(u32::MAX)
            }
        }
    };
}

pub mod bytestream;
pub mod decode;
pub mod module;
pub mod opcode;
pub mod types;

pub use bytestream::ByteStream;
pub use decode::{decode_module, DecodeError};
pub use module::{
    ConstExpr, DataSegment, ElemSegment, Export, ExportIdx, ExportKind, FuncDecl, FuncIdx,
    GlobalDecl, GlobalIdx, ImportName, Limits, ModuleData, TypeIdx, WASM_PAGE_SIZE,
};
pub use opcode::{Opcode, OpcodeInfo, OperandKind};
pub use types::{FuncType, ValType};
