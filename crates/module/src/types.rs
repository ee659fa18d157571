//! Value and function types.

use crate::bytestream::ByteStream;
use crate::decode::DecodeError;
use smallvec::SmallVec;

/// A WASM value type.
///
/// Discriminants are `0x7f ^ wire_byte`, so integral types sort before
/// floating-point ones and the discriminant doubles as a table index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValType {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
}

impl ValType {
    pub fn from_wire(byte: u8) -> ValType {
        match byte ^ 0x7f {
            0 => ValType::I32,
            1 => ValType::I64,
            2 => ValType::F32,
            3 => ValType::F64,
            _ => panic!("invalid value type byte {byte:#04x}"),
        }
    }

    pub fn parse(reader: &mut ByteStream<'_>) -> ValType {
        Self::from_wire(reader.read_u8())
    }

    pub fn is_integral(self) -> bool {
        matches!(self, ValType::I32 | ValType::I64)
    }

    pub fn is_float(self) -> bool {
        !self.is_integral()
    }

    /// True for the 8-byte member of each class.
    pub fn is_wide(self) -> bool {
        matches!(self, ValType::I64 | ValType::F64)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A function signature. At most one result; the multi-value proposal is
/// not supported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncType {
    pub params: SmallVec<[ValType; 4]>,
    pub result: Option<ValType>,
    /// Cached split of `params` by register class.
    pub num_int_params: u32,
    pub num_float_params: u32,
}

impl FuncType {
    pub fn parse(reader: &mut ByteStream<'_>) -> Result<FuncType, DecodeError> {
        let magic = reader.read_u8();
        assert_eq!(magic, 0x60, "function type does not start with 0x60");

        let num_params = reader.read_uleb32();
        let mut params = SmallVec::with_capacity(num_params as usize);
        let mut num_int_params = 0;
        let mut num_float_params = 0;
        for _ in 0..num_params {
            let ty = ValType::parse(reader);
            if ty.is_integral() {
                num_int_params += 1;
            } else {
                num_float_params += 1;
            }
            params.push(ty);
        }

        let num_results = reader.read_uleb32();
        if num_results > 1 {
            return Err(DecodeError::Unsupported {
                section: 1,
                what: "multi-value function types",
            });
        }
        let result = (num_results == 1).then(|| ValType::parse(reader));

        Ok(FuncType {
            params,
            result,
            num_int_params,
            num_float_params,
        })
    }

    pub fn num_params(&self) -> u32 {
        self.params.len() as u32
    }
}
