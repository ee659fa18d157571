//! Section-level module decoding.

use crate::bytestream::ByteStream;
use crate::module::*;
use crate::types::{FuncType, ValType};
use compact_str::CompactString;
use cranelift_entity::EntityRef;
use tracing::debug;

const WASM_MAGIC: u32 = 0x6d73_6100; // "\0asm"
const WASM_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a wasm module: expected magic 0x6d736100, found {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported wasm version {0} (only version 1 is supported)")]
    BadVersion(u32),
    #[error("unsupported construct in section {section}: {what}")]
    Unsupported { section: u8, what: &'static str },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
}

fn parse_limits(reader: &mut ByteStream<'_>) -> Limits {
    let kind = reader.read_u8();
    let min = reader.read_uleb32();
    let max = match kind {
        0 => u32::MAX,
        1 => {
            let max = reader.read_uleb32();
            debug_assert!(min <= max);
            max
        }
        other => panic!("invalid limits kind {other:#04x}"),
    };
    Limits { min, max }
}

/// A constant expression is `t.const c` or `global.get x`, terminated by
/// `end`. Integer literals are stored sign-extended; floats as raw bits.
fn parse_const_expr(reader: &mut ByteStream<'_>, expected: ValType) -> ConstExpr {
    let opcode = reader.read_u8();
    let expr = if opcode == 0x23 {
        ConstExpr::Global(reader.read_uleb32())
    } else {
        debug_assert_eq!(opcode, 0x41 + expected as u8, "const expr type mismatch");
        let bits = match expected {
            ValType::I32 => reader.read_sleb32() as u32 as u64,
            ValType::I64 => reader.read_sleb64() as u64,
            ValType::F32 => reader.read_f32().to_bits() as u64,
            ValType::F64 => reader.read_f64().to_bits(),
        };
        ConstExpr::Value(bits)
    };
    let end = reader.read_u8();
    debug_assert_eq!(end, 0x0b, "const expr not terminated by end");
    expr
}

/// Decodes every section of `bytes` into typed records.
///
/// The code section is *not* walked here: its byte range is recorded and
/// function bodies are decoded by the code generator's pre-pass.
pub fn decode_module(bytes: &[u8]) -> Result<ModuleData<'_>, DecodeError> {
    let mut reader = ByteStream::new(bytes);

    let magic = reader.read_u32();
    if magic != WASM_MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = reader.read_u32();
    if version != WASM_VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let mut module = ModuleData::default();
    // Type indices of defined (non-imported) functions, staged until the
    // import count is final.
    let mut defined_funcs: Vec<u32> = Vec::new();
    let mut imported_func_types: Vec<u32> = Vec::new();
    let mut last_section_id = 0u8;

    while reader.has_more() {
        let section_id = reader.read_u8();
        let section_len = reader.read_uleb32() as usize;
        if section_id == SectionId::Custom as u8 {
            reader.skip(section_len);
            continue;
        }
        // Non-custom sections occur at most once, in increasing id order.
        assert!(
            section_id > last_section_id && section_id <= SectionId::Data as u8,
            "section {section_id} out of order"
        );
        last_section_id = section_id;

        let mut section = reader.sub_stream(section_len);
        debug!(section_id, section_len, "decoding section");
        match section_id {
            x if x == SectionId::Type as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    let ty = FuncType::parse(&mut section)?;
                    module.types.push(ty);
                }
            }
            x if x == SectionId::Import as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    let import_module = CompactString::from(section.read_name());
                    let import_name = CompactString::from(section.read_name());
                    let kind = section.read_u8();
                    match kind {
                        0 => {
                            imported_func_types.push(section.read_uleb32());
                            module.imported_func_names.push(ImportName {
                                module: import_module,
                                name: import_name,
                            });
                        }
                        1 => {
                            let elem_ty = section.read_u8();
                            debug_assert_eq!(elem_ty, 0x70);
                            let limits = parse_limits(&mut section);
                            assert!(module.table.is_none(), "more than one table");
                            module.table = Some(limits);
                        }
                        2 => {
                            let limits = parse_limits(&mut section);
                            assert!(module.memory.is_none(), "more than one memory");
                            module.memory = Some(limits);
                        }
                        3 => {
                            return Err(DecodeError::Unsupported {
                                section: section_id,
                                what: "imported globals",
                            });
                        }
                        other => panic!("invalid import kind {other:#04x}"),
                    }
                }
                module.num_imported_funcs = imported_func_types.len() as u32;
            }
            x if x == SectionId::Function as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    defined_funcs.push(section.read_uleb32());
                }
            }
            x if x == SectionId::Table as u8 => {
                let count = section.read_uleb32();
                debug_assert!(count <= 1, "more than one table");
                if count == 1 {
                    let elem_ty = section.read_u8();
                    debug_assert_eq!(elem_ty, 0x70);
                    let limits = parse_limits(&mut section);
                    // The code generator sizes the indirect-call region
                    // once; growable tables are out of scope.
                    debug_assert_eq!(limits.min, limits.max, "table must have a fixed size");
                    assert!(module.table.is_none(), "more than one table");
                    module.table = Some(limits);
                }
            }
            x if x == SectionId::Memory as u8 => {
                let count = section.read_uleb32();
                debug_assert!(count <= 1, "more than one memory");
                if count == 1 {
                    assert!(module.memory.is_none(), "more than one memory");
                    module.memory = Some(parse_limits(&mut section));
                }
            }
            x if x == SectionId::Global as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    let ty = ValType::parse(&mut section);
                    let mutable = match section.read_u8() {
                        0 => false,
                        1 => true,
                        other => panic!("invalid global mutability {other:#04x}"),
                    };
                    let init = parse_const_expr(&mut section, ty);
                    if matches!(init, ConstExpr::Global(_)) {
                        // With imported globals refused, there is no prior
                        // global a valid initializer could refer to.
                        return Err(DecodeError::Unsupported {
                            section: section_id,
                            what: "global initialized from another global",
                        });
                    }
                    module.globals.push(GlobalDecl { ty, mutable, init });
                }
            }
            x if x == SectionId::Export as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    let name = CompactString::from(section.read_name());
                    let kind = match section.read_u8() {
                        0 => ExportKind::Func,
                        1 => ExportKind::Table,
                        2 => ExportKind::Memory,
                        3 => ExportKind::Global,
                        other => panic!("invalid export kind {other:#04x}"),
                    };
                    let index = section.read_uleb32();
                    module.exports.push(Export { name, kind, index });
                }
            }
            x if x == SectionId::Start as u8 => {
                module.start = Some(FuncIdx::new(section.read_uleb32() as usize));
            }
            x if x == SectionId::Element as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    let table_idx = section.read_uleb32();
                    debug_assert_eq!(table_idx, 0);
                    let offset = parse_const_expr(&mut section, ValType::I32);
                    if matches!(offset, ConstExpr::Global(_)) {
                        return Err(DecodeError::Unsupported {
                            section: section_id,
                            what: "element offset initialized from a global",
                        });
                    }
                    let len = section.read_uleb32();
                    let funcs = (0..len).map(|_| section.read_uleb32()).collect();
                    module.elements.push(ElemSegment { offset, funcs });
                }
            }
            x if x == SectionId::Code as u8 => {
                module.code_section = Some(reader.sub_stream(section_len).into_bytes());
            }
            x if x == SectionId::Data as u8 => {
                let count = section.read_uleb32();
                for _ in 0..count {
                    let memory_idx = section.read_uleb32();
                    debug_assert_eq!(memory_idx, 0);
                    let offset = parse_const_expr(&mut section, ValType::I32);
                    if matches!(offset, ConstExpr::Global(_)) {
                        return Err(DecodeError::Unsupported {
                            section: section_id,
                            what: "data offset initialized from a global",
                        });
                    }
                    let bytes = section.read_bytes();
                    module.datas.push(DataSegment { offset, bytes });
                }
            }
            _ => unreachable!(),
        }
        reader.skip(section_len);
    }

    // The function space is imports first, then defined functions.
    for ty in imported_func_types.iter().chain(defined_funcs.iter()) {
        module.funcs.push(FuncDecl {
            type_idx: TypeIdx::new(*ty as usize),
        });
    }

    debug!(
        types = module.types.len(),
        funcs = module.funcs.len(),
        imported = module.num_imported_funcs,
        globals = module.globals.len(),
        exports = module.exports.len(),
        "decoded module"
    );
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(wat_src: &str) -> Vec<u8> {
        wat::parse_str(wat_src).unwrap()
    }

    #[test]
    fn minimal_module() {
        let bytes = decode("(module)");
        let module = decode_module(&bytes).unwrap();
        assert_eq!(module.types.len(), 0);
        assert_eq!(module.funcs.len(), 0);
        assert!(module.code_section.is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 8];
        assert!(matches!(
            decode_module(&bytes),
            Err(DecodeError::BadMagic(0))
        ));
    }

    #[test]
    fn functions_and_exports() {
        let bytes = decode(
            r#"(module
                (func $add (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        );
        let module = decode_module(&bytes).unwrap();
        assert_eq!(module.funcs.len(), 1);
        assert_eq!(module.num_imported_funcs, 0);
        let func = module.find_exported_func("add").unwrap();
        let ty = module.func_type(func);
        assert_eq!(ty.num_params(), 2);
        assert_eq!(ty.num_int_params, 2);
        assert_eq!(ty.result, Some(ValType::I32));
        assert!(module.code_section.is_some());
    }

    #[test]
    fn imports_occupy_low_indices() {
        let bytes = decode(
            r#"(module
                (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
                (func (export "main"))
            )"#,
        );
        let module = decode_module(&bytes).unwrap();
        assert_eq!(module.num_imported_funcs, 1);
        assert_eq!(module.funcs.len(), 2);
        assert_eq!(module.imported_func_names[0].name, "proc_exit");
        assert!(module.is_imported(FuncIdx::new(0)));
        assert!(!module.is_imported(FuncIdx::new(1)));
    }

    #[test]
    fn globals_and_data() {
        let bytes = decode(
            r#"(module
                (memory 1)
                (global (mut i32) (i32.const -7))
                (global f64 (f64.const 2.5))
                (data (i32.const 16) "hi")
            )"#,
        );
        let module = decode_module(&bytes).unwrap();
        assert_eq!(module.memory_min_pages(), 1);
        assert_eq!(module.globals.len(), 2);
        let g0 = module.globals.values().next().unwrap();
        assert!(g0.mutable);
        assert_eq!(g0.init.value() as u32, (-7i32) as u32);
        assert_eq!(module.datas.len(), 1);
        assert_eq!(module.datas[0].offset.value(), 16);
        assert_eq!(module.datas[0].bytes, b"hi");
    }

    #[test]
    fn table_and_elements() {
        let bytes = decode(
            r#"(module
                (table 4 4 funcref)
                (elem (i32.const 1) $f $f)
                (func $f))"#,
        );
        let module = decode_module(&bytes).unwrap();
        assert_eq!(module.table_size(), 4);
        assert_eq!(module.elements.len(), 1);
        assert_eq!(module.elements[0].funcs, vec![0, 0]);
    }

    #[test]
    fn rejects_multi_value() {
        let bytes = decode(
            r#"(module (func (export "f") (result i32 i32)
                i32.const 1
                i32.const 2))"#,
        );
        assert!(matches!(
            decode_module(&bytes),
            Err(DecodeError::Unsupported { section: 1, .. })
        ));
    }
}
