//! Typed records for the decoded module sections.

use crate::entity_ref;
use crate::types::FuncType;
use crate::ValType;
use compact_str::CompactString;
use cranelift_entity::PrimaryMap;

pub const WASM_PAGE_SIZE: u64 = 65536;

entity_ref! {
    /// Index into the function-type table.
    pub struct TypeIdx;
}

entity_ref! {
    /// Index into the function space. Imported functions occupy the low
    /// indices.
    pub struct FuncIdx;
}

entity_ref! {
    /// Index into the global space.
    pub struct GlobalIdx;
}

entity_ref! {
    pub struct ExportIdx;
}

/// Two-level import name, e.g. `wasi_snapshot_preview1.fd_write`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImportName {
    pub module: CompactString,
    pub name: CompactString,
}

/// Table or memory size bounds. `max == u32::MAX` means unbounded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: u32,
}

/// A constant expression: either a literal (stored as raw bits) or a
/// reference to a prior global. The latter is diagnosed as unsupported
/// during decoding, but the record keeps both shapes so the decoder can
/// name what it refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstExpr {
    Value(u64),
    Global(u32),
}

impl ConstExpr {
    pub fn value(self) -> u64 {
        match self {
            ConstExpr::Value(v) => v,
            ConstExpr::Global(_) => panic!("constant expression references a global"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FuncDecl {
    pub type_idx: TypeIdx,
}

#[derive(Clone, Debug)]
pub struct GlobalDecl {
    pub ty: ValType,
    pub mutable: bool,
    pub init: ConstExpr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

#[derive(Clone, Debug)]
pub struct Export {
    pub name: CompactString,
    pub kind: ExportKind,
    pub index: u32,
}

/// A table element segment: function indices at a constant offset.
#[derive(Clone, Debug)]
pub struct ElemSegment {
    pub offset: ConstExpr,
    pub funcs: Vec<u32>,
}

/// A data segment, borrowing its payload from the module image.
#[derive(Clone, Debug)]
pub struct DataSegment<'wasm> {
    pub offset: ConstExpr,
    pub bytes: &'wasm [u8],
}

/// The decoded module. Every cross-reference is an entity index into one
/// of the `PrimaryMap`s; nothing here owns generated code or runtime
/// memory.
pub struct ModuleData<'wasm> {
    pub types: PrimaryMap<TypeIdx, FuncType>,
    pub funcs: PrimaryMap<FuncIdx, FuncDecl>,
    pub num_imported_funcs: u32,
    /// Names of the first `num_imported_funcs` entries of `funcs`.
    pub imported_func_names: Vec<ImportName>,
    pub table: Option<Limits>,
    pub memory: Option<Limits>,
    pub globals: PrimaryMap<GlobalIdx, GlobalDecl>,
    pub exports: PrimaryMap<ExportIdx, Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElemSegment>,
    pub datas: Vec<DataSegment<'wasm>>,
    /// Raw bytes of the code section (starting at the function count), if
    /// the module has one. Function bodies are decoded lazily by the code
    /// generator's pre-pass.
    pub code_section: Option<&'wasm [u8]>,
}

impl<'wasm> Default for ModuleData<'wasm> {
    fn default() -> Self {
        Self {
            types: PrimaryMap::new(),
            funcs: PrimaryMap::new(),
            num_imported_funcs: 0,
            imported_func_names: Vec::new(),
            table: None,
            memory: None,
            globals: PrimaryMap::new(),
            exports: PrimaryMap::new(),
            start: None,
            elements: Vec::new(),
            datas: Vec::new(),
            code_section: None,
        }
    }
}

impl<'wasm> ModuleData<'wasm> {
    pub fn func_type(&self, func: FuncIdx) -> &FuncType {
        &self.types[self.funcs[func].type_idx]
    }

    pub fn is_imported(&self, func: FuncIdx) -> bool {
        (cranelift_entity::EntityRef::index(func) as u32) < self.num_imported_funcs
    }

    /// Size of the table, or 0 if the module has none. Tables are
    /// restricted to `min == max`, so a single number suffices.
    pub fn table_size(&self) -> u32 {
        self.table.map_or(0, |l| l.min)
    }

    pub fn memory_min_pages(&self) -> u32 {
        self.memory.map_or(0, |l| l.min)
    }

    pub fn find_exported_func(&self, name: &str) -> Option<FuncIdx> {
        self.exports.values().find_map(|e| {
            (e.kind == ExportKind::Func && e.name == name)
                .then(|| cranelift_entity::EntityRef::new(e.index as usize))
        })
    }
}
