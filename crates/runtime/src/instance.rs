//! A compiled, ready-to-run module instance.

use crate::error::Error;
use crate::host::HostTable;
use crate::memory::RuntimeMemory;
use codegen::{compile_module, CompiledCode};
use cranelift_entity::EntityRef;
use module::{ExportKind, FuncIdx, FuncType, ModuleData, ValType};
use std::mem::MaybeUninit;
use tracing::debug;

/// Host-side representation of a guest value.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    fn bits(&self) -> u64 {
        match *self {
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
        }
    }

    pub fn unwrap_i32(self) -> i32 {
        match self {
            Value::I32(v) => v,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    pub fn unwrap_i64(self) -> i64 {
        match self {
            Value::I64(v) => v,
            other => panic!("expected i64, got {other:?}"),
        }
    }

    pub fn unwrap_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            other => panic!("expected f32, got {other:?}"),
        }
    }

    pub fn unwrap_f64(self) -> f64 {
        match self {
            Value::F64(v) => v,
            other => panic!("expected f64, got {other:?}"),
        }
    }
}

/// A compiled module together with its runtime memory. The instance
/// exclusively owns the generated code, the guest memory and the
/// auxiliary tables; the process-wide stencil libraries are shared.
pub struct Instance<'wasm> {
    md: ModuleData<'wasm>,
    code: CompiledCode,
    memory: RuntimeMemory,
}

impl<'wasm> Instance<'wasm> {
    /// Compiles `md` against the WASI host table and builds the runtime
    /// memory: globals, the indirect-call table, `br_table` landing pads
    /// and data segments.
    pub fn new(md: ModuleData<'wasm>) -> Result<Instance<'wasm>, Error> {
        let host = HostTable::wasi();
        let code = compile_module(&md, &host)?;

        let mut memory = RuntimeMemory::create(code.neg_region_len.max(16), 0)?;
        for (idx, global) in md.globals.iter() {
            memory.write_global(idx.index() as u32, global.init.value());
        }

        memory.fill_table_sentinel(code.table_region_offset, md.table_size());
        for segment in &md.elements {
            let base = segment.offset.value() as u32;
            for (i, func) in segment.funcs.iter().enumerate() {
                let func = FuncIdx::new(*func as usize);
                let sig = md.funcs[func].type_idx.index() as u64;
                let entry = code.region.abs_addr(code.func_entries[func]);
                memory.write_table_entry(
                    code.table_region_offset,
                    base + i as u32,
                    sig,
                    entry,
                );
            }
        }

        for (i, pad) in code.br_pads.iter().enumerate() {
            memory.write_br_pad(code.table_region_offset, i, code.region.abs_addr(*pad));
        }

        memory.grow_direct(md.memory_min_pages())?;
        for segment in &md.datas {
            memory.write_data(segment.offset.value() as u32, segment.bytes);
        }

        memory.set_gs();
        debug!(
            memzero = format_args!("{:#x}", memory.memzero()),
            pages = memory.size_pages(),
            "instance ready"
        );
        Ok(Instance { md, code, memory })
    }

    pub fn module(&self) -> &ModuleData<'wasm> {
        &self.md
    }

    pub fn memory(&self) -> &RuntimeMemory {
        &self.memory
    }

    fn export(&self, name: &str) -> Result<(FuncIdx, &FuncType, u32), Error> {
        for (export_idx, export) in self.md.exports.iter() {
            if export.kind != ExportKind::Func || export.name != name {
                continue;
            }
            let func = FuncIdx::new(export.index as usize);
            let thunk = self
                .code
                .export_thunks
                .iter()
                .find(|(idx, _)| *idx == export_idx)
                .map(|(_, off)| *off)
                .expect("export without an entry thunk");
            return Ok((func, self.md.func_type(func), thunk));
        }
        Err(Error::ExportNotFound(name.to_string()))
    }

    /// Looks up an exported function suitable as a program entry:
    /// the WASI `_start`, or the sole exported nullary function.
    pub fn entry_export(&self) -> Option<&str> {
        if self.md.find_exported_func("_start").is_some() {
            return Some("_start");
        }
        let mut funcs = self
            .md
            .exports
            .values()
            .filter(|e| e.kind == ExportKind::Func);
        match (funcs.next(), funcs.next()) {
            (Some(e), None) => Some(&e.name),
            _ => None,
        }
    }

    /// Calls an exported function. The guest runs on the current thread;
    /// the GS base is (re)installed first.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Option<Value>, Error> {
        let (func, func_ty, thunk_off) = self.export(name)?;
        if args.len() != func_ty.params.len()
            || args.iter().zip(&func_ty.params).any(|(a, p)| a.ty() != *p)
        {
            return Err(Error::SignatureMismatch);
        }
        self.memory.set_gs();

        // The host-allocated top-level guest frame, 16-byte aligned.
        let frame_size = self.code.func_frame_sizes[func] as usize;
        let mut frame = vec![MaybeUninit::<u128>::zeroed(); frame_size.div_ceil(16)];
        let base = frame.as_mut_ptr() as usize;
        for (i, value) in args.iter().enumerate() {
            // SAFETY: slot i lies within the zeroed frame buffer.
            unsafe { ((base + 8 + 8 * i) as *mut u64).write(value.bits()) };
        }

        let thunk = self.code.region.abs_addr(thunk_off);
        // SAFETY: the thunk converts from the System-V ABI and the frame
        // buffer outlives the call; types were checked above.
        let result = unsafe {
            match func_ty.result {
                None => {
                    let f: extern "C" fn(usize) = std::mem::transmute(thunk);
                    f(base);
                    None
                }
                Some(ValType::I32) => {
                    let f: extern "C" fn(usize) -> u64 = std::mem::transmute(thunk);
                    Some(Value::I32(f(base) as u32 as i32))
                }
                Some(ValType::I64) => {
                    let f: extern "C" fn(usize) -> u64 = std::mem::transmute(thunk);
                    Some(Value::I64(f(base) as i64))
                }
                Some(ValType::F32) => {
                    let f: extern "C" fn(usize) -> f32 = std::mem::transmute(thunk);
                    Some(Value::F32(f(base)))
                }
                Some(ValType::F64) => {
                    let f: extern "C" fn(usize) -> f64 = std::mem::transmute(thunk);
                    Some(Value::F64(f(base)))
                }
            }
        };
        Ok(result)
    }
}
