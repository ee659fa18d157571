//! The emission pass: pastes stencils over the analyzed opcode records
//! and resolves every patch site.
//!
//! Emission walks each function's records once, tracking the concrete
//! operand-stack state: how many values of each class are pinned in
//! registers, and the frame offsets of the two spilled evaluation-stack
//! tops (which travel to the stencils through the fixup data). Control
//! flow leaves 4-byte displacement slots that are resolved at block ends;
//! call sites leave frame-size and target slots that are resolved once
//! every body has been placed.

use crate::abi;
use crate::br_table::BrTableLibrary;
use crate::branch::BranchLibrary;
use crate::call::CallLibrary;
use crate::call_indirect::CallIndirectLibrary;
use crate::code_region::CodeRegion;
use crate::entry;
use crate::error::CompileError;
use crate::library::StencilLibrary;
use crate::prepass::{self, BlockOperand, FuncBody, Operand};
use crate::stencil::FixupData;
use bumpalo::Bump;
use cranelift_entity::{EntityRef, SecondaryMap};
use module::{ByteStream, ExportIdx, ExportKind, FuncIdx, ModuleData, Opcode, TypeIdx, ValType};
use smallvec::SmallVec;
use tracing::{debug, debug_span, warn};

/// Resolves imported functions to host entry points. Implemented by the
/// runtime's host-call bridge.
pub trait ImportResolver {
    fn resolve(&self, module: &str, name: &str) -> Option<u64>;
    /// Host entry point backing `memory.grow`.
    fn memory_grow_entry(&self) -> u64;
}

pub struct CompiledCode {
    pub region: CodeRegion,
    /// Region offset of every function's entry (import thunks included).
    pub func_entries: SecondaryMap<FuncIdx, u32>,
    pub func_frame_sizes: SecondaryMap<FuncIdx, u32>,
    /// Host-entry thunk offsets for exported functions.
    pub export_thunks: Vec<(ExportIdx, u32)>,
    /// `br_table` landing pads, in landing-pad-table order.
    pub br_pads: Vec<u32>,
    /// Bytes below memzero where the indirect-call table begins.
    pub table_region_offset: u64,
    /// Total size of the negative metadata region.
    pub neg_region_len: u64,
}

/// Concrete operand-stack state during emission.
struct CodegenStack {
    int_base: u64,
    float_base: u64,
    float_limit: u64,
    k_int: u32,
    k_float: u32,
    fixups: FixupData,
}

impl CodegenStack {
    fn new(num_locals: u32, max_ints: u32, max_floats: u32) -> Self {
        let int_base = abi::int_stack_base(num_locals) as u64;
        let float_base = int_base + 8 * max_ints as u64;
        let float_limit = float_base + 8 * max_floats as u64;
        let mut fixups = FixupData::default();
        fixups.data[0] = int_base;
        fixups.data[1] = float_base;
        Self {
            int_base,
            float_base,
            float_limit,
            k_int: 0,
            k_float: 0,
            fixups,
        }
    }

    fn consume_ints(&mut self, n: u32) {
        let from_regs = self.k_int.min(n);
        self.k_int -= from_regs;
        self.fixups.data[0] -= 8 * (n - from_regs) as u64;
        debug_assert!(self.fixups.data[0] >= self.int_base);
    }

    fn consume_floats(&mut self, n: u32) {
        let from_regs = self.k_float.min(n);
        self.k_float -= from_regs;
        self.fixups.data[1] -= 8 * (n - from_regs) as u64;
        debug_assert!(self.fixups.data[1] >= self.float_base);
    }

    fn produce(&mut self, ty: ValType, spill: bool) {
        if spill {
            if ty.is_integral() {
                debug_assert_eq!(self.k_int, 0);
                self.fixups.data[0] += 8;
                debug_assert!(self.fixups.data[0] <= self.float_base);
            } else {
                debug_assert_eq!(self.k_float, 0);
                self.fixups.data[1] += 8;
                debug_assert!(self.fixups.data[1] <= self.float_limit);
            }
        } else if ty.is_integral() {
            self.k_int += 1;
            debug_assert!(self.k_int <= abi::MAX_INT_REGS);
        } else {
            self.k_float += 1;
            debug_assert!(self.k_float <= abi::MAX_FLOAT_REGS);
        }
    }

    fn spilled_ints(&self) -> u32 {
        ((self.fixups.data[0] - self.int_base) / 8) as u32
    }

    fn spilled_floats(&self) -> u32 {
        ((self.fixups.data[1] - self.float_base) / 8) as u32
    }

    fn reset(&mut self, in_ints: u32, in_floats: u32, sp_ints: u32, sp_floats: u32) {
        self.k_int = in_ints;
        self.k_float = in_floats;
        self.fixups.data[0] = self.int_base + 8 * sp_ints as u64;
        self.fixups.data[1] = self.float_base + 8 * sp_floats as u64;
        debug_assert!(self.fixups.data[0] <= self.float_base);
        debug_assert!(self.fixups.data[1] <= self.float_limit);
    }
}

/// One open block during emission.
struct CgBlock {
    in_ints: u32,
    sp_ints: u32,
    in_floats: u32,
    sp_floats: u32,
    ty: Option<ValType>,
    spill: bool,
    patch_slots: SmallVec<[u32; 4]>,
    else_slot: Option<u32>,
    loop_start: Option<u32>,
}

impl CgBlock {
    /// Frame offset of the block's spilled result slot.
    fn result_slot(&self, cg: &CodegenStack, ty: ValType) -> u64 {
        if ty.is_integral() {
            cg.int_base + 8 * self.sp_ints as u64
        } else {
            cg.float_base + 8 * self.sp_floats as u64
        }
    }
}

struct Emitter<'m, 'w> {
    md: &'m ModuleData<'w>,
    region: CodeRegion,
    func_entries: SecondaryMap<FuncIdx, u32>,
    func_frame_sizes: SecondaryMap<FuncIdx, u32>,
    /// Frame-size slots: (slot, callee).
    call_size_slots: Vec<(u32, FuncIdx)>,
    /// Call-target rel32 slots: (slot, callee).
    call_target_slots: Vec<(u32, FuncIdx)>,
    /// Indirect frame-size slots: (slot, signature).
    indirect_size_slots: Vec<(u32, TypeIdx)>,
    br_pads: Vec<u32>,
    table_region_offset: u64,
}

pub fn compile_module(
    md: &ModuleData<'_>,
    imports: &dyn ImportResolver,
) -> Result<CompiledCode, CompileError> {
    let _span = debug_span!("compile_module").entered();
    let mut region = CodeRegion::new()?;
    region.reserve(
        entry::HEADER_SIZE + entry::IMPORT_THUNK_SIZE * (md.num_imported_funcs + 1),
    );
    entry::emit_region_header(&mut region, imports.memory_grow_entry());

    let mut e = Emitter {
        md,
        region,
        func_entries: SecondaryMap::with_default(0),
        func_frame_sizes: SecondaryMap::with_default(0),
        call_size_slots: Vec::new(),
        call_target_slots: Vec::new(),
        indirect_size_slots: Vec::new(),
        br_pads: Vec::new(),
        table_region_offset: md.globals.len() as u64 * 8
            + 16
            + md.table_size() as u64 * 16,
    };

    // Imported functions become 16-byte host thunks.
    for i in 0..md.num_imported_funcs {
        let func = FuncIdx::new(i as usize);
        let name = &md.imported_func_names[i as usize];
        let host = imports.resolve(&name.module, &name.name);
        if host.is_none() {
            warn!(
                module = %name.module,
                name = %name.name,
                "unknown import; calls to it will trap"
            );
        }
        let off = entry::emit_import_thunk(&mut e.region, host);
        e.func_entries[func] = off;
        e.func_frame_sizes[func] =
            abi::frame_size_for_params(md.func_type(func).num_params());
    }

    // Function bodies: pre-pass then emission, one function at a time.
    if let Some(code) = md.code_section {
        let arena = Bump::new();
        let mut reader = ByteStream::new(code);
        let num_bodies = reader.read_uleb32();
        debug_assert_eq!(
            num_bodies,
            md.funcs.len() as u32 - md.num_imported_funcs
        );
        for i in 0..num_bodies {
            let func = FuncIdx::new((md.num_imported_funcs + i) as usize);
            let size = reader.read_uleb32() as usize;
            let mut body = reader.sub_stream(size);
            reader.skip(size);
            let func_ty = md.func_type(func).clone();
            let fb = prepass::analyze_function(&arena, md, &func_ty, &mut body)?;
            e.emit_function(func, &fb);
        }
    }

    // Per-function frame sizes are now final: resolve the call patches.
    for (slot, callee) in &e.call_size_slots {
        let size = e.func_frame_sizes[*callee];
        e.region.write_u32_at(*slot, size);
    }
    for (slot, callee) in &e.call_target_slots {
        let target = e.func_entries[*callee];
        e.region.patch_rel32(*slot, target);
    }
    // Indirect calls get the maximum frame size over the signature.
    if !e.indirect_size_slots.is_empty() {
        let mut per_type: SecondaryMap<TypeIdx, u32> = SecondaryMap::with_default(40);
        for (func, decl) in e.md.funcs.iter() {
            let size = e.func_frame_sizes[func];
            per_type[decl.type_idx] = per_type[decl.type_idx].max(size);
        }
        for (slot, type_idx) in &e.indirect_size_slots {
            e.region.write_u32_at(*slot, per_type[*type_idx]);
        }
    }

    // Host-entry thunks for exported functions.
    let mut export_thunks = Vec::new();
    for (export_idx, export) in md.exports.iter() {
        if export.kind != ExportKind::Func {
            continue;
        }
        let func = FuncIdx::new(export.index as usize);
        e.region.reserve(entry::ENTRY_THUNK_SIZE);
        let (off, call_slot) = entry::emit_entry_thunk(&mut e.region);
        e.region.patch_rel32(call_slot, e.func_entries[func]);
        export_thunks.push((export_idx, off));
    }

    let neg_region_len = e.table_region_offset + e.br_pads.len() as u64 * 8;
    debug!(
        code_bytes = e.region.pos(),
        functions = md.funcs.len(),
        neg_region_len,
        "compiled module"
    );
    Ok(CompiledCode {
        region: e.region,
        func_entries: e.func_entries,
        func_frame_sizes: e.func_frame_sizes,
        export_thunks,
        br_pads: e.br_pads,
        table_region_offset: e.table_region_offset,
        neg_region_len,
    })
}

impl Emitter<'_, '_> {
    fn emit_function(&mut self, func: FuncIdx, fb: &FuncBody<'_>) {
        let lib = StencilLibrary::global();
        let branches = BranchLibrary::global();
        let calls = CallLibrary::global();
        let br_tables = BrTableLibrary::global();
        let call_indirects = CallIndirectLibrary::global();

        self.region.reserve(fb.max_code_size + 256);
        self.region.align16();
        self.func_entries[func] = self.region.pos();
        self.func_frame_sizes[func] =
            abi::frame_size_for_body(fb.num_locals, fb.max_ints, fb.max_floats);
        debug_span!("emit_function", func = func.index()).in_scope(|| {
            debug!(
                ops = fb.ops.len(),
                max_ints = fb.max_ints,
                max_floats = fb.max_floats,
                frame_size = self.func_frame_sizes[func],
                "emitting"
            );
        });

        self.zero_locals(fb.num_params, fb.num_locals);

        let mut cg = CodegenStack::new(fb.num_locals, fb.max_ints, fb.max_floats);
        let mut blocks: Vec<CgBlock> = Vec::new();

        for rec in fb.ops.iter() {
            let op = rec.op;
            let info = op.info();
            if !info.special {
                match rec.operand {
                    Operand::Imm(bits) => cg.fixups.set_imm(bits),
                    Operand::Index(v) => {
                        if is_global_access(op) {
                            cg.fixups.set_imm_neg(v as u64);
                        } else {
                            cg.fixups.set_imm(v as u64);
                        }
                    }
                    Operand::None => {}
                    _ => unreachable!(),
                }
                lib.get(op, cg.k_int, cg.k_float, rec.spill_output)
                    .emit(&mut self.region, &cg.fixups);
                cg.consume_ints(info.int_consumes as u32);
                cg.consume_floats(info.float_consumes as u32);
                if let Some(ty) = info.output {
                    cg.produce(ty, rec.spill_output);
                }
                continue;
            }

            match op {
                Opcode::Block | Opcode::Loop | Opcode::If => {
                    let Operand::Block(b) = rec.operand else { unreachable!() };
                    let mut else_slot = None;
                    let mut loop_start = None;
                    if op == Opcode::If {
                        else_slot =
                            Some(branches.emit_if(&mut self.region, cg.k_int, &cg.fixups));
                        cg.consume_ints(1);
                    } else if op == Opcode::Loop {
                        self.region.align16();
                        loop_start = Some(self.region.pos());
                    }
                    blocks.push(open_block(&cg, &b, fb, else_slot, loop_start));
                }
                Opcode::End => {
                    let blk = blocks.pop().expect("unbalanced block stack");
                    // Place the fallthrough result according to the
                    // block's committed shape before the join point.
                    self.fix_fallthrough_result(&mut cg, &blk);
                    let join = self.region.pos();
                    let target = blk.loop_start.unwrap_or(join);
                    for slot in &blk.patch_slots {
                        self.region.patch_rel32(*slot, target);
                    }
                    if let Some(slot) = blk.else_slot {
                        self.region.patch_rel32(slot, join);
                    }
                    cg.reset(blk.in_ints, blk.in_floats, blk.sp_ints, blk.sp_floats);
                    if let Some(ty) = blk.ty {
                        cg.produce(ty, blk.spill);
                    }
                }
                Opcode::Else => {
                    {
                        let blk = blocks.last().expect("else outside a block");
                        debug_assert!(blk.else_slot.is_some(), "else without if");
                        self.fix_fallthrough_result(&mut cg, blk);
                        cg.reset(blk.in_ints, blk.in_floats, blk.sp_ints, blk.sp_floats);
                    }
                    // The then-arm jumps over the else-arm to the join.
                    let skip = BranchLibrary::emit_br(&mut self.region);
                    let else_target = self.region.pos();
                    let blk = blocks.last_mut().unwrap();
                    blk.patch_slots.push(skip);
                    let else_slot = blk.else_slot.take().expect("else without if");
                    self.region.patch_rel32(else_slot, else_target);
                }
                Opcode::Br => {
                    let Operand::Index(depth) = rec.operand else { unreachable!() };
                    let slot = self.emit_branch(&mut cg, &blocks, depth, false);
                    let blk_idx = blocks.len() - 1 - depth as usize;
                    let blk = &mut blocks[blk_idx];
                    blk.patch_slots.push(slot);
                }
                Opcode::BrIf => {
                    let Operand::Index(depth) = rec.operand else { unreachable!() };
                    let slot = self.emit_branch(&mut cg, &blocks, depth, true);
                    let blk_idx = blocks.len() - 1 - depth as usize;
                    let blk = &mut blocks[blk_idx];
                    blk.patch_slots.push(slot);
                    cg.consume_ints(1);
                }
                Opcode::BrTable => {
                    let Operand::BrTable { start, cases } = rec.operand else {
                        unreachable!()
                    };
                    let pad_base = self.br_pads.len() as u64;
                    let base_offset =
                        self.table_region_offset + pad_base * 8 + (cases as u64 + 1) * 8;
                    cg.fixups.set_imm_neg(base_offset);
                    cg.fixups.set_bound(cases as u64);
                    br_tables.emit(&mut self.region, cg.k_int, &cg.fixups);
                    cg.consume_ints(1);

                    let first = self.br_pads.len();
                    self.br_pads
                        .extend(std::iter::repeat(0).take(cases as usize + 1));
                    for i in 0..=cases {
                        // Landing pads are laid out top-down in the table.
                        self.br_pads[first + (cases - i) as usize] = self.region.pos();
                        let depth = fb.br_targets[(start + i) as usize];
                        let slot = self.emit_branch(&mut cg, &blocks, depth, false);
                        let blk_idx = blocks.len() - 1 - depth as usize;
                        let blk = &mut blocks[blk_idx];
                        blk.patch_slots.push(slot);
                    }
                }
                Opcode::Call => {
                    let Operand::Index(idx) = rec.operand else { unreachable!() };
                    let callee = FuncIdx::new(idx as usize);
                    let callee_ty = self.md.func_type(callee).clone();
                    let slot1 = calls.emit_prepare(&mut self.region);
                    self.emit_param_fills(&mut cg, &callee_ty);
                    lib.get(Opcode::SwitchFrame, 0, 0, false)
                        .emit(&mut self.region, &cg.fixups);
                    let target_slot = CallLibrary::emit_call(&mut self.region);
                    let slot2 = calls.emit_cleanup(
                        &mut self.region,
                        callee_ty.result,
                        rec.spill_output,
                        &cg.fixups,
                    );
                    if let Some(ret) = callee_ty.result {
                        cg.produce(ret, rec.spill_output);
                    }
                    self.call_size_slots.push((slot1, callee));
                    self.call_size_slots.push((slot2, callee));
                    self.call_target_slots.push((target_slot, callee));
                }
                Opcode::CallIndirect => {
                    let Operand::Index(idx) = rec.operand else { unreachable!() };
                    let type_idx = TypeIdx::new(idx as usize);
                    let callee_ty = self.md.types[type_idx].clone();
                    cg.fixups.set_bound(self.md.table_size() as u64);
                    cg.fixups.set_imm_neg(self.table_region_offset);
                    cg.fixups.set_sig(idx as u64);
                    call_indirects.emit(
                        &mut self.region,
                        cg.k_int,
                        entry::UD2_OFFSET,
                        &cg.fixups,
                    );
                    cg.consume_ints(1);

                    let slot1 = calls.emit_prepare(&mut self.region);
                    self.emit_param_fills(&mut cg, &callee_ty);
                    CallIndirectLibrary::emit_call(&mut self.region);
                    let slot2 = calls.emit_cleanup(
                        &mut self.region,
                        callee_ty.result,
                        rec.spill_output,
                        &cg.fixups,
                    );
                    if let Some(ret) = callee_ty.result {
                        cg.produce(ret, rec.spill_output);
                    }
                    self.indirect_size_slots.push((slot1, type_idx));
                    self.indirect_size_slots.push((slot2, type_idx));
                }
                Opcode::Unreachable => {
                    self.region.push_bytes(&[0x0f, 0x0b]);
                }
                Opcode::Nop => {}
                Opcode::MemorySize => {
                    // The current page count lives 8 bytes below memzero.
                    cg.fixups.set_imm_neg(8);
                    lib.get(Opcode::GlobalGetI32, cg.k_int, cg.k_float, rec.spill_output)
                        .emit(&mut self.region, &cg.fixups);
                    cg.produce(ValType::I32, rec.spill_output);
                }
                Opcode::MemoryGrow => {
                    let slot1 = calls.emit_prepare(&mut self.region);
                    self.region
                        .write_u32_at(slot1, abi::frame_size_for_params(1));
                    cg.fixups.set_imm(8);
                    lib.get(Opcode::FillParamI32, cg.k_int, cg.k_float, false)
                        .emit(&mut self.region, &cg.fixups);
                    cg.consume_ints(1);
                    debug_assert_eq!((cg.k_int, cg.k_float), (0, 0));
                    lib.get(Opcode::SwitchFrame, 0, 0, false)
                        .emit(&mut self.region, &cg.fixups);
                    let target_slot = CallLibrary::emit_call(&mut self.region);
                    self.region
                        .patch_rel32(target_slot, entry::GROW_THUNK_OFFSET);
                    let slot2 = calls.emit_cleanup(
                        &mut self.region,
                        Some(ValType::I32),
                        rec.spill_output,
                        &cg.fixups,
                    );
                    self.region
                        .write_u32_at(slot2, abi::frame_size_for_params(1));
                    cg.produce(ValType::I32, rec.spill_output);
                }
                other => unreachable!("unhandled special opcode {other:?}"),
            }
        }
        debug_assert!(blocks.is_empty());
    }

    /// Emits a `br`/`br_if`; returns the displacement slot.
    fn emit_branch(
        &mut self,
        cg: &mut CodegenStack,
        blocks: &[CgBlock],
        depth: u32,
        conditional: bool,
    ) -> u32 {
        let branches = BranchLibrary::global();
        let blk = &blocks[blocks.len() - 1 - depth as usize];
        // Branches to a loop header re-enter with the entry shape and
        // never carry a value.
        let carried = blk.ty.filter(|_| blk.loop_start.is_none());
        match carried {
            Some(ty) => {
                if blk.spill {
                    let slot = blk.result_slot(cg, ty);
                    cg.fixups.set_imm(slot);
                }
                if conditional {
                    branches.emit_cond_br_with_output(
                        &mut self.region,
                        cg.k_int,
                        cg.k_float,
                        blk.in_ints,
                        blk.in_floats,
                        ty,
                        blk.spill,
                        &cg.fixups,
                    )
                } else {
                    branches.emit_br_with_output(
                        &mut self.region,
                        cg.k_int,
                        cg.k_float,
                        blk.in_ints,
                        blk.in_floats,
                        ty,
                        blk.spill,
                        &cg.fixups,
                    )
                }
            }
            None => {
                if conditional {
                    branches.emit_cond_br(&mut self.region, cg.k_int, &cg.fixups)
                } else {
                    BranchLibrary::emit_br(&mut self.region)
                }
            }
        }
    }
}

fn open_block(
    cg: &CodegenStack,
    b: &BlockOperand,
    fb: &FuncBody<'_>,
    else_slot: Option<u32>,
    loop_start: Option<u32>,
) -> CgBlock {
    // Split the entry shape into spilled and in-register parts
    // according to the concrete state at this point.
    let cur_sp_ints = cg.spilled_ints();
    let (sp_ints, in_ints) = if b.entry_ints <= cur_sp_ints {
        (b.entry_ints, 0)
    } else {
        (cur_sp_ints, b.entry_ints - cur_sp_ints)
    };
    let cur_sp_floats = cg.spilled_floats();
    let (sp_floats, in_floats) = if b.entry_floats <= cur_sp_floats {
        (b.entry_floats, 0)
    } else {
        (cur_sp_floats, b.entry_floats - cur_sp_floats)
    };
    let end_rec = &fb.ops[b.end as usize];
    debug_assert_eq!(end_rec.op, Opcode::End);
    CgBlock {
        in_ints,
        sp_ints,
        in_floats,
        sp_floats,
        ty: b.ty,
        spill: end_rec.spill_output,
        patch_slots: SmallVec::with_capacity(b.refs as usize),
        else_slot,
        loop_start,
    }
}

impl Emitter<'_, '_> {
    /// The fallthrough value of a block with a result must land where the
    /// join point expects it: the pre-pass may have spilled either the
    /// producing instruction or the block result itself, independently.
    fn fix_fallthrough_result(&mut self, cg: &mut CodegenStack, blk: &CgBlock) {
        let Some(ty) = blk.ty else { return };
        let branches = BranchLibrary::global();
        let (cur_count, entry_count, value_in_reg, k) = if ty.is_integral() {
            (
                cg.k_int + cg.spilled_ints(),
                blk.in_ints + blk.sp_ints,
                cg.k_int > 0,
                cg.k_int,
            )
        } else {
            (
                cg.k_float + cg.spilled_floats(),
                blk.in_floats + blk.sp_floats,
                cg.k_float > 0,
                cg.k_float,
            )
        };
        if cur_count != entry_count + 1 {
            // Dead fallthrough (the arm ended in br/unreachable).
            return;
        }
        match (value_in_reg, blk.spill) {
            (true, true) => branches.emit_end_store(&mut self.region, ty, k, &cg.fixups),
            (false, false) => branches.emit_end_reload(&mut self.region, ty, &cg.fixups),
            _ => {}
        }
    }

    /// Fills the callee frame back to front and consumes the arguments.
    fn emit_param_fills(&mut self, cg: &mut CodegenStack, callee_ty: &module::FuncType) {
        let lib = StencilLibrary::global();
        let num_params = callee_ty.num_params();
        cg.fixups.set_imm(8 * num_params as u64);
        for i in (0..num_params).rev() {
            let ty = callee_ty.params[i as usize];
            lib.get(Opcode::fill_param(ty), cg.k_int, cg.k_float, false)
                .emit(&mut self.region, &cg.fixups);
            if ty.is_integral() {
                cg.consume_ints(1);
            } else {
                cg.consume_floats(1);
            }
            cg.fixups.data[crate::stencil::SLOT_IMM as usize] -= 8;
        }
        debug_assert_eq!((cg.k_int, cg.k_float), (0, 0));
    }

    /// WASM locals start zeroed: pairs via one 16-byte store, plus a
    /// trailing 8-byte store when the count is odd.
    fn zero_locals(&mut self, num_params: u32, num_locals: u32) {
        let mut remaining = num_locals - num_params;
        if remaining == 0 {
            return;
        }
        let mut a = crate::asm::Assembler::new();
        let mut offset = (8 + 8 * num_params) as i32;
        if remaining > 1 {
            a.xorps(crate::asm::Xmm::Xmm0, crate::asm::Xmm::Xmm0);
            while remaining > 1 {
                a.movups_store(abi::FRAME, offset, crate::asm::Xmm::Xmm0);
                offset += 16;
                remaining -= 2;
            }
        }
        if remaining == 1 {
            a.mov_store_imm32(true, abi::FRAME, offset, 0);
        }
        self.region.push_bytes(a.bytes());
    }
}

fn is_global_access(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::GlobalGetI32
            | Opcode::GlobalGetI64
            | Opcode::GlobalGetF32
            | Opcode::GlobalGetF64
            | Opcode::GlobalSetI32
            | Opcode::GlobalSetI64
            | Opcode::GlobalSetF32
            | Opcode::GlobalSetF64
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use module::decode_module;

    struct NoImports;

    impl ImportResolver for NoImports {
        fn resolve(&self, _module: &str, _name: &str) -> Option<u64> {
            None
        }

        fn memory_grow_entry(&self) -> u64 {
            0x1000
        }
    }

    fn compile(wat_src: &str) -> CompiledCode {
        let bytes = wat::parse_str(wat_src).unwrap();
        let md = decode_module(&bytes).unwrap();
        compile_module(&md, &NoImports).unwrap()
    }

    #[test]
    fn layout_starts_with_trap_and_grow_thunk() {
        let code = compile(r#"(module (func (export "f")))"#);
        let bytes = code.region.bytes();
        assert_eq!(&bytes[0..2], [0x0f, 0x0b]);
        assert_eq!(&bytes[16..19], [0x4c, 0x89, 0xef]);
        // The function entry is 16-byte aligned, after the header.
        let func = FuncIdx::new(0);
        assert_eq!(code.func_entries[func] % 16, 0);
        assert!(code.func_entries[func] >= entry::HEADER_SIZE);
        assert_eq!(code.export_thunks.len(), 1);
    }

    #[test]
    fn frame_sizes_follow_the_signature() {
        let code = compile(
            r#"(module
                (func (export "f") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        );
        // ret slot + 2 params + a 2-deep evaluation stack.
        assert_eq!(code.func_frame_sizes[FuncIdx::new(0)], 72);
    }

    #[test]
    fn recompilation_is_byte_identical() {
        let src = r#"(module
            (memory 1)
            (func $f (param i32) (result i32)
                (i32.add (local.get 0) (i32.const 1)))
            (func (export "main") (result i32)
                (call $f (i32.const 41))))"#;
        let a = compile(src);
        let b = compile(src);
        assert_eq!(a.region.bytes(), b.region.bytes());
        assert_eq!(a.br_pads, b.br_pads);
        assert_eq!(a.neg_region_len, b.neg_region_len);
    }

    #[test]
    fn every_call_slot_is_resolved() {
        let code = compile(
            r#"(module
                (func $callee (param i32))
                (func (export "f")
                    i32.const 3
                    call $callee))"#,
        );
        // The callee's frame size (40 bytes) appears in both the sub and
        // the add of the call sequence.
        let bytes = code.region.bytes();
        let sub = [0x48, 0x81, 0xec, 40, 0, 0, 0];
        let add = [0x48, 0x81, 0xc4, 40, 0, 0, 0];
        let found_sub = bytes.windows(sub.len()).any(|w| w == sub);
        let found_add = bytes.windows(add.len()).any(|w| w == add);
        assert!(found_sub && found_add);
    }

    #[test]
    fn br_table_allocates_landing_pads() {
        let code = compile(
            r#"(module (func (export "f") (param i32) (result i32)
                (block
                    (block
                        (block
                            local.get 0
                            br_table 0 1 2)
                        (return (i32.const 10)))
                    (return (i32.const 20)))
                i32.const 30))"#,
        );
        assert_eq!(code.br_pads.len(), 3);
        assert!(code.br_pads.iter().all(|&p| p > 0));
        assert_eq!(
            code.neg_region_len,
            code.table_region_offset + 3 * 8
        );
    }
}
