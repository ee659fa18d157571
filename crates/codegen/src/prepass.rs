//! The operand-shape pre-pass.
//!
//! One forward walk per function body: decode the opcode stream into
//! arena-allocated records and simulate an abstract operand stack that
//! decides, for every producing instruction, whether its result stays in
//! a register or is spilled to the in-memory evaluation stack.
//!
//! At most three integers and three floats live in registers. When a
//! push would lift a value beyond that window, the *oldest* unspilled
//! producer is retroactively marked `spill_output` — the spill waterline
//! only ever moves up. Call-like boundaries spill everything, since the
//! pinned registers do not survive a call.
//!
//! The walk also rewrites polymorphic opcodes into their typed forms
//! (locals, globals, select, drop, return), converts local/global
//! indices into frame/metadata offsets, tallies branch references per
//! block, and accumulates a worst-case emission size.

use crate::abi::{MAX_FLOAT_REGS, MAX_INT_REGS};
use crate::br_table::BrTableLibrary;
use crate::branch::BranchLibrary;
use crate::call::CallLibrary;
use crate::call_indirect::CallIndirectLibrary;
use crate::error::CompileError;
use crate::library::StencilLibrary;
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use module::{ByteStream, FuncType, ModuleData, Opcode, OperandKind, ValType};

#[derive(Copy, Clone, Debug, Default)]
pub struct BlockOperand {
    pub ty: Option<ValType>,
    /// Operand-stack shape on entry (absolute counts, both classes).
    pub entry_ints: u32,
    pub entry_floats: u32,
    /// Index of the matching `end` record.
    pub end: u32,
    /// Number of branches targeting this block.
    pub refs: u32,
}

#[derive(Copy, Clone, Debug)]
pub enum Operand {
    None,
    /// Local/global frame offset, function index, type index, branch
    /// depth, ... depending on the opcode.
    Index(u32),
    /// Constant bits.
    Imm(u64),
    Block(BlockOperand),
    /// `cases` entries plus the default, flattened into
    /// [`FuncBody::br_targets`] starting at `start`.
    BrTable { start: u32, cases: u32 },
}

#[derive(Clone, Debug)]
pub struct OpRecord {
    pub op: Opcode,
    pub spill_output: bool,
    pub operand: Operand,
}

pub struct FuncBody<'a> {
    pub ops: BumpVec<'a, OpRecord>,
    pub br_targets: BumpVec<'a, u32>,
    /// Peak operand-stack occupancy; sizes the evaluation-stack region.
    pub max_ints: u32,
    pub max_floats: u32,
    /// Parameters plus declared locals.
    pub num_locals: u32,
    pub num_params: u32,
    /// Worst-case emission size in bytes.
    pub max_code_size: u32,
}

/// The abstract operand stack.
#[derive(Default)]
struct AbstractStack {
    types: Vec<ValType>,
    /// Producing op index per live integer value, bottom to top.
    int_producers: Vec<u32>,
    float_producers: Vec<u32>,
    int_waterline: usize,
    float_waterline: usize,
    max_ints: u32,
    max_floats: u32,
}

impl AbstractStack {
    fn height(&self) -> usize {
        self.types.len()
    }

    fn top(&self, depth: usize) -> ValType {
        self.types[self.types.len() - 1 - depth]
    }

    fn push(&mut self, ty: ValType, producer: u32, ops: &mut [OpRecord]) {
        self.types.push(ty);
        if ty.is_integral() {
            self.int_producers.push(producer);
            self.max_ints = self.max_ints.max(self.int_producers.len() as u32);
            // A fourth live integer: spill the oldest unspilled one.
            if self.int_waterline + (MAX_INT_REGS as usize) < self.int_producers.len() {
                ops[self.int_producers[self.int_waterline] as usize].spill_output = true;
                self.int_waterline += 1;
                debug_assert_eq!(
                    self.int_waterline + MAX_INT_REGS as usize,
                    self.int_producers.len()
                );
            }
        } else {
            self.float_producers.push(producer);
            self.max_floats = self.max_floats.max(self.float_producers.len() as u32);
            if self.float_waterline + (MAX_FLOAT_REGS as usize) < self.float_producers.len() {
                ops[self.float_producers[self.float_waterline] as usize].spill_output = true;
                self.float_waterline += 1;
            }
        }
    }

    fn consume(&mut self, num_ints: u32, num_floats: u32) {
        debug_assert!({
            let mut ints = 0;
            let mut floats = 0;
            for depth in 0..(num_ints + num_floats) as usize {
                if self.top(depth).is_integral() {
                    ints += 1;
                } else {
                    floats += 1;
                }
            }
            ints == num_ints && floats == num_floats
        });
        self.types.truncate(self.types.len() - (num_ints + num_floats) as usize);
        self.int_producers.truncate(self.int_producers.len() - num_ints as usize);
        self.float_producers.truncate(self.float_producers.len() - num_floats as usize);
        self.int_waterline = self.int_waterline.min(self.int_producers.len());
        self.float_waterline = self.float_waterline.min(self.float_producers.len());
    }

    /// Rewinds to a block-entry shape (at `end`/`else`).
    fn reset_to(&mut self, num_ints: u32, num_floats: u32) {
        debug_assert!(
            num_ints as usize <= self.int_producers.len()
                && num_floats as usize <= self.float_producers.len()
        );
        self.types.truncate((num_ints + num_floats) as usize);
        self.int_producers.truncate(num_ints as usize);
        self.float_producers.truncate(num_floats as usize);
        self.int_waterline = self.int_waterline.min(self.int_producers.len());
        self.float_waterline = self.float_waterline.min(self.float_producers.len());
    }

    /// Registers do not survive a call: spill every live producer.
    fn force_spill_all(&mut self, ops: &mut [OpRecord]) {
        while self.int_waterline < self.int_producers.len() {
            ops[self.int_producers[self.int_waterline] as usize].spill_output = true;
            self.int_waterline += 1;
        }
        while self.float_waterline < self.float_producers.len() {
            ops[self.float_producers[self.float_waterline] as usize].spill_output = true;
            self.float_waterline += 1;
        }
    }
}

/// Frame offset of local `idx` (the scratch slot is at 0).
fn local_offset(idx: u32) -> u32 {
    idx * 8 + 8
}

/// Metadata-region offset of global `idx`, below memzero (the size and
/// self-pointer slots occupy the first 16 bytes).
fn global_offset(idx: u32) -> u32 {
    idx * 8 + 24
}

pub fn analyze_function<'a>(
    arena: &'a Bump,
    md: &ModuleData<'_>,
    func_ty: &FuncType,
    body: &mut ByteStream<'_>,
) -> Result<FuncBody<'a>, CompileError> {
    let lib = StencilLibrary::global();

    // Locals: parameters first, then the run-length declared ones.
    let mut locals: Vec<ValType> = func_ty.params.to_vec();
    let num_decls = body.read_uleb32();
    for _ in 0..num_decls {
        let run = body.read_uleb32();
        let ty = ValType::parse(body);
        locals.extend(std::iter::repeat(ty).take(run as usize));
    }
    let num_locals = locals.len() as u32;
    let num_params = func_ty.num_params();

    let mut ops: BumpVec<'a, OpRecord> = BumpVec::new_in(arena);
    let mut br_targets: BumpVec<'a, u32> = BumpVec::new_in(arena);
    let mut stack = AbstractStack::default();
    // Op indices of open blocks, innermost last.
    let mut block_stack: Vec<u32> = Vec::new();
    // Alignment padding plus the local-zeroing prologue.
    let mut max_code_size: u32 = 48 + 5 * (num_locals - num_params);

    macro_rules! block_ref {
        ($depth:expr) => {{
            let depth = $depth as usize;
            debug_assert!(depth < block_stack.len());
            let idx = block_stack[block_stack.len() - 1 - depth] as usize;
            match &mut ops[idx].operand {
                Operand::Block(b) => b.refs += 1,
                _ => unreachable!(),
            }
        }};
    }

    loop {
        let op_index = ops.len() as u32;
        let mut op = Opcode::from_wire(body.read_u8());
        let info = op.info();
        let mut operand = Operand::None;
        // Placeholder so retroactive spill marking can index this record;
        // completed at the end of the iteration.
        ops.push(OpRecord {
            op,
            spill_output: false,
            operand: Operand::None,
        });

        match info.operands {
            OperandKind::None => {}
            OperandKind::U32 => operand = Operand::Index(body.read_uleb32()),
            OperandKind::Mem => {
                let _align = body.read_uleb32();
                operand = Operand::Index(body.read_uleb32());
            }
            OperandKind::Const => {
                let bits = match op {
                    Opcode::I32Const => body.read_sleb32() as u32 as u64,
                    Opcode::I64Const => body.read_sleb64() as u64,
                    Opcode::F32Const => body.read_u32() as u64,
                    Opcode::F64Const => body.read_u64(),
                    _ => unreachable!(),
                };
                operand = Operand::Imm(bits);
            }
            OperandKind::BlockType => {
                let val = body.read_sleb64();
                if val >= 0 {
                    return Err(CompileError::Unsupported(
                        "block type referencing a function type (multi-value)",
                    ));
                }
                let ty = if val < -4 {
                    None
                } else {
                    Some(ValType::from_wire(0x7f - (-val - 1) as u8))
                };
                if op == Opcode::If {
                    debug_assert_eq!(stack.top(0), ValType::I32);
                    stack.consume(1, 0);
                }
                operand = Operand::Block(BlockOperand {
                    ty,
                    entry_ints: stack.int_producers.len() as u32,
                    entry_floats: stack.float_producers.len() as u32,
                    end: 0,
                    refs: 0,
                });
                block_stack.push(op_index);
            }
            OperandKind::Special => {
                if op == Opcode::CallIndirect {
                    let type_idx = body.read_uleb32();
                    // Trailing reserved table index.
                    let _ = body.read_u8();
                    operand = Operand::Index(type_idx);
                } else {
                    debug_assert_eq!(op, Opcode::BrTable);
                    let cases = body.read_uleb32();
                    let start = br_targets.len() as u32;
                    for _ in 0..=cases {
                        let target = body.read_uleb32();
                        br_targets.push(target);
                        block_ref!(target);
                    }
                    operand = Operand::BrTable { start, cases };
                    max_code_size += BrTableLibrary::MAX_EMIT + 48 * (cases + 1);
                }
            }
        }

        if !info.special {
            max_code_size += lib.max_size(op);
            stack.consume(info.int_consumes as u32, info.float_consumes as u32);
            if let Some(out) = info.output {
                stack.push(out, op_index, &mut ops);
            }
        } else {
            match op {
                Opcode::LocalGet => {
                    let Operand::Index(idx) = operand else { unreachable!() };
                    let ty = locals[idx as usize];
                    op = Opcode::local_get(ty);
                    operand = Operand::Index(local_offset(idx));
                    stack.push(ty, op_index, &mut ops);
                    max_code_size += lib.max_size(op);
                }
                Opcode::LocalSet | Opcode::LocalTee => {
                    let Operand::Index(idx) = operand else { unreachable!() };
                    let ty = locals[idx as usize];
                    debug_assert_eq!(ty, stack.top(0));
                    let tee = op == Opcode::LocalTee;
                    op = if tee { Opcode::local_tee(ty) } else { Opcode::local_set(ty) };
                    operand = Operand::Index(local_offset(idx));
                    if ty.is_integral() {
                        stack.consume(1, 0);
                    } else {
                        stack.consume(0, 1);
                    }
                    if tee {
                        stack.push(ty, op_index, &mut ops);
                    }
                    max_code_size += lib.max_size(op);
                }
                Opcode::GlobalGet => {
                    let Operand::Index(idx) = operand else { unreachable!() };
                    let ty = md.globals[cranelift_entity::EntityRef::new(idx as usize)].ty;
                    op = Opcode::global_get(ty);
                    operand = Operand::Index(global_offset(idx));
                    stack.push(ty, op_index, &mut ops);
                    max_code_size += lib.max_size(op);
                }
                Opcode::GlobalSet => {
                    let Operand::Index(idx) = operand else { unreachable!() };
                    let global = &md.globals[cranelift_entity::EntityRef::new(idx as usize)];
                    debug_assert!(global.mutable);
                    let ty = global.ty;
                    debug_assert_eq!(ty, stack.top(0));
                    op = Opcode::global_set(ty);
                    operand = Operand::Index(global_offset(idx));
                    if ty.is_integral() {
                        stack.consume(1, 0);
                    } else {
                        stack.consume(0, 1);
                    }
                    max_code_size += lib.max_size(op);
                }
                Opcode::Select => {
                    debug_assert!(stack.height() >= 3);
                    debug_assert_eq!(stack.top(0), ValType::I32);
                    let ty = stack.top(1);
                    debug_assert_eq!(stack.top(2), ty);
                    op = Opcode::select(ty);
                    if ty.is_integral() {
                        stack.consume(3, 0);
                    } else {
                        stack.consume(1, 2);
                    }
                    stack.push(ty, op_index, &mut ops);
                    max_code_size += lib.max_size(op);
                }
                Opcode::Drop => {
                    if stack.top(0).is_integral() {
                        op = Opcode::DropInt;
                        stack.consume(1, 0);
                    } else {
                        op = Opcode::DropFloat;
                        stack.consume(0, 1);
                    }
                }
                Opcode::Return => {
                    op = Opcode::ret(func_ty.result);
                    max_code_size += 16;
                }
                Opcode::End => {
                    let Some(block_idx) = block_stack.pop() else {
                        // Function end; the final `end` has no record.
                        ops.pop();
                        break;
                    };
                    let block = match &mut ops[block_idx as usize].operand {
                        Operand::Block(b) => {
                            b.end = op_index;
                            *b
                        }
                        _ => unreachable!(),
                    };
                    stack.reset_to(block.entry_ints, block.entry_floats);
                    if let Some(ty) = block.ty {
                        stack.push(ty, op_index, &mut ops);
                    }
                    max_code_size += 32;
                }
                Opcode::Else => {
                    debug_assert!(!block_stack.is_empty());
                    let block_idx = *block_stack.last().unwrap() as usize;
                    let Operand::Block(b) = ops[block_idx].operand else { unreachable!() };
                    stack.reset_to(b.entry_ints, b.entry_floats);
                    max_code_size += 48;
                }
                Opcode::Block => { /* entry shape recorded above */ }
                Opcode::Loop => max_code_size += 32,
                Opcode::If => max_code_size += 16,
                Opcode::Br => {
                    let Operand::Index(depth) = operand else { unreachable!() };
                    block_ref!(depth);
                    max_code_size += BranchLibrary::MAX_EMIT;
                }
                Opcode::BrIf => {
                    debug_assert_eq!(stack.top(0), ValType::I32);
                    stack.consume(1, 0);
                    let Operand::Index(depth) = operand else { unreachable!() };
                    block_ref!(depth);
                    max_code_size += BranchLibrary::MAX_EMIT + 16;
                }
                Opcode::BrTable => {
                    debug_assert_eq!(stack.top(0), ValType::I32);
                    // References were tallied while decoding the list.
                }
                Opcode::Call => {
                    let Operand::Index(idx) = operand else { unreachable!() };
                    let callee_ty = md.func_type(cranelift_entity::EntityRef::new(idx as usize));
                    stack.consume(callee_ty.num_int_params, callee_ty.num_float_params);
                    stack.force_spill_all(&mut ops);
                    if let Some(ret) = callee_ty.result {
                        stack.push(ret, op_index, &mut ops);
                    }
                    max_code_size +=
                        CallLibrary::MAX_EMIT + 24 * callee_ty.num_params();
                }
                Opcode::CallIndirect => {
                    debug_assert_eq!(stack.top(0), ValType::I32);
                    stack.consume(1, 0);
                    let Operand::Index(idx) = operand else { unreachable!() };
                    let callee_ty = &md.types[cranelift_entity::EntityRef::new(idx as usize)];
                    stack.consume(callee_ty.num_int_params, callee_ty.num_float_params);
                    stack.force_spill_all(&mut ops);
                    if let Some(ret) = callee_ty.result {
                        stack.push(ret, op_index, &mut ops);
                    }
                    max_code_size += CallIndirectLibrary::MAX_EMIT
                        + CallLibrary::MAX_EMIT
                        + 24 * callee_ty.num_params();
                }
                Opcode::Unreachable | Opcode::Nop => max_code_size += 2,
                Opcode::MemorySize => {
                    stack.push(ValType::I32, op_index, &mut ops);
                    max_code_size += 16;
                }
                Opcode::MemoryGrow => {
                    debug_assert_eq!(stack.top(0), ValType::I32);
                    stack.consume(1, 0);
                    stack.force_spill_all(&mut ops);
                    stack.push(ValType::I32, op_index, &mut ops);
                    max_code_size += CallLibrary::MAX_EMIT + 32;
                }
                other => unreachable!("unhandled special opcode {other:?}"),
            }
        }

        // Keep any spill flag a later push may already have set.
        let rec = ops.last_mut().unwrap();
        rec.op = op;
        rec.operand = operand;
    }
    debug_assert!(block_stack.is_empty());

    // Bodies that fall off the end need an implicit return.
    let needs_return = ops.last().map_or(true, |rec| !rec.op.is_terminal());
    if needs_return {
        if let Some(ret) = func_ty.result {
            debug_assert!(stack.height() > 0 && stack.top(0) == ret);
        }
        ops.push(OpRecord {
            op: Opcode::ret(func_ty.result),
            spill_output: false,
            operand: Operand::None,
        });
        max_code_size += 16;
    }

    Ok(FuncBody {
        ops,
        br_targets,
        max_ints: stack.max_ints,
        max_floats: stack.max_floats,
        num_locals,
        num_params,
        max_code_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use module::decode_module;

    fn analyze(wat_src: &str) -> (Vec<OpRecord>, u32, u32) {
        let bytes = wat::parse_str(wat_src).unwrap();
        let md = decode_module(&bytes).unwrap();
        let code = md.code_section.unwrap();
        let mut reader = ByteStream::new(code);
        let num = reader.read_uleb32();
        assert_eq!(num, 1);
        let size = reader.read_uleb32() as usize;
        let mut body = reader.sub_stream(size);
        let func = md.funcs.values().next().unwrap();
        let ty = md.types[func.type_idx].clone();
        let arena = Bump::new();
        let fb = analyze_function(&arena, &md, &ty, &mut body).unwrap();
        (fb.ops.iter().cloned().collect(), fb.max_ints, fb.max_floats)
    }

    #[test]
    fn rewrites_locals_and_appends_return() {
        let (ops, max_ints, _) = analyze(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        );
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].op, Opcode::LocalGetI32);
        assert!(matches!(ops[0].operand, Operand::Index(8)));
        assert_eq!(ops[1].op, Opcode::LocalGetI32);
        assert!(matches!(ops[1].operand, Operand::Index(16)));
        assert_eq!(ops[2].op, Opcode::I32Add);
        assert_eq!(ops[3].op, Opcode::ReturnI32);
        assert_eq!(max_ints, 2);
        assert!(ops.iter().all(|o| !o.spill_output));
    }

    #[test]
    fn deep_stacks_spill_the_oldest_producers() {
        let (ops, max_ints, _) = analyze(
            r#"(module (func (result i32)
                i32.const 1
                i32.const 2
                i32.const 3
                i32.const 4
                i32.const 5
                i32.add
                i32.add
                i32.add
                i32.add))"#,
        );
        assert_eq!(max_ints, 5);
        // Five consts: the two oldest fall outside the register window.
        assert!(ops[0].spill_output);
        assert!(ops[1].spill_output);
        assert!(!ops[2].spill_output);
        assert!(!ops[3].spill_output);
        assert!(!ops[4].spill_output);
    }

    #[test]
    fn calls_spill_everything_live() {
        let (ops, _, _) = analyze(
            r#"(module (func (result i32)
                i32.const 7
                call 0
                i32.add))"#,
        );
        // The constant is live across the call and must be spilled.
        assert_eq!(ops[0].op, Opcode::I32Const);
        assert!(ops[0].spill_output);
    }

    #[test]
    fn blocks_record_shape_and_refs() {
        let (ops, _, _) = analyze(
            r#"(module (func
                (block
                    (block
                        i32.const 1
                        br_if 1
                        br 0))))"#,
        );
        let Operand::Block(outer) = ops[0].operand else { panic!() };
        let Operand::Block(inner) = ops[1].operand else { panic!() };
        assert_eq!(outer.refs, 1);
        assert_eq!(inner.refs, 1);
        assert_eq!(outer.entry_ints, 0);
        assert!(outer.end > inner.end);
        assert_eq!(ops[inner.end as usize].op, Opcode::End);
    }

    #[test]
    fn select_and_drop_are_typed() {
        let (ops, _, _) = analyze(
            r#"(module (func
                f64.const 1
                f64.const 2
                i32.const 0
                select
                drop))"#,
        );
        assert_eq!(ops[3].op, Opcode::SelectF64);
        assert_eq!(ops[4].op, Opcode::DropFloat);
    }
}
